use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

use crate::{
    cmd::{Command, GetCmd, InfoCmd, PingCmd, SetCmd},
    Connection, Error, Frame, LResult,
};

/// Established connection with an espelho (or any RESP speaking) server.
///
/// Backed by a single `TcpStream`, `Client` provides basic network client
/// functionality (no pooling, retrying, ...).
/// Requests are issued using the various methods of `Client`.
#[derive(Debug)]
pub struct Client {
    connection: Connection<TcpStream>,
}

impl Client {
    /// Establish a connection with the server located at `addr`.
    ///
    /// `addr` may be any type that can be asynchronously converted to a
    /// `SocketAddr`. This includes `SocketAddr` and strings.
    pub async fn connect(addr: impl ToSocketAddrs) -> LResult<Self> {
        let socket = TcpStream::connect(addr).await?;
        let connection = Connection::new(socket);
        Ok(Client { connection })
    }

    /// Ping the server.
    ///
    /// Returns PONG if no argument is provided, otherwise
    /// return a copy of the argument as a bulk.
    #[tracing::instrument(skip(self))]
    pub async fn ping(&mut self, msg: Option<Bytes>) -> LResult<Bytes> {
        let frame = PingCmd::new(msg).into_frame()?;
        debug!(request = %frame);
        self.connection.write_frame(&frame).await?;
        match self.read_response().await? {
            Frame::SimpleString(val) => Ok(val.into()),
            Frame::BulkString(val) => Ok(val),
            frame => Err(Error::Response(format!("unexpected frame: {frame}"))),
        }
    }

    /// Get the value of key.
    ///
    /// If the key does not exist `None` is returned.
    #[tracing::instrument(skip(self))]
    pub async fn get(&mut self, key: &str) -> LResult<Option<Bytes>> {
        let frame = GetCmd::new(key).into_frame()?;
        debug!(request = %frame);
        self.connection.write_frame(&frame).await?;
        match self.read_response().await? {
            Frame::SimpleString(val) => Ok(Some(val.into())),
            Frame::BulkString(val) => Ok(Some(val)),
            Frame::NullBulkString => Ok(None),
            frame => Err(Error::Response(format!("unexpected frame: {frame}"))),
        }
    }

    /// Set `key` to hold the given `value`.
    ///
    /// If key already holds a value, it is overwritten. Any previous time to
    /// live associated with the key is discarded.
    pub async fn set(&mut self, key: &str, val: Bytes) -> LResult<()> {
        self.set_cmd(SetCmd::new(key, val, None)).await
    }

    /// Set `key` to hold the given `value`. The value expires after `expire`.
    pub async fn set_expires(&mut self, key: &str, val: Bytes, expire: Duration) -> LResult<()> {
        self.set_cmd(SetCmd::new(key, val, Some(expire))).await
    }

    async fn set_cmd(&mut self, cmd: SetCmd) -> LResult<()> {
        let frame = cmd.into_frame()?;
        debug!(request = %frame);
        self.connection.write_frame(&frame).await?;
        match self.read_response().await? {
            Frame::SimpleString(val) if val == "OK" => Ok(()),
            frame => Err(Error::Response(format!("unexpected frame: {frame}"))),
        }
    }

    /// Fetch the `INFO` text for `section`, the replication section when `None`.
    #[tracing::instrument(skip(self))]
    pub async fn info(&mut self, section: Option<String>) -> LResult<String> {
        let frame = InfoCmd::new(section).into_frame()?;
        debug!(request = %frame);
        self.connection.write_frame(&frame).await?;
        match self.read_response().await? {
            Frame::BulkString(body) => Ok(String::from_utf8(body.to_vec())?),
            frame => Err(Error::Response(format!("unexpected frame: {frame}"))),
        }
    }

    /// Send an arbitrary command as an array of bulk strings and return the
    /// raw reply. Error replies come back as `Error::Response`.
    #[tracing::instrument(skip(self))]
    pub async fn send_command(&mut self, args: Vec<String>) -> LResult<Frame> {
        if args.is_empty() {
            return Err(Error::Protocol("empty command".to_string()));
        }
        let frame = Frame::Array(
            args.into_iter()
                .map(|arg| Frame::BulkString(Bytes::from(arg)))
                .collect(),
        );
        debug!(request = %frame);
        self.connection.write_frame(&frame).await?;
        self.read_response().await
    }

    async fn read_response(&mut self) -> LResult<Frame> {
        let response = self.connection.read_frame().await?;
        debug!(?response);
        match response {
            Some(Frame::SimpleError(msg)) => Err(Error::Response(msg)),
            Some(frame) => Ok(frame),
            // the server closed the connection without replying
            None => Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by server",
            )
            .into()),
        }
    }
}
