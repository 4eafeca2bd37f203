//! Replica side of the replication handshake.
//!
//! The steps run strictly in order against one master connection and none is
//! retried: `PING`, `REPLCONF listening-port`, `REPLCONF capa psync2`,
//! `PSYNC ? -1`, then the snapshot transfer.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::cmd::psync::parse_full_resync;
use crate::cmd::{Command, PingCmd, PsyncCmd, ReplConfCmd};
use crate::snapshot::{self, Snapshot};
use crate::{Connection, ConnectionStream, Error, Frame, LResult, ReplicaOf};

/// Handshake in progress with a master.
#[derive(Debug)]
pub struct Handshake<S> {
    conn: Connection<S>,
    listening_port: u16,
    span: Span,
}

/// A completed handshake, ready to follow the master's command stream.
#[derive(Debug)]
pub struct Synced<S> {
    pub conn: Connection<S>,
    pub snapshot: Snapshot,
    /// Replication id and offset from a `FULLRESYNC` reply.
    pub master: Option<(String, u64)>,
    pub span: Span,
}

impl Handshake<TcpStream> {
    /// Dial `master` within `timeout`.
    pub async fn connect(
        master: &ReplicaOf,
        listening_port: u16,
        timeout: Duration,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> LResult<Self> {
        let span = info_span!("replica", master = %master, port = listening_port);
        let socket = tokio::time::timeout(
            timeout,
            TcpStream::connect((master.host.as_str(), master.port)),
        )
        .instrument(span.clone())
        .await
        .map_err(|_| Error::Timeout("connect"))??;

        span.in_scope(|| {
            info!(peer = ?socket.peer_addr().ok(), "connected to master");
        });
        let conn = Connection::new(socket).with_timeouts(read_timeout, write_timeout);
        Ok(Self::new(conn, listening_port, span))
    }
}

impl<S: ConnectionStream> Handshake<S> {
    pub fn new(conn: Connection<S>, listening_port: u16, span: Span) -> Self {
        Self {
            conn,
            listening_port,
            span,
        }
    }

    /// Run every step, stopping at the first failure.
    pub async fn run(mut self) -> LResult<Synced<S>> {
        let span = self.span.clone();
        async move {
            debug!("stage 1: PING");
            self.ping().await?;
            debug!("stage 2: REPLCONF listening-port");
            self.announce_port().await?;
            debug!("stage 3: REPLCONF capa");
            self.announce_capabilities().await?;
            debug!("stage 4: PSYNC");
            let master = self.psync().await?;
            debug!("stage 5: snapshot");
            let snapshot = self.receive_snapshot().await?;
            info!(keys = snapshot.entries.len(), "handshake complete");

            Ok(Synced {
                conn: self.conn,
                snapshot,
                master,
                span: self.span,
            })
        }
        .instrument(span)
        .await
    }

    pub async fn ping(&mut self) -> LResult<()> {
        self.request(PingCmd::default().into_frame()?, "PONG").await
    }

    pub async fn announce_port(&mut self) -> LResult<()> {
        let frame = ReplConfCmd::listening_port(self.listening_port).into_frame()?;
        self.request(frame, "OK").await
    }

    pub async fn announce_capabilities(&mut self) -> LResult<()> {
        self.request(ReplConfCmd::capa_psync2().into_frame()?, "OK")
            .await
    }

    /// Request a full resync. The reply is only required to be a simple
    /// string; a `FULLRESYNC <replid> <offset>` reply is parsed.
    pub async fn psync(&mut self) -> LResult<Option<(String, u64)>> {
        self.conn
            .write_frame(&PsyncCmd::full().into_frame()?)
            .await?;
        let reply = self.read_simple().await?;
        info!(%reply, "got PSYNC response");

        let master = parse_full_resync(&reply);
        if master.is_none() {
            warn!(%reply, "PSYNC reply is not FULLRESYNC <replid> <offset>");
        }
        Ok(master)
    }

    pub async fn receive_snapshot(&mut self) -> LResult<Snapshot> {
        let payload = self.conn.read_snapshot().await?;
        debug!(len = payload.len(), "received snapshot");
        snapshot::parse(&payload)
    }

    async fn request(&mut self, frame: Frame, expected: &str) -> LResult<()> {
        self.conn.write_frame(&frame).await?;
        let reply = self.read_simple().await?;
        if reply != expected {
            return Err(Error::Handshake(format!(
                "expected {expected}, got {reply:?}"
            )));
        }
        Ok(())
    }

    async fn read_simple(&mut self) -> LResult<String> {
        match self.conn.read_frame().await? {
            Some(Frame::SimpleString(reply)) => Ok(reply),
            Some(frame) => Err(Error::Handshake(format!(
                "expected a simple string, got {frame:?}"
            ))),
            None => Err(Error::Handshake(
                "master closed the connection".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPLID: &str = "8371b4fb1155b71f4a04d3e1bc3e18c4a990aeeb";

    fn handshake(mock: tokio_test::io::Mock) -> Handshake<tokio_test::io::Mock> {
        Handshake::new(Connection::new(mock), 6380, Span::none())
    }

    #[tokio::test]
    async fn test_handshake_sends_steps_in_order() {
        let mut empty = b"$0\r\n".to_vec();
        empty.extend_from_slice(b"*1\r\n$4\r\nPING\r\n");
        let mock = tokio_test::io::Builder::new()
            .write(b"*1\r\n$4\r\nPING\r\n")
            .read(b"+PONG\r\n")
            .write(b"*3\r\n$8\r\nREPLCONF\r\n$14\r\nlistening-port\r\n$4\r\n6380\r\n")
            .read(b"+OK\r\n")
            .write(b"*3\r\n$8\r\nREPLCONF\r\n$4\r\ncapa\r\n$6\r\npsync2\r\n")
            .read(b"+OK\r\n")
            .write(b"*3\r\n$5\r\nPSYNC\r\n$1\r\n?\r\n$2\r\n-1\r\n")
            .read(format!("+FULLRESYNC {REPLID} 0\r\n").as_bytes())
            .read(&empty)
            .build();

        let mut synced = handshake(mock).run().await.unwrap();
        assert!(synced.snapshot.entries.is_empty());
        assert_eq!(synced.master, Some((REPLID.to_string(), 0)));

        // bytes after the snapshot belong to the command stream
        let (frame, len) = synced.conn.read_frame_with_len().await.unwrap().unwrap();
        assert_eq!(frame, PingCmd::default().into_frame().unwrap());
        assert_eq!(len, 14);
    }

    #[tokio::test]
    async fn test_snapshot_with_keys() {
        let payload = snapshot::dump(&[snapshot::Entry {
            key: "foo".into(),
            value: bytes::Bytes::from("bar"),
            expires_at_ms: None,
        }]);
        let mut transfer = format!("${}\r\n", payload.len()).into_bytes();
        transfer.extend_from_slice(&payload);

        let mock = tokio_test::io::Builder::new()
            .write(b"*3\r\n$5\r\nPSYNC\r\n$1\r\n?\r\n$2\r\n-1\r\n")
            .read(b"+CONTINUE\r\n")
            .read(&transfer)
            .build();
        let mut handshake = handshake(mock);
        assert_eq!(handshake.psync().await.unwrap(), None);
        let snapshot = handshake.receive_snapshot().await.unwrap();
        assert_eq!(snapshot.entries[0].key, "foo");
    }

    #[tokio::test]
    async fn test_wrong_pong_aborts() {
        let mock = tokio_test::io::Builder::new()
            .write(b"*1\r\n$4\r\nPING\r\n")
            .read(b"+WRONG\r\n")
            .build();
        let err = handshake(mock).run().await.unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
    }

    #[tokio::test]
    async fn test_error_reply_aborts() {
        let mock = tokio_test::io::Builder::new()
            .write(b"*1\r\n$4\r\nPING\r\n")
            .read(b"+PONG\r\n")
            .write(b"*3\r\n$8\r\nREPLCONF\r\n$14\r\nlistening-port\r\n$4\r\n6380\r\n")
            .read(b"-ERR nope\r\n")
            .build();
        let err = handshake(mock).run().await.unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
    }

    #[tokio::test]
    async fn test_master_closes_during_handshake() {
        let mock = tokio_test::io::Builder::new()
            .write(b"*1\r\n$4\r\nPING\r\n")
            .build();
        assert!(handshake(mock).run().await.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let master = ReplicaOf::new("127.0.0.1", port);
        let result =
            Handshake::connect(&master, 6380, Duration::from_secs(1), None, None).await;
        assert!(result.is_err());
    }
}
