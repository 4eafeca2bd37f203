//! Server: accepts client connections and dispatches their commands.
//!
//! Call [`run`] with a bound `TcpListener`. When configured as a replica the
//! handshake with the master completes before the first client is accepted.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, Semaphore};
use tokio::time;
use tracing::{debug, error, info, instrument, warn};

use crate::cmd::command_name;
use crate::db::DbDropGuard;
use crate::{
    replication, Connection, Context, Error, Frame, Handlers, LResult, Parse, Replication,
    Reply, ServerConfig, Shutdown,
};

/// Run the server with the built-in commands until `shutdown` completes.
pub async fn run(
    listener: TcpListener,
    config: ServerConfig,
    shutdown: impl Future,
) -> LResult<()> {
    run_with_handlers(listener, config, Handlers::builtin(), shutdown).await
}

/// Run the server with a custom command registry.
///
/// Returns an error if the replica handshake fails. Once `shutdown`
/// completes, every connection is told to stop and this function waits for
/// them to finish.
pub async fn run_with_handlers(
    listener: TcpListener,
    config: ServerConfig,
    handlers: Handlers,
    shutdown: impl Future,
) -> LResult<()> {
    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);

    let db_holder = DbDropGuard::new();
    let replication = match &config.replica_of {
        Some(master) => Replication::new_replica(master.clone()),
        None => Replication::new_master(),
    };
    let ctx = Context::new(db_holder.db(), replication);

    let link = match &config.replica_of {
        Some(master) => {
            let port = listener.local_addr()?.port();
            info!(%master, port, "starting as replica");
            let handle = replication::start(
                master,
                port,
                &config,
                ctx.clone(),
                handlers.clone(),
                Shutdown::new(notify_shutdown.subscribe()),
            )
            .await?;
            Some(handle)
        }
        None => None,
    };

    let mut server = Listener {
        listener,
        limit_connections: Arc::new(Semaphore::new(config.max_connections)),
        config: Arc::new(config),
        ctx,
        handlers,
        notify_shutdown,
        shutdown_complete_tx,
    };

    tokio::select! {
        res = server.run() => {
            if let Err(err) = res {
                error!(cause = %err, "failed to accept");
            }
        }
        _ = shutdown => {
            info!("shutting down");
        }
    }

    let Listener {
        shutdown_complete_tx,
        notify_shutdown,
        ..
    } = server;

    // Dropping the sender notifies every subscriber, then wait for the
    // connection tasks to drop their completion senders and for the
    // replication link to stop.
    drop(notify_shutdown);
    drop(shutdown_complete_tx);
    let _ = shutdown_complete_rx.recv().await;
    if let Some(link) = link {
        if let Err(e) = link.await {
            error!(cause = %e, "replication link task failed");
        }
    }

    Ok(())
}

#[derive(Debug)]
struct Listener {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    ctx: Context,
    handlers: Handlers,
    /// Caps the number of open client connections.
    limit_connections: Arc<Semaphore>,
    notify_shutdown: broadcast::Sender<()>,
    /// Held by every connection task. Once all are dropped the receiver
    /// observes the channel closing.
    shutdown_complete_tx: mpsc::Sender<()>,
}

impl Listener {
    async fn run(&mut self) -> LResult<()> {
        info!(addr = ?self.listener.local_addr().ok(), "accepting inbound connections");

        loop {
            let permit = self
                .limit_connections
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Protocol(e.to_string()))?;

            let (socket, peer) = self.accept().await?;
            let connection = Connection::new(socket)
                .with_timeouts(self.config.read_timeout, self.config.write_timeout);

            let mut dispatcher = Dispatcher {
                ctx: self.ctx.clone(),
                handlers: self.handlers.clone(),
                config: self.config.clone(),
                connection,
                peer,
                shutdown: Shutdown::new(self.notify_shutdown.subscribe()),
                _shutdown_complete: self.shutdown_complete_tx.clone(),
            };

            tokio::spawn(async move {
                if let Err(err) = dispatcher.run().await {
                    debug!(%peer, cause = %err, "connection error");
                }
                drop(permit);
            });
        }
    }

    /// Accept a connection, backing off exponentially on errors. After the
    /// sixth failed attempt in a row the error is returned.
    async fn accept(&mut self) -> LResult<(TcpStream, SocketAddr)> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok(accepted) => return Ok(accepted),
                Err(err) => {
                    if backoff > 64 {
                        return Err(err.into());
                    }
                    warn!(cause = %err, backoff, "accept failed, retrying");
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

/// Serves one client connection.
#[derive(Debug)]
struct Dispatcher {
    ctx: Context,
    handlers: Handlers,
    config: Arc<ServerConfig>,
    connection: Connection<TcpStream>,
    peer: SocketAddr,
    shutdown: Shutdown,
    _shutdown_complete: mpsc::Sender<()>,
}

impl Dispatcher {
    /// Process frames one at a time until the peer disconnects, the
    /// connection fails or the server shuts down.
    #[instrument(skip(self), fields(peer = %self.peer))]
    async fn run(&mut self) -> LResult<()> {
        while !self.shutdown.is_shutdown() {
            let maybe_frame = tokio::select! {
                res = self.connection.read_frame() => res,
                _ = self.shutdown.recv() => return Ok(()),
            };

            let frame = match maybe_frame {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("peer closed the connection");
                    return Ok(());
                }
                Err(e) if e.is_framing() => {
                    // the stream can no longer be trusted
                    let reply = Frame::SimpleError(format!("ERR {e}"));
                    self.connection.write_frame(&reply).await?;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            debug!(request = %frame);

            let name = match command_name(&frame) {
                Ok(name) => name,
                Err(e) => {
                    self.write_error(&e, "").await?;
                    continue;
                }
            };

            let Some(handler) = self.handlers.get(&name) else {
                let err = Error::UnknownCommand(name);
                warn!(cause = %err, "rejecting request");
                self.write_error(&err, "").await?;
                if self.config.close_on_unknown_command {
                    return Ok(());
                }
                continue;
            };

            let propagate =
                (handler.is_write() && self.ctx.replication.is_master()).then(|| frame.to_bytes());
            let args = Parse::arguments(frame)?;

            // applying and propagating a write is one step in the write order
            let order = match propagate {
                Some(_) => Some(self.ctx.replication.order_writes().await),
                None => None,
            };
            let result = tokio::select! {
                res = handler.call(self.ctx.clone(), args) => res,
                _ = self.shutdown.recv() => return Ok(()),
            };
            if let (Ok(_), Some(command)) = (&result, propagate) {
                let links = self.ctx.replication.propagate(command);
                debug!(command = %name, links, "propagated write");
            }
            drop(order);

            match result {
                Ok(reply) => {
                    match reply {
                        Reply::Frame(frame) | Reply::Ack(frame) => {
                            debug!(response = %frame);
                            self.connection.write_frame(&frame).await?;
                        }
                        Reply::Silent => {}
                        Reply::FullResync {
                            header,
                            snapshot,
                            feed,
                        } => {
                            self.connection.write_frame(&header).await?;
                            self.connection.write_snapshot(&snapshot).await?;
                            return self.serve_replica(feed).await;
                        }
                    }
                }
                Err(e) => {
                    debug!(command = %name, cause = %e, "command failed");
                    self.write_error(&e, &name).await?;
                }
            }
        }

        Ok(())
    }

    async fn write_error(&mut self, err: &Error, command: &str) -> LResult<()> {
        let text = match err {
            Error::Response(text) => text.clone(),
            Error::EndOfStream => {
                format!("ERR wrong number of arguments for '{command}' command")
            }
            other => format!("ERR {other}"),
        };
        self.connection.write_frame(&Frame::SimpleError(text)).await?;
        Ok(())
    }

    /// Stream propagated writes to a replica after a full resync.
    ///
    /// Frames sent by the replica, such as `REPLCONF ACK`, are applied
    /// without a reply.
    async fn serve_replica(&mut self, mut feed: broadcast::Receiver<Bytes>) -> LResult<()> {
        let replicas = self.ctx.replication.replica_connected();
        info!(replicas, "replica link established");
        // replicas only speak when asked to
        self.connection.set_read_timeout(None);

        let result = loop {
            tokio::select! {
                command = feed.recv() => match command {
                    Ok(command) => {
                        if let Err(e) = self.connection.write_raw(&command).await {
                            break Err(e);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "replica fell behind, closing the link");
                        break Ok(());
                    }
                    Err(RecvError::Closed) => break Ok(()),
                },
                frame = self.connection.read_frame() => match frame {
                    Ok(Some(frame)) => self.replica_request(frame).await,
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                },
                _ = self.shutdown.recv() => break Ok(()),
            }
        };

        let replicas = self.ctx.replication.replica_disconnected();
        info!(replicas, "replica link closed");
        result
    }

    async fn replica_request(&self, frame: Frame) {
        debug!(request = %frame, "frame from replica");
        let result = match self.handlers.resolve(frame) {
            Ok((_, handler, args)) => handler.call(self.ctx.clone(), args).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(cause = %e, "ignoring bad frame from replica");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::{Command, GetCmd, PsyncCmd, SetCmd};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    async fn start(config: ServerConfig) -> (SocketAddr, oneshot::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            run(listener, config, async move {
                let _ = rx.await;
            })
            .await
            .unwrap();
        });
        (addr, tx)
    }

    async fn read_exactly(stream: &mut TcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (addr, _shutdown) = start(ServerConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        stream.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        assert_eq!(read_exactly(&mut stream, 7).await, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn test_unknown_command_closes_connection() {
        let (addr, _shutdown) = start(ServerConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        stream.write_all(b"*1\r\n$4\r\nNOPE\r\n").await.unwrap();
        let mut response = vec![];
        stream.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"-ERR unknown command `nope`\r\n");
    }

    #[tokio::test]
    async fn test_unknown_command_policy_can_keep_connection() {
        let config = ServerConfig {
            close_on_unknown_command: false,
            ..Default::default()
        };
        let (addr, _shutdown) = start(config).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        stream
            .write_all(b"*1\r\n$4\r\nNOPE\r\n*2\r\n$4\r\nECHO\r\n$2\r\nhi\r\n")
            .await
            .unwrap();
        let expected = b"-ERR unknown command `nope`\r\n$2\r\nhi\r\n";
        assert_eq!(read_exactly(&mut stream, expected.len()).await, expected);
    }

    #[tokio::test]
    async fn test_errors_are_replied() {
        let (addr, _shutdown) = start(ServerConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        stream
            .write_all(b"*1\r\n$3\r\nGET\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n")
            .await
            .unwrap();
        let expected = b"-ERR wrong number of arguments for 'get' command\r\n$-1\r\n";
        assert_eq!(read_exactly(&mut stream, expected.len()).await, expected);
    }

    #[tokio::test]
    async fn test_framing_error_replies_then_closes() {
        let (addr, _shutdown) = start(ServerConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        stream.write_all(b"?garbage\r\n").await.unwrap();
        let mut response = vec![];
        stream.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"-ERR protocol error"));
    }

    #[tokio::test]
    async fn test_psync_turns_connection_into_replica_link() {
        let (addr, _shutdown) = start(ServerConfig::default()).await;
        let mut replica = Connection::new(TcpStream::connect(addr).await.unwrap());
        let mut client = Connection::new(TcpStream::connect(addr).await.unwrap());

        let psync = Frame::decode(b"*3\r\n$5\r\nPSYNC\r\n$1\r\n?\r\n$2\r\n-1\r\n")
            .unwrap()
            .0;
        replica.write_frame(&psync).await.unwrap();
        let Some(Frame::SimpleString(header)) = replica.read_frame().await.unwrap() else {
            panic!("expected FULLRESYNC");
        };
        assert!(header.starts_with("FULLRESYNC "));
        assert!(header.ends_with(" 0"));
        let snapshot = replica.read_snapshot().await.unwrap();
        assert!(crate::snapshot::parse(&snapshot).unwrap().entries.is_empty());

        let set = Frame::decode(b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\n123\r\n")
            .unwrap()
            .0;
        client.write_frame(&set).await.unwrap();
        assert_eq!(
            client.read_frame().await.unwrap(),
            Some(Frame::SimpleString("OK".into()))
        );

        let (propagated, len) = replica.read_frame_with_len().await.unwrap().unwrap();
        assert_eq!(propagated, set);
        assert_eq!(len, 31);

        let info = Frame::decode(b"*2\r\n$4\r\nINFO\r\n$11\r\nreplication\r\n")
            .unwrap()
            .0;
        client.write_frame(&info).await.unwrap();
        let Some(Frame::BulkString(body)) = client.read_frame().await.unwrap() else {
            panic!("expected INFO body");
        };
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("connected_slaves:1\r\n"));
        assert!(body.contains("master_repl_offset:31\r\n"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_replica_link_sees_writes_in_applied_order() {
        const WRITERS: usize = 8;
        const WRITES: usize = 50;

        let (addr, _shutdown) = start(ServerConfig::default()).await;
        let mut replica = Connection::new(TcpStream::connect(addr).await.unwrap());
        replica
            .write_frame(&PsyncCmd::full().into_frame().unwrap())
            .await
            .unwrap();
        replica.read_frame().await.unwrap().unwrap();
        replica.read_snapshot().await.unwrap();

        let writers: Vec<_> = (0..WRITERS)
            .map(|w| {
                tokio::spawn(async move {
                    let mut conn = Connection::new(TcpStream::connect(addr).await.unwrap());
                    for i in 0..WRITES {
                        let set = SetCmd::new("hot", Bytes::from(format!("{w}-{i}")), None);
                        conn.write_frame(&set.into_frame().unwrap()).await.unwrap();
                        assert_eq!(
                            conn.read_frame().await.unwrap(),
                            Some(Frame::SimpleString("OK".into()))
                        );
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let mut last = None;
        let mut propagated = 0;
        for _ in 0..WRITERS * WRITES {
            let (frame, len) = replica.read_frame_with_len().await.unwrap().unwrap();
            propagated += len as u64;
            let Frame::Array(parts) = frame else {
                panic!("expected a command array");
            };
            last = parts.last().cloned();
        }

        let mut client = Connection::new(TcpStream::connect(addr).await.unwrap());
        client
            .write_frame(&GetCmd::new("hot").into_frame().unwrap())
            .await
            .unwrap();
        assert_eq!(client.read_frame().await.unwrap(), last);

        let info = Frame::decode(b"*1\r\n$4\r\nINFO\r\n").unwrap().0;
        client.write_frame(&info).await.unwrap();
        let Some(Frame::BulkString(body)) = client.read_frame().await.unwrap() else {
            panic!("expected INFO body");
        };
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains(&format!("master_repl_offset:{propagated}\r\n")));
    }
}
