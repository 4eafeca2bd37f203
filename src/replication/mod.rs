//! Master/replica replication state and the replica side of the link.
//!
//! A replica connects to its master with [`handshake::Handshake`], loads the
//! snapshot it receives, and then runs two tasks: the
//! [`propagation`] loop reading the master's command stream and the
//! [`applier`] draining the records it produces.

pub mod applier;
pub mod handshake;
pub mod propagation;

use std::fmt::{self, Write};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use rand::{distributions::Alphanumeric, Rng};
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::{
    ConnectionStream, Context, Handlers, LResult, ReplicaOf, ServerConfig, Shutdown,
};
use handshake::{Handshake, Synced};

const REPLID_LEN: usize = 40;
const BACKLOG_SIZE: u64 = 1024 * 1024;
/// Propagated writes a replica link may fall behind before it is dropped.
const FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => f.write_str("master"),
            Role::Slave => f.write_str("slave"),
        }
    }
}

/// Fields reported by `INFO replication`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationInfo {
    pub role: Role,
    pub master: Option<ReplicaOf>,
    pub connected_slaves: usize,
    pub master_replid: String,
    /// Bytes of command stream generated (master) or processed (replica).
    pub master_repl_offset: u64,
    pub second_repl_offset: i64,
    pub repl_backlog_active: bool,
    pub repl_backlog_size: u64,
    pub repl_backlog_first_byte_offset: u64,
    pub repl_backlog_histlen: u64,
}

impl ReplicationInfo {
    fn new(role: Role, master: Option<ReplicaOf>) -> Self {
        Self {
            role,
            master,
            connected_slaves: 0,
            master_replid: random_replid(),
            master_repl_offset: 0,
            second_repl_offset: -1,
            repl_backlog_active: false,
            repl_backlog_size: BACKLOG_SIZE,
            repl_backlog_first_byte_offset: 0,
            repl_backlog_histlen: 0,
        }
    }

    /// Render as the `# Replication` section of `INFO`.
    pub fn render(&self) -> String {
        let mut out = String::from("# Replication\r\n");
        // writing to a String cannot fail
        let _ = write!(out, "role:{}\r\n", self.role);
        if let Some(master) = &self.master {
            let _ = write!(
                out,
                "master_host:{}\r\nmaster_port:{}\r\n",
                master.host, master.port
            );
        }
        let _ = write!(
            out,
            "connected_slaves:{}\r\n\
             master_replid:{}\r\n\
             master_repl_offset:{}\r\n\
             second_repl_offset:{}\r\n\
             repl_backlog_active:{}\r\n\
             repl_backlog_size:{}\r\n\
             repl_backlog_first_byte_offset:{}\r\n\
             repl_backlog_histlen:{}\r\n",
            self.connected_slaves,
            self.master_replid,
            self.master_repl_offset,
            self.second_repl_offset,
            u8::from(self.repl_backlog_active),
            self.repl_backlog_size,
            self.repl_backlog_first_byte_offset,
            self.repl_backlog_histlen,
        );
        out
    }
}

#[derive(Debug)]
struct Shared {
    info: RwLock<ReplicationInfo>,
    /// Encoded write commands for every connected replica link.
    feed: broadcast::Sender<Bytes>,
    /// Held while a write is applied and propagated, and while a full resync
    /// takes its snapshot.
    write_order: Arc<Mutex<()>>,
}

/// Handle to the replication state of this server.
///
/// Cloning is shallow. The state is only changed through the methods below,
/// each of which takes the write lock once.
#[derive(Debug, Clone)]
pub struct Replication {
    shared: Arc<Shared>,
}

impl Replication {
    pub fn new_master() -> Self {
        Self::with_info(ReplicationInfo::new(Role::Master, None))
    }

    pub fn new_replica(master: ReplicaOf) -> Self {
        Self::with_info(ReplicationInfo::new(Role::Slave, Some(master)))
    }

    fn with_info(info: ReplicationInfo) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                info: RwLock::new(info),
                feed,
                write_order: Arc::new(Mutex::new(())),
            }),
        }
    }

    /// Snapshot of the current state.
    pub fn info(&self) -> ReplicationInfo {
        self.shared.info.read().unwrap().clone()
    }

    pub fn role(&self) -> Role {
        self.shared.info.read().unwrap().role
    }

    pub fn is_master(&self) -> bool {
        self.role() == Role::Master
    }

    pub fn replid(&self) -> String {
        self.shared.info.read().unwrap().master_replid.clone()
    }

    pub fn offset(&self) -> u64 {
        self.shared.info.read().unwrap().master_repl_offset
    }

    /// Add `n` bytes to the replication offset, returning the new offset.
    pub fn advance_offset(&self, n: usize) -> u64 {
        let mut info = self.shared.info.write().unwrap();
        info.master_repl_offset += n as u64;
        if info.repl_backlog_active {
            info.repl_backlog_histlen =
                (info.repl_backlog_histlen + n as u64).min(BACKLOG_SIZE);
        }
        info.master_repl_offset
    }

    /// Returns the number of connected replicas.
    pub fn replica_connected(&self) -> usize {
        let mut info = self.shared.info.write().unwrap();
        info.connected_slaves += 1;
        if !info.repl_backlog_active {
            info.repl_backlog_active = true;
            info.repl_backlog_first_byte_offset = info.master_repl_offset + 1;
        }
        info.connected_slaves
    }

    pub fn replica_disconnected(&self) -> usize {
        let mut info = self.shared.info.write().unwrap();
        info.connected_slaves = info.connected_slaves.saturating_sub(1);
        info.connected_slaves
    }

    /// Adopt the replication id and offset announced by our master.
    pub fn record_master(&self, replid: String, offset: u64) {
        let mut info = self.shared.info.write().unwrap();
        info.master_replid = replid;
        info.master_repl_offset = offset;
    }

    /// Wait for exclusive use of the write order.
    ///
    /// While the guard lives no other write can be applied or propagated, so
    /// replicas see writes in the order the master applied them and a
    /// snapshot never races a write.
    pub async fn order_writes(&self) -> OwnedMutexGuard<()> {
        self.shared.write_order.clone().lock_owned().await
    }

    /// Receive every write propagated after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.shared.feed.subscribe()
    }

    /// Send an encoded write command to every replica link and account for it
    /// in the offset. Returns the number of links it was queued on.
    pub fn propagate(&self, command: Bytes) -> usize {
        self.advance_offset(command.len());
        self.shared.feed.send(command).unwrap_or(0)
    }
}

/// Connect to `master`, run the handshake and start following its command
/// stream.
///
/// Any failure before the snapshot is loaded is returned. The link itself
/// runs in the background and is never re-established.
pub(crate) async fn start(
    master: &ReplicaOf,
    listening_port: u16,
    config: &ServerConfig,
    ctx: Context,
    handlers: Handlers,
    shutdown: Shutdown,
) -> LResult<JoinHandle<()>> {
    let synced = Handshake::connect(
        master,
        listening_port,
        config.connect_timeout,
        config.read_timeout,
        config.write_timeout,
    )
    .await?
    .run()
    .await?;
    Ok(follow(synced, ctx, handlers, shutdown))
}

/// Load the snapshot of a completed handshake, then spawn the propagation
/// loop and the applier on its connection.
///
/// The returned handle completes once both have stopped.
pub(crate) fn follow<S: ConnectionStream>(
    synced: Synced<S>,
    ctx: Context,
    handlers: Handlers,
    mut shutdown: Shutdown,
) -> JoinHandle<()> {
    let Synced {
        mut conn,
        snapshot,
        master,
        span,
    } = synced;

    let loaded = ctx.db.load(snapshot.entries);
    if let Some((replid, offset)) = master {
        ctx.replication.record_master(replid, offset);
    }
    info!(parent: &span, loaded, "snapshot loaded");

    // the master may stay silent for any amount of time
    conn.set_read_timeout(None);
    let (reader, writer) = conn.into_split();
    let responder = Arc::new(Mutex::new(writer));
    let (tx, rx) = propagation::channel();

    let applier = tokio::spawn(applier::run(rx, ctx, handlers));
    tokio::spawn(async move {
        tokio::select! {
            res = propagation::run(reader, responder, tx, span.clone()) => {
                if let Err(e) = res {
                    error!(parent: &span, error = %e, "replication link failed");
                }
            }
            _ = shutdown.recv() => {
                debug!(parent: &span, "replication link stopped by shutdown");
            }
        }
        // the sender is gone, the applier stops once the queue is drained
        if let Err(e) = applier.await {
            error!(parent: &span, error = %e, "replica applier panicked");
        }
    })
}

fn random_replid() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(REPLID_LEN)
        .map(char::from)
        .collect()
}
