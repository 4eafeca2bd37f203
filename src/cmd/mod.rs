use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::{parse::Parse, Db, Error, Frame, LResult, Replication};

pub mod echo;
pub use echo::EchoCmd;

pub mod get;
pub use get::GetCmd;

pub mod info;
pub use info::InfoCmd;

pub mod ping;
pub use ping::PingCmd;

pub mod psync;
pub use psync::PsyncCmd;

pub mod replconf;
pub use replconf::ReplConfCmd;

pub mod set;
pub use set::SetCmd;

/// State a command runs against.
///
/// Both members are handles to shared state, so cloning is cheap.
#[derive(Debug, Clone)]
pub struct Context {
    pub db: Db,
    pub replication: Replication,
}

impl Context {
    pub fn new(db: Db, replication: Replication) -> Self {
        Self { db, replication }
    }
}

/// What a handler asks the connection loop to do.
#[derive(Debug)]
pub enum Reply {
    /// Write the frame back to the requester.
    Frame(Frame),
    /// Written even on a replication link, where ordinary replies are dropped.
    Ack(Frame),
    /// Nothing is written.
    Silent,
    /// Answer a `PSYNC`: write `header`, then the snapshot transfer, then turn
    /// the connection into a replica link fed by `feed`.
    FullResync {
        header: Frame,
        snapshot: Bytes,
        feed: broadcast::Receiver<Bytes>,
    },
}

impl From<Frame> for Reply {
    fn from(frame: Frame) -> Self {
        Reply::Frame(frame)
    }
}

pub trait Command: Sized + Send + 'static {
    /// Lowercase name the command is registered under.
    const NAME: &'static str;

    /// Write commands are propagated to replicas.
    const IS_WRITE: bool = false;

    fn parse_frames(parse: &mut Parse) -> LResult<Self>;

    fn apply(self, ctx: &Context) -> impl Future<Output = LResult<Reply>> + Send;

    fn into_frame(self) -> LResult<Frame>;
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = LResult<Reply>> + Send>>;

/// Type-erased command handler stored in [`Handlers`].
///
/// The returned future is the whole request: dropping it cancels the request.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, ctx: Context, args: Parse) -> HandlerFuture;

    fn is_write(&self) -> bool {
        false
    }
}

/// Adapts a [`Command`] into a [`Handler`].
pub struct CommandHandler<C>(PhantomData<fn() -> C>);

impl<C> Default for CommandHandler<C> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<C: Command> Handler for CommandHandler<C> {
    fn call(&self, ctx: Context, mut args: Parse) -> HandlerFuture {
        Box::pin(async move {
            let cmd = C::parse_frames(&mut args)?;
            args.finish()?;
            cmd.apply(&ctx).await
        })
    }

    fn is_write(&self) -> bool {
        C::IS_WRITE
    }
}

/// Name to handler mapping used by client connections and the replica applier.
///
/// Names are case-insensitive.
#[derive(Clone, Default)]
pub struct Handlers {
    map: HashMap<String, Arc<dyn Handler>>,
}

impl Handlers {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in command.
    pub fn builtin() -> Self {
        let mut handlers = Self::new();
        handlers
            .register_command::<PingCmd>()
            .register_command::<EchoCmd>()
            .register_command::<GetCmd>()
            .register_command::<SetCmd>()
            .register_command::<InfoCmd>()
            .register_command::<ReplConfCmd>()
            .register_command::<PsyncCmd>();
        handlers
    }

    /// Register `handler` under `name`, replacing any previous handler.
    pub fn register(&mut self, name: &str, handler: impl Handler) -> &mut Self {
        self.map.insert(name.to_lowercase(), Arc::new(handler));
        self
    }

    pub fn register_command<C: Command>(&mut self) -> &mut Self {
        self.register(C::NAME, CommandHandler::<C>::default())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.map.get(&name.to_lowercase()).cloned()
    }

    /// Split a request frame into its handler and remaining arguments.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn resolve(&self, frame: Frame) -> LResult<(String, Arc<dyn Handler>, Parse)> {
        let name = command_name(&frame)?;
        let handler = self
            .get(&name)
            .ok_or_else(|| Error::UnknownCommand(name.clone()))?;
        let args = Parse::arguments(frame)?;
        Ok((name, handler, args))
    }
}

/// Lowercased name of the command a request frame invokes. The name may be a
/// simple or bulk string.
pub fn command_name(frame: &Frame) -> LResult<String> {
    match frame {
        Frame::Array(parts) => match parts.first() {
            Some(Frame::SimpleString(name)) => Ok(name.to_lowercase()),
            Some(Frame::BulkString(name)) => {
                Ok(String::from_utf8(name.to_vec())?.to_lowercase())
            }
            Some(other) => Err(Error::Protocol(format!(
                "expected a command name, got {other:?}"
            ))),
            None => Err(Error::Protocol("empty command".to_string())),
        },
        frame => Err(Error::Protocol(format!(
            "expected a command array, got {frame:?}"
        ))),
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.map.keys().collect();
        names.sort();
        f.debug_struct("Handlers").field("names", &names).finish()
    }
}
