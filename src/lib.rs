mod parse;
pub use parse::Parse;

pub mod connection;
pub use connection::Connection;
pub use connection::ConnectionStream;

pub mod config;
pub use config::{ReplicaOf, ServerConfig};

pub(crate) mod db;
pub use db::Db;

pub mod error;
pub use error::Error;

pub mod frame;
pub use frame::Frame;

pub(crate) mod shutdown;
pub(crate) use shutdown::Shutdown;

pub mod clients;
pub use clients::Client;

pub mod cmd;
pub use cmd::{Context, Handler, Handlers, Reply};

pub mod replication;
pub use replication::Replication;

pub mod snapshot;

pub mod server;

pub const DEFAULT_PORT: u16 = 6379;
pub const DEFAULT_HOST: &str = "127.0.0.1";

pub type LResult<T> = std::result::Result<T, crate::error::Error>;
