//! Server configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, DEFAULT_HOST, DEFAULT_PORT};

/// Address of the master a replica synchronizes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaOf {
    pub host: String,
    pub port: u16,
}

impl ReplicaOf {
    pub fn new(host: impl ToString, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }
}

impl FromStr for ReplicaOf {
    type Err = Error;

    /// Accepts `"<host> <port>"` as in the `replicaof` directive, or `"<host>:<port>"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_matches('"');
        let (host, port) = s
            .split_once(' ')
            .or_else(|| s.rsplit_once(':'))
            .ok_or_else(|| Error::Protocol(format!("invalid replicaof address `{s}`")))?;
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|e| Error::Protocol(format!("invalid replicaof port `{port}`: {e}")))?;
        Ok(Self::new(host.trim(), port))
    }
}

impl fmt::Display for ReplicaOf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Deadline for each read on a client connection, `None` waits forever.
    pub read_timeout: Option<Duration>,
    /// Deadline for writing a reply on a client connection.
    pub write_timeout: Option<Duration>,
    /// Deadline for dialing the master.
    pub connect_timeout: Duration,
    /// Start as a replica of this master.
    pub replica_of: Option<ReplicaOf>,
    /// Close the client connection after replying to an unknown command.
    pub close_on_unknown_command: bool,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            read_timeout: Some(Duration::from_secs(2)),
            write_timeout: Some(Duration::from_secs(2)),
            connect_timeout: Duration::from_secs(10),
            replica_of: None,
            close_on_unknown_command: true,
            max_connections: 250,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
