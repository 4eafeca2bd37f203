use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use espelho::{server, ReplicaOf, ServerConfig, DEFAULT_HOST, DEFAULT_PORT};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = EspelhoServer::parse();
    let config = cli.into_config();

    let listener = TcpListener::bind(config.address())
        .await
        .with_context(|| format!("failed to bind {}", config.address()))?;
    info!(addr = %listener.local_addr()?, "listening");

    server::run(listener, config, tokio::signal::ctrl_c()).await?;
    Ok(())
}

#[derive(Debug, Parser)]
#[command(name = "espelho-server", version, author)]
/// A Redis compatible key-value server with master/replica replication
struct EspelhoServer {
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Start as a replica of `"<host> <port>"`.
    #[arg(long)]
    replicaof: Option<ReplicaOf>,
    /// Per read deadline on client connections, 0 disables it.
    #[arg(long, default_value_t = 2000)]
    read_timeout_ms: u64,
    /// Per reply deadline on client connections, 0 disables it.
    #[arg(long, default_value_t = 2000)]
    write_timeout_ms: u64,
    /// Keep the connection open after an unknown command.
    #[arg(long)]
    keep_open_on_unknown_command: bool,
}

impl EspelhoServer {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            host: self.host,
            port: self.port,
            read_timeout: millis(self.read_timeout_ms),
            write_timeout: millis(self.write_timeout_ms),
            replica_of: self.replicaof,
            close_on_unknown_command: !self.keep_open_on_unknown_command,
            ..Default::default()
        }
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
