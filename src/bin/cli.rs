use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use espelho::{Client, Error, Frame, DEFAULT_HOST, DEFAULT_PORT};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = EspelhoCli::parse();
    let addr = std::net::SocketAddr::new(cli.host, cli.port);
    let client = Client::connect(&addr).await?;

    match cli.command {
        Some(subcommand) => one_shot_command(client, subcommand).await?,
        None => interactive_mode(client, addr).await?,
    }

    Ok(())
}

/// Read commands from stdin, one per line, until EOF.
async fn interactive_mode(mut client: Client, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let args: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        if args.is_empty() {
            continue;
        }
        if matches!(args[0].to_lowercase().as_str(), "quit" | "exit") {
            break;
        }

        match client.send_command(args).await {
            Ok(frame) => print_frame(&frame),
            Err(Error::Response(msg)) => println!("(error) {msg}"),
            Err(e) => {
                println!("(error) {e}");
                // the server may have closed the connection
                client = Client::connect(&addr).await?;
            }
        }
    }

    Ok(())
}

fn print_frame(frame: &Frame) {
    match frame {
        Frame::Array(parts) => {
            for (i, part) in parts.iter().enumerate() {
                println!("{}) {part}", i + 1);
            }
        }
        Frame::Integer(val) => println!("(integer) {val}"),
        frame => println!("{frame}"),
    }
}

async fn one_shot_command(mut client: Client, subcommand: EspelhoSubcommand) -> anyhow::Result<()> {
    match subcommand {
        EspelhoSubcommand::Ping { msg } => {
            let response = client.ping(msg.map(|s| s.into())).await?;
            println!("{}", String::from_utf8_lossy(response.as_ref()));
        }
        EspelhoSubcommand::Get { key } => {
            let response = client.get(&key).await?;
            if let Some(value) = response {
                println!("{}", String::from_utf8_lossy(value.as_ref()));
            } else {
                println!("(nil)");
            }
        }
        EspelhoSubcommand::Set {
            key,
            value,
            expire_unit,
            expires,
        } => {
            let duration = to_duration(expire_unit, expires);
            if let Some(duration) = duration {
                client
                    .set_expires(&key, Bytes::from(value), duration)
                    .await?;
            } else {
                client.set(&key, Bytes::from(value)).await?;
            }
            println!("OK");
        }
        EspelhoSubcommand::Info { section } => {
            print!("{}", client.info(section).await?);
        }
    };

    Ok(())
}

#[derive(Debug, Parser)]
#[command(name = "espelho-cli", version, author)]
/// A simple espelho cli client, interactive when no subcommand is given
struct EspelhoCli {
    #[clap(subcommand)]
    command: Option<EspelhoSubcommand>,
    #[arg(long, default_value = DEFAULT_HOST)]
    host: std::net::IpAddr,
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

#[derive(Debug, Subcommand)]
/// Subcommand to execute in one-shot command mode.
enum EspelhoSubcommand {
    /// Ping the server.
    Ping {
        /// Message to ping
        msg: Option<String>,
    },
    /// Get the value of key.
    Get {
        /// Name of key to get.
        key: String,
    },
    /// Set key to hold the string value.
    Set {
        /// Name of the key to set.
        key: String,
        /// Value to set.
        value: String,
        /// Expiration unit, can be either `ex` or `px`.
        #[arg(value_enum, requires = "expires")]
        expire_unit: Option<ExpirationUnit>,
        /// Expire the value after the specified amount of time.
        #[arg(requires = "expire_unit")]
        expires: Option<u64>,
    },
    /// Show server information.
    Info {
        /// Section to show, replication by default.
        section: Option<String>,
    },
}

#[derive(Debug, Clone, ValueEnum)]
enum ExpirationUnit {
    EX,
    PX,
}

fn to_duration(unit: Option<ExpirationUnit>, expires: Option<u64>) -> Option<Duration> {
    match (unit, expires) {
        (Some(ExpirationUnit::EX), Some(expires)) => Some(Duration::from_secs(expires)),
        (Some(ExpirationUnit::PX), Some(expires)) => Some(Duration::from_millis(expires)),
        _ => None,
    }
}
