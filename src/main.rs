use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use chainfile::client::Client;
use chainfile::peer::{PeerConfig, PeerNode, DEFAULT_MAX_CONNECTIONS};

#[derive(Parser)]
#[command(name = "chainfile", version = "1.0.0", about = "Files in a replicated block chain")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host a chain node and serve clients and peers
    Server {
        /// Hostname to bind
        host: String,
        /// Port to bind (0 lets the OS choose)
        port: u16,
        /// Host and port of a running peer to join the network through
        #[arg(long, num_args = 2, value_names = ["HOST", "PORT"])]
        join: Option<Vec<String>>,
        /// Max number of concurrent connections
        #[arg(short = 'c', long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
        connections: usize,
    },
    /// Connect to a node as a client
    Client {
        /// Hostname of the server
        host: String,
        /// Port of the server
        port: u16,
        #[command(subcommand)]
        action: ClientAction,
    },
}

#[derive(Subcommand)]
enum ClientAction {
    /// Send a file to the server and insert it into the chain
    Send {
        file_path: PathBuf,
    },
    /// Get a file from the chain and save it locally
    Get {
        /// Hex digest of the file to fetch
        file_hash: String,
        /// Path to save the file to (must not exist)
        file_path: PathBuf,
    },
    /// Check whether a file is completely in the chain
    Check {
        /// Path of the file to hash and check
        file_path: Option<PathBuf>,
        /// Check by hex digest instead of hashing a local file
        #[arg(long)]
        hash: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {

        // ── Server ───────────────────────────────────────────────────────────
        Commands::Server { host, port, join, connections } => {
            let join = match join {
                Some(parts) => {
                    let peer_port: u16 = parts[1].parse().context("invalid join port")?;
                    let addr = resolve(&parts[0], peer_port)?;
                    println!("Using peer on {addr} to sync and enter the network");
                    Some(addr)
                }
                None => None,
            };

            let config = PeerConfig {
                listen: resolve(&host, port)?,
                join,
                max_connections: connections,
            };
            let node = PeerNode::start(config).await.context("failed to start server")?;
            println!("Server started successfully on {}", node.local_addr());

            tokio::select! {
                result = node.run() => result.context("server terminated")?,
                _ = tokio::signal::ctrl_c() => info!("interrupted; shutting down"),
            }
        }

        // ── Client ───────────────────────────────────────────────────────────
        Commands::Client { host, port, action } => {
            let client = Client::new(resolve(&host, port)?);
            match action {
                ClientAction::Send { file_path } => {
                    let file_hash = client.send_file(&file_path).await?;
                    println!("sha256 hash: {file_hash}");
                    println!("File was successfully sent to the server.");
                }
                ClientAction::Get { file_hash, file_path } => {
                    let bytes = client.get_file(&file_hash, &file_path).await?;
                    println!("File successfully received ({bytes} B) → {}", file_path.display());
                }
                ClientAction::Check { file_path, hash } => {
                    let (file_hash, contains) = match (file_path, hash) {
                        (_, Some(hash)) => {
                            let contains = client.check_hash(&hash).await?;
                            (hash, contains)
                        }
                        (Some(path), None) => client.check_file(&path).await?,
                        (None, None) => bail!("provide a file path or --hash"),
                    };
                    println!("sha256 hash: {file_hash}");
                    println!("file in chain: {contains}");
                }
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn resolve(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve {host}:{port}"))?
        .next()
        .with_context(|| format!("no address found for {host}:{port}"))
}
