use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::task::JoinSet;
use tracing::error;

mod config;
mod proxy;
mod tunnel;

use tunnel::{Proto, TunnelSpec};

#[derive(Parser)]
#[command(name = "portgate")]
#[command(version = "0.1.0")]
#[command(about = "Expose local services through a Portgate relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Relay server URL
    #[arg(short, long, default_value = "http://localhost:8080")]
    relay: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Expose a local HTTP service
    Http {
        /// Local port to expose
        port: u16,

        /// Custom subdomain
        #[arg(short, long)]
        subdomain: Option<String>,
    },
    /// Expose a local TCP service
    Tcp {
        /// Local port to expose
        port: u16,
    },
    /// Run every tunnel from a config file
    Start {
        /// Config file path (searched for when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    match cli.command {
        Commands::Http { port, subdomain } => {
            let spec = TunnelSpec {
                name: format!("http-{}", port),
                proto: Proto::Http,
                local_host: "127.0.0.1".to_string(),
                local_port: port,
                subdomain,
            };
            tunnel::run(cli.relay, spec).await?;
        }
        Commands::Tcp { port } => {
            let spec = TunnelSpec {
                name: format!("tcp-{}", port),
                proto: Proto::Tcp,
                local_host: "127.0.0.1".to_string(),
                local_port: port,
                subdomain: None,
            };
            tunnel::run(cli.relay, spec).await?;
        }
        Commands::Start { config } => {
            let config = match config {
                Some(path) => config::PortgateConfig::load(&path)?,
                None => {
                    let path = config::find_config()
                        .context("no portgate.yml found; pass --config or create one")?;
                    config::PortgateConfig::load(&path)?
                }
            };
            config.validate()?;

            let mut tasks = JoinSet::new();
            for entry in config.tunnels {
                let relay = config.relay.clone();
                let name = entry.name.clone();
                let spec = TunnelSpec::from(entry);
                tasks.spawn(async move {
                    if let Err(err) = tunnel::run(relay, spec).await {
                        error!(tunnel = %name, error = %err, "tunnel exited");
                    }
                });
            }
            while tasks.join_next().await.is_some() {}
        }
    }

    Ok(())
}
