use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use backhaul::client::Client;
use backhaul::config::{ClientConfig, ServerConfig};
use backhaul::server::Server;

#[derive(Parser, Debug)]
#[command(
    name = "backhaul",
    version = env!("CARGO_PKG_VERSION"),
    about = "Reverse HTTP proxy over pooled WebSocket tunnels",
    long_about = "Backhaul exposes internal HTTP services to external clients without \
                  opening inbound ports: the internal peer dials outbound WebSocket \
                  tunnels to the public rendezvous, which forwards HTTP requests back \
                  through them"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "BACKHAUL_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the public rendezvous proxy
    Server {
        /// Configuration file path
        #[arg(short, long, env = "BACKHAUL_CONFIG", default_value = "backhaul_server.toml")]
        config: PathBuf,
    },

    /// Start the internal tunnel endpoint
    Client {
        /// Configuration file path
        #[arg(short, long, env = "BACKHAUL_CONFIG", default_value = "backhaul_client.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(cli.log_level.parse()?)
                .from_env_lossy(),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    match cli.command {
        Commands::Server { config } => {
            let config = ServerConfig::load(&config)?;
            let server = Server::new(config)?;
            let addr = server.bind().await?;

            info!("listening on http://{addr}");
            tokio::signal::ctrl_c().await?;

            info!("shutting down server...");
            server.shutdown();
        }

        Commands::Client { config } => {
            let config = ClientConfig::load(&config)?;
            let client = Client::start(config)?;

            tokio::signal::ctrl_c().await?;

            info!("shutting down tunnels...");
            client.shutdown();
        }
    }

    Ok(())
}
