//! # Parley Server
//!
//! Real-time presence, chat and call signaling server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! parley
//!
//! # Run with custom config
//! parley --config /path/to/parley.toml
//!
//! # Run with environment variables
//! PARLEY_PORT=8080 PARLEY_HOST=0.0.0.0 parley
//! ```

use anyhow::Result;
use clap::Parser;
use parley_server::{config::Config, handlers, metrics};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Parley signaling server.
#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Real-time presence, chat and call signaling server")]
struct Cli {
    /// Configuration file, instead of the default search paths.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host to bind, overriding the configuration.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, overriding the configuration.
    #[arg(long)]
    port: Option<u16>,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    tracing::info!("Starting Parley server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
