//! dokube - bootstrap a two-node CoreOS Kubernetes cluster on DigitalOcean

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dokube::bootstrap::Bootstrapper;
use dokube::config::Config;

/// dokube - deploy Kubernetes on DigitalOcean
#[derive(Parser, Debug)]
#[command(name = "dokube", version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Rebuild existing nodes in place (same id, fresh base image)
    #[arg(long)]
    force_rebuild: bool,
}

#[tokio::main]
async fn main() -> dokube::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    let mut bootstrapper = Bootstrapper::new(config, cli.force_rebuild)?;
    bootstrapper.run().await
}
