//! Xiaozhi Server entry point

use clap::Parser;
use std::path::PathBuf;
use tracing::warn;

use xiaozhi_server::Config;

#[derive(Parser)]
#[command(name = "xiaozhi-server", version, about = "Real-time voice assistant server")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml", env = "XIAOZHI_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging (INFO level by default, override with RUST_LOG)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let config = if args.config.exists() {
        Config::load(&args.config)?
    } else {
        warn!("config file {} not found, using defaults", args.config.display());
        Config::default()
    };

    xiaozhi_server::server::start(config).await
}
