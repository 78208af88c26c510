//! # fq Server Binary
//!
//! Run with: `fq-server [config.yml]`

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use fq_core::config::{Config, DEFAULT_CONFIG_PATH};

#[derive(Parser)]
#[command(name = "fq-server")]
#[command(about = "fq - durable frequency-quota counter store")]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let cfg = Config::load(&cli.config)
        .with_context(|| format!("init config {:?}", cli.config))?;

    tracing_subscriber::fmt()
        .with_max_level(log_level(&cfg.logging.level))
        .init();

    info!(config = ?cli.config, version = fq_core::VERSION, "starting fq");

    fq_server::bootstrap::run(cfg)
        .await
        .context("run server")?;

    Ok(())
}

fn log_level(level: &str) -> tracing::Level {
    match level {
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}
