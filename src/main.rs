use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use karasu::config::Config;
use karasu::fetch::Fetcher;
use karasu::server::{self, AppState};
use karasu::watermark::Watermark;

/// Karasu - signed on-the-fly image transformation proxy
#[derive(Parser, Debug)]
#[command(name = "karasu")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path of the file with hex-encoded keys, one per line
    #[arg(short, long, default_value = "")]
    keypath: String,

    /// Path of the file with hex-encoded salts, one per line
    #[arg(short, long, default_value = "")]
    saltpath: String,

    /// Path of the file with presets
    #[arg(short, long, default_value = "")]
    presets: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe the health endpoint of the configured bind address
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    karasu::logging::init_subscriber()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    let config = Config::from_env(&args.keypath, &args.saltpath, &args.presets)?;

    if let Some(Command::Health) = args.command {
        return health_probe(&config).await;
    }

    let fetcher = Fetcher::new(&config).await?;
    let watermark = Watermark::load(&config, &fetcher).await?;

    if config.keys.is_empty() {
        tracing::warn!("running in insecure mode, all signatures are accepted");
    }
    if watermark.is_some() {
        tracing::info!("watermark loaded");
    }

    let state = Arc::new(AppState::new(config, fetcher, watermark));
    server::serve(state).await
}

/// Mirrors the health endpoint's status as the exit code.
async fn health_probe(config: &Config) -> Result<()> {
    let addr = config.bind_addr().replace("0.0.0.0", "127.0.0.1");
    let url = format!("http://{}/health", addr);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let response = client.get(&url).send().await?;

    if response.status().is_success() {
        println!("OK");
        Ok(())
    } else {
        bail!("health check failed with status {}", response.status());
    }
}
