use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use sluice::config;
use sluice::server;

#[derive(Parser, Debug)]
#[command(name = "sluice", about = "Height-aware Web3 JSON-RPC caching proxy")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().compact())
            .init();
    }

    info!("sluice v{}", env!("CARGO_PKG_VERSION"));

    let config = config::Config::load(&cli.config)?;
    info!(
        hosts = config.routing.default_backends.len(),
        height_based = config.routing.height_based,
        sharded = config.routing.sharded,
        cache = config.cache.enabled,
        "configuration loaded"
    );

    for (host, url) in &config.routing.default_backends {
        info!(
            host = %host,
            default = %url,
            pruning = config.routing.pruning_backends.get(host).map(String::as_str).unwrap_or("-"),
            shards = config.routing.shards.get(host).map_or(0, Vec::len),
            "host configured"
        );
    }

    server::run(config).await
}
