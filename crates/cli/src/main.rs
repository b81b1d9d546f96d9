use anyhow::{Context, Result};
use clap::Parser;
use featcache_cache::CacheConfigLoader;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::Commands;

#[derive(Parser)]
#[command(name = "featcache")]
#[command(about = "Two-level feature cache for repeated training passes", long_about = None)]
#[command(version)]
struct Cli {
    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: Level,

    /// JSON configuration file (defaults to $FEATCACHE_CONFIG or the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_writer(std::io::stderr),
        )
        .with(tracing_subscriber::filter::LevelFilter::from_level(
            cli.log_level,
        ))
        .init();

    let config = match &cli.config {
        Some(path) => {
            let config = CacheConfigLoader::load_from_file(path)
                .with_context(|| format!("loading {}", path.display()))?;
            CacheConfigLoader::apply_env(config)?
        }
        None => CacheConfigLoader::load()?,
    };

    cli.command.execute(config).await
}
