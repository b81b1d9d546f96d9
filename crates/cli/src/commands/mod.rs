use anyhow::Result;
use clap::Subcommand;
use featcache_cache::CacheConfig;

pub mod simulate;

use self::simulate::SimulateArgs;

#[derive(Subcommand)]
pub enum Commands {
    /// Run a write pass and a read pass over synthetic features
    Simulate(SimulateArgs),
}

impl Commands {
    pub async fn execute(self, config: CacheConfig) -> Result<()> {
        match self {
            Commands::Simulate(args) => args.execute(config).await,
        }
    }
}
