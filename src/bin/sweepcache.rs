//! sweepcache – inspect and administer a backtest result cache

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use sweepcache::backtest::cache::{CacheStore, StatsAggregator, Tier};
use sweepcache::backtest::{fingerprint, Fingerprint, ParameterSet};
use sweepcache::config::Config;
use sweepcache::dashboard::FilterQueryEngine;
use sweepcache::persistence::SqliteResultStore;
use sweepcache::utils::init_logging;

#[derive(Debug, Parser)]
#[command(name = "sweepcache", author, version, about = "Backtest result cache and query tool", long_about = None)]
struct Args {
    /// Path to the configuration file (TOML)
    #[arg(short, long, env = "SWEEPCACHE_CONFIG", default_value = "sweepcache.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit
    #[arg(long)]
    print_default_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print cache statistics as JSON
    Stats,
    /// Print dashboard filter options as JSON
    Filters,
    /// Copy a temporary entry into the permanent tier
    Promote { fingerprint: Fingerprint },
    /// Delete one entry from one tier
    Remove {
        fingerprint: Fingerprint,
        #[arg(long, default_value = "temporary")]
        tier: Tier,
    },
    /// Apply the configured eviction policy to the temporary tier
    Evict {
        /// Remove every temporary entry instead
        #[arg(long)]
        all: bool,
    },
    /// Print the fingerprint of a parameter set
    Fingerprint {
        /// Parameter set as a JSON object, e.g. '{"asset":"ETH",...}'
        #[arg(long)]
        json: String,
    },
    /// Generate shell completions
    Completions { shell: Shell },
}

/// Load `path` if it exists, else defaults plus environment overrides.
fn load_config(path: &Path) -> Result<(Config, bool)> {
    if path.exists() {
        let config = Config::from_file(path).context("Failed to load configuration")?;
        return Ok((config, true));
    }
    let mut config = Config::default();
    config.merge_env();
    config.validate()?;
    Ok((config, false))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_default_config {
        print!("{}", Config::default_toml()?);
        return Ok(());
    }

    let (config, from_file) = load_config(&args.config)?;
    init_logging(&config.logging.level);
    if !from_file {
        log::debug!("Configuration file {} not found – using defaults", args.config.display());
    }

    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(());
    };

    match command {
        | Command::Stats => {
            let aggregator = StatsAggregator::new(&config.cache.root_dir)
                .with_assumed_response_time(config.cache.assumed_response_time_ms);
            let snapshot = tokio::task::spawn_blocking(move || aggregator.snapshot()).await?;
            print_json(&snapshot)?;
        }
        | Command::Filters => {
            let store = SqliteResultStore::open(Some(config.results.db_path.clone())).await?;
            let mut engine = FilterQueryEngine::new(Arc::new(store));
            if let Some(ttl) = config.filters.ttl() {
                engine = engine.with_ttl(ttl);
            }
            print_json(&engine.filter_options().await)?;
        }
        | Command::Promote { fingerprint } => {
            let store = CacheStore::open(&config.cache.root_dir, config.cache.options())?;
            let entry = store.promote(&fingerprint)?;
            println!("Promoted {} ({} bytes)", entry.fingerprint, entry.size_bytes);
        }
        | Command::Remove { fingerprint, tier } => {
            let store = CacheStore::open(&config.cache.root_dir, config.cache.options())?;
            if store.remove(&fingerprint, tier)? {
                println!("Removed {} from {} tier", fingerprint, tier);
            } else {
                println!("{} not present in {} tier", fingerprint, tier);
            }
        }
        | Command::Evict { all } => {
            let store = CacheStore::open(&config.cache.root_dir, config.cache.options())?;
            let removed = if all {
                store.clear_temporary()?
            } else {
                store.evict_temporary(&config.cache.eviction_policy())?
            };
            println!("Evicted {} temporary entries; cache now {} bytes", removed, store.size_bytes());
        }
        | Command::Fingerprint { json } => {
            let raw: ParameterSet = serde_json::from_str(&json).context("Parameter set is not valid JSON")?;
            println!("{}", fingerprint(&raw)?);
        }
        | Command::Completions { shell } => {
            clap_complete::generate(shell, &mut Args::command(), "sweepcache", &mut io::stdout());
        }
    }
    Ok(())
}
