//! gamenight - Inspect and maintain the client cache

mod cli;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gamenight_core::cache::{SqliteStore, TieredCache};
use gamenight_core::clock::SystemClock;
use gamenight_core::config::CoreConfig;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "gamenight",
    version,
    about = "Inspect and maintain the gamenight client cache",
    long_about = "Operator tool for the durable tier of the gamenight client cache.\n\
                  \n\
                  Examples:\n\
                    gamenight stats                            # Entry counts and size\n\
                    gamenight list --prefix profile_stats_     # List cached aggregates\n\
                    gamenight get profile_stats_<user>         # Print one cached value\n\
                    gamenight invalidate --prefix event_       # Purge a namespace\n\
                    gamenight prune                            # Drop expired entries\n\
                  \n\
                  Environment Variables:\n\
                    GAMENIGHT_CONFIG                           # Config file (TOML)\n\
                    GAMENIGHT_CACHE_DB                         # Cache database path\n\
                    RUST_LOG                                   # Log filter (default: warn)"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file (default: <config dir>/gamenight/config.toml)
    #[arg(long, env = "GAMENIGHT_CONFIG")]
    config: Option<PathBuf>,

    /// Cache database (default: <cache dir>/gamenight/cache.db)
    #[arg(long, env = "GAMENIGHT_CACHE_DB")]
    cache_db: Option<PathBuf>,

    /// Disable ANSI colors
    #[arg(long, env = "GAMENIGHT_NO_COLOR")]
    no_color: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Summarize the durable tier
    Stats,
    /// List durable entries
    List {
        /// Only keys starting with this prefix
        #[arg(long, short = 'p', default_value = "")]
        prefix: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print one cached value
    Get {
        /// Cache key (without the durable prefix)
        key: String,
    },
    /// Remove a key, or every key under a prefix
    Invalidate {
        /// Cache key
        #[arg(required_unless_present = "prefix", conflicts_with = "prefix")]
        key: Option<String>,
        /// Key prefix
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Delete expired and unreadable entries
    Prune,
    /// Delete every entry
    Clear,
}

fn init_tracing() {
    // RUST_LOG overrides the default level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config_path = cli
        .config
        .or_else(|| dirs::config_dir().map(|d| d.join("gamenight").join("config.toml")))
        .context("Could not determine config directory")?;
    let config = CoreConfig::load(&config_path)
        .with_context(|| format!("Failed to load config: {}", config_path.display()))?;

    let db_path = cli
        .cache_db
        .or_else(|| dirs::cache_dir().map(|d| d.join("gamenight").join("cache.db")))
        .context("Could not determine cache directory")?;
    debug!(config = %config_path.display(), db = %db_path.display(), "Opening cache");
    let store = Arc::new(
        SqliteStore::open(&db_path)
            .with_context(|| format!("Failed to open cache database: {}", db_path.display()))?,
    );
    let cache = TieredCache::new(store.clone(), Arc::new(SystemClock), config.cache);

    match cli.command {
        Command::Stats => run_stats(&store, &cache, &db_path).await?,
        Command::List { prefix, json } => run_list(&cache, &prefix, json, cli.no_color).await,
        Command::Get { key } => run_get(&cache, &key).await?,
        Command::Invalidate { key, prefix } => run_invalidate(&cache, key, prefix).await?,
        Command::Prune => run_prune(&store, &cache).await?,
        Command::Clear => run_clear(&store).await?,
    }

    Ok(())
}

async fn run_stats(store: &SqliteStore, cache: &TieredCache, db_path: &std::path::Path) -> Result<()> {
    let stats = store.stats().await.context("Failed to read cache stats")?;
    let entries = cache.inspect_durable("").await;
    let counts = cli::count_statuses(&entries);

    println!("gamenight - Cache Statistics");
    println!("============================");
    println!();
    println!("Database:         {}", db_path.display());
    println!("Entries:          {}", stats.total_entries);
    println!("  Valid:          {}", counts.valid);
    println!("  Expired:        {}", counts.expired);
    println!("  Corrupt:        {}", counts.corrupt);
    println!("Payload size:     {}", cli::format_size(stats.total_size_bytes as u64));
    println!("Key prefix:       {}", cache.config().durable_prefix);

    if counts.expired + counts.corrupt > 0 {
        println!();
        println!("Run 'gamenight prune' to reclaim expired entries.");
    }
    Ok(())
}

async fn run_list(cache: &TieredCache, prefix: &str, json: bool, no_color: bool) {
    let entries = cache.inspect_durable(prefix).await;
    println!("{}", cli::format_entries(&entries, json, no_color));
}

async fn run_get(cache: &TieredCache, key: &str) -> Result<()> {
    let Some(value) = cache.get::<serde_json::Value>(key).await else {
        bail!("No valid cache entry for '{}'", key);
    };
    let pretty = serde_json::to_string_pretty(&value).context("Failed to render value")?;
    println!("{}", pretty);
    Ok(())
}

async fn run_invalidate(cache: &TieredCache, key: Option<String>, prefix: Option<String>) -> Result<()> {
    match (key, prefix) {
        (Some(key), _) => {
            cache.invalidate(&key).await;
            println!("Invalidated '{}'", key);
        }
        (None, Some(prefix)) => {
            let removed = cache.invalidate_by_prefix_everywhere(&prefix).await;
            println!("Invalidated {} entries under '{}'", removed, prefix);
        }
        (None, None) => bail!("Pass a key or --prefix"),
    }
    if cache.stats().persistence_failures > 0 {
        bail!("Some durable entries could not be removed (see log output)");
    }
    Ok(())
}

async fn run_prune(store: &SqliteStore, cache: &TieredCache) -> Result<()> {
    let pruned = cache.prune_durable().await;
    if pruned > 0 {
        store.vacuum().await.context("Failed to compact cache database")?;
    }
    println!("Pruned {} entries", pruned);
    Ok(())
}

async fn run_clear(store: &SqliteStore) -> Result<()> {
    let removed = store.clear().await.context("Failed to clear cache")?;
    store.vacuum().await.context("Failed to compact cache database")?;
    println!("Cleared {} entries", removed);
    Ok(())
}
