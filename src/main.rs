use chain_activity_tracker::config::AppConfig;
use chain_activity_tracker::database::{BackingStore, Database};
use chain_activity_tracker::events::EventSink;
use chain_activity_tracker::logging::{init_logging, ErrorLogger, LogContext};
use chain_activity_tracker::models::{KnownAddresses, PriceBook};
use chain_activity_tracker::tracker::{generate_pool_stats, generate_stats, generate_top, TopKind, Tracker};
use chain_activity_tracker::{AccountWatcher, EvmWatcher, ExchangeFeed, ShutdownSignal};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const CHAIN_CHANNEL_SIZE: usize = 1024;
const TRADE_CHANNEL_SIZE: usize = 256;
const EVENT_CHANNEL_SIZE: usize = 256;
const FEED_TIMEOUT: Duration = Duration::from_secs(10);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Parser)]
#[command(name = "tracker")]
#[command(about = "Watches BSC and Idena activity plus exchange trades and reports notable events")]
#[command(version)]
struct Cli {
    /// Database path, overrides the configuration
    #[arg(long)]
    database: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the watchers, exchange feeds and tracker until interrupted
    Run,
    /// Print activity statistics for a period
    Stats {
        /// Seconds
        #[arg(long, default_value_t = 86_400)]
        period: u64,
    },
    /// Print the largest items of a period
    Top {
        #[arg(value_enum)]
        kind: TopKind,
        #[arg(long, default_value_t = 86_400)]
        period: u64,
        /// Use the long line limit
        #[arg(long)]
        long: bool,
    },
    /// Print kills and delegation changes per pool
    PoolStats {
        #[arg(long, default_value_t = 86_400)]
        period: u64,
        #[arg(long)]
        long: bool,
    },
    /// Print a sample configuration file
    SampleConfig,
}

fn open_database(config: &AppConfig) -> Result<Arc<Database>, Box<dyn std::error::Error>> {
    let busy_timeout = Duration::from_millis(config.database.busy_timeout_ms);
    let database = Database::with_busy_timeout(&config.database.path, busy_timeout)
        .map_err(|e| format!("Failed to open database at '{}': {}", config.database.path, e))?;
    Ok(Arc::new(database))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Some(Commands::SampleConfig) = cli.command {
        println!("{}", AppConfig::generate_sample_config()?);
        return Ok(());
    }

    let mut config = AppConfig::load()?;
    if let Some(path) = cli.database {
        config.database.path = path;
    }
    init_logging(&config.logging);

    let database = open_database(&config)?;
    let registry = Arc::new(KnownAddresses::load(&config.database.known_addresses_path)?);
    let prices = PriceBook::default();
    let now = Utc::now();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config, database, registry, prices).await?,
        Commands::Stats { period } => print_json(&generate_stats(database.as_ref(), &registry, &prices, period, now)?)?,
        Commands::Top { kind, period, long } => {
            match generate_top(database.as_ref(), &registry, &config.tracker, kind, period, long, now)? {
                Some(event) => print_json(&event)?,
                None => println!("Nothing to show"),
            }
        }
        Commands::PoolStats { period, long } => {
            match generate_pool_stats(database.as_ref(), &config.tracker, period, long, now)? {
                Some(stats) => print_json(&stats)?,
                None => println!("Nothing to show"),
            }
        }
        Commands::SampleConfig => {}
    }

    Ok(())
}

async fn run(
    config: AppConfig,
    database: Arc<Database>,
    registry: Arc<KnownAddresses>,
    prices: PriceBook,
) -> Result<(), Box<dyn std::error::Error>> {
    let context = LogContext::new("main", "run");
    context.info("Starting chain activity tracker");

    let store: Arc<dyn BackingStore> = database.clone();
    let shutdown = ShutdownSignal::new();
    let (chain_tx, chain_rx) = mpsc::channel(CHAIN_CHANNEL_SIZE);
    let (trade_tx, trade_rx) = mpsc::channel(TRADE_CHANNEL_SIZE);
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

    if config.evm.enabled {
        let watcher = EvmWatcher::new(config.evm.clone(), store.clone(), registry.clone(), prices.clone(), shutdown.clone())?;
        let tx = chain_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = watcher.run(tx).await {
                ErrorLogger::log_error(&e, Some(LogContext::new("main", "evm_watcher")));
            }
        });
    }

    if config.account.enabled {
        let watcher =
            AccountWatcher::new(config.account.clone(), store.clone(), registry.clone(), prices.clone(), shutdown.clone())?;
        let tx = chain_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = watcher.run(tx).await {
                ErrorLogger::log_error(&e, Some(LogContext::new("main", "account_watcher")));
            }
        });
    }
    drop(chain_tx);

    if config.exchanges.enabled {
        let interval = Duration::from_secs(config.exchanges.interval_seconds);
        for market in &config.exchanges.markets {
            let feed = ExchangeFeed::new(*market, interval, prices.clone(), FEED_TIMEOUT)?;
            tokio::spawn(feed.run(trade_tx.clone(), shutdown.clone()));
        }
    }
    drop(trade_tx);

    let sink = EventSink::new(&config.publisher, store.clone(), registry.clone(), prices.clone());
    let sink = tokio::spawn(sink.run(event_rx));

    let cleanup_db = database.clone();
    let cleanup_shutdown = shutdown.clone();
    let record_age = Duration::from_secs(config.database.cached_record_age_limit_seconds * 8);
    tokio::spawn(async move {
        while cleanup_shutdown.sleep(CLEANUP_INTERVAL).await {
            if let Err(e) = cleanup_db.clean_old_records(record_age) {
                ErrorLogger::log_error(&e.into(), Some(LogContext::new("main", "cleanup")));
            }
        }
    });

    let tracker = Tracker::new(config.tracker.clone(), store, registry, prices, shutdown.clone());
    let tracker = tokio::spawn(tracker.run(chain_rx, trade_rx, event_tx));

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            LogContext::new("main", "signal").info("Interrupted, shutting down");
        }
        signal_shutdown.trigger();
    });

    match tracker.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => ErrorLogger::log_error(&e, Some(context.clone())),
        Err(e) => context.error(&format!("Tracker task failed: {}", e)),
    }
    shutdown.trigger();
    let _ = sink.await;

    context.info("Stopped");
    Ok(())
}
