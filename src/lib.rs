pub mod blockchain;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod exchanges;
pub mod logging;
pub mod models;
pub mod retry;
pub mod shutdown;
pub mod tracker;

pub use blockchain::{AccountWatcher, ChainMessage, EvmWatcher, RpcClient};
pub use config::{
    AccountConfig, AppConfig, DatabaseConfig, EvmConfig, ExchangeConfig, LoggingConfig, PublisherConfig, TrackerConfig,
};
pub use database::{BackingStore, Database};
pub use error::{IndexerError, Result};
pub use events::{Coalesced, Coalescer, Event, MergeContext};
pub use exchanges::{ExchangeFeed, Market};
pub use logging::{init_logging, ErrorLogger, LogContext, MetricsLogger, PerformanceMonitor};
pub use models::{KnownAddresses, PriceBook, Tag, Trade, Transfer};
pub use retry::{RetryConfig, RetryManager};
pub use shutdown::ShutdownSignal;
pub use tracker::Tracker;
