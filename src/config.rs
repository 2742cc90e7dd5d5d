use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::exchanges::Market;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub evm: EvmConfig,
    pub account: AccountConfig,
    pub exchanges: ExchangeConfig,
    pub tracker: TrackerConfig,
    pub database: DatabaseConfig,
    pub publisher: PublisherConfig,
    pub logging: LoggingConfig,
}

/// EVM chain watcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvmConfig {
    pub enabled: bool,
    /// HTTP JSON-RPC endpoint for point lookups
    pub rpc_url: String,
    /// Websocket endpoint for subscriptions
    pub ws_url: String,
    /// Endpoint with deep log history, used to backfill gaps
    pub history_rpc_url: Option<String>,
    /// Wrapped native token contract whose transfers are tracked
    pub token_contract: String,
    /// Seconds a block must age before its logs are final
    pub transfer_delay_seconds: u64,
    /// Reconnect when the stream is silent for this long
    pub ws_event_timeout_seconds: u64,
    pub backfill_batch_size: u64,
    pub rpc_attempts: u32,
    pub rpc_retry_delay_seconds: u64,
    pub request_timeout_seconds: u64,
}

/// Account chain watcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    pub enabled: bool,
    pub rpc_url: String,
    pub rpc_key: Option<String>,
    /// REST indexer used for missing transactions and kill enrichment
    pub indexer_url: Option<String>,
    pub rpc_interval_seconds: u64,
    pub identities_cache_interval_seconds: u64,
    /// Identities fetched within this window are used without refetching
    pub identity_fresh_seconds: u64,
    pub block_retry_limit: u32,
    pub enrichment_attempts: u32,
    pub enrichment_delay_seconds: u64,
    pub request_timeout_seconds: u64,
}

/// Centralized exchange feeds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub markets: Vec<Market>,
}

/// Detector thresholds and windows
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub recent_transfers_period_seconds: u64,
    pub recent_transfers_threshold: Decimal,
    pub recent_dex_volume_threshold: Decimal,
    pub cex_volume_period_seconds: u64,
    pub cex_volume_threshold: Decimal,
    pub cex_check_cooldown_seconds: u64,
    pub killtx_stake_threshold: Decimal,
    pub killtx_age_threshold: u64,
    pub pool_identities_moved_threshold: usize,
    pub pool_identities_moved_period_seconds: u64,
    /// Delegate/undelegate actions allowed per identity inside the window
    pub pool_action_limit: usize,
    pub pool_action_window_seconds: u64,
    pub top_events_max_lines: usize,
    pub top_events_long_lines: usize,
    pub majority_volume_fraction: Decimal,
    pub stats_interval_seconds: u64,
}

/// Backing store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file path
    pub path: String,
    pub busy_timeout_ms: u64,
    pub known_addresses_path: String,
    /// Rows older than eight times this are pruned from the store
    pub cached_record_age_limit_seconds: u64,
}

/// Coalescing windows for emitted events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub event_replace_period_seconds: u64,
    pub pool_event_replace_period_seconds: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Pretty-print structured lines
    pub json_format: bool,
}

impl Default for EvmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rpc_url: "https://bsc-dataseed.binance.org/".to_string(),
            ws_url: "wss://bsc-ws-node.nariox.org:443".to_string(),
            history_rpc_url: None,
            token_contract: "0x0de08c1abe5fb86dd7fd2ac90400ace305138d5b".to_string(),
            transfer_delay_seconds: 5,
            ws_event_timeout_seconds: 60,
            backfill_batch_size: 10_000,
            rpc_attempts: 60,
            rpc_retry_delay_seconds: 2,
            request_timeout_seconds: 30,
        }
    }
}

impl EvmConfig {
    pub fn history_url(&self) -> &str {
        self.history_rpc_url.as_deref().unwrap_or(&self.rpc_url)
    }

    pub fn transfer_delay(&self) -> Duration {
        Duration::from_secs(self.transfer_delay_seconds)
    }
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rpc_url: "http://localhost:9009".to_string(),
            rpc_key: None,
            indexer_url: Some("https://api.idena.io/api".to_string()),
            rpc_interval_seconds: 2,
            identities_cache_interval_seconds: 300,
            identity_fresh_seconds: 3600,
            block_retry_limit: 5,
            enrichment_attempts: 20,
            enrichment_delay_seconds: 2,
            request_timeout_seconds: 10,
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 6,
            markets: Market::polled().to_vec(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            recent_transfers_period_seconds: 3600,
            recent_transfers_threshold: Decimal::from(1000),
            recent_dex_volume_threshold: Decimal::from(500),
            cex_volume_period_seconds: 600,
            cex_volume_threshold: Decimal::from(500),
            cex_check_cooldown_seconds: 60,
            killtx_stake_threshold: Decimal::from(500),
            killtx_age_threshold: 40,
            pool_identities_moved_threshold: 10,
            pool_identities_moved_period_seconds: 86_400,
            pool_action_limit: 3,
            pool_action_window_seconds: 2 * 86_400,
            top_events_max_lines: 10,
            top_events_long_lines: 100,
            majority_volume_fraction: Decimal::new(75, 2),
            stats_interval_seconds: 28_800,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "./tracker.db".to_string(),
            busy_timeout_ms: 5000,
            known_addresses_path: "known_addresses.json".to_string(),
            cached_record_age_limit_seconds: 86_400,
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            event_replace_period_seconds: 3600,
            pool_event_replace_period_seconds: 14_400,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

fn invalid(key: &str, value: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_env<T: FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(key, value))
}

type EnvOverride = fn(&mut AppConfig, String) -> Result<(), ConfigError>;

/// Environment variables that win over the file
const ENV_OVERRIDES: &[(&str, EnvOverride)] = &[
    ("BSC_RPC_URL", |c, v| {
        c.evm.rpc_url = v;
        Ok(())
    }),
    ("BSC_WS_URL", |c, v| {
        c.evm.ws_url = v;
        Ok(())
    }),
    ("BSC_HISTORY_RPC_URL", |c, v| {
        c.evm.history_rpc_url = Some(v);
        Ok(())
    }),
    ("BSC_TRANSFER_DELAY", |c, v| {
        c.evm.transfer_delay_seconds = parse_env("BSC_TRANSFER_DELAY", v)?;
        Ok(())
    }),
    ("IDENA_RPC_URL", |c, v| {
        c.account.rpc_url = v;
        Ok(())
    }),
    ("IDENA_RPC_KEY", |c, v| {
        c.account.rpc_key = Some(v);
        Ok(())
    }),
    ("IDENA_API_URL", |c, v| {
        c.account.indexer_url = Some(v);
        Ok(())
    }),
    ("DATABASE_PATH", |c, v| {
        c.database.path = v;
        Ok(())
    }),
    ("KNOWN_ADDRESSES_PATH", |c, v| {
        c.database.known_addresses_path = v;
        Ok(())
    }),
    ("TRANSFER_THRESHOLD", |c, v| {
        c.tracker.recent_transfers_threshold = parse_env("TRANSFER_THRESHOLD", v)?;
        Ok(())
    }),
    ("LOG_LEVEL", |c, v| {
        c.logging.level = v;
        Ok(())
    }),
];

const HTTP: &[&str] = &["http://", "https://"];
const WS: &[&str] = &["ws://", "wss://"];

fn check_url(url: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    match schemes.iter().any(|scheme| url.starts_with(scheme)) {
        true => Ok(()),
        false => Err(ConfigError::InvalidUrl(url.to_string())),
    }
}

fn check_nonzero(key: &str, value: u64) -> Result<(), ConfigError> {
    match value {
        0 => Err(invalid(key, 0)),
        _ => Ok(()),
    }
}

impl AppConfig {
    /// File named by `CONFIG_FILE` (default `config.toml`), then environment
    /// overrides, then validation
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file()?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults when the file does not exist; missing sections and keys keep
    /// their defaults too
    pub fn load_from_file() -> Result<Self, ConfigError> {
        let path = env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());
        match fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content).map_err(|e| ConfigError::Parsing(format!("{}: {}", path, e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(_) => Err(ConfigError::FileNotFound(path)),
        }
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, apply) in ENV_OVERRIDES {
            if let Ok(value) = env::var(key) {
                apply(self, value)?;
            }
        }
        Ok(())
    }

    /// Sources that are switched off are not checked
    pub fn validate(&self) -> Result<(), ConfigError> {
        let evm = &self.evm;
        if evm.enabled {
            check_url(&evm.rpc_url, HTTP)?;
            check_url(&evm.ws_url, WS)?;
            check_url(evm.history_url(), HTTP)?;
            let contract = &evm.token_contract;
            if contract.len() != 42 || !contract.starts_with("0x") || hex::decode(&contract[2..]).is_err() {
                return Err(invalid("evm.token_contract", contract));
            }
            check_nonzero("evm.backfill_batch_size", evm.backfill_batch_size)?;
            check_nonzero("evm.rpc_attempts", u64::from(evm.rpc_attempts))?;
        }

        let account = &self.account;
        if account.enabled {
            check_url(&account.rpc_url, HTTP)?;
            if let Some(url) = &account.indexer_url {
                check_url(url, HTTP)?;
            }
            check_nonzero("account.rpc_interval_seconds", account.rpc_interval_seconds)?;
            check_nonzero("account.identities_cache_interval_seconds", account.identities_cache_interval_seconds)?;
        }

        check_nonzero("exchanges.interval_seconds", self.exchanges.interval_seconds)?;
        if let Some(market) = self.exchanges.markets.iter().find(|m| !Market::polled().contains(m)) {
            return Err(invalid("exchanges.markets", market));
        }

        let tracker = &self.tracker;
        check_nonzero("tracker.recent_transfers_period_seconds", tracker.recent_transfers_period_seconds)?;
        check_nonzero("tracker.stats_interval_seconds", tracker.stats_interval_seconds)?;
        let fraction = tracker.majority_volume_fraction;
        if fraction <= Decimal::ZERO || fraction > Decimal::ONE {
            return Err(invalid("tracker.majority_volume_fraction", fraction));
        }

        if log::LevelFilter::from_str(&self.logging.level).is_err() {
            return Err(invalid("logging.level", &self.logging.level));
        }
        if self.database.path.trim().is_empty() {
            return Err(invalid("database.path", "\"\""));
        }
        Ok(())
    }

    /// Defaults rendered as TOML
    pub fn generate_sample_config() -> Result<String, ConfigError> {
        toml::to_string_pretty(&Self::default()).map_err(|e| ConfigError::Parsing(e.to_string()))
    }
}
