//! Structured log lines.
//!
//! Every line produced through [`LogContext`] is a single JSON object with the
//! component, the operation and whatever chain, block, transaction or amount
//! fields the caller attached, so the stream can be filtered per watcher.

use log::Level;
use serde_json::{json, Map, Value};
use std::fmt::Display;
use std::time::Instant;

use crate::config::LoggingConfig;
use crate::error::{Impact, IndexerError};

#[derive(Clone)]
pub struct LogContext {
    pub component: String,
    pub operation: String,
    pub metadata: Map<String, Value>,
}

impl LogContext {
    pub fn new(component: &str, operation: &str) -> Self {
        Self {
            component: component.to_string(),
            operation: operation.to_string(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn with_chain(self, chain: impl Display) -> Self {
        self.with_metadata("chain", json!(chain.to_string()))
    }

    pub fn with_block_number(self, height: u64) -> Self {
        self.with_metadata("block", json!(height))
    }

    pub fn with_transaction_hash(self, hash: &str) -> Self {
        self.with_metadata("tx", json!(hash))
    }

    pub fn with_address(self, address: &str) -> Self {
        self.with_metadata("address", json!(address))
    }

    /// Amounts are kept as strings so decimals survive the JSON round trip
    pub fn with_amount(self, amount: impl Display) -> Self {
        self.with_metadata("amount", json!(amount.to_string()))
    }

    pub fn with_duration_ms(self, ms: u64) -> Self {
        self.with_metadata("duration_ms", json!(ms))
    }

    pub fn with_retry_count(self, attempt: u32) -> Self {
        self.with_metadata("attempt", json!(attempt))
    }

    fn line(&self, level: Level, message: &str) -> String {
        let mut line = Map::with_capacity(self.metadata.len() + 5);
        line.insert("ts".to_string(), json!(chrono::Utc::now().timestamp_millis()));
        line.insert("level".to_string(), json!(level.as_str()));
        line.insert("component".to_string(), json!(self.component));
        line.insert("operation".to_string(), json!(self.operation));
        line.insert("msg".to_string(), json!(message));
        for (key, value) in &self.metadata {
            line.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Value::Object(line).to_string()
    }

    pub fn log(&self, level: Level, message: &str) {
        if log::log_enabled!(target: "chain_activity_tracker", level) {
            log::log!(target: "chain_activity_tracker", level, "{}", self.line(level, message));
        }
    }

    pub fn info(&self, message: &str) {
        self.log(Level::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(Level::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.log(Level::Error, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(Level::Debug, message);
    }

    pub fn trace(&self, message: &str) {
        self.log(Level::Trace, message);
    }
}

/// Wall time of one block, poll or detector pass
pub struct PerformanceMonitor {
    started: Instant,
    context: LogContext,
}

impl PerformanceMonitor {
    pub fn new(operation: &str) -> Self {
        Self {
            started: Instant::now(),
            context: LogContext::new("timing", operation),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.context = self.context.with_metadata(key, value);
        self
    }

    pub fn with_block_number(mut self, height: u64) -> Self {
        self.context = self.context.with_block_number(height);
        self
    }

    fn stop(self) -> (u64, LogContext) {
        let ms = self.started.elapsed().as_millis() as u64;
        (ms, self.context.with_duration_ms(ms))
    }

    /// Logs at debug level and returns the elapsed milliseconds
    pub fn finish(self) -> u64 {
        let (ms, context) = self.stop();
        context.debug(&format!("took {}ms", ms));
        ms
    }

    /// Like [`finish`](Self::finish), but failures are logged as warnings
    pub fn finish_with_result<T, E: Display>(self, result: &Result<T, E>) -> u64 {
        let (ms, context) = self.stop();
        match result {
            Ok(_) => context.debug(&format!("took {}ms", ms)),
            Err(e) => context
                .with_metadata("error", json!(e.to_string()))
                .warn(&format!("failed after {}ms", ms)),
        }
        ms
    }
}

pub struct ErrorLogger;

impl ErrorLogger {
    /// Logs at a level that follows the error's [`Impact`]
    pub fn log_error(error: &IndexerError, context: Option<LogContext>) {
        let impact = error.impact();
        let mut context = context
            .unwrap_or_else(|| LogContext::new("pipeline", "unknown"))
            .with_metadata("impact", json!(format!("{:?}", impact)))
            .with_metadata("recoverable", json!(error.is_recoverable()));
        if let Some(pause) = error.retry_after() {
            context = context.with_metadata("retry_after_s", json!(pause.as_secs()));
        }

        let level = match impact {
            Impact::Fatal | Impact::SourceDown => Level::Error,
            Impact::ItemSkipped => Level::Warn,
            Impact::Expected => Level::Info,
        };
        context.log(level, &error.to_string());
    }

    pub fn log_recovery_attempt(operation: &str, error: &IndexerError, attempt: u32, max_attempts: u32) {
        let context = LogContext::new("retry", operation)
            .with_retry_count(attempt)
            .with_metadata("max_attempts", json!(max_attempts));
        if attempt >= max_attempts {
            context.error(&format!("giving up: {}", error));
        } else {
            context.warn(&format!("attempt {}/{} failed: {}", attempt, max_attempts, error));
        }
    }

    pub fn log_recovery_success(operation: &str, attempts: u32, total_ms: u64) {
        LogContext::new("retry", operation)
            .with_retry_count(attempts)
            .with_duration_ms(total_ms)
            .info(&format!("succeeded on attempt {}", attempts));
    }
}

/// Counters of the pipeline, emitted as log lines
pub struct MetricsLogger;

impl MetricsLogger {
    pub fn log_block_processed(chain: &str, height: u64, transfers: usize, ms: u64) {
        let context = LogContext::new("metrics", "block")
            .with_chain(chain)
            .with_block_number(height)
            .with_metadata("transfers", json!(transfers))
            .with_duration_ms(ms);
        let level = if transfers > 0 { Level::Info } else { Level::Debug };
        context.log(level, &format!("{} block {}: {} transfers", chain, height, transfers));
    }

    pub fn log_block_skipped(chain: &str, height: u64, attempts: u32) {
        LogContext::new("metrics", "block_skipped")
            .with_chain(chain)
            .with_block_number(height)
            .with_retry_count(attempts)
            .error(&format!("{} block {} skipped after {} attempts", chain, height, attempts));
    }

    pub fn log_rpc_call(method: &str, ms: u64, ok: bool) {
        let context = LogContext::new("metrics", "call")
            .with_metadata("method", json!(method))
            .with_metadata("ok", json!(ok))
            .with_duration_ms(ms);
        if ok {
            context.trace(method);
        } else {
            context.warn(&format!("{} failed", method));
        }
    }

    pub fn log_database_operation(operation: &str, ms: u64, rows: Option<usize>) {
        let mut context = LogContext::new("metrics", "store").with_duration_ms(ms);
        if let Some(rows) = rows {
            context = context.with_metadata("rows", json!(rows));
        }
        context.trace(operation);
    }

    pub fn log_trades_polled(market: &str, trades: usize) {
        LogContext::new("metrics", "trades")
            .with_metadata("market", json!(market))
            .with_metadata("trades", json!(trades))
            .debug(&format!("{} new {} trades", trades, market));
    }

    pub fn log_event_emitted(kind: &str, id: u64) {
        LogContext::new("metrics", "event")
            .with_metadata("kind", json!(kind))
            .with_metadata("event_id", json!(id))
            .info(kind);
    }
}

/// Installs env_logger; `RUST_LOG` wins over the configured level
pub fn init_logging(config: &LoggingConfig) {
    let pretty = config.json_format;
    let env = env_logger::Env::default().default_filter_or(config.level.as_str());
    let installed = env_logger::Builder::from_env(env)
        .format(move |buf, record| {
            use std::io::Write;

            let text = record.args().to_string();
            if pretty {
                if let Ok(value) = serde_json::from_str::<Value>(&text) {
                    return writeln!(buf, "{}", serde_json::to_string_pretty(&value)?);
                }
            }
            writeln!(buf, "{} {:<5} {}", buf.timestamp_millis(), record.level(), text)
        })
        .try_init();

    if installed.is_ok() {
        LogContext::new("logging", "init").info(&format!("level {}", config.level));
    }
}
