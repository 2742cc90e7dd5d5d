use std::time::{Duration, Instant};

use crate::error::{IndexerError, SystemError};
use crate::logging::{ErrorLogger, LogContext};
use crate::shutdown::ShutdownSignal;

/// How often and how patiently an upstream call is repeated
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total tries, the first one included
    pub attempts: u32,
    pub first_delay: Duration,
    pub max_delay: Duration,
    /// Growth of the delay per failed attempt; 1 keeps it constant
    pub factor: u32,
    /// Spread delays by up to 5% either way
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::for_rpc()
    }
}

impl RetryConfig {
    /// `attempts` tries, `delay` apart
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            first_delay: delay,
            max_delay: delay,
            factor: 1,
            jitter: false,
        }
    }

    /// Node JSON-RPC calls: 2s doubling up to 30s, five tries
    pub fn for_rpc() -> Self {
        Self {
            attempts: 5,
            first_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            factor: 2,
            jitter: true,
        }
    }
}

/// Repeats a fallible async call while its error is recoverable.
///
/// A rate-limit error never waits less than the pause the server asked for.
/// With a shutdown signal attached, a pending pause ends the call with
/// [`SystemError::Shutdown`] as soon as the signal fires.
pub struct RetryManager {
    config: RetryConfig,
    name: String,
    shutdown: Option<ShutdownSignal>,
}

impl RetryManager {
    pub fn new(name: &str, config: RetryConfig) -> Self {
        Self {
            config,
            name: name.to_string(),
            shutdown: None,
        }
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, IndexerError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, IndexerError>>,
    {
        let started = Instant::now();
        let attempts = self.config.attempts.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            if self.cancelled() {
                return Err(SystemError::Shutdown.into());
            }

            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        ErrorLogger::log_recovery_success(&self.name, attempt, started.elapsed().as_millis() as u64);
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !error.is_recoverable() {
                LogContext::new("retry", &self.name)
                    .with_retry_count(attempt)
                    .debug(&format!("not retried: {}", error));
                return Err(error);
            }
            ErrorLogger::log_recovery_attempt(&self.name, &error, attempt, attempts);
            if attempt >= attempts {
                return Err(error);
            }

            let mut delay = self.delay_after(attempt);
            if let Some(asked) = error.retry_after().filter(|_| is_rate_limit(&error)) {
                delay = delay.max(asked);
            }
            if !self.pause(delay).await {
                return Err(SystemError::Shutdown.into());
            }
        }
    }

    fn cancelled(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|s| s.is_shutdown())
    }

    async fn pause(&self, delay: Duration) -> bool {
        match &self.shutdown {
            Some(shutdown) => shutdown.sleep(delay).await,
            None => {
                tokio::time::sleep(delay).await;
                true
            }
        }
    }

    /// Pause after the given failed attempt, counting from 1
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let growth = self.config.factor.max(1).saturating_pow(attempt.saturating_sub(1));
        let delay = self.config.first_delay.saturating_mul(growth).min(self.config.max_delay);
        if !self.config.jitter {
            return delay;
        }
        let spread = 0.95 + rand::random::<f64>() * 0.1;
        delay.mul_f64(spread)
    }
}

fn is_rate_limit(error: &IndexerError) -> bool {
    matches!(error, IndexerError::Rpc(crate::error::RpcError::RateLimit { .. }))
}
