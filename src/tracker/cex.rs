use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::TrackerConfig;
use crate::database::BackingStore;
use crate::error::IndexerError;
use crate::events::{CexEvent, Event, MarketStats};
use crate::exchanges::Market;
use crate::logging::{ErrorLogger, LogContext, MetricsLogger};
use crate::models::{PriceBook, Trade};
use crate::shutdown::ShutdownSignal;

const TRADE_WAIT: Duration = Duration::from_secs(10);

/// Per-market volume of a set of trades, without average prices
pub fn market_stats(trades: &[Trade]) -> BTreeMap<Market, MarketStats> {
    let mut markets: BTreeMap<Market, MarketStats> = BTreeMap::new();
    for trade in trades {
        let stats = markets.entry(trade.market).or_insert_with(|| MarketStats::new(trade.market));
        if trade.buy {
            stats.buy += trade.amount;
            stats.buy_usd += trade.usd_value;
        } else {
            stats.sell += trade.amount;
            stats.sell_usd += trade.usd_value;
        }
        stats.quote_amount += trade.quote_amount();
    }
    markets
}

/// Reports centralized exchange volume above the threshold, counting only
/// trades newer than the previous report
#[derive(Debug)]
pub struct CexDetector {
    notified_at: DateTime<Utc>,
}

impl Default for CexDetector {
    fn default() -> Self {
        Self {
            notified_at: DateTime::<Utc>::MIN_UTC,
        }
    }
}

impl CexDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notified_at(&self) -> DateTime<Utc> {
        self.notified_at
    }

    pub fn reset(&mut self) {
        self.notified_at = DateTime::<Utc>::MIN_UTC;
    }

    pub fn check(
        &mut self,
        store: &dyn BackingStore,
        config: &TrackerConfig,
        prices: &PriceBook,
        now: DateTime<Utc>,
    ) -> Result<Option<CexEvent>, IndexerError> {
        let window = Duration::from_secs(config.cex_volume_period_seconds);
        let trades = store.get_recent_trades(self.notified_at, window)?;
        let total: Decimal = trades.iter().map(|t| t.usd_value).sum();
        if trades.is_empty() || total < config.cex_volume_threshold {
            return Ok(None);
        }

        let total_buy: Decimal = trades.iter().filter(|t| t.buy).map(|t| t.usd_value).sum();
        let total_sell = total - total_buy;

        let mut markets: Vec<MarketStats> = market_stats(&trades).into_values().collect();
        for stats in markets.iter_mut() {
            stats.calculate_average_price(prices);
        }
        let dominant = markets
            .iter()
            .filter(|m| m.volume_usd() / total > config.majority_volume_fraction)
            .reduce(|best, m| if m.volume_usd() > best.volume_usd() { m } else { best })
            .cloned();
        if let Some(dominant) = dominant {
            markets = vec![dominant];
        }

        LogContext::new("tracker", "cex")
            .with_amount(total)
            .with_metadata("trades", serde_json::json!(trades.len()))
            .info("CEX volume above threshold");
        self.notified_at = now;
        Ok(Some(CexEvent::new(total_buy, total_sell, markets)))
    }
}

/// Persists incoming trades and checks their volume at most once per cooldown
pub struct CexWorker {
    detector: CexDetector,
    store: Arc<dyn BackingStore>,
    config: TrackerConfig,
    prices: PriceBook,
    shutdown: ShutdownSignal,
}

impl CexWorker {
    pub fn new(store: Arc<dyn BackingStore>, config: TrackerConfig, prices: PriceBook, shutdown: ShutdownSignal) -> Self {
        Self {
            detector: CexDetector::new(),
            store,
            config,
            prices,
            shutdown,
        }
    }

    fn store_trades(&self, trades: &[Trade]) -> Result<(), IndexerError> {
        self.store.insert_trades(trades)?;
        let context = LogContext::new("tracker", "trades").with_metadata("count", serde_json::json!(trades.len()));
        context.debug("Stored trades");
        Ok(())
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<Vec<Trade>>, tx: mpsc::Sender<Event>) {
        let cooldown = chrono::Duration::seconds(self.config.cex_check_cooldown_seconds as i64);
        let mut pending = false;

        loop {
            // Waking up without trades still lets a cooled-down check run
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = tokio::time::timeout(TRADE_WAIT, rx.recv()) => received,
            };
            match received {
                Ok(Some(trades)) => match self.store_trades(&trades) {
                    Ok(()) => pending = true,
                    Err(e) => ErrorLogger::log_error(&e, Some(LogContext::new("tracker", "trades"))),
                },
                Ok(None) => break,
                Err(_) => {}
            }

            let now = Utc::now();
            if !pending || now - self.detector.notified_at() <= cooldown {
                continue;
            }
            pending = false;
            match self.detector.check(self.store.as_ref(), &self.config, &self.prices, now) {
                Ok(Some(event)) => {
                    let event = Event::Cex(event);
                    MetricsLogger::log_event_emitted(event.kind(), event.id());
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => ErrorLogger::log_error(&e, Some(LogContext::new("tracker", "cex"))),
            }
        }

        LogContext::new("tracker", "cex").debug("Trade worker stopped");
    }
}
