//! Detection over the persisted transfer stream.
//!
//! The tracker stores every transfer batch it receives and, for batches that
//! carry fresh activity, runs the interesting-address, DEX-volume and
//! large-transfer detectors over the recent window. Trades go to a separate
//! worker, and periodic statistics come from a third task.

pub mod cex;
pub mod dex;
pub mod interesting;
pub mod reports;
pub mod transfers;

pub use cex::{market_stats, CexDetector, CexWorker};
pub use dex::check_dex_events;
pub use interesting::InterestingDetector;
pub use reports::{generate_pool_stats, generate_stats, generate_top, StatsWorker, TopKind};
pub use transfers::LargeTransferDetector;

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::blockchain::ChainMessage;
use crate::config::TrackerConfig;
use crate::database::BackingStore;
use crate::error::{IndexerError, SystemError};
use crate::events::Event;
use crate::logging::{ErrorLogger, LogContext, MetricsLogger, PerformanceMonitor};
use crate::models::{KnownAddresses, PriceBook, Trade, Transfer};
use crate::shutdown::ShutdownSignal;

const MIN_MEMORY_WINDOW_SECONDS: i64 = 4 * 3600;

/// How long detectors remember what they already reported
pub(crate) fn memory_window(config: &TrackerConfig) -> Duration {
    Duration::seconds(config.recent_transfers_period_seconds as i64).max(Duration::seconds(MIN_MEMORY_WINDOW_SECONDS))
}

/// Transfer hashes already shown in an event, with the transfer time
#[derive(Debug, Default, Clone)]
pub struct NotifiedHashes(HashMap<String, DateTime<Utc>>);

impl NotifiedHashes {
    pub fn contains(&self, hash: &str) -> bool {
        self.0.contains_key(hash)
    }

    pub fn insert(&mut self, hash: &str, time: DateTime<Utc>) {
        self.0.insert(hash.to_string(), time);
    }

    /// Forgets entries older than `keep`
    pub fn prune(&mut self, now: DateTime<Utc>, keep: Duration) {
        self.0.retain(|_, time| now - *time <= keep);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

pub struct Tracker {
    config: TrackerConfig,
    store: Arc<dyn BackingStore>,
    registry: Arc<KnownAddresses>,
    prices: PriceBook,
    shutdown: ShutdownSignal,
    notified: NotifiedHashes,
    transfers: LargeTransferDetector,
    interesting: InterestingDetector,
}

impl Tracker {
    pub fn new(
        config: TrackerConfig,
        store: Arc<dyn BackingStore>,
        registry: Arc<KnownAddresses>,
        prices: PriceBook,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            prices,
            shutdown,
            notified: NotifiedHashes::default(),
            transfers: LargeTransferDetector::new(),
            interesting: InterestingDetector::new(),
        }
    }

    /// Forgets everything the detectors have reported
    pub fn reset(&mut self) {
        self.notified.clear();
        self.transfers.reset();
        self.interesting.reset();
    }

    pub fn notified(&self) -> &NotifiedHashes {
        &self.notified
    }

    fn recent_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::seconds(self.config.recent_transfers_period_seconds as i64)
    }

    /// Runs every detector over the transfers of the recent window
    pub fn check_events(&mut self, now: DateTime<Utc>) -> Result<Vec<Event>, IndexerError> {
        let monitor = PerformanceMonitor::new("check_events");
        let tfs = self.store.get_recent_transfers(self.recent_after(now))?;

        let mut events = self.interesting.check(
            &tfs,
            now,
            &self.config,
            &self.prices,
            &self.registry,
            self.store.as_ref(),
            &mut self.notified,
        );
        events.extend(
            check_dex_events(&tfs, &self.config, &self.registry, &mut self.notified)
                .into_iter()
                .map(Event::Dex),
        );
        events.extend(
            self.transfers
                .check(&tfs, now, &self.config, &self.prices, &self.notified)
                .into_iter()
                .map(Event::Transfer),
        );

        self.notified.prune(now, memory_window(&self.config));
        monitor
            .with_metadata("transfers", serde_json::json!(tfs.len()))
            .with_metadata("events", serde_json::json!(events.len()))
            .finish();
        Ok(events)
    }

    fn triggers_detection(&self, tfs: &[Transfer], now: DateTime<Utc>) -> bool {
        if tfs.iter().all(|tf| tf.is_countable_only()) {
            return false;
        }
        match tfs.iter().filter_map(|tf| tf.timestamp).max() {
            Some(latest) => latest > self.recent_after(now),
            None => false,
        }
    }

    /// Persists a chain message and returns the events it leads to
    pub fn handle_message(&mut self, msg: ChainMessage, now: DateTime<Utc>) -> Result<Vec<Event>, IndexerError> {
        match msg {
            ChainMessage::Transfers { chain, tfs } => {
                let stored = self.store.insert_transfers(&tfs)?;
                LogContext::new("tracker", "store_transfers")
                    .with_chain(chain)
                    .with_metadata("received", serde_json::json!(tfs.len()))
                    .with_metadata("stored", serde_json::json!(stored))
                    .debug("Stored transfers");

                if !self.triggers_detection(&tfs, now) {
                    return Ok(Vec::new());
                }
                self.check_events(now)
            }
            ChainMessage::Event(event) => Ok(vec![event]),
        }
    }

    /// Consumes chain messages until shutdown or until every watcher is gone.
    ///
    /// Trades are handed to a [`CexWorker`] and statistics to a
    /// [`StatsWorker`]; both stop with the tracker.
    pub async fn run(
        mut self,
        mut chains: mpsc::Receiver<ChainMessage>,
        trades: mpsc::Receiver<Vec<Trade>>,
        tx: mpsc::Sender<Event>,
    ) -> Result<(), IndexerError> {
        let context = LogContext::new("tracker", "run");
        context.info("Tracker started");

        let cex = tokio::spawn(
            CexWorker::new(self.store.clone(), self.config.clone(), self.prices.clone(), self.shutdown.clone())
                .run(trades, tx.clone()),
        );
        let stats = tokio::spawn(
            StatsWorker::new(
                self.store.clone(),
                self.registry.clone(),
                self.prices.clone(),
                self.config.stats_interval_seconds,
                self.shutdown.clone(),
            )
            .run(tx.clone()),
        );

        let shutdown = self.shutdown.clone();
        let result = loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                msg = chains.recv() => msg,
            };
            let Some(msg) = msg else {
                break Ok(());
            };

            let events = match self.handle_message(msg, Utc::now()) {
                Ok(events) => events,
                Err(e) => {
                    ErrorLogger::log_error(&e, Some(context.clone()));
                    continue;
                }
            };
            for event in events {
                MetricsLogger::log_event_emitted(event.kind(), event.id());
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            if tx.is_closed() {
                break Err(SystemError::ChannelClosed("event sink".to_string()).into());
            }
        };

        cex.abort();
        stats.abort();
        context.info("Tracker stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::events::BlockEvent;
    use crate::models::{Chain, Tag};
    use rust_decimal::Decimal;

    fn tracker(store: Arc<Database>) -> Tracker {
        Tracker::new(
            TrackerConfig::default(),
            store,
            Arc::new(KnownAddresses::default()),
            PriceBook::default(),
            ShutdownSignal::new(),
        )
    }

    fn send(hash: &str, log_index: u32, amount: i64, age_seconds: i64) -> Transfer {
        let mut tf = Transfer::new(hash, Chain::Idena, 10, log_index);
        tf.timestamp = Some(Utc::now() - Duration::seconds(age_seconds));
        tf.signer = Some("0xwhale".to_string());
        tf.changes = Transfer::create_changes("0xwhale", Some("0xfriend"), Decimal::from(amount));
        tf.tags.insert(Tag::Send);
        tf
    }

    fn invite(hash: &str, log_index: u32) -> Transfer {
        let mut tf = Transfer::new(hash, Chain::Idena, 10, log_index);
        tf.timestamp = Some(Utc::now());
        tf.changes = Transfer::create_changes("0xinviter", Some("0xnew"), Decimal::ZERO);
        tf.tags.insert(Tag::Invite);
        tf
    }

    #[test]
    fn test_memory_window_floor() {
        let mut config = TrackerConfig::default();
        assert_eq!(memory_window(&config), Duration::hours(4));
        config.recent_transfers_period_seconds = 86400;
        assert_eq!(memory_window(&config), Duration::days(1));
    }

    #[test]
    fn test_notified_hashes_prune() {
        let now = Utc::now();
        let mut notified = NotifiedHashes::default();
        notified.insert("0x1", now - Duration::hours(5));
        notified.insert("0x2", now - Duration::minutes(5));

        notified.prune(now, Duration::hours(4));
        assert!(!notified.contains("0x1"));
        assert!(notified.contains("0x2"));
        assert_eq!(notified.len(), 1);
    }

    #[test]
    fn test_large_send_is_reported_once() {
        let store = Arc::new(Database::new_in_memory().unwrap());
        let mut tracker = tracker(store.clone());

        let msg = ChainMessage::Transfers {
            chain: Chain::Idena,
            tfs: vec![send("0xbig", 0, 100_000, 10)],
        };
        let events = tracker.handle_message(msg, Utc::now()).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::Transfer(e) if e.tfs[0].hash == "0xbig"));
        assert_eq!(store.count_transfers().unwrap(), 1);

        assert!(tracker.check_events(Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn test_stale_and_countable_batches_are_only_stored() {
        let store = Arc::new(Database::new_in_memory().unwrap());
        let mut tracker = tracker(store.clone());

        let stale = ChainMessage::Transfers {
            chain: Chain::Idena,
            tfs: vec![send("0xold", 0, 100_000, 7200)],
        };
        assert!(tracker.handle_message(stale, Utc::now()).unwrap().is_empty());

        let countable = ChainMessage::Transfers {
            chain: Chain::Idena,
            tfs: vec![invite("0xinv", 1)],
        };
        assert!(tracker.handle_message(countable, Utc::now()).unwrap().is_empty());
        assert_eq!(store.count_transfers().unwrap(), 2);
    }

    #[test]
    fn test_chain_events_are_forwarded() {
        let mut tracker = tracker(Arc::new(Database::new_in_memory().unwrap()));
        let block = Event::Block(BlockEvent::new(Chain::Idena, 5_000_000));

        let events = tracker.handle_message(ChainMessage::Event(block.clone()), Utc::now()).unwrap();
        assert_eq!(events, vec![block]);
    }

    #[tokio::test]
    async fn test_run_emits_and_stops_on_shutdown() {
        let store = Arc::new(Database::new_in_memory().unwrap());
        let shutdown = ShutdownSignal::new();
        let tracker = Tracker::new(
            TrackerConfig::default(),
            store,
            Arc::new(KnownAddresses::default()),
            PriceBook::default(),
            shutdown.clone(),
        );

        let (chain_tx, chain_rx) = mpsc::channel(8);
        let (_trade_tx, trade_rx) = mpsc::channel(8);
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let handle = tokio::spawn(tracker.run(chain_rx, trade_rx, event_tx));

        chain_tx
            .send(ChainMessage::Transfers {
                chain: Chain::Idena,
                tfs: vec![send("0xbig", 0, 100_000, 10)],
            })
            .await
            .unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), event_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind(), "transfer");

        shutdown.trigger();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
