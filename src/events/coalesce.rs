use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{Event, MergeContext};
use crate::config::PublisherConfig;
use crate::database::BackingStore;
use crate::error::IndexerError;
use crate::logging::{ErrorLogger, LogContext};
use crate::models::{KnownAddresses, PriceBook};

/// Channel name of events stored by [`EventSink`]
pub const LOG_CHANNEL: &str = "log";

/// Outcome of offering an event to the coalescer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Coalesced {
    /// Nothing recent could absorb it; publish as new
    New(Event),
    /// Folded into an already published event, which should be updated
    Merged(Event),
}

struct Published {
    event: Event,
    at: DateTime<Utc>,
}

/// Folds new events into recently published ones of the same kind
pub struct Coalescer {
    replace_period: Duration,
    pool_replace_period: Duration,
    recent: Vec<Published>,
}

impl Coalescer {
    pub fn new(config: &PublisherConfig) -> Self {
        Self {
            replace_period: Duration::seconds(config.event_replace_period_seconds as i64),
            pool_replace_period: Duration::seconds(config.pool_event_replace_period_seconds as i64),
            recent: Vec::new(),
        }
    }

    fn period_for(&self, event: &Event) -> Duration {
        if event.is_pool_event() {
            self.pool_replace_period
        } else {
            self.replace_period
        }
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    pub fn offer(&mut self, event: Event, now: DateTime<Utc>, ctx: MergeContext<'_>) -> Coalesced {
        let max_period = self.replace_period.max(self.pool_replace_period);
        self.recent.retain(|p| now - p.at <= max_period);

        for idx in 0..self.recent.len() {
            let period = self.period_for(&self.recent[idx].event);
            let published = &mut self.recent[idx];
            if published.event.id() == event.id() {
                LogContext::new("publisher", "coalesce")
                    .with_metadata("event_id", serde_json::json!(event.id()))
                    .warn("Event already published");
                return Coalesced::Merged(published.event.clone());
            }
            if std::mem::discriminant(&published.event) != std::mem::discriminant(&event) {
                continue;
            }
            if now - published.at > period || !published.event.can_join(&event) {
                continue;
            }
            match published.event.join(&event, ctx) {
                Ok(()) => return Coalesced::Merged(published.event.clone()),
                Err(e) => LogContext::new("publisher", "coalesce")
                    .with_metadata("event_id", serde_json::json!(event.id()))
                    .with_metadata("error", serde_json::json!(e.to_string()))
                    .warn("Could not merge event"),
            }
        }

        if matches!(event, Event::Transfer(_) | Event::Dex(_) | Event::MassPool(_) | Event::Cex(_)) {
            self.recent.push(Published { event: event.clone(), at: now });
        }
        Coalesced::New(event)
    }
}

/// End of the pipeline: coalesces emitted events, logs them and stores each
/// outcome under [`LOG_CHANNEL`]
pub struct EventSink {
    coalescer: Coalescer,
    store: Arc<dyn BackingStore>,
    registry: Arc<KnownAddresses>,
    prices: PriceBook,
}

impl EventSink {
    pub fn new(
        config: &PublisherConfig,
        store: Arc<dyn BackingStore>,
        registry: Arc<KnownAddresses>,
        prices: PriceBook,
    ) -> Self {
        Self {
            coalescer: Coalescer::new(config),
            store,
            registry,
            prices,
        }
    }

    /// Returns the event as stored, which is the merged one when coalesced
    pub fn publish(&mut self, event: Event, now: DateTime<Utc>) -> Result<Event, IndexerError> {
        let ctx = MergeContext {
            registry: self.registry.as_ref(),
            prices: &self.prices,
        };
        let (message, event) = match self.coalescer.offer(event, now, ctx) {
            Coalesced::New(event) => ("new", event),
            Coalesced::Merged(event) => ("merged", event),
        };

        LogContext::new("publisher", message)
            .with_metadata("kind", serde_json::json!(event.kind()))
            .with_metadata("id", serde_json::json!(event.id()))
            .info(&format!("{} event", event.kind()));
        self.store.insert_event(LOG_CHANNEL, message, &event)?;
        Ok(event)
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<Event>) {
        while let Some(event) = rx.recv().await {
            if let Err(e) = self.publish(event, Utc::now()) {
                ErrorLogger::log_error(&e, Some(LogContext::new("publisher", "store_event")));
            }
        }
        LogContext::new("publisher", "run").debug("Event stream closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CexEvent, MarketStats, TransferEvent};
    use crate::exchanges::Market;
    use crate::models::{Chain, KnownAddresses, PriceBook, Transfer};
    use rust_decimal::Decimal;

    fn ctx_parts() -> (KnownAddresses, PriceBook) {
        (KnownAddresses::default(), PriceBook::default())
    }

    fn cex(buy: i64) -> Event {
        let mut stats = MarketStats::new(Market::Bitmart);
        stats.buy = Decimal::from(buy);
        stats.quote_amount = Decimal::from(buy) / Decimal::from(30);
        Event::Cex(CexEvent::new(Decimal::from(buy), Decimal::ZERO, vec![stats]))
    }

    #[test]
    fn test_cex_events_merge_within_period() {
        let (registry, prices) = ctx_parts();
        let ctx = MergeContext { registry: &registry, prices: &prices };
        let mut coalescer = Coalescer::new(&PublisherConfig::default());
        let now = Utc::now();

        assert!(matches!(coalescer.offer(cex(100), now, ctx), Coalesced::New(_)));
        match coalescer.offer(cex(50), now + Duration::seconds(60), ctx) {
            Coalesced::Merged(Event::Cex(merged)) => assert_eq!(merged.total_buy_val, Decimal::from(150)),
            other => panic!("expected merge, got {:?}", other),
        }
        assert_eq!(coalescer.len(), 1);
    }

    #[test]
    fn test_republished_event_is_not_counted_twice() {
        let (registry, prices) = ctx_parts();
        let ctx = MergeContext { registry: &registry, prices: &prices };
        let mut coalescer = Coalescer::new(&PublisherConfig::default());
        let now = Utc::now();

        let event = cex(100);
        assert!(matches!(coalescer.offer(event.clone(), now, ctx), Coalesced::New(_)));
        match coalescer.offer(event, now + Duration::seconds(5), ctx) {
            Coalesced::Merged(Event::Cex(same)) => assert_eq!(same.total_buy_val, Decimal::from(100)),
            other => panic!("expected the published event, got {:?}", other),
        }
        assert_eq!(coalescer.len(), 1);
    }

    #[test]
    fn test_old_events_are_not_merged() {
        let (registry, prices) = ctx_parts();
        let ctx = MergeContext { registry: &registry, prices: &prices };
        let mut coalescer = Coalescer::new(&PublisherConfig::default());
        let now = Utc::now();

        coalescer.offer(cex(100), now, ctx);
        let later = now + Duration::seconds(3601);
        assert!(matches!(coalescer.offer(cex(50), later, ctx), Coalesced::New(_)));
    }

    #[test]
    fn test_unrelated_transfers_stay_separate() {
        let (registry, prices) = ctx_parts();
        let ctx = MergeContext { registry: &registry, prices: &prices };
        let mut coalescer = Coalescer::new(&PublisherConfig::default());
        let now = Utc::now();

        let transfer = |hash: &str, from: &str, to: &str| {
            let mut tf = Transfer::new(hash, Chain::Idena, 1, 0);
            tf.changes = Transfer::create_changes(from, Some(to), Decimal::from(10));
            Event::Transfer(TransferEvent::new(from, Decimal::from(10), now, vec![tf]))
        };

        assert!(matches!(coalescer.offer(transfer("0x1", "0xa", "0xb"), now, ctx), Coalesced::New(_)));
        assert!(matches!(coalescer.offer(transfer("0x2", "0xc", "0xd"), now, ctx), Coalesced::New(_)));
        assert!(matches!(coalescer.offer(transfer("0x3", "0xe", "0xd"), now, ctx), Coalesced::Merged(_)));
    }

    #[test]
    fn test_sink_stores_merged_event_under_first_id() {
        use crate::database::Database;

        let store = Arc::new(Database::new_in_memory().unwrap());
        let mut sink = EventSink::new(
            &PublisherConfig::default(),
            store.clone(),
            Arc::new(KnownAddresses::default()),
            PriceBook::default(),
        );
        let now = Utc::now();

        let first = sink.publish(cex(100), now).unwrap();
        let merged = sink.publish(cex(50), now + Duration::seconds(10)).unwrap();
        assert_eq!(first.id(), merged.id());

        let stored = store.get_event(first.id()).unwrap().unwrap();
        assert_eq!(stored.channel, LOG_CHANNEL);
        assert_eq!(stored.message, "merged");
    }
}
