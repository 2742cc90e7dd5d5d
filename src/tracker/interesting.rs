use chrono::{DateTime, Duration, Utc};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};

use super::{memory_window, NotifiedHashes};
use crate::config::TrackerConfig;
use crate::database::BackingStore;
use crate::error::IndexerError;
use crate::events::{Event, KillEvent, MassPoolEvent, PoolAction, PoolEvent, TransferEvent};
use crate::logging::{ErrorLogger, LogContext};
use crate::models::{KnownAddresses, PriceBook, Tag, Transfer, KILL_TAGS};

#[derive(Debug, Clone)]
struct PendingPoolEvent {
    event: PoolEvent,
    notified: bool,
}

impl PendingPoolEvent {
    /// A kill batched before the indexer knew its stake and age is replaced by
    /// the enriched copy of the same transaction
    fn absorb(&mut self, event: PoolEvent) {
        if self.notified {
            return;
        }
        let same_tx = self.event.tfs.first().map(|tf| &tf.hash) == event.tfs.first().map(|tf| &tf.hash);
        let placeholder = self.event.tfs.iter().any(|tf| tf.meta.age.is_none());
        let enriched = event.tfs.iter().all(|tf| tf.meta.age.is_some());
        if same_tx && placeholder && enriched {
            self.event = event;
        }
    }
}

#[derive(Debug, Clone)]
struct PoolActionRecord {
    hash: String,
    time: DateTime<Utc>,
    limited: bool,
}

enum Finding {
    Notify(Event),
    Batch(PoolEvent),
}

/// Watched-address activity, large kills and stakes, and pool batching.
///
/// Kills below the thresholds and delegation changes are collected per
/// (action, pool); a batch is published once enough unpublished entries fall
/// inside the moved period.
#[derive(Debug, Default)]
pub struct InterestingDetector {
    batches: HashMap<(PoolAction, String), BTreeMap<String, PendingPoolEvent>>,
    pool_actions: HashMap<String, Vec<PoolActionRecord>>,
}

impl InterestingDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.batches.clear();
        self.pool_actions.clear();
    }

    #[allow(clippy::too_many_arguments)]
    pub fn check(
        &mut self,
        tfs: &[Transfer],
        now: DateTime<Utc>,
        config: &TrackerConfig,
        prices: &PriceBook,
        registry: &KnownAddresses,
        store: &dyn BackingStore,
        notified: &mut NotifiedHashes,
    ) -> Vec<Event> {
        let mut events = Vec::new();
        let mut new_batches: BTreeMap<(PoolAction, String), Vec<PoolEvent>> = BTreeMap::new();

        for tf in tfs {
            if notified.contains(&tf.hash) {
                continue;
            }
            match self.inspect(tf, config, prices, registry, store) {
                Ok(Some(Finding::Notify(event))) => {
                    notified.insert(&tf.hash, tf.time_or_epoch());
                    events.push(event);
                }
                Ok(Some(Finding::Batch(event))) => {
                    new_batches.entry((event.subtype, event.pool.clone())).or_default().push(event);
                }
                Ok(None) => {}
                Err(e) => ErrorLogger::log_error(
                    &e,
                    Some(LogContext::new("tracker", "interesting").with_transaction_hash(&tf.hash)),
                ),
            }
        }

        let period = Duration::seconds(config.pool_identities_moved_period_seconds as i64);
        for (key, fresh) in new_batches {
            let batch = self.batches.entry(key.clone()).or_default();
            for event in fresh {
                match batch.entry(event.addr.clone()) {
                    Entry::Occupied(mut slot) => slot.get_mut().absorb(event),
                    Entry::Vacant(slot) => {
                        slot.insert(PendingPoolEvent { event, notified: false });
                    }
                }
            }
            // Kills reported on their own never show up again in a batch
            for pending in batch.values_mut() {
                if pending.event.tfs.iter().any(|tf| notified.contains(&tf.hash)) {
                    pending.notified = true;
                }
            }

            let mut unnotified: Vec<&mut PendingPoolEvent> = batch
                .values_mut()
                .filter(|p| !p.notified && now - p.event.time < period)
                .collect();
            if unnotified.len() < config.pool_identities_moved_threshold {
                continue;
            }

            unnotified.sort_by(|a, b| a.event.time.cmp(&b.event.time).then_with(|| a.event.addr.cmp(&b.event.addr)));
            let mut changes = Vec::with_capacity(unnotified.len());
            for pending in unnotified {
                pending.notified = true;
                for tf in &pending.event.tfs {
                    notified.insert(&tf.hash, pending.event.time);
                }
                changes.push(pending.event.clone());
            }

            let (subtype, pool) = key;
            LogContext::new("tracker", "mass_pool")
                .with_address(&pool)
                .with_metadata("subtype", serde_json::json!(subtype.as_str()))
                .with_metadata("count", serde_json::json!(changes.len()))
                .info("Pool batch complete");
            events.push(Event::MassPool(MassPoolEvent::new(subtype, &pool, changes)));
        }

        self.prune(now, config);
        events
    }

    fn inspect(
        &mut self,
        tf: &Transfer,
        config: &TrackerConfig,
        prices: &PriceBook,
        registry: &KnownAddresses,
        store: &dyn BackingStore,
    ) -> Result<Option<Finding>, IndexerError> {
        let signer = tf.signer.as_deref().unwrap_or_default();
        let time = tf.time_or_epoch();

        if !signer.is_empty() && registry.is_interesting(signer, tf.chain) {
            if tf.has_tag(Tag::Invite) {
                return Ok(None);
            }
            let event = TransferEvent::new(signer, tf.value(false), time, vec![tf.clone()]);
            return Ok(Some(Finding::Notify(Event::Interesting(event))));
        }

        if tf.has_any_tag(&KILL_TAGS) {
            if tf.changes.is_empty() {
                return Ok(None);
            }
            let stake = tf.value(true);
            let usd_value = tf.meta.usd_value.unwrap_or_else(|| stake * prices.native());
            let age = tf.meta.age.unwrap_or(0);
            if usd_value >= config.killtx_stake_threshold || age >= config.killtx_age_threshold {
                return Ok(Some(Finding::Notify(Event::Kill(KillEvent::from_tf(tf)?))));
            }
            if tf.meta.pool.is_none() {
                return Ok(None);
            }
            return Ok(Some(Finding::Batch(PoolEvent::from_tf(tf, PoolAction::Kill, None, None)?)));
        }

        if tf.has_tag(Tag::ReplenishStake) {
            if tf.usd_value() <= config.recent_transfers_threshold {
                return Ok(None);
            }
            let event = TransferEvent::new(signer, tf.value(false), time, vec![tf.clone()]);
            return Ok(Some(Finding::Notify(Event::Transfer(event))));
        }

        let action = if tf.has_tag(Tag::Delegate) {
            PoolAction::Delegate
        } else if tf.has_tag(Tag::Undelegate) {
            PoolAction::Undelegate
        } else {
            return Ok(None);
        };
        let Some(pool) = tf.meta.pool.as_deref() else {
            return Ok(None);
        };

        let batched = self
            .batches
            .get(&(action, pool.to_string()))
            .map(|batch| batch.contains_key(signer))
            .unwrap_or(false);
        if batched {
            return Ok(None);
        }
        if self.rate_limited(signer, &tf.hash, time, config) {
            LogContext::new("tracker", "pool_action")
                .with_address(signer)
                .with_transaction_hash(&tf.hash)
                .debug("Pool action rate limited");
            return Ok(None);
        }

        let identity = store.get_identity(signer)?;
        let (age, stake) = match identity {
            Some(identity) => (Some(identity.age), Some(identity.stake)),
            None => (None, None),
        };
        Ok(Some(Finding::Batch(PoolEvent::from_tf(tf, action, age, stake)?)))
    }

    /// Records a delegation change; true when the identity already used up its
    /// allowance inside the window
    fn rate_limited(&mut self, identity: &str, hash: &str, time: DateTime<Utc>, config: &TrackerConfig) -> bool {
        let window = Duration::seconds(config.pool_action_window_seconds as i64);
        let actions = self.pool_actions.entry(identity.to_string()).or_default();
        if let Some(seen) = actions.iter().find(|a| a.hash == hash) {
            return seen.limited;
        }

        let recent = actions.iter().filter(|a| (time - a.time).num_seconds().abs() <= window.num_seconds()).count();
        let limited = recent >= config.pool_action_limit;
        actions.push(PoolActionRecord {
            hash: hash.to_string(),
            time,
            limited,
        });
        limited
    }

    fn prune(&mut self, now: DateTime<Utc>, config: &TrackerConfig) {
        let keep = memory_window(config).max(Duration::seconds(config.pool_identities_moved_period_seconds as i64));
        for batch in self.batches.values_mut() {
            batch.retain(|_, pending| now - pending.event.time <= keep);
        }
        self.batches.retain(|_, batch| !batch.is_empty());

        let window = Duration::seconds(config.pool_action_window_seconds as i64).max(keep);
        for actions in self.pool_actions.values_mut() {
            actions.retain(|a| now - a.time <= window);
        }
        self.pool_actions.retain(|_, actions| !actions.is_empty());
    }
}
