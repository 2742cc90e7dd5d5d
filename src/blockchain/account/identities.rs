use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::node::NodeClient;
use crate::blockchain::ChainMessage;
use crate::database::BackingStore;
use crate::error::{IndexerError, SystemError};
use crate::events::{ClubEvent, Event};
use crate::logging::{ErrorLogger, LogContext};
use crate::models::Identity;
use crate::shutdown::ShutdownSignal;

const CACHER_START_DELAY: Duration = Duration::from_secs(5);
const CACHER_ERROR_DELAY: Duration = Duration::from_secs(60);
const MEMPOOL_INTERVAL: Duration = Duration::from_secs(1);
const MEMPOOL_ERROR_DELAY: Duration = Duration::from_secs(3);

/// Club size for a stake; larger stakes move in coarser steps
pub fn club_step(stake: Decimal) -> Decimal {
    if stake > Decimal::from(10_000_000) {
        Decimal::from(1_000_000)
    } else if stake > Decimal::from(2_000_000) {
        Decimal::from(500_000)
    } else if stake > Decimal::from(500_000) {
        Decimal::from(100_000)
    } else {
        Decimal::from(50_000)
    }
}

/// New club threshold when `new_stake` climbs past the club of `cur_stake`
pub fn check_new_club(cur_stake: Decimal, new_stake: Decimal) -> Option<Decimal> {
    let step = club_step(cur_stake);
    let cur_club = (cur_stake / step).floor();
    let new_club = (new_stake / step).floor();
    (new_club > cur_club).then(|| new_club * step)
}

/// Stores fresh identities and returns the club crossings they cause.
///
/// Only identities already cached can cross a club; ranks are counted after
/// the insert so they include the new stakes.
pub fn process_identity_changes(
    store: &dyn BackingStore,
    changes: &[Identity],
    full: bool,
) -> Result<Vec<ClubEvent>, IndexerError> {
    let current: HashMap<String, Decimal> = if full {
        store.get_identities()?.into_iter().map(|i| (i.address, i.stake)).collect()
    } else {
        let mut current = HashMap::new();
        for identity in changes {
            if let Some(cached) = store.get_identity(&identity.address)? {
                current.insert(cached.address, cached.stake);
            }
        }
        current
    };

    let crossings: Vec<(String, Decimal, Decimal)> = changes
        .iter()
        .filter_map(|new| {
            let cur_stake = current.get(&new.address)?;
            let club = check_new_club(*cur_stake, new.stake)?;
            LogContext::new("identities", "club_change")
                .with_address(&new.address)
                .with_amount(new.stake)
                .with_metadata("club", serde_json::json!(club.to_string()))
                .info("Stake crossed into a new club");
            Some((new.address.clone(), new.stake, club))
        })
        .collect();

    store.insert_identities(changes, full)?;

    let mut events = Vec::with_capacity(crossings.len());
    for (addr, stake, club) in crossings {
        let rank = store.count_identities_with_stake(stake)?;
        events.push(ClubEvent::new(&addr, stake, club, rank));
    }
    Ok(events)
}

async fn send_clubs(tx: &mpsc::Sender<ChainMessage>, events: Vec<ClubEvent>) -> Result<(), IndexerError> {
    for event in events {
        tx.send(ChainMessage::Event(Event::Club(event)))
            .await
            .map_err(|_| SystemError::ChannelClosed("club events".to_string()))?;
    }
    Ok(())
}

/// Refetches one identity and records any club crossing
pub async fn refresh_identity(
    node: &NodeClient,
    store: &dyn BackingStore,
    addr: &str,
    tx: &mpsc::Sender<ChainMessage>,
) -> Result<(), IndexerError> {
    let Some(mut identity) = node.identity(addr).await? else {
        return Ok(());
    };
    identity.fetch_time = Some(Utc::now());
    let events = process_identity_changes(store, &[identity], false)?;
    send_clubs(tx, events).await
}

/// Periodically replaces the identity cache with the node's full list
pub struct IdentityCacher {
    node: NodeClient,
    store: Arc<dyn BackingStore>,
    interval: Duration,
    shutdown: ShutdownSignal,
}

impl IdentityCacher {
    pub fn new(node: NodeClient, store: Arc<dyn BackingStore>, interval: Duration, shutdown: ShutdownSignal) -> Self {
        Self {
            node,
            store,
            interval,
            shutdown,
        }
    }

    /// One full fetch; returns how many identities were cached
    pub async fn refresh(&self, tx: &mpsc::Sender<ChainMessage>) -> Result<usize, IndexerError> {
        let context = LogContext::new("identity_cacher", "refresh");
        context.info("Fetching identities");

        let now = Utc::now();
        let mut identities = self.node.identities().await?;
        for identity in identities.iter_mut() {
            identity.fetch_time = Some(now);
        }

        let events = process_identity_changes(self.store.as_ref(), &identities, true)?;
        send_clubs(tx, events).await?;
        context
            .with_metadata("count", serde_json::json!(identities.len()))
            .info("Identities cached");
        Ok(identities.len())
    }

    pub async fn run(self, tx: mpsc::Sender<ChainMessage>) {
        if !self.shutdown.sleep(CACHER_START_DELAY).await {
            return;
        }
        loop {
            let delay = match self.refresh(&tx).await {
                Ok(_) => self.interval,
                Err(e @ IndexerError::System(SystemError::ChannelClosed(_))) => {
                    ErrorLogger::log_error(&e, Some(LogContext::new("identity_cacher", "run")));
                    return;
                }
                Err(e) => {
                    ErrorLogger::log_error(&e, Some(LogContext::new("identity_cacher", "run")));
                    CACHER_ERROR_DELAY
                }
            };
            if !self.shutdown.sleep(delay).await {
                break;
            }
        }
        LogContext::new("identity_cacher", "run").debug("Stopped");
    }
}

/// Watches pending transactions so identities about to be killed are cached
/// before the kill is final
pub struct MempoolWatcher {
    node: NodeClient,
    store: Arc<dyn BackingStore>,
    shutdown: ShutdownSignal,
    seen: HashSet<String>,
}

impl MempoolWatcher {
    pub fn new(node: NodeClient, store: Arc<dyn BackingStore>, shutdown: ShutdownSignal) -> Self {
        Self {
            node,
            store,
            shutdown,
            seen: HashSet::new(),
        }
    }

    /// One mempool pass; returns how many identities were prefetched
    pub async fn poll(&mut self) -> Result<usize, IndexerError> {
        let hashes = self.node.mempool().await?;
        if hashes.is_empty() {
            self.seen.clear();
            return Ok(0);
        }

        let mut prefetched = 0;
        for hash in hashes {
            if !self.seen.insert(hash.clone()) {
                continue;
            }
            let pending = match self.node.transaction(&hash).await {
                Ok(Some(pending)) => pending,
                Ok(None) => continue,
                Err(e) => {
                    ErrorLogger::log_error(&e, Some(LogContext::new("mempool", "transaction").with_transaction_hash(&hash)));
                    continue;
                }
            };
            let Some(killed) = pending.killed_identity() else {
                continue;
            };

            LogContext::new("mempool", "poll")
                .with_transaction_hash(&hash)
                .with_address(killed)
                .debug("Pending kill, prefetching identity");
            match self.node.identity(killed).await {
                Ok(Some(mut identity)) if identity.is_defined() => {
                    identity.fetch_time = Some(Utc::now());
                    self.store.insert_identities(&[identity], false)?;
                    prefetched += 1;
                }
                Ok(_) => {}
                Err(e) => ErrorLogger::log_error(&e, Some(LogContext::new("mempool", "identity").with_address(killed))),
            }
        }
        Ok(prefetched)
    }

    pub async fn run(mut self) {
        loop {
            if !self.shutdown.sleep(MEMPOOL_INTERVAL).await {
                break;
            }
            if let Err(e) = self.poll().await {
                LogContext::new("mempool", "run").warn(&format!("Mempool error: {}", e));
                if !self.shutdown.sleep(MEMPOOL_ERROR_DELAY).await {
                    break;
                }
            }
        }
        LogContext::new("mempool", "run").debug("Stopped");
    }
}
