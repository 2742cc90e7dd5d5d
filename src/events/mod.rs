//! Typed notification events and their merge contract.
//!
//! Every event carries a process-unique id. Mergeable events (`Transfer`, `Dex`,
//! `MassPool`, `Cex`) expose `can_join`/`join` so a publisher can fold a new
//! event into one it already announced.

pub mod coalesce;
pub mod market;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::database::BackingStore;
use crate::error::{IndexerError, ProcessingError};
use crate::models::{aggregate_dex_trades, Chain, KnownAddresses, PriceBook, Tag, Transfer, KILL_TAGS};

pub use coalesce::{Coalesced, Coalescer, EventSink, LOG_CHANNEL};
pub use market::{format_grouped, CexEvent, MarketStats};

static LAST_EVENT_ID: AtomicU64 = AtomicU64::new(0);

/// Strictly increasing id derived from the clock in nanoseconds
pub fn next_event_id() -> u64 {
    let now = Utc::now().timestamp_nanos_opt().unwrap_or_default().max(0) as u64;
    let previous = LAST_EVENT_ID
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
        .unwrap_or_else(|last| last);
    now.max(previous + 1)
}

/// Lookups needed to recompute aggregates while merging
#[derive(Clone, Copy)]
pub struct MergeContext<'a> {
    pub registry: &'a KnownAddresses,
    pub prices: &'a PriceBook,
}

fn extend_unique(tfs: &mut Vec<Transfer>, other: &[Transfer]) {
    let mut seen: HashSet<String> = tfs.iter().map(|tf| tf.hash.clone()).collect();
    for tf in other {
        if seen.insert(tf.hash.clone()) {
            tfs.push(tf.clone());
        }
    }
}

/// Transfers moved by one address, or into one address when `recv` is set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEvent {
    pub id: u64,
    pub time: DateTime<Utc>,
    pub amount: Decimal,
    pub by: String,
    pub tfs: Vec<Transfer>,
    #[serde(default)]
    pub recv: bool,
}

impl TransferEvent {
    pub fn new(by: &str, amount: Decimal, time: DateTime<Utc>, tfs: Vec<Transfer>) -> Self {
        Self {
            id: next_event_id(),
            time,
            amount,
            by: by.to_string(),
            tfs,
            recv: false,
        }
    }

    pub fn total_usd_value(&self) -> Decimal {
        self.tfs.iter().map(|tf| tf.usd_value()).sum()
    }

    fn senders(&self) -> HashSet<Option<&str>> {
        self.tfs.iter().map(|tf| tf.sender()).collect()
    }

    fn receivers(&self) -> HashSet<Option<&str>> {
        self.tfs.iter().map(|tf| tf.receiver()).collect()
    }

    pub fn can_join(&self, other: &TransferEvent) -> bool {
        if self.tfs.len() > 1 && self.by == other.by && !self.recv {
            return true;
        }
        let receivers = self.receivers();
        receivers == other.receivers() && receivers.iter().next().map(|r| r.is_some()).unwrap_or(false)
    }

    /// Absorbs `other`; when the sender sets differ the event becomes a receive
    /// event for the shared receiver
    pub fn join(&mut self, other: &TransferEvent) {
        if self.senders() != other.senders() {
            if let Some(receiver) = self.receivers().into_iter().flatten().min() {
                self.by = receiver.to_string();
            }
            self.recv = true;
        }
        let before = self.tfs.len();
        extend_unique(&mut self.tfs, &other.tfs);
        if self.tfs.len() > before {
            self.amount += other.amount;
        }
        self.time = other.time;
    }
}

/// Aggregated DEX activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DexEvent {
    pub id: u64,
    pub time: DateTime<Utc>,
    pub amount: Decimal,
    pub tfs: Vec<Transfer>,
    pub buy_usd: Decimal,
    pub sell_usd: Decimal,
    pub lp_usd: Decimal,
    pub avg_price: Decimal,
    pub last_price: Decimal,
    /// Smaller transfers left out of an aggregated event
    #[serde(default)]
    pub truncated: usize,
}

impl DexEvent {
    pub fn from_tfs(tfs: Vec<Transfer>, registry: &KnownAddresses) -> Self {
        let time = tfs.iter().filter_map(|tf| tf.timestamp).max().unwrap_or_else(Utc::now);
        let mut event = Self {
            id: next_event_id(),
            time,
            amount: Decimal::ZERO,
            tfs,
            buy_usd: Decimal::ZERO,
            sell_usd: Decimal::ZERO,
            lp_usd: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            last_price: Decimal::ZERO,
            truncated: 0,
        };
        event.recompute(registry);
        event
    }

    fn recompute(&mut self, registry: &KnownAddresses) {
        self.amount = self.tfs.iter().map(|tf| tf.value(false)).sum();
        let aggr = aggregate_dex_trades(&self.tfs, registry);
        self.buy_usd = aggr.buy_usd;
        self.sell_usd = aggr.sell_usd;
        self.lp_usd = aggr.lp_usd;
        self.avg_price = aggr.avg_price;
        if let Some(price) = self.tfs.iter().rev().filter_map(|tf| tf.meta.usd_price).find(|p| !p.is_zero()) {
            self.last_price = price;
        }
    }

    /// Only already-aggregated events merge
    pub fn can_join(&self, other: &DexEvent) -> bool {
        self.tfs.len() > 1 && other.tfs.len() > 1
    }

    pub fn join(&mut self, other: &DexEvent, registry: &KnownAddresses) {
        extend_unique(&mut self.tfs, &other.tfs);
        self.time = self.time.max(other.time);
        self.recompute(registry);
    }
}

/// Termination of an identity above the notify thresholds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillEvent {
    pub id: u64,
    pub time: DateTime<Utc>,
    pub by: String,
    pub killed: String,
    pub stake: Decimal,
    pub age: u64,
    pub pool: Option<String>,
    pub tfs: Vec<Transfer>,
}

impl KillEvent {
    pub fn from_tf(tf: &Transfer) -> Result<Self, ProcessingError> {
        let killed = tf
            .meta
            .killed_identity
            .clone()
            .ok_or_else(|| ProcessingError::UnexpectedShape(format!("kill {} without killed identity", tf.hash)))?;
        Ok(Self {
            id: next_event_id(),
            time: tf.time_or_epoch(),
            by: tf.signer.clone().unwrap_or_default(),
            killed,
            stake: tf.value(true),
            age: tf.meta.age.unwrap_or(0),
            pool: tf.meta.pool.clone(),
            tfs: vec![tf.clone()],
        })
    }
}

/// Delegation pool membership change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolAction {
    Kill,
    Delegate,
    Undelegate,
}

impl PoolAction {
    pub fn from_tags(tf: &Transfer) -> Option<PoolAction> {
        if tf.has_any_tag(&KILL_TAGS) {
            Some(PoolAction::Kill)
        } else if tf.has_tag(Tag::Delegate) {
            Some(PoolAction::Delegate)
        } else if tf.has_tag(Tag::Undelegate) {
            Some(PoolAction::Undelegate)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PoolAction::Kill => "kill",
            PoolAction::Delegate => "delegate",
            PoolAction::Undelegate => "undelegate",
        }
    }
}

/// One identity's pool action, only published batched in a `MassPoolEvent`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolEvent {
    pub id: u64,
    pub time: DateTime<Utc>,
    pub subtype: PoolAction,
    /// Affected identity; for kills this is the killed identity, not the signer
    pub addr: String,
    pub by: String,
    pub stake: Decimal,
    pub age: u64,
    pub pool: String,
    pub tfs: Vec<Transfer>,
}

impl PoolEvent {
    pub fn from_tf(tf: &Transfer, subtype: PoolAction, age: Option<u64>, stake: Option<Decimal>) -> Result<Self, ProcessingError> {
        let pool = tf
            .meta
            .pool
            .clone()
            .ok_or_else(|| ProcessingError::UnexpectedShape(format!("pool action {} without pool", tf.hash)))?;
        let signer = tf.signer.clone().unwrap_or_default();
        let addr = match subtype {
            PoolAction::Kill => tf.meta.killed_identity.clone().unwrap_or_else(|| signer.clone()),
            _ => signer.clone(),
        };

        Ok(Self {
            id: next_event_id(),
            time: tf.time_or_epoch(),
            subtype,
            addr,
            by: signer,
            stake: stake.filter(|s| !s.is_zero()).unwrap_or_else(|| tf.value(true)),
            age: age.filter(|a| *a != 0).or(tf.meta.age).unwrap_or(0),
            pool,
            tfs: vec![tf.clone()],
        })
    }

    fn key(&self) -> (&str, Option<&str>) {
        (self.addr.as_str(), self.tfs.first().map(|tf| tf.hash.as_str()))
    }
}

/// Many identities doing the same pool action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MassPoolEvent {
    pub id: u64,
    pub subtype: PoolAction,
    pub pool: String,
    pub count: usize,
    pub stake: Decimal,
    pub age: u64,
    pub changes: Vec<PoolEvent>,
}

impl MassPoolEvent {
    pub fn new(subtype: PoolAction, pool: &str, changes: Vec<PoolEvent>) -> Self {
        let mut event = Self {
            id: next_event_id(),
            subtype,
            pool: pool.to_string(),
            count: 0,
            stake: Decimal::ZERO,
            age: 0,
            changes,
        };
        event.recompute();
        event
    }

    fn recompute(&mut self) {
        self.count = self.changes.len();
        self.stake = self.changes.iter().map(|c| c.stake).sum();
        self.age = self.changes.iter().map(|c| c.age).sum();
    }

    pub fn can_join(&self, pool: &str, subtype: PoolAction) -> bool {
        self.pool == pool && self.subtype == subtype
    }

    pub fn join<'a, I>(&mut self, changes: I)
    where
        I: IntoIterator<Item = &'a PoolEvent>,
    {
        for change in changes {
            if !self.changes.iter().any(|c| c.key() == change.key()) {
                self.changes.push(change.clone());
            }
        }
        self.recompute();
    }
}

/// An identity's stake crossed a club step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClubEvent {
    pub id: u64,
    pub addr: String,
    pub stake: Decimal,
    pub club: Decimal,
    pub rank: u64,
}

impl ClubEvent {
    pub fn new(addr: &str, stake: Decimal, club: Decimal, rank: u64) -> Self {
        Self {
            id: next_event_id(),
            addr: addr.to_string(),
            stake,
            club,
            rank,
        }
    }

    /// Club size with three significant digits and a K/M/B/T suffix
    pub fn club_str(&self) -> String {
        let club: f64 = self.club.to_string().parse().unwrap_or(0.0);
        let mut club: f64 = format!("{:.2e}", club).parse().unwrap_or(club);
        let mut magnitude = 0;
        while club.abs() >= 1000.0 && magnitude < 4 {
            magnitude += 1;
            club /= 1000.0;
        }
        let rounded = (club * 1000.0).round() / 1000.0;
        format!("{}{}", rounded, ["", "K", "M", "B", "T"][magnitude])
    }
}

/// New chain height, forwarded for presence updates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEvent {
    pub id: u64,
    pub chain: Chain,
    pub height: u64,
}

impl BlockEvent {
    pub fn new(chain: Chain, height: u64) -> Self {
        Self {
            id: next_event_id(),
            chain,
            height,
        }
    }
}

/// Chain and market activity over a period
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsEvent {
    pub id: u64,
    /// Seconds
    pub period: u64,
    pub transfer_count: usize,
    pub trade_count: usize,
    pub invites_issued: usize,
    pub invites_activated: usize,
    pub flips_submitted: usize,
    pub identities_killed: usize,
    pub contract_calls: usize,
    pub bridged_to_bsc: Decimal,
    pub bridged_from_bsc: Decimal,
    pub staked: Decimal,
    pub unstaked: Decimal,
    pub burned: Decimal,
    /// Net USD moved into liquidity pools
    pub lp_usd: Decimal,
    pub markets: Vec<MarketStats>,
}

/// Largest transfers of a period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopEvent {
    pub id: u64,
    pub period: u64,
    pub tfs: Vec<Transfer>,
    pub total_usd_value: Decimal,
    #[serde(default)]
    pub long: bool,
    /// Items dropped past the line limit
    #[serde(default)]
    pub truncated: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopDexEvent {
    pub id: u64,
    pub period: u64,
    pub tfs: Vec<Transfer>,
    pub total_usd_value: Decimal,
    pub buy_usd: Decimal,
    pub sell_usd: Decimal,
    pub lp_usd: Decimal,
    pub total_idna: Decimal,
    #[serde(default)]
    pub long: bool,
    #[serde(default)]
    pub truncated: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopKillEvent {
    pub id: u64,
    pub period: u64,
    pub tfs: Vec<Transfer>,
    pub total_usd_value: Decimal,
    pub total_idna: Decimal,
    pub total_age: u64,
    #[serde(default)]
    pub long: bool,
    #[serde(default)]
    pub truncated: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeEntry {
    pub signer: String,
    pub stake: Decimal,
    pub stake_usd: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopStakeEvent {
    pub id: u64,
    pub period: u64,
    pub identities: Vec<StakeEntry>,
    pub total_usd_value: Decimal,
    pub total_idna: Decimal,
    #[serde(default)]
    pub long: bool,
    #[serde(default)]
    pub truncated: usize,
}

/// Pool action counts per pool, largest first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatsEvent {
    pub id: u64,
    pub period: u64,
    pub killed: Vec<(String, u64)>,
    pub delegated: Vec<(String, u64)>,
    pub undelegated: Vec<(String, u64)>,
    #[serde(default)]
    pub long: bool,
}

impl PoolStatsEvent {
    pub fn len(&self) -> usize {
        self.killed.len().max(self.delegated.len()).max(self.undelegated.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Transfer(TransferEvent),
    /// Activity of a watched address class
    Interesting(TransferEvent),
    Dex(DexEvent),
    Kill(KillEvent),
    Pool(PoolEvent),
    MassPool(MassPoolEvent),
    Cex(CexEvent),
    Club(ClubEvent),
    Block(BlockEvent),
    Stats(StatsEvent),
    Top(TopEvent),
    TopDex(TopDexEvent),
    TopKill(TopKillEvent),
    TopStake(TopStakeEvent),
    PoolStats(PoolStatsEvent),
}

impl Event {
    pub fn id(&self) -> u64 {
        match self {
            Event::Transfer(e) | Event::Interesting(e) => e.id,
            Event::Dex(e) => e.id,
            Event::Kill(e) => e.id,
            Event::Pool(e) => e.id,
            Event::MassPool(e) => e.id,
            Event::Cex(e) => e.id,
            Event::Club(e) => e.id,
            Event::Block(e) => e.id,
            Event::Stats(e) => e.id,
            Event::Top(e) => e.id,
            Event::TopDex(e) => e.id,
            Event::TopKill(e) => e.id,
            Event::TopStake(e) => e.id,
            Event::PoolStats(e) => e.id,
        }
    }

    /// Serialized discriminant
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Transfer(_) => "transfer",
            Event::Interesting(_) => "interesting",
            Event::Dex(_) => "dex",
            Event::Kill(_) => "kill",
            Event::Pool(_) => "pool",
            Event::MassPool(_) => "mass_pool",
            Event::Cex(_) => "cex",
            Event::Club(_) => "club",
            Event::Block(_) => "block",
            Event::Stats(_) => "stats",
            Event::Top(_) => "top",
            Event::TopDex(_) => "top_dex",
            Event::TopKill(_) => "top_kill",
            Event::TopStake(_) => "top_stake",
            Event::PoolStats(_) => "pool_stats",
        }
    }

    pub fn is_pool_event(&self) -> bool {
        matches!(self, Event::Pool(_) | Event::MassPool(_))
    }

    pub fn can_join(&self, other: &Event) -> bool {
        match (self, other) {
            (Event::Transfer(a), Event::Transfer(b)) => a.can_join(b),
            (Event::Dex(a), Event::Dex(b)) => a.can_join(b),
            (Event::MassPool(a), Event::MassPool(b)) => a.can_join(&b.pool, b.subtype),
            (Event::MassPool(a), Event::Pool(b)) => a.can_join(&b.pool, b.subtype),
            (Event::Cex(_), Event::Cex(_)) => true,
            _ => false,
        }
    }

    /// Folds `other` into `self`; fails when the two cannot be merged
    pub fn join(&mut self, other: &Event, ctx: MergeContext<'_>) -> Result<(), ProcessingError> {
        if !self.can_join(other) {
            return Err(ProcessingError::UnexpectedShape(format!(
                "cannot join {} event into {} event",
                other.kind(),
                self.kind()
            )));
        }
        match (self, other) {
            (Event::Transfer(a), Event::Transfer(b)) => a.join(b),
            (Event::Dex(a), Event::Dex(b)) => a.join(b, ctx.registry),
            (Event::MassPool(a), Event::MassPool(b)) => a.join(&b.changes),
            (Event::MassPool(a), Event::Pool(b)) => a.join(std::iter::once(b)),
            (Event::Cex(a), Event::Cex(b)) => a.join(b, ctx.prices),
            _ => {}
        }
        Ok(())
    }

    /// Persisted form: embedded transfers are replaced by their hashes
    pub fn to_record(&self) -> Result<Value, ProcessingError> {
        let mut value = serde_json::to_value(self).map_err(|e| ProcessingError::UnexpectedShape(e.to_string()))?;
        strip_transfers(&mut value);
        Ok(value)
    }

    /// Loads a persisted event, resolving transfer hashes through the store
    pub fn from_record(mut record: Value, store: &dyn BackingStore) -> Result<Event, IndexerError> {
        resolve_transfers(&mut record, store)?;
        serde_json::from_value(record)
            .map_err(|e| IndexerError::Processing(ProcessingError::UnexpectedShape(format!("event record: {}", e))))
    }
}

fn strip_transfers(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                match item {
                    Value::Array(tfs) if key == "tfs" => {
                        for tf in tfs.iter_mut() {
                            if let Some(hash) = tf.get("hash").cloned() {
                                *tf = hash;
                            }
                        }
                    }
                    _ => strip_transfers(item),
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(strip_transfers),
        _ => {}
    }
}

fn resolve_transfers(value: &mut Value, store: &dyn BackingStore) -> Result<(), IndexerError> {
    match value {
        Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                match item {
                    Value::Array(hashes) if key == "tfs" => {
                        let wanted: Vec<String> = hashes.iter().filter_map(|h| h.as_str().map(str::to_string)).collect();
                        if wanted.len() != hashes.len() {
                            return Err(IndexerError::Processing(ProcessingError::UnexpectedShape(
                                "transfer reference is not a hash".to_string(),
                            )));
                        }
                        let found = store.get_transfers_by_hash(&wanted)?;
                        let mut resolved = Vec::with_capacity(found.len());
                        for (hash, tf) in wanted.iter().zip(found) {
                            let tf = tf.ok_or_else(|| {
                                IndexerError::Processing(ProcessingError::MissingTransfer(hash.clone()))
                            })?;
                            resolved.push(tf.to_record()?);
                        }
                        *hashes = resolved;
                    }
                    _ => resolve_transfers(item, store)?,
                }
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                resolve_transfers(item, store)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AddressType, KnownAddress};
    use chrono::TimeZone;
    use std::str::FromStr;

    const POOL: &str = "0xpool";

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn registry() -> KnownAddresses {
        KnownAddresses::from_entries(vec![(POOL.to_string(), KnownAddress::new(AddressType::Pool))])
    }

    fn send(hash: &str, from: &str, to: &str, amount: &str, ts: i64) -> Transfer {
        let mut tf = Transfer::new(hash, Chain::Idena, ts as u64, 0);
        tf.changes = Transfer::create_changes(from, Some(to), dec(amount));
        tf.signer = Some(from.to_string());
        tf.timestamp = Some(Utc.timestamp_opt(ts, 0).unwrap());
        tf
    }

    fn dex(hash: &str, buy: bool, amount: &str, usd: &str, price: &str) -> Transfer {
        let mut tf = Transfer::new(hash, Chain::Bsc, 1, 0);
        if buy {
            tf.changes.add(POOL, -dec(amount));
            tf.changes.add("0xtrader", dec(amount));
            tf.tags.extend([Tag::Dex, Tag::DexBuy]);
        } else {
            tf.changes.add("0xtrader", -dec(amount));
            tf.changes.add(POOL, dec(amount));
            tf.tags.extend([Tag::Dex, Tag::DexSell]);
        }
        tf.meta.usd_value = Some(dec(usd));
        tf.meta.usd_price = Some(dec(price));
        tf.timestamp = Some(Utc.timestamp_opt(1_000, 0).unwrap());
        tf
    }

    #[test]
    fn test_event_ids_strictly_increase() {
        let ids: Vec<u64> = (0..100).map(|_| next_event_id()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_transfer_event_join_by_same_sender() {
        let a = TransferEvent::new("0xa", dec("60"), Utc::now(), vec![send("0x1", "0xa", "0xb", "30", 1), send("0x2", "0xa", "0xc", "30", 2)]);
        let b = TransferEvent::new("0xa", dec("50"), Utc::now(), vec![send("0x3", "0xa", "0xd", "50", 3)]);
        assert!(a.can_join(&b));

        let mut joined = a.clone();
        joined.join(&b);
        assert_eq!(joined.amount, dec("110"));
        assert_eq!(joined.tfs.len(), 3);
        assert!(!joined.recv);
        assert_eq!(joined.by, "0xa");
    }

    #[test]
    fn test_transfer_event_join_becomes_receive() {
        let mut a = TransferEvent::new("0xa", dec("10"), Utc::now(), vec![send("0x1", "0xa", "0xz", "10", 1)]);
        let b = TransferEvent::new("0xb", dec("20"), Utc::now(), vec![send("0x2", "0xb", "0xz", "20", 2)]);
        assert!(a.can_join(&b));

        a.join(&b);
        assert!(a.recv);
        assert_eq!(a.by, "0xz");
        assert_eq!(a.amount, dec("30"));
    }

    #[test]
    fn test_transfer_event_join_never_duplicates() {
        let tf = send("0x1", "0xa", "0xz", "10", 1);
        let mut a = TransferEvent::new("0xa", dec("10"), Utc::now(), vec![tf.clone()]);
        let b = TransferEvent::new("0xa", dec("10"), Utc::now(), vec![tf]);
        a.join(&b);
        assert_eq!(a.tfs.len(), 1);
        assert_eq!(a.amount, dec("10"));
    }

    #[test]
    fn test_dex_join_is_order_independent() {
        let registry = registry();
        let a = DexEvent::from_tfs(vec![dex("0x1", true, "100", "5", "0.05"), dex("0x2", false, "50", "2", "0.04")], &registry);
        let b = DexEvent::from_tfs(vec![dex("0x3", true, "200", "10", "0.05"), dex("0x4", false, "20", "1", "0.05")], &registry);
        assert!(a.can_join(&b));

        let mut ab = a.clone();
        ab.join(&b, &registry);
        let mut ba = b.clone();
        ba.join(&a, &registry);

        assert_eq!(ab.buy_usd, ba.buy_usd);
        assert_eq!(ab.sell_usd, ba.sell_usd);
        assert_eq!(ab.avg_price, ba.avg_price);
        assert_eq!(ab.buy_usd, dec("15"));
        assert_eq!(ab.amount, dec("370"));
    }

    #[test]
    fn test_single_dex_transfer_does_not_join() {
        let registry = registry();
        let a = DexEvent::from_tfs(vec![dex("0x1", true, "100", "5", "0.05")], &registry);
        let b = DexEvent::from_tfs(vec![dex("0x3", true, "200", "10", "0.05"), dex("0x4", false, "20", "1", "0.05")], &registry);
        assert!(!a.can_join(&b));
        assert_eq!(a.last_price, dec("0.05"));
    }

    #[test]
    fn test_mass_pool_join_sums() {
        let mut kill = send("0xk1", "0xkilled1", "0xkilled1", "0", 1);
        kill.changes = Transfer::create_changes("0xkilled1", None, dec("-1"));
        kill.tags.insert(Tag::Kill);
        kill.meta.pool = Some("0xpool".to_string());
        kill.meta.killed_identity = Some("0xkilled1".to_string());
        kill.meta.age = Some(4);

        let first = PoolEvent::from_tf(&kill, PoolAction::Kill, None, None).unwrap();
        assert_eq!(first.addr, "0xkilled1");
        assert_eq!(first.stake, dec("1"));

        let mut mass = MassPoolEvent::new(PoolAction::Kill, "0xpool", vec![first.clone()]);
        let mut second = first.clone();
        second.addr = "0xkilled2".to_string();
        second.stake = dec("2");
        second.age = 5;

        let mut event = Event::MassPool(mass.clone());
        event.join(&Event::Pool(second.clone()), MergeContext { registry: &registry(), prices: &PriceBook::default() }).unwrap();
        mass.join([&second, &first]);

        for merged in [&mass, match &event { Event::MassPool(m) => m, _ => unreachable!() }] {
            assert_eq!(merged.count, 2);
            assert_eq!(merged.stake, dec("3"));
            assert_eq!(merged.age, 9);
        }
    }

    #[test]
    fn test_join_rejects_mismatched_kinds() {
        let mut block = Event::Block(BlockEvent::new(Chain::Bsc, 1));
        let other = Event::Block(BlockEvent::new(Chain::Bsc, 2));
        let result = block.join(&other, MergeContext { registry: &registry(), prices: &PriceBook::default() });
        assert!(result.is_err());
    }

    #[test]
    fn test_club_str() {
        let club = |v: i64| ClubEvent::new("0xa", Decimal::ZERO, Decimal::from(v), 1).club_str();
        assert_eq!(club(50_000), "50K");
        assert_eq!(club(500_000), "500K");
        assert_eq!(club(2_500_000), "2.5M");
        assert_eq!(club(10_000_000), "10M");
        assert_eq!(club(999), "999");
    }

    #[test]
    fn test_record_replaces_transfers_with_hashes() {
        let event = Event::Transfer(TransferEvent::new("0xa", dec("10"), Utc::now(), vec![send("0x1", "0xa", "0xb", "10", 1)]));
        let record = event.to_record().unwrap();
        assert_eq!(record["type"], "transfer");
        assert_eq!(record["tfs"], serde_json::json!(["0x1"]));

        let mut pool = send("0xd", "0xa", "0xa", "0", 1);
        pool.tags.insert(Tag::Delegate);
        pool.meta.pool = Some("0xpool".to_string());
        let change = PoolEvent::from_tf(&pool, PoolAction::Delegate, Some(3), Some(dec("100"))).unwrap();
        let mass = Event::MassPool(MassPoolEvent::new(PoolAction::Delegate, "0xpool", vec![change]));
        let record = mass.to_record().unwrap();
        assert_eq!(record["type"], "mass_pool");
        assert_eq!(record["changes"][0]["tfs"], serde_json::json!(["0xd"]));
        assert_eq!(record["changes"][0]["subtype"], "delegate");
    }
}
