use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::time::Duration;

use super::DbError;
use crate::error::IndexerError;
use crate::events::Event;
use crate::models::{Chain, Identity, Trade, Transfer};

/// A persisted event record as stored, before its transfers are resolved
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub id: u64,
    pub channel: String,
    pub message: String,
    pub record: serde_json::Value,
}

/// Append/query interface the pipeline needs from its storage.
///
/// Writes are upserts keyed by (chain, block, log index) for transfers and
/// (trade id, market) for trades, so concurrent callers never contend on a key.
pub trait BackingStore: Send + Sync {
    fn insert_transfers(&self, transfers: &[Transfer]) -> Result<usize, DbError>;

    fn insert_trades(&self, trades: &[Trade]) -> Result<usize, DbError>;

    /// Transfers with a timestamp after `after`, in time, block and log order
    fn get_recent_transfers(&self, after: DateTime<Utc>) -> Result<Vec<Transfer>, DbError>;

    /// Trades after `after`, which is clamped to at most `window` ago
    fn get_recent_trades(&self, after: DateTime<Utc>, window: Duration) -> Result<Vec<Trade>, DbError>;

    fn get_transfer_by_hash(&self, hash: &str) -> Result<Option<Transfer>, DbError>;

    /// One entry per requested hash, `None` where unknown
    fn get_transfers_by_hash(&self, hashes: &[String]) -> Result<Vec<Option<Transfer>>, DbError>;

    fn get_latest_block(&self, chain: Chain) -> Result<Option<u64>, DbError>;

    /// With `full` the stored set is replaced instead of merged
    fn insert_identities(&self, identities: &[Identity], full: bool) -> Result<usize, DbError>;

    fn get_identity(&self, address: &str) -> Result<Option<Identity>, DbError>;

    fn get_identities(&self) -> Result<Vec<Identity>, DbError>;

    fn count_identities_with_stake(&self, min_stake: Decimal) -> Result<u64, DbError>;

    fn insert_event(&self, channel: &str, message: &str, event: &Event) -> Result<(), DbError>;

    fn get_event(&self, id: u64) -> Result<Option<StoredEvent>, DbError>;
}

/// Reads an event back with its transfers resolved
pub fn load_event(store: &dyn BackingStore, id: u64) -> Result<Option<(StoredEvent, Event)>, IndexerError> {
    let Some(stored) = store.get_event(id)? else {
        return Ok(None);
    };
    let event = Event::from_record(stored.record.clone(), store)?;
    Ok(Some((stored, event)))
}
