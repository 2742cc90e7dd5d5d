use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::changes::Changes;
use crate::error::ProcessingError;
use super::tags::{Tag, COUNTABLE_TAGS};

/// Source chain of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Bsc,
    Idena,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Bsc => "bsc",
            Chain::Idena => "idena",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liquidity added to (positive) or removed from (negative) a pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LpChange {
    pub idna: Decimal,
    pub token: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractCall {
    pub contract: String,
}

/// Enrichment attached by the watchers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usd_value: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usd_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_to: Option<String>,
    /// Delegation pool for pool actions and kills
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(default, rename = "killedIdentity", skip_serializing_if = "Option::is_none")]
    pub killed_identity: Option<String>,
    /// Identity age in epochs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cur_stake: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<ContractCall>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lp: BTreeMap<String, LpChange>,
    /// Paired-token amounts moved in or out of pools, by token contract
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub token: BTreeMap<String, Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lp_excess: Option<Decimal>,
}

impl Meta {
    /// Drops liquidity and token maps whose entries cancelled out
    pub fn strip_empty(&mut self) {
        self.lp.retain(|_, lp| !(lp.idna.is_zero() && lp.token.is_zero()));
        self.token.retain(|_, amount| !amount.is_zero());
    }
}

/// A balance-changing chain event: one transaction, or one group of logs
/// squashed into a single net movement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub hash: String,
    pub chain: Chain,
    #[serde(rename = "blockNumber")]
    pub block_number: u64,
    #[serde(rename = "logIndex")]
    pub log_index: u32,
    #[serde(rename = "timeStamp", with = "chrono::serde::ts_seconds_option")]
    pub timestamp: Option<DateTime<Utc>>,
    pub signer: Option<String>,
    pub changes: Changes,
    #[serde(default)]
    pub tags: BTreeSet<Tag>,
    #[serde(default)]
    pub meta: Meta,
}

impl Transfer {
    pub fn new(hash: &str, chain: Chain, block_number: u64, log_index: u32) -> Self {
        Self {
            hash: hash.to_string(),
            chain,
            block_number,
            log_index,
            timestamp: None,
            signer: None,
            changes: Changes::new(),
            tags: BTreeSet::new(),
            meta: Meta::default(),
        }
    }

    /// Changes for `value` moving from `from` to `to`.
    ///
    /// Both sides start at zero so a self-transfer nets out, and a missing
    /// receiver leaves only the outflow.
    pub fn create_changes(from: &str, to: Option<&str>, value: Decimal) -> Changes {
        let from = from.to_lowercase();
        let to = to.map(|t| t.to_lowercase());

        let mut changes = Changes::new();
        changes.add(&from, Decimal::ZERO);
        if let Some(to) = &to {
            changes.add(to, Decimal::ZERO);
        }
        changes.add(&from, -value);
        if let Some(to) = &to {
            changes.add(to, value);
        }
        changes
    }

    /// Total moved out of (or into, with `received`) the involved addresses
    pub fn value(&self, received: bool) -> Decimal {
        self.changes
            .iter()
            .map(|(_, v)| v)
            .filter(|v| if received { v.is_sign_positive() && !v.is_zero() } else { v.is_sign_negative() && !v.is_zero() })
            .sum::<Decimal>()
            .abs()
    }

    pub fn has_no_effect(&self) -> bool {
        self.changes.iter().all(|(_, v)| v.is_zero())
    }

    /// Addresses with a negative delta
    pub fn senders(&self) -> Vec<&str> {
        self.changes.iter().filter(|(_, v)| v.is_sign_negative() && !v.is_zero()).map(|(a, _)| a).collect()
    }

    /// Addresses with a positive delta
    pub fn receivers(&self) -> Vec<&str> {
        self.changes.iter().filter(|(_, v)| v.is_sign_positive() && !v.is_zero()).map(|(a, _)| a).collect()
    }

    /// First sender, falling back to the signer when nothing left any address
    pub fn sender(&self) -> Option<&str> {
        self.senders().first().copied().or(self.signer.as_deref())
    }

    pub fn receiver(&self) -> Option<&str> {
        self.receivers().first().copied()
    }

    pub fn should_store(&self) -> bool {
        self.tags.iter().any(|t| t.is_always_recorded()) || !self.has_no_effect()
    }

    pub fn has_tag(&self, tag: Tag) -> bool {
        self.tags.contains(&tag)
    }

    pub fn has_any_tag(&self, tags: &[Tag]) -> bool {
        tags.iter().any(|t| self.tags.contains(t))
    }

    /// True when every tag only feeds statistics
    pub fn is_countable_only(&self) -> bool {
        !self.tags.is_empty() && self.tags.iter().all(|t| COUNTABLE_TAGS.contains(t))
    }

    pub fn usd_value(&self) -> Decimal {
        self.meta.usd_value.unwrap_or(Decimal::ZERO)
    }

    pub fn time_or_epoch(&self) -> DateTime<Utc> {
        self.timestamp.unwrap_or_default()
    }

    /// Persisted JSON form
    pub fn to_record(&self) -> Result<serde_json::Value, ProcessingError> {
        serde_json::to_value(self).map_err(|e| ProcessingError::UnexpectedShape(format!("transfer {}: {}", self.hash, e)))
    }

    pub fn from_record(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}
