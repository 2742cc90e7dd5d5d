use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Cached account-chain identity.
///
/// Only the fields the pipeline reads are kept; the node returns many more.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub address: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub stake: Decimal,
    #[serde(default)]
    pub age: u64,
    #[serde(default)]
    pub delegatee: Option<String>,
    #[serde(rename = "_fetchTime", default, with = "chrono::serde::ts_seconds_option")]
    pub fetch_time: Option<DateTime<Utc>>,
}

impl Identity {
    pub fn new(address: &str, stake: Decimal, age: u64) -> Self {
        Self {
            address: address.to_lowercase(),
            state: "Human".to_string(),
            stake,
            age,
            delegatee: None,
            fetch_time: None,
        }
    }

    /// The node reports unknown addresses as "Undefined"
    pub fn is_defined(&self) -> bool {
        !self.state.eq_ignore_ascii_case("undefined")
    }

    /// Fetched within `max_age_seconds` of `now`
    pub fn is_fresh(&self, now: DateTime<Utc>, max_age_seconds: u64) -> bool {
        match self.fetch_time {
            Some(fetched) => (now - fetched).num_seconds() < max_age_seconds as i64,
            None => false,
        }
    }

    /// Lowercases addresses so lookups are case-insensitive
    pub fn normalized(mut self) -> Self {
        self.address = self.address.to_lowercase();
        self.delegatee = self.delegatee.map(|d| d.to_lowercase()).filter(|d| !d.is_empty());
        self
    }
}
