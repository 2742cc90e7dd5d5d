use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::exchanges::Market;

/// A centralized exchange execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub market: Market,
    #[serde(rename = "timeStamp", with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    /// Base amount traded
    pub amount: Decimal,
    /// Price in quote currency
    pub price: Decimal,
    pub usd_value: Decimal,
    /// Price source id of the quote currency
    pub quote: String,
    pub buy: bool,
}

impl Trade {
    /// Quote currency amount of the trade
    pub fn quote_amount(&self) -> Decimal {
        self.amount * self.price
    }
}
