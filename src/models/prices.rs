use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub const NATIVE_PRICE_ID: &str = "cg:idena";

const DEFAULT_PRICES: [(&str, i64, u32); 5] = [
    ("cg:bitcoin", 22_000, 0),
    ("cg:idena", 35, 3),
    ("cg:binancecoin", 300, 0),
    ("cg:binance-usd", 1, 0),
    ("cg:tether", 1, 0),
];

/// Live price source id to USD mapping.
///
/// Clones share the same map; an embedding application updates it, the pipeline
/// only reads.
#[derive(Debug, Clone)]
pub struct PriceBook {
    prices: Arc<RwLock<HashMap<String, Decimal>>>,
}

impl PriceBook {
    pub fn empty() -> Self {
        Self {
            prices: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_prices<I>(prices: I) -> Self
    where
        I: IntoIterator<Item = (String, Decimal)>,
    {
        let book = Self::empty();
        for (id, price) in prices {
            book.set(&id, price);
        }
        book
    }

    pub fn get(&self, price_id: &str) -> Option<Decimal> {
        let prices = self.prices.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        prices.get(price_id).copied()
    }

    pub fn set(&self, price_id: &str, price: Decimal) {
        let mut prices = self.prices.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        prices.insert(price_id.to_string(), price);
    }

    /// Native coin price, zero when unknown
    pub fn native(&self) -> Decimal {
        self.get(NATIVE_PRICE_ID).unwrap_or(Decimal::ZERO)
    }
}

impl Default for PriceBook {
    fn default() -> Self {
        Self::with_prices(
            DEFAULT_PRICES
                .iter()
                .map(|(id, mantissa, scale)| (id.to_string(), Decimal::new(*mantissa, *scale))),
        )
    }
}
