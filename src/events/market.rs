use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::exchanges::Market;
use crate::logging::LogContext;
use crate::models::PriceBook;

/// Formats with `,` thousands separators and a fixed number of decimals
pub fn format_grouped(value: Decimal, decimals: u32) -> String {
    let rounded = value.round_dp_with_strategy(decimals, RoundingStrategy::MidpointNearestEven);
    let text = format!("{:.*}", decimals as usize, rounded.abs());
    let (int_part, frac_part) = match text.split_once('.') {
        Some((i, f)) => (i.to_string(), Some(f.to_string())),
        None => (text.clone(), None),
    };

    let mut grouped = String::new();
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let sign = if rounded.is_sign_negative() && !rounded.is_zero() { "-" } else { "" };
    match frac_part {
        Some(frac) => format!("{}{}.{}", sign, grouped, frac),
        None => format!("{}{}", sign, grouped),
    }
}

/// Per-market volume over a period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketStats {
    pub market: Market,
    /// Price source id of the quote currency
    pub quote_currency: String,
    pub buy: Decimal,
    pub sell: Decimal,
    pub buy_usd: Decimal,
    pub sell_usd: Decimal,
    pub quote_amount: Decimal,
    /// Human readable average price, empty until calculated
    #[serde(default)]
    pub avg_price: String,
    #[serde(default)]
    pub avg_price_usd: Decimal,
}

impl MarketStats {
    pub fn new(market: Market) -> Self {
        Self {
            market,
            quote_currency: market.quote().to_string(),
            buy: Decimal::ZERO,
            sell: Decimal::ZERO,
            buy_usd: Decimal::ZERO,
            sell_usd: Decimal::ZERO,
            quote_amount: Decimal::ZERO,
            avg_price: String::new(),
            avg_price_usd: Decimal::ZERO,
        }
    }

    pub fn volume_idna(&self) -> Decimal {
        self.buy + self.sell
    }

    pub fn volume_usd(&self) -> Decimal {
        self.buy_usd + self.sell_usd
    }

    pub fn add(&mut self, other: &MarketStats) {
        self.buy += other.buy;
        self.sell += other.sell;
        self.buy_usd += other.buy_usd;
        self.sell_usd += other.sell_usd;
        self.quote_amount += other.quote_amount;
    }

    pub fn calculate_average_price(&mut self, prices: &PriceBook) {
        let volume = self.volume_idna();
        if self.quote_amount.is_zero() || volume.is_zero() {
            return;
        }
        let avg_price = self.quote_amount / volume;
        let Some(quote_price) = prices.get(&self.quote_currency) else {
            LogContext::new("market_stats", "average_price")
                .with_metadata("quote", serde_json::json!(self.quote_currency))
                .warn("No price for quote currency");
            return;
        };

        match self.quote_currency.as_str() {
            "cg:bitcoin" => {
                self.avg_price_usd = avg_price * quote_price;
                self.avg_price = format!("{} sats", format_grouped(avg_price * Decimal::from(100_000_000), 1));
            }
            "cg:tether" | "cg:binance-usd" | "usd" => {
                self.avg_price_usd = avg_price;
                self.avg_price = format!("${}", format_grouped(avg_price, 3));
            }
            _ => {}
        }
    }
}

/// Sorts markets by native coin volume, largest first
pub fn sort_markets(markets: &mut [MarketStats]) {
    markets.sort_by(|a, b| b.volume_idna().cmp(&a.volume_idna()));
}

/// Centralized exchange volume burst
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CexEvent {
    pub id: u64,
    pub total_buy_val: Decimal,
    pub total_sell_val: Decimal,
    pub markets: Vec<MarketStats>,
}

impl CexEvent {
    pub fn new(total_buy_val: Decimal, total_sell_val: Decimal, mut markets: Vec<MarketStats>) -> Self {
        sort_markets(&mut markets);
        Self {
            id: super::next_event_id(),
            total_buy_val,
            total_sell_val,
            markets,
        }
    }

    pub fn market(&self, market: Market) -> Option<&MarketStats> {
        self.markets.iter().find(|m| m.market == market)
    }

    pub fn join(&mut self, other: &CexEvent, prices: &PriceBook) {
        self.total_buy_val += other.total_buy_val;
        self.total_sell_val += other.total_sell_val;
        for stats in &other.markets {
            match self.markets.iter_mut().find(|m| m.market == stats.market) {
                Some(existing) => existing.add(stats),
                None => {
                    let mut added = MarketStats::new(stats.market);
                    added.add(stats);
                    self.markets.push(added);
                }
            }
        }
        for stats in self.markets.iter_mut() {
            stats.calculate_average_price(prices);
        }
        sort_markets(&mut self.markets);
    }
}
