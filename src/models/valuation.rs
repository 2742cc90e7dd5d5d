use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::prices::PriceBook;
use super::registry::{AddressType, KnownAddresses};
use super::tags::{Tag, DEX_LP_TAGS, DEX_TRADE_TAGS};
use super::transfer::Transfer;
use crate::error::ProcessingError;

fn price_of(prices: &PriceBook, price_id: Option<&str>, subject: &str) -> Result<Decimal, ProcessingError> {
    let price_id = price_id.ok_or_else(|| ProcessingError::UnknownToken(subject.to_string()))?;
    prices
        .get(price_id)
        .ok_or_else(|| ProcessingError::UnknownToken(format!("no price for {}", price_id)))
}

/// USD value of a transfer.
///
/// Liquidity events value both legs of each pool, trades value the paired-token
/// leg, everything else values the native amount moved.
pub fn calculate_usd_value(tf: &Transfer, prices: &PriceBook, registry: &KnownAddresses) -> Result<Decimal, ProcessingError> {
    let mut value = Decimal::ZERO;

    if !tf.has_tag(Tag::Dex) {
        return Ok(tf.value(false) * prices.native());
    }

    if tf.has_any_tag(&DEX_LP_TAGS) {
        for (pool, lp) in &tf.meta.lp {
            let token_price = price_of(prices, registry.pool_token_price_id(pool), pool)?;
            value += lp.token.abs() * token_price + lp.idna.abs() * prices.native();
        }
    } else if tf.has_tag(Tag::DexArb) {
        // Signed on purpose: an arbitrage round trip mostly cancels out
        for (token, change) in &tf.meta.token {
            value += *change * price_of(prices, registry.price_id(token), token)?;
        }
    } else if tf.has_any_tag(&DEX_TRADE_TAGS) {
        for (token, change) in &tf.meta.token {
            value += change.abs() * price_of(prices, registry.price_id(token), token)?;
        }
    }

    Ok(value)
}

/// Native coin price implied by a DEX transfer
pub fn calculate_usd_price(tf: &Transfer, prices: &PriceBook, registry: &KnownAddresses) -> Result<Option<Decimal>, ProcessingError> {
    if tf.has_any_tag(&DEX_LP_TAGS) {
        let Some((pool, lp)) = tf.meta.lp.iter().next() else {
            return Ok(None);
        };
        if lp.idna.is_zero() {
            return Ok(None);
        }
        let token_price = price_of(prices, registry.pool_token_price_id(pool), pool)?;
        return Ok(Some((lp.token * token_price / lp.idna).abs()));
    }

    if tf.has_any_tag(&DEX_TRADE_TAGS) {
        let value = tf.value(false);
        if let Some(usd_value) = tf.meta.usd_value {
            if !value.is_zero() {
                return Ok(Some(usd_value / value));
            }
        }
    }

    Ok(None)
}

/// Buy/sell/liquidity totals over a set of DEX transfers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DexAggregate {
    pub buy: Decimal,
    pub sell: Decimal,
    pub buy_usd: Decimal,
    pub sell_usd: Decimal,
    pub quote_amount: Decimal,
    pub lp_usd: Decimal,
    pub avg_price: Decimal,
}

impl DexAggregate {
    pub fn volume(&self) -> Decimal {
        self.buy + self.sell
    }

    pub fn volume_usd(&self) -> Decimal {
        self.buy_usd + self.sell_usd
    }
}

pub fn aggregate_dex_trades<'a, I>(tfs: I, registry: &KnownAddresses) -> DexAggregate
where
    I: IntoIterator<Item = &'a Transfer>,
{
    let mut m = DexAggregate::default();

    for tf in tfs {
        let usd_value = tf.usd_value();
        if tf.has_any_tag(&DEX_LP_TAGS) {
            let lp_sign = if tf.has_tag(Tag::DexWithdrawLp) { Decimal::NEGATIVE_ONE } else { Decimal::ONE };
            match tf.meta.lp_excess.filter(|excess| !excess.is_zero()) {
                Some(excess) => {
                    // The excess part of the liquidity event was an implicit swap
                    let traded_usd = excess.abs() * tf.meta.usd_price.unwrap_or(Decimal::ZERO);
                    let lp_usd = usd_value - traded_usd;
                    m.quote_amount += traded_usd;
                    if excess.is_sign_positive() {
                        m.buy += excess;
                        m.buy_usd += traded_usd;
                    } else {
                        m.sell += excess.abs();
                        m.sell_usd += traded_usd;
                    }
                    m.lp_usd += lp_usd * lp_sign;
                }
                None => m.lp_usd += usd_value * lp_sign,
            }
        } else if tf.has_any_tag(&DEX_TRADE_TAGS) {
            let is_buy = tf.has_tag(Tag::DexBuy);
            m.quote_amount += usd_value;
            if is_buy {
                m.buy_usd += usd_value;
            } else {
                m.sell_usd += usd_value;
            }
            for (addr, amount) in tf.changes.iter() {
                if registry.is_type(addr, AddressType::Pool) {
                    if is_buy {
                        m.buy -= amount;
                    } else {
                        m.sell += amount;
                    }
                }
            }
        }
    }

    let volume = m.volume();
    m.avg_price = if volume.is_zero() { Decimal::ZERO } else { m.quote_amount / volume };
    m
}
