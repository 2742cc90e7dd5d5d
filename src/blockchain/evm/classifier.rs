use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};

use super::raw_log::{RawLog, LP_BURN_TOPIC, LP_MINT_TOPIC, NATIVE_DECIMALS, NULL_ADDRESS, TRANSFER_TOPIC};
use crate::error::ProcessingError;
use crate::logging::LogContext;
use crate::models::{
    calculate_usd_price, calculate_usd_value, AddressType, Changes, KnownAddresses, LpChange, Meta, PriceBook, Tag,
    Transfer, DEX_LP_TAGS, DEX_TRADE_TAGS,
};

/// Collapses the legs of one transaction into its net movement.
///
/// The earliest log is the base so the result sorts where the transaction
/// started; addresses that only relayed value drop out.
pub fn squash(mut tfs: Vec<Transfer>) -> Option<Transfer> {
    tfs.sort_by_key(|tf| tf.log_index);
    let mut iter = tfs.into_iter();
    let mut main = iter.next()?;

    let mut changes = Changes::new();
    for (addr, delta) in main.changes.iter() {
        if !delta.is_zero() {
            changes.add(addr, delta);
        }
    }
    for tf in iter {
        debug_assert_eq!(tf.hash, main.hash);
        for (addr, delta) in tf.changes.iter() {
            if !delta.is_zero() {
                changes.add(addr, delta);
            }
        }
    }
    changes.retain_non_zero();
    main.changes = changes;
    Some(main)
}

/// Splits a finalized block's logs into per-transaction groups, in log index order
pub fn group_by_transaction(mut logs: Vec<RawLog>) -> Vec<Vec<RawLog>> {
    logs.sort_by_key(|log| log.log_index);
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<RawLog>> = HashMap::new();
    for log in logs {
        if !groups.contains_key(&log.transaction_hash) {
            order.push(log.transaction_hash.clone());
        }
        groups.entry(log.transaction_hash.clone()).or_default().push(log);
    }
    order.into_iter().filter_map(|hash| groups.remove(&hash)).collect()
}

/// Turns a transaction's logs into one tagged transfer
pub struct TxClassifier<'a> {
    registry: &'a KnownAddresses,
    prices: &'a PriceBook,
    token_contract: String,
}

impl<'a> TxClassifier<'a> {
    pub fn new(registry: &'a KnownAddresses, prices: &'a PriceBook, token_contract: &str) -> Self {
        Self {
            registry,
            prices,
            token_contract: token_contract.to_lowercase(),
        }
    }

    fn is_pool(&self, addr: &str) -> bool {
        self.registry.is_type(addr, AddressType::Pool)
    }

    /// Classifies one transaction. `None` when none of its logs moved the tracked token.
    pub fn classify(
        &self,
        logs: &[RawLog],
        timestamp: Option<DateTime<Utc>>,
        signer: &str,
    ) -> Result<Option<Transfer>, ProcessingError> {
        let mut tags: BTreeSet<Tag> = BTreeSet::new();
        let mut meta = Meta::default();
        let mut tfs = Vec::new();

        for log in logs {
            match log.topic(0) {
                Some(TRANSFER_TOPIC) if log.address.eq_ignore_ascii_case(&self.token_contract) => {
                    let tf = log.to_transfer(timestamp, signer)?;
                    if !tf.should_store() {
                        continue;
                    }
                    for (addr, amount) in tf.changes.iter() {
                        if self.is_pool(addr) {
                            tags.insert(Tag::Dex);
                            if amount.is_sign_negative() && !amount.is_zero() {
                                tags.insert(Tag::DexBuy);
                            } else if amount.is_sign_positive() && !amount.is_zero() {
                                tags.insert(Tag::DexSell);
                            }
                        } else if addr == NULL_ADDRESS {
                            if amount.is_sign_negative() && !amount.is_zero() {
                                tags.insert(Tag::BridgeMint);
                            } else if amount.is_sign_positive() && !amount.is_zero() {
                                tags.insert(Tag::BridgeBurn);
                            }
                        }
                    }
                    tfs.push(tf);
                }
                Some(TRANSFER_TOPIC) => self.record_token_leg(log, &mut meta)?,
                Some(topic @ (LP_MINT_TOPIC | LP_BURN_TOPIC)) if self.is_pool(&log.address) => {
                    let idna = log.data_word(0, NATIVE_DECIMALS)?;
                    let token = log.data_word(1, NATIVE_DECIMALS)?;
                    let pool = log.address.to_lowercase();
                    let lp = meta.lp.entry(pool).or_insert_with(LpChange::default);
                    if topic == LP_MINT_TOPIC {
                        lp.idna += idna;
                        lp.token += token;
                        tags.insert(Tag::DexProvideLp);
                    } else {
                        lp.idna -= idna;
                        lp.token -= token;
                        tags.insert(Tag::DexWithdrawLp);
                    }
                }
                _ => {
                    LogContext::new("evm_classifier", "classify")
                        .with_transaction_hash(&log.transaction_hash)
                        .with_metadata("address", serde_json::json!(log.address))
                        .warn("Unknown log");
                }
            }
        }

        if tags.contains(&Tag::DexProvideLp) && tags.contains(&Tag::DexWithdrawLp) {
            LogContext::new("evm_classifier", "classify")
                .with_transaction_hash(&logs[0].transaction_hash)
                .warn("Both mint and burn in one transaction");
        }
        if tags.contains(&Tag::DexBuy) && tags.contains(&Tag::DexSell) {
            tags.remove(&Tag::DexBuy);
            tags.remove(&Tag::DexSell);
            tags.insert(Tag::DexArb);
        }
        if tags.is_empty() {
            tags.insert(Tag::Send);
        }

        let Some(mut squashed) = squash(tfs) else {
            if let Some(first) = logs.first() {
                LogContext::new("evm_classifier", "classify")
                    .with_transaction_hash(&first.transaction_hash)
                    .debug("No token movement despite logs");
            }
            return Ok(None);
        };

        if tags.iter().any(|t| DEX_LP_TAGS.contains(t)) {
            for tag in DEX_TRADE_TAGS {
                tags.remove(&tag);
            }
            // Deposits and withdrawals in a lopsided ratio swap the difference through the pool
            let excess: Decimal = meta
                .lp
                .iter()
                .map(|(pool, lp)| lp.idna - squashed.changes.get(pool).unwrap_or(Decimal::ZERO))
                .sum();
            if !excess.is_zero() {
                meta.lp_excess = Some(excess);
                if excess.is_sign_positive() {
                    tags.insert(Tag::DexBuy);
                } else {
                    tags.insert(Tag::DexSell);
                }
            }
        }

        meta.strip_empty();
        squashed.tags = tags;
        squashed.meta = meta;
        self.annotate_usd(&mut squashed);
        Ok(Some(squashed))
    }

    /// Paired-token movement into or out of a pool
    fn record_token_leg(&self, log: &RawLog, meta: &mut Meta) -> Result<(), ProcessingError> {
        let token = log.address.to_lowercase();
        let decimals = match self.registry.get(&token) {
            Some(entry) if entry.kind == AddressType::Token => entry.decimals.unwrap_or(NATIVE_DECIMALS),
            _ => {
                LogContext::new("evm_classifier", "record_token_leg")
                    .with_transaction_hash(&log.transaction_hash)
                    .with_metadata("token", serde_json::json!(token))
                    .warn("Transfer log of unknown token, skipping");
                return Ok(());
            }
        };

        let from = log.topic_as_addr(1)?;
        let to = log.topic_as_addr(2)?;
        let amount = log.data_word(0, decimals)?;
        if self.is_pool(&from) {
            *meta.token.entry(token).or_insert(Decimal::ZERO) -= amount;
        } else if self.is_pool(&to) {
            *meta.token.entry(token).or_insert(Decimal::ZERO) += amount;
        } else {
            LogContext::new("evm_classifier", "record_token_leg")
                .with_transaction_hash(&log.transaction_hash)
                .warn("Token transfer not related to any pool");
        }
        Ok(())
    }

    /// Best-effort USD value and implied price
    pub fn annotate_usd(&self, tf: &mut Transfer) {
        match calculate_usd_value(tf, self.prices, self.registry) {
            Ok(value) => tf.meta.usd_value = Some(value),
            Err(e) => {
                LogContext::new("evm_classifier", "annotate_usd")
                    .with_transaction_hash(&tf.hash)
                    .error(&format!("USD value failed: {}", e));
                return;
            }
        }

        if !tf.has_tag(Tag::Dex) || tf.usd_value().is_zero() {
            return;
        }
        match calculate_usd_price(tf, self.prices, self.registry) {
            Ok(price) => tf.meta.usd_price = price,
            Err(e) => LogContext::new("evm_classifier", "annotate_usd")
                .with_transaction_hash(&tf.hash)
                .error(&format!("USD price failed: {}", e)),
        }
    }
}
