use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;

use super::node::{NodeTx, TxReceipt};
use crate::database::BackingStore;
use crate::error::{IndexerError, ProcessingError};
use crate::logging::LogContext;
use crate::models::{
    calculate_usd_value, AddressType, Chain, ContractCall, KnownAddresses, PriceBook, Tag, Transfer,
};

/// Separator between the bridge payload prefix and the destination address
const BRIDGE_MARKER: &[u8] = b"BSCADDRESS";

/// A kill whose stake and age must come from the indexer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillEnrichment {
    pub epoch: u64,
    pub killed: String,
}

/// Outcome of classifying one account-chain transaction
#[derive(Debug, Default)]
pub struct Classification {
    pub transfer: Option<Transfer>,
    pub enrichment: Option<KillEnrichment>,
    /// Identity whose cached stake is stale after this transaction
    pub refresh: Option<String>,
}

impl Classification {
    fn skip() -> Self {
        Self::default()
    }

    fn transfer(tf: Transfer) -> Self {
        Self {
            transfer: Some(tf),
            ..Self::default()
        }
    }
}

/// Transfer for a node transaction, without tags
pub fn transfer_from_tx(tx: &NodeTx, to: Option<&str>, block_number: u64, index: u32) -> Transfer {
    let from = tx.from.as_deref().unwrap_or_default();
    let mut tf = Transfer::new(&tx.hash, Chain::Idena, block_number, index);
    tf.signer = tx.from.clone();
    tf.timestamp = Utc.timestamp_opt(tx.timestamp as i64, 0).single();
    tf.changes = Transfer::create_changes(from, to, tx.amount);
    tf
}

/// Destination address encoded in a bridge send payload
pub fn decode_bridge_destination(payload: &str) -> Result<String, ProcessingError> {
    let bytes = hex::decode(payload.trim_start_matches("0x"))
        .map_err(|e| ProcessingError::TransactionParsing(format!("bridge payload: {}", e)))?;
    let pos = bytes
        .windows(BRIDGE_MARKER.len())
        .position(|w| w == BRIDGE_MARKER)
        .ok_or_else(|| ProcessingError::TransactionParsing("bridge payload without destination marker".to_string()))?;
    let dest = std::str::from_utf8(&bytes[pos + BRIDGE_MARKER.len()..])
        .map_err(|e| ProcessingError::TransactionParsing(format!("bridge destination: {}", e)))?;
    if dest.is_empty() {
        return Err(ProcessingError::TransactionParsing("empty bridge destination".to_string()));
    }
    Ok(dest.to_lowercase())
}

/// Turns node transactions into tagged transfers.
///
/// Identity lookups go through the store, which the identity cacher keeps
/// current; kills of identities not fetched recently are handed back for
/// enrichment.
pub struct AccountClassifier<'a> {
    registry: &'a KnownAddresses,
    prices: &'a PriceBook,
    store: &'a dyn BackingStore,
    fresh_seconds: u64,
}

impl<'a> AccountClassifier<'a> {
    pub fn new(registry: &'a KnownAddresses, prices: &'a PriceBook, store: &'a dyn BackingStore, fresh_seconds: u64) -> Self {
        Self {
            registry,
            prices,
            store,
            fresh_seconds,
        }
    }

    /// `receipt` is required for contract transactions that did not come with one
    pub fn classify(
        &self,
        tx: &NodeTx,
        block_number: u64,
        index: u32,
        receipt: Option<&TxReceipt>,
        now: DateTime<Utc>,
    ) -> Result<Classification, IndexerError> {
        let Some(tag) = Tag::from_tx_type(&tx.tx_type) else {
            return Ok(Classification::skip());
        };

        let mut classification = match tag {
            Tag::Send => Classification::transfer(self.send(tx, block_number, index)),
            Tag::Delegate => {
                let mut tf = transfer_from_tx(tx, None, block_number, index);
                tf.tags.insert(Tag::Delegate);
                tf.meta.pool = tx.to.clone();
                Classification::transfer(tf)
            }
            Tag::Undelegate => self.undelegate(tx, block_number, index)?,
            Tag::Kill | Tag::KillDelegator => self.kill(tx, tag, block_number, index, now)?,
            Tag::Invite | Tag::Activation | Tag::SubmitFlip => {
                let mut tf = transfer_from_tx(tx, tx.to.as_deref(), block_number, index);
                tf.tags.insert(tag);
                Classification::transfer(tf)
            }
            Tag::ReplenishStake => self.replenish_stake(tx, block_number, index)?,
            Tag::Burn => {
                let mut tf = transfer_from_tx(tx, None, block_number, index);
                tf.tags.insert(Tag::Burn);
                Classification::transfer(tf)
            }
            Tag::DeployContract | Tag::CallContract => {
                match receipt.or(tx.receipt.as_ref()) {
                    Some(receipt) if receipt.success => {
                        let mut tf = transfer_from_tx(tx, tx.to.as_deref(), block_number, index);
                        tf.tags.insert(tag);
                        tf.meta.call = receipt.contract.as_ref().map(|c| ContractCall {
                            contract: c.to_lowercase(),
                        });
                        Classification::transfer(tf)
                    }
                    Some(_) => Classification::skip(),
                    None => {
                        return Err(IndexerError::Processing(ProcessingError::UnexpectedShape(format!(
                            "contract transaction {} without receipt",
                            tx.hash
                        ))))
                    }
                }
            }
            _ => Classification::skip(),
        };

        if let Some(tf) = classification.transfer.as_mut() {
            if tf.meta.usd_value.is_none() {
                match calculate_usd_value(tf, self.prices, self.registry) {
                    Ok(usd) => tf.meta.usd_value = Some(usd),
                    Err(e) => LogContext::new("account_classifier", "usd_value")
                        .with_transaction_hash(&tf.hash)
                        .warn(&format!("USD valuation failed: {}", e)),
                }
            }
        }
        Ok(classification)
    }

    fn send(&self, tx: &NodeTx, block_number: u64, index: u32) -> Transfer {
        let bridge = self.registry.addrs_of_type(AddressType::Bridge).into_iter().next();
        let mut tf = transfer_from_tx(tx, tx.to.as_deref(), block_number, index);

        match bridge {
            Some(bridge) if tx.to.as_deref() == Some(bridge.as_str()) => {
                match decode_bridge_destination(tx.payload.as_deref().unwrap_or_default()) {
                    Ok(dest) => {
                        tf.tags.insert(Tag::BridgeBurn);
                        tf.meta.bridge_to = Some(dest);
                    }
                    Err(e) => {
                        LogContext::new("account_classifier", "send")
                            .with_transaction_hash(&tx.hash)
                            .warn(&format!("Bridge decode failed, probably not a bridge transfer: {}", e));
                        tf.tags.insert(Tag::BridgeBurnWrong);
                    }
                }
            }
            Some(bridge) if tx.from.as_deref() == Some(bridge.as_str()) => {
                tf.tags.insert(Tag::BridgeMint);
            }
            _ => {
                tf.tags.insert(Tag::Send);
            }
        }
        tf
    }

    fn undelegate(&self, tx: &NodeTx, block_number: u64, index: u32) -> Result<Classification, IndexerError> {
        let from = tx.from.as_deref().unwrap_or_default();
        let delegatee = self.store.get_identity(from)?.and_then(|identity| identity.delegatee);
        let Some(pool) = delegatee else {
            LogContext::new("account_classifier", "undelegate")
                .with_transaction_hash(&tx.hash)
                .with_address(from)
                .warn("Undelegate without a cached delegatee");
            return Ok(Classification::skip());
        };

        let mut tf = transfer_from_tx(tx, None, block_number, index);
        tf.tags.insert(Tag::Undelegate);
        tf.meta.pool = Some(pool);
        Ok(Classification::transfer(tf))
    }

    /// Kills release the stake to the killed identity (or to the pool for
    /// `killDelegator`), so changes are inflows.
    fn kill(&self, tx: &NodeTx, tag: Tag, block_number: u64, index: u32, now: DateTime<Utc>) -> Result<Classification, IndexerError> {
        let killed = tx
            .killed_identity()
            .ok_or_else(|| ProcessingError::UnexpectedShape(format!("kill {} without killed identity", tx.hash)))?
            .to_string();
        let pool = if tag == Tag::KillDelegator { tx.from.clone() } else { None };

        let identity = self.store.get_identity(&killed)?;
        let mut classification = Classification {
            refresh: Some(killed.clone()),
            ..Classification::default()
        };

        let mut tf = match identity.filter(|i| i.is_fresh(now, self.fresh_seconds)) {
            Some(identity) => {
                let mut released = tx.clone();
                released.amount = identity.stake;
                let mut tf = transfer_from_tx(&released, None, block_number, index);
                tf.meta.age = Some(identity.age);
                tf.meta.pool = pool.or(identity.delegatee);
                tf.meta.usd_value = Some(identity.stake * self.prices.native());
                tf
            }
            None => {
                let mut tf = transfer_from_tx(tx, None, block_number, index);
                tf.meta.pool = pool;
                classification.enrichment = Some(KillEnrichment {
                    epoch: tx.epoch,
                    killed: killed.clone(),
                });
                tf
            }
        };
        tf.tags.insert(tag);
        tf.meta.killed_identity = Some(killed);
        tf.changes.negate();

        classification.transfer = Some(tf);
        Ok(classification)
    }

    fn replenish_stake(&self, tx: &NodeTx, block_number: u64, index: u32) -> Result<Classification, IndexerError> {
        let staker = tx.to.clone().or_else(|| tx.from.clone()).unwrap_or_default();
        // Locking coins into one's own stake is not a self transfer
        let to = if tx.to == tx.from { None } else { tx.to.as_deref() };

        let mut tf = transfer_from_tx(tx, to, block_number, index);
        tf.tags.insert(Tag::ReplenishStake);
        let cur_stake = self.store.get_identity(&staker)?.map(|i| i.stake).unwrap_or(Decimal::ZERO);
        tf.meta.cur_stake = Some(cur_stake + tf.value(false));

        Ok(Classification {
            transfer: Some(tf),
            enrichment: None,
            refresh: (!tx.amount.is_zero()).then_some(staker),
        })
    }
}

/// Kill transfer rebuilt from indexer data
pub fn corrected_kill(tf: &Transfer, stake: Decimal, age: u64, prices: &PriceBook) -> Transfer {
    let mut corrected = tf.clone();
    let beneficiary = tf.signer.clone().unwrap_or_default();
    corrected.changes = Transfer::create_changes(&beneficiary, None, stake);
    corrected.changes.negate();
    corrected.meta.age = Some(age);
    corrected.meta.usd_value = Some(stake * prices.native());
    corrected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::models::{Identity, KnownAddress};

    const KILLED: &str = "0xf85921efdc17c54dc7ebbf01c451e76f0fbd216c";
    const POOL: &str = "0xddddaddb856901ac3e2251b8234efeab2188b22a";
    const BRIDGE: &str = "0x0000000000000000000000000000000000b41d9e";

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn registry() -> KnownAddresses {
        KnownAddresses::from_entries(vec![(BRIDGE.to_string(), KnownAddress::new(AddressType::Bridge))])
    }

    fn prices() -> PriceBook {
        PriceBook::with_prices(vec![("cg:idena".to_string(), Decimal::ONE)])
    }

    fn tx(tx_type: &str, from: &str, to: Option<&str>, amount: &str) -> NodeTx {
        NodeTx {
            hash: "0xbf2b1539de425375f3c4191c64638caf3b505aa9ac15ca1276425a1a9a5d9766".to_string(),
            tx_type: tx_type.to_string(),
            from: Some(from.to_string()),
            to: to.map(str::to_string),
            amount: dec(amount),
            payload: Some("0x".to_string()),
            epoch: 97,
            timestamp: 1670626028,
            receipt: None,
        }
    }

    fn store_with_killed(fetched: DateTime<Utc>) -> Database {
        let db = Database::new_in_memory().unwrap();
        let mut identity = Identity::new(KILLED, dec("1581.545067883599849852"), 20);
        identity.delegatee = Some(POOL.to_string());
        identity.fetch_time = Some(fetched);
        db.insert_identities(&[identity], false).unwrap();
        db
    }

    #[test]
    fn test_kill_from_fresh_cache() {
        let now = Utc::now();
        let db = store_with_killed(now);
        let (registry, prices) = (registry(), prices());
        let classifier = AccountClassifier::new(&registry, &prices, &db, 3600);

        let result = classifier.classify(&tx("kill", KILLED, None, "0"), 5312992, 48, None, now).unwrap();
        let tf = result.transfer.unwrap();

        assert!(result.enrichment.is_none());
        assert_eq!(result.refresh.as_deref(), Some(KILLED));
        assert_eq!(tf.changes.get(KILLED), Some(dec("1581.545067883599849852")));
        assert_eq!(tf.meta.age, Some(20));
        assert_eq!(tf.meta.pool.as_deref(), Some(POOL));
        assert_eq!(tf.meta.killed_identity.as_deref(), Some(KILLED));
        assert_eq!(tf.meta.usd_value, Some(dec("1581.545067883599849852")));
        assert!(tf.has_tag(Tag::Kill));
    }

    #[test]
    fn test_kill_delegator_credits_pool() {
        let now = Utc::now();
        let db = store_with_killed(now);
        let (registry, prices) = (registry(), prices());
        let classifier = AccountClassifier::new(&registry, &prices, &db, 3600);

        let result = classifier
            .classify(&tx("killDelegator", POOL, Some(KILLED), "0"), 5312992, 49, None, now)
            .unwrap();
        let tf = result.transfer.unwrap();

        assert_eq!(tf.signer.as_deref(), Some(POOL));
        assert_eq!(tf.changes.len(), 1);
        assert_eq!(tf.changes.get(POOL), Some(dec("1581.545067883599849852")));
        assert_eq!(tf.meta.pool.as_deref(), Some(POOL));
        assert_eq!(tf.meta.killed_identity.as_deref(), Some(KILLED));
    }

    #[test]
    fn test_stale_kill_needs_enrichment() {
        let now = Utc::now();
        let db = store_with_killed(now - chrono::Duration::hours(2));
        let (registry, prices) = (registry(), prices());
        let classifier = AccountClassifier::new(&registry, &prices, &db, 3600);

        let result = classifier.classify(&tx("kill", KILLED, None, "0"), 1, 0, None, now).unwrap();
        assert_eq!(
            result.enrichment,
            Some(KillEnrichment {
                epoch: 97,
                killed: KILLED.to_string()
            })
        );
        let tf = result.transfer.unwrap();
        assert!(tf.should_store());
        assert!(tf.meta.age.is_none());

        let corrected = corrected_kill(&tf, dec("250"), 31, &prices);
        assert_eq!(corrected.changes.get(KILLED), Some(dec("250")));
        assert_eq!(corrected.meta.age, Some(31));
        assert_eq!(corrected.meta.usd_value, Some(dec("250")));
    }

    #[test]
    fn test_bridge_burn_decodes_destination() {
        let db = Database::new_in_memory().unwrap();
        let (registry, prices) = (registry(), prices());
        let classifier = AccountClassifier::new(&registry, &prices, &db, 3600);

        let mut send = tx("send", "0xaaa", Some(BRIDGE), "100");
        let payload = [b"idena".as_slice(), b"BSCADDRESS", b"0xDEST"].concat();
        send.payload = Some(format!("0x{}", hex::encode(payload)));

        let tf = classifier.classify(&send, 1, 0, None, Utc::now()).unwrap().transfer.unwrap();
        assert!(tf.has_tag(Tag::BridgeBurn));
        assert_eq!(tf.meta.bridge_to.as_deref(), Some("0xdest"));
        assert_eq!(tf.meta.usd_value, Some(dec("100")));

        send.payload = Some("0x1234".to_string());
        let tf = classifier.classify(&send, 1, 0, None, Utc::now()).unwrap().transfer.unwrap();
        assert!(tf.has_tag(Tag::BridgeBurnWrong));
    }

    #[test]
    fn test_delegate_and_countable() {
        let db = Database::new_in_memory().unwrap();
        let (registry, prices) = (registry(), prices());
        let classifier = AccountClassifier::new(&registry, &prices, &db, 3600);

        let delegate = tx("delegate", "0xa7d4", Some("0x9a0b"), "0");
        let tf = classifier.classify(&delegate, 5307151, 0, None, Utc::now()).unwrap().transfer.unwrap();
        assert_eq!(tf.meta.pool.as_deref(), Some("0x9a0b"));
        assert_eq!(tf.changes.len(), 1);
        assert!(tf.should_store());

        let invite = tx("invite", "0x49ca", Some("0x2b08"), "0");
        let tf = classifier.classify(&invite, 5315556, 0, None, Utc::now()).unwrap().transfer.unwrap();
        assert!(tf.is_countable_only());
        assert_eq!(tf.changes.len(), 2);
    }

    #[test]
    fn test_undelegate_without_cached_pool_is_skipped() {
        let db = Database::new_in_memory().unwrap();
        let (registry, prices) = (registry(), prices());
        let classifier = AccountClassifier::new(&registry, &prices, &db, 3600);

        let result = classifier.classify(&tx("undelegate", "0xa7d4", None, "0"), 1, 0, None, Utc::now()).unwrap();
        assert!(result.transfer.is_none());
    }

    #[test]
    fn test_replenish_own_stake_is_outflow() {
        let db = Database::new_in_memory().unwrap();
        db.insert_identities(&[Identity::new("0x9a48", dec("100"), 5)], false).unwrap();
        let (registry, prices) = (registry(), prices());
        let classifier = AccountClassifier::new(&registry, &prices, &db, 3600);

        let result = classifier
            .classify(&tx("replenishStake", "0x9a48", Some("0x9a48"), "18"), 5315556, 1, None, Utc::now())
            .unwrap();
        let tf = result.transfer.unwrap();
        assert_eq!(tf.changes.len(), 1);
        assert_eq!(tf.changes.get("0x9a48"), Some(dec("-18")));
        assert_eq!(tf.meta.cur_stake, Some(dec("118")));
        assert_eq!(result.refresh.as_deref(), Some("0x9a48"));
    }

    #[test]
    fn test_contract_call_requires_successful_receipt() {
        let db = Database::new_in_memory().unwrap();
        let (registry, prices) = (registry(), prices());
        let classifier = AccountClassifier::new(&registry, &prices, &db, 3600);
        let call = tx("callContract", "0xaaa", Some("0xc0ffee"), "0");

        assert!(classifier.classify(&call, 1, 0, None, Utc::now()).is_err());

        let failed = TxReceipt { success: false, contract: None };
        assert!(classifier.classify(&call, 1, 0, Some(&failed), Utc::now()).unwrap().transfer.is_none());

        let ok = TxReceipt {
            success: true,
            contract: Some("0xC0FFEE".to_string()),
        };
        let tf = classifier.classify(&call, 1, 0, Some(&ok), Utc::now()).unwrap().transfer.unwrap();
        assert_eq!(tf.meta.call.unwrap().contract, "0xc0ffee");
    }

    #[test]
    fn test_unhandled_types_are_skipped() {
        let db = Database::new_in_memory().unwrap();
        let (registry, prices) = (registry(), prices());
        let classifier = AccountClassifier::new(&registry, &prices, &db, 3600);
        let online = tx("online", "0xaaa", None, "0");
        assert!(classifier.classify(&online, 1, 0, None, Utc::now()).unwrap().transfer.is_none());
    }
}
