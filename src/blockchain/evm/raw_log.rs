use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};

use crate::blockchain::rpc_client::parse_hex_u64;
use crate::error::ProcessingError;
use crate::models::{Chain, Transfer};

/// ERC-20 `Transfer(address,address,uint256)`
pub const TRANSFER_TOPIC: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";
/// Pair `Mint(address,uint256,uint256)`
pub const LP_MINT_TOPIC: &str = "0x4c209b5fc8ad50758f13e2e1088ba56a560dff690a1c6fef26394f4c03821c4f";
/// Pair `Burn(address,uint256,uint256,address)`
pub const LP_BURN_TOPIC: &str = "0xdccd412f0b1252819cb1fd330b93224ca42612892bb3f4f789976e6d81936496";
pub const NULL_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

pub const NATIVE_DECIMALS: u32 = 18;

fn hex_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let hex = String::deserialize(deserializer)?;
    parse_hex_u64(&hex).map_err(serde::de::Error::custom)
}

fn hex_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let value = hex_u64(deserializer)?;
    u32::try_from(value).map_err(serde::de::Error::custom)
}

/// An EVM log as delivered by `eth_getLogs` or a `logs` subscription
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "blockNumber", deserialize_with = "hex_u64")]
    pub block_number: u64,
    #[serde(rename = "transactionHash")]
    pub transaction_hash: String,
    #[serde(rename = "logIndex", deserialize_with = "hex_u32")]
    pub log_index: u32,
    #[serde(default)]
    pub removed: bool,
}

impl RawLog {
    pub fn topic(&self, index: usize) -> Option<&str> {
        self.topics.get(index).map(String::as_str)
    }

    /// Address packed into the low 20 bytes of a topic
    pub fn topic_as_addr(&self, index: usize) -> Result<String, ProcessingError> {
        let topic = self
            .topic(index)
            .ok_or_else(|| ProcessingError::LogParsing(format!("missing topic {} in {}", index, self.transaction_hash)))?;
        let digits = topic.strip_prefix("0x").unwrap_or(topic);
        if !digits.is_ascii() {
            return Err(ProcessingError::LogParsing(format!("topic {} of {} is not hex", index, self.transaction_hash)));
        }
        if digits.len() < 40 {
            return Err(ProcessingError::InsufficientData { expected: 40, got: digits.len() });
        }
        Ok(format!("0x{}", digits[digits.len() - 40..].to_lowercase()))
    }

    /// The `index`-th 32-byte word of `data` scaled down by `decimals`
    pub fn data_word(&self, index: usize, decimals: u32) -> Result<Decimal, ProcessingError> {
        let digits = self.data.strip_prefix("0x").unwrap_or(&self.data);
        let start = index * 64;
        let word = digits
            .get(start..start + 64)
            .ok_or(ProcessingError::InsufficientData { expected: (index + 1) * 32, got: digits.len() / 2 })?;
        word_to_decimal(word, decimals)
    }

    pub fn is_lp_event(&self) -> bool {
        matches!(self.topic(0), Some(LP_MINT_TOPIC) | Some(LP_BURN_TOPIC))
    }

    /// Token transfer as a single-leg transfer keyed at this log
    pub fn to_transfer(&self, timestamp: Option<DateTime<Utc>>, signer: &str) -> Result<Transfer, ProcessingError> {
        let from = self.topic_as_addr(1)?;
        let to = self.topic_as_addr(2)?;
        let value = self.data_word(0, NATIVE_DECIMALS)?;

        let mut tf = Transfer::new(&self.transaction_hash, Chain::Bsc, self.block_number, self.log_index);
        tf.changes = Transfer::create_changes(&from, Some(&to), value);
        tf.timestamp = timestamp;
        tf.signer = Some(signer.to_string());
        Ok(tf)
    }
}

/// Parses one 256-bit big-endian word. Values beyond 128 bits are rejected.
pub fn word_to_decimal(word: &str, decimals: u32) -> Result<Decimal, ProcessingError> {
    let bytes = hex::decode(word).map_err(|e| ProcessingError::AmountParsing(format!("{}: {}", word, e)))?;
    if bytes.len() != 32 {
        return Err(ProcessingError::InsufficientData { expected: 32, got: bytes.len() });
    }
    if bytes[..16].iter().any(|b| *b != 0) {
        return Err(ProcessingError::Overflow(format!("0x{}", word)));
    }
    let mut low = [0u8; 16];
    low.copy_from_slice(&bytes[16..]);
    let raw = u128::from_be_bytes(low);
    let raw = i128::try_from(raw).map_err(|_| ProcessingError::Overflow(format!("0x{}", word)))?;
    Decimal::try_from_i128_with_scale(raw, decimals)
        .map(|d| d.normalize())
        .map_err(|e| ProcessingError::Overflow(format!("0x{}: {}", word, e)))
}

/// Left-pads an address to a 32-byte topic
pub fn widen(addr: &str) -> String {
    let digits = addr.strip_prefix("0x").unwrap_or(addr).to_lowercase();
    format!("0x{:0>64}", digits)
}
