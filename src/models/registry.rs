use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use super::transfer::Chain;
use crate::error::ConfigError;
use crate::logging::LogContext;

/// Role of a known address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    Pool,
    Bridge,
    Token,
    Foundation,
    Premine,
    Exchange,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownAddress {
    #[serde(rename = "type")]
    pub kind: AddressType,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub decimals: Option<u32>,
    /// For pools: the paired token contract
    #[serde(default)]
    pub token1: Option<String>,
    /// For tokens: key into the price book
    #[serde(default)]
    pub price_id: Option<String>,
    #[serde(default)]
    pub chain: Option<Chain>,
}

impl KnownAddress {
    pub fn new(kind: AddressType) -> Self {
        Self {
            kind,
            name: None,
            decimals: None,
            token1: None,
            price_id: None,
            chain: None,
        }
    }
}

/// Read-only registry of known addresses, keyed by lowercased address
#[derive(Debug, Clone, Default)]
pub struct KnownAddresses {
    entries: HashMap<String, KnownAddress>,
}

impl KnownAddresses {
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, KnownAddress)>,
    {
        Self {
            entries: entries.into_iter().map(|(addr, entry)| (addr.to_lowercase(), entry)).collect(),
        }
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let entries: HashMap<String, KnownAddress> =
            serde_json::from_str(content).map_err(|e| ConfigError::Parsing(e.to_string()))?;
        Ok(Self::from_entries(entries))
    }

    /// Loads the registry file; a missing file yields an empty registry
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        if !Path::new(path).exists() {
            LogContext::new("registry", "load")
                .with_metadata("path", serde_json::json!(path))
                .warn("Known address file not found, continuing without it");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound(path.to_string()))?;
        Self::from_json(&content)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, addr: &str) -> Option<&KnownAddress> {
        self.entries.get(&addr.to_lowercase())
    }

    pub fn addr_type(&self, addr: &str) -> Option<AddressType> {
        self.get(addr).map(|entry| entry.kind)
    }

    pub fn is_type(&self, addr: &str, kind: AddressType) -> bool {
        self.addr_type(addr) == Some(kind)
    }

    /// All addresses of a type, sorted for stable output
    pub fn addrs_of_type(&self, kind: AddressType) -> Vec<String> {
        let mut addrs: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.kind == kind)
            .map(|(addr, _)| addr.clone())
            .collect();
        addrs.sort();
        addrs
    }

    pub fn price_id(&self, addr: &str) -> Option<&str> {
        self.get(addr).and_then(|entry| entry.price_id.as_deref())
    }

    /// Price id of the token paired in a pool
    pub fn pool_token_price_id(&self, pool: &str) -> Option<&str> {
        let token = self.get(pool)?.token1.as_deref()?;
        self.price_id(token)
    }

    pub fn name(&self, addr: &str) -> Option<&str> {
        self.get(addr).and_then(|entry| entry.name.as_deref())
    }

    /// Foundation and premine wallets on the given chain, or chain-agnostic
    pub fn is_interesting(&self, addr: &str, chain: Chain) -> bool {
        match self.get(addr) {
            Some(entry) => {
                matches!(entry.kind, AddressType::Foundation | AddressType::Premine)
                    && entry.chain.map(|c| c == chain).unwrap_or(true)
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"{
        "0x05AD60D9A2F1AA30BA0CDBAF1E0A0A145FBEA16F": {"type": "pool", "name": "IDNA-BUSD", "token1": "0xe9e7cea3dedca5984780bafc599bd69add087d56"},
        "0xe9e7cea3dedca5984780bafc599bd69add087d56": {"type": "token", "name": "BUSD", "decimals": 18, "price_id": "cg:binance-usd"},
        "0xcbb98843270812eece07bfb82d26b4881a33aa91": {"type": "foundation", "name": "Foundation"},
        "0xc94d32638d71aba05f0bdade498948ef93944428": {"type": "premine", "chain": "bsc"},
        "0x0000000000000000000000000000000000000001": {"type": "vault"}
    }"#;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = KnownAddresses::from_json(REGISTRY).unwrap();
        assert_eq!(registry.addr_type("0x05ad60d9a2f1aa30ba0cdbaf1e0a0a145fbea16f"), Some(AddressType::Pool));
        assert_eq!(registry.addr_type("0x05AD60D9A2F1AA30BA0CDBAF1E0A0A145FBEA16F"), Some(AddressType::Pool));
        assert_eq!(registry.addr_type("0x0000000000000000000000000000000000000001"), Some(AddressType::Other));
        assert_eq!(registry.addr_type("0xdead"), None);
    }

    #[test]
    fn test_pool_token_price() {
        let registry = KnownAddresses::from_json(REGISTRY).unwrap();
        assert_eq!(
            registry.pool_token_price_id("0x05ad60d9a2f1aa30ba0cdbaf1e0a0a145fbea16f"),
            Some("cg:binance-usd")
        );
        assert_eq!(registry.addrs_of_type(AddressType::Pool), vec!["0x05ad60d9a2f1aa30ba0cdbaf1e0a0a145fbea16f"]);
    }

    #[test]
    fn test_interesting_respects_chain() {
        let registry = KnownAddresses::from_json(REGISTRY).unwrap();
        assert!(registry.is_interesting("0xcbb98843270812eece07bfb82d26b4881a33aa91", Chain::Idena));
        assert!(registry.is_interesting("0xcbb98843270812eece07bfb82d26b4881a33aa91", Chain::Bsc));
        assert!(registry.is_interesting("0xc94d32638d71aba05f0bdade498948ef93944428", Chain::Bsc));
        assert!(!registry.is_interesting("0xc94d32638d71aba05f0bdade498948ef93944428", Chain::Idena));
        assert!(!registry.is_interesting("0x05ad60d9a2f1aa30ba0cdbaf1e0a0a145fbea16f", Chain::Bsc));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let registry = KnownAddresses::load("/nonexistent/known_addresses.json").unwrap();
        assert!(registry.is_empty());
    }
}
