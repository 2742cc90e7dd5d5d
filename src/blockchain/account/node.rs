use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::blockchain::rpc_client::RpcClient;
use crate::error::IndexerError;
use crate::models::Identity;
use crate::retry::RetryConfig;
use crate::shutdown::ShutdownSignal;

/// Block as returned by `bcn_blockAt` / `bcn_lastBlock`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeBlock {
    pub height: u64,
    pub timestamp: u64,
    #[serde(default)]
    pub transactions: Option<Vec<String>>,
}

impl NodeBlock {
    pub fn tx_hashes(&self) -> &[String] {
        self.transactions.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub success: bool,
    #[serde(default, alias = "contractAddress")]
    pub contract: Option<String>,
}

/// Transaction in the node's shape. Indexer transactions are converted into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTx {
    pub hash: String,
    #[serde(rename = "type")]
    pub tx_type: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub amount: Decimal,
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default)]
    pub epoch: u64,
    #[serde(default)]
    pub timestamp: u64,
    /// Present only on transactions that came from the indexer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<TxReceipt>,
}

impl NodeTx {
    /// Lowercases addresses and drops empty ones
    pub fn normalized(mut self) -> Self {
        self.from = self.from.map(|a| a.to_lowercase()).filter(|a| !a.is_empty());
        self.to = self.to.map(|a| a.to_lowercase()).filter(|a| !a.is_empty());
        self
    }

    pub fn is_kill(&self) -> bool {
        self.tx_type == "kill" || self.tx_type == "killDelegator"
    }

    /// Identity a kill terminates
    pub fn killed_identity(&self) -> Option<&str> {
        match self.tx_type.as_str() {
            "kill" => self.from.as_deref(),
            "killDelegator" => self.to.as_deref(),
            _ => None,
        }
    }
}

/// Account-chain node JSON-RPC, authenticated with a key in the request body
#[derive(Clone)]
pub struct NodeClient {
    rpc: RpcClient,
}

impl NodeClient {
    pub fn new(url: &str, key: Option<String>, timeout: Duration) -> Result<Self, IndexerError> {
        let rpc = RpcClient::new(url, timeout)?.with_api_key(key);
        Ok(Self { rpc })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.rpc = self.rpc.with_retry(retry);
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.rpc = self.rpc.with_shutdown(shutdown);
        self
    }

    pub async fn last_block(&self) -> Result<Option<NodeBlock>, IndexerError> {
        self.rpc.call_as("bcn_lastBlock", vec![]).await
    }

    /// `None` until the block is produced
    pub async fn block_at(&self, height: u64) -> Result<Option<NodeBlock>, IndexerError> {
        self.rpc.call_as("bcn_blockAt", vec![json!(height)]).await
    }

    pub async fn transaction(&self, hash: &str) -> Result<Option<NodeTx>, IndexerError> {
        let tx: Option<NodeTx> = self.rpc.call_as("bcn_transaction", vec![json!(hash)]).await?;
        Ok(tx.map(NodeTx::normalized))
    }

    pub async fn tx_receipt(&self, hash: &str) -> Result<Option<TxReceipt>, IndexerError> {
        self.rpc.call_as("bcn_txReceipt", vec![json!(hash)]).await
    }

    /// Hashes waiting in the node's mempool, single attempt
    pub async fn mempool(&self) -> Result<Vec<String>, IndexerError> {
        let value = self.rpc.request("bcn_mempool", &[]).await?;
        if value.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    pub async fn identity(&self, addr: &str) -> Result<Option<Identity>, IndexerError> {
        let identity: Option<Identity> = self.rpc.call_as("dna_identity", vec![json!(addr)]).await?;
        Ok(identity.map(Identity::normalized))
    }

    /// Every identity the node knows; slow, single attempt
    pub async fn identities(&self) -> Result<Vec<Identity>, IndexerError> {
        let value = self.rpc.request("dna_identities", &[]).await?;
        let raw: Vec<Value> = serde_json::from_value(value).unwrap_or_default();
        Ok(raw
            .into_iter()
            .filter_map(|v| serde_json::from_value::<Identity>(v).ok())
            .map(Identity::normalized)
            .collect())
    }
}
