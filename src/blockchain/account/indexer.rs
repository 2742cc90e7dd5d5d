use chrono::DateTime;
use once_cell::sync::Lazy;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use super::node::{NodeTx, TxReceipt};
use crate::error::{IndexerError, ProcessingError, RpcError};
use crate::logging::{LogContext, MetricsLogger, PerformanceMonitor};
use crate::retry::{RetryConfig, RetryManager};
use crate::shutdown::ShutdownSignal;

/// Indexer transaction type names to node type names
static TX_TYPE_NAMES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("SendTx", "send"),
        ("ActivationTx", "activation"),
        ("InviteTx", "invite"),
        ("KillTx", "kill"),
        ("KillInviteeTx", "killInvitee"),
        ("SubmitFlipTx", "submitFlip"),
        ("SubmitAnswersHashTx", "submitAnswersHash"),
        ("SubmitShortAnswersTx", "submitShortAnswers"),
        ("SubmitLongAnswersTx", "submitLongAnswers"),
        ("EvidenceTx", "evidence"),
        ("OnlineStatusTx", "online"),
        ("ChangeGodAddressTx", "changeGodAddress"),
        ("BurnTx", "burn"),
        ("ChangeProfileTx", "changeProfile"),
        ("DeleteFlipTx", "deleteFlip"),
        ("DeployContractTx", "deployContract"),
        ("CallContractTx", "callContract"),
        ("TerminateContractTx", "terminateContract"),
        ("DelegateTx", "delegate"),
        ("UndelegateTx", "undelegate"),
        ("KillDelegatorTx", "killDelegator"),
        ("StoreToIpfsTx", "storeToIpfs"),
        ("ReplenishStakeTx", "replenishStake"),
    ])
});

#[derive(Debug, Deserialize)]
struct IndexerResponse {
    #[serde(default)]
    result: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexerTx {
    hash: String,
    #[serde(rename = "type")]
    tx_type: String,
    timestamp: String,
    #[serde(default)]
    epoch: u64,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    amount: Decimal,
    #[serde(default)]
    payload: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    tx_receipt: Option<TxReceipt>,
}

impl IndexerTx {
    fn into_node_tx(self) -> Result<NodeTx, ProcessingError> {
        let tx_type = TX_TYPE_NAMES
            .get(self.tx_type.as_str())
            .ok_or_else(|| ProcessingError::TransactionParsing(format!("unknown indexer type {}", self.tx_type)))?;
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|e| ProcessingError::TransactionParsing(format!("timestamp {}: {}", self.timestamp, e)))?;

        Ok(NodeTx {
            hash: self.hash,
            tx_type: tx_type.to_string(),
            from: self.from,
            to: self.to,
            amount: self.amount,
            payload: self.payload,
            epoch: self.epoch,
            timestamp: timestamp.timestamp().max(0) as u64,
            receipt: self.tx_receipt,
        }
        .normalized())
    }
}

/// REST client for the account-chain indexer.
///
/// The indexer lags the node, sometimes by over a minute, and occasionally
/// answers with partial data, so lookups are retried.
#[derive(Clone)]
pub struct IndexerClient {
    client: Client,
    base_url: String,
    retry: RetryConfig,
    shutdown: Option<ShutdownSignal>,
}

impl IndexerClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, IndexerError> {
        let client = Client::builder().timeout(timeout).build().map_err(RpcError::Http)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry: RetryConfig::fixed(5, Duration::from_secs(10)),
            shutdown: None,
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    async fn fetch(&self, path: &str) -> Result<Option<Value>, IndexerError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let monitor = PerformanceMonitor::new("indexer_request").with_metadata("path", serde_json::json!(path));

        let result = async {
            let response = self.client.get(&url).send().await.map_err(RpcError::Http)?;
            if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(IndexerError::Rpc(RpcError::RateLimit { seconds: 10 }));
            }
            let body: IndexerResponse = response.json().await.map_err(RpcError::Http)?;
            Ok(body.result)
        }
        .await;

        let duration = monitor.finish_with_result(&result);
        MetricsLogger::log_rpc_call("indexer_get", duration, result.is_ok());
        result
    }

    /// `result` of a GET, retried until present
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, IndexerError> {
        let mut manager = RetryManager::new("indexer_get", self.retry.clone());
        if let Some(shutdown) = &self.shutdown {
            manager = manager.with_shutdown(shutdown.clone());
        }
        let value = manager
            .execute(|| async {
                match self.fetch(path).await? {
                    Some(value) if !value.is_null() => Ok(value),
                    _ => Err(IndexerError::Rpc(RpcError::InvalidResponse(format!("no result for {}", path)))),
                }
            })
            .await?;
        serde_json::from_value(value).map_err(|e| IndexerError::Rpc(RpcError::InvalidResponse(format!("{}: {}", path, e))))
    }

    /// A transaction the node no longer returns
    pub async fn transaction(&self, hash: &str) -> Result<NodeTx, IndexerError> {
        let tx: IndexerTx = self.get(&format!("transaction/{}", hash)).await?;
        Ok(tx.into_node_tx()?)
    }

    /// Epoch in which an identity was born, as seen in `epoch`
    pub async fn birth_epoch(&self, epoch: u64, addr: &str) -> Result<u64, IndexerError> {
        let identity: Value = self.get(&format!("epoch/{}/identity/{}", epoch, addr)).await?;
        identity
            .get("birthEpoch")
            .and_then(Value::as_u64)
            .ok_or_else(|| IndexerError::Rpc(RpcError::InvalidResponse(format!("no birthEpoch for {}", addr))))
    }

    /// Stake released by a kill transaction, `None` when the indexer has none yet
    pub async fn kill_amount(&self, hash: &str) -> Result<Option<Decimal>, IndexerError> {
        let tx: Value = self.get(&format!("transaction/{}", hash)).await?;
        let amount = match tx.get("data").and_then(|d| d.get("transfer")) {
            Some(Value::String(s)) => Some(s.parse::<Decimal>()?),
            Some(Value::Number(n)) => Some(n.to_string().parse::<Decimal>()?),
            _ => {
                LogContext::new("indexer", "kill_amount")
                    .with_transaction_hash(hash)
                    .warn("No stake data for kill transaction");
                None
            }
        };
        Ok(amount)
    }
}
