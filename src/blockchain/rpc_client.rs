use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::evm::raw_log::RawLog;
use crate::error::{IndexerError, ProcessingError, RpcError};
use crate::logging::{LogContext, MetricsLogger, PerformanceMonitor};
use crate::retry::{RetryConfig, RetryManager};
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: &'a [Value],
    id: u64,
    /// Account-chain nodes authenticate with a key in the request body
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// One `topics` position of a log filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TopicFilter {
    /// Matches anything, serialized as `null`
    Any,
    One(String),
    OneOf(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogFilter {
    #[serde(rename = "fromBlock", skip_serializing_if = "Option::is_none")]
    pub from_block: Option<String>,
    #[serde(rename = "toBlock", skip_serializing_if = "Option::is_none")]
    pub to_block: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub topics: Vec<TopicFilter>,
}

impl LogFilter {
    pub fn new(topics: Vec<TopicFilter>) -> Self {
        Self {
            from_block: None,
            to_block: None,
            address: None,
            topics,
        }
    }

    pub fn at(mut self, address: &str) -> Self {
        self.address = Some(address.to_lowercase());
        self
    }

    /// Inclusive block range
    pub fn range(mut self, from_block: u64, to_block: u64) -> Self {
        self.from_block = Some(format!("0x{:x}", from_block));
        self.to_block = Some(format!("0x{:x}", to_block));
        self
    }
}

/// JSON-RPC over HTTP with error classification and optional retries
#[derive(Clone)]
pub struct RpcClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    timeout_seconds: u64,
    retry: RetryConfig,
    shutdown: Option<ShutdownSignal>,
    next_id: Arc<AtomicU64>,
}

impl RpcClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, IndexerError> {
        let context = LogContext::new("rpc_client", "initialization")
            .with_metadata("endpoint", serde_json::json!(endpoint))
            .with_metadata("timeout_seconds", serde_json::json!(timeout.as_secs()));
        context.debug("Initializing RPC client");

        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .map_err(RpcError::Http)?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key: None,
            timeout_seconds: timeout.as_secs(),
            retry: RetryConfig::for_rpc(),
            shutdown: None,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty());
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Single request without retries. A missing `result` comes back as `Value::Null`.
    pub async fn request(&self, method: &str, params: &[Value]) -> Result<Value, IndexerError> {
        let monitor = PerformanceMonitor::new("rpc_request").with_metadata("method", serde_json::json!(method));
        let result = self.send(method, params).await;
        let duration = monitor.finish_with_result(&result);
        MetricsLogger::log_rpc_call(method, duration, result.is_ok());
        result
    }

    async fn send(&self, method: &str, params: &[Value]) -> Result<Value, IndexerError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            key: self.api_key.as_deref(),
        };

        let response = self.client.post(&self.endpoint).json(&request).send().await.map_err(|e| {
            if e.is_timeout() {
                IndexerError::Rpc(RpcError::Timeout { seconds: self.timeout_seconds })
            } else if e.is_connect() {
                IndexerError::Rpc(RpcError::Connection(e.to_string()))
            } else {
                IndexerError::Rpc(RpcError::Http(e))
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(IndexerError::Rpc(RpcError::RateLimit { seconds: 60 }));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(IndexerError::Rpc(RpcError::Authentication));
        }
        if !status.is_success() {
            return Err(IndexerError::Rpc(RpcError::Connection(format!(
                "HTTP error: {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            ))));
        }

        let body = response.bytes().await.map_err(RpcError::Http)?;
        let rpc_response: JsonRpcResponse = serde_json::from_slice(&body)
            .map_err(|e| IndexerError::Rpc(RpcError::InvalidResponse(format!("{}: {}", method, e))))?;

        if let Some(error) = rpc_response.error {
            return Err(IndexerError::Rpc(RpcError::Method {
                code: error.code,
                message: error.message,
            }));
        }

        Ok(rpc_response.result.unwrap_or(Value::Null))
    }

    /// Request retried per the client's retry config
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, IndexerError> {
        let mut manager = RetryManager::new(method, self.retry.clone());
        if let Some(shutdown) = &self.shutdown {
            manager = manager.with_shutdown(shutdown.clone());
        }
        manager.execute(|| self.request(method, &params)).await
    }

    /// Retried request decoded into `T`; a null result is `None`
    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<Option<T>, IndexerError> {
        let value = self.call(method, params).await?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| IndexerError::Rpc(RpcError::InvalidResponse(format!("{}: {}", method, e))))
    }

    pub async fn get_block_number(&self) -> Result<u64, IndexerError> {
        let value = self.call("eth_blockNumber", vec![]).await?;
        let hex = value
            .as_str()
            .ok_or_else(|| RpcError::InvalidResponse("Block number is not a string".to_string()))?;
        Ok(parse_hex_u64(hex)?)
    }

    /// Block time in epoch seconds, `None` when the node does not know the block
    pub async fn get_block_timestamp(&self, block_number: u64) -> Result<Option<u64>, IndexerError> {
        let params = vec![Value::String(format!("0x{:x}", block_number)), Value::Bool(false)];
        let value = self.request("eth_getBlockByNumber", &params).await?;
        match value.get("timestamp").and_then(Value::as_str) {
            Some(hex) => Ok(Some(parse_hex_u64(hex)?)),
            None => Ok(None),
        }
    }

    /// Lowercased `from` of a transaction
    pub async fn get_transaction_signer(&self, tx_hash: &str) -> Result<Option<String>, IndexerError> {
        let value = self.request("eth_getTransactionByHash", &[Value::String(tx_hash.to_string())]).await?;
        Ok(value.get("from").and_then(Value::as_str).map(str::to_lowercase))
    }

    pub async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, IndexerError> {
        let params = vec![serde_json::to_value(filter).map_err(RpcError::Json)?];
        let logs: Option<Vec<RawLog>> = self.call_as("eth_getLogs", params).await?;
        let logs = logs.unwrap_or_default();

        LogContext::new("rpc_client", "get_logs")
            .with_metadata("log_count", serde_json::json!(logs.len()))
            .with_metadata("from_block", serde_json::json!(filter.from_block))
            .with_metadata("to_block", serde_json::json!(filter.to_block))
            .debug(&format!("Retrieved {} logs", logs.len()));
        Ok(logs)
    }
}

pub fn parse_hex_u64(hex_str: &str) -> Result<u64, ProcessingError> {
    let digits = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    u64::from_str_radix(digits, 16)
        .map_err(|e| ProcessingError::AmountParsing(format!("Failed to parse hex '{}' to u64: {}", hex_str, e)))
}
