use std::time::Duration;
use thiserror::Error;

use crate::database::DbError;

/// Every failure a watcher, feed or detector can surface
#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("upstream call failed: {0}")]
    Rpc(#[from] RpcError),

    #[error("store failed: {0}")]
    Database(#[from] DbError),

    #[error("bad chain or exchange data: {0}")]
    Processing(#[from] ProcessingError),

    #[error("bad configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    System(#[from] SystemError),
}

/// Failures talking to nodes, the Idena indexer and exchange APIs
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("undecodable body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("node returned error {code}: {message}")]
    Method { code: i64, message: String },

    #[error("unexpected response: {0}")]
    InvalidResponse(String),

    #[error("no answer within {seconds}s")]
    Timeout { seconds: u64 },

    #[error("rate limited for {seconds}s")]
    RateLimit { seconds: u64 },

    #[error("cannot reach endpoint: {0}")]
    Connection(String),

    #[error("log subscription dropped: {0}")]
    Stream(String),

    #[error("api key rejected")]
    Authentication,
}

/// Raw chain or exchange data that cannot be turned into transfers, trades or events
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("transaction {0}")]
    TransactionParsing(String),

    #[error("log {0}")]
    LogParsing(String),

    #[error("amount {0}")]
    AmountParsing(String),

    #[error("no price for {0}")]
    UnknownToken(String),

    #[error("log data too short: need {expected} bytes, have {got}")]
    InsufficientData { expected: usize, got: usize },

    #[error("overflow in {0}")]
    Overflow(String),

    #[error("event references transfer {0} which is not stored")]
    MissingTransfer(String),

    #[error("unexpected shape: {0}")]
    UnexpectedShape(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{key} = {value} is not allowed")]
    InvalidValue { key: String, value: String },

    #[error("cannot read {0}")]
    FileNotFound(String),

    #[error("cannot parse: {0}")]
    Parsing(String),

    #[error("not a websocket or http url: {0}")]
    InvalidUrl(String),
}

#[derive(Error, Debug)]
pub enum SystemError {
    #[error("io: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("shutting down")]
    Shutdown,

    #[error("task {0} died")]
    Task(String),

    #[error("{0} channel closed")]
    ChannelClosed(String),
}

pub type Result<T> = std::result::Result<T, IndexerError>;

/// How an error affects the running pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Impact {
    /// The process cannot continue
    Fatal,
    /// A watcher or feed stops producing until the cause clears
    SourceDown,
    /// One block, transaction, trade or event is skipped or delayed
    ItemSkipped,
    /// Part of an orderly stop
    Expected,
}

impl IndexerError {
    pub fn impact(&self) -> Impact {
        match self {
            IndexerError::Config(_) | IndexerError::System(SystemError::FileSystem(_)) => Impact::Fatal,
            IndexerError::Database(DbError::Connection(_)) => Impact::Fatal,
            IndexerError::Rpc(RpcError::Connection(_) | RpcError::Stream(_) | RpcError::Authentication) => {
                Impact::SourceDown
            }
            IndexerError::System(SystemError::ChannelClosed(_) | SystemError::Task(_)) => Impact::SourceDown,
            IndexerError::System(SystemError::Shutdown) => Impact::Expected,
            _ => Impact::ItemSkipped,
        }
    }

    /// Transient upstream trouble worth another attempt
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            IndexerError::Rpc(
                RpcError::Timeout { .. }
                    | RpcError::RateLimit { .. }
                    | RpcError::Connection(_)
                    | RpcError::Stream(_)
                    | RpcError::Http(_)
                    | RpcError::InvalidResponse(_)
            )
        )
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, IndexerError::System(SystemError::Shutdown))
    }

    /// Suggested pause before retrying, `None` when retrying is pointless
    pub fn retry_after(&self) -> Option<Duration> {
        if !self.is_recoverable() {
            return None;
        }
        let seconds = match self {
            IndexerError::Rpc(RpcError::RateLimit { seconds }) => *seconds,
            IndexerError::Rpc(RpcError::Connection(_)) => 10,
            IndexerError::Rpc(RpcError::Stream(_)) => 1,
            _ => 5,
        };
        Some(Duration::from_secs(seconds))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for IndexerError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        IndexerError::Rpc(RpcError::Stream(err.to_string()))
    }
}

impl From<rust_decimal::Error> for IndexerError {
    fn from(err: rust_decimal::Error) -> Self {
        IndexerError::Processing(ProcessingError::AmountParsing(err.to_string()))
    }
}
