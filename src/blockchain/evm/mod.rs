//! EVM chain watcher: websocket subscriptions, a finality-delayed log buffer and
//! per-transaction classification of token logs into transfers.

pub mod buffer;
pub mod classifier;
pub mod raw_log;
pub mod watcher;

pub use buffer::{BlockTimes, LogBuffer};
pub use classifier::{group_by_transaction, squash, TxClassifier};
pub use raw_log::{widen, RawLog, LP_BURN_TOPIC, LP_MINT_TOPIC, NULL_ADDRESS, TRANSFER_TOPIC};
pub use watcher::EvmWatcher;
