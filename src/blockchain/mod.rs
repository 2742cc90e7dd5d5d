pub mod account;
pub mod evm;
pub mod rpc_client;

pub use account::AccountWatcher;
pub use evm::EvmWatcher;
pub use rpc_client::{LogFilter, RpcClient, TopicFilter};

use crate::events::Event;
use crate::models::{Chain, Transfer};

/// What a chain watcher hands to the tracker
#[derive(Debug, Clone)]
pub enum ChainMessage {
    /// Finalized transfers of one chain, in block then log index order
    Transfers { chain: Chain, tfs: Vec<Transfer> },
    /// Events that bypass detection, such as new heights and club crossings
    Event(Event),
}
