//! Account-chain watcher: sequential block polling, per-type transaction
//! classification, kill enrichment from the indexer and the identity cache.

pub mod classifier;
pub mod identities;
pub mod indexer;
pub mod node;
pub mod watcher;

pub use classifier::{corrected_kill, decode_bridge_destination, AccountClassifier, Classification, KillEnrichment};
pub use identities::{check_new_club, club_step, process_identity_changes, IdentityCacher, MempoolWatcher};
pub use indexer::IndexerClient;
pub use node::{NodeBlock, NodeClient, NodeTx, TxReceipt};
pub use watcher::AccountWatcher;
