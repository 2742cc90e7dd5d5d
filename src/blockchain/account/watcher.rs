use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::classifier::{corrected_kill, AccountClassifier, KillEnrichment};
use super::identities::{refresh_identity, IdentityCacher, MempoolWatcher};
use super::indexer::IndexerClient;
use super::node::{NodeBlock, NodeClient};
use crate::blockchain::ChainMessage;
use crate::config::AccountConfig;
use crate::database::BackingStore;
use crate::error::{IndexerError, SystemError};
use crate::events::{BlockEvent, Event};
use crate::logging::{ErrorLogger, LogContext, MetricsLogger, PerformanceMonitor};
use crate::models::{Chain, KnownAddresses, PriceBook, Transfer};
use crate::retry::RetryConfig;
use crate::shutdown::ShutdownSignal;

const ERROR_DELAY: Duration = Duration::from_secs(3);
const CATCHUP_PAUSE: Duration = Duration::from_millis(50);
const INDEXER_FALLBACK_PAUSE: Duration = Duration::from_millis(200);
const IDENTITIES_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
enum State {
    GetHeight,
    GetNextBlock,
    ProcessBlock(NodeBlock),
    AfterBlock,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::GetHeight => "get_height",
            State::GetNextBlock => "get_next_block",
            State::ProcessBlock(_) => "process_block",
            State::AfterBlock => "after_block",
        }
    }
}

/// Polls the account chain block by block.
///
/// Kills whose stake the indexer has not caught up with are enriched on a
/// separate task, which posts the corrected transfer back through a channel
/// drained after each block.
pub struct AccountWatcher {
    config: AccountConfig,
    node: NodeClient,
    indexer: Option<IndexerClient>,
    store: Arc<dyn BackingStore>,
    registry: Arc<KnownAddresses>,
    prices: PriceBook,
    shutdown: ShutdownSignal,
    corrections_tx: mpsc::UnboundedSender<Transfer>,
    corrections_rx: mpsc::UnboundedReceiver<Transfer>,
    refresh: BTreeSet<String>,
    last_block: Option<u64>,
    block_retries: u32,
}

impl AccountWatcher {
    pub fn new(
        config: AccountConfig,
        store: Arc<dyn BackingStore>,
        registry: Arc<KnownAddresses>,
        prices: PriceBook,
        shutdown: ShutdownSignal,
    ) -> Result<Self, IndexerError> {
        let timeout = Duration::from_secs(config.request_timeout_seconds);
        let node = NodeClient::new(&config.rpc_url, config.rpc_key.clone(), timeout)?
            .with_retry(RetryConfig::for_rpc())
            .with_shutdown(shutdown.clone());
        let indexer = match &config.indexer_url {
            Some(url) if !url.is_empty() => Some(IndexerClient::new(url, timeout)?.with_shutdown(shutdown.clone())),
            _ => None,
        };
        let (corrections_tx, corrections_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            node,
            indexer,
            store,
            registry,
            prices,
            shutdown,
            corrections_tx,
            corrections_rx,
            refresh: BTreeSet::new(),
            last_block: None,
            block_retries: 0,
        })
    }

    pub fn with_indexer(mut self, indexer: IndexerClient) -> Self {
        self.indexer = Some(indexer);
        self
    }

    pub fn last_block(&self) -> Option<u64> {
        self.last_block
    }

    pub fn set_last_block(&mut self, block_number: u64) {
        self.last_block = Some(block_number);
    }

    fn spawn_side_tasks(&self, tx: &mpsc::Sender<ChainMessage>) -> Result<(), IndexerError> {
        let mempool = MempoolWatcher::new(self.node.clone(), self.store.clone(), self.shutdown.clone());
        tokio::spawn(mempool.run());

        let slow_node = NodeClient::new(&self.config.rpc_url, self.config.rpc_key.clone(), IDENTITIES_TIMEOUT)?;
        let cacher = IdentityCacher::new(
            slow_node,
            self.store.clone(),
            Duration::from_secs(self.config.identities_cache_interval_seconds),
            self.shutdown.clone(),
        );
        tokio::spawn(cacher.run(tx.clone()));
        Ok(())
    }

    /// Runs until shutdown. Only a closed output channel is fatal.
    pub async fn run(mut self, tx: mpsc::Sender<ChainMessage>) -> Result<(), IndexerError> {
        self.spawn_side_tasks(&tx)?;

        if self.last_block.is_none() {
            self.last_block = self.store.get_latest_block(Chain::Idena)?;
        }
        LogContext::new("account_watcher", "run")
            .with_metadata("resume_from", serde_json::json!(self.last_block))
            .info("Account watcher started");

        let mut state = match self.last_block {
            Some(_) => State::GetNextBlock,
            None => State::GetHeight,
        };

        while !self.shutdown.is_shutdown() {
            let current = state.clone();
            state = match self.step(current, &tx).await {
                Ok(next) => next,
                Err(e) if e.is_shutdown() => break,
                Err(e @ IndexerError::System(SystemError::ChannelClosed(_))) => return Err(e),
                Err(e) => {
                    let next = self.recover(&state, &e);
                    if !self.shutdown.sleep(ERROR_DELAY).await {
                        break;
                    }
                    next
                }
            };
        }

        LogContext::new("account_watcher", "run").info("Account watcher stopped");
        Ok(())
    }

    /// Next state after a failed step
    fn recover(&mut self, state: &State, error: &IndexerError) -> State {
        ErrorLogger::log_error(
            error,
            Some(
                LogContext::new("account_watcher", state.name())
                    .with_block_number(self.next_height())
                    .with_retry_count(self.block_retries),
            ),
        );
        match state {
            State::ProcessBlock(block) => {
                self.block_retries += 1;
                if self.block_retries > self.config.block_retry_limit {
                    MetricsLogger::log_block_skipped(Chain::Idena.as_str(), block.height, self.block_retries);
                    self.block_retries = 0;
                    self.last_block = Some(block.height);
                    State::GetNextBlock
                } else {
                    state.clone()
                }
            }
            State::AfterBlock => State::GetNextBlock,
            other => other.clone(),
        }
    }

    fn next_height(&self) -> u64 {
        self.last_block.map(|b| b + 1).unwrap_or(0)
    }

    async fn step(&mut self, state: State, tx: &mpsc::Sender<ChainMessage>) -> Result<State, IndexerError> {
        match state {
            State::GetHeight => {
                let block = self
                    .node
                    .last_block()
                    .await?
                    .ok_or_else(|| crate::error::RpcError::InvalidResponse("no last block".to_string()))?;
                self.last_block = Some(block.height);
                Ok(State::GetNextBlock)
            }
            State::GetNextBlock => match self.node.block_at(self.next_height()).await? {
                Some(block) => {
                    LogContext::new("account_watcher", "get_next_block")
                        .with_block_number(block.height)
                        .debug("Got block");
                    Ok(State::ProcessBlock(block))
                }
                None => {
                    self.shutdown.sleep(Duration::from_secs(self.config.rpc_interval_seconds)).await;
                    Ok(State::AfterBlock)
                }
            },
            State::ProcessBlock(block) => {
                let monitor = PerformanceMonitor::new("account_process_block")
                    .with_block_number(block.height);
                let tfs = self.process_block(&block).await;
                let duration = monitor.finish_with_result(&tfs);
                let tfs = tfs?;

                MetricsLogger::log_block_processed(Chain::Idena.as_str(), block.height, tfs.len(), duration);
                if !tfs.is_empty() {
                    send(tx, ChainMessage::Transfers { chain: Chain::Idena, tfs }).await?;
                }
                self.last_block = Some(block.height);
                self.block_retries = 0;
                send(tx, ChainMessage::Event(Event::Block(BlockEvent::new(Chain::Idena, block.height)))).await?;
                self.shutdown.sleep(CATCHUP_PAUSE).await;
                Ok(State::AfterBlock)
            }
            State::AfterBlock => {
                self.after_block(tx).await?;
                Ok(State::GetNextBlock)
            }
        }
    }

    /// Classifies every transaction of a block. Kills needing indexer data are
    /// emitted as they are and corrected later.
    pub async fn process_block(&mut self, block: &NodeBlock) -> Result<Vec<Transfer>, IndexerError> {
        let mut tfs = Vec::new();
        let mut refresh = Vec::new();
        let mut enrichments = Vec::new();

        for (index, hash) in block.tx_hashes().iter().enumerate() {
            let node_tx = match self.node.transaction(hash).await? {
                Some(node_tx) => node_tx,
                None => match &self.indexer {
                    Some(indexer) => {
                        LogContext::new("account_watcher", "process_block")
                            .with_transaction_hash(hash)
                            .warn("Transaction missing from node, asking the indexer");
                        let node_tx = indexer.transaction(hash).await?;
                        self.shutdown.sleep(INDEXER_FALLBACK_PAUSE).await;
                        node_tx
                    }
                    None => {
                        LogContext::new("account_watcher", "process_block")
                            .with_transaction_hash(hash)
                            .warn("Transaction missing from node and no indexer configured");
                        continue;
                    }
                },
            };

            let receipt = match node_tx.tx_type.as_str() {
                "deployContract" | "callContract" if node_tx.receipt.is_none() => self.node.tx_receipt(hash).await?,
                _ => None,
            };

            let classifier = AccountClassifier::new(
                &self.registry,
                &self.prices,
                self.store.as_ref(),
                self.config.identity_fresh_seconds,
            );
            let classification = classifier.classify(&node_tx, block.height, index as u32, receipt.as_ref(), Utc::now())?;

            refresh.extend(classification.refresh);
            if let Some(tf) = classification.transfer {
                if let Some(enrichment) = classification.enrichment {
                    enrichments.push((tf.clone(), enrichment));
                }
                if tf.should_store() {
                    tfs.push(tf);
                }
            }
        }

        // Spawned only once the whole block classified, so a retried block
        // never enriches the same kill twice
        self.refresh.extend(refresh);
        for (tf, enrichment) in enrichments {
            self.spawn_enrichment(tf, enrichment);
        }
        Ok(tfs)
    }

    fn spawn_enrichment(&self, tf: Transfer, enrichment: KillEnrichment) {
        let Some(indexer) = self.indexer.clone() else {
            LogContext::new("account_watcher", "enrich_kill")
                .with_transaction_hash(&tf.hash)
                .warn("No indexer configured, kill stays without stake data");
            return;
        };
        let task = KillEnricher {
            indexer,
            prices: self.prices.clone(),
            corrections: self.corrections_tx.clone(),
            shutdown: self.shutdown.clone(),
            attempts: self.config.enrichment_attempts,
            delay: Duration::from_secs(self.config.enrichment_delay_seconds),
        };
        tokio::spawn(task.run(tf, enrichment));
    }

    /// Emits corrected kills and refreshes identities touched by the block
    pub async fn after_block(&mut self, tx: &mpsc::Sender<ChainMessage>) -> Result<(), IndexerError> {
        let mut corrected = Vec::new();
        while let Ok(tf) = self.corrections_rx.try_recv() {
            corrected.push(tf);
        }
        if !corrected.is_empty() {
            LogContext::new("account_watcher", "after_block")
                .with_metadata("count", serde_json::json!(corrected.len()))
                .info("Emitting corrected kills");
        }
        for tf in corrected {
            send(tx, ChainMessage::Transfers { chain: Chain::Idena, tfs: vec![tf] }).await?;
        }

        let addrs = std::mem::take(&mut self.refresh);
        for addr in addrs {
            if let Err(e) = refresh_identity(&self.node, self.store.as_ref(), &addr, tx).await {
                if matches!(e, IndexerError::System(SystemError::ChannelClosed(_))) {
                    return Err(e);
                }
                ErrorLogger::log_error(
                    &e,
                    Some(LogContext::new("account_watcher", "refresh_identity").with_address(&addr)),
                );
            }
        }
        Ok(())
    }
}

async fn send(tx: &mpsc::Sender<ChainMessage>, message: ChainMessage) -> Result<(), IndexerError> {
    tx.send(message)
        .await
        .map_err(|_| IndexerError::System(SystemError::ChannelClosed("account watcher".to_string())))
}

/// Polls the indexer until it knows a kill's stake and the identity's age
struct KillEnricher {
    indexer: IndexerClient,
    prices: PriceBook,
    corrections: mpsc::UnboundedSender<Transfer>,
    shutdown: ShutdownSignal,
    attempts: u32,
    delay: Duration,
}

impl KillEnricher {
    async fn fetch(&self, tf: &Transfer, enrichment: &KillEnrichment) -> Result<Transfer, IndexerError> {
        let birth_epoch = self
            .indexer
            .birth_epoch(enrichment.epoch.saturating_sub(1), &enrichment.killed)
            .await?;
        let age = enrichment.epoch.saturating_sub(birth_epoch);
        let stake = self.indexer.kill_amount(&tf.hash).await?.unwrap_or_default();
        Ok(corrected_kill(tf, stake, age, &self.prices))
    }

    async fn run(self, tf: Transfer, enrichment: KillEnrichment) {
        for attempt in 1..=self.attempts.max(1) {
            match self.fetch(&tf, &enrichment).await {
                Ok(corrected) => {
                    LogContext::new("account_watcher", "enrich_kill")
                        .with_transaction_hash(&tf.hash)
                        .with_amount(corrected.value(true))
                        .debug("Kill enriched");
                    if self.corrections.send(corrected).is_err() {
                        LogContext::new("account_watcher", "enrich_kill").warn("Watcher gone, dropping corrected kill");
                    }
                    return;
                }
                Err(e) if e.is_shutdown() => return,
                Err(e) => ErrorLogger::log_error(
                    &e,
                    Some(
                        LogContext::new("account_watcher", "enrich_kill")
                            .with_transaction_hash(&tf.hash)
                            .with_retry_count(attempt),
                    ),
                ),
            }
            if !self.shutdown.sleep(self.delay).await {
                return;
            }
        }
        LogContext::new("account_watcher", "enrich_kill")
            .with_transaction_hash(&tf.hash)
            .error("Giving up on kill enrichment");
    }
}
