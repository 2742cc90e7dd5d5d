use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::buffer::{BlockTimes, LogBuffer};
use super::classifier::{group_by_transaction, TxClassifier};
use super::raw_log::{widen, RawLog, LP_BURN_TOPIC, LP_MINT_TOPIC, NULL_ADDRESS, TRANSFER_TOPIC};
use crate::blockchain::rpc_client::{parse_hex_u64, LogFilter, RpcClient, TopicFilter};
use crate::blockchain::ChainMessage;
use crate::config::EvmConfig;
use crate::database::BackingStore;
use crate::error::{IndexerError, ProcessingError, RpcError, SystemError};
use crate::events::{BlockEvent, Event};
use crate::logging::{ErrorLogger, LogContext, MetricsLogger, PerformanceMonitor};
use crate::models::{AddressType, Chain, KnownAddresses, PriceBook, Transfer};
use crate::retry::{RetryConfig, RetryManager};
use crate::shutdown::ShutdownSignal;

const MAX_BLOCK_FAILURES: u32 = 3;
const SIGNER_ATTEMPTS: u32 = 3;
const BLOCK_TIME_ATTEMPTS: u32 = 3;
const BACKFILL_REQUEST_PAUSE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Subscription {
    Head,
    Log,
}

/// Follows the EVM chain over a websocket and emits finalized transfers.
///
/// Everything runs on one task: stream messages, the one-second finality reader
/// and shutdown are multiplexed with `select!`, so the buffer needs no lock.
pub struct EvmWatcher {
    config: EvmConfig,
    rpc: RpcClient,
    history: RpcClient,
    store: Arc<dyn BackingStore>,
    registry: Arc<KnownAddresses>,
    prices: PriceBook,
    shutdown: ShutdownSignal,
    buffer: LogBuffer,
    block_times: BlockTimes,
    signers: HashMap<String, String>,
    last_block: u64,
    block_failures: u32,
}

impl EvmWatcher {
    pub fn new(
        config: EvmConfig,
        store: Arc<dyn BackingStore>,
        registry: Arc<KnownAddresses>,
        prices: PriceBook,
        shutdown: ShutdownSignal,
    ) -> Result<Self, IndexerError> {
        let timeout = Duration::from_secs(config.request_timeout_seconds);
        let retry = RetryConfig::fixed(config.rpc_attempts, Duration::from_secs(config.rpc_retry_delay_seconds));
        let rpc = RpcClient::new(&config.rpc_url, timeout)?
            .with_retry(retry.clone())
            .with_shutdown(shutdown.clone());
        let history = RpcClient::new(config.history_url(), timeout)?
            .with_retry(retry)
            .with_shutdown(shutdown.clone());

        Ok(Self {
            config,
            rpc,
            history,
            store,
            registry,
            prices,
            shutdown,
            buffer: LogBuffer::new(),
            block_times: BlockTimes::default(),
            signers: HashMap::new(),
            last_block: 0,
            block_failures: 0,
        })
    }

    pub fn buffer(&self) -> &LogBuffer {
        &self.buffer
    }

    pub fn last_block(&self) -> u64 {
        self.last_block
    }

    pub fn set_last_block(&mut self, block_number: u64) {
        self.last_block = block_number;
    }

    fn pools(&self) -> Vec<String> {
        self.registry.addrs_of_type(AddressType::Pool)
    }

    fn transfer_filter(&self) -> LogFilter {
        LogFilter::new(vec![TopicFilter::One(TRANSFER_TOPIC.to_string())]).at(&self.config.token_contract)
    }

    /// Log filters for the token and every known pool: liquidity events plus
    /// transfers of any token out of and into the pool
    pub fn log_filters(&self) -> Vec<LogFilter> {
        let mut filters = vec![self.transfer_filter()];
        for pool in self.pools() {
            let lp_topics = TopicFilter::OneOf(vec![LP_MINT_TOPIC.to_string(), LP_BURN_TOPIC.to_string()]);
            filters.push(LogFilter::new(vec![lp_topics]).at(&pool));
            filters.push(LogFilter::new(vec![
                TopicFilter::One(TRANSFER_TOPIC.to_string()),
                TopicFilter::One(widen(&pool)),
                TopicFilter::Any,
            ]));
            filters.push(LogFilter::new(vec![
                TopicFilter::One(TRANSFER_TOPIC.to_string()),
                TopicFilter::Any,
                TopicFilter::One(widen(&pool)),
            ]));
        }
        filters
    }

    /// Runs until shutdown, reconnecting with backoff after stream failures
    pub async fn run(mut self, tx: mpsc::Sender<ChainMessage>) -> Result<(), IndexerError> {
        self.last_block = self.store.get_latest_block(Chain::Bsc)?.unwrap_or(0);
        LogContext::new("evm_watcher", "run")
            .with_block_number(self.last_block)
            .info("EVM watcher started");

        let reconnect = RetryManager::new("evm_stream", RetryConfig::for_rpc());
        let mut failures = 0;
        loop {
            if self.shutdown.is_shutdown() {
                break;
            }
            let connected_at = Instant::now();
            match self.stream(&tx).await {
                Ok(()) => break,
                Err(e) if e.is_shutdown() => break,
                Err(e @ IndexerError::System(SystemError::ChannelClosed(_))) => return Err(e),
                Err(e) => {
                    if connected_at.elapsed() > Duration::from_secs(60) {
                        failures = 0;
                    }
                    failures += 1;
                    ErrorLogger::log_error(
                        &e,
                        Some(LogContext::new("evm_watcher", "stream").with_retry_count(failures)),
                    );
                    if !self.shutdown.sleep(reconnect.delay_after(failures)).await {
                        break;
                    }
                }
            }
        }

        LogContext::new("evm_watcher", "run").info("EVM watcher stopped");
        Ok(())
    }

    /// One connection lifetime. Returns `Ok` only on shutdown.
    async fn stream(&mut self, tx: &mpsc::Sender<ChainMessage>) -> Result<(), IndexerError> {
        let (ws, _) = connect_async(self.config.ws_url.as_str()).await?;
        let (mut sink, mut stream) = ws.split();

        let mut pending: HashMap<u64, Subscription> = HashMap::new();
        let mut subscriptions: HashMap<String, Subscription> = HashMap::new();

        let mut requests = vec![(json!(["newHeads"]), Subscription::Head)];
        for filter in self.log_filters() {
            requests.push((json!(["logs", filter]), Subscription::Log));
        }
        for (id, (params, kind)) in requests.into_iter().enumerate() {
            let id = id as u64 + 1;
            let request = json!({"jsonrpc": "2.0", "id": id, "method": "eth_subscribe", "params": params});
            sink.send(Message::Text(request.to_string())).await?;
            pending.insert(id, kind);
        }
        LogContext::new("evm_watcher", "subscribe")
            .with_metadata("subscriptions", json!(pending.len()))
            .info("Subscribed");

        let silence = Duration::from_secs(self.config.ws_event_timeout_seconds);
        let mut last_message = Instant::now();
        let mut reader = tokio::time::interval(Duration::from_secs(1));
        reader.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = sink.close().await;
                    return Ok(());
                }
                _ = reader.tick() => {
                    if last_message.elapsed() > silence {
                        return Err(IndexerError::Rpc(RpcError::Stream(format!(
                            "no messages for {}s",
                            silence.as_secs()
                        ))));
                    }
                    self.drain_final(Utc::now(), tx).await?;
                }
                message = stream.next() => {
                    last_message = Instant::now();
                    match message {
                        None => return Err(IndexerError::Rpc(RpcError::Stream("stream ended".to_string()))),
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(Message::Text(text))) => {
                            self.handle_message(&text, &mut pending, &mut subscriptions, tx).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            return Err(IndexerError::Rpc(RpcError::Stream(format!("closed by server: {:?}", frame))));
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    async fn handle_message(
        &mut self,
        text: &str,
        pending: &mut HashMap<u64, Subscription>,
        subscriptions: &mut HashMap<String, Subscription>,
        tx: &mpsc::Sender<ChainMessage>,
    ) -> Result<(), IndexerError> {
        let message: Value = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                LogContext::new("evm_watcher", "handle_message").warn(&format!("Unparseable message: {}", e));
                return Ok(());
            }
        };

        if let Some(id) = message.get("id").and_then(Value::as_u64) {
            if let Some(error) = message.get("error") {
                return Err(IndexerError::Rpc(RpcError::InvalidResponse(format!("subscription {}: {}", id, error))));
            }
            if let (Some(kind), Some(sub_id)) = (pending.remove(&id), message.get("result").and_then(Value::as_str)) {
                subscriptions.insert(sub_id.to_string(), kind);
            }
            return Ok(());
        }

        if message.get("method").and_then(Value::as_str) != Some("eth_subscription") {
            return Ok(());
        }
        let params = &message["params"];
        let kind = params["subscription"].as_str().and_then(|s| subscriptions.get(s)).copied();
        match kind {
            Some(Subscription::Head) => {
                let head = &params["result"];
                let number = head["number"].as_str().map(parse_hex_u64).transpose()?;
                let timestamp = head["timestamp"].as_str().map(parse_hex_u64).transpose()?;
                match (number, timestamp) {
                    (Some(number), Some(timestamp)) => self.handle_head(number, timestamp, tx).await?,
                    _ => LogContext::new("evm_watcher", "handle_head").warn("Head without number or timestamp"),
                }
            }
            Some(Subscription::Log) => match serde_json::from_value::<RawLog>(params["result"].clone()) {
                Ok(log) => self.handle_log(log).await,
                Err(e) => LogContext::new("evm_watcher", "handle_log").warn(&format!("Malformed log: {}", e)),
            },
            None => LogContext::new("evm_watcher", "handle_message").debug("Notification for unknown subscription"),
        }
        Ok(())
    }

    /// Buffers a log or applies a removal. Removals of unseen logs are ignored.
    pub async fn handle_log(&mut self, log: RawLog) {
        LogContext::new("evm_watcher", "handle_log")
            .with_block_number(log.block_number)
            .with_transaction_hash(&log.transaction_hash)
            .with_metadata("log_index", json!(log.log_index))
            .with_metadata("removed", json!(log.removed))
            .debug("New log");

        if log.removed {
            self.buffer.apply(log);
            return;
        }
        if !self.signers.contains_key(&log.transaction_hash) {
            let signer = self.fetch_signer(&log.transaction_hash).await;
            self.signers.insert(log.transaction_hash.clone(), signer);
        }
        self.buffer.apply(log);
    }

    /// Records the head's time, backfills any gap since the previous head and
    /// announces the new height
    pub async fn handle_head(
        &mut self,
        number: u64,
        timestamp: u64,
        tx: &mpsc::Sender<ChainMessage>,
    ) -> Result<(), IndexerError> {
        self.block_times.insert(number, timestamp);

        if self.last_block != 0 && number > self.last_block + 1 {
            LogContext::new("evm_watcher", "handle_head")
                .with_block_number(number)
                .with_metadata("gap", json!(number - self.last_block))
                .warn("Gap since last head, fetching potentially missing logs");
            self.backfill(self.last_block, number).await?;
        }
        self.last_block = number;

        tx.send(ChainMessage::Event(Event::Block(BlockEvent::new(Chain::Bsc, number))))
            .await
            .map_err(|_| SystemError::ChannelClosed("evm events".to_string()))?;
        Ok(())
    }

    /// Processes every buffered block whose finality delay has passed.
    ///
    /// A block that fails three times in a row is dropped and logged as a gap.
    pub async fn drain_final(&mut self, now: DateTime<Utc>, tx: &mpsc::Sender<ChainMessage>) -> Result<usize, IndexerError> {
        let mut drained = 0;
        while let Some(number) = self.buffer.oldest_block() {
            let block_time = self.block_time(number).await;
            if now.timestamp() < (block_time + self.config.transfer_delay_seconds) as i64 {
                break;
            }
            let Some((_, logs)) = self.buffer.peek_oldest() else {
                break;
            };

            let monitor = PerformanceMonitor::new("evm_process_block").with_metadata("block_number", json!(number));
            let result = self.process_block(number, block_time, logs);
            let duration = monitor.finish_with_result(&result);

            match result {
                Ok(tfs) => {
                    self.block_failures = 0;
                    self.finish_block(number);
                    MetricsLogger::log_block_processed(Chain::Bsc.as_str(), number, tfs.len(), duration);
                    drained += 1;
                    if !tfs.is_empty() {
                        tx.send(ChainMessage::Transfers { chain: Chain::Bsc, tfs })
                            .await
                            .map_err(|_| SystemError::ChannelClosed("evm transfers".to_string()))?;
                    }
                }
                Err(e) => {
                    self.block_failures += 1;
                    ErrorLogger::log_error(
                        &IndexerError::Processing(e),
                        Some(
                            LogContext::new("evm_watcher", "drain_final")
                                .with_block_number(number)
                                .with_retry_count(self.block_failures),
                        ),
                    );
                    if self.block_failures >= MAX_BLOCK_FAILURES {
                        MetricsLogger::log_block_skipped(Chain::Bsc.as_str(), number, self.block_failures);
                        self.finish_block(number);
                        self.block_failures = 0;
                        continue;
                    }
                    break;
                }
            }
        }
        Ok(drained)
    }

    /// Drops a block from the buffer along with its cached signers
    fn finish_block(&mut self, number: u64) {
        if let Some((_, logs)) = self.buffer.pop_oldest() {
            debug_assert!(logs.iter().all(|l| l.block_number == number));
            for log in logs {
                self.signers.remove(&log.transaction_hash);
            }
        }
    }

    /// Groups a final block's logs by transaction and classifies each group
    pub fn process_block(&self, number: u64, block_time: u64, logs: Vec<RawLog>) -> Result<Vec<Transfer>, ProcessingError> {
        let timestamp = Utc.timestamp_opt(block_time as i64, 0).single();
        let classifier = TxClassifier::new(&self.registry, &self.prices, &self.config.token_contract);

        let mut tfs = Vec::new();
        for group in group_by_transaction(logs) {
            let hash = &group[0].transaction_hash;
            let signer = self.signers.get(hash).map(String::as_str).unwrap_or(NULL_ADDRESS);
            match classifier.classify(&group, timestamp, signer)? {
                Some(tf) => tfs.push(tf),
                None => LogContext::new("evm_watcher", "process_block")
                    .with_block_number(number)
                    .with_transaction_hash(hash)
                    .debug("Transaction produced no transfer"),
            }
        }
        Ok(tfs)
    }

    /// Cached head time, else a few lookups, else now
    async fn block_time(&mut self, number: u64) -> u64 {
        if let Some(time) = self.block_times.get(number) {
            return time;
        }
        LogContext::new("evm_watcher", "block_time")
            .with_block_number(number)
            .warn("Block time cache miss");

        for attempt in 1..=BLOCK_TIME_ATTEMPTS {
            match self.rpc.get_block_timestamp(number).await {
                Ok(Some(time)) => {
                    self.block_times.insert(number, time);
                    return time;
                }
                Ok(None) => {}
                Err(e) => ErrorLogger::log_error(
                    &e,
                    Some(LogContext::new("evm_watcher", "block_time").with_block_number(number).with_retry_count(attempt)),
                ),
            }
            if attempt < BLOCK_TIME_ATTEMPTS && !self.shutdown.sleep(Duration::from_secs(2)).await {
                break;
            }
        }

        let now = Utc::now().timestamp().max(0) as u64;
        LogContext::new("evm_watcher", "block_time")
            .with_block_number(number)
            .warn(&format!("Assigning current time {} to block", now));
        self.block_times.insert(number, now);
        now
    }

    /// Signer of a transaction, the null address when the node never returns it
    async fn fetch_signer(&self, tx_hash: &str) -> String {
        for attempt in 1..=SIGNER_ATTEMPTS {
            match self.rpc.get_transaction_signer(tx_hash).await {
                Ok(Some(signer)) => return signer,
                Ok(None) => {}
                Err(e) => ErrorLogger::log_error(
                    &e,
                    Some(
                        LogContext::new("evm_watcher", "fetch_signer")
                            .with_transaction_hash(tx_hash)
                            .with_retry_count(attempt),
                    ),
                ),
            }
            if attempt < SIGNER_ATTEMPTS && !self.shutdown.sleep(Duration::from_secs(1)).await {
                break;
            }
        }
        NULL_ADDRESS.to_string()
    }

    /// Re-reads logs for blocks strictly between `from` and `until` from the
    /// history endpoint and replays them into the buffer
    pub async fn backfill(&mut self, from: u64, until: u64) -> Result<(), IndexerError> {
        if until <= from + 1 {
            return Ok(());
        }
        let (first, last) = (from + 1, until - 1);
        let batch = self.config.backfill_batch_size.max(1);

        let mut batch_start = first;
        while batch_start <= last {
            let batch_end = batch_start.saturating_add(batch - 1).min(last);
            LogContext::new("evm_watcher", "backfill")
                .with_metadata("from_block", json!(batch_start))
                .with_metadata("to_block", json!(batch_end))
                .info("Fetching missing logs");

            let mut logs = Vec::new();
            for (i, filter) in self.log_filters().into_iter().enumerate() {
                if i > 0 && !self.shutdown.sleep(BACKFILL_REQUEST_PAUSE).await {
                    return Err(IndexerError::System(SystemError::Shutdown));
                }
                logs.extend(self.history.get_logs(&filter.range(batch_start, batch_end)).await?);
            }

            // Times and signers first, so a half-replayed block never reaches the reader
            let blocks: BTreeSet<u64> = logs.iter().map(|l| l.block_number).collect();
            for number in &blocks {
                if !self.block_times.contains(*number) {
                    if let Some(time) = self.rpc.get_block_timestamp(*number).await? {
                        self.block_times.insert(*number, time);
                    }
                }
            }
            let hashes: BTreeSet<String> = logs.iter().map(|l| l.transaction_hash.clone()).collect();
            for hash in hashes {
                if !self.signers.contains_key(&hash) {
                    let signer = self.fetch_signer(&hash).await;
                    self.signers.insert(hash, signer);
                }
            }

            // Removal notices may have been missed for these blocks
            for number in &blocks {
                self.buffer.clear_block(*number);
            }
            logs.sort_by_key(|l| (l.block_number, l.log_index));
            let count = logs.len();
            for log in logs {
                self.buffer.apply(log);
            }
            LogContext::new("evm_watcher", "backfill")
                .with_metadata("logs", json!(count))
                .with_metadata("blocks", json!(blocks.len()))
                .debug("Backfill batch buffered");

            batch_start = batch_end + 1;
        }
        Ok(())
    }
}
