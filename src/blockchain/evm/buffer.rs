use std::collections::BTreeMap;

use super::raw_log::RawLog;

const MAX_BLOCK_TIMES: usize = 500;
const KEEP_BLOCK_TIMES: usize = 200;

/// Logs waiting for finality, block number to (log index to log).
///
/// Keeping each log under its own index lets a reorg notification remove one log
/// without touching its siblings.
#[derive(Debug, Default)]
pub struct LogBuffer {
    blocks: BTreeMap<u64, BTreeMap<u32, RawLog>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffered blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn log_count(&self) -> usize {
        self.blocks.values().map(BTreeMap::len).sum()
    }

    pub fn contains_block(&self, block_number: u64) -> bool {
        self.blocks.contains_key(&block_number)
    }

    /// Stores a log, or drops it when the node marks it removed.
    ///
    /// Returns false for a removal that matched nothing.
    pub fn apply(&mut self, log: RawLog) -> bool {
        if log.removed {
            return self.remove(log.block_number, log.log_index).is_some();
        }
        self.blocks.entry(log.block_number).or_default().insert(log.log_index, log);
        true
    }

    pub fn remove(&mut self, block_number: u64, log_index: u32) -> Option<RawLog> {
        let block = self.blocks.get_mut(&block_number)?;
        let removed = block.remove(&log_index);
        if block.is_empty() {
            self.blocks.remove(&block_number);
        }
        removed
    }

    pub fn clear_block(&mut self, block_number: u64) {
        self.blocks.remove(&block_number);
    }

    pub fn oldest_block(&self) -> Option<u64> {
        self.blocks.keys().next().copied()
    }

    /// Logs of the oldest block in log index order
    pub fn peek_oldest(&self) -> Option<(u64, Vec<RawLog>)> {
        let (number, logs) = self.blocks.iter().next()?;
        Some((*number, logs.values().cloned().collect()))
    }

    pub fn pop_oldest(&mut self) -> Option<(u64, Vec<RawLog>)> {
        let number = self.oldest_block()?;
        let logs = self.blocks.remove(&number)?;
        Some((number, logs.into_values().collect()))
    }
}

/// Block timestamps seen in heads, bounded to the most recent blocks
#[derive(Debug, Default)]
pub struct BlockTimes {
    times: BTreeMap<u64, u64>,
}

impl BlockTimes {
    pub fn get(&self, block_number: u64) -> Option<u64> {
        self.times.get(&block_number).copied()
    }

    pub fn contains(&self, block_number: u64) -> bool {
        self.times.contains_key(&block_number)
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn insert(&mut self, block_number: u64, timestamp: u64) {
        self.times.insert(block_number, timestamp);
        if self.times.len() > MAX_BLOCK_TIMES {
            let cutoff = self.times.keys().rev().nth(KEEP_BLOCK_TIMES - 1).copied();
            if let Some(cutoff) = cutoff {
                self.times = self.times.split_off(&cutoff);
            }
        }
    }
}
