//! Deduplicating event cursor
//!
//! One cursor per (chain, contract) stream. Each poll reads the block range
//! after the last checkpoint up to the chain's safe head, hands every new log
//! to the sink once, and only then records the log's key. The checkpoint moves
//! after the whole range was handed off, so a crash mid-range re-reads the
//! range and the processed set filters what was already delivered.

use super::{LedgerClient, LogFilter};
use crate::error::{ErrorClass, RelayerError, RelayerResult};
use crate::events::{ContractEvent, EventParser};
use crate::state::StateStore;

use async_trait::async_trait;
use ethers::types::{Log, H256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Identity of a log for deduplication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessedEventKey {
    pub chain_id: u64,
    pub tx_hash: H256,
    pub log_index: u64,
}

impl ProcessedEventKey {
    pub fn from_log(chain_id: u64, log: &Log) -> Option<Self> {
        Some(Self {
            chain_id,
            tx_hash: log.transaction_hash?,
            log_index: log.log_index?.low_u64(),
        })
    }
}

/// Bounded set of processed keys, remembered with the block they came from
#[derive(Debug)]
pub struct ProcessedSet {
    entries: HashMap<ProcessedEventKey, u64>,
    /// Same keys indexed by block, oldest first
    by_block: BTreeMap<u64, Vec<ProcessedEventKey>>,
    max_entries: usize,
}

impl ProcessedSet {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            by_block: BTreeMap::new(),
            max_entries,
        }
    }

    pub fn contains(&self, key: &ProcessedEventKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: ProcessedEventKey, block_number: u64) {
        match self.entries.insert(key, block_number) {
            Some(previous) if previous == block_number => return,
            Some(previous) => self.unindex(&key, previous),
            None => {}
        }
        self.by_block.entry(block_number).or_default().push(key);

        while self.entries.len() > self.max_entries {
            if !self.evict_oldest() {
                break;
            }
        }
    }

    /// Forget keys from blocks below `block_number`
    pub fn prune_below(&mut self, block_number: u64) -> usize {
        let kept = self.by_block.split_off(&block_number);
        let expired = std::mem::replace(&mut self.by_block, kept);
        let mut removed = 0;
        for key in expired.into_values().flatten() {
            if self.entries.remove(&key).is_some() {
                removed += 1;
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn unindex(&mut self, key: &ProcessedEventKey, block_number: u64) {
        if let Some(keys) = self.by_block.get_mut(&block_number) {
            keys.retain(|k| k != key);
            if keys.is_empty() {
                self.by_block.remove(&block_number);
            }
        }
    }

    fn evict_oldest(&mut self) -> bool {
        let Some(mut oldest) = self.by_block.first_entry() else {
            return false;
        };
        if let Some(key) = oldest.get_mut().pop() {
            self.entries.remove(&key);
        }
        if oldest.get().is_empty() {
            oldest.remove();
        }
        true
    }
}

/// Receiver of decoded events
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Act on one event. A transient error makes the cursor retry the range.
    async fn dispatch(&self, event: ContractEvent) -> RelayerResult<()>;
}

/// Cursor tuning shared by every stream
#[derive(Debug, Clone, Copy)]
pub struct CursorSettings {
    pub confirmations: u64,
    pub max_block_range: u64,
    pub retention_blocks: u64,
    pub max_entries: usize,
}

pub struct EventCursor {
    stream: String,
    chain_id: u64,
    ledger: Arc<dyn LedgerClient>,
    filter: LogFilter,
    parser: EventParser,
    state: Arc<dyn StateStore>,
    settings: CursorSettings,
    last_processed: u64,
    processed: ProcessedSet,
}

impl EventCursor {
    /// Open a cursor, resuming from its persisted checkpoint.
    ///
    /// Without a checkpoint, scanning starts at `start_block` if given, or at
    /// the current safe head otherwise.
    pub async fn open(
        ledger: Arc<dyn LedgerClient>,
        filter: LogFilter,
        state: Arc<dyn StateStore>,
        settings: CursorSettings,
        start_block: Option<u64>,
    ) -> RelayerResult<Self> {
        let chain_id = ledger.chain_id();
        let stream = format!("{}:{:?}", chain_id, filter.address);

        let last_processed = match state.get_checkpoint(&stream).await? {
            Some(block) => block,
            None => match start_block {
                Some(block) => block.saturating_sub(1),
                None => ledger
                    .current_height()
                    .await?
                    .saturating_sub(settings.confirmations),
            },
        };

        let mut processed = ProcessedSet::new(settings.max_entries);
        let since = last_processed.saturating_sub(settings.retention_blocks);
        for (key, block) in state.load_processed_events(&stream, since).await? {
            processed.insert(key, block);
        }

        info!(
            "Cursor {} resuming after block {} ({} processed keys)",
            stream,
            last_processed,
            processed.len()
        );

        Ok(Self {
            stream,
            chain_id,
            ledger,
            filter,
            parser: EventParser::new(chain_id),
            state,
            settings,
            last_processed,
            processed,
        })
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn last_processed(&self) -> u64 {
        self.last_processed
    }

    /// Process the next block range. Returns the number of events dispatched.
    pub async fn poll(&mut self, sink: &dyn EventSink) -> RelayerResult<usize> {
        let height = self.ledger.current_height().await?;
        let safe_head = height.saturating_sub(self.settings.confirmations);
        let from_block = self.last_processed + 1;
        if from_block > safe_head {
            return Ok(0);
        }
        let to_block = safe_head.min(from_block + self.settings.max_block_range.max(1) - 1);

        let mut logs = self
            .ledger
            .fetch_logs(from_block, to_block, &self.filter)
            .await?;
        logs.retain(|log| !log.removed.unwrap_or(false));
        logs.sort_by_key(|log| {
            (
                log.block_number.map(|b| b.as_u64()).unwrap_or(0),
                log.log_index.map(|i| i.low_u64()).unwrap_or(0),
            )
        });

        debug!(
            "Cursor {} read {} logs in blocks {}..={}",
            self.stream,
            logs.len(),
            from_block,
            to_block
        );

        let mut dispatched = 0;
        for log in logs {
            let Some(key) = ProcessedEventKey::from_log(self.chain_id, &log) else {
                warn!("Cursor {} skipping log without tx hash or index", self.stream);
                crate::metrics::record_event_undecodable(self.chain_id);
                continue;
            };
            if self.processed.contains(&key) {
                debug!("Cursor {} skipping duplicate log {:?}", self.stream, key);
                crate::metrics::record_event_duplicate(self.chain_id);
                continue;
            }

            let event = match self.parser.parse_log(&log) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Cursor {} skipping undecodable log {:?}: {}", self.stream, key, e);
                    crate::metrics::record_event_undecodable(self.chain_id);
                    continue;
                }
            };
            let block_number = event.meta().block_number;
            let name = event.name();
            crate::metrics::record_event_received(self.chain_id, name);

            match sink.dispatch(event).await {
                Ok(()) => dispatched += 1,
                Err(e) if e.class() == ErrorClass::TransientInfra => {
                    warn!(
                        "Cursor {} stopping at block {}, {} not handled: {}",
                        self.stream, block_number, name, e
                    );
                    return Err(e);
                }
                Err(e) => {
                    error!("Cursor {} dropping {} event {:?}: {}", self.stream, name, key, e);
                    crate::metrics::record_event_rejected(self.chain_id, name);
                }
            }

            self.mark(key, block_number).await?;
        }

        self.state
            .save_checkpoint(&self.stream, self.chain_id, to_block)
            .await?;
        self.last_processed = to_block;
        crate::metrics::record_cursor_height(&self.stream, to_block);

        self.prune().await?;
        Ok(dispatched)
    }

    async fn mark(&mut self, key: ProcessedEventKey, block_number: u64) -> RelayerResult<()> {
        self.state
            .record_processed_event(&self.stream, &key, block_number)
            .await?;
        self.processed.insert(key, block_number);
        Ok(())
    }

    async fn prune(&mut self) -> RelayerResult<()> {
        let below = self
            .last_processed
            .saturating_sub(self.settings.retention_blocks);
        if below == 0 {
            return Ok(());
        }
        let removed = self.processed.prune_below(below);
        if removed > 0 {
            self.state
                .prune_processed_events(&self.stream, below)
                .await?;
            debug!("Cursor {} pruned {} keys below block {}", self.stream, removed, below);
        }
        Ok(())
    }
}

impl std::fmt::Debug for EventCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventCursor")
            .field("stream", &self.stream)
            .field("last_processed", &self.last_processed)
            .field("processed", &self.processed.len())
            .finish()
    }
}

/// Scripted ledger and recording sink shared by cursor and engine tests
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// In-memory chain: logs are filtered by block range and topic only
    pub(crate) struct ScriptedLedger {
        chain_id: u64,
        height: Mutex<u64>,
        logs: Mutex<Vec<Log>>,
    }

    impl ScriptedLedger {
        pub(crate) fn new(chain_id: u64, height: u64) -> Self {
            Self {
                chain_id,
                height: Mutex::new(height),
                logs: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn push(&self, log: Log) {
            self.logs.lock().unwrap().push(log);
        }

        pub(crate) fn set_height(&self, height: u64) {
            *self.height.lock().unwrap() = height;
        }
    }

    #[async_trait]
    impl LedgerClient for ScriptedLedger {
        fn chain_id(&self) -> u64 {
            self.chain_id
        }

        async fn current_height(&self) -> RelayerResult<u64> {
            Ok(*self.height.lock().unwrap())
        }

        async fn fetch_logs(&self, from_block: u64, to_block: u64, filter: &LogFilter) -> RelayerResult<Vec<Log>> {
            filter.validate(from_block, to_block)?;
            Ok(self
                .logs
                .lock()
                .unwrap()
                .iter()
                .filter(|log| {
                    let block = log.block_number.map(|b| b.as_u64()).unwrap_or(0);
                    block >= from_block
                        && block <= to_block
                        && log.topics.first().is_some_and(|t| filter.topics.contains(t))
                })
                .cloned()
                .collect())
        }
    }

    /// Records dispatched events; scripted results are consumed first
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) events: Mutex<Vec<ContractEvent>>,
        pub(crate) results: Mutex<VecDeque<RelayerResult<()>>>,
    }

    impl RecordingSink {
        pub(crate) fn fail_next(&self, err: RelayerError) {
            self.results.lock().unwrap().push_back(Err(err));
        }

        pub(crate) fn count(&self) -> usize {
            self.events.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn dispatch(&self, event: ContractEvent) -> RelayerResult<()> {
            if let Some(result) = self.results.lock().unwrap().pop_front() {
                result?;
            }
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }
}
