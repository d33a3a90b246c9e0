use futures::future::BoxFuture;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::debug;

use super::{Block, BlockLog, BlockLogError, SourceDescriptor, SourceKey};

/// How many ack/requeue events [`MemoryBlockLog::new`] keeps.
pub const DEFAULT_EVENT_HISTORY: usize = 1024;

/// Recent acks and requeues, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockEvent {
    Acked {
        source: SourceKey,
        seq: i64,
        committed_marker: Option<i64>,
    },
    Requeued {
        source: SourceKey,
        seq: i64,
    },
}

struct SourceQueue {
    descriptor: SourceDescriptor,
    blocks: VecDeque<Block>,
    /// Requeued blocks, sorted by sequence.
    pending: VecDeque<Block>,
    claim: Option<(u64, String)>,
    ready: bool,
    closed: bool,
    fenced: bool,
    acked_through: Option<i64>,
    last_committed_marker: Option<i64>,
}

impl SourceQueue {
    fn new(descriptor: SourceDescriptor) -> Self {
        Self {
            descriptor,
            blocks: VecDeque::new(),
            pending: VecDeque::new(),
            claim: None,
            ready: false,
            closed: false,
            fenced: false,
            acked_through: None,
            last_committed_marker: None,
        }
    }
}

struct LogState {
    sources: BTreeMap<SourceKey, SourceQueue>,
    events: VecDeque<BlockEvent>,
    event_history: usize,
}

impl LogState {
    fn record(&mut self, event: BlockEvent) {
        if self.event_history == 0 {
            return;
        }
        if self.events.len() == self.event_history {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

/// In-process block log: one FIFO per source plus requeued blocks that are
/// redelivered first.
pub struct MemoryBlockLog {
    state: Mutex<LogState>,
    changed: Notify,
}

impl Default for MemoryBlockLog {
    fn default() -> Self {
        Self::with_event_history(DEFAULT_EVENT_HISTORY)
    }
}

impl MemoryBlockLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `limit` recent events; `0` records none.
    pub fn with_event_history(limit: usize) -> Self {
        Self {
            state: Mutex::new(LogState {
                sources: BTreeMap::new(),
                events: VecDeque::new(),
                event_history: limit,
            }),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a source. Re-adding a known source keeps its queued blocks and
    /// reopens it if it was closed or fenced.
    pub fn add_source(&self, descriptor: SourceDescriptor) {
        let key = descriptor.key();
        {
            let mut state = self.lock();
            let queue = state
                .sources
                .entry(key)
                .or_insert_with(|| SourceQueue::new(descriptor));
            queue.closed = false;
            queue.fenced = false;
        }
        self.changed.notify_waiters();
    }

    pub fn push_block(&self, source: &SourceKey, block: Block) -> Result<(), BlockLogError> {
        {
            let mut state = self.lock();
            let queue = state
                .sources
                .get_mut(source)
                .ok_or_else(|| BlockLogError::UnknownSource(source.clone()))?;
            queue.blocks.push_back(block);
        }
        self.changed.notify_waiters();
        Ok(())
    }

    /// Ends the stream: once drained, polls resolve with `None`.
    pub fn close_source(&self, source: &SourceKey) {
        if let Some(queue) = self.lock().sources.get_mut(source) {
            queue.closed = true;
        }
        self.changed.notify_waiters();
    }

    /// Fences the source: every later poll fails with [`BlockLogError::Fenced`].
    pub fn fence_source(&self, source: &SourceKey) {
        if let Some(queue) = self.lock().sources.get_mut(source) {
            queue.fenced = true;
        }
        self.changed.notify_waiters();
    }

    /// Highest acked block sequence for the source.
    pub fn acked_through(&self, source: &SourceKey) -> Option<i64> {
        self.lock()
            .sources
            .get(source)
            .and_then(|queue| queue.acked_through)
    }

    pub fn last_committed_marker(&self, source: &SourceKey) -> Option<i64> {
        self.lock()
            .sources
            .get(source)
            .and_then(|queue| queue.last_committed_marker)
    }

    /// Sequence of the next requeued block to be redelivered, if any.
    pub fn pending_seq(&self, source: &SourceKey) -> Option<i64> {
        self.lock()
            .sources
            .get(source)
            .and_then(|queue| queue.pending.front().map(Block::seq))
    }

    /// Blocks not yet handed out, requeued ones included.
    pub fn queued_len(&self, source: &SourceKey) -> usize {
        self.lock()
            .sources
            .get(source)
            .map_or(0, |queue| queue.blocks.len() + queue.pending.len())
    }

    /// Who currently holds the source's claim.
    pub fn claim_holder(&self, source: &SourceKey) -> Option<String> {
        self.lock()
            .sources
            .get(source)
            .and_then(|queue| queue.claim.as_ref().map(|(_, holder)| holder.clone()))
    }

    pub fn events(&self) -> Vec<BlockEvent> {
        self.lock().events.iter().cloned().collect()
    }

    fn try_take(&self, source: &SourceKey) -> Option<Result<Option<Block>, BlockLogError>> {
        let mut state = self.lock();
        let Some(queue) = state.sources.get_mut(source) else {
            return Some(Err(BlockLogError::UnknownSource(source.clone())));
        };
        if queue.fenced {
            return Some(Err(BlockLogError::Fenced(source.clone())));
        }
        if let Some(block) = queue.pending.pop_front() {
            return Some(Ok(Some(block)));
        }
        if let Some(block) = queue.blocks.pop_front() {
            return Some(Ok(Some(block)));
        }
        if queue.closed {
            return Some(Ok(None));
        }
        None
    }
}

impl BlockLog for MemoryBlockLog {
    fn poll<'a>(
        &'a self,
        source: &'a SourceKey,
    ) -> BoxFuture<'a, Result<Option<Block>, BlockLogError>> {
        Box::pin(async move {
            loop {
                // Register interest before looking so a push between the check and the
                // await is not missed.
                let notified = self.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(result) = self.try_take(source) {
                    return result;
                }
                notified.await;
            }
        })
    }

    fn discard(&self, source: &SourceKey, block: Block) -> Result<(), BlockLogError> {
        let mut state = self.lock();
        let queue = state
            .sources
            .get_mut(source)
            .ok_or_else(|| BlockLogError::UnknownSource(source.clone()))?;
        if queue.fenced {
            return Err(BlockLogError::Fenced(source.clone()));
        }

        let seq = block.seq();
        let committed_marker = block.committed_marker();
        queue.acked_through = Some(queue.acked_through.map_or(seq, |prev| prev.max(seq)));
        if committed_marker.is_some() {
            queue.last_committed_marker = committed_marker;
        }
        state.record(BlockEvent::Acked {
            source: source.clone(),
            seq,
            committed_marker,
        });
        debug!(event = "block_discarded", source = %source, seq, "block acked");
        Ok(())
    }

    fn set_pending(&self, source: &SourceKey, block: Block) -> Result<(), BlockLogError> {
        {
            let mut state = self.lock();
            let queue = state
                .sources
                .get_mut(source)
                .ok_or_else(|| BlockLogError::UnknownSource(source.clone()))?;
            let seq = block.seq();
            let at = queue.pending.partition_point(|pending| pending.seq() <= seq);
            queue.pending.insert(at, block);
            state.record(BlockEvent::Requeued {
                source: source.clone(),
                seq,
            });
        }
        self.changed.notify_waiters();
        Ok(())
    }

    fn claim(&self, source: &SourceKey, claim_id: u64, holder: &str) -> Result<(), BlockLogError> {
        let mut state = self.lock();
        let queue = state
            .sources
            .get_mut(source)
            .ok_or_else(|| BlockLogError::UnknownSource(source.clone()))?;
        if let Some((id, current)) = &queue.claim {
            if *id == claim_id {
                return Ok(());
            }
            return Err(BlockLogError::Claimed {
                source: source.clone(),
                holder: current.clone(),
            });
        }
        queue.claim = Some((claim_id, holder.to_string()));
        debug!(event = "source_claimed", source = %source, holder, "source claimed");
        Ok(())
    }

    fn release(&self, source: &SourceKey, claim_id: u64) {
        let mut state = self.lock();
        if let Some(queue) = state.sources.get_mut(source) {
            if queue.claim.as_ref().is_some_and(|(id, _)| *id == claim_id) {
                queue.claim = None;
                debug!(event = "source_released", source = %source, "source claim released");
            }
        }
    }

    fn set_ready_for_polling(&self, source: &SourceKey, ready: bool) {
        if let Some(queue) = self.lock().sources.get_mut(source) {
            queue.ready = ready;
        }
    }

    fn is_ready_for_polling(&self, source: &SourceKey) -> bool {
        self.lock()
            .sources
            .get(source)
            .is_some_and(|queue| queue.ready)
    }

    fn sources(&self) -> Vec<SourceDescriptor> {
        self.lock()
            .sources
            .values()
            .map(|queue| queue.descriptor.clone())
            .collect()
    }
}
