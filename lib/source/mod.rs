//! Sources, blocks and the durable row log they are polled from.

mod memory;

pub use memory::{BlockEvent, MemoryBlockLog};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

use crate::codec::Schema;

// `Display`/`Error` are implemented by hand: thiserror would treat the
// `source` field of `Claimed` as the error cause, which `SourceKey` is not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockLogError {
    /// The source was fenced (mastership moved away); its pump must stop.
    Fenced(SourceKey),

    UnknownSource(SourceKey),

    /// Another pump or protocol session is consuming the source.
    Claimed { source: SourceKey, holder: String },

    Other(String),
}

impl fmt::Display for BlockLogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockLogError::Fenced(source) => write!(f, "source {source} is fenced"),
            BlockLogError::UnknownSource(source) => {
                write!(f, "source {source} is not known to the block log")
            }
            BlockLogError::Claimed { source, holder } => {
                write!(f, "source {source} is claimed by {holder}")
            }
            BlockLogError::Other(msg) => write!(f, "block log error: {msg}"),
        }
    }
}

impl std::error::Error for BlockLogError {}

/// Identity of one exportable stream: a table on a partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceKey {
    pub table_name: String,
    pub partition_id: i32,
}

impl SourceKey {
    pub fn new(table_name: impl Into<String>, partition_id: i32) -> Self {
        Self {
            table_name: table_name.into(),
            partition_id,
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table_name, self.partition_id)
    }
}

/// What a source advertises about itself to decoders and remote consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub table_name: String,
    pub partition_id: i32,
    pub signature: String,
    pub generation: u64,
}

impl SourceDescriptor {
    pub fn new(table_name: impl Into<String>, partition_id: i32, generation: u64) -> Self {
        let table_name = table_name.into();
        Self {
            signature: table_name.clone(),
            table_name,
            partition_id,
            generation,
        }
    }

    pub fn key(&self) -> SourceKey {
        SourceKey::new(self.table_name.clone(), self.partition_id)
    }
}

/// One polled chunk of serialized rows.
///
/// Deliberately not `Clone`: a block is handed back to the log exactly once, either
/// through [`BlockLog::discard`] or [`BlockLog::set_pending`].
#[derive(Debug)]
pub struct Block {
    seq: i64,
    committed_seq: Option<i64>,
    row_count: u32,
    schema: Arc<Schema>,
    data: Arc<[u8]>,
    start_position: usize,
    committed_marker: Option<i64>,
}

impl Block {
    pub fn new(
        seq: i64,
        schema: Arc<Schema>,
        data: Vec<u8>,
        row_count: u32,
        committed_seq: Option<i64>,
    ) -> Self {
        Self {
            seq,
            committed_seq,
            row_count,
            schema,
            data: data.into(),
            start_position: 0,
            committed_marker: None,
        }
    }

    /// Sequence number of the last row in the block.
    pub fn seq(&self) -> i64 {
        self.seq
    }

    pub fn committed_seq(&self) -> Option<i64> {
        self.committed_seq
    }

    pub fn row_count(&self) -> u32 {
        self.row_count
    }

    pub fn generation(&self) -> u64 {
        self.schema.generation
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Unread rows, from the block's start position.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.start_position..]
    }

    pub fn start_position(&self) -> usize {
        self.start_position
    }

    /// Marker handed back on ack: the txn id of the row whose sequence matched
    /// `committed_seq`.
    pub fn committed_marker(&self) -> Option<i64> {
        self.committed_marker
    }

    pub fn set_committed_marker(&mut self, marker: Option<i64>) {
        self.committed_marker = marker;
    }

    /// Read-only handle that can travel to a decoder's execution context.
    pub fn view(&self, partition_id: i32) -> BlockView {
        BlockView {
            seq: self.seq,
            committed_seq: self.committed_seq,
            row_count: self.row_count,
            partition_id,
            schema: self.schema.clone(),
            data: self.data.clone(),
            start_position: self.start_position,
        }
    }
}

/// Shared, read-only copy of a block's rows and metadata.
///
/// Views cannot be acked or requeued; only the [`Block`] itself can.
#[derive(Debug, Clone)]
pub struct BlockView {
    pub seq: i64,
    pub committed_seq: Option<i64>,
    pub row_count: u32,
    pub partition_id: i32,
    pub schema: Arc<Schema>,
    data: Arc<[u8]>,
    start_position: usize,
}

impl BlockView {
    pub fn payload(&self) -> &[u8] {
        &self.data[self.start_position..]
    }
}

/// The durable per-source row log, as seen by pumps and protocol sessions.
pub trait BlockLog: Send + Sync {
    /// Resolves with the next block, or `None` once the source has ended.
    ///
    /// Must be cancel-safe: dropping the future never loses a block.
    fn poll<'a>(
        &'a self,
        source: &'a SourceKey,
    ) -> BoxFuture<'a, Result<Option<Block>, BlockLogError>>;

    /// Acks the block and advances the durable offset. Call exactly once per block.
    ///
    /// The caller gives up the block either way. An implementation that fails with
    /// [`BlockLogError::Other`] must still have either acked the block or kept it for
    /// redelivery; it may only be dropped for `Fenced` or `UnknownSource`, where the
    /// offset belongs to someone else.
    fn discard(&self, source: &SourceKey, block: Block) -> Result<(), BlockLogError>;

    /// Hands an un-acked block back so the next poll redelivers it, lowest sequence
    /// first. Same ownership rule as [`BlockLog::discard`].
    fn set_pending(&self, source: &SourceKey, block: Block) -> Result<(), BlockLogError>;

    /// Makes claim `claim_id` the only consumer of `source`. Claiming again with the
    /// same id succeeds; any other id fails with [`BlockLogError::Claimed`] until the
    /// holder releases.
    fn claim(&self, source: &SourceKey, claim_id: u64, holder: &str) -> Result<(), BlockLogError>;

    /// Drops the claim if `claim_id` still holds it.
    fn release(&self, source: &SourceKey, claim_id: u64);

    fn set_ready_for_polling(&self, source: &SourceKey, ready: bool);

    fn is_ready_for_polling(&self, source: &SourceKey) -> bool;

    /// Sources currently advertised by this host.
    fn sources(&self) -> Vec<SourceDescriptor>;
}

impl<T> BlockLog for Arc<T>
where
    T: BlockLog + ?Sized,
{
    fn poll<'a>(
        &'a self,
        source: &'a SourceKey,
    ) -> BoxFuture<'a, Result<Option<Block>, BlockLogError>> {
        (**self).poll(source)
    }

    fn discard(&self, source: &SourceKey, block: Block) -> Result<(), BlockLogError> {
        (**self).discard(source, block)
    }

    fn set_pending(&self, source: &SourceKey, block: Block) -> Result<(), BlockLogError> {
        (**self).set_pending(source, block)
    }

    fn claim(&self, source: &SourceKey, claim_id: u64, holder: &str) -> Result<(), BlockLogError> {
        (**self).claim(source, claim_id, holder)
    }

    fn release(&self, source: &SourceKey, claim_id: u64) {
        (**self).release(source, claim_id)
    }

    fn set_ready_for_polling(&self, source: &SourceKey, ready: bool) {
        (**self).set_ready_for_polling(source, ready)
    }

    fn is_ready_for_polling(&self, source: &SourceKey) -> bool {
        (**self).is_ready_for_polling(source)
    }

    fn sources(&self) -> Vec<SourceDescriptor> {
        (**self).sources()
    }
}

static NEXT_CLAIM_ID: AtomicU64 = AtomicU64::new(1);

/// Exclusive right to poll one source, released on drop.
///
/// Drop every [`PolledBlock`] of the source before its claim so requeued blocks land
/// while the source is still held.
pub struct SourceClaim {
    log: Arc<dyn BlockLog>,
    source: SourceKey,
    id: u64,
    holder: String,
}

impl SourceClaim {
    pub fn acquire(
        log: Arc<dyn BlockLog>,
        source: SourceKey,
        holder: impl Into<String>,
    ) -> Result<Self, BlockLogError> {
        let holder = holder.into();
        let id = NEXT_CLAIM_ID.fetch_add(1, Ordering::Relaxed);
        log.claim(&source, id, &holder)?;
        Ok(Self {
            log,
            source,
            id,
            holder,
        })
    }

    pub fn source(&self) -> &SourceKey {
        &self.source
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl Drop for SourceClaim {
    fn drop(&mut self) {
        self.log.release(&self.source, self.id);
    }
}

/// Owns one polled block until it is acked or requeued.
///
/// `ack` and `requeue` consume the guard, so a block cannot be resolved twice. A guard
/// dropped without either (task aborted, panic) requeues its block.
pub struct PolledBlock {
    log: Arc<dyn BlockLog>,
    source: SourceKey,
    block: Option<Block>,
}

impl PolledBlock {
    pub fn new(log: Arc<dyn BlockLog>, source: SourceKey, block: Block) -> Self {
        Self {
            log,
            source,
            block: Some(block),
        }
    }

    pub fn block(&self) -> &Block {
        match &self.block {
            Some(block) => block,
            None => unreachable!("block is only taken by ack/requeue, which consume the guard"),
        }
    }

    pub fn source(&self) -> &SourceKey {
        &self.source
    }

    /// Attaches the committed marker and discards the block.
    pub fn ack(mut self, committed_marker: Option<i64>) -> Result<(), BlockLogError> {
        match self.block.take() {
            Some(mut block) => {
                block.set_committed_marker(committed_marker);
                self.log.discard(&self.source, block)
            }
            None => Ok(()),
        }
    }

    /// Returns the block to the log as pending, rewound to its start.
    pub fn requeue(mut self) -> Result<(), BlockLogError> {
        match self.block.take() {
            Some(block) => self.log.set_pending(&self.source, block),
            None => Ok(()),
        }
    }
}

impl Drop for PolledBlock {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            let seq = block.seq();
            warn!(
                event = "block_requeued_on_drop",
                source = %self.source,
                seq,
                "polled block released without ack; requeueing"
            );
            if let Err(err) = self.log.set_pending(&self.source, block) {
                error!(
                    event = "block_requeue_failed",
                    source = %self.source,
                    seq,
                    error = %err,
                    "failed to requeue dropped block"
                );
            }
        }
    }
}
