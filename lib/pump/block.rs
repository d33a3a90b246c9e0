use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::backoff::{jitter_seed, Backoff};
use super::PumpConfig;
use crate::codec::{decode_row, DecodeError, ExportRow, RowFrames};
use crate::decoder::{BlockError, DecoderContext};
use crate::server::monitoring::EXPORT_METRICS;
use crate::source::BlockView;

/// Longest uninterrupted sleep while backing off; shutdown is checked in between.
const BACKOFF_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BlockOutcome {
    /// Every row reached the decoder. The block may be acked.
    Completed {
        committed_marker: Option<i64>,
        rows: u64,
    },
    /// A row could not be decoded. The block is dropped without retry.
    DecodeFailed { error: DecodeError, rows: u64 },
    /// Shutdown was observed while retrying. The block must be requeued.
    Interrupted,
    /// The decoder gave up on the block.
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BlockReport {
    pub(crate) outcome: BlockOutcome,
    pub(crate) attempts: u32,
    pub(crate) backoffs: Vec<Duration>,
    pub(crate) elapsed: Duration,
}

enum AttemptError {
    Decode { error: DecodeError, rows: u64 },
    Block(BlockError),
}

impl From<BlockError> for AttemptError {
    fn from(err: BlockError) -> Self {
        Self::Block(err)
    }
}

fn lock_context(context: &Mutex<DecoderContext>) -> MutexGuard<'_, DecoderContext> {
    // A panicking decoder poisons the lock; the pump already treats that block as failed.
    context
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drives one block through the decoder, restarting it on recoverable errors.
///
/// Runs on the decoder's execution context. Backoff sleeps block this thread only.
pub(crate) fn process_block(
    context: &Arc<Mutex<DecoderContext>>,
    block: &BlockView,
    config: &PumpConfig,
    shutdown: &CancellationToken,
) -> BlockReport {
    let started = Instant::now();
    let table = block.schema.table_name.as_str();
    let mut backoff = Backoff::new(config, jitter_seed(table, block.partition_id, block.seq));
    let mut backoffs = Vec::new();
    let mut attempts = 0u32;

    let outcome = loop {
        attempts += 1;
        let attempt = {
            let mut context = lock_context(context);
            run_attempt(&mut context, block)
        };

        match attempt {
            Ok((committed_marker, rows)) => {
                break BlockOutcome::Completed {
                    committed_marker,
                    rows,
                };
            }
            Err(AttemptError::Decode { error, rows }) => {
                break BlockOutcome::DecodeFailed { error, rows };
            }
            Err(AttemptError::Block(BlockError::Fatal(reason))) => {
                break BlockOutcome::Failed { reason };
            }
            Err(AttemptError::Block(BlockError::Retry {
                backoff_requested,
                reason,
            })) => {
                if shutdown.is_cancelled() {
                    break BlockOutcome::Interrupted;
                }
                if let Some(metrics) = EXPORT_METRICS.get() {
                    metrics.block_retries.inc();
                }

                let delay = if backoff_requested {
                    backoff.current()
                } else {
                    Duration::ZERO
                };
                log_retry(context, block, attempts, delay, &reason);

                if backoff_requested {
                    if let Some(metrics) = EXPORT_METRICS.get() {
                        metrics.current_backoff_ms.set(delay.as_millis() as i64);
                    }
                    if !sleep_unless_shutdown(delay, shutdown) {
                        break BlockOutcome::Interrupted;
                    }
                    backoffs.push(delay);
                    backoff.grow();
                }
            }
        }
    };

    if !backoffs.is_empty() {
        if let Some(metrics) = EXPORT_METRICS.get() {
            metrics.current_backoff_ms.set(0);
        }
    }

    BlockReport {
        outcome,
        attempts,
        backoffs,
        elapsed: started.elapsed(),
    }
}

/// One pass over the block from its first row.
fn run_attempt(
    context: &mut DecoderContext,
    block: &BlockView,
) -> Result<(Option<i64>, u64), AttemptError> {
    let block_generation = block.schema.generation;
    let needs_refresh = context
        .export_row_schema()
        .map_or(true, |cached| cached.generation != block_generation);
    if needs_refresh {
        debug!(
            event = "schema_change",
            table = %block.schema.table_name,
            partition_id = block.partition_id,
            generation = block_generation,
            "refreshing decoder schema"
        );
        context.set_export_row_schema(block.schema.clone())?;
    }
    let schema = context
        .export_row_schema()
        .cloned()
        .unwrap_or_else(|| block.schema.clone());

    let decoder = context.decoder_mut();
    let mut rows = 0u64;
    let mut committed_marker = None;
    let mut last_row: Option<ExportRow> = None;

    for frame in RowFrames::new(block.payload()) {
        let row = frame
            .and_then(|bytes| decode_row(&schema, block.partition_id, bytes))
            .map_err(|error| AttemptError::Decode { error, rows })?;

        if last_row.is_none() {
            decoder.on_block_start(&row)?;
        }
        if block.committed_seq == Some(row.header.sequence) {
            committed_marker = Some(row.header.txn_id);
        }
        decoder.process_row(&row)?;
        rows += 1;
        last_row = Some(row);
    }

    if let Some(last_row) = &last_row {
        decoder.on_block_completion(last_row)?;
    }
    Ok((committed_marker, rows))
}

fn log_retry(
    context: &Arc<Mutex<DecoderContext>>,
    block: &BlockView,
    attempt: u32,
    delay: Duration,
    reason: &str,
) {
    let suppressed = lock_context(context).retry_log().check(Instant::now());
    match suppressed {
        Some(suppressed) => warn!(
            event = "block_retry",
            table = %block.schema.table_name,
            partition_id = block.partition_id,
            seq = block.seq,
            attempt,
            backoff_ms = delay.as_millis() as u64,
            suppressed,
            reason,
            "restarting block after recoverable error"
        ),
        None => trace!(
            event = "block_retry",
            table = %block.schema.table_name,
            partition_id = block.partition_id,
            seq = block.seq,
            attempt,
            backoff_ms = delay.as_millis() as u64,
            reason,
            "restarting block after recoverable error"
        ),
    }
}

/// Sleeps for `delay` in short slices. Returns `false` if shutdown cut the sleep short.
fn sleep_unless_shutdown(delay: Duration, shutdown: &CancellationToken) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if shutdown.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(BACKOFF_SLICE));
    }
}
