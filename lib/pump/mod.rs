//! The per-source block pump.
//!
//! One pump task per source: wait for the polling gate, poll the block log, run the
//! block through the decoder on the decoder's executor, then ack or requeue it and poll
//! again. The loop ends on end-of-stream, fencing or shutdown.

mod backoff;
mod block;
#[cfg(test)]
pub(crate) mod test_support;

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::decoder::DecoderContext;
use crate::executor::{DecoderExecutor, ExecutorError};
use crate::server::monitoring::EXPORT_METRICS;
use crate::source::{
    BlockLog, BlockLogError, PolledBlock, SourceClaim, SourceDescriptor, SourceKey,
};
use block::{process_block, BlockOutcome};

/// Timing knobs shared by every pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpConfig {
    pub initial_backoff: Duration,
    /// Upper bound of the random extra added to `initial_backoff`.
    pub initial_jitter: Duration,
    pub max_backoff: Duration,
    /// How often a pump re-checks a closed polling gate.
    pub gate_poll_interval: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(10),
            initial_jitter: Duration::from_millis(10),
            max_backoff: Duration::from_millis(8000),
            gate_poll_interval: Duration::from_millis(5),
        }
    }
}

/// Why a pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// The log reported no more data for the source.
    EndOfStream,
    /// The source was fenced or removed from the log.
    Fenced,
    Shutdown,
    /// The decoder's executor went away underneath the pump.
    ExecutorClosed,
}

impl PumpExit {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EndOfStream => "end_of_stream",
            Self::Fenced => "fenced",
            Self::Shutdown => "shutdown",
            Self::ExecutorClosed => "executor_closed",
        }
    }
}

impl fmt::Display for PumpExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Step {
    Continue,
    Stop(PumpExit),
}

pub struct BlockPump {
    source: SourceDescriptor,
    key: SourceKey,
    log: Arc<dyn BlockLog>,
    decoder: Arc<Mutex<DecoderContext>>,
    executor: DecoderExecutor,
    shutdown: CancellationToken,
    config: PumpConfig,
}

impl BlockPump {
    pub fn new(
        source: SourceDescriptor,
        log: Arc<dyn BlockLog>,
        decoder: Arc<Mutex<DecoderContext>>,
        executor: DecoderExecutor,
        shutdown: CancellationToken,
        config: PumpConfig,
    ) -> Self {
        Self {
            key: source.key(),
            source,
            log,
            decoder,
            executor,
            shutdown,
            config,
        }
    }

    pub fn spawn(self) -> JoinHandle<PumpExit> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) -> PumpExit {
        if let Some(metrics) = EXPORT_METRICS.get() {
            metrics.active_pumps.inc();
        }
        info!(
            event = "pump_started",
            source = %self.key,
            generation = self.source.generation,
            executor = self.executor.name(),
            "block pump started"
        );

        let exit = self.run_loop().await;

        if let Some(metrics) = EXPORT_METRICS.get() {
            metrics.active_pumps.dec();
        }
        info!(
            event = "pump_ended",
            source = %self.key,
            exit = exit.as_str(),
            "block pump ended"
        );
        exit
    }

    async fn run_loop(&self) -> PumpExit {
        // Held until the loop returns, after any block it polled has been resolved.
        let _claim = match self.acquire_claim().await {
            Ok(claim) => claim,
            Err(exit) => return exit,
        };
        if !self.wait_for_gate().await {
            return PumpExit::Shutdown;
        }

        loop {
            if self.shutdown.is_cancelled() {
                return PumpExit::Shutdown;
            }

            let polled = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return PumpExit::Shutdown,
                polled = self.log.poll(&self.key) => polled,
            };

            let block = match polled {
                Ok(Some(block)) => block,
                Ok(None) => return PumpExit::EndOfStream,
                Err(err @ (BlockLogError::Fenced(_) | BlockLogError::UnknownSource(_))) => {
                    self.record_fenced(&err);
                    return PumpExit::Fenced;
                }
                Err(err) => {
                    error!(
                        event = "block_poll_failed",
                        source = %self.key,
                        error = %err,
                        "polling the block log failed"
                    );
                    if !self.pause(self.config.gate_poll_interval).await {
                        return PumpExit::Shutdown;
                    }
                    continue;
                }
            };

            let polled = PolledBlock::new(self.log.clone(), self.key.clone(), block);
            match self.handle_block(polled).await {
                Step::Continue => {}
                Step::Stop(exit) => return exit,
            }
        }
    }

    /// Takes exclusive ownership of the source, waiting out another holder.
    async fn acquire_claim(&self) -> Result<SourceClaim, PumpExit> {
        let mut logged = false;
        loop {
            if self.shutdown.is_cancelled() {
                return Err(PumpExit::Shutdown);
            }
            let holder = format!("export pump {}", self.executor.name());
            match SourceClaim::acquire(self.log.clone(), self.key.clone(), holder) {
                Ok(claim) => return Ok(claim),
                Err(BlockLogError::Claimed { holder, .. }) => {
                    if !logged {
                        warn!(
                            event = "pump_waiting_for_claim",
                            source = %self.key,
                            holder = %holder,
                            "source is held by another consumer; waiting"
                        );
                        logged = true;
                    }
                }
                Err(err @ (BlockLogError::Fenced(_) | BlockLogError::UnknownSource(_))) => {
                    self.record_fenced(&err);
                    return Err(PumpExit::Fenced);
                }
                Err(err) => error!(
                    event = "source_claim_failed",
                    source = %self.key,
                    error = %err,
                    "claiming the source failed"
                ),
            }
            if !self.pause(self.config.gate_poll_interval).await {
                return Err(PumpExit::Shutdown);
            }
        }
    }

    /// Waits until the source may be polled. Returns `false` on shutdown.
    async fn wait_for_gate(&self) -> bool {
        let mut logged = false;
        loop {
            if self.shutdown.is_cancelled() {
                return false;
            }
            if self.log.is_ready_for_polling(&self.key) {
                return true;
            }
            if !logged {
                debug!(event = "pump_waiting_for_gate", source = %self.key, "waiting for polling gate");
                logged = true;
            }
            if !self.pause(self.config.gate_poll_interval).await {
                return false;
            }
        }
    }

    async fn pause(&self, interval: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(interval) => true,
        }
    }

    async fn handle_block(&self, polled: PolledBlock) -> Step {
        let view = polled.block().view(self.key.partition_id);
        let seq = view.seq;
        let context = self.decoder.clone();
        let config = self.config;
        let shutdown = self.shutdown.clone();

        let result = self
            .executor
            .run(move || process_block(&context, &view, &config, &shutdown))
            .await;

        let report = match result {
            Ok(report) => report,
            Err(ExecutorError::Closed) => {
                debug!(
                    event = "pump_shutdown_race",
                    source = %self.key,
                    seq,
                    "decoder executor already stopped; requeueing block"
                );
                self.requeue(polled);
                return Step::Stop(PumpExit::ExecutorClosed);
            }
            Err(ExecutorError::JobPanicked) => {
                error!(
                    event = "block_processing_panicked",
                    source = %self.key,
                    seq,
                    "decoder panicked while processing block; discarding it"
                );
                return self.discard_failed(polled);
            }
        };

        if report.attempts > 1 {
            debug!(
                event = "block_retries_finished",
                source = %self.key,
                seq,
                attempts = report.attempts,
                backoff_total_ms = report.backoffs.iter().map(Duration::as_millis).sum::<u128>() as u64,
                "block needed more than one attempt"
            );
        }

        match report.outcome {
            BlockOutcome::Completed {
                committed_marker,
                rows,
            } => {
                if self.shutdown.is_cancelled() {
                    self.requeue(polled);
                    return Step::Stop(PumpExit::Shutdown);
                }
                match polled.ack(committed_marker) {
                    Ok(()) => {
                        if let Some(metrics) = EXPORT_METRICS.get() {
                            metrics.blocks_acked.inc();
                            metrics.rows_processed.inc_by(rows);
                        }
                        debug!(
                            event = "block_acked",
                            source = %self.key,
                            seq,
                            rows,
                            committed_marker,
                            elapsed_ms = report.elapsed.as_millis() as u64,
                            "block acked"
                        );
                        Step::Continue
                    }
                    Err(err) => self.ack_failed(seq, err),
                }
            }
            BlockOutcome::DecodeFailed { error, rows } => {
                if let Some(metrics) = EXPORT_METRICS.get() {
                    metrics.decode_failures.inc();
                }
                error!(
                    event = "block_decode_failed",
                    source = %self.key,
                    seq,
                    rows_before_failure = rows,
                    error = %error,
                    "malformed row; discarding block"
                );
                self.discard_failed(polled)
            }
            BlockOutcome::Interrupted => {
                self.requeue(polled);
                Step::Stop(PumpExit::Shutdown)
            }
            BlockOutcome::Failed { reason } => {
                error!(
                    event = "block_failed",
                    source = %self.key,
                    seq,
                    reason = %reason,
                    "decoder failed block; discarding it"
                );
                self.discard_failed(polled)
            }
        }
    }

    /// Discards a block that could not be delivered and keeps pumping.
    fn discard_failed(&self, polled: PolledBlock) -> Step {
        let seq = polled.block().seq();
        match polled.ack(None) {
            Ok(()) => {
                if let Some(metrics) = EXPORT_METRICS.get() {
                    metrics.blocks_discarded_on_error.inc();
                }
                Step::Continue
            }
            Err(err) => self.ack_failed(seq, err),
        }
    }

    fn ack_failed(&self, seq: i64, err: BlockLogError) -> Step {
        match err {
            BlockLogError::Fenced(_) | BlockLogError::UnknownSource(_) => {
                self.record_fenced(&err);
                Step::Stop(PumpExit::Fenced)
            }
            // The log keeps or acks a block it fails to discard, so moving on loses nothing.
            BlockLogError::Other(_) | BlockLogError::Claimed { .. } => {
                error!(
                    event = "block_ack_failed",
                    source = %self.key,
                    seq,
                    error = %err,
                    "failed to ack block"
                );
                Step::Continue
            }
        }
    }

    fn requeue(&self, polled: PolledBlock) {
        let seq = polled.block().seq();
        match polled.requeue() {
            Ok(()) => {
                if let Some(metrics) = EXPORT_METRICS.get() {
                    metrics.blocks_requeued.inc();
                }
                info!(
                    event = "block_requeued",
                    source = %self.key,
                    seq,
                    "unfinished block handed back for redelivery"
                );
            }
            Err(err) => warn!(
                event = "block_requeue_failed",
                source = %self.key,
                seq,
                error = %err,
                "failed to requeue block"
            ),
        }
    }

    fn record_fenced(&self, err: &BlockLogError) {
        if let Some(metrics) = EXPORT_METRICS.get() {
            metrics.fenced_sources.inc();
        }
        info!(
            event = "source_fenced",
            source = %self.key,
            reason = %err,
            "source no longer pollable; stopping pump"
        );
    }
}
