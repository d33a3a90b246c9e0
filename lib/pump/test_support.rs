use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::{BlockPump, PumpConfig};
use crate::codec::{
    frame_rows, ColumnInfo, ColumnType, ColumnValue, ExportRow, RowEncoder, RowHeader,
    RowOperation, Schema,
};
use crate::decoder::{BlockError, DecoderContext, ExportDecoder};
use crate::executor::DecoderExecutor;
use crate::source::{Block, BlockLog, MemoryBlockLog, SourceDescriptor, SourceKey};

pub(crate) const TABLE: &str = "ORDERS";
pub(crate) const PARTITION: i32 = 2;

/// Every decoder callback, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DecoderEvent {
    SchemaChange(u64),
    BlockStart(i64),
    Row(i64),
    BlockCompletion(i64),
    NoLongerAdvertised,
}

pub(crate) type EventLog = Arc<Mutex<Vec<(DecoderEvent, Instant)>>>;

pub(crate) fn events_of(log: &EventLog) -> Vec<DecoderEvent> {
    log.lock()
        .expect("event log mutex poisoned")
        .iter()
        .map(|(event, _)| event.clone())
        .collect()
}

pub(crate) fn count_of(log: &EventLog, wanted: fn(&DecoderEvent) -> bool) -> usize {
    log.lock()
        .expect("event log mutex poisoned")
        .iter()
        .filter(|(event, _)| wanted(event))
        .count()
}

/// Instants at which each block attempt started.
pub(crate) fn block_start_times(log: &EventLog) -> Vec<Instant> {
    log.lock()
        .expect("event log mutex poisoned")
        .iter()
        .filter(|(event, _)| matches!(event, DecoderEvent::BlockStart(_)))
        .map(|(_, at)| *at)
        .collect()
}

/// Decoder that records its callbacks and fails on a script.
#[derive(Default)]
pub(crate) struct RecordingDecoder {
    events: EventLog,
    /// Popped once per block completion; an empty script completes normally.
    completion_failures: VecDeque<BlockError>,
    /// Returned by `process_row` for this row sequence on every attempt.
    failing_row: Option<(i64, BlockError)>,
    panic_on_row: Option<i64>,
}

impl RecordingDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn event_log(&self) -> EventLog {
        self.events.clone()
    }

    pub(crate) fn fail_completions(mut self, failures: Vec<BlockError>) -> Self {
        self.completion_failures = failures.into_iter().collect();
        self
    }

    pub(crate) fn fail_row(mut self, sequence: i64, error: BlockError) -> Self {
        self.failing_row = Some((sequence, error));
        self
    }

    pub(crate) fn panic_on_row(mut self, sequence: i64) -> Self {
        self.panic_on_row = Some(sequence);
        self
    }

    fn record(&self, event: DecoderEvent) {
        self.events
            .lock()
            .expect("event log mutex poisoned")
            .push((event, Instant::now()));
    }
}

impl ExportDecoder for RecordingDecoder {
    fn on_schema_change(&mut self, schema: &Arc<Schema>) -> Result<(), BlockError> {
        self.record(DecoderEvent::SchemaChange(schema.generation));
        Ok(())
    }

    fn on_block_start(&mut self, first_row: &ExportRow) -> Result<(), BlockError> {
        self.record(DecoderEvent::BlockStart(first_row.header.sequence));
        Ok(())
    }

    fn process_row(&mut self, row: &ExportRow) -> Result<(), BlockError> {
        let sequence = row.header.sequence;
        if self.panic_on_row == Some(sequence) {
            panic!("scripted decoder panic at row {sequence}");
        }
        self.record(DecoderEvent::Row(sequence));
        match &self.failing_row {
            Some((failing, error)) if *failing == sequence => Err(error.clone()),
            _ => Ok(()),
        }
    }

    fn on_block_completion(&mut self, last_row: &ExportRow) -> Result<(), BlockError> {
        self.record(DecoderEvent::BlockCompletion(last_row.header.sequence));
        match self.completion_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn source_no_longer_advertised(&mut self, _source: &SourceDescriptor) {
        self.record(DecoderEvent::NoLongerAdvertised);
    }
}

pub(crate) fn schema(generation: u64) -> Arc<Schema> {
    let mut columns = vec![
        ColumnInfo::new("ID", ColumnType::BigInt),
        ColumnInfo::new("NOTE", ColumnType::Varchar),
    ];
    if generation > 1 {
        columns.push(ColumnInfo::new("AMOUNT", ColumnType::Integer));
    }
    Arc::new(Schema::new(TABLE, generation, columns))
}

pub(crate) fn txn_id_for(sequence: i64) -> i64 {
    10_000 + sequence
}

pub(crate) fn encode_row(schema: &Arc<Schema>, sequence: i64) -> Vec<u8> {
    let header = RowHeader {
        txn_id: txn_id_for(sequence),
        timestamp: 1_700_000_000_000_000 + sequence,
        sequence,
        partition_column: i64::from(PARTITION),
        site_id: 1,
        operation: RowOperation::Insert,
    };
    let mut values = vec![
        ColumnValue::BigInt(sequence * 10),
        ColumnValue::Varchar(format!("row-{sequence}")),
    ];
    if schema.generation > 1 {
        values.push(ColumnValue::Integer(7));
    }
    RowEncoder::new(schema).encode(&header, &values)
}

/// Block holding one row per sequence; its own sequence is the last row's.
pub(crate) fn block_of(schema: &Arc<Schema>, sequences: &[i64], committed_seq: Option<i64>) -> Block {
    let rows: Vec<Vec<u8>> = sequences.iter().map(|seq| encode_row(schema, *seq)).collect();
    Block::new(
        sequences.last().copied().unwrap_or_default(),
        schema.clone(),
        frame_rows(&rows),
        u32::try_from(rows.len()).expect("row count fits u32"),
        committed_seq,
    )
}

pub(crate) fn fast_config() -> PumpConfig {
    PumpConfig {
        initial_backoff: Duration::from_millis(1),
        initial_jitter: Duration::ZERO,
        max_backoff: Duration::from_millis(5),
        gate_poll_interval: Duration::from_millis(1),
    }
}

pub(crate) struct Harness {
    pub(crate) log: Arc<MemoryBlockLog>,
    pub(crate) key: SourceKey,
    pub(crate) events: EventLog,
    pub(crate) shutdown: CancellationToken,
    pub(crate) executor: DecoderExecutor,
    pub(crate) pump: BlockPump,
}

/// Builds a pump over a fresh in-memory log with the gate already open.
pub(crate) fn harness(decoder: RecordingDecoder, config: PumpConfig) -> Harness {
    let log = Arc::new(MemoryBlockLog::new());
    let descriptor = SourceDescriptor::new(TABLE, PARTITION, 1);
    let key = descriptor.key();
    log.add_source(descriptor.clone());
    log.set_ready_for_polling(&key, true);

    let events = decoder.event_log();
    let context = Arc::new(Mutex::new(DecoderContext::new(
        descriptor.clone(),
        Box::new(decoder),
    )));
    let executor = DecoderExecutor::spawn(format!("export-{TABLE}-{PARTITION}"))
        .expect("spawn decoder executor");
    let shutdown = CancellationToken::new();
    let pump = BlockPump::new(
        descriptor,
        log.clone(),
        context,
        executor.clone(),
        shutdown.clone(),
        config,
    );

    Harness {
        log,
        key,
        events,
        shutdown,
        executor,
        pump,
    }
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
