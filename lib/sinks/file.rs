//! CSV batch sink.
//!
//! Rows land in rolling batch directories under `outdir`. A batch is written as
//! `active-<nonce>-<millis>-<n>` and renamed to `<nonce>-<millis>-<n>` once it rolls and
//! every decoder holding it has finished its block. Batches still held at shutdown are
//! renamed with a `dirty-` prefix instead. Each table generation gets a
//! `<TABLE>-<generation>.csv` plus a `<TABLE>-<generation>-schema.json` written once per
//! batch.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info};

use crate::codec::{ColumnValue, ExportRow, Schema, METADATA_COLUMN_NAMES};
use crate::decoder::{BlockError, ExportDecoder, SinkClient, SinkError};
use crate::source::SourceDescriptor;

pub(super) const CLIENT_ID: &str = "file";

const ACTIVE_PREFIX: &str = "active-";
const DIRTY_PREFIX: &str = "dirty-";
const DEFAULT_NONCE: &str = "export";
const DEFAULT_PERIOD: Duration = Duration::from_secs(60 * 60);
const METADATA_COLUMN_TYPES: [&str; 6] = ["BIGINT", "TIMESTAMP", "BIGINT", "BIGINT", "BIGINT", "TINYINT"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSinkConfig {
    pub outdir: PathBuf,
    pub nonce: String,
    /// Leave the six metadata columns out of the CSV.
    pub skip_internals: bool,
    /// How long a batch collects rows before rolling.
    pub period: Duration,
}

impl FileSinkConfig {
    pub fn from_properties(properties: &BTreeMap<String, String>) -> Result<Self, SinkError> {
        let outdir = properties
            .get("outdir")
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .ok_or(SinkError::MissingProperty {
                client: CLIENT_ID,
                property: "outdir",
            })?;

        let nonce = properties
            .get("nonce")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_NONCE.to_string());

        let skip_internals = match properties.get("skipinternals") {
            None => false,
            Some(value) => value.trim().parse::<bool>().map_err(|err| SinkError::InvalidProperty {
                property: "skipinternals".to_string(),
                value: value.clone(),
                reason: err.to_string(),
            })?,
        };

        let period = match properties.get("period_secs") {
            None => DEFAULT_PERIOD,
            Some(value) => match value.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                Ok(_) => {
                    return Err(SinkError::InvalidProperty {
                        property: "period_secs".to_string(),
                        value: value.clone(),
                        reason: "must be > 0".to_string(),
                    })
                }
                Err(err) => {
                    return Err(SinkError::InvalidProperty {
                        property: "period_secs".to_string(),
                        value: value.clone(),
                        reason: err.to_string(),
                    })
                }
            },
        };

        Ok(Self {
            outdir: PathBuf::from(outdir),
            nonce,
            skip_internals,
            period,
        })
    }
}

struct Batch {
    stem: String,
    writers: HashMap<String, BufWriter<File>>,
    schemas_written: HashSet<String>,
    holders: usize,
    rolled: bool,
}

impl Batch {
    fn create(outdir: &Path, stem: String) -> io::Result<Self> {
        let batch = Self {
            stem,
            writers: HashMap::new(),
            schemas_written: HashSet::new(),
            holders: 0,
            rolled: false,
        };
        fs::create_dir_all(batch.dir(outdir, ACTIVE_PREFIX))?;
        debug!(event = "file_batch_created", batch = %batch.stem, "created export batch");
        Ok(batch)
    }

    fn dir(&self, outdir: &Path, prefix: &str) -> PathBuf {
        outdir.join(format!("{prefix}{}", self.stem))
    }

    fn writer(&mut self, outdir: &Path, filename: &str) -> io::Result<&mut BufWriter<File>> {
        if !self.writers.contains_key(filename) {
            let path = self.dir(outdir, ACTIVE_PREFIX).join(filename);
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            self.writers
                .insert(filename.to_string(), BufWriter::with_capacity(1 << 20, file));
        }
        self.writers
            .get_mut(filename)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "writer vanished"))
    }

    fn write_schema_once(&mut self, outdir: &Path, filename: &str, contents: &str) -> io::Result<()> {
        if self.schemas_written.contains(filename) {
            return Ok(());
        }
        fs::write(self.dir(outdir, ACTIVE_PREFIX).join(filename), contents)?;
        self.schemas_written.insert(filename.to_string());
        Ok(())
    }

    /// Flushes every writer and moves the directory out of the active state.
    fn close(mut self, outdir: &Path, clean: bool) -> io::Result<Option<PathBuf>> {
        for writer in self.writers.values_mut() {
            writer.flush()?;
        }
        self.writers.clear();

        let active = self.dir(outdir, ACTIVE_PREFIX);
        if fs::read_dir(&active)?.next().is_none() {
            fs::remove_dir(&active)?;
            return Ok(None);
        }
        let finished = self.dir(outdir, if clean { "" } else { DIRTY_PREFIX });
        fs::rename(&active, &finished)?;
        Ok(Some(finished))
    }
}

/// Batches shared by every decoder of one file sink client.
struct BatchSet {
    config: FileSinkConfig,
    batches: BTreeMap<u64, Batch>,
    current: Option<(u64, Instant)>,
    next_id: u64,
}

impl BatchSet {
    fn new(config: FileSinkConfig) -> Self {
        Self {
            config,
            batches: BTreeMap::new(),
            current: None,
            next_id: 0,
        }
    }

    /// Takes a hold on the current batch, rolling it first when its period is over.
    fn acquire(&mut self, now: Instant) -> io::Result<u64> {
        if let Some((id, started)) = self.current {
            if now.saturating_duration_since(started) >= self.config.period {
                self.roll(id);
            }
        }

        let id = match self.current {
            Some((id, _)) => id,
            None => {
                let id = self.next_id;
                self.next_id += 1;
                let millis = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|duration| duration.as_millis())
                    .unwrap_or_default();
                let stem = format!("{}-{millis}-{id}", self.config.nonce);
                self.batches.insert(id, Batch::create(&self.config.outdir, stem)?);
                self.current = Some((id, now));
                id
            }
        };

        if let Some(batch) = self.batches.get_mut(&id) {
            batch.holders += 1;
        }
        Ok(id)
    }

    fn roll(&mut self, id: u64) {
        self.current = None;
        let idle = match self.batches.get_mut(&id) {
            Some(batch) => {
                batch.rolled = true;
                batch.holders == 0
            }
            None => false,
        };
        if idle {
            self.close(id, true);
        }
    }

    fn release(&mut self, id: u64) {
        let finished = match self.batches.get_mut(&id) {
            Some(batch) => {
                batch.holders = batch.holders.saturating_sub(1);
                batch.rolled && batch.holders == 0
            }
            None => false,
        };
        if finished {
            self.close(id, true);
        }
    }

    fn close(&mut self, id: u64, clean: bool) {
        let Some(batch) = self.batches.remove(&id) else {
            return;
        };
        let stem = batch.stem.clone();
        match batch.close(&self.config.outdir, clean) {
            Ok(Some(path)) => info!(
                event = "file_batch_closed",
                batch = %stem,
                clean,
                path = %path.display(),
                "export batch closed"
            ),
            Ok(None) => debug!(event = "file_batch_empty", batch = %stem, "removed empty export batch"),
            Err(err) => error!(
                event = "file_batch_close_failed",
                batch = %stem,
                error = %err,
                "failed to close export batch"
            ),
        }
    }

    fn write_line(&mut self, id: u64, filename: &str, line: &str) -> io::Result<()> {
        let outdir = self.config.outdir.clone();
        let batch = self
            .batches
            .get_mut(&id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "export batch already closed"))?;
        batch.writer(&outdir, filename)?.write_all(line.as_bytes())
    }

    fn write_schema(&mut self, id: u64, filename: &str, contents: &str) -> io::Result<()> {
        let outdir = self.config.outdir.clone();
        match self.batches.get_mut(&id) {
            Some(batch) => batch.write_schema_once(&outdir, filename, contents),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "export batch already closed")),
        }
    }

    fn flush(&mut self, id: u64, filename: &str) -> io::Result<()> {
        match self
            .batches
            .get_mut(&id)
            .and_then(|batch| batch.writers.get_mut(filename))
        {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }

    /// Closes every batch; batches still held by a decoder are marked dirty.
    fn shutdown(&mut self) {
        self.current = None;
        let ids: Vec<(u64, bool)> = self
            .batches
            .iter()
            .map(|(id, batch)| (*id, batch.holders == 0))
            .collect();
        for (id, clean) in ids {
            self.close(id, clean);
        }
    }
}

fn lock(batches: &Mutex<BatchSet>) -> MutexGuard<'_, BatchSet> {
    batches
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Serialize)]
struct SchemaFile<'a> {
    #[serde(rename = "table name")]
    table_name: &'a str,
    #[serde(rename = "generation id")]
    generation: u64,
    columns: Vec<SchemaColumn<'a>>,
}

#[derive(Serialize)]
struct SchemaColumn<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    column_type: &'a str,
}

fn schema_json(schema: &Schema, skip_internals: bool) -> String {
    let mut columns = Vec::with_capacity(schema.wire_column_count());
    if !skip_internals {
        for (name, column_type) in METADATA_COLUMN_NAMES.into_iter().zip(METADATA_COLUMN_TYPES) {
            columns.push(SchemaColumn { name, column_type });
        }
    }
    columns.extend(schema.columns.iter().map(|column| SchemaColumn {
        name: &column.name,
        column_type: column.column_type.as_str(),
    }));

    let file = SchemaFile {
        table_name: &schema.table_name,
        generation: schema.generation,
        columns,
    };
    serde_json::to_string_pretty(&file).unwrap_or_else(|_| "{}".to_string())
}

/// Appends one RFC 4180 field, quoting only when needed.
fn push_csv_field(line: &mut String, value: &ColumnValue, first: bool) {
    if !first {
        line.push(',');
    }
    match value {
        ColumnValue::Varchar(text) => {
            if text.contains([',', '"', '\n', '\r']) {
                line.push('"');
                line.push_str(&text.replace('"', "\"\""));
                line.push('"');
            } else {
                line.push_str(text);
            }
        }
        other => line.push_str(&other.to_string()),
    }
}

struct FileDecoder {
    batches: Arc<Mutex<BatchSet>>,
    table: String,
    skip_internals: bool,
    csv_name: String,
    schema_name: String,
    schema_json: String,
    held: Option<u64>,
    line: String,
}

impl FileDecoder {
    fn batch_error(&self, action: &str, err: io::Error) -> BlockError {
        BlockError::retry(format!("{action} for table {}: {err}", self.table))
    }

    fn release(&mut self) -> io::Result<()> {
        let Some(id) = self.held.take() else {
            return Ok(());
        };
        let mut batches = lock(&self.batches);
        let flushed = batches.flush(id, &self.csv_name);
        batches.release(id);
        flushed
    }
}

impl ExportDecoder for FileDecoder {
    fn on_schema_change(&mut self, schema: &Arc<Schema>) -> Result<(), BlockError> {
        self.csv_name = format!("{}-{}.csv", self.table, schema.generation);
        self.schema_name = format!("{}-{}-schema.json", self.table, schema.generation);
        self.schema_json = schema_json(schema, self.skip_internals);
        Ok(())
    }

    fn on_block_start(&mut self, _first_row: &ExportRow) -> Result<(), BlockError> {
        let mut batches = lock(&self.batches);
        let id = match self.held {
            Some(id) => id,
            None => {
                let id = batches
                    .acquire(Instant::now())
                    .map_err(|err| self.batch_error("failed to open export batch", err))?;
                self.held = Some(id);
                id
            }
        };
        batches
            .write_schema(id, &self.schema_name, &self.schema_json)
            .map_err(|err| self.batch_error("failed to write schema file", err))
    }

    fn process_row(&mut self, row: &ExportRow) -> Result<(), BlockError> {
        let Some(id) = self.held else {
            return Err(BlockError::retry_now("row arrived before block start"));
        };

        self.line.clear();
        let mut first = true;
        if !self.skip_internals {
            for value in row.metadata_values() {
                push_csv_field(&mut self.line, &value, first);
                first = false;
            }
        }
        for value in &row.values {
            push_csv_field(&mut self.line, value, first);
            first = false;
        }
        self.line.push('\n');

        let written = lock(&self.batches).write_line(id, &self.csv_name, &self.line);
        written.map_err(|err| self.batch_error("failed to write row", err))
    }

    fn on_block_completion(&mut self, _last_row: &ExportRow) -> Result<(), BlockError> {
        self.release()
            .map_err(|err| self.batch_error("failed to flush rows", err))
    }

    fn source_no_longer_advertised(&mut self, source: &SourceDescriptor) {
        if let Err(err) = self.release() {
            error!(
                event = "file_decoder_flush_failed",
                table = %source.table_name,
                partition_id = source.partition_id,
                error = %err,
                "failed to flush rows for removed source"
            );
        }
    }
}

/// Writes rows to rolling CSV batch directories.
#[derive(Default)]
pub struct FileSinkClient {
    config: Option<FileSinkConfig>,
    batches: Option<Arc<Mutex<BatchSet>>>,
}

impl FileSinkClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(&self) -> Option<&FileSinkConfig> {
        self.config.as_ref()
    }
}

impl SinkClient for FileSinkClient {
    fn configure(&mut self, properties: &BTreeMap<String, String>) -> Result<(), SinkError> {
        let config = FileSinkConfig::from_properties(properties)?;
        fs::create_dir_all(&config.outdir)?;
        info!(
            event = "file_sink_configured",
            outdir = %config.outdir.display(),
            nonce = %config.nonce,
            skip_internals = config.skip_internals,
            period_secs = config.period.as_secs(),
            "file sink configured"
        );
        self.batches = Some(Arc::new(Mutex::new(BatchSet::new(config.clone()))));
        self.config = Some(config);
        Ok(())
    }

    fn construct_decoder(
        &mut self,
        source: &SourceDescriptor,
    ) -> Result<Box<dyn ExportDecoder>, SinkError> {
        let (Some(config), Some(batches)) = (&self.config, &self.batches) else {
            return Err(SinkError::NotConfigured);
        };
        Ok(Box::new(FileDecoder {
            batches: batches.clone(),
            table: source.table_name.clone(),
            skip_internals: config.skip_internals,
            csv_name: format!("{}-{}.csv", source.table_name, source.generation),
            schema_name: format!("{}-{}-schema.json", source.table_name, source.generation),
            schema_json: String::new(),
            held: None,
            line: String::new(),
        }))
    }

    fn shutdown(&mut self) {
        if let Some(batches) = &self.batches {
            lock(batches).shutdown();
        }
    }
}
