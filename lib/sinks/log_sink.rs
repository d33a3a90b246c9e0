use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::codec::{ExportRow, Schema};
use crate::decoder::{BlockError, ExportDecoder, SinkClient, SinkError};
use crate::source::SourceDescriptor;

pub(super) const CLIENT_ID: &str = "log";

/// Sink that only logs what it receives. Useful for wiring checks.
#[derive(Default)]
pub struct LogSinkClient {
    rows: Arc<AtomicU64>,
    configured: bool,
}

impl LogSinkClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows seen by every decoder of this client, replays included.
    pub fn rows_seen(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }
}

impl SinkClient for LogSinkClient {
    fn configure(&mut self, properties: &BTreeMap<String, String>) -> Result<(), SinkError> {
        debug!(
            event = "log_sink_configured",
            properties = properties.len(),
            "log sink configured"
        );
        self.configured = true;
        Ok(())
    }

    fn construct_decoder(
        &mut self,
        source: &SourceDescriptor,
    ) -> Result<Box<dyn ExportDecoder>, SinkError> {
        if !self.configured {
            return Err(SinkError::NotConfigured);
        }
        Ok(Box::new(LogDecoder {
            source: source.key().to_string(),
            rows: self.rows.clone(),
        }))
    }

    fn shutdown(&mut self) {
        info!(
            event = "log_sink_shutdown",
            rows = self.rows_seen(),
            "log sink shut down"
        );
    }
}

struct LogDecoder {
    source: String,
    rows: Arc<AtomicU64>,
}

impl ExportDecoder for LogDecoder {
    fn on_schema_change(&mut self, schema: &Arc<Schema>) -> Result<(), BlockError> {
        info!(
            event = "log_sink_schema",
            source = %self.source,
            generation = schema.generation,
            columns = schema.columns.len(),
            "schema changed"
        );
        Ok(())
    }

    fn process_row(&mut self, row: &ExportRow) -> Result<(), BlockError> {
        self.rows.fetch_add(1, Ordering::Relaxed);
        debug!(
            event = "log_sink_row",
            source = %self.source,
            txn_id = row.header.txn_id,
            sequence = row.header.sequence,
            operation = ?row.header.operation,
            "export row"
        );
        Ok(())
    }
}
