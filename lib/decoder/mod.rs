//! Sink-side contracts: decoder plugins that consume rows and the sink clients that
//! build them.

use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::codec::{ExportRow, Schema};
use crate::executor::DecoderExecutor;
use crate::logging::LogThrottle;
use crate::source::SourceDescriptor;

/// Result of a decoder callback that could not finish the block.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    /// Restart the block from its first row, sleeping first when `backoff_requested`.
    #[error("block retry requested (backoff: {backoff_requested}): {reason}")]
    Retry {
        backoff_requested: bool,
        reason: String,
    },

    /// The block cannot be delivered. It is discarded and the pump moves on.
    #[error("block failed: {0}")]
    Fatal(String),
}

impl BlockError {
    /// Retry after the current backoff.
    pub fn retry(reason: impl Into<String>) -> Self {
        Self::Retry {
            backoff_requested: true,
            reason: reason.into(),
        }
    }

    /// Retry immediately.
    pub fn retry_now(reason: impl Into<String>) -> Self {
        Self::Retry {
            backoff_requested: false,
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal(reason.into())
    }
}

/// One decoder per source. Every callback runs on the decoder's execution context.
///
/// Rows of a retried or redelivered block are replayed, so implementations must
/// tolerate seeing the same row more than once.
pub trait ExportDecoder: Send {
    /// Execution context the decoder wants its callbacks on. `None` gets a dedicated
    /// one.
    fn executor(&self) -> Option<DecoderExecutor> {
        None
    }

    /// Called before the first row of a new schema generation is decoded.
    fn on_schema_change(&mut self, _schema: &Arc<Schema>) -> Result<(), BlockError> {
        Ok(())
    }

    fn on_block_start(&mut self, _first_row: &ExportRow) -> Result<(), BlockError> {
        Ok(())
    }

    fn process_row(&mut self, row: &ExportRow) -> Result<(), BlockError>;

    /// Called once after the last row, only when the block had rows.
    fn on_block_completion(&mut self, _last_row: &ExportRow) -> Result<(), BlockError> {
        Ok(())
    }

    /// The source went away (removal or shutdown). Flush and release resources.
    fn source_no_longer_advertised(&mut self, _source: &SourceDescriptor) {}
}

/// A decoder plus the per-source state the pump keeps next to it.
pub struct DecoderContext {
    decoder: Box<dyn ExportDecoder>,
    source: SourceDescriptor,
    schema: Option<Arc<Schema>>,
    retry_log: LogThrottle,
}

impl DecoderContext {
    pub fn new(source: SourceDescriptor, decoder: Box<dyn ExportDecoder>) -> Self {
        Self {
            decoder,
            source,
            schema: None,
            retry_log: LogThrottle::default(),
        }
    }

    pub fn source(&self) -> &SourceDescriptor {
        &self.source
    }

    /// Schema the decoder currently decodes under.
    pub fn export_row_schema(&self) -> Option<&Arc<Schema>> {
        self.schema.as_ref()
    }

    /// Tells the decoder about `schema` and caches it once the decoder accepts it.
    pub fn set_export_row_schema(&mut self, schema: Arc<Schema>) -> Result<(), BlockError> {
        self.decoder.on_schema_change(&schema)?;
        self.schema = Some(schema);
        Ok(())
    }

    pub fn decoder_mut(&mut self) -> &mut dyn ExportDecoder {
        self.decoder.as_mut()
    }

    pub fn executor(&self) -> Option<DecoderExecutor> {
        self.decoder.executor()
    }

    pub fn retry_log(&mut self) -> &mut LogThrottle {
        &mut self.retry_log
    }

    pub fn source_no_longer_advertised(&mut self) {
        let source = self.source.clone();
        self.decoder.source_no_longer_advertised(&source);
    }
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink client `{client}` requires property `{property}`")]
    MissingProperty {
        client: &'static str,
        property: &'static str,
    },

    #[error("invalid value `{value}` for property `{property}`: {reason}")]
    InvalidProperty {
        property: String,
        value: String,
        reason: String,
    },

    #[error("sink client used before configure")]
    NotConfigured,

    #[error("sink io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Owns the decoders of one configured target.
pub trait SinkClient: Send {
    fn configure(&mut self, properties: &BTreeMap<String, String>) -> Result<(), SinkError>;

    fn construct_decoder(
        &mut self,
        source: &SourceDescriptor,
    ) -> Result<Box<dyn ExportDecoder>, SinkError>;

    fn shutdown(&mut self);
}

#[cfg(test)]
mod tests {
    use super::{BlockError, DecoderContext, ExportDecoder};
    use crate::codec::{ExportRow, Schema};
    use crate::source::SourceDescriptor;
    use std::sync::Arc;

    struct RejectingDecoder {
        accept: bool,
        changes: u32,
    }

    impl ExportDecoder for RejectingDecoder {
        fn on_schema_change(&mut self, _schema: &Arc<Schema>) -> Result<(), BlockError> {
            self.changes += 1;
            if self.accept {
                Ok(())
            } else {
                Err(BlockError::retry("catalog not loaded"))
            }
        }

        fn process_row(&mut self, _row: &ExportRow) -> Result<(), BlockError> {
            Ok(())
        }
    }

    #[test]
    fn schema_is_cached_only_after_decoder_accepts_it() {
        let decoder = RejectingDecoder {
            accept: false,
            changes: 0,
        };
        let mut context = DecoderContext::new(SourceDescriptor::new("T", 0, 1), Box::new(decoder));
        let schema = Arc::new(Schema::new("T", 1, vec![]));

        assert!(context.set_export_row_schema(schema.clone()).is_err());
        assert!(context.export_row_schema().is_none());
    }

    #[test]
    fn retry_helpers_set_backoff_flag() {
        assert!(matches!(
            BlockError::retry("x"),
            BlockError::Retry {
                backoff_requested: true,
                ..
            }
        ));
        assert!(matches!(
            BlockError::retry_now("x"),
            BlockError::Retry {
                backoff_requested: false,
                ..
            }
        ));
    }
}
