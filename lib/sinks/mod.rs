//! Compile-time registry of sink clients, keyed by the client id used in config.

mod file;
mod log_sink;

pub use file::{FileSinkClient, FileSinkConfig};
pub use log_sink::LogSinkClient;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::decoder::SinkClient;

pub type SinkFactory = Arc<dyn Fn() -> Box<dyn SinkClient> + Send + Sync>;

#[derive(Clone, Default)]
pub struct SinkRegistry {
    factories: BTreeMap<String, SinkFactory>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the `file` and `log` clients.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(file::CLIENT_ID, || Box::new(FileSinkClient::new()));
        registry.register(log_sink::CLIENT_ID, || Box::new(LogSinkClient::new()));
        registry
    }

    /// Registers `factory` under `id`, replacing any previous registration.
    pub fn register<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn SinkClient> + Send + Sync + 'static,
    {
        self.factories.insert(id.into(), Arc::new(factory));
    }

    pub fn create(&self, id: &str) -> Option<Box<dyn SinkClient>> {
        self.factories.get(id).map(|factory| factory())
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for SinkRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkRegistry")
            .field("clients", &self.names())
            .finish()
    }
}
