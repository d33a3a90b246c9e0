//! Routing from tables to sink targets, and the lifecycle of every block pump.
//!
//! The coordinator owns one sink client per enabled target, one decoder per source and
//! one pump task per source. Routing state lives behind a single async mutex; pumps
//! never touch it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{normalize_table_name, table_routes, ConfigError, TargetConfig};
use crate::decoder::{DecoderContext, SinkClient, SinkError};
use crate::executor::{DecoderExecutor, ExecutorError};
use crate::pump::{BlockPump, PumpConfig, PumpExit};
use crate::sinks::SinkRegistry;
use crate::source::{BlockLog, SourceDescriptor, SourceKey};

/// How long a stopping pump gets to requeue its block before it is aborted.
const PUMP_STOP_GRACE: Duration = Duration::from_secs(5);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("table {table} is mapped to both `{first}` and `{second}`")]
    DuplicateTableMapping {
        table: String,
        first: String,
        second: String,
    },

    #[error("target `{target}` uses unknown sink client `{client}`")]
    UnknownSinkClient { target: String, client: String },

    #[error("export coordinator is not configured")]
    NotConfigured,

    #[error("failed to configure target `{target}`: {source}")]
    SinkConfiguration {
        target: String,
        #[source]
        source: SinkError,
    },

    #[error("export coordinator is shut down")]
    ShutDown,

    #[error("export coordinator is already configured")]
    AlreadyConfigured,

    #[error(transparent)]
    Config(ConfigError),
}

struct SourceEntry {
    descriptor: SourceDescriptor,
    target: String,
    decoder: Arc<Mutex<DecoderContext>>,
    executor: DecoderExecutor,
    owns_executor: bool,
    cancel: CancellationToken,
    handle: Option<JoinHandle<PumpExit>>,
}

impl SourceEntry {
    fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

#[derive(Default)]
struct RoutingState {
    configured: bool,
    ready_for_polling: bool,
    /// Normalised table name to target name.
    table_targets: BTreeMap<String, String>,
    clients: BTreeMap<String, Box<dyn SinkClient>>,
    sources: BTreeMap<SourceKey, SourceEntry>,
}

pub struct ExportCoordinator {
    log: Arc<dyn BlockLog>,
    registry: SinkRegistry,
    pump_config: PumpConfig,
    shutdown_token: CancellationToken,
    shut_down: AtomicBool,
    state: tokio::sync::Mutex<RoutingState>,
}

impl ExportCoordinator {
    pub fn new(
        log: Arc<dyn BlockLog>,
        registry: SinkRegistry,
        pump_config: PumpConfig,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            log,
            registry,
            pump_config,
            shutdown_token,
            shut_down: AtomicBool::new(false),
            state: tokio::sync::Mutex::new(RoutingState::default()),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Builds and configures a sink client for every enabled target.
    ///
    /// Fails on the first bad target and leaves the coordinator unconfigured.
    pub async fn configure(
        &self,
        targets: &BTreeMap<String, TargetConfig>,
    ) -> Result<(), CoordinatorError> {
        let mut state = self.state.lock().await;
        if self.is_shut_down() {
            return Err(CoordinatorError::ShutDown);
        }
        if state.configured {
            return Err(CoordinatorError::AlreadyConfigured);
        }

        let table_targets = table_routes(targets).map_err(|err| match err {
            ConfigError::DuplicateTable {
                table,
                first,
                second,
            } => CoordinatorError::DuplicateTableMapping {
                table,
                first,
                second,
            },
            other => CoordinatorError::Config(other),
        })?;

        let mut clients: BTreeMap<String, Box<dyn SinkClient>> = BTreeMap::new();
        for (name, target) in targets.iter().filter(|(_, target)| target.enabled) {
            let configured = match self.registry.create(&target.client) {
                Some(mut client) => client
                    .configure(&target.properties)
                    .map(|()| client)
                    .map_err(|source| CoordinatorError::SinkConfiguration {
                        target: name.clone(),
                        source,
                    }),
                None => Err(CoordinatorError::UnknownSinkClient {
                    target: name.clone(),
                    client: target.client.clone(),
                }),
            };
            match configured {
                Ok(client) => {
                    clients.insert(name.clone(), client);
                }
                Err(err) => {
                    for client in clients.values_mut() {
                        client.shutdown();
                    }
                    return Err(err);
                }
            }
        }

        info!(
            event = "coordinator_configured",
            targets = clients.len(),
            tables = table_targets.len(),
            "export coordinator configured"
        );
        state.table_targets = table_targets;
        state.clients = clients;
        state.configured = true;
        Ok(())
    }

    /// Starts a pump for every source with a target. Returns how many were started.
    ///
    /// Sources whose pump is still running are left alone; a finished pump is
    /// restarted with the decoder it already had.
    pub async fn on_sources_ready(
        &self,
        sources: Vec<SourceDescriptor>,
    ) -> Result<usize, CoordinatorError> {
        let mut state = self.state.lock().await;
        if self.is_shut_down() {
            return Err(CoordinatorError::ShutDown);
        }
        if !state.configured {
            return Err(CoordinatorError::NotConfigured);
        }

        let mut started = 0;
        for source in sources {
            let key = source.key();

            if let Some(entry) = state.sources.get_mut(&key) {
                if entry.is_running() {
                    continue;
                }
                entry.cancel = self.shutdown_token.child_token();
                entry.handle = Some(self.spawn_pump(entry));
                started += 1;
                continue;
            }

            let table = normalize_table_name(&source.table_name);
            let Some(target) = state.table_targets.get(&table).cloned() else {
                debug!(
                    event = "source_without_target",
                    source = %key,
                    "no export target for table; skipping source"
                );
                continue;
            };
            let Some(client) = state.clients.get_mut(&target) else {
                continue;
            };

            let decoder = match client.construct_decoder(&source) {
                Ok(decoder) => decoder,
                Err(err) => {
                    error!(
                        event = "decoder_construction_failed",
                        source = %key,
                        target = %target,
                        error = %err,
                        "failed to build decoder; skipping source"
                    );
                    continue;
                }
            };
            let context = DecoderContext::new(source.clone(), decoder);
            let (executor, owns_executor) = match context.executor() {
                Some(shared) => (shared, false),
                None => {
                    let name = format!("export-{}-{}", key.table_name, key.partition_id);
                    match DecoderExecutor::spawn(name) {
                        Ok(executor) => (executor, true),
                        Err(err) => {
                            error!(
                                event = "executor_spawn_failed",
                                source = %key,
                                error = %err,
                                "failed to start decoder thread; skipping source"
                            );
                            continue;
                        }
                    }
                }
            };

            let mut entry = SourceEntry {
                descriptor: source,
                target,
                decoder: Arc::new(Mutex::new(context)),
                executor,
                owns_executor,
                cancel: self.shutdown_token.child_token(),
                handle: None,
            };
            entry.handle = Some(self.spawn_pump(&entry));
            if state.ready_for_polling {
                self.log.set_ready_for_polling(&key, true);
            }
            info!(
                event = "source_routed",
                source = %key,
                target = %entry.target,
                generation = entry.descriptor.generation,
                "source routed to export target"
            );
            state.sources.insert(key, entry);
            started += 1;
        }
        Ok(started)
    }

    fn spawn_pump(&self, entry: &SourceEntry) -> JoinHandle<PumpExit> {
        BlockPump::new(
            entry.descriptor.clone(),
            self.log.clone(),
            entry.decoder.clone(),
            entry.executor.clone(),
            entry.cancel.clone(),
            self.pump_config,
        )
        .spawn()
    }

    /// Opens the polling gate of every routed source, now and for sources routed later.
    pub async fn start_polling(&self) -> Result<(), CoordinatorError> {
        let mut state = self.state.lock().await;
        if self.is_shut_down() {
            return Err(CoordinatorError::ShutDown);
        }
        if !state.configured {
            return Err(CoordinatorError::NotConfigured);
        }
        state.ready_for_polling = true;
        for key in state.sources.keys() {
            self.log.set_ready_for_polling(key, true);
        }
        info!(
            event = "coordinator_polling_started",
            sources = state.sources.len(),
            "export polling started"
        );
        Ok(())
    }

    /// Stops the pump of one source and lets its decoder flush. Returns `false` when the
    /// source was not routed.
    pub async fn on_source_removed(&self, key: &SourceKey) -> bool {
        let entry = self.state.lock().await.sources.remove(key);
        match entry {
            Some(entry) => {
                info!(event = "source_removed", source = %key, "stopping export for removed source");
                self.stop_source(entry).await;
                true
            }
            None => false,
        }
    }

    async fn stop_source(&self, entry: SourceEntry) {
        let key = entry.descriptor.key();
        entry.cancel.cancel();

        if let Some(mut handle) = entry.handle {
            match tokio::time::timeout(PUMP_STOP_GRACE, &mut handle).await {
                Ok(Ok(exit)) => debug!(event = "pump_stopped", source = %key, exit = exit.as_str(), "pump stopped"),
                Ok(Err(err)) => warn!(event = "pump_join_failed", source = %key, error = %err, "pump task failed"),
                Err(_) => {
                    warn!(
                        event = "pump_stop_timeout",
                        source = %key,
                        grace_ms = PUMP_STOP_GRACE.as_millis() as u64,
                        "pump did not stop in time; aborting it"
                    );
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }

        let decoder = entry.decoder.clone();
        let notified = entry
            .executor
            .run(move || notify_no_longer_advertised(&decoder))
            .await;
        match notified {
            Ok(()) => {}
            Err(ExecutorError::Closed) => {
                debug!(
                    event = "decoder_notify_shutdown_race",
                    source = %key,
                    "decoder executor already stopped; notifying inline"
                );
                notify_no_longer_advertised(&entry.decoder);
            }
            Err(ExecutorError::JobPanicked) => error!(
                event = "decoder_notify_panicked",
                source = %key,
                "decoder panicked while handling source removal"
            ),
        }

        self.log.set_ready_for_polling(&key, false);
        if entry.owns_executor {
            entry.executor.shutdown();
        }
    }

    /// Stops every pump, notifies every decoder, then shuts down the sink clients.
    ///
    /// Only the first call does anything.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(event = "coordinator_shutdown_started", "export coordinator shutting down");
        self.shutdown_token.cancel();

        let (entries, mut clients) = {
            let mut state = self.state.lock().await;
            state.ready_for_polling = false;
            (
                std::mem::take(&mut state.sources),
                std::mem::take(&mut state.clients),
            )
        };

        let sources = entries.len();
        for entry in entries.into_values() {
            self.stop_source(entry).await;
        }
        for (name, client) in clients.iter_mut() {
            debug!(event = "sink_client_shutdown", target = %name, "shutting down sink client");
            client.shutdown();
        }
        info!(
            event = "coordinator_shutdown_finished",
            sources,
            targets = clients.len(),
            "export coordinator shut down"
        );
    }

    /// Resolves once no pump is running, or when shutdown starts.
    pub async fn wait_for_drain(&self) {
        loop {
            if self.shutdown_token.is_cancelled() {
                return;
            }
            let running = self
                .state
                .lock()
                .await
                .sources
                .values()
                .any(SourceEntry::is_running);
            if !running {
                return;
            }
            tokio::select! {
                _ = self.shutdown_token.cancelled() => return,
                _ = tokio::time::sleep(DRAIN_POLL_INTERVAL) => {}
            }
        }
    }

    /// Sources whose pump is currently running.
    pub async fn active_sources(&self) -> Vec<SourceKey> {
        self.state
            .lock()
            .await
            .sources
            .iter()
            .filter(|(_, entry)| entry.is_running())
            .map(|(key, _)| key.clone())
            .collect()
    }
}

fn notify_no_longer_advertised(decoder: &Mutex<DecoderContext>) {
    decoder
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .source_no_longer_advertised();
}
