//! Single-threaded execution contexts for decoder callbacks.
//!
//! Decoders may block (slow sinks, retry backoff sleeps), so their callbacks run on a
//! dedicated OS thread instead of the tokio runtime that polls the block log.

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use thiserror::Error;
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Stop,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("executor is shut down")]
    Closed,

    #[error("job panicked")]
    JobPanicked,
}

struct ExecutorInner {
    name: String,
    sender: flume::Sender<Message>,
    stopped: AtomicBool,
}

/// Handle to a named worker thread that runs submitted jobs in order.
///
/// Cloning shares the thread.
#[derive(Clone)]
pub struct DecoderExecutor {
    inner: Arc<ExecutorInner>,
}

impl DecoderExecutor {
    pub fn spawn(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let (sender, receiver) = flume::unbounded::<Message>();

        let thread_name = name.clone();
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_jobs(&thread_name, receiver))?;

        Ok(Self {
            inner: Arc::new(ExecutorInner {
                name,
                sender,
                stopped: AtomicBool::new(false),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Queues `job` behind every job submitted before it.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<(), ExecutorError> {
        if self.is_shutdown() {
            return Err(ExecutorError::Closed);
        }
        self.inner
            .sender
            .send(Message::Run(Box::new(job)))
            .map_err(|_| ExecutorError::Closed)
    }

    /// Runs `job` on the executor thread and waits for its result.
    ///
    /// A job still queued when the executor stops is dropped and reported as
    /// [`ExecutorError::Closed`].
    pub async fn run<T, F>(&self, job: F) -> Result<T, ExecutorError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (result_tx, result_rx) = flume::bounded(1);
        self.submit(move || {
            let result = catch_unwind(AssertUnwindSafe(job));
            let _ = result_tx.send(result);
        })?;

        match result_rx.recv_async().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(ExecutorError::JobPanicked),
            Err(_) => Err(ExecutorError::Closed),
        }
    }

    /// Stops accepting jobs. Jobs already queued still run; the thread then exits.
    pub fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.sender.send(Message::Stop);
        debug!(event = "executor_shutdown", executor = %self.inner.name, "decoder executor stopping");
    }
}

fn run_jobs(name: &str, receiver: flume::Receiver<Message>) {
    while let Ok(message) = receiver.recv() {
        match message {
            Message::Run(job) => {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!(event = "executor_job_panicked", executor = name, "decoder job panicked");
                }
            }
            Message::Stop => break,
        }
    }
}
