//! Engine threads
//!
//! V8 isolates are `!Send`, so engine work never runs on the caller's async
//! workers. It runs on a thread that owns a single-threaded tokio runtime:
//! either a warm [`EngineWorker`] leased from the pool, or a one-off thread
//! when the pool has nothing free. An [`EngineGate`] caps how many of these
//! run at once.

use crate::{Result, SandboxError};
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::mpsc;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Stack size of engine threads
pub const ENGINE_STACK_BYTES: usize = 8 * 1024 * 1024;

type Job = Box<dyn FnOnce(&Runtime) + Send>;

fn event_loop() -> Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| SandboxError::Internal(format!("failed to build engine event loop: {}", e)))
}

/// Drive `work` to completion on `rt`, turning a panic into an error
fn drive<T, F, Fut>(rt: &Runtime, work: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    std::panic::catch_unwind(AssertUnwindSafe(|| rt.block_on(work())))
        .map_err(|_| SandboxError::Internal("engine work panicked".to_string()))
}

/// Caps the number of engine threads busy at the same time
#[derive(Clone)]
pub struct EngineGate {
    permits: Arc<Semaphore>,
}

impl EngineGate {
    /// A zero capacity is raised to one
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity.max(1))),
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a free slot
    pub async fn enter(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| SandboxError::Internal("engine gate closed".to_string()))
    }

    /// Run `work` on a one-off engine thread once a slot is free
    pub async fn run<T, F, Fut>(&self, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T>,
        T: Send + 'static,
    {
        let _permit = self.enter().await?;
        let (tx, rx) = tokio::sync::oneshot::channel();
        std::thread::Builder::new()
            .name("agentbox-engine".to_string())
            .stack_size(ENGINE_STACK_BYTES)
            .spawn(move || {
                let result = event_loop().and_then(|rt| drive(&rt, work));
                if tx.send(result).is_err() {
                    warn!("engine result receiver dropped");
                }
            })
            .map_err(|e| SandboxError::Internal(format!("failed to spawn engine thread: {}", e)))?;

        rx.await
            .map_err(|_| SandboxError::Internal("engine thread terminated unexpectedly".to_string()))?
    }
}

/// A warm engine thread with its own event loop. Jobs run one at a time.
///
/// Dropping the worker closes its queue and lets the thread exit.
pub struct EngineWorker {
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
}

impl EngineWorker {
    /// Start the thread. A failure leaves a worker that rejects every job.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let started = std::thread::Builder::new()
            .name("agentbox-worker".to_string())
            .stack_size(ENGINE_STACK_BYTES)
            .spawn(move || {
                let rt = match event_loop() {
                    Ok(rt) => rt,
                    Err(e) => {
                        warn!(error = %e, "Engine worker could not start");
                        return;
                    }
                };
                while let Ok(job) = rx.recv() {
                    job(&rt);
                }
                debug!("Engine worker exiting");
            });

        let jobs = match started {
            Ok(_) => Some(tx),
            Err(e) => {
                warn!(error = %e, "Failed to spawn engine worker");
                None
            }
        };
        Self { jobs: Mutex::new(jobs) }
    }

    /// Run `work` on this worker's thread
    pub async fn run<T, F, Fut>(&self, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T>,
        T: Send + 'static,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let job: Job = Box::new(move |rt| {
            if tx.send(drive(rt, work)).is_err() {
                warn!("engine result receiver dropped");
            }
        });

        let sent = match self.jobs.lock().as_ref() {
            Some(jobs) => jobs.send(job).is_ok(),
            None => false,
        };
        if !sent {
            return Err(SandboxError::Internal("engine worker is not running".to_string()));
        }

        rx.await
            .map_err(|_| SandboxError::Internal("engine worker terminated unexpectedly".to_string()))?
    }
}
