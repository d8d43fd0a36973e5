//! Worker pool lifecycle
//!
//! [`WorkerPoolService`] binds a fixed number of pool units to a shared
//! [`WorkQueue`]. Each unit owns one worker built by the [`WorkerFactory`]
//! and loops: take the next item, process it, repeat, until the pool is
//! stopped.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::batch::flush::panic_message;
use crate::error::{PoolError, QueueError};
use crate::item::WorkItem;
use crate::queue::WorkQueue;
use crate::worker::{Worker, WorkerFactory};

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Never started
    Idle,
    /// Units are consuming the queue
    Running,
    /// `stop` is waiting for units to finish their current item
    Draining,
    /// Stopped; may be started again
    Stopped,
}

/// How a call to [`WorkerPoolService::stop`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The pool was not running
    NotStarted,
    /// Every unit exited before the timeout
    Graceful,
    /// `cancelled` units were still busy at the deadline and were aborted
    Forced { cancelled: usize },
}

struct PoolState {
    status: WorkerPoolStatus,
    size: usize,
    running: Arc<AtomicBool>,
    shutdown_tx: Option<watch::Sender<bool>>,
    units: Option<JoinSet<()>>,
}

/// Fixed-size pool of workers consuming a shared queue
///
/// # Example
///
/// ```ignore
/// use workq::{ChannelWorkQueue, HandlerWorker, WorkerPoolService};
///
/// let queue = Arc::new(ChannelWorkQueue::new(1024));
/// let factory = HandlerWorker::factory(|_id, payload| async move { Ok(Some(payload)) });
/// let pool = WorkerPoolService::new(queue, Arc::new(factory));
///
/// pool.start(4)?;
/// pool.submit(item)?;
///
/// // ... later, graceful shutdown
/// pool.stop(Duration::from_secs(30)).await;
/// ```
pub struct WorkerPoolService {
    queue: Arc<dyn WorkQueue>,
    factory: Arc<dyn WorkerFactory>,
    state: Mutex<PoolState>,
}

impl WorkerPoolService {
    pub fn new(queue: Arc<dyn WorkQueue>, factory: Arc<dyn WorkerFactory>) -> Self {
        Self {
            queue,
            factory,
            state: Mutex::new(PoolState {
                status: WorkerPoolStatus::Idle,
                size: 0,
                running: Arc::new(AtomicBool::new(false)),
                shutdown_tx: None,
                units: None,
            }),
        }
    }

    /// Start `size` pool units, each with a fresh worker from the factory.
    #[instrument(skip(self))]
    pub fn start(&self, size: usize) -> Result<(), PoolError> {
        if size == 0 {
            return Err(PoolError::InvalidSize);
        }

        let mut state = self.state.lock();
        if matches!(
            state.status,
            WorkerPoolStatus::Running | WorkerPoolStatus::Draining
        ) {
            return Err(PoolError::AlreadyRunning);
        }
        let handle = Handle::try_current().map_err(|_| PoolError::NoRuntime)?;

        let running = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut units = JoinSet::new();

        for index in 0..size {
            let unit = PoolUnit {
                index,
                worker: self.factory.create(),
                queue: Arc::clone(&self.queue),
                running: Arc::clone(&running),
                shutdown_rx: shutdown_rx.clone(),
            };
            units.spawn_on(unit.run(), &handle);
        }

        *state = PoolState {
            status: WorkerPoolStatus::Running,
            size,
            running,
            shutdown_tx: Some(shutdown_tx),
            units: Some(units),
        };

        info!(size, "Worker pool started");
        Ok(())
    }

    /// Stop the pool.
    ///
    /// Units finish the item they are processing; idle units exit at once.
    /// Units still busy after `timeout` are aborted. Items left in the queue
    /// stay there. Calling `stop` on a pool that is not running does nothing.
    #[instrument(skip(self))]
    pub async fn stop(&self, timeout: Duration) -> StopOutcome {
        let (mut units, shutdown_tx) = {
            let mut state = self.state.lock();
            let Some(units) = state.units.take() else {
                return StopOutcome::NotStarted;
            };
            state.running.store(false, Ordering::Release);
            state.status = WorkerPoolStatus::Draining;
            (units, state.shutdown_tx.take())
        };

        info!(units = units.len(), "Stopping worker pool");
        if let Some(shutdown_tx) = &shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        let drained = tokio::time::timeout(timeout, async {
            while let Some(result) = units.join_next().await {
                if let Err(e) = result {
                    error!("Pool unit ended abnormally: {}", e);
                }
            }
        })
        .await;

        let outcome = match drained {
            Ok(()) => StopOutcome::Graceful,
            Err(_) => {
                let cancelled = units.len();
                warn!(
                    cancelled,
                    timeout_ms = timeout.as_millis() as u64,
                    "Pool units did not stop in time; cancelling them"
                );
                units.shutdown().await;
                StopOutcome::Forced { cancelled }
            }
        };

        self.state.lock().status = WorkerPoolStatus::Stopped;
        info!(?outcome, "Worker pool stopped");
        outcome
    }

    /// Push an item onto the shared queue.
    ///
    /// A rejected item is returned inside the error.
    pub fn submit(&self, item: WorkItem) -> Result<(), QueueError> {
        self.queue.submit(item)
    }

    /// Get current status
    pub fn status(&self) -> WorkerPoolStatus {
        self.state.lock().status
    }

    /// Number of units started by the last `start`
    pub fn size(&self) -> usize {
        self.state.lock().size
    }
}

/// One execution unit bound to a worker and the shared queue
struct PoolUnit {
    index: usize,
    worker: Arc<dyn Worker>,
    queue: Arc<dyn WorkQueue>,
    running: Arc<AtomicBool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl PoolUnit {
    async fn run(mut self) {
        debug!(unit = self.index, "Pool unit started");

        while self.running.load(Ordering::Acquire) {
            let item = tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => break,
                item = self.queue.take() => item,
            };

            let Some(item) = item else {
                debug!(unit = self.index, "Work queue closed");
                break;
            };

            let work_id = item.id();
            if let Err(panic) = AssertUnwindSafe(self.worker.process(item))
                .catch_unwind()
                .await
            {
                error!(
                    unit = self.index,
                    %work_id,
                    panic = %panic_message(panic.as_ref()),
                    "Worker panicked while processing item"
                );
            }
        }

        debug!(unit = self.index, "Pool unit exited");
    }
}
