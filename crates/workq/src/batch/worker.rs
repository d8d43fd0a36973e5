use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use super::flush::FlushTask;
use crate::backend::DataSource;
use crate::config::BatchConfig;
use crate::error::WorkError;
use crate::item::{CompletionStatus, WorkItem};
use crate::worker::Worker;

/// Worker that batches items and commits them periodically.
///
/// `submit` never touches the backend. Each flush cycle reports `Success` for
/// an item as soon as its statements are staged, before the cycle commits. If
/// that commit then fails, the failure is only logged: callbacks already told
/// `Success` are not revisited, so a reported success does not guarantee the
/// statements were durably committed. This includes a cycle cut short by a
/// dead connection: its one commit is still attempted. An item whose staging
/// panics gets no callback at all.
///
/// Must be created inside a tokio runtime. Dropping the worker stops the flush
/// task after one final flush; items still queued then are failed with
/// [`CompletionStatus::Cancelled`].
///
/// # Example
///
/// ```ignore
/// use workq::{BatchConfig, BatchingCommitWorker, MemoryDataSource, WorkItem};
///
/// let worker = BatchingCommitWorker::new(Arc::new(MemoryDataSource::new()), BatchConfig::default());
///
/// let (item, outcome) = WorkItem::with_receiver(json!(["INSERT INTO events VALUES (1)"]));
/// worker.submit(item);
/// assert!(outcome.await?.is_success());
///
/// worker.close().await;
/// ```
pub struct BatchingCommitWorker {
    intake: mpsc::UnboundedSender<WorkItem>,
    pending: Arc<AtomicUsize>,
    shutdown_tx: watch::Sender<bool>,
    flush_handle: Mutex<Option<JoinHandle<()>>>,
}

impl BatchingCommitWorker {
    /// Create the worker and schedule its flush task.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn new(data_source: Arc<dyn DataSource>, config: BatchConfig) -> Self {
        let (intake, intake_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pending = Arc::new(AtomicUsize::new(0));

        info!(
            initial_delay_ms = config.initial_delay.as_millis() as u64,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            drain_bound_ms = config.drain_bound.as_millis() as u64,
            "Starting batching commit worker"
        );

        let task = FlushTask::new(data_source, intake_rx, Arc::clone(&pending), config);
        let handle = tokio::spawn(task.run(shutdown_rx));

        Self {
            intake,
            pending,
            shutdown_tx,
            flush_handle: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue an item for the next flush cycle. Never blocks.
    pub fn submit(&self, item: WorkItem) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if let Err(mpsc::error::SendError(item)) = self.intake.send(item) {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            warn!(work_id = %item.id(), "Batching worker is closed; cancelling item");
            item.fail(WorkError::Cancelled, CompletionStatus::Cancelled);
        }
    }

    /// Number of items waiting for a flush cycle
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Stop the flush task and wait for it.
    ///
    /// The current cycle completes, one final cycle runs, and items still
    /// queued afterwards are cancelled.
    #[instrument(skip(self))]
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);

        let handle = self.flush_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Flush task ended abnormally: {}", e);
            }
        }
    }
}

#[async_trait]
impl Worker for BatchingCommitWorker {
    async fn process(&self, item: WorkItem) {
        self.submit(item);
    }
}
