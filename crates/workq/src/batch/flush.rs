//! The periodic flush task behind a batching commit worker

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendConnection, DataSource};
use crate::config::BatchConfig;
use crate::error::WorkError;
use crate::item::{CompletionStatus, WorkItem, WorkResult};

/// Result data reported for every item added to a batch
pub const BATCH_ADDED: &str = "batch added";

/// Counts for one flush cycle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CycleReport {
    pub staged: usize,
    pub failed: usize,
    pub committed: bool,
    pub abandoned: bool,
}

/// What happened to one drained item
enum Staged {
    Added,
    Failed { fatal: bool },
}

/// Owns the intake receiver and the backend connection.
///
/// Runs on a single task, so cycles never overlap and the connection needs
/// no locking.
pub(crate) struct FlushTask {
    data_source: Arc<dyn DataSource>,
    connection: Option<Box<dyn BackendConnection>>,
    intake: mpsc::UnboundedReceiver<WorkItem>,
    pending: Arc<AtomicUsize>,
    config: BatchConfig,
}

impl FlushTask {
    pub(crate) fn new(
        data_source: Arc<dyn DataSource>,
        intake: mpsc::UnboundedReceiver<WorkItem>,
        pending: Arc<AtomicUsize>,
        config: BatchConfig,
    ) -> Self {
        Self {
            data_source,
            connection: None,
            intake,
            pending,
            config,
        }
    }

    /// Run cycles with a fixed delay between them until shutdown is signalled
    /// or the worker handle is dropped.
    pub(crate) async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        if !wait_or_shutdown(self.config.initial_delay, &mut shutdown_rx).await {
            loop {
                let report = self.run_cycle_guarded().await;
                if report.staged > 0 || report.failed > 0 {
                    debug!(
                        staged = report.staged,
                        failed = report.failed,
                        committed = report.committed,
                        abandoned = report.abandoned,
                        "Flush cycle finished"
                    );
                }
                if wait_or_shutdown(self.config.flush_interval, &mut shutdown_rx).await {
                    break;
                }
            }
        }

        self.finish().await;
    }

    async fn run_cycle_guarded(&mut self) -> CycleReport {
        match AssertUnwindSafe(self.run_cycle()).catch_unwind().await {
            Ok(report) => report,
            Err(panic) => {
                error!(
                    panic = %panic_message(panic.as_ref()),
                    "SEVERE: flush cycle panicked; dropping backend connection"
                );
                self.connection = None;
                CycleReport {
                    abandoned: true,
                    ..Default::default()
                }
            }
        }
    }

    /// One flush cycle: ensure a connection, drain up to the drain bound,
    /// commit if anything was staged.
    pub(crate) async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();

        if !self.ensure_connection().await {
            report.abandoned = true;
            return report;
        }
        let Some(connection) = self.connection.as_mut() else {
            report.abandoned = true;
            return report;
        };

        if let Err(e) = connection.begin_batch() {
            error!(error = %e, "Failed to create statement batch; abandoning cycle");
            if e.is_fatal() {
                self.connection = None;
            }
            report.abandoned = true;
            return report;
        }

        let started = Instant::now();
        while let Ok(item) = self.intake.try_recv() {
            self.pending.fetch_sub(1, Ordering::AcqRel);

            match AssertUnwindSafe(stage_item(&mut **connection, item))
                .catch_unwind()
                .await
            {
                Ok(Staged::Added) => report.staged += 1,
                Ok(Staged::Failed { fatal }) => {
                    report.failed += 1;
                    if fatal {
                        report.abandoned = true;
                        break;
                    }
                }
                Err(panic) => {
                    error!(
                        panic = %panic_message(panic.as_ref()),
                        "SEVERE: worker panicked while staging an item"
                    );
                }
            }

            if started.elapsed() > self.config.drain_bound {
                break;
            }
        }

        // Items staged this cycle were already reported as successful; a
        // failed commit is logged only and does not revisit them. This holds
        // for a cycle cut short by a dead connection too.
        if report.staged > 0 {
            match connection.commit().await {
                Ok(statements) => {
                    report.committed = true;
                    debug!(
                        items = report.staged,
                        statements,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Committed batch"
                    );
                }
                Err(e) => {
                    error!(error = %e, items = report.staged, "Commit failed");
                    if e.is_fatal() {
                        self.connection = None;
                    }
                }
            }
        }

        if report.abandoned {
            error!(
                staged = report.staged,
                "Backend connection failed mid-cycle; remaining items stay queued"
            );
            if let Some(mut dead) = self.connection.take() {
                dead.close().await;
            }
        }

        report
    }

    async fn ensure_connection(&mut self) -> bool {
        if let Some(connection) = &self.connection {
            if !connection.is_closed() {
                return true;
            }
            debug!("Backend connection observed closed; reopening");
        }

        if let Some(mut stale) = self.connection.take() {
            stale.close().await;
        }

        let mut connection = match self.data_source.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                error!(error = %e, "Failed to open backend connection. Will retry next schedule.");
                return false;
            }
        };

        if let Err(e) = connection.set_auto_commit(false).await {
            error!(error = %e, "Failed to disable auto-commit. Will retry next schedule.");
            connection.close().await;
            return false;
        }

        info!("Opened backend connection");
        self.connection = Some(connection);
        true
    }

    /// Final flush on shutdown. Whatever is still queued afterwards is
    /// cancelled.
    async fn finish(&mut self) {
        if self.pending.load(Ordering::Acquire) > 0 {
            self.run_cycle_guarded().await;
        }

        self.intake.close();
        let mut cancelled = 0usize;
        while let Ok(item) = self.intake.try_recv() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            item.fail(WorkError::Cancelled, CompletionStatus::Cancelled);
            cancelled += 1;
        }
        if cancelled > 0 {
            warn!(cancelled, "Batching worker stopped with queued items");
        }

        if let Some(mut connection) = self.connection.take() {
            connection.close().await;
        }
        debug!("Flush task exited");
    }
}

/// Sleep for `delay`. Returns true if shutdown was requested first.
async fn wait_or_shutdown(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    if *shutdown_rx.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        // An error means the worker handle was dropped
        _ = shutdown_rx.changed() => true,
    }
}

async fn stage_item(connection: &mut dyn BackendConnection, item: WorkItem) -> Staged {
    let (work_id, payload, completion) = item.into_parts();

    let staged = match decode_operations(&payload) {
        Ok(statements) => connection
            .add_batch(&statements)
            .await
            .map_err(WorkError::from),
        Err(e) => Err(e),
    };

    match staged {
        Ok(()) => {
            completion.succeed(WorkResult::new(work_id).with_data(BATCH_ADDED));
            Staged::Added
        }
        Err(error) => {
            let fatal = matches!(&error, WorkError::Backend(e) if e.is_fatal());
            error!(%work_id, error = %error, "Failed to add work item to batch");
            completion.fail(WorkResult::new(work_id), error, CompletionStatus::Error);
            Staged::Failed { fatal }
        }
    }
}

/// A batch payload is a non-empty JSON array of statements.
pub(crate) fn decode_operations(payload: &serde_json::Value) -> Result<Vec<String>, WorkError> {
    let operations = payload.as_array().ok_or_else(|| {
        WorkError::MalformedPayload("expected an array of statements".to_string())
    })?;

    if operations.is_empty() {
        return Err(WorkError::MalformedPayload(
            "payload contains no statements".to_string(),
        ));
    }

    operations
        .iter()
        .enumerate()
        .map(|(i, op)| {
            op.as_str().map(str::to_owned).ok_or_else(|| {
                WorkError::MalformedPayload(format!("operation {i} is not a string"))
            })
        })
        .collect()
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
