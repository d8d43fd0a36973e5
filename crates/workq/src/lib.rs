//! Work-processing core
//!
//! Producers submit [`WorkItem`]s; a [`WorkerPoolService`] runs a fixed number
//! of workers that consume them from a shared [`WorkQueue`]. Every item is
//! completed exactly once through its completion callback.
//!
//! Two workers ship with the crate:
//! - [`HandlerWorker`] runs an async handler and reports its result
//! - [`BatchingCommitWorker`] stages item operations into periodic,
//!   time-boxed batches committed against a [`backend::DataSource`]
//!
//! # Example
//!
//! ```ignore
//! use workq::prelude::*;
//!
//! let backend = Arc::new(PgDataSource::connect_lazy(&database_url, 5)?);
//! let worker = Arc::new(BatchingCommitWorker::new(backend, BatchConfig::default()));
//!
//! let queue = Arc::new(ChannelWorkQueue::new(1024));
//! let shared = Arc::clone(&worker);
//! let pool = WorkerPoolService::new(queue, Arc::new(move || shared.clone() as Arc<dyn Worker>));
//! pool.start(4)?;
//!
//! let (item, outcome) = WorkItem::with_receiver(json!(["INSERT INTO events VALUES (1)"]));
//! pool.submit(item)?;
//! ```

pub mod backend;
pub mod batch;
pub mod config;
pub mod error;
pub mod item;
pub mod pool;
pub mod queue;
pub mod worker;

pub use backend::{BackendConnection, DataSource, MemoryDataSource, PgDataSource};
pub use batch::{BatchingCommitWorker, BATCH_ADDED};
pub use config::{BatchConfig, PoolConfig};
pub use error::{BackendError, ConfigError, PoolError, QueueError, WorkError};
pub use item::{Completion, CompletionCallback, CompletionStatus, Outcome, WorkId, WorkItem, WorkResult};
pub use pool::{StopOutcome, WorkerPoolService, WorkerPoolStatus};
pub use queue::{ChannelWorkQueue, WorkQueue};
pub use worker::{HandlerResult, HandlerWorker, Worker, WorkerFactory};

/// Prelude for common imports
pub mod prelude {
    pub use crate::backend::{DataSource, MemoryDataSource, PgDataSource};
    pub use crate::batch::BatchingCommitWorker;
    pub use crate::config::{BatchConfig, PoolConfig};
    pub use crate::error::{BackendError, PoolError, QueueError, WorkError};
    pub use crate::item::{CompletionStatus, Outcome, WorkId, WorkItem, WorkResult};
    pub use crate::pool::{StopOutcome, WorkerPoolService, WorkerPoolStatus};
    pub use crate::queue::{ChannelWorkQueue, WorkQueue};
    pub use crate::worker::{HandlerWorker, Worker, WorkerFactory};
}
