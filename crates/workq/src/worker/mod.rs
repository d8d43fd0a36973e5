//! Worker capability and the pass-through handler worker
//!
//! This module provides:
//! - [`Worker`] - anything that processes a [`WorkItem`]
//! - [`WorkerFactory`] - builds one worker per pool unit
//! - [`HandlerWorker`] - reports the result of an async handler function
//!
//! The batching variant lives in [`crate::batch`].

mod handler;

use std::sync::Arc;

use async_trait::async_trait;

use crate::item::WorkItem;

pub use handler::{HandlerFuture, HandlerResult, HandlerWorker, WorkHandler};

/// Processes work items.
///
/// Implementations report every outcome through the item's completion and
/// never signal failure to the caller.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn process(&self, item: WorkItem);
}

/// Creates the worker bound to one pool unit
pub trait WorkerFactory: Send + Sync {
    fn create(&self) -> Arc<dyn Worker>;
}

impl<F> WorkerFactory for F
where
    F: Fn() -> Arc<dyn Worker> + Send + Sync,
{
    fn create(&self) -> Arc<dyn Worker> {
        self()
    }
}
