use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{Worker, WorkerFactory};
use crate::error::WorkError;
use crate::item::{CompletionStatus, WorkId, WorkItem, WorkResult};

/// Handler execution result
pub type HandlerResult = Result<Option<serde_json::Value>, WorkError>;

/// Future returned by a [`WorkHandler`]
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Handler function type
pub type WorkHandler = Arc<dyn Fn(WorkId, serde_json::Value) -> HandlerFuture + Send + Sync>;

/// Pass-through worker that runs a handler and reports its result
///
/// # Example
///
/// ```ignore
/// use workq::{HandlerWorker, WorkerPoolService};
///
/// let factory = HandlerWorker::factory(|_id, payload| async move {
///     Ok(Some(payload))
/// });
/// let pool = WorkerPoolService::new(queue, Arc::new(factory));
/// ```
#[derive(Clone)]
pub struct HandlerWorker {
    handler: WorkHandler,
}

impl HandlerWorker {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(WorkId, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: WorkHandler = Arc::new(
            move |id: WorkId, payload: serde_json::Value| -> HandlerFuture {
                Box::pin(handler(id, payload))
            },
        );
        Self { handler }
    }

    /// Factory handing every pool unit its own worker around the same handler
    pub fn factory<F, Fut>(handler: F) -> impl WorkerFactory + 'static
    where
        F: Fn(WorkId, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let worker = Self::new(handler);
        move || -> Arc<dyn Worker> { Arc::new(worker.clone()) }
    }
}

#[async_trait]
impl Worker for HandlerWorker {
    async fn process(&self, item: WorkItem) {
        let (work_id, payload, completion) = item.into_parts();

        match (self.handler)(work_id, payload).await {
            Ok(data) => completion.succeed(WorkResult { work_id, data }),
            Err(error) => {
                debug!(%work_id, error = %error, "Handler failed");
                completion.fail(WorkResult::new(work_id), error, CompletionStatus::Error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_handler_success_is_reported() {
        let worker = HandlerWorker::new(|_id, payload| async move {
            Ok(Some(json!({ "echo": payload })))
        });

        let (item, rx) = WorkItem::with_receiver(json!("hello"));
        worker.process(item).await;

        let outcome = rx.await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.result().data, Some(json!({ "echo": "hello" })));
    }

    #[tokio::test]
    async fn test_handler_failure_is_reported() {
        let worker = HandlerWorker::new(|_id, _payload| async move {
            Err(WorkError::Handler("nope".to_string()))
        });

        let (item, rx) = WorkItem::with_receiver(json!(null));
        worker.process(item).await;

        let outcome = rx.await.unwrap();
        assert_eq!(outcome.status(), CompletionStatus::Error);
        assert_eq!(outcome.error(), Some(&WorkError::Handler("nope".to_string())));
    }

    #[tokio::test]
    async fn test_factory_builds_workers() {
        let factory = HandlerWorker::factory(|id, _payload| async move {
            Ok(Some(json!(id.to_string())))
        });

        let worker = factory.create();
        let (item, rx) = WorkItem::with_receiver(json!(null));
        let id = item.id();
        worker.process(item).await;

        assert_eq!(rx.await.unwrap().result().data, Some(json!(id.to_string())));
    }
}
