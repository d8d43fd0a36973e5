//! Work items and their completion channel
//!
//! A [`WorkItem`] carries an id, an opaque JSON payload and a [`Completion`].
//! The completion is consumed by whichever worker reports the outcome, so an
//! item can be completed at most once; dropping it unfired is logged.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::warn;
use uuid::Uuid;

use crate::error::WorkError;

/// Identifier of a unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkId(Uuid);

impl WorkId {
    /// Generate a new time-ordered id
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for WorkId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Outcome class of a completed work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    /// Processed successfully
    Success,

    /// Processing failed
    Error,

    /// Never processed because its worker shut down
    Cancelled,
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result produced by a worker for one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkResult {
    pub work_id: WorkId,
    pub data: Option<serde_json::Value>,
}

impl WorkResult {
    pub fn new(work_id: WorkId) -> Self {
        Self {
            work_id,
            data: None,
        }
    }

    /// Attach result data
    pub fn with_data(mut self, data: impl Into<serde_json::Value>) -> Self {
        self.data = Some(data.into());
        self
    }
}

/// Final outcome of a work item, as seen by the submitter
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(WorkResult),
    Failure {
        result: WorkResult,
        error: WorkError,
        status: CompletionStatus,
    },
}

impl Outcome {
    pub fn status(&self) -> CompletionStatus {
        match self {
            Self::Success(_) => CompletionStatus::Success,
            Self::Failure { status, .. } => *status,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn result(&self) -> &WorkResult {
        match self {
            Self::Success(result) | Self::Failure { result, .. } => result,
        }
    }

    pub fn error(&self) -> Option<&WorkError> {
        match self {
            Self::Success(_) => None,
            Self::Failure { error, .. } => Some(error),
        }
    }
}

/// Receives the outcome of a work item.
///
/// Both methods consume the callback, so an implementation is invoked at most
/// once. Any `FnOnce(Outcome)` closure is a callback.
pub trait CompletionCallback: Send {
    fn on_success(self: Box<Self>, result: WorkResult);

    fn on_failure(self: Box<Self>, result: WorkResult, error: WorkError, status: CompletionStatus);
}

impl<F> CompletionCallback for F
where
    F: FnOnce(Outcome) + Send,
{
    fn on_success(self: Box<Self>, result: WorkResult) {
        (*self)(Outcome::Success(result))
    }

    fn on_failure(self: Box<Self>, result: WorkResult, error: WorkError, status: CompletionStatus) {
        (*self)(Outcome::Failure {
            result,
            error,
            status,
        })
    }
}

/// Forwards the outcome to a oneshot receiver
struct OneshotCallback(oneshot::Sender<Outcome>);

impl CompletionCallback for OneshotCallback {
    fn on_success(self: Box<Self>, result: WorkResult) {
        // The submitter may have stopped listening
        let _ = self.0.send(Outcome::Success(result));
    }

    fn on_failure(self: Box<Self>, result: WorkResult, error: WorkError, status: CompletionStatus) {
        let _ = self.0.send(Outcome::Failure {
            result,
            error,
            status,
        });
    }
}

/// The completion obligation of one work item
pub struct Completion {
    work_id: WorkId,
    callback: Option<Box<dyn CompletionCallback>>,
}

impl Completion {
    pub fn new(work_id: WorkId, callback: impl CompletionCallback + 'static) -> Self {
        Self {
            work_id,
            callback: Some(Box::new(callback)),
        }
    }

    pub fn work_id(&self) -> WorkId {
        self.work_id
    }

    /// Report success
    pub fn succeed(mut self, result: WorkResult) {
        if let Some(callback) = self.callback.take() {
            callback.on_success(result);
        }
    }

    /// Report failure
    pub fn fail(mut self, result: WorkResult, error: WorkError, status: CompletionStatus) {
        if let Some(callback) = self.callback.take() {
            callback.on_failure(result, error, status);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.callback.is_some() {
            warn!(work_id = %self.work_id, "Work item dropped without a completion outcome");
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("work_id", &self.work_id)
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

/// A unit of work submitted to a worker
#[derive(Debug)]
pub struct WorkItem {
    id: WorkId,
    payload: serde_json::Value,
    completion: Completion,
}

impl WorkItem {
    /// Create a work item with a fresh id
    pub fn new(payload: serde_json::Value, callback: impl CompletionCallback + 'static) -> Self {
        Self::with_id(WorkId::new(), payload, callback)
    }

    pub fn with_id(
        id: WorkId,
        payload: serde_json::Value,
        callback: impl CompletionCallback + 'static,
    ) -> Self {
        Self {
            id,
            payload,
            completion: Completion::new(id, callback),
        }
    }

    /// Create a work item whose outcome is delivered to the returned receiver.
    ///
    /// The receiver yields an error if the item is dropped without an outcome.
    pub fn with_receiver(payload: serde_json::Value) -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        (Self::new(payload, OneshotCallback(tx)), rx)
    }

    pub fn id(&self) -> WorkId {
        self.id
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn into_parts(self) -> (WorkId, serde_json::Value, Completion) {
        (self.id, self.payload, self.completion)
    }

    /// Complete the item successfully with optional result data
    pub fn succeed(self, data: Option<serde_json::Value>) {
        let result = WorkResult {
            work_id: self.id,
            data,
        };
        self.completion.succeed(result);
    }

    /// Complete the item with a failure
    pub fn fail(self, error: WorkError, status: CompletionStatus) {
        let result = WorkResult::new(self.id);
        self.completion.fail(result, error, status);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_receiver_gets_success() {
        let (item, rx) = WorkItem::with_receiver(json!(["SELECT 1"]));
        let id = item.id();
        item.succeed(Some(json!("done")));

        let outcome = rx.await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.result().work_id, id);
        assert_eq!(outcome.result().data, Some(json!("done")));
    }

    #[tokio::test]
    async fn test_receiver_gets_failure() {
        let (item, rx) = WorkItem::with_receiver(json!({}));
        item.fail(WorkError::Handler("boom".into()), CompletionStatus::Error);

        let outcome = rx.await.unwrap();
        assert_eq!(outcome.status(), CompletionStatus::Error);
        assert_eq!(outcome.error(), Some(&WorkError::Handler("boom".into())));
        assert!(outcome.result().data.is_none());
    }

    #[tokio::test]
    async fn test_dropped_item_closes_receiver() {
        let (item, rx) = WorkItem::with_receiver(json!(null));
        drop(item);
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_closure_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let item = WorkItem::new(json!([]), move |outcome: Outcome| {
            sink.lock().unwrap().push(outcome.status());
        });

        item.fail(WorkError::Cancelled, CompletionStatus::Cancelled);
        assert_eq!(*seen.lock().unwrap(), vec![CompletionStatus::Cancelled]);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(CompletionStatus::Success.to_string(), "success");
        assert_eq!(CompletionStatus::Error.to_string(), "error");
        assert_eq!(CompletionStatus::Cancelled.to_string(), "cancelled");
    }
}
