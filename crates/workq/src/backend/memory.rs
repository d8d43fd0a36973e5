//! In-memory backend for testing
//!
//! Commits append the staged statements to a shared log. Switches make
//! connecting, starting a batch, or committing fail, so the worker's
//! recovery paths can be exercised without a database.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{BackendConnection, DataSource};
use crate::error::BackendError;

#[derive(Default)]
struct MemoryState {
    committed: Vec<String>,
    commits: usize,
    commit_attempts: usize,
    connect_attempts: usize,
    connections_opened: usize,
    auto_commit: Option<bool>,
    /// Bumped by `close_connections`; older connections see themselves closed
    generation: u64,
    fail_connect: bool,
    fail_begin: bool,
    fail_commit: bool,
    reject_marker: Option<String>,
    panic_marker: Option<String>,
    stage_latency: Duration,
}

/// In-memory implementation of [`DataSource`]
///
/// Clones share the same state.
///
/// # Example
///
/// ```
/// use workq::backend::MemoryDataSource;
///
/// let backend = MemoryDataSource::new();
/// backend.set_fail_connect(true);
/// assert_eq!(backend.commit_count(), 0);
/// ```
#[derive(Clone, Default)]
pub struct MemoryDataSource {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statements committed so far, in commit order
    pub fn committed_statements(&self) -> Vec<String> {
        self.state.read().committed.clone()
    }

    /// Number of successful commits
    pub fn commit_count(&self) -> usize {
        self.state.read().commits
    }

    /// Number of commit calls, including failed ones and calls on closed
    /// connections
    pub fn commit_attempts(&self) -> usize {
        self.state.read().commit_attempts
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.read().connect_attempts
    }

    pub fn connections_opened(&self) -> usize {
        self.state.read().connections_opened
    }

    /// Last auto-commit mode requested by a connection
    pub fn auto_commit(&self) -> Option<bool> {
        self.state.read().auto_commit
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.state.write().fail_connect = fail;
    }

    pub fn set_fail_begin(&self, fail: bool) {
        self.state.write().fail_begin = fail;
    }

    pub fn set_fail_commit(&self, fail: bool) {
        self.state.write().fail_commit = fail;
    }

    /// Reject any statement containing `marker`
    pub fn reject_statements_containing(&self, marker: impl Into<String>) {
        self.state.write().reject_marker = Some(marker.into());
    }

    /// Panic while staging any statement containing `marker`
    pub fn panic_on_statements_containing(&self, marker: impl Into<String>) {
        self.state.write().panic_marker = Some(marker.into());
    }

    /// Delay applied to every staged statement
    pub fn set_stage_latency(&self, latency: Duration) {
        self.state.write().stage_latency = latency;
    }

    /// Close every connection handed out so far
    pub fn close_connections(&self) {
        self.state.write().generation += 1;
    }
}

#[async_trait]
impl DataSource for MemoryDataSource {
    async fn connect(&self) -> Result<Box<dyn BackendConnection>, BackendError> {
        let mut state = self.state.write();
        state.connect_attempts += 1;
        if state.fail_connect {
            return Err(BackendError::Connect("connection refused".to_string()));
        }
        state.connections_opened += 1;

        Ok(Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
            generation: state.generation,
            closed: false,
            staged: Vec::new(),
        }))
    }
}

struct MemoryConnection {
    state: Arc<RwLock<MemoryState>>,
    generation: u64,
    closed: bool,
    staged: Vec<String>,
}

impl MemoryConnection {
    fn check_open(&self) -> Result<(), BackendError> {
        if self.is_closed() {
            Err(BackendError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BackendConnection for MemoryConnection {
    fn is_closed(&self) -> bool {
        self.closed || self.state.read().generation != self.generation
    }

    async fn set_auto_commit(&mut self, enabled: bool) -> Result<(), BackendError> {
        self.check_open()?;
        self.state.write().auto_commit = Some(enabled);
        Ok(())
    }

    fn begin_batch(&mut self) -> Result<(), BackendError> {
        self.check_open()?;
        if self.state.read().fail_begin {
            return Err(BackendError::Database(
                "could not create statement".to_string(),
            ));
        }
        self.staged.clear();
        Ok(())
    }

    async fn add_batch(&mut self, statements: &[String]) -> Result<(), BackendError> {
        let latency = self.state.read().stage_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency * statements.len() as u32).await;
        }
        self.check_open()?;

        let (marker, panic_marker) = {
            let state = self.state.read();
            (state.reject_marker.clone(), state.panic_marker.clone())
        };
        if let Some(panic_marker) = panic_marker.as_deref() {
            if statements.iter().any(|s| s.contains(panic_marker)) {
                panic!("driver fault staging {panic_marker:?}");
            }
        }

        for statement in statements {
            if statement.trim().is_empty() {
                return Err(BackendError::Rejected {
                    statement: statement.clone(),
                    reason: "empty statement".to_string(),
                });
            }
            if let Some(marker) = marker.as_deref() {
                if statement.contains(marker) {
                    return Err(BackendError::Rejected {
                        statement: statement.clone(),
                        reason: format!("statement contains {marker:?}"),
                    });
                }
            }
        }

        self.staged.extend_from_slice(statements);
        Ok(())
    }

    async fn commit(&mut self) -> Result<usize, BackendError> {
        self.state.write().commit_attempts += 1;
        self.check_open()?;
        let staged = std::mem::take(&mut self.staged);

        let mut state = self.state.write();
        if state.fail_commit {
            return Err(BackendError::Database("commit failed".to_string()));
        }

        let count = staged.len();
        state.committed.extend(staged);
        state.commits += 1;
        Ok(count)
    }

    async fn close(&mut self) {
        self.closed = true;
        self.staged.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statements(sql: &[&str]) -> Vec<String> {
        sql.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_commit_appends_staged_statements() {
        let backend = MemoryDataSource::new();
        let mut conn = backend.connect().await.unwrap();
        conn.set_auto_commit(false).await.unwrap();
        conn.begin_batch().unwrap();
        conn.add_batch(&statements(&["INSERT 1", "INSERT 2"]))
            .await
            .unwrap();

        assert_eq!(conn.commit().await.unwrap(), 2);
        assert_eq!(backend.committed_statements(), statements(&["INSERT 1", "INSERT 2"]));
        assert_eq!(backend.commit_count(), 1);
        assert_eq!(backend.auto_commit(), Some(false));
    }

    #[tokio::test]
    async fn test_rejected_statement_stages_nothing() {
        let backend = MemoryDataSource::new();
        backend.reject_statements_containing("DROP");
        let mut conn = backend.connect().await.unwrap();
        conn.begin_batch().unwrap();

        let error = conn
            .add_batch(&statements(&["INSERT 1", "DROP TABLE t"]))
            .await
            .unwrap_err();
        assert!(matches!(error, BackendError::Rejected { .. }));

        assert_eq!(conn.commit().await.unwrap(), 0);
        assert!(backend.committed_statements().is_empty());
    }

    #[tokio::test]
    async fn test_close_connections_closes_existing() {
        let backend = MemoryDataSource::new();
        let mut conn = backend.connect().await.unwrap();
        assert!(!conn.is_closed());

        backend.close_connections();
        assert!(conn.is_closed());
        assert_eq!(conn.begin_batch(), Err(BackendError::Closed));

        let fresh = backend.connect().await.unwrap();
        assert!(!fresh.is_closed());
        assert_eq!(backend.connections_opened(), 2);
    }

    #[tokio::test]
    async fn test_failure_switches() {
        let backend = MemoryDataSource::new();
        backend.set_fail_connect(true);
        assert!(backend.connect().await.is_err());
        assert_eq!(backend.connect_attempts(), 1);
        assert_eq!(backend.connections_opened(), 0);

        backend.set_fail_connect(false);
        backend.set_fail_commit(true);
        let mut conn = backend.connect().await.unwrap();
        conn.begin_batch().unwrap();
        conn.add_batch(&statements(&["INSERT 1"])).await.unwrap();
        assert!(conn.commit().await.is_err());
        assert_eq!(backend.commit_attempts(), 1);
        assert_eq!(backend.commit_count(), 0);
    }
}
