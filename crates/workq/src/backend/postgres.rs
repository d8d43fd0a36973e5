//! PostgreSQL backend
//!
//! Connections come from a sqlx [`PgPool`]. Statements are staged locally and
//! sent on commit: with auto-commit off they run inside one transaction that
//! is rolled back if any statement fails.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, PgConnection, PgPool, Postgres};
use tracing::{debug, error};

use super::{BackendConnection, DataSource};
use crate::error::BackendError;

/// Statements longer than this are rejected while staging
const DEFAULT_MAX_STATEMENT_BYTES: usize = 1024 * 1024;

/// PostgreSQL implementation of [`DataSource`]
///
/// # Example
///
/// ```ignore
/// use workq::backend::PgDataSource;
///
/// let data_source = PgDataSource::connect_lazy("postgres://localhost/mydb", 5)?;
/// let worker = BatchingCommitWorker::new(Arc::new(data_source), BatchConfig::default());
/// ```
#[derive(Clone)]
pub struct PgDataSource {
    pool: PgPool,
    max_statement_bytes: usize,
}

impl PgDataSource {
    /// Create a data source over an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            max_statement_bytes: DEFAULT_MAX_STATEMENT_BYTES,
        }
    }

    /// Build a pool that opens connections on first use.
    ///
    /// The database does not need to be reachable yet; the batching worker
    /// retries on every flush cycle.
    pub fn connect_lazy(database_url: &str, max_connections: u32) -> Result<Self, BackendError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy(database_url)
            .map_err(|e| BackendError::Connect(e.to_string()))?;
        Ok(Self::new(pool))
    }

    /// Set the staging size limit per statement
    pub fn with_max_statement_bytes(mut self, max: usize) -> Self {
        self.max_statement_bytes = max;
        self
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DataSource for PgDataSource {
    async fn connect(&self) -> Result<Box<dyn BackendConnection>, BackendError> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| BackendError::Connect(e.to_string()))?;

        Ok(Box::new(PgBackendConnection {
            conn: Some(conn),
            broken: false,
            auto_commit: true,
            staged: Vec::new(),
            max_statement_bytes: self.max_statement_bytes,
        }))
    }
}

struct PgBackendConnection {
    conn: Option<PoolConnection<Postgres>>,
    broken: bool,
    auto_commit: bool,
    staged: Vec<String>,
    max_statement_bytes: usize,
}

impl PgBackendConnection {
    fn check_open(&self) -> Result<(), BackendError> {
        if self.is_closed() {
            Err(BackendError::Closed)
        } else {
            Ok(())
        }
    }

    fn validate(&self, statement: &str) -> Result<(), BackendError> {
        let reason = if statement.trim().is_empty() {
            "empty statement".to_string()
        } else if statement.len() > self.max_statement_bytes {
            format!("statement exceeds {} bytes", self.max_statement_bytes)
        } else {
            return Ok(());
        };

        Err(BackendError::Rejected {
            statement: statement.to_string(),
            reason,
        })
    }
}

/// Errors that leave the connection unusable
fn breaks_connection(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

// Boxed to keep the `commit` future `Send`
fn execute_in_transaction<'a>(
    conn: &'a mut PgConnection,
    statements: &'a [String],
) -> BoxFuture<'a, Result<(), sqlx::Error>> {
    async move {
        let mut tx = conn.begin().await?;
        for statement in statements {
            // Dropping `tx` on error rolls the transaction back
            sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(statement)).await?;
        }
        tx.commit().await
    }
    .boxed()
}

fn execute_each<'a>(
    conn: &'a mut PgConnection,
    statements: &'a [String],
) -> BoxFuture<'a, Result<(), sqlx::Error>> {
    async move {
        for statement in statements {
            sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(statement)).await?;
        }
        Ok(())
    }
    .boxed()
}

#[async_trait]
impl BackendConnection for PgBackendConnection {
    fn is_closed(&self) -> bool {
        self.broken || self.conn.is_none()
    }

    async fn set_auto_commit(&mut self, enabled: bool) -> Result<(), BackendError> {
        self.check_open()?;
        self.auto_commit = enabled;
        Ok(())
    }

    fn begin_batch(&mut self) -> Result<(), BackendError> {
        self.check_open()?;
        self.staged.clear();
        Ok(())
    }

    async fn add_batch(&mut self, statements: &[String]) -> Result<(), BackendError> {
        self.check_open()?;
        for statement in statements {
            self.validate(statement)?;
        }
        self.staged.extend_from_slice(statements);
        Ok(())
    }

    async fn commit(&mut self) -> Result<usize, BackendError> {
        self.check_open()?;
        let statements = std::mem::take(&mut self.staged);
        if statements.is_empty() {
            return Ok(0);
        }

        let Some(conn) = self.conn.as_mut() else {
            return Err(BackendError::Closed);
        };

        let result = if self.auto_commit {
            execute_each(&mut **conn, &statements).await
        } else {
            execute_in_transaction(&mut **conn, &statements).await
        };

        match result {
            Ok(()) => Ok(statements.len()),
            Err(e) => {
                if breaks_connection(&e) {
                    error!("Backend connection broke during commit: {}", e);
                    self.broken = true;
                }
                Err(BackendError::Database(e.to_string()))
            }
        }
    }

    async fn close(&mut self) {
        self.staged.clear();
        let Some(conn) = self.conn.take() else {
            return;
        };

        if self.broken {
            // Keep broken connections out of the pool
            if let Err(e) = conn.close().await {
                debug!("Error closing broken connection: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> PgBackendConnection {
        PgBackendConnection {
            conn: None,
            broken: false,
            auto_commit: true,
            staged: Vec::new(),
            max_statement_bytes: 16,
        }
    }

    #[test]
    fn test_validate_rejects_empty_and_oversized() {
        let conn = connection();
        assert!(conn.validate("SELECT 1").is_ok());
        assert!(matches!(
            conn.validate("   "),
            Err(BackendError::Rejected { .. })
        ));
        assert!(matches!(
            conn.validate("INSERT INTO t VALUES (1, 2, 3)"),
            Err(BackendError::Rejected { .. })
        ));
    }

    #[test]
    fn test_connection_without_handle_is_closed() {
        let mut conn = connection();
        assert!(conn.is_closed());
        assert_eq!(conn.begin_batch(), Err(BackendError::Closed));
    }

    #[tokio::test]
    async fn test_commit_without_handle_is_rejected() {
        let mut conn = connection();
        conn.staged.push("INSERT INTO t VALUES (1)".to_string());
        assert_eq!(conn.commit().await, Err(BackendError::Closed));

        conn.close().await;
        assert!(conn.staged.is_empty());
    }

    #[test]
    fn test_io_errors_break_connection() {
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "broken pipe",
        ));
        assert!(breaks_connection(&io));
        assert!(!breaks_connection(&sqlx::Error::RowNotFound));
    }
}
