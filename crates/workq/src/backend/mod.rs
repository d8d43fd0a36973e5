//! Transactional backends for the batching commit worker
//!
//! This module provides:
//! - [`DataSource`] - hands out connections
//! - [`BackendConnection`] - one connection with a statement batch
//! - [`MemoryDataSource`] - in-memory backend for tests
//! - [`PgDataSource`] - PostgreSQL backend over a sqlx pool
//!
//! A connection moves through `absent -> open -> closed -> absent`. The
//! batching worker keeps at most one open connection and re-acquires it
//! whenever [`BackendConnection::is_closed`] reports true.

mod memory;
mod postgres;

use async_trait::async_trait;

use crate::error::BackendError;

pub use memory::MemoryDataSource;
pub use postgres::PgDataSource;

/// Source of backend connections
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Open a new connection
    async fn connect(&self) -> Result<Box<dyn BackendConnection>, BackendError>;
}

/// A live backend connection that accumulates statements into a batch
#[async_trait]
pub trait BackendConnection: Send {
    /// Whether the connection was closed or broke
    fn is_closed(&self) -> bool;

    /// With auto-commit off, [`BackendConnection::commit`] runs the batch in
    /// one transaction.
    async fn set_auto_commit(&mut self, enabled: bool) -> Result<(), BackendError>;

    /// Start a fresh batch, discarding anything staged before.
    fn begin_batch(&mut self) -> Result<(), BackendError>;

    /// Stage statements into the current batch.
    ///
    /// Either every statement is staged or none is.
    async fn add_batch(&mut self, statements: &[String]) -> Result<(), BackendError>;

    /// Execute the staged batch and commit it. Returns the number of statements
    /// committed.
    async fn commit(&mut self) -> Result<usize, BackendError>;

    /// Release the connection
    async fn close(&mut self);
}
