//! Batching commit worker
//!
//! Producers hand items to [`BatchingCommitWorker::submit`], which only
//! enqueues. A dedicated flush task wakes on a fixed delay, drains the intake
//! queue for at most the drain bound, stages each item's statements into one
//! batch and commits it.
//!
//! ```text
//! submit ──► intake queue ──► flush task (every flush_interval)
//!                              1. ensure connection (reopen if closed)
//!                              2. begin batch
//!                              3. drain + stage until empty or drain_bound
//!                                 (per-item success/failure reported here)
//!                              4. commit once if anything was staged
//! ```

pub(crate) mod flush;
mod worker;

pub use flush::BATCH_ADDED;
pub use worker::BatchingCommitWorker;
