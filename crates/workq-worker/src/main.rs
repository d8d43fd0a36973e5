use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use workq::{
    BatchConfig, BatchingCommitWorker, ChannelWorkQueue, CompletionStatus, DataSource, Outcome,
    PgDataSource, PoolConfig, QueueError, WorkError, WorkItem, Worker, WorkerPoolService,
};

const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const SUBMIT_RETRY_DELAY: Duration = Duration::from_millis(10);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging();

    tracing::info!("workq-worker starting...");

    let pool_config = PoolConfig::from_env().context("Invalid worker pool configuration")?;
    let batch_config = BatchConfig::from_env().context("Invalid flush configuration")?;
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let max_connections = env_or(
        "WORKQ_DB_MAX_CONNECTIONS",
        default_max_connections(pool_config.size),
    )?;
    let queue_capacity = env_or("WORKQ_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY)?;

    tracing::info!(
        pool_size = pool_config.size,
        max_connections,
        queue_capacity,
        shutdown_timeout_ms = pool_config.shutdown_timeout.as_millis() as u64,
        "Starting worker pool"
    );

    let data_source: Arc<dyn DataSource> = Arc::new(
        PgDataSource::connect_lazy(&database_url, max_connections)
            .context("Failed to configure PostgreSQL pool")?,
    );

    // One batching worker per pool unit, each with its own connection
    let workers: Vec<Arc<BatchingCommitWorker>> = (0..pool_config.size)
        .map(|_| {
            Arc::new(BatchingCommitWorker::new(
                Arc::clone(&data_source),
                batch_config.clone(),
            ))
        })
        .collect();

    let next = AtomicUsize::new(0);
    let handed_out = workers.clone();
    let factory = move || -> Arc<dyn Worker> {
        let index = next.fetch_add(1, Ordering::Relaxed) % handed_out.len();
        handed_out[index].clone()
    };

    let queue = Arc::new(ChannelWorkQueue::new(queue_capacity));
    let pool = WorkerPoolService::new(queue.clone(), Arc::new(factory));
    pool.start(pool_config.size)
        .context("Failed to start worker pool")?;

    tokio::select! {
        result = read_items(&pool) => {
            result.context("Failed to read work items")?;
            tracing::info!("Input closed; draining queue");
            queue.close();
            tokio::select! {
                _ = wait_until_drained(&queue) => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received shutdown signal");
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    let outcome = pool.stop(pool_config.shutdown_timeout).await;
    for worker in &workers {
        worker.close().await;
    }

    tracing::info!(?outcome, "Worker shutdown complete");
    Ok(())
}

/// Install the fmt subscriber. `RUST_LOG` wins over `LOG_LEVEL`.
fn init_logging() {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| {
            std::env::var("LOG_LEVEL")
                .ok()
                .map(|level| format!("workq={level},workq_worker={level}"))
        })
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new("workq=info,workq_worker=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// One database connection per pool unit, saturating at `u32::MAX`
fn default_max_connections(pool_size: usize) -> u32 {
    u32::try_from(pool_size).unwrap_or(u32::MAX)
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {key}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

/// Submit one work item per stdin line until end of input.
///
/// Each line is a JSON array of statements. Lines that are not JSON are
/// skipped.
async fn read_items(pool: &WorkerPoolService) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let payload: serde_json::Value = match serde_json::from_str(line) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping input line that is not JSON");
                continue;
            }
        };

        let mut item = WorkItem::new(payload, log_outcome);
        loop {
            match pool.submit(item) {
                Ok(()) => break,
                Err(QueueError::Full(rejected)) => {
                    item = rejected;
                    tokio::time::sleep(SUBMIT_RETRY_DELAY).await;
                }
                Err(QueueError::Closed(rejected)) => {
                    rejected.fail(WorkError::Cancelled, CompletionStatus::Cancelled);
                    return Ok(());
                }
            }
        }
    }

    Ok(())
}

fn log_outcome(outcome: Outcome) {
    let work_id = outcome.result().work_id;
    match outcome.error() {
        None => tracing::debug!(%work_id, "Work item batched"),
        Some(error) => tracing::warn!(
            %work_id,
            status = %outcome.status(),
            error = %error,
            "Work item failed"
        ),
    }
}

async fn wait_until_drained(queue: &ChannelWorkQueue) {
    while !queue.is_empty() {
        tokio::time::sleep(SUBMIT_RETRY_DELAY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_max_connections_follows_pool_size() {
        assert_eq!(default_max_connections(8), 8);
        assert_eq!(default_max_connections(u32::MAX as usize), u32::MAX);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_default_max_connections_saturates() {
        assert_eq!(default_max_connections(u32::MAX as usize + 1), u32::MAX);
        assert_eq!(default_max_connections(usize::MAX), u32::MAX);
    }

    #[test]
    fn test_env_or_uses_default_when_unset() {
        let value: usize = env_or("WORKQ_TEST_UNSET_VARIABLE", 7).unwrap();
        assert_eq!(value, 7);
    }
}
