//! Bounded pool for the blocking resource-manager calls.

use std::sync::Arc;

use tokio::sync::Semaphore;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("blocking pool is closed")]
    Closed,
    #[error("blocking task panicked: {0}")]
    Panicked(String),
    #[error("blocking task was cancelled")]
    Cancelled,
}

/// Runs closures on tokio's blocking threads, at most `limit` at a time.
#[derive(Clone)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl BlockingPool {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn run<F, T>(&self, work: F) -> Result<T, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            work()
        });
        match handle.await {
            Ok(value) => Ok(value),
            Err(err) if err.is_panic() => Err(PoolError::Panicked(err.to_string())),
            Err(_) => Err(PoolError::Cancelled),
        }
    }
}
