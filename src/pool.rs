use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::GradingError;

/// Bounded pool for fanning city-level work out across tasks.
///
/// Built explicitly with a size and shut down explicitly; tasks queued
/// after `shutdown` resolve to `GradingError::PoolClosed`.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Spawns `task`; it starts once a worker slot is free.
    pub fn spawn<F, T>(&self, task: F) -> Result<JoinHandle<Result<T, GradingError>>, GradingError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.permits.is_closed() {
            return Err(GradingError::PoolClosed);
        }
        let permits = Arc::clone(&self.permits);
        Ok(tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| GradingError::PoolClosed)?;
            Ok(task.await)
        }))
    }

    pub fn shutdown(&self) {
        if !self.permits.is_closed() {
            info!(workers = self.size, "Shutting down worker pool");
            self.permits.close();
        }
    }

    #[cfg(test)]
    pub fn is_shut_down(&self) -> bool {
        self.permits.is_closed()
    }
}
