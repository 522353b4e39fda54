//! Bounded background execution for work that must never stall frame
//! ingestion, such as memory persistence.
//!
//! The pool holds a fixed number of permits. A job submitted while every
//! permit is taken is dropped and counted instead of queued.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Semaphore;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct BackgroundPool {
    semaphore: Arc<Semaphore>,
    workers: u32,
    dropped: Arc<AtomicU64>,
}

impl BackgroundPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.clamp(1, Semaphore::MAX_PERMITS) as u32;
        Self {
            semaphore: Arc::new(Semaphore::new(workers as usize)),
            workers,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Run `job` on the tokio runtime if a worker is free.
    ///
    /// Returns `false` when the pool is saturated and the job was dropped.
    /// Must be called from within a tokio runtime.
    pub fn submit<F>(&self, label: &'static str, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(job = label, dropped, "Background pool saturated, job dropped");
                return false;
            }
        };

        tokio::spawn(async move {
            job.await;
            drop(permit);
            debug!(job = label, "Background job finished");
        });
        true
    }

    /// Jobs dropped because the pool was saturated.
    pub fn dropped_jobs(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> usize {
        self.workers as usize - self.semaphore.available_permits()
    }

    /// Wait until every running job has finished.
    pub async fn wait_idle(&self) {
        if let Ok(all) = self.semaphore.acquire_many(self.workers).await {
            drop(all);
        }
    }
}
