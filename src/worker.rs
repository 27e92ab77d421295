use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::error::{EngineError, Result};
use crate::package::SourcePackage;
use crate::registry::{DatasetRegistry, LoadMode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    LoadSource {
        dataset: String,
        package: String,
        filename: String,
        mode: LoadMode,
    },
    ComputeCardinalities {
        dataset: String,
    },
}

impl Job {
    pub fn dataset(&self) -> &str {
        match self {
            Job::LoadSource { dataset, .. } | Job::ComputeCardinalities { dataset } => dataset,
        }
    }
}

/// Sink for heavy work that must not run on a request path.
pub trait WorkQueue: Send + Sync {
    fn enqueue(&self, job: Job) -> Result<()>;
}

#[derive(Clone)]
pub struct ChannelQueue {
    sender: mpsc::UnboundedSender<Job>,
}

pub fn channel() -> (ChannelQueue, mpsc::UnboundedReceiver<Job>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (ChannelQueue { sender }, receiver)
}

impl WorkQueue for ChannelQueue {
    fn enqueue(&self, job: Job) -> Result<()> {
        self.sender
            .send(job)
            .map_err(|e| EngineError::InternalError {
                message: format!("Work queue closed, dropped job for {}", e.0.dataset()),
            })
    }
}

type LockMap = Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>;

/// One async mutex per dataset name, kept only while someone holds or awaits it.
#[derive(Default, Clone)]
struct DatasetLocks {
    inner: LockMap,
}

impl DatasetLocks {
    async fn lock(&self, dataset: &str) -> DatasetGuard {
        let entry = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(dataset.to_string())
            .or_default()
            .clone();
        DatasetGuard {
            guard: Some(entry.lock_owned().await),
            dataset: dataset.to_string(),
            locks: self.inner.clone(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

struct DatasetGuard {
    guard: Option<OwnedMutexGuard<()>>,
    dataset: String,
    locks: LockMap,
}

impl Drop for DatasetGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // the map's own reference is the last one
        if locks
            .get(&self.dataset)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(&self.dataset);
        }
    }
}

/// Runs queued jobs concurrently, but never two jobs for the same dataset at once.
#[derive(Clone)]
pub struct Worker {
    registry: Arc<DatasetRegistry>,
    locks: DatasetLocks,
}

impl Worker {
    pub fn new(registry: Arc<DatasetRegistry>) -> Self {
        Self {
            registry,
            locks: DatasetLocks::default(),
        }
    }

    /// Drains the queue until every sender is gone. Returns how many jobs failed.
    pub async fn run(self, mut receiver: mpsc::UnboundedReceiver<Job>) -> usize {
        let mut tasks = JoinSet::new();
        while let Some(job) = receiver.recv().await {
            let worker = self.clone();
            tasks.spawn(async move { worker.process(job).await });
        }

        let mut failures = 0;
        while let Some(outcome) = tasks.join_next().await {
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(_)) => failures += 1,
                Err(e) => {
                    error!("Worker task panicked: {}", e);
                    failures += 1;
                }
            }
        }
        info!("Worker stopped, {} failed jobs", failures);
        failures
    }

    pub async fn process(&self, job: Job) -> Result<()> {
        let _guard = self.locks.lock(job.dataset()).await;
        info!("Processing {:?}", job);

        let outcome = self.execute(&job).await;
        if let Err(e) = &outcome {
            error!("Job for {} failed: {}", job.dataset(), e);
        }
        outcome
    }

    async fn execute(&self, job: &Job) -> Result<()> {
        match job {
            Job::LoadSource {
                dataset,
                package,
                filename,
                mode,
            } => {
                let mut dataset = self.registry.get(dataset).await?;
                let source = SourcePackage::with_id(self.registry.warehouse().clone(), package.as_str())
                    .open(filename)
                    .await?;
                let report = self.registry.load_source(&mut dataset, source, *mode).await?;
                info!(
                    "Loaded {} rows into {} from package {}",
                    report.rows, dataset.name, package
                );
            }
            Job::ComputeCardinalities { dataset } => {
                let mut dataset = self.registry.get(dataset).await?;
                self.registry.refresh_cardinalities(&mut dataset).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn released_dataset_locks_are_forgotten() {
        let locks = DatasetLocks::default();

        let first = locks.lock("shrinking").await;
        let other = locks.lock("other").await;
        assert_eq!(locks.len(), 2);

        // a waiter keeps the entry alive after the holder releases it
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("shrinking").await;
            })
        };
        tokio::task::yield_now().await;
        drop(first);
        waiter.await.unwrap();

        assert_eq!(locks.len(), 1);
        drop(other);
        assert_eq!(locks.len(), 0);
    }
}
