//! Bounded job queue drained by a fixed set of tokio workers.
//!
//! Submission never waits: a full queue is reported as [`Error::QueueFull`]
//! and the caller decides what to do with the work.

use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::PoolConfig;
use crate::metrics;
use crate::{Error, Result};

#[async_trait]
pub trait Job: Send + Sync {
    /// Short label used in logs.
    fn describe(&self) -> String;
    async fn process(&self) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
pub trait JobSubmitter: Send + Sync {
    fn submit(&self, job: Box<dyn Job>) -> Result<()>;
}

pub struct WorkerPool {
    tx: mpsc::Sender<Box<dyn Job>>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns the workers. Must be called from inside a tokio runtime.
    pub fn start(config: &PoolConfig) -> Self {
        let (tx, rx) = mpsc::channel::<Box<dyn Job>>(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let workers = (0..config.workers.max(1))
            .map(|worker_id| {
                let rx = rx.clone();
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(run_worker(worker_id, rx, shutdown_rx))
            })
            .collect();

        info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "Worker pool started"
        );

        Self {
            tx,
            shutdown,
            workers: Mutex::new(workers),
        }
    }

    /// Signals every worker to stop after its current job and waits for them.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for handle in workers {
            if let Err(e) = handle.await {
                error!("Worker task ended abnormally: {}", e);
            }
        }
        info!("Worker pool stopped");
    }
}

impl JobSubmitter for WorkerPool {
    fn submit(&self, job: Box<dyn Job>) -> Result<()> {
        match self.tx.try_send(job) {
            Ok(()) => {
                metrics::POOL_JOBS_TOTAL.with_label_values(&["submitted"]).inc();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                metrics::POOL_JOBS_TOTAL.with_label_values(&["rejected"]).inc();
                debug!("Rejected job {}: queue full", job.describe());
                Err(Error::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(Error::Internal("worker pool is shut down".into()))
            }
        }
    }
}

async fn run_worker(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Box<dyn Job>>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker_id, "Worker started");
    loop {
        let job = tokio::select! {
            _ = shutdown.changed() => break,
            job = async { rx.lock().await.recv().await } => job,
        };

        let Some(job) = job else { break };
        let label = job.describe();
        // A panicking job must not take its worker down with it.
        match AssertUnwindSafe(job.process()).catch_unwind().await {
            Ok(Ok(())) => {
                metrics::POOL_JOBS_TOTAL.with_label_values(&["succeeded"]).inc();
                debug!(worker_id, job = %label, "Job finished");
            }
            Ok(Err(e)) => {
                metrics::POOL_JOBS_TOTAL.with_label_values(&["failed"]).inc();
                error!(worker_id, job = %label, error = %e, "Job failed");
            }
            Err(_) => {
                metrics::POOL_JOBS_TOTAL.with_label_values(&["panicked"]).inc();
                error!(worker_id, job = %label, "Job panicked");
            }
        }

        if *shutdown.borrow() {
            break;
        }
    }
    debug!(worker_id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio_test::{assert_err, assert_ok};

    struct CountingJob {
        counter: Arc<AtomicUsize>,
        done: Arc<Notify>,
    }

    #[async_trait]
    impl Job for CountingJob {
        fn describe(&self) -> String {
            "counting".into()
        }

        async fn process(&self) -> Result<()> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            self.done.notify_one();
            Ok(())
        }
    }

    struct BlockingJob {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl Job for BlockingJob {
        fn describe(&self) -> String {
            "blocking".into()
        }

        async fn process(&self) -> Result<()> {
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_jobs_are_processed() {
        let pool = WorkerPool::start(&PoolConfig { workers: 2, queue_capacity: 8 });
        let counter = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(Notify::new());

        assert_ok!(pool.submit(Box::new(CountingJob { counter: counter.clone(), done: done.clone() })));
        tokio::time::timeout(Duration::from_secs(5), done.notified())
            .await
            .expect("job should run");

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        pool.shutdown().await;
    }

    struct PanickingJob;

    #[async_trait]
    impl Job for PanickingJob {
        fn describe(&self) -> String {
            "panicking".into()
        }

        async fn process(&self) -> Result<()> {
            panic!("job blew up");
        }
    }

    #[tokio::test]
    async fn test_worker_survives_panicking_job() {
        let pool = WorkerPool::start(&PoolConfig { workers: 1, queue_capacity: 8 });
        let counter = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(Notify::new());

        assert_ok!(pool.submit(Box::new(PanickingJob)));
        assert_ok!(pool.submit(Box::new(CountingJob { counter: counter.clone(), done: done.clone() })));
        tokio::time::timeout(Duration::from_secs(5), done.notified())
            .await
            .expect("single worker should still be alive");

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_queue_fails_fast() {
        let pool = WorkerPool::start(&PoolConfig { workers: 1, queue_capacity: 1 });
        let release = Arc::new(Notify::new());

        // Occupy the single worker, then fill the single queue slot.
        assert_ok!(pool.submit(Box::new(BlockingJob { release: release.clone() })));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_ok!(pool.submit(Box::new(BlockingJob { release: release.clone() })));

        let rejected = assert_err!(pool.submit(Box::new(BlockingJob { release: release.clone() })));
        assert!(matches!(rejected, Error::QueueFull));

        release.notify_waiters();
        release.notify_one();
    }
}
