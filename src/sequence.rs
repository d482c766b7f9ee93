//! Serialization Queues
//!
//! A `Sequence` applies submitted jobs strictly one at a time, in
//! submission order. Callers either fire-and-forget (`enqueue`) or await
//! the job's result (`run`). Two instances exist per node: `db` serializes
//! every peer-directory mutation, `balances` serializes transaction
//! acceptance.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Sequence errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequenceError {
    #[error("Sequence {0} is closed")]
    Closed(&'static str),
}

pub type SequenceResult<T> = Result<T, SequenceError>;

/// Single-consumer job queue. Submission order equals apply order.
pub struct Sequence {
    name: &'static str,
    tx: mpsc::UnboundedSender<Job>,
    pending: Arc<AtomicUsize>,
}

impl Sequence {
    /// Create a sequence and spawn its consumer task. Must be called from
    /// within a tokio runtime.
    pub fn new(name: &'static str) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let pending = Arc::new(AtomicUsize::new(0));

        let consumer_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
                consumer_pending.fetch_sub(1, Ordering::Relaxed);
            }
            debug!(sequence = name, "consumer stopped");
        });

        Arc::new(Self { name, tx, pending })
    }

    /// Submit a job and continue without waiting for it to apply.
    pub fn enqueue<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pending.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(Box::pin(fut)).is_err() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            debug!(sequence = self.name, "job dropped, sequence closed");
        }
    }

    /// Submit a job and wait for its result.
    pub async fn run<F, T>(&self, fut: F) -> SequenceResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.enqueue(async move {
            let _ = tx.send(fut.await);
        });
        rx.await.map_err(|_| SequenceError::Closed(self.name))
    }

    /// Jobs submitted but not yet applied.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl std::fmt::Debug for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequence")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn test_run_returns_value() {
        let seq = Sequence::new("test");
        let out = seq.run(async { 41 + 1 }).await.unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn test_apply_order_matches_submission_order() {
        let seq = Sequence::new("order");
        let applied: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100u32 {
            let applied = Arc::clone(&applied);
            seq.enqueue(async move {
                applied.lock().push(i);
            });
        }

        // A run() job submitted last observes all prior jobs applied.
        seq.run(async {}).await.unwrap();

        let applied = applied.lock();
        assert_eq!(applied.len(), 100);
        assert!(applied.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_jobs_do_not_overlap() {
        let seq = Sequence::new("overlap");
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            seq.enqueue(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }

        seq.run(async {}).await.unwrap();
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
