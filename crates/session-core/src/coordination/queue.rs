//! Per-key serial task execution
//!
//! Each key (a participant public id) gets one worker task fed by a bounded
//! channel while it has work. Jobs submitted for the same key run one at a
//! time in submission order; jobs for different keys run concurrently.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("worker for '{0}' stopped before completing the job")]
    WorkerGone(String),
}

struct Worker {
    tx: mpsc::Sender<Job>,
    /// Jobs submitted and not yet finished
    pending: Arc<AtomicUsize>,
}

/// A worker exists only while it has jobs; it is dropped once the last one
/// finishes.
pub struct KeyedTaskQueue {
    workers: DashMap<String, Worker>,
    capacity: usize,
}

impl KeyedTaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            workers: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Run `fut` on the worker for `key` and wait for its output
    pub async fn run<F, T>(&self, key: &str, fut: F) -> Result<T, QueueError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let mut job: Job = Box::pin(async move {
            let _ = tx.send(fut.await);
        });

        // One retry covers a worker that died between lookup and send
        for _ in 0..2 {
            let (sender, pending) = self.acquire(key);
            match sender.send(job).await {
                Ok(()) => {
                    let output = rx.await.map_err(|_| QueueError::WorkerGone(key.to_string()));
                    self.release(key, &pending);
                    return output;
                }
                Err(mpsc::error::SendError(returned)) => {
                    tracing::warn!(key, "Task queue worker stopped, restarting it");
                    pending.fetch_sub(1, Ordering::SeqCst);
                    self.workers.remove_if(key, |_, w| Arc::ptr_eq(&w.pending, &pending));
                    job = returned;
                }
            }
        }
        Err(QueueError::WorkerGone(key.to_string()))
    }

    /// Stop accepting jobs for `key`; queued jobs still run
    pub fn remove(&self, key: &str) -> bool {
        self.workers.remove(key).is_some()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    // The pending count is raised under the map's shard lock, so an idle
    // check in `release` never races a new submission.
    fn acquire(&self, key: &str) -> (mpsc::Sender<Job>, Arc<AtomicUsize>) {
        let worker = self.workers.entry(key.to_string()).or_insert_with(|| {
            let (tx, mut rx) = mpsc::channel::<Job>(self.capacity);
            let key = key.to_string();
            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    job.await;
                }
                tracing::trace!(key = %key, "Task queue worker finished");
            });
            Worker {
                tx,
                pending: Arc::new(AtomicUsize::new(0)),
            }
        });
        worker.pending.fetch_add(1, Ordering::SeqCst);
        (worker.tx.clone(), Arc::clone(&worker.pending))
    }

    fn release(&self, key: &str, pending: &Arc<AtomicUsize>) {
        if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.workers.remove_if(key, |_, w| {
                Arc::ptr_eq(&w.pending, pending) && w.pending.load(Ordering::SeqCst) == 0
            });
        }
    }
}

impl Default for KeyedTaskQueue {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_runs_in_submission_order() {
        let queue = Arc::new(KeyedTaskQueue::new(16));
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..10u64 {
            let queue = queue.clone();
            let log = log.clone();
            // Earlier jobs sleep longer; order must still hold
            handles.push(tokio::spawn(async move {
                queue
                    .run("participant-a", async move {
                        tokio::time::sleep(Duration::from_millis(10 - i)).await;
                        log.lock().push(i);
                    })
                    .await
            }));
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_returns_job_output() {
        let queue = KeyedTaskQueue::default();
        let answer = queue.run("k", async { 41 + 1 }).await.unwrap();
        assert_eq!(answer, 42);
        assert_eq!(queue.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_workers_are_dropped() {
        let queue = Arc::new(KeyedTaskQueue::default());
        let (tx, rx) = oneshot::channel::<()>();

        let q = queue.clone();
        let busy = tokio::spawn(async move {
            q.run("room1", async move {
                let _ = rx.await;
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.worker_count(), 1);

        tx.send(()).unwrap();
        busy.await.unwrap().unwrap();
        assert_eq!(queue.worker_count(), 0);

        for key in ["pub-a", "pub-b", "room1"] {
            queue.run(key, async {}).await.unwrap();
        }
        assert_eq!(queue.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_stops_new_jobs_for_key() {
        let queue = Arc::new(KeyedTaskQueue::default());
        let (tx, rx) = oneshot::channel::<()>();
        let q = queue.clone();
        let busy = tokio::spawn(async move {
            q.run("k", async move {
                let _ = rx.await;
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(queue.remove("k"));
        assert!(!queue.remove("k"));

        tx.send(()).unwrap();
        busy.await.unwrap().unwrap();
        assert_eq!(queue.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_run_concurrently() {
        let queue = Arc::new(KeyedTaskQueue::default());
        let (tx, rx) = oneshot::channel::<()>();

        let q = queue.clone();
        let blocked = tokio::spawn(async move {
            q.run("a", async move {
                let _ = rx.await;
            })
            .await
        });

        // "b" completes while "a" is still blocked
        let out = tokio::time::timeout(Duration::from_secs(1), queue.run("b", async { 7 }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out, 7);

        tx.send(()).unwrap();
        blocked.await.unwrap().unwrap();
    }
}
