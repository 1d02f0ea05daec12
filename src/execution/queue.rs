//! Serial execution queue.
//!
//! FIFO, concurrency exactly one: at most one trading action is in flight
//! at any instant, and a job's side effects complete before the next job
//! starts. Every enqueue returns a handle carrying the job id, a live
//! status, a cancel switch and an awaitable outcome. Jobs receive a cancel
//! signal they must check at their natural await points.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job cancelled")]
    Cancelled,
    #[error("job failed: {0}")]
    Failed(String),
}

/// Cooperative cancel signal handed to each job.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation is requested.
    pub async fn cancelled(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
    }
}

pub type JobFuture<T> = BoxFuture<'static, Result<T, JobError>>;
pub type JobFn<T> = Box<dyn FnOnce(CancelSignal) -> JobFuture<T> + Send>;

struct Shared<T> {
    status: watch::Sender<JobStatus>,
    cancel: watch::Sender<bool>,
    /// Taken exactly once, either by the worker or by an early cancel.
    outcome: Mutex<Option<oneshot::Sender<Result<T, JobError>>>>,
}

impl<T> Shared<T> {
    fn resolve(&self, result: Result<T, JobError>) {
        if let Some(tx) = self.outcome.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(result);
        }
    }
}

pub struct JobHandle<T> {
    pub id: u64,
    shared: Arc<Shared<T>>,
    status_rx: watch::Receiver<JobStatus>,
    outcome_rx: oneshot::Receiver<Result<T, JobError>>,
}

impl<T> JobHandle<T> {
    pub fn status(&self) -> JobStatus {
        *self.status_rx.borrow()
    }

    /// Cancel this job. A pending job resolves to `Cancelled` immediately;
    /// a running job sees its cancel signal flip and must unwind itself.
    pub fn cancel(&self) {
        let pending = *self.status_rx.borrow() == JobStatus::Pending;
        let _ = self.shared.cancel.send(true);
        if pending {
            let _ = self.shared.status.send(JobStatus::Cancelled);
            self.shared.resolve(Err(JobError::Cancelled));
        }
    }

    /// Await the job outcome; rejects with `Cancelled` for cancelled jobs.
    pub async fn wait(self) -> Result<T, JobError> {
        match self.outcome_rx.await {
            Ok(result) => result,
            Err(_) => Err(JobError::Cancelled),
        }
    }
}

struct QueuedJob<T> {
    id: u64,
    job: JobFn<T>,
    shared: Arc<Shared<T>>,
    cancel_rx: watch::Receiver<bool>,
}

pub struct SerialQueue<T> {
    tx: mpsc::UnboundedSender<QueuedJob<T>>,
    next_id: AtomicU64,
    /// Queued + running job count, for `wait_for_idle`.
    active: watch::Sender<usize>,
    controls: Arc<Mutex<HashMap<u64, Arc<Shared<T>>>>>,
}

impl<T: Send + 'static> SerialQueue<T> {
    /// Create the queue and spawn its single worker task.
    pub fn new() -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedJob<T>>();
        let (active_tx, _) = watch::channel(0usize);
        let controls: Arc<Mutex<HashMap<u64, Arc<Shared<T>>>>> = Arc::new(Mutex::new(HashMap::new()));

        let queue = Arc::new(Self { tx, next_id: AtomicU64::new(1), active: active_tx, controls });

        let worker_queue = Arc::downgrade(&queue);
        tokio::spawn(async move {
            while let Some(queued) = rx.recv().await {
                let QueuedJob { id, job, shared, cancel_rx } = queued;

                if *cancel_rx.borrow() {
                    // Cancelled while pending; the handle already resolved it.
                    let _ = shared.status.send(JobStatus::Cancelled);
                    shared.resolve(Err(JobError::Cancelled));
                } else {
                    let _ = shared.status.send(JobStatus::Running);
                    debug!(job_id = id, "execution job started");
                    let result = job(CancelSignal { rx: cancel_rx }).await;
                    match &result {
                        Ok(_) => {
                            let _ = shared.status.send(JobStatus::Completed);
                        }
                        Err(JobError::Cancelled) => {
                            let _ = shared.status.send(JobStatus::Cancelled);
                        }
                        Err(JobError::Failed(reason)) => {
                            warn!(job_id = id, %reason, "execution job failed");
                            let _ = shared.status.send(JobStatus::Failed);
                        }
                    }
                    shared.resolve(result);
                }

                if let Some(queue) = worker_queue.upgrade() {
                    queue.controls.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
                    queue.active.send_modify(|n| *n = n.saturating_sub(1));
                }
            }
        });

        queue
    }

    /// Enqueue a job; FIFO order is the enqueue order.
    pub fn enqueue(&self, job: JobFn<T>) -> JobHandle<T> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (status_tx, status_rx) = watch::channel(JobStatus::Pending);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let shared = Arc::new(Shared {
            status: status_tx,
            cancel: cancel_tx,
            outcome: Mutex::new(Some(outcome_tx)),
        });

        self.controls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::clone(&shared));
        self.active.send_modify(|n| *n += 1);

        let queued = QueuedJob { id, job, shared: Arc::clone(&shared), cancel_rx };
        if self.tx.send(queued).is_err() {
            // Worker is gone; reject immediately.
            let _ = shared.status.send(JobStatus::Cancelled);
            shared.resolve(Err(JobError::Cancelled));
            self.active.send_modify(|n| *n = n.saturating_sub(1));
        }

        JobHandle { id, shared, status_rx, outcome_rx }
    }

    /// Cancel every pending and running job.
    pub fn cancel_all(&self) {
        let controls = self.controls.lock().unwrap_or_else(|e| e.into_inner());
        for shared in controls.values() {
            let pending = *shared.status.borrow() == JobStatus::Pending;
            let _ = shared.cancel.send(true);
            if pending {
                let _ = shared.status.send(JobStatus::Cancelled);
                shared.resolve(Err(JobError::Cancelled));
            }
        }
    }

    /// Resolve once the queue is empty and no job is running.
    pub async fn wait_for_idle(&self) {
        let mut rx = self.active.subscribe();
        if *rx.borrow() == 0 {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() == 0 {
                return;
            }
        }
    }

    pub fn depth(&self) -> usize {
        *self.active.subscribe().borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record_job(
        order: Arc<Mutex<Vec<u32>>>,
        id: u32,
        delay: Duration,
    ) -> JobFn<u32> {
        Box::new(move |signal: CancelSignal| {
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                if signal.is_cancelled() {
                    return Err(JobError::Cancelled);
                }
                order.lock().unwrap().push(id);
                Ok(id)
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_run_in_enqueue_order() {
        let queue = SerialQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        // Job 1 is the slowest; order must still be 1, 2, 3.
        let h1 = queue.enqueue(record_job(order.clone(), 1, Duration::from_millis(300)));
        let h2 = queue.enqueue(record_job(order.clone(), 2, Duration::from_millis(10)));
        let h3 = queue.enqueue(record_job(order.clone(), 3, Duration::from_millis(1)));

        queue.wait_for_idle().await;
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(h1.status(), JobStatus::Completed);
        assert_eq!(h2.status(), JobStatus::Completed);
        assert_eq!(h3.status(), JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_two_jobs_overlap() {
        let queue = SerialQueue::new();
        let running = Arc::new(Mutex::new((0u32, 0u32))); // (current, max)
        let mut handles = Vec::new();
        for _ in 0..5 {
            let running = running.clone();
            handles.push(queue.enqueue(Box::new(move |_signal| {
                Box::pin(async move {
                    {
                        let mut r = running.lock().unwrap();
                        r.0 += 1;
                        r.1 = r.1.max(r.0);
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.lock().unwrap().0 -= 1;
                    Ok(0u32)
                })
            })));
        }
        queue.wait_for_idle().await;
        assert_eq!(running.lock().unwrap().1, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_job_rejects_awaitable() {
        let queue = SerialQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let h1 = queue.enqueue(record_job(order.clone(), 1, Duration::from_millis(100)));
        let h2 = queue.enqueue(record_job(order.clone(), 2, Duration::from_millis(1)));
        let h3 = queue.enqueue(record_job(order.clone(), 3, Duration::from_millis(1)));

        h2.cancel();
        assert_eq!(h2.status(), JobStatus::Cancelled);
        let outcome = h2.wait().await;
        assert_eq!(outcome, Err(JobError::Cancelled));

        queue.wait_for_idle().await;
        assert_eq!(*order.lock().unwrap(), vec![1, 3]);
        assert_eq!(h1.wait().await, Ok(1));
        assert_eq!(h3.wait().await, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_running_job_flips_signal() {
        let queue = SerialQueue::new();
        let h = queue.enqueue(Box::new(|mut signal: CancelSignal| {
            Box::pin(async move {
                signal.cancelled().await;
                Err::<u32, _>(JobError::Cancelled)
            })
        }));
        // Let the job start, then cancel it.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.status(), JobStatus::Running);
        h.cancel();
        assert_eq!(h.wait().await, Err(JobError::Cancelled));
        queue.wait_for_idle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_drains_queue() {
        let queue = SerialQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let h1 = queue.enqueue(Box::new(|mut signal: CancelSignal| {
            Box::pin(async move {
                signal.cancelled().await;
                Err::<u32, _>(JobError::Cancelled)
            })
        }));
        let h2 = queue.enqueue(record_job(order.clone(), 2, Duration::from_millis(1)));
        tokio::time::sleep(Duration::from_millis(10)).await;

        queue.cancel_all();
        assert_eq!(h1.wait().await, Err(JobError::Cancelled));
        assert_eq!(h2.wait().await, Err(JobError::Cancelled));
        queue.wait_for_idle().await;
        assert!(order.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_idle_on_empty_queue_returns() {
        let queue: Arc<SerialQueue<u32>> = SerialQueue::new();
        queue.wait_for_idle().await;
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_job_marks_handle_failed() {
        let queue: Arc<SerialQueue<u32>> = SerialQueue::new();
        let h = queue.enqueue(Box::new(|_signal| {
            Box::pin(async { Err(JobError::Failed("venue rejected".into())) })
        }));
        assert_eq!(h.wait().await, Err(JobError::Failed("venue rejected".into())));
        queue.wait_for_idle().await;
    }
}
