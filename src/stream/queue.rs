//! Bounded inbound event queue.
//!
//! Inbound stream messages flow through a bounded FIFO between the
//! connection manager and the handler task. When the queue is full the
//! newest message is refused (deterministic `push` return value); a drop
//! counter and an optional callback expose the backpressure. A panicking
//! handler is caught and the queue keeps draining.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

pub type DropCallback = Arc<dyn Fn(u64) + Send + Sync>;

pub struct BoundedQueue<T> {
    tx: mpsc::Sender<T>,
    dropped: Arc<AtomicU64>,
    on_drop: Option<DropCallback>,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            dropped: self.dropped.clone(),
            on_drop: self.on_drop.clone(),
        }
    }
}

impl<T: Send + 'static> BoundedQueue<T> {
    pub fn new(capacity: usize, on_drop: Option<DropCallback>) -> (Self, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
                on_drop,
            },
            rx,
        )
    }

    /// Enqueue without waiting. Returns false (and counts a drop) when full.
    pub fn push(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) | Err(mpsc::error::TrySendError::Closed(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(cb) = &self.on_drop {
                    cb(total);
                }
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drain `rx` serially through `handler`, isolating handler panics.
    /// Serial dispatch preserves arrival order within a generation.
    pub fn spawn_drain<F>(mut rx: mpsc::Receiver<T>, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(T) + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                let outcome = AssertUnwindSafe(async { handler(item) }).catch_unwind().await;
                if outcome.is_err() {
                    error!("stream handler panicked, continuing with next message");
                }
            }
            warn!("inbound queue closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as TestCounter;

    #[tokio::test]
    async fn test_refuses_newest_when_full() {
        let (queue, _rx) = BoundedQueue::new(2, None);
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(!queue.push(3));
        assert_eq!(queue.dropped(), 1);
    }

    #[tokio::test]
    async fn test_drop_callback_sees_running_total() {
        let seen = Arc::new(TestCounter::new(0));
        let seen_cb = seen.clone();
        let (queue, _rx) = BoundedQueue::new(1, Some(Arc::new(move |total| {
            seen_cb.store(total, Ordering::SeqCst);
        })));
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fifo_order_preserved() {
        let (queue, rx) = BoundedQueue::new(16, None);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let order_in = order.clone();
        let handle = BoundedQueue::spawn_drain(rx, move |item: u32| {
            order_in.lock().unwrap().push(item);
        });
        for i in 1..=5 {
            assert!(queue.push(i));
        }
        drop(queue);
        handle.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_handler_panic_does_not_stop_queue() {
        let (queue, rx) = BoundedQueue::new(16, None);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_in = seen.clone();
        let handle = BoundedQueue::spawn_drain(rx, move |item: u32| {
            if item == 2 {
                panic!("boom");
            }
            seen_in.lock().unwrap().push(item);
        });
        for i in 1..=3 {
            queue.push(i);
        }
        drop(queue);
        handle.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 3]);
    }
}
