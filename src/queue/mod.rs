// Admission queue: bounds concurrency globally in front of the scheduler and
// upstream. A one-shot atomic release flag stands in for a promise-chained
// release, built on the same `tokio::sync` primitives (`RwLock`/`Mutex`
// pairing, a connection-pooled client) used throughout the rest of the
// async code here.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::error::{ProxyError, Result};

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub concurrency: u32,
    pub in_flight: usize,
    pub waiting: usize,
    pub paused: bool,
}

/// Holds the admission slot for one request. Releases exactly once, via
/// whichever of the explicit `release()` call or `Drop` fires first — the
/// second is a no-op. `Drop` is what makes a client-disconnect (the future
/// simply stops being polled) release the slot as promptly as an explicit
/// finish.
pub struct AdmissionGuard {
    released: Arc<AtomicBool>,
    permit: Option<tokio::sync::OwnedSemaphorePermit>,
    in_flight: Arc<AtomicUsize>,
}

impl AdmissionGuard {
    pub fn release(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let in_flight = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        self.permit.take();
        crate::metrics::set_queue_in_flight(in_flight);
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct AdmissionQueue {
    semaphore: Arc<Semaphore>,
    max_concurrent: u32,
    queue_limit: usize,
    timeout: Duration,
    in_flight: Arc<AtomicUsize>,
    waiting: Arc<AtomicUsize>,
    paused: AtomicBool,
    /// Epoch millis of the oldest still-pending admission, used only for
    /// diagnostics (not part of the admission decision).
    oldest_pending_since_ms: AtomicI64,
}

impl AdmissionQueue {
    pub fn new(max_concurrent: u32, queue_limit: usize, timeout_ms: u64) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1) as usize)),
            max_concurrent,
            queue_limit,
            timeout: Duration::from_millis(timeout_ms),
            in_flight: Arc::new(AtomicUsize::new(0)),
            waiting: Arc::new(AtomicUsize::new(0)),
            paused: AtomicBool::new(false),
            oldest_pending_since_ms: AtomicI64::new(0),
        }
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            concurrency: self.max_concurrent,
            in_flight: self.in_flight.load(Ordering::Relaxed),
            waiting: self.waiting.load(Ordering::Relaxed),
            paused: self.paused.load(Ordering::Relaxed),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Admit into the queue (reserving a `waiting` slot against
    /// `queue_limit`, the requests not yet holding a permit), then wait FIFO
    /// for an execution permit. Effective admitted capacity is therefore
    /// `max_concurrent + queue_limit`: `queue_limit` bounds how many requests
    /// may be queued behind the `max_concurrent` already in flight, not how
    /// many are admitted overall.
    async fn acquire(&self) -> Result<AdmissionGuard> {
        if self.paused.load(Ordering::Relaxed) {
            crate::metrics::record_queue_rejection("paused");
            return Err(ProxyError::ServiceUnavailable("admission queue is paused".to_string()));
        }

        let waiting_now = self.waiting.fetch_add(1, Ordering::SeqCst) + 1;
        if waiting_now > self.queue_limit {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            crate::metrics::record_queue_rejection("queue_full");
            return Err(ProxyError::QueueFull(format!(
                "queue size {} exceeded (limit {})",
                waiting_now - 1,
                self.queue_limit
            )));
        }
        self.oldest_pending_since_ms.store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
        crate::metrics::set_queue_depth(self.in_flight.load(Ordering::Relaxed), waiting_now);

        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                self.waiting.fetch_sub(1, Ordering::SeqCst);
                return Err(ProxyError::ServiceUnavailable("admission queue closed".to_string()));
            }
        };
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        crate::metrics::set_queue_depth(self.in_flight.load(Ordering::Relaxed), self.waiting.load(Ordering::Relaxed));

        Ok(AdmissionGuard {
            released: Arc::new(AtomicBool::new(false)),
            permit: Some(permit),
            in_flight: self.in_flight.clone(),
        })
    }

    /// Admit the request, run `handler` with the admission guard, and bound
    /// its execution by `timeout`. On timeout the guard's `Drop` releases the
    /// slot; callers decide whether that means a 504 or a terminated
    /// connection, based on whether response headers were already sent.
    pub async fn run<F, Fut, T>(&self, handler: F) -> Result<T>
    where
        F: FnOnce(AdmissionGuard) -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let guard = self.acquire().await?;

        match tokio::time::timeout(self.timeout, handler(guard)).await {
            Ok(value) => Ok(value),
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "admission handler exceeded timeout");
                crate::metrics::record_queue_rejection("timeout");
                Err(ProxyError::Timeout("handler exceeded the admission timeout".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn admits_up_to_max_concurrent_then_queues() {
        let queue = Arc::new(AdmissionQueue::new(1, 1, 5_000));

        let q1 = queue.clone();
        let first = tokio::spawn(async move {
            q1.run(|_guard| async {
                tokio::time::sleep(StdDuration::from_millis(50)).await;
            })
            .await
        });

        tokio::time::sleep(StdDuration::from_millis(10)).await;
        let status = queue.status();
        assert_eq!(status.in_flight, 1);

        first.await.unwrap().unwrap();
        let status = queue.status();
        assert_eq!(status.in_flight, 0);
        assert_eq!(status.waiting, 0);
    }

    #[tokio::test]
    async fn rejects_when_queue_limit_exceeded() {
        let queue = Arc::new(AdmissionQueue::new(1, 1, 5_000));

        let q1 = queue.clone();
        let holder = tokio::spawn(async move {
            q1.run(|_guard| async {
                tokio::time::sleep(StdDuration::from_millis(100)).await;
            })
            .await
        });
        tokio::time::sleep(StdDuration::from_millis(10)).await;

        let q2 = queue.clone();
        let waiter = tokio::spawn(async move {
            q2.run(|_guard| async {
                tokio::time::sleep(StdDuration::from_millis(10)).await;
            })
            .await
        });
        tokio::time::sleep(StdDuration::from_millis(10)).await;

        let third = queue.run(|_guard| async {}).await;
        assert!(matches!(third, Err(ProxyError::QueueFull(_))));

        holder.await.unwrap().unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn handler_timeout_surfaces_as_timeout_error() {
        let queue = AdmissionQueue::new(1, 1, 20);
        let result = queue
            .run(|_guard| async {
                tokio::time::sleep(StdDuration::from_millis(200)).await;
            })
            .await;
        assert!(matches!(result, Err(ProxyError::Timeout(_))));
    }

    #[tokio::test]
    async fn guard_release_is_idempotent_across_explicit_and_drop_paths() {
        let queue = AdmissionQueue::new(2, 5, 5_000);
        queue
            .run(|mut guard| async move {
                guard.release();
                guard.release();
            })
            .await
            .unwrap();
        assert_eq!(queue.status().in_flight, 0);
    }

    #[tokio::test]
    async fn paused_queue_rejects_admission() {
        let queue = AdmissionQueue::new(1, 1, 5_000);
        queue.pause();
        let result = queue.run(|_guard| async {}).await;
        assert!(matches!(result, Err(ProxyError::ServiceUnavailable(_))));
        queue.resume();
        let result = queue.run(|_guard| async { 42 }).await;
        assert_eq!(result.unwrap(), 42);
    }
}
