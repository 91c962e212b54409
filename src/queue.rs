//! Bounded-concurrency priority admission queue
//!
//! At most `concurrency` tasks hold a [`QueuePermit`] at once. Others wait
//! in a heap ordered by priority (higher first) and then by arrival.
//! Dropping a permit hands its slot straight to the next waiter.

use crate::error::{CallError, Result};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Waiter {
    priority: i32,
    sequence: u64,
    tx: oneshot::Sender<QueuePermit>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then lower sequence (older) first
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            other_ordering => other_ordering,
        }
    }
}

struct QueueState {
    concurrency: usize,
    max_queue: usize,
    running: usize,
    waiting: BinaryHeap<Waiter>,
    sequence: u64,
}

struct QueueShared {
    state: Mutex<QueueState>,
}

impl QueueShared {
    fn release(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.running = state.running.saturating_sub(1);
        self.dispatch(&mut state);
    }

    fn dispatch(self: &Arc<Self>, state: &mut QueueState) {
        while state.running < state.concurrency {
            let Some(waiter) = state.waiting.pop() else {
                break;
            };

            state.running += 1;
            let permit = QueuePermit {
                shared: Some(Arc::clone(self)),
            };
            if let Err(mut permit) = waiter.tx.send(permit) {
                // Waiter gave up; the slot is still ours to hand out
                permit.shared = None;
                state.running -= 1;
            }
        }
    }
}

/// A running slot, released on drop
pub struct QueuePermit {
    shared: Option<Arc<QueueShared>>,
}

impl Drop for QueuePermit {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release();
        }
    }
}

/// Priority queue bounding concurrent transport sends
#[derive(Clone)]
pub struct RequestQueue {
    shared: Arc<QueueShared>,
}

impl RequestQueue {
    /// # Arguments
    /// * `concurrency` - Tasks allowed to run at once
    /// * `max_queue` - Waiting tasks allowed, 0 for unbounded
    pub fn new(concurrency: usize, max_queue: usize) -> Self {
        RequestQueue {
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState {
                    concurrency: concurrency.max(1),
                    max_queue,
                    running: 0,
                    waiting: BinaryHeap::new(),
                    sequence: 0,
                }),
            }),
        }
    }

    /// Wait for a running slot
    ///
    /// # Returns
    /// * `Err(CallError::QueueFull)` if the waiting list is at capacity
    /// * `Err(CallError::Cancelled)` if `cancel` fires or the queue is cleared while waiting
    pub async fn acquire(
        &self,
        priority: i32,
        cancel: Option<&CancellationToken>,
    ) -> Result<QueuePermit> {
        let rx = {
            let mut state = self.shared.state.lock();

            if state.running < state.concurrency && state.waiting.is_empty() {
                state.running += 1;
                return Ok(QueuePermit {
                    shared: Some(Arc::clone(&self.shared)),
                });
            }

            if state.max_queue > 0 && state.waiting.len() >= state.max_queue {
                return Err(CallError::QueueFull {
                    capacity: state.max_queue,
                });
            }

            let (tx, rx) = oneshot::channel();
            state.sequence += 1;
            let sequence = state.sequence;
            state.waiting.push(Waiter { priority, sequence, tx });
            debug!(
                "Task queued: priority={}, running={}, waiting={}",
                priority,
                state.running,
                state.waiting.len()
            );
            rx
        };

        let permit = match cancel {
            Some(token) => {
                let mut rx = rx;
                let received = tokio::select! {
                    permit = &mut rx => Some(permit.ok()),
                    _ = token.cancelled() => None,
                };

                match received {
                    Some(permit) => permit,
                    None => {
                        // A permit that raced in is released when rx drops
                        drop(rx);
                        self.forget_abandoned();
                        return Err(CallError::Cancelled("Cancelled while queued".to_string()));
                    }
                }
            }
            None => rx.await.ok(),
        };

        permit.ok_or_else(|| CallError::Cancelled("Request queue was cleared".to_string()))
    }

    /// Run `task` once a slot is free
    pub async fn enqueue<F, T>(
        &self,
        task: F,
        priority: i32,
        cancel: Option<&CancellationToken>,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self.acquire(priority, cancel).await?;
        task.await
    }

    /// Apply new limits, admitting waiters if concurrency grew
    pub fn update_config(&self, concurrency: usize, max_queue: usize) {
        let mut state = self.shared.state.lock();
        state.concurrency = concurrency.max(1);
        state.max_queue = max_queue;
        self.shared.dispatch(&mut state);
    }

    fn forget_abandoned(&self) {
        self.shared
            .state
            .lock()
            .waiting
            .retain(|waiter| !waiter.tx.is_closed());
    }

    pub fn running(&self) -> usize {
        self.shared.state.lock().running
    }

    pub fn waiting(&self) -> usize {
        self.shared.state.lock().waiting.len()
    }

    /// Drop every waiter; they fail with a cancellation error
    pub fn clear(&self) {
        let drained: Vec<Waiter> = self.shared.state.lock().waiting.drain().collect();
        drop(drained);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;
    use tokio::time::sleep;

    #[test]
    fn test_waiter_ordering() {
        let mut heap = BinaryHeap::new();
        for (priority, sequence) in [(0, 1), (5, 2), (0, 3), (5, 4)] {
            let (tx, _rx) = oneshot::channel();
            heap.push(Waiter { priority, sequence, tx });
        }

        let order: Vec<(i32, u64)> = std::iter::from_fn(|| heap.pop())
            .map(|waiter| (waiter.priority, waiter.sequence))
            .collect();
        assert_eq!(order, vec![(5, 2), (5, 4), (0, 1), (0, 3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit() {
        let queue = RequestQueue::new(2, 0);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let queue = queue.clone();
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue(
                        async move {
                            let now = active.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                            peak.fetch_max(now, AtomicOrdering::SeqCst);
                            sleep(Duration::from_millis(10)).await;
                            active.fetch_sub(1, AtomicOrdering::SeqCst);
                            Ok(())
                        },
                        0,
                        None,
                    )
                    .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(AtomicOrdering::SeqCst), 2);
        assert_eq!(queue.running(), 0);
    }

    #[tokio::test]
    async fn test_priority_dispatch_order() {
        let queue = RequestQueue::new(1, 0);
        let blocker = queue.acquire(0, None).await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for (name, priority) in [("low", 0), ("high", 10), ("mid", 5)] {
            let task_queue = queue.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _permit = task_queue.acquire(priority, None).await.unwrap();
                order.lock().push(name);
            }));
            while queue.waiting() < handles.len() {
                tokio::task::yield_now().await;
            }
        }

        drop(blocker);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn test_queue_full() {
        let queue = RequestQueue::new(1, 1);
        let _running = queue.acquire(0, None).await.unwrap();

        let waiting = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.acquire(0, None).await.map(|_| ()) })
        };
        while queue.waiting() < 1 {
            tokio::task::yield_now().await;
        }

        let err = queue.acquire(0, None).await.err().unwrap();
        assert!(matches!(err, CallError::QueueFull { capacity: 1 }));
        waiting.abort();
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_frees_nothing() {
        let queue = RequestQueue::new(1, 0);
        let running = queue.acquire(0, None).await.unwrap();
        let token = CancellationToken::new();

        let waiting = {
            let queue = queue.clone();
            let token = token.clone();
            tokio::spawn(async move { queue.acquire(0, Some(&token)).await.map(|_| ()) })
        };
        while queue.waiting() < 1 {
            tokio::task::yield_now().await;
        }

        token.cancel();
        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(CallError::Cancelled(_))));
        assert_eq!(queue.waiting(), 0);
        assert_eq!(queue.running(), 1);

        drop(running);
        assert_eq!(queue.running(), 0);
    }

    #[tokio::test]
    async fn test_update_config_admits_waiters() {
        let queue = RequestQueue::new(1, 0);
        let _first = queue.acquire(0, None).await.unwrap();

        let second = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let _permit = queue.acquire(0, None).await?;
                Ok::<_, CallError>(())
            })
        };
        while queue.waiting() < 1 {
            tokio::task::yield_now().await;
        }

        queue.update_config(2, 0);
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_clear_rejects_waiters() {
        let queue = RequestQueue::new(1, 0);
        let _running = queue.acquire(0, None).await.unwrap();

        let waiting = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.acquire(0, None).await.map(|_| ()) })
        };
        while queue.waiting() < 1 {
            tokio::task::yield_now().await;
        }

        queue.clear();
        assert!(matches!(waiting.await.unwrap(), Err(CallError::Cancelled(_))));
    }
}
