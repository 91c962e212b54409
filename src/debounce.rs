//! Trailing debounce keyed by call key
//!
//! Each call with a key that is already scheduled replaces the scheduled
//! producer and restarts the delay. When the delay elapses without a new
//! call, the last producer runs once and every waiter collected during the
//! window receives its outcome.

use crate::error::{CallError, Result};
use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

type Producer = Box<dyn FnOnce() -> BoxFuture<'static, Result<Value>> + Send>;
type Waiter = oneshot::Sender<Result<Value>>;

struct DebounceItem {
    generation: u64,
    producer: Producer,
    waiters: Vec<Waiter>,
    timer: Option<JoinHandle<()>>,
    created_at: Instant,
}

impl DebounceItem {
    fn reject(self, error: CallError) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        for waiter in self.waiters {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}

struct DebounceInner {
    items: Mutex<HashMap<String, DebounceItem>>,
    max_items: AtomicUsize,
    next_generation: AtomicU64,
    superseded: AtomicU64,
}

impl DebounceInner {
    fn take_item(&self, key: &str) -> Option<DebounceItem> {
        let mut item = self.items.lock().remove(key)?;
        if let Some(timer) = item.timer.take() {
            timer.abort();
        }
        Some(item)
    }

    async fn fire(&self, key: &str, generation: u64) {
        let item = {
            let mut items = self.items.lock();
            // A newer call rescheduled this key
            if items.get(key).map(|item| item.generation) != Some(generation) {
                return;
            }
            items.remove(key)
        };

        if let Some(item) = item {
            run_item(key, item).await;
        }
    }
}

async fn run_item(key: &str, item: DebounceItem) {
    debug!("Debounce firing: key={}, waiters={}", key, item.waiters.len());
    let result = (item.producer)().await;
    for waiter in item.waiters {
        let _ = waiter.send(result.clone());
    }
}

/// Trailing debouncer with flush and cancel
pub struct DebounceManager {
    inner: Arc<DebounceInner>,
}

impl DebounceManager {
    /// # Arguments
    /// * `max_items` - Scheduled keys at which the oldest 20% are rejected
    pub fn new(max_items: usize) -> Self {
        DebounceManager {
            inner: Arc::new(DebounceInner {
                items: Mutex::new(HashMap::new()),
                max_items: AtomicUsize::new(max_items.max(1)),
                next_generation: AtomicU64::new(0),
                superseded: AtomicU64::new(0),
            }),
        }
    }

    pub fn set_max_items(&self, max_items: usize) {
        self.inner.max_items.store(max_items.max(1), Ordering::Relaxed);
    }

    /// Schedule `producer` under `key`, replacing any producer already scheduled
    ///
    /// Resolves with the outcome of whichever producer finally runs for the key.
    pub async fn execute<F, Fut>(&self, key: &str, producer: F, delay: Duration) -> Result<Value>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let producer: Producer = Box::new(move || producer().boxed());

        let evicted = {
            let mut items = self.inner.items.lock();
            let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);

            let evicted = if !items.contains_key(key)
                && items.len() >= self.inner.max_items.load(Ordering::Relaxed)
            {
                evict_oldest(&mut items)
            } else {
                Vec::new()
            };

            let timer = spawn_timer(
                Arc::downgrade(&self.inner),
                key.to_string(),
                generation,
                delay,
            );

            match items.get_mut(key) {
                Some(item) => {
                    if let Some(previous) = item.timer.replace(timer) {
                        previous.abort();
                    }
                    item.generation = generation;
                    item.producer = producer;
                    item.waiters.push(tx);
                    self.inner.superseded.fetch_add(1, Ordering::Relaxed);
                    debug!("Debounce rescheduled: key={}, waiters={}", key, item.waiters.len());
                }
                None => {
                    items.insert(
                        key.to_string(),
                        DebounceItem {
                            generation,
                            producer,
                            waiters: vec![tx],
                            timer: Some(timer),
                            created_at: Instant::now(),
                        },
                    );
                }
            }

            evicted
        };

        if !evicted.is_empty() {
            warn!("Debounce table full, cancelling {} oldest keys", evicted.len());
            for item in evicted {
                item.reject(CallError::Cancelled(
                    "Debounced call evicted under memory pressure".to_string(),
                ));
            }
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(CallError::Cancelled("Debounced call was dropped".to_string())),
        }
    }

    /// Run the scheduled producer for `key` now
    pub async fn flush(&self, key: &str) -> bool {
        match self.inner.take_item(key) {
            Some(item) => {
                run_item(key, item).await;
                true
            }
            None => false,
        }
    }

    /// Run every scheduled producer now, returning how many ran
    pub async fn flush_all(&self) -> usize {
        let drained: Vec<(String, DebounceItem)> = {
            let mut items = self.inner.items.lock();
            items.drain().collect()
        };

        let count = drained.len();
        let runs = drained.into_iter().map(|(key, mut item)| {
            if let Some(timer) = item.timer.take() {
                timer.abort();
            }
            async move { run_item(&key, item).await }
        });
        join_all(runs).await;
        count
    }

    /// Drop the scheduled producer for `key`, rejecting its waiters
    pub fn cancel(&self, key: &str) -> bool {
        match self.inner.take_item(key) {
            Some(item) => {
                item.reject(CallError::Cancelled(format!("Debounced call '{}' cancelled", key)));
                true
            }
            None => false,
        }
    }

    /// Reject items first scheduled more than `max_age` ago
    pub fn cleanup_stale(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<DebounceItem> = {
            let mut items = self.inner.items.lock();
            let keys: Vec<String> = items
                .iter()
                .filter(|(_, item)| now.duration_since(item.created_at) > max_age)
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| items.remove(key)).collect()
        };

        let count = stale.len();
        for item in stale {
            item.reject(CallError::Timeout("Debounced call went stale".to_string()));
        }
        if count > 0 {
            debug!("Rejected {} stale debounced calls", count);
        }
        count
    }

    /// Abort every timer and reject every waiter with `error`
    pub fn clear(&self, error: CallError) {
        let drained: Vec<DebounceItem> = self
            .inner
            .items
            .lock()
            .drain()
            .map(|(_, item)| item)
            .collect();
        for item in drained {
            item.reject(error.clone());
        }
    }

    /// Calls that replaced an already scheduled producer
    pub fn superseded(&self) -> u64 {
        self.inner.superseded.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DebounceManager {
    fn default() -> Self {
        Self::new(1000)
    }
}

fn spawn_timer(
    inner: Weak<DebounceInner>,
    key: String,
    generation: u64,
    delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        sleep(delay).await;
        if let Some(inner) = inner.upgrade() {
            inner.fire(&key, generation).await;
        }
    })
}

fn evict_oldest(items: &mut HashMap<String, DebounceItem>) -> Vec<DebounceItem> {
    let count = (items.len() / 5).max(1);
    let mut by_age: Vec<(String, Instant)> = items
        .iter()
        .map(|(key, item)| (key.clone(), item.created_at))
        .collect();
    by_age.sort_by_key(|(_, created_at)| *created_at);

    by_age
        .into_iter()
        .take(count)
        .filter_map(|(key, _)| items.remove(&key))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn spawn_call(
        manager: &Arc<DebounceManager>,
        key: &'static str,
        value: i64,
        runs: &Arc<AtomicU32>,
    ) -> JoinHandle<Result<Value>> {
        let manager = Arc::clone(manager);
        let runs = Arc::clone(runs);
        tokio::spawn(async move {
            manager
                .execute(
                    key,
                    move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(json!(value))
                    },
                    Duration::from_millis(300),
                )
                .await
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_call_wins() {
        let manager = Arc::new(DebounceManager::new(100));
        let runs = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for value in 1..=3 {
            handles.push(spawn_call(&manager, "search", value, &runs));
            tokio::time::advance(Duration::from_millis(100)).await;
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), json!(3));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(manager.superseded(), 2);
        assert!(manager.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_keys_fire_independently() {
        let manager = Arc::new(DebounceManager::new(100));
        let runs = Arc::new(AtomicU32::new(0));

        let a = spawn_call(&manager, "a", 1, &runs);
        let b = spawn_call(&manager, "b", 2, &runs);

        assert_eq!(a.await.unwrap().unwrap(), json!(1));
        assert_eq!(b.await.unwrap().unwrap(), json!(2));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_runs_immediately() {
        let manager = Arc::new(DebounceManager::new(100));
        let runs = Arc::new(AtomicU32::new(0));

        let handle = spawn_call(&manager, "k", 7, &runs);
        tokio::task::yield_now().await;

        let started = Instant::now();
        assert_eq!(manager.flush_all().await, 1);
        assert_eq!(handle.await.unwrap().unwrap(), json!(7));
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(!manager.flush("k").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_rejects_waiters() {
        let manager = Arc::new(DebounceManager::new(100));
        let runs = Arc::new(AtomicU32::new(0));

        let handle = spawn_call(&manager, "k", 1, &runs);
        tokio::task::yield_now().await;

        assert!(manager.cancel("k"));
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(CallError::Cancelled(_))));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_cancels_oldest() {
        let manager = Arc::new(DebounceManager::new(2));
        let runs = Arc::new(AtomicU32::new(0));

        let first = spawn_call(&manager, "a", 1, &runs);
        tokio::time::advance(Duration::from_millis(1)).await;
        let second = spawn_call(&manager, "b", 2, &runs);
        tokio::time::advance(Duration::from_millis(1)).await;
        let third = spawn_call(&manager, "c", 3, &runs);

        assert!(matches!(first.await.unwrap(), Err(CallError::Cancelled(_))));
        assert_eq!(second.await.unwrap().unwrap(), json!(2));
        assert_eq!(third.await.unwrap().unwrap(), json!(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_stale_times_out() {
        let manager = Arc::new(DebounceManager::new(100));
        let manager_for_call = Arc::clone(&manager);
        let handle = tokio::spawn(async move {
            manager_for_call
                .execute("k", || async { Ok(json!(1)) }, Duration::from_secs(120))
                .await
        });
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(manager.cleanup_stale(Duration::from_secs(60)), 1);
        assert!(matches!(handle.await.unwrap(), Err(CallError::Timeout(_))));
    }
}
