//! In-flight call deduplication
//!
//! Callers presenting the same key while an execution is pending join it
//! instead of starting a new one. The execution is a `Shared` future, so
//! every joiner observes the same value or the same error.
//!
//! Each caller may bring its own cancellation token. Cancelling it detaches
//! only that caller. The execution itself is cancelled once its last
//! attached caller is gone.

use crate::error::{CallError, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type SharedCall = Shared<BoxFuture<'static, Result<Value>>>;
type PendingTable = Mutex<HashMap<String, PendingCall>>;

struct PendingCall {
    id: u64,
    shared: SharedCall,
    ref_count: usize,
    created_at: Instant,
    execution: Arc<Execution>,
}

/// Callers still waiting on one execution, and the token that stops it
struct Execution {
    attached: AtomicUsize,
    cancel: CancellationToken,
}

/// One caller's attachment; detaches on drop
struct Attachment<'a> {
    table: &'a PendingTable,
    key: &'a str,
    id: u64,
    execution: Arc<Execution>,
}

impl Drop for Attachment<'_> {
    fn drop(&mut self) {
        let abandoned = {
            let mut pending = self.table.lock();
            if self.execution.attached.fetch_sub(1, Ordering::AcqRel) != 1 {
                return;
            }
            if pending.get(self.key).map(|call| call.id) == Some(self.id) {
                pending.remove(self.key)
            } else {
                None
            }
        };

        // No caller is left to observe the outcome
        self.execution.cancel.cancel();
        if abandoned.is_some() {
            debug!("Every caller detached, dropped pending call: key={}", self.key);
        }
    }
}

/// Coalesces concurrent identical calls onto one execution
pub struct DedupManager {
    pending: Arc<PendingTable>,
    max_pending: AtomicUsize,
    next_id: AtomicU64,
    joined: AtomicU64,
}

impl DedupManager {
    /// # Arguments
    /// * `max_pending` - Table size at which the oldest 20% are dropped
    pub fn new(max_pending: usize) -> Self {
        DedupManager {
            pending: Arc::new(Mutex::new(HashMap::new())),
            max_pending: AtomicUsize::new(max_pending.max(1)),
            next_id: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }

    pub fn set_max_pending(&self, max_pending: usize) {
        self.max_pending.store(max_pending.max(1), Ordering::Relaxed);
    }

    /// Run `producer` for `key`, or join the execution already pending
    ///
    /// The producer is only invoked when no execution is pending.
    pub async fn execute<F, Fut>(&self, key: &str, producer: F) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.execute_cancellable(key, None, move |_| producer()).await
    }

    /// Like [`execute`](Self::execute), with a per-caller cancellation token
    ///
    /// A cancelled caller returns [`CallError::Cancelled`] at once while the
    /// others keep waiting. The producer receives the execution's own token,
    /// which fires when every attached caller has cancelled or gone away.
    pub async fn execute_cancellable<F, Fut>(
        &self,
        key: &str,
        cancel: Option<&CancellationToken>,
        producer: F,
    ) -> Result<Value>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let (id, shared, execution) = {
            let mut pending = self.pending.lock();

            if let Some(call) = pending.get_mut(key) {
                call.ref_count += 1;
                call.execution.attached.fetch_add(1, Ordering::AcqRel);
                self.joined.fetch_add(1, Ordering::Relaxed);
                debug!("Joined pending call: key={}, waiters={}", key, call.ref_count);
                (call.id, call.shared.clone(), Arc::clone(&call.execution))
            } else {
                let max_pending = self.max_pending.load(Ordering::Relaxed);
                if pending.len() >= max_pending {
                    evict_oldest(&mut pending);
                }

                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let execution = Arc::new(Execution {
                    attached: AtomicUsize::new(1),
                    cancel: CancellationToken::new(),
                });
                let table = Arc::clone(&self.pending);
                let owned_key = key.to_string();
                let run = producer(execution.cancel.clone());

                let shared = async move {
                    let result = run.await;
                    let mut pending = table.lock();
                    // The slot may already belong to a newer execution
                    if pending.get(&owned_key).map(|call| call.id) == Some(id) {
                        pending.remove(&owned_key);
                    }
                    result
                }
                .boxed()
                .shared();

                pending.insert(
                    key.to_string(),
                    PendingCall {
                        id,
                        shared: shared.clone(),
                        ref_count: 1,
                        created_at: Instant::now(),
                        execution: Arc::clone(&execution),
                    },
                );
                (id, shared, execution)
            }
        };

        let _attachment = Attachment {
            table: &self.pending,
            key,
            id,
            execution,
        };

        match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(CallError::Cancelled(
                        "Call cancelled while waiting on a shared execution".to_string(),
                    )),
                    result = shared => result,
                }
            }
            None => shared.await,
        }
    }

    /// Callers that attached to the pending execution of `key`
    pub fn ref_count(&self, key: &str) -> Option<usize> {
        self.pending.lock().get(key).map(|call| call.ref_count)
    }

    /// Drop entries older than `max_age`
    ///
    /// Their executions keep running for the callers already attached.
    pub fn cleanup_stale(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, call| now.duration_since(call.created_at) <= max_age);
        let removed = before - pending.len();
        if removed > 0 {
            debug!("Removed {} stale pending calls", removed);
        }
        removed
    }

    /// Total calls that joined an existing execution
    pub fn joined(&self) -> u64 {
        self.joined.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.pending.lock().clear();
    }
}

impl Default for DedupManager {
    fn default() -> Self {
        Self::new(1000)
    }
}

fn evict_oldest(pending: &mut HashMap<String, PendingCall>) {
    let count = (pending.len() / 5).max(1);
    let mut by_age: Vec<(String, Instant)> = pending
        .iter()
        .map(|(key, call)| (key.clone(), call.created_at))
        .collect();
    by_age.sort_by_key(|(_, created_at)| *created_at);

    for (key, _) in by_age.into_iter().take(count) {
        pending.remove(&key);
    }
    debug!("Pending call table full, dropped {} oldest entries", count);
}
