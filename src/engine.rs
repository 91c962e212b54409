//! The orchestrator: method registry and the per-call pipeline
//!
//! # Call flow
//! ```text
//! resolve method → cache check ─hit─→ success callbacks → done
//!                      │miss
//!                      ▼
//!                resolve middleware
//!                      │
//!                      ▼
//!        dedup ▸ debounce ▸ circuit check ─open─→ rejection shared by attached callers
//!                      │
//!                      ▼
//!        retry loop ▸ attempt (request mw → queue → send → response mw → transform → validate)
//!                      │
//!                      ▼
//!        cache write + circuit feedback (once per execution) → callbacks (once per caller)
//! ```

use crate::cache::{CacheManager, CacheStats, CacheStorage, MemoryStorage};
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::{ConfigChanges, OrchestratorConfig};
use crate::debounce::DebounceManager;
use crate::dedup::DedupManager;
use crate::error::{CallError, ErrorKind, Result};
use crate::keys::{generate_key, method_prefix};
use crate::method::{CallOptions, MethodConfig};
use crate::metrics::{MetricsSnapshot, OrchestratorMetrics};
use crate::middleware::{CallContext, MiddlewarePipeline, MiddlewareSet};
use crate::models::{RequestConfig, Response};
use crate::queue::RequestQueue;
use crate::retry::RetryPolicy;
use crate::transport::Transport;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Plugin hooks run on install and on `destroy`
pub trait Extension: Send + Sync {
    fn name(&self) -> &str;

    /// Called once when installed; may register methods or middleware
    fn install(&self, orchestrator: &Orchestrator) -> Result<()>;

    fn uninstall(&self) {}
}

/// One entry of a [`Orchestrator::call_batch`]
#[derive(Debug, Clone)]
pub struct BatchCall {
    pub method: String,
    pub params: Value,
    pub options: CallOptions,
}

impl BatchCall {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        BatchCall {
            method: method.into(),
            params,
            options: CallOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }
}

struct Inner {
    config: RwLock<OrchestratorConfig>,
    transport: Arc<dyn Transport>,
    methods: RwLock<HashMap<String, Arc<MethodConfig>>>,
    global_middlewares: RwLock<MiddlewareSet>,
    pipeline: MiddlewarePipeline,
    cache: CacheManager,
    dedup: DedupManager,
    debounce: DebounceManager,
    breaker: CircuitBreaker,
    queue: RequestQueue,
    metrics: OrchestratorMetrics,
    extensions: Mutex<Vec<Arc<dyn Extension>>>,
    destroyed: AtomicBool,
    shutdown: watch::Sender<bool>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn run_maintenance(&self) {
        let maintenance = self.config.read().maintenance.clone();

        let expired = self.cache.purge_expired();
        let pending = self
            .dedup
            .cleanup_stale(Duration::from_millis(maintenance.pending_stale_ms));
        let debounced = self
            .debounce
            .cleanup_stale(Duration::from_millis(maintenance.debounce_stale_ms));
        let circuits = self
            .breaker
            .cleanup_idle(Duration::from_millis(maintenance.circuit_idle_ms));

        if expired + pending + debounced + circuits > 0 {
            debug!(
                "Maintenance sweep: expired={}, stale_pending={}, stale_debounced={}, \
                 idle_circuits={}",
                expired, pending, debounced, circuits
            );
        }
    }
}

/// Client-side request orchestrator
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

/// Non-owning reference to an [`Orchestrator`], carried by [`CallContext`]
#[derive(Clone, Default)]
pub struct OrchestratorHandle {
    inner: Weak<Inner>,
}

impl OrchestratorHandle {
    pub fn upgrade(&self) -> Option<Orchestrator> {
        self.inner.upgrade().map(|inner| Orchestrator { inner })
    }
}

impl PartialEq for OrchestratorHandle {
    fn eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for OrchestratorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorHandle")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl Orchestrator {
    /// Create an orchestrator with the in-memory cache
    ///
    /// Starts the background sweep when called inside a tokio runtime.
    pub fn new(config: OrchestratorConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::with_storage(config, transport, Arc::new(MemoryStorage::new()))
    }

    /// Create an orchestrator over a custom cache backend
    pub fn with_storage(
        config: OrchestratorConfig,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn CacheStorage>,
    ) -> Result<Self> {
        config.validate()?;

        let maintenance = &config.maintenance;
        let cache = CacheManager::with_storage(storage, config.cache.ttl(), config.cache.max_size)
            .with_stats_refresh(Duration::from_millis(maintenance.stats_refresh_ms));
        let dedup = DedupManager::new(maintenance.max_pending_calls);
        let debounce = DebounceManager::new(maintenance.max_debounced_calls);
        let queue = RequestQueue::new(config.queue.concurrency, config.queue.max_queue);
        let cleanup_interval = maintenance.cleanup_interval();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(Inner {
            config: RwLock::new(config),
            transport,
            methods: RwLock::new(HashMap::new()),
            global_middlewares: RwLock::new(MiddlewareSet::default()),
            pipeline: MiddlewarePipeline::new(),
            cache,
            dedup,
            debounce,
            breaker: CircuitBreaker::new(),
            queue,
            metrics: OrchestratorMetrics::new(),
            extensions: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
            shutdown,
            maintenance: Mutex::new(None),
        });

        let handle = spawn_maintenance(Arc::downgrade(&inner), cleanup_interval, shutdown_rx);
        *inner.maintenance.lock() = handle;

        info!("Orchestrator created");
        Ok(Orchestrator { inner })
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            Err(CallError::Destroyed)
        } else {
            Ok(())
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// A handle that does not keep the orchestrator alive
    pub fn downgrade(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Register `name`, replacing any previous configuration
    pub fn register(&self, name: impl Into<String>, config: MethodConfig) -> Result<()> {
        self.ensure_alive()?;
        let name = name.into();
        config.validate_overrides(&self.inner.config.read())?;
        let replaced = self
            .inner
            .methods
            .write()
            .insert(name.clone(), Arc::new(config))
            .is_some();
        self.inner.pipeline.invalidate(&name);

        if replaced {
            info!("Re-registered method: {}", name);
        } else {
            debug!("Registered method: {}", name);
        }
        Ok(())
    }

    pub fn register_batch<I, S>(&self, methods: I) -> Result<()>
    where
        I: IntoIterator<Item = (S, MethodConfig)>,
        S: Into<String>,
    {
        for (name, config) in methods {
            self.register(name, config)?;
        }
        Ok(())
    }

    /// Remove `name`; returns whether it was registered
    pub fn unregister(&self, name: &str) -> Result<bool> {
        self.ensure_alive()?;
        let removed = self.inner.methods.write().remove(name).is_some();
        self.inner.pipeline.invalidate(name);
        if removed {
            debug!("Unregistered method: {}", name);
        }
        Ok(removed)
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.inner.methods.read().contains_key(name)
    }

    /// Append middleware to the global chains
    pub fn use_middleware(&self, middlewares: MiddlewareSet) -> Result<()> {
        self.ensure_alive()?;
        let mut global = self.inner.global_middlewares.write();
        global.extend(&middlewares);
        self.inner.pipeline.clear();
        Ok(())
    }

    /// Install an extension and keep it for uninstall on `destroy`
    pub fn install(&self, extension: Arc<dyn Extension>) -> Result<()> {
        self.ensure_alive()?;
        extension.install(self)?;
        info!("Installed extension: {}", extension.name());
        self.inner.extensions.lock().push(extension);
        Ok(())
    }

    /// Invoke a registered method
    pub async fn call(&self, name: &str, params: Value, options: CallOptions) -> Result<Value> {
        self.ensure_alive()?;
        let started = Instant::now();
        let result = self.execute_call(name, params, options).await;
        self.inner.metrics.record_call(result.is_ok(), started.elapsed());
        result
    }

    /// Invoke a registered method and deserialize its data into `T`
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        name: &str,
        params: Value,
        options: CallOptions,
    ) -> Result<T> {
        let value = self.call(name, params.clone(), options).await?;
        serde_json::from_value(value)
            .map_err(|e| CallError::from(e).with_context(name, &params))
    }

    /// Run calls concurrently; results keep the input order
    pub async fn call_batch(&self, calls: Vec<BatchCall>) -> Vec<Result<Value>> {
        let calls = calls
            .into_iter()
            .map(|call| async move {
                self.call(&call.method, call.params, call.options).await
            });
        join_all(calls).await
    }

    async fn execute_call(&self, name: &str, params: Value, options: CallOptions) -> Result<Value> {
        let inner = &self.inner;

        let method = match inner.methods.read().get(name).cloned() {
            Some(method) => method,
            None => {
                return Err(CallError::MethodNotFound(name.to_string()).with_context(name, &params));
            }
        };
        let global = inner.config.read().clone();
        let ctx = CallContext::new(name, params.clone()).with_engine(self.downgrade());

        // Cache check
        let cache_config = method.cache.clone().unwrap_or(global.cache);
        let cache_key = generate_key(name, &params);
        if cache_config.enabled && !options.skip_cache {
            if let Some(value) = inner.cache.get(&cache_key) {
                inner.metrics.record_cache_hit();
                notify_success(&method, &options, &value, &ctx);
                return Ok(value);
            }
            inner.metrics.record_cache_miss();
        }

        let middlewares = {
            let global_middlewares = inner.global_middlewares.read();
            inner.pipeline.resolve(
                name,
                &global_middlewares,
                &method,
                options.middlewares.as_ref(),
            )
        };

        let retry = options
            .retry
            .clone()
            .or_else(|| method.retry.clone())
            .unwrap_or(global.retry);

        let dedup = method.deduplication.clone().unwrap_or(global.deduplication);
        let debounce = method.debounce.clone().unwrap_or(global.debounce);
        let key = dedup
            .key_generator
            .as_ref()
            .map(|generator| generator.generate(name, &params))
            .unwrap_or_else(|| cache_key.clone());

        let mut unit = CallUnit {
            orchestrator: self.clone(),
            name: name.to_string(),
            params: params.clone(),
            method: Arc::clone(&method),
            middlewares,
            retry: RetryPolicy::new(retry),
            queue: options
                .queue
                .or(method.queue)
                .unwrap_or(global.queue.enabled),
            priority: options.priority,
            timeout: options.timeout,
            cancel: None,
            cache_write: cache_config
                .enabled
                .then(|| (cache_key, options.cache_ttl.unwrap_or(cache_config.ttl()))),
        };

        // Coalesced callers share one execution; each caller's own token
        // only detaches that caller
        let use_debounce = debounce.enabled && !options.skip_debounce;
        let delay = debounce.delay();
        let result = if dedup.enabled && !options.skip_dedup {
            if inner.dedup.ref_count(&key).is_some() {
                inner.metrics.record_dedup_join();
            }
            let orchestrator = self.clone();
            let debounce_key = key.clone();
            inner
                .dedup
                .execute_cancellable(&key, options.cancel.as_ref(), move |execution| {
                    unit.cancel = Some(execution);
                    async move {
                        if use_debounce {
                            orchestrator.inner.metrics.record_debounced();
                            orchestrator
                                .inner
                                .debounce
                                .execute(&debounce_key, move || unit.run(), delay)
                                .await
                        } else {
                            unit.run().await
                        }
                    }
                })
                .await
        } else if use_debounce {
            inner.metrics.record_debounced();
            let debounced = inner.debounce.execute(&key, move || unit.run(), delay);
            unless_cancelled(options.cancel.as_ref(), debounced).await
        } else {
            unit.cancel = options.cancel.clone();
            unit.run().await
        };

        match result {
            Ok(value) => {
                notify_success(&method, &options, &value, &ctx);
                Ok(value)
            }
            Err(err) => {
                let err = err.with_context(name, &params);
                debug!("Call failed: {}", err);
                notify_error(&method, &options, &err, &ctx);
                Err(err)
            }
        }
    }

    /// Clear the whole cache, or only the entries of one method
    pub fn clear_cache(&self, name: Option<&str>) -> Result<()> {
        self.ensure_alive()?;
        match name {
            Some(name) => {
                let removed = self.inner.cache.clear_by_prefix(&method_prefix(name));
                debug!("Cleared {} cache entries for method {}", removed, name);
            }
            None => self.inner.cache.clear(),
        }
        Ok(())
    }

    pub fn get_cache_stats(&self) -> Result<CacheStats> {
        self.ensure_alive()?;
        Ok(self.inner.cache.get_stats())
    }

    /// Run every pending debounced call now
    pub async fn flush_debounced(&self) -> Result<usize> {
        self.ensure_alive()?;
        Ok(self.inner.debounce.flush_all().await)
    }

    pub fn circuit_state(&self, name: &str) -> Result<CircuitState> {
        self.ensure_alive()?;
        Ok(self.inner.breaker.state(name))
    }

    /// Close the circuit of `name`, forgetting its history
    pub fn reset_circuit(&self, name: &str) -> Result<bool> {
        self.ensure_alive()?;
        Ok(self.inner.breaker.reset(name))
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.get_stats()
    }

    pub fn config(&self) -> OrchestratorConfig {
        self.inner.config.read().clone()
    }

    /// Apply a new configuration to the running orchestrator
    ///
    /// Cache limits, queue limits and table bounds take effect immediately.
    /// The sweep interval keeps its original value.
    pub fn reconfigure(&self, new_config: &OrchestratorConfig) -> Result<ConfigChanges> {
        self.ensure_alive()?;
        let (changes, config) = {
            let mut config = self.inner.config.write();
            let changes = config.update_from(new_config)?;
            (changes, config.clone())
        };

        if changes.cache_changed {
            self.inner
                .cache
                .update_limits(config.cache.ttl(), config.cache.max_size);
        }
        if changes.queue_changed {
            self.inner
                .queue
                .update_config(config.queue.concurrency, config.queue.max_queue);
        }
        if changes.maintenance_changed {
            self.inner.dedup.set_max_pending(config.maintenance.max_pending_calls);
            self.inner
                .debounce
                .set_max_items(config.maintenance.max_debounced_calls);
        }

        if changes.has_changes() {
            info!("Orchestrator reconfigured: {}", changes.summary().join(", "));
        }
        Ok(changes)
    }

    /// Stop timers, drop all state and uninstall extensions
    ///
    /// Idempotent. Every later operation fails with [`CallError::Destroyed`].
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        let _ = self.inner.shutdown.send(true);
        if let Some(handle) = self.inner.maintenance.lock().take() {
            handle.abort();
        }

        self.inner.debounce.clear(CallError::Destroyed);
        self.inner.dedup.clear();
        self.inner.queue.clear();
        self.inner.cache.clear();
        self.inner.breaker.clear();
        self.inner.pipeline.clear();
        self.inner.methods.write().clear();

        let extensions: Vec<Arc<dyn Extension>> = self.inner.extensions.lock().drain(..).collect();
        for extension in extensions.iter().rev() {
            debug!("Uninstalling extension: {}", extension.name());
            extension.uninstall();
        }

        info!("Orchestrator destroyed");
    }
}

/// Wait for a shared outcome unless the caller's own token fires first
async fn unless_cancelled<F>(cancel: Option<&CancellationToken>, outcome: F) -> Result<Value>
where
    F: Future<Output = Result<Value>>,
{
    match cancel {
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(CallError::Cancelled(
                    "Call cancelled while waiting on a debounced execution".to_string(),
                )),
                result = outcome => result,
            }
        }
        None => outcome.await,
    }
}

fn notify_success(method: &MethodConfig, options: &CallOptions, value: &Value, ctx: &CallContext) {
    if let Some(callback) = &method.on_success {
        callback(value, ctx);
    }
    if let Some(callback) = &options.on_success {
        callback(value, ctx);
    }
}

fn notify_error(
    method: &MethodConfig,
    options: &CallOptions,
    error: &CallError,
    ctx: &CallContext,
) {
    if let Some(callback) = &method.on_error {
        callback(error, ctx);
    }
    if let Some(callback) = &options.on_error {
        callback(error, ctx);
    }
}

/// Failures that count against a method's circuit
fn is_circuit_failure(error: &CallError) -> bool {
    matches!(
        error.kind(),
        ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Http | ErrorKind::Unknown
    )
}

fn spawn_maintenance(
    inner: Weak<Inner>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    let handle = Handle::try_current().ok()?;

    Some(handle.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(inner) = inner.upgrade() else {
                        break;
                    };
                    inner.run_maintenance();
                }
                _ = shutdown.changed() => break,
            }
        }
    }))
}

/// Everything one execution needs, detached from the caller
struct CallUnit {
    orchestrator: Orchestrator,
    name: String,
    params: Value,
    method: Arc<MethodConfig>,
    middlewares: Arc<MiddlewareSet>,
    retry: RetryPolicy,
    queue: bool,
    priority: i32,
    timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
    cache_write: Option<(String, Duration)>,
}

impl CallUnit {
    async fn run(self) -> Result<Value> {
        let inner = &self.orchestrator.inner;
        let breaker_config = &self.retry.config().circuit_breaker;

        // Gated once per execution, so every attached caller shares the decision
        if let Err(err) = inner.breaker.check(&self.name, breaker_config) {
            warn!("Call rejected by open circuit: method={}", self.name);
            inner.metrics.record_circuit_rejection();
            return Err(err);
        }

        let outcome = self
            .retry
            .execute(
                |attempt| self.attempt(attempt),
                |error, attempt| {
                    let ctx = self.context(attempt);
                    self.middlewares.recover(error, &ctx).map(|response| response.data)
                },
            )
            .await;

        match outcome {
            Ok(outcome) if outcome.recovered => {
                inner.metrics.record_recovery();
                inner.breaker.release_trial(&self.name);
                Ok(outcome.value)
            }
            Ok(outcome) => {
                inner.breaker.record_success(&self.name, breaker_config);
                if let Some((key, ttl)) = &self.cache_write {
                    if !self.orchestrator.is_destroyed() {
                        inner.cache.set(key, outcome.value.clone(), Some(*ttl));
                    }
                }
                Ok(outcome.value)
            }
            Err(err) => {
                if is_circuit_failure(&err) {
                    inner.breaker.record_failure(&self.name, breaker_config);
                } else {
                    inner.breaker.release_trial(&self.name);
                }
                Err(err)
            }
        }
    }

    fn context(&self, attempt: u32) -> CallContext {
        CallContext::new(self.name.clone(), self.params.clone())
            .with_attempt(attempt)
            .with_engine(self.orchestrator.downgrade())
    }

    async fn attempt(&self, attempt: u32) -> Result<Value> {
        self.orchestrator.ensure_alive()?;
        if self.cancel.as_ref().map_or(false, |token| token.is_cancelled()) {
            return Err(CallError::Cancelled("Call cancelled".to_string()));
        }

        let inner = &self.orchestrator.inner;
        if attempt > 0 {
            inner.metrics.record_retries(1);
        }

        let ctx = self.context(attempt);
        let request = self.method.request.build(&self.params)?;
        let mut request = self.middlewares.apply_request(request, &ctx)?;
        if let Some(timeout) = self.timeout {
            request.timeout = Some(timeout);
        }

        let response = if self.queue {
            inner
                .queue
                .enqueue(self.send(request.clone()), self.priority, self.cancel.as_ref())
                .await?
        } else {
            self.send(request.clone()).await?
        };

        let response = self.middlewares.apply_response(response, &request, &ctx)?;
        let data = match &self.method.transform {
            Some(transform) => transform(response.data, &self.params)?,
            None => response.data,
        };

        if let Some(validate) = &self.method.validate {
            if !validate(&data) {
                return Err(CallError::Validation(format!(
                    "Response data for '{}' failed validation",
                    self.name
                )));
            }
        }

        Ok(data)
    }

    async fn send(&self, request: RequestConfig) -> Result<Response> {
        let inner = &self.orchestrator.inner;
        inner.metrics.record_transport_send();

        let timeout = request.timeout;
        let send = async {
            match timeout {
                Some(timeout) => {
                    match tokio::time::timeout(timeout, inner.transport.send(request)).await {
                        Ok(result) => result.map_err(CallError::from),
                        Err(_) => {
                            Err(CallError::Timeout(format!("No response within {:?}", timeout)))
                        }
                    }
                }
                None => inner.transport.send(request).await.map_err(CallError::from),
            }
        };

        match &self.cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(CallError::Cancelled(
                        "Call cancelled during send".to_string(),
                    )),
                    result = send => result,
                }
            }
            None => send.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::transport::{FnTransport, TransportError};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn echo_orchestrator(config: OrchestratorConfig) -> (Orchestrator, Arc<AtomicU32>) {
        let sends = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&sends);
        let transport = FnTransport::new(move |request: RequestConfig| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                Ok::<_, TransportError>(Response::ok(json!({
                    "url": request.url,
                    "query": request.query,
                })))
            }
        });
        (Orchestrator::new(config, Arc::new(transport)).unwrap(), sends)
    }

    #[tokio::test]
    async fn test_call_registered_method() {
        let (orchestrator, sends) = echo_orchestrator(OrchestratorConfig::default());
        orchestrator
            .register("getUser", MethodConfig::new(RequestConfig::get("/users")))
            .unwrap();

        let value = orchestrator
            .call("getUser", json!({"id": 1}), CallOptions::default())
            .await
            .unwrap();

        assert_eq!(value["url"], "/users");
        assert_eq!(value["query"]["id"], "1");
        assert_eq!(sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (orchestrator, sends) = echo_orchestrator(OrchestratorConfig::default());
        let err = orchestrator
            .call("missing", json!(null), CallOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::MethodNotFound);
        assert_eq!(err.context().unwrap().method, "missing");
        assert_eq!(sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transform_and_validate() {
        let (orchestrator, _) = echo_orchestrator(OrchestratorConfig::default());
        orchestrator
            .register(
                "url",
                MethodConfig::new(RequestConfig::get("/a"))
                    .with_transform(|data, _params| Ok(data["url"].clone())),
            )
            .unwrap();
        orchestrator
            .register(
                "strict",
                MethodConfig::new(RequestConfig::get("/b")).with_validate(|data| data.is_string()),
            )
            .unwrap();

        let value = orchestrator.call("url", json!(null), CallOptions::default()).await.unwrap();
        assert_eq!(value, json!("/a"));

        let err = orchestrator
            .call("strict", json!(null), CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_method_cache_override() {
        let (orchestrator, sends) = echo_orchestrator(OrchestratorConfig::default());
        orchestrator
            .register(
                "cached",
                MethodConfig::new(RequestConfig::get("/c"))
                    .with_cache(CacheConfig::with_ttl(Duration::from_secs(60))),
            )
            .unwrap();

        for _ in 0..3 {
            orchestrator.call("cached", json!({"q": 1}), CallOptions::default()).await.unwrap();
        }
        assert_eq!(sends.load(Ordering::SeqCst), 1);

        orchestrator.clear_cache(Some("cached")).unwrap();
        orchestrator.call("cached", json!({"q": 1}), CallOptions::default()).await.unwrap();
        assert_eq!(sends.load(Ordering::SeqCst), 2);

        let metrics = orchestrator.metrics();
        assert_eq!(metrics.cache_hits, 2);
        assert_eq!(metrics.total_calls, 4);
    }

    #[tokio::test]
    async fn test_unregister() {
        let (orchestrator, _) = echo_orchestrator(OrchestratorConfig::default());
        orchestrator
            .register("m", MethodConfig::new(RequestConfig::get("/m")))
            .unwrap();

        assert!(orchestrator.unregister("m").unwrap());
        assert!(!orchestrator.unregister("m").unwrap());
        assert!(!orchestrator.has_method("m"));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (orchestrator, sends) = echo_orchestrator(OrchestratorConfig::default());
        orchestrator
            .register("m", MethodConfig::new(RequestConfig::get("/m")))
            .unwrap();

        orchestrator.destroy();
        orchestrator.destroy();

        let err = orchestrator.call("m", json!(null), CallOptions::default()).await.unwrap_err();
        assert!(err.is_destroyed());
        assert!(orchestrator.clear_cache(None).unwrap_err().is_destroyed());
        assert!(orchestrator.register("m", MethodConfig::new(RequestConfig::get("/m"))).is_err());
        assert_eq!(sends.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_new_outside_runtime() {
        let transport = FnTransport::new(|_: RequestConfig| async {
            Ok::<_, TransportError>(Response::ok(json!(null)))
        });
        let orchestrator =
            Orchestrator::new(OrchestratorConfig::default(), Arc::new(transport)).unwrap();
        assert!(orchestrator.inner.maintenance.lock().is_none());
    }
}
