//! Method registration and per-call options

use crate::config::{CacheConfig, DebounceConfig, DedupConfig, OrchestratorConfig, RetryConfig};
use crate::error::{CallError, Result};
use crate::middleware::{CallContext, MiddlewareSet};
use crate::models::RequestConfig;
use http::Method;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub type RequestBuilderFn = Arc<dyn Fn(&Value) -> Result<RequestConfig> + Send + Sync>;
pub type TransformFn = Arc<dyn Fn(Value, &Value) -> Result<Value> + Send + Sync>;
pub type ValidateFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
pub type SuccessCallback = Arc<dyn Fn(&Value, &CallContext) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&CallError, &CallContext) + Send + Sync>;

/// How a method turns params into a request
#[derive(Clone)]
pub enum RequestTemplate {
    /// Fixed request; params go to the query for GET/DELETE/HEAD, to the body otherwise
    Static(RequestConfig),
    /// Request built from params
    Dynamic(RequestBuilderFn),
}

impl RequestTemplate {
    pub fn build(&self, params: &Value) -> Result<RequestConfig> {
        match self {
            RequestTemplate::Dynamic(builder) => builder(params),
            RequestTemplate::Static(request) => {
                let mut request = request.clone();
                apply_params(&mut request, params);
                Ok(request)
            }
        }
    }
}

fn apply_params(request: &mut RequestConfig, params: &Value) {
    if params.is_null() {
        return;
    }

    let in_query = matches!(request.method, Method::GET | Method::DELETE | Method::HEAD);
    match params {
        Value::Object(fields) if in_query => {
            for (name, value) in fields {
                let value = match value {
                    Value::String(s) => s.clone(),
                    Value::Null => continue,
                    other => other.to_string(),
                };
                request.query.entry(name.clone()).or_insert(value);
            }
        }
        _ if !in_query && request.body.is_none() => {
            request.body = Some(params.clone());
        }
        _ => {}
    }
}

impl fmt::Debug for RequestTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestTemplate::Static(request) => f.debug_tuple("Static").field(request).finish(),
            RequestTemplate::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Declarative configuration of one named method
///
/// Feature overrides replace the corresponding global section wholesale.
#[derive(Clone)]
pub struct MethodConfig {
    pub request: RequestTemplate,
    pub transform: Option<TransformFn>,
    pub validate: Option<ValidateFn>,
    pub cache: Option<CacheConfig>,
    pub debounce: Option<DebounceConfig>,
    pub deduplication: Option<DedupConfig>,
    pub retry: Option<RetryConfig>,
    /// Route sends through the queue; `None` follows the global setting
    pub queue: Option<bool>,
    pub middlewares: MiddlewareSet,
    pub on_success: Option<SuccessCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl MethodConfig {
    pub fn new(request: RequestConfig) -> Self {
        Self::with_template(RequestTemplate::Static(request))
    }

    /// Method whose request is computed from the call params
    pub fn dynamic<F>(builder: F) -> Self
    where
        F: Fn(&Value) -> Result<RequestConfig> + Send + Sync + 'static,
    {
        Self::with_template(RequestTemplate::Dynamic(Arc::new(builder)))
    }

    fn with_template(request: RequestTemplate) -> Self {
        MethodConfig {
            request,
            transform: None,
            validate: None,
            cache: None,
            debounce: None,
            deduplication: None,
            retry: None,
            queue: None,
            middlewares: MiddlewareSet::default(),
            on_success: None,
            on_error: None,
        }
    }

    /// Map response data, given the call params
    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(Value, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Reject transformed data for which `validate` returns false
    pub fn with_validate<F>(mut self, validate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(validate));
        self
    }

    /// Reject overrides that cannot apply to a single method
    ///
    /// Cache capacity is shared by every method, so a method's cache section
    /// may only change `enabled` and `ttl_ms`. Its `max_size` must be left at
    /// the default or match the global capacity.
    pub fn validate_overrides(&self, global: &OrchestratorConfig) -> Result<()> {
        if let Some(cache) = &self.cache {
            let shared = global.cache.max_size;
            if cache.max_size != shared && cache.max_size != CacheConfig::default().max_size {
                return Err(CallError::ConfigError(format!(
                    "method cache max_size ({}) must match the shared cache capacity ({})",
                    cache.max_size, shared
                )));
            }
        }

        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        Ok(())
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_debounce(mut self, debounce: DebounceConfig) -> Self {
        self.debounce = Some(debounce);
        self
    }

    pub fn with_dedup(mut self, deduplication: DedupConfig) -> Self {
        self.deduplication = Some(deduplication);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_queue(mut self, queue: bool) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_middlewares(mut self, middlewares: MiddlewareSet) -> Self {
        self.middlewares = middlewares;
        self
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Value, &CallContext) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&CallError, &CallContext) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for MethodConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodConfig")
            .field("request", &self.request)
            .field("cache", &self.cache)
            .field("debounce", &self.debounce)
            .field("deduplication", &self.deduplication)
            .field("retry", &self.retry)
            .field("queue", &self.queue)
            .field("middlewares", &self.middlewares)
            .finish_non_exhaustive()
    }
}

/// Per-call overrides
#[derive(Clone, Default)]
pub struct CallOptions {
    pub skip_cache: bool,
    pub skip_dedup: bool,
    pub skip_debounce: bool,
    /// TTL for the entry this call writes
    pub cache_ttl: Option<Duration>,
    /// Overrides the method and global queue setting
    pub queue: Option<bool>,
    /// Higher runs first when queued
    pub priority: i32,
    pub retry: Option<RetryConfig>,
    /// Transport timeout for each attempt
    pub timeout: Option<Duration>,
    pub middlewares: Option<MiddlewareSet>,
    pub on_success: Option<SuccessCallback>,
    pub on_error: Option<ErrorCallback>,
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }

    pub fn skip_dedup(mut self) -> Self {
        self.skip_dedup = true;
        self
    }

    pub fn skip_debounce(mut self) -> Self {
        self.skip_debounce = true;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn with_queue(mut self, queue: bool) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_middlewares(mut self, middlewares: MiddlewareSet) -> Self {
        self.middlewares = Some(middlewares);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Value, &CallContext) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&CallError, &CallContext) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("skip_cache", &self.skip_cache)
            .field("skip_dedup", &self.skip_dedup)
            .field("skip_debounce", &self.skip_debounce)
            .field("cache_ttl", &self.cache_ttl)
            .field("queue", &self.queue)
            .field("priority", &self.priority)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("cancel", &self.cancel.is_some())
            .finish_non_exhaustive()
    }
}
