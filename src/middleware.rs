//! Request, response and error middleware
//!
//! Middleware are composed by ordered concatenation: global, then method,
//! then call scope. The global+method composition is cached per method.

use crate::engine::{Orchestrator, OrchestratorHandle};
use crate::error::{CallError, Result};
use crate::method::MethodConfig;
use crate::models::{RequestConfig, Response};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// What middleware can see about the call in progress
#[derive(Debug, Clone, PartialEq)]
pub struct CallContext {
    pub method: String,
    pub params: Value,
    /// Zero-based attempt number
    pub attempt: u32,
    engine: OrchestratorHandle,
}

impl CallContext {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        CallContext {
            method: method.into(),
            params,
            attempt: 0,
            engine: OrchestratorHandle::default(),
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_engine(mut self, engine: OrchestratorHandle) -> Self {
        self.engine = engine;
        self
    }

    /// The orchestrator running this call, if it is still alive
    pub fn orchestrator(&self) -> Option<Orchestrator> {
        self.engine.upgrade()
    }
}

/// Rewrites a request before it is sent
pub trait RequestMiddleware: Send + Sync {
    fn on_request(&self, request: RequestConfig, ctx: &CallContext) -> Result<RequestConfig>;
}

/// Rewrites a response after it is received
pub trait ResponseMiddleware: Send + Sync {
    fn on_response(
        &self,
        response: Response,
        request: &RequestConfig,
        ctx: &CallContext,
    ) -> Result<Response>;
}

/// Offered each failed attempt; returning a response recovers the call
pub trait ErrorMiddleware: Send + Sync {
    fn on_error(&self, error: &CallError, ctx: &CallContext) -> Option<Response>;
}

impl<F> RequestMiddleware for F
where
    F: Fn(RequestConfig, &CallContext) -> Result<RequestConfig> + Send + Sync,
{
    fn on_request(&self, request: RequestConfig, ctx: &CallContext) -> Result<RequestConfig> {
        self(request, ctx)
    }
}

impl<F> ResponseMiddleware for F
where
    F: Fn(Response, &RequestConfig, &CallContext) -> Result<Response> + Send + Sync,
{
    fn on_response(
        &self,
        response: Response,
        request: &RequestConfig,
        ctx: &CallContext,
    ) -> Result<Response> {
        self(response, request, ctx)
    }
}

impl<F> ErrorMiddleware for F
where
    F: Fn(&CallError, &CallContext) -> Option<Response> + Send + Sync,
{
    fn on_error(&self, error: &CallError, ctx: &CallContext) -> Option<Response> {
        self(error, ctx)
    }
}

type Chain<T> = Arc<Vec<Arc<T>>>;

/// Ordered request, response and error middleware
#[derive(Clone, Default)]
pub struct MiddlewareSet {
    request: Chain<dyn RequestMiddleware>,
    response: Chain<dyn ResponseMiddleware>,
    error: Chain<dyn ErrorMiddleware>,
}

impl MiddlewareSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_request<F>(mut self, middleware: F) -> Self
    where
        F: Fn(RequestConfig, &CallContext) -> Result<RequestConfig> + Send + Sync + 'static,
    {
        self.push_request(Arc::new(middleware));
        self
    }

    pub fn on_response<F>(mut self, middleware: F) -> Self
    where
        F: Fn(Response, &RequestConfig, &CallContext) -> Result<Response> + Send + Sync + 'static,
    {
        self.push_response(Arc::new(middleware));
        self
    }

    pub fn on_error<F>(mut self, middleware: F) -> Self
    where
        F: Fn(&CallError, &CallContext) -> Option<Response> + Send + Sync + 'static,
    {
        self.push_error(Arc::new(middleware));
        self
    }

    pub fn push_request(&mut self, middleware: Arc<dyn RequestMiddleware>) {
        Arc::make_mut(&mut self.request).push(middleware);
    }

    pub fn push_response(&mut self, middleware: Arc<dyn ResponseMiddleware>) {
        Arc::make_mut(&mut self.response).push(middleware);
    }

    pub fn push_error(&mut self, middleware: Arc<dyn ErrorMiddleware>) {
        Arc::make_mut(&mut self.error).push(middleware);
    }

    /// Append every middleware of `other` after ours
    pub fn extend(&mut self, other: &MiddlewareSet) {
        self.request = concat(&[&self.request, &other.request]);
        self.response = concat(&[&self.response, &other.response]);
        self.error = concat(&[&self.error, &other.error]);
    }

    pub fn is_empty(&self) -> bool {
        self.request.is_empty() && self.response.is_empty() && self.error.is_empty()
    }

    pub fn apply_request(
        &self,
        request: RequestConfig,
        ctx: &CallContext,
    ) -> Result<RequestConfig> {
        self.request
            .iter()
            .try_fold(request, |request, middleware| middleware.on_request(request, ctx))
    }

    pub fn apply_response(
        &self,
        response: Response,
        request: &RequestConfig,
        ctx: &CallContext,
    ) -> Result<Response> {
        self.response.iter().try_fold(response, |response, middleware| {
            middleware.on_response(response, request, ctx)
        })
    }

    /// First recovery offered by the error middleware, if any
    pub fn recover(&self, error: &CallError, ctx: &CallContext) -> Option<Response> {
        self.error.iter().find_map(|middleware| middleware.on_error(error, ctx))
    }

    /// Compose scopes in order: global, method, call
    pub fn compose(
        global: &MiddlewareSet,
        method: &MiddlewareSet,
        call: Option<&MiddlewareSet>,
    ) -> MiddlewareSet {
        let empty = MiddlewareSet::default();
        let call = call.unwrap_or(&empty);
        MiddlewareSet {
            request: concat(&[&global.request, &method.request, &call.request]),
            response: concat(&[&global.response, &method.response, &call.response]),
            error: concat(&[&global.error, &method.error, &call.error]),
        }
    }
}

impl fmt::Debug for MiddlewareSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareSet")
            .field("request", &self.request.len())
            .field("response", &self.response.len())
            .field("error", &self.error.len())
            .finish()
    }
}

/// Concatenate chains; a lone non-empty chain is shared rather than copied
fn concat<T: ?Sized>(chains: &[&Chain<T>]) -> Chain<T> {
    let mut non_empty = chains.iter().filter(|chain| !chain.is_empty());
    let first = match non_empty.next() {
        Some(first) => first,
        None => return Arc::new(Vec::new()),
    };
    if non_empty.next().is_none() {
        return Arc::clone(first);
    }

    Arc::new(
        chains
            .iter()
            .flat_map(|chain| chain.iter().cloned())
            .collect(),
    )
}

/// Cache of global+method compositions keyed by method name
///
/// Each entry remembers the registration it was composed from. A lookup
/// with a different registration recomposes and replaces the entry.
#[derive(Default)]
pub struct MiddlewarePipeline {
    composed: Mutex<HashMap<String, ComposedEntry>>,
}

struct ComposedEntry {
    registration: Arc<MethodConfig>,
    middlewares: Arc<MiddlewareSet>,
}

impl MiddlewarePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Middleware for one call of the method registered as `registration`
    ///
    /// Calls carrying their own middleware are composed fresh and not cached.
    pub fn resolve(
        &self,
        method: &str,
        global: &MiddlewareSet,
        registration: &Arc<MethodConfig>,
        call: Option<&MiddlewareSet>,
    ) -> Arc<MiddlewareSet> {
        if let Some(call) = call.filter(|call| !call.is_empty()) {
            return Arc::new(MiddlewareSet::compose(
                global,
                &registration.middlewares,
                Some(call),
            ));
        }

        let mut composed = self.composed.lock();
        if let Some(entry) = composed.get(method) {
            if Arc::ptr_eq(&entry.registration, registration) {
                return Arc::clone(&entry.middlewares);
            }
        }

        let middlewares = Arc::new(MiddlewareSet::compose(
            global,
            &registration.middlewares,
            None,
        ));
        composed.insert(
            method.to_string(),
            ComposedEntry {
                registration: Arc::clone(registration),
                middlewares: Arc::clone(&middlewares),
            },
        );
        middlewares
    }

    pub fn invalidate(&self, method: &str) {
        self.composed.lock().remove(method);
    }

    pub fn clear(&self) {
        self.composed.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.composed.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tag(
        name: &'static str,
    ) -> impl Fn(RequestConfig, &CallContext) -> Result<RequestConfig> + Send + Sync {
        move |request: RequestConfig, _ctx: &CallContext| {
            let order = request.headers.get("x-order").cloned().unwrap_or_default();
            Ok(request.with_header("x-order", format!("{}{}", order, name)))
        }
    }

    #[test]
    fn test_compose_order() {
        let global = MiddlewareSet::new().on_request(tag("g"));
        let method = MiddlewareSet::new().on_request(tag("m"));
        let call = MiddlewareSet::new().on_request(tag("c"));

        let composed = MiddlewareSet::compose(&global, &method, Some(&call));
        let ctx = CallContext::new("m", json!(null));
        let request = composed.apply_request(RequestConfig::get("/"), &ctx).unwrap();

        assert_eq!(request.headers["x-order"], "gmc");
    }

    #[test]
    fn test_single_source_is_shared() {
        let global = MiddlewareSet::new();
        let method = MiddlewareSet::new().on_request(tag("m"));

        let composed = MiddlewareSet::compose(&global, &method, None);
        assert!(Arc::ptr_eq(&composed.request, &method.request));
    }

    #[test]
    fn test_request_error_short_circuits() {
        let set = MiddlewareSet::new()
            .on_request(|_: RequestConfig, _: &CallContext| {
                Err(CallError::Validation("blocked".to_string()))
            })
            .on_request(tag("never"));

        let ctx = CallContext::new("m", json!(null));
        let result = set.apply_request(RequestConfig::get("/"), &ctx);
        assert!(matches!(result, Err(CallError::Validation(_))));
    }

    #[test]
    fn test_recover_stops_at_first_response() {
        let set = MiddlewareSet::new()
            .on_error(|_: &CallError, _: &CallContext| None)
            .on_error(|_: &CallError, _: &CallContext| Some(Response::ok(json!("first"))))
            .on_error(|_: &CallError, _: &CallContext| Some(Response::ok(json!("second"))));

        let ctx = CallContext::new("m", json!(null));
        let recovered = set.recover(&CallError::Network("down".to_string()), &ctx).unwrap();
        assert_eq!(recovered.data, json!("first"));
    }

    #[test]
    fn test_response_middleware_sees_request() {
        let set = MiddlewareSet::new().on_response(
            |response: Response, request: &RequestConfig, _: &CallContext| {
                Ok(Response::ok(json!({ "url": request.url, "status": response.status })))
            },
        );

        let ctx = CallContext::new("m", json!(null));
        let request = RequestConfig::get("/users");
        let response = set.apply_response(Response::new(201, json!(null)), &request, &ctx).unwrap();
        assert_eq!(response.data, json!({"url": "/users", "status": 201}));
    }

    fn registration(middlewares: MiddlewareSet) -> Arc<MethodConfig> {
        Arc::new(MethodConfig::new(RequestConfig::get("/users")).with_middlewares(middlewares))
    }

    #[test]
    fn test_pipeline_caches_and_invalidates() {
        let pipeline = MiddlewarePipeline::new();
        let global = MiddlewareSet::new().on_request(tag("g"));
        let method = registration(MiddlewareSet::new());

        let first = pipeline.resolve("getUser", &global, &method, None);
        let second = pipeline.resolve("getUser", &global, &method, None);
        assert!(Arc::ptr_eq(&first, &second));

        let call = MiddlewareSet::new().on_request(tag("c"));
        let scoped = pipeline.resolve("getUser", &global, &method, Some(&call));
        assert!(!Arc::ptr_eq(&first, &scoped));
        assert_eq!(pipeline.len(), 1);

        pipeline.invalidate("getUser");
        assert!(pipeline.is_empty());
    }

    #[test]
    fn test_composition_from_replaced_registration_is_not_reused() {
        let pipeline = MiddlewarePipeline::new();
        let global = MiddlewareSet::new().on_request(tag("g"));
        let old = registration(MiddlewareSet::new().on_request(tag("1")));
        let new = registration(MiddlewareSet::new().on_request(tag("2")));

        // A call that read the old registration resolves after the
        // replacement has already invalidated the entry
        pipeline.invalidate("getUser");
        pipeline.resolve("getUser", &global, &old, None);

        let ctx = CallContext::new("getUser", json!(null));
        let resolved = pipeline.resolve("getUser", &global, &new, None);
        let request = resolved.apply_request(RequestConfig::get("/"), &ctx).unwrap();
        assert_eq!(request.headers["x-order"], "g2");

        let again = pipeline.resolve("getUser", &global, &new, None);
        assert!(Arc::ptr_eq(&resolved, &again));
    }
}
