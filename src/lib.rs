//! callgate
//!
//! A client-side request orchestration engine. Calls to named, declaratively
//! configured methods are served from cache, coalesced with identical
//! in-flight calls, debounced, admitted through a bounded priority queue,
//! retried with backoff and jitter, and guarded by a per-method circuit
//! breaker.
//!
//! # Features
//!
//! - **Caching**: TTL entries with least-recently-used batch eviction over a pluggable store
//! - **Deduplication**: Concurrent identical calls share one execution and one outcome
//! - **Debounce**: Trailing debounce where the last call of a burst wins
//! - **Retry**: Fixed or exponential backoff with jitter and a custom retry predicate
//! - **Circuit Breaker**: Closed/open/half-open per method with a single trial call
//! - **Queue**: Bounded concurrency with priorities and cancellation
//! - **Middleware**: Request, response and error chains at global, method and call scope
//! - **Metrics**: Lock-free counters for calls, sends, hits and retries
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use callgate::{
//!     CallOptions, MethodConfig, Orchestrator, OrchestratorConfig, RequestConfig,
//!     ReqwestTransport,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn run() -> callgate::Result<()> {
//! let config = OrchestratorConfig::from_file("callgate.yaml")?;
//! let transport = ReqwestTransport::new()?.with_base_url("https://api.example.com");
//! let orchestrator = Orchestrator::new(config, Arc::new(transport))?;
//!
//! orchestrator.register("getUser", MethodConfig::new(RequestConfig::get("/users")))?;
//! let user = orchestrator
//!     .call("getUser", json!({"id": 1}), CallOptions::default())
//!     .await?;
//! println!("{}", user);
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! Every section is optional; durations are in milliseconds:
//!
//! ```yaml
//! cache:
//!   ttl_ms: 60000
//!   max_size: 500
//! deduplication:
//!   enabled: true
//! retry:
//!   retries: 3
//!   delay_ms: 100
//!   backoff: exponential
//!   jitter: 0.1
//!   circuit_breaker:
//!     failure_threshold: 5
//!     half_open_after_ms: 30000
//! queue:
//!   concurrency: 4
//! ```
//!
//! See [`OrchestratorConfig`] for every option.
//!
//! # Error Handling
//!
//! All fallible operations return [`CallError`]. Errors leaving a call carry
//! the method name, params and a timestamp:
//!
//! ```rust,no_run
//! use callgate::{CallError, ErrorKind};
//!
//! # fn handle(err: CallError) {
//! match err.kind() {
//!     ErrorKind::CircuitOpen => eprintln!("backing off: {}", err),
//!     ErrorKind::Destroyed => eprintln!("orchestrator is gone"),
//!     _ => eprintln!("call to {:?} failed: {}", err.context().map(|c| &c.method), err),
//! }
//! # }
//! ```

pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod debounce;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod keys;
pub mod method;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod queue;
pub mod retry;
pub mod transport;

// Re-export commonly used types
pub use cache::{CacheEntry, CacheManager, CacheStats, CacheStorage, MemoryStorage, StorageError};
pub use circuit_breaker::{CircuitBreaker, CircuitState, CircuitStatus};
pub use config::{
    Backoff, CacheConfig, CircuitBreakerConfig, ConfigChanges, DebounceConfig, DedupConfig,
    MaintenanceConfig, OrchestratorConfig, QueueConfig, RetryConfig,
};
pub use debounce::DebounceManager;
pub use dedup::DedupManager;
pub use engine::{BatchCall, Extension, Orchestrator, OrchestratorHandle};
pub use error::{CallError, ErrorContext, ErrorKind, Result};
pub use keys::{generate_key, KeyGenerator};
pub use method::{CallOptions, MethodConfig, RequestTemplate};
pub use metrics::{MetricsSnapshot, OrchestratorMetrics};
pub use middleware::{
    CallContext, ErrorMiddleware, MiddlewarePipeline, MiddlewareSet, RequestMiddleware,
    ResponseMiddleware,
};
pub use models::{RequestConfig, Response};
pub use queue::{QueuePermit, RequestQueue};
pub use retry::{RetryOutcome, RetryPolicy, RetryPredicate};
pub use transport::{FnTransport, ReqwestTransport, Transport, TransportError};
pub use tokio_util::sync::CancellationToken;
