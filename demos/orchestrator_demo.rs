//! Example wiring an orchestrator end to end
//!
//! This example shows how to:
//! - Load configuration from YAML
//! - Register methods with transforms and middleware
//! - Observe caching, deduplication, retry and the circuit breaker
//!
//! It uses a simulated transport so it runs offline. Pass a base URL as the
//! first argument to send real HTTP requests through `ReqwestTransport`.

use anyhow::Context;
use callgate::{
    CallContext, CallOptions, CircuitBreakerConfig, FnTransport, MethodConfig, MiddlewareSet,
    Orchestrator, OrchestratorConfig, RequestConfig, ReqwestTransport, Response, RetryConfig,
    Transport, TransportError,
};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const CONFIG: &str = r#"
cache:
  ttl_ms: 5000
  max_size: 100
deduplication:
  enabled: true
retry:
  retries: 2
  delay_ms: 50
  backoff: exponential
  jitter: 0.1
  circuit_breaker:
    failure_threshold: 3
    half_open_after_ms: 500
queue:
  concurrency: 2
"#;

fn simulated_transport(sends: Arc<AtomicU32>) -> impl Transport {
    FnTransport::new(move |request: RequestConfig| {
        let n = sends.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            match request.url.as_str() {
                "/flaky" if n % 3 != 2 => Err(TransportError::network("connection reset")),
                "/down" => Err(TransportError::status(503, "503 Service Unavailable")),
                _ => Ok(Response::ok(json!({
                    "url": request.url,
                    "query": request.query,
                    "send": n,
                }))),
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .with_line_number(true)
        .init();

    println!("=== Orchestrator Example ===\n");

    let config = OrchestratorConfig::from_yaml_str(CONFIG).context("invalid demo configuration")?;
    let sends = Arc::new(AtomicU32::new(0));
    let transport: Arc<dyn Transport> = match std::env::args().nth(1) {
        Some(base_url) => Arc::new(ReqwestTransport::new()?.with_base_url(base_url)),
        None => Arc::new(simulated_transport(Arc::clone(&sends))),
    };
    let orchestrator = Orchestrator::new(config, transport)?;

    orchestrator.use_middleware(MiddlewareSet::new().on_request(
        |request: RequestConfig, ctx: &CallContext| {
            Ok(request.with_header("x-attempt", ctx.attempt.to_string()))
        },
    ))?;

    orchestrator.register_batch([
        (
            "getUser",
            MethodConfig::new(RequestConfig::get("/users"))
                .with_transform(|data, _params| Ok(data["query"].clone())),
        ),
        ("flaky", MethodConfig::new(RequestConfig::get("/flaky"))),
        (
            "status",
            MethodConfig::new(RequestConfig::get("/down")).with_retry(
                RetryConfig::fixed(0, Duration::ZERO)
                    .with_circuit_breaker(CircuitBreakerConfig::new(3, Duration::from_millis(500))),
            ),
        ),
    ])?;

    // Cache and deduplication
    let calls = (0..5).map(|_| {
        orchestrator.call("getUser", json!({"id": 1}), CallOptions::default())
    });
    let results = futures::future::join_all(calls).await;
    println!("✓ 5 concurrent getUser calls → {:?}", results[0].as_ref().ok());
    orchestrator.call("getUser", json!({"id": 1}), CallOptions::default()).await?;
    println!("  transport sends so far: {}", sends.load(Ordering::SeqCst));

    // Retry
    let value = orchestrator.call("flaky", json!(null), CallOptions::default()).await?;
    println!("\n✓ flaky succeeded after retries: send #{}", value["send"]);

    // Circuit breaker
    println!();
    for i in 0..5 {
        match orchestrator.call("status", json!(null), CallOptions::default()).await {
            Ok(_) => println!("  status call {} succeeded", i),
            Err(err) => println!("  status call {} failed: {}", i, err),
        }
    }
    println!("  circuit is now {:?}", orchestrator.circuit_state("status")?);

    let metrics = orchestrator.metrics();
    let cache = orchestrator.get_cache_stats()?;
    info!(
        "calls={}, sends={}, cache_hit_rate={:.1}%, circuit_rejections={}",
        metrics.total_calls,
        metrics.transport_sends,
        cache.hit_rate * 100.0,
        metrics.circuit_rejections
    );

    orchestrator.destroy();
    println!("\n✓ Orchestrator destroyed");
    Ok(())
}
