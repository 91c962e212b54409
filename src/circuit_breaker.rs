//! Per-method circuit breaker
//!
//! # State Transitions
//! ```text
//! Closed   → Open:     failure_count reaches failure_threshold
//! Open     → HalfOpen: first call at or after next_try_at (the trial)
//! HalfOpen → Closed:   success_count reaches success_threshold
//! HalfOpen → Open:     any failure
//! ```
//!
//! Only one trial is let through at a time while half-open. A trial that
//! never reports back frees its slot after `half_open_after`.

use crate::config::CircuitBreakerConfig;
use crate::error::{CallError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Snapshot of one method's circuit
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Only meaningful while open
    pub next_try_at: Option<Instant>,
    trial_started_at: Option<Instant>,
    last_activity: Instant,
}

impl CircuitStatus {
    fn closed(now: Instant) -> Self {
        CircuitStatus {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            next_try_at: None,
            trial_started_at: None,
            last_activity: now,
        }
    }

    fn open(&mut self, now: Instant, config: &CircuitBreakerConfig) {
        self.state = CircuitState::Open;
        self.success_count = 0;
        self.next_try_at = Some(now + config.half_open_after());
        self.trial_started_at = None;
    }
}

/// Circuit state store keyed by method name
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    circuits: Mutex<HashMap<String, CircuitStatus>>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate a call before any attempt is made
    ///
    /// # Returns
    /// * `Ok(())` if the call may proceed (possibly as the half-open trial)
    /// * `Err(CallError::CircuitOpen)` if the circuit rejects it
    pub fn check(&self, method: &str, config: &CircuitBreakerConfig) -> Result<()> {
        if !config.enabled {
            return Ok(());
        }

        let now = Instant::now();
        let mut circuits = self.circuits.lock();
        let Some(circuit) = circuits.get_mut(method) else {
            return Ok(());
        };

        match circuit.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let next_try_at = circuit.next_try_at.unwrap_or(now);
                if now < next_try_at {
                    return Err(CallError::CircuitOpen {
                        method: method.to_string(),
                        retry_after_ms: (next_try_at - now).as_millis() as u64,
                    });
                }

                info!("Circuit half-open, letting trial call through: method={}", method);
                circuit.state = CircuitState::HalfOpen;
                circuit.success_count = 0;
                circuit.next_try_at = None;
                circuit.trial_started_at = Some(now);
                circuit.last_activity = now;
                Ok(())
            }
            CircuitState::HalfOpen => {
                let trial_running = circuit
                    .trial_started_at
                    .map(|started| now.duration_since(started) < config.half_open_after())
                    .unwrap_or(false);

                if trial_running {
                    debug!("Circuit half-open with trial in flight: method={}", method);
                    return Err(CallError::CircuitOpen {
                        method: method.to_string(),
                        retry_after_ms: 0,
                    });
                }

                circuit.trial_started_at = Some(now);
                circuit.last_activity = now;
                Ok(())
            }
        }
    }

    /// Report a successful call
    pub fn record_success(&self, method: &str, config: &CircuitBreakerConfig) {
        if !config.enabled {
            return;
        }

        let now = Instant::now();
        let mut circuits = self.circuits.lock();
        let circuit = circuits
            .entry(method.to_string())
            .or_insert_with(|| CircuitStatus::closed(now));
        circuit.last_activity = now;

        match circuit.state {
            CircuitState::Closed => {
                circuit.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                circuit.success_count += 1;
                circuit.trial_started_at = None;
                if circuit.success_count >= config.success_threshold {
                    info!("Circuit closed after successful trial: method={}", method);
                    *circuit = CircuitStatus::closed(now);
                }
            }
            // A call admitted before the circuit opened; the open window stands
            CircuitState::Open => {}
        }
    }

    /// Report a failed call
    pub fn record_failure(&self, method: &str, config: &CircuitBreakerConfig) {
        if !config.enabled {
            return;
        }

        let now = Instant::now();
        let mut circuits = self.circuits.lock();
        let circuit = circuits
            .entry(method.to_string())
            .or_insert_with(|| CircuitStatus::closed(now));
        circuit.last_activity = now;

        match circuit.state {
            CircuitState::Closed => {
                circuit.failure_count += 1;
                if circuit.failure_count >= config.failure_threshold {
                    warn!(
                        "Circuit opened after {} failures: method={}, retry after {:?}",
                        circuit.failure_count,
                        method,
                        config.half_open_after()
                    );
                    circuit.open(now, config);
                }
            }
            CircuitState::HalfOpen => {
                circuit.failure_count += 1;
                warn!("Trial call failed, circuit reopened: method={}", method);
                circuit.open(now, config);
            }
            CircuitState::Open => {}
        }
    }

    /// Free the half-open trial slot without counting an outcome
    pub fn release_trial(&self, method: &str) {
        if let Some(circuit) = self.circuits.lock().get_mut(method) {
            if circuit.state == CircuitState::HalfOpen {
                circuit.trial_started_at = None;
            }
        }
    }

    /// Current state, `Closed` for methods never seen
    pub fn state(&self, method: &str) -> CircuitState {
        self.circuits
            .lock()
            .get(method)
            .map(|circuit| circuit.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn status(&self, method: &str) -> Option<CircuitStatus> {
        self.circuits.lock().get(method).cloned()
    }

    /// Forget a method's circuit, closing it
    pub fn reset(&self, method: &str) -> bool {
        self.circuits.lock().remove(method).is_some()
    }

    /// Drop healthy circuits idle for longer than `idle`
    pub fn cleanup_idle(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let mut circuits = self.circuits.lock();
        let before = circuits.len();
        circuits.retain(|_, circuit| {
            !(circuit.state == CircuitState::Closed
                && circuit.failure_count == 0
                && now.duration_since(circuit.last_activity) > idle)
        });
        before - circuits.len()
    }

    pub fn clear(&self) {
        self.circuits.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.circuits.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
