//! Configuration management for the orchestrator
//!
//! Every section is optional in YAML. A section that is present defaults to
//! `enabled: true`; a section that is absent falls back to the section's
//! `Default`, which leaves the feature off (deduplication excepted).
//! All durations are milliseconds.

use crate::error::{CallError, Result};
use crate::keys::KeyGenerator;
use crate::retry::RetryPredicate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Top-level orchestrator configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub debounce: DebounceConfig,

    #[serde(default)]
    pub deduplication: DedupConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

/// Response cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Entry time-to-live (default: 5 minutes)
    #[serde(default = "default_cache_ttl")]
    pub ttl_ms: u64,

    /// Maximum number of entries (default: 1000)
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,
}

/// Trailing debounce settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebounceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Quiet period before the last call fires (default: 300ms)
    #[serde(default = "default_debounce_delay")]
    pub delay_ms: u64,
}

/// In-flight deduplication settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Custom key derivation; defaults to method name plus params hash
    #[serde(skip)]
    pub key_generator: Option<KeyGenerator>,
}

/// How the retry delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Fixed,
    Exponential,
}

/// Retry and backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum number of retries after the first attempt (default: 3)
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Base delay (default: 1000ms)
    #[serde(default = "default_retry_delay")]
    pub delay_ms: u64,

    #[serde(default = "default_backoff")]
    pub backoff: Backoff,

    /// Upper bound applied before jitter (default: 30s)
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: Option<u64>,

    /// Jitter ratio in `[0, 1]` (default: 0.1)
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Decides retry-worthiness per error and attempt
    #[serde(skip)]
    pub retry_on: Option<RetryPredicate>,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

/// Per-method circuit breaker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Consecutive failures that open the circuit (default: 5)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time an open circuit waits before letting a trial through (default: 30s)
    #[serde(default = "default_half_open_after")]
    pub half_open_after_ms: u64,

    /// Trial successes needed to close again (default: 1)
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

/// Bounded-concurrency admission queue settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum concurrent transport sends (default: 4)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Maximum waiting tasks, 0 for unbounded (default: 1000)
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
}

/// Bounds and cadences for the background sweeps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Interval of the background sweep (default: 60s)
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_ms: u64,

    /// How often cache size bookkeeping is recomputed (default: 1s)
    #[serde(default = "default_stats_refresh")]
    pub stats_refresh_ms: u64,

    /// Pending dedup entries before the oldest 20% are dropped (default: 1000)
    #[serde(default = "default_max_tracked")]
    pub max_pending_calls: usize,

    /// Age at which a pending dedup entry is considered stale (default: 5 minutes)
    #[serde(default = "default_pending_stale")]
    pub pending_stale_ms: u64,

    /// Debounced keys before the oldest 20% are rejected (default: 1000)
    #[serde(default = "default_max_tracked")]
    pub max_debounced_calls: usize,

    /// Age at which a debounced item is rejected with a timeout (default: 60s)
    #[serde(default = "default_debounce_stale")]
    pub debounce_stale_ms: u64,

    /// Idle time after which a healthy circuit entry is dropped (default: 1 hour)
    #[serde(default = "default_circuit_idle")]
    pub circuit_idle_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_ms: default_cache_ttl(),
            max_size: default_cache_max_size(),
        }
    }
}

impl CacheConfig {
    /// Enabled cache with the given time-to-live
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            enabled: true,
            ttl_ms: ttl.as_millis() as u64,
            ..Default::default()
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            delay_ms: default_debounce_delay(),
        }
    }
}

impl DebounceConfig {
    /// Enabled debounce with the given quiet period
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            enabled: true,
            delay_ms: delay.as_millis() as u64,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_generator: None,
        }
    }
}

impl DedupConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            key_generator: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            retries: default_retries(),
            delay_ms: default_retry_delay(),
            backoff: default_backoff(),
            max_delay_ms: default_max_delay(),
            jitter: default_jitter(),
            retry_on: None,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl RetryConfig {
    /// Enabled retry with `retries` attempts and a fixed `delay`, no jitter
    pub fn fixed(retries: u32, delay: Duration) -> Self {
        Self {
            enabled: true,
            retries,
            delay_ms: delay.as_millis() as u64,
            backoff: Backoff::Fixed,
            jitter: 0.0,
            ..Default::default()
        }
    }

    /// Enabled retry with exponential backoff from `delay`, no jitter
    pub fn exponential(retries: u32, delay: Duration) -> Self {
        Self {
            backoff: Backoff::Exponential,
            ..Self::fixed(retries, delay)
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay_ms = Some(max_delay.as_millis() as u64);
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    pub fn with_retry_on(mut self, predicate: RetryPredicate) -> Self {
        self.retry_on = Some(predicate);
        self
    }

    /// Retry disabled, circuit breaker settings kept
    pub fn disabled(&self) -> Self {
        Self {
            enabled: false,
            ..self.clone()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(CallError::ConfigError(format!(
                "retry jitter must be between 0 and 1, got {}",
                self.jitter
            )));
        }

        if let Some(max_delay) = self.max_delay_ms {
            if max_delay == 0 {
                return Err(CallError::ConfigError(
                    "retry max_delay_ms must be greater than 0".to_string(),
                ));
            }
        }

        self.circuit_breaker.validate()
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: default_failure_threshold(),
            half_open_after_ms: default_half_open_after(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Enabled breaker opening after `failure_threshold` failures
    pub fn new(failure_threshold: u32, half_open_after: Duration) -> Self {
        Self {
            enabled: true,
            failure_threshold,
            half_open_after_ms: half_open_after.as_millis() as u64,
            success_threshold: default_success_threshold(),
        }
    }

    pub fn with_success_threshold(mut self, success_threshold: u32) -> Self {
        self.success_threshold = success_threshold;
        self
    }

    pub fn half_open_after(&self) -> Duration {
        Duration::from_millis(self.half_open_after_ms)
    }

    fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.failure_threshold == 0 {
            return Err(CallError::ConfigError(
                "circuit_breaker failure_threshold must be greater than 0".to_string(),
            ));
        }

        if self.success_threshold == 0 {
            return Err(CallError::ConfigError(
                "circuit_breaker success_threshold must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            concurrency: default_concurrency(),
            max_queue: default_max_queue(),
        }
    }
}

impl QueueConfig {
    /// Enabled queue with the given concurrency and no waiting limit
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            enabled: true,
            concurrency,
            max_queue: 0,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_ms: default_cleanup_interval(),
            stats_refresh_ms: default_stats_refresh(),
            max_pending_calls: default_max_tracked(),
            pending_stale_ms: default_pending_stale(),
            max_debounced_calls: default_max_tracked(),
            debounce_stale_ms: default_debounce_stale(),
            circuit_idle_ms: default_circuit_idle(),
        }
    }
}

impl MaintenanceConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_cache_ttl() -> u64 {
    5 * 60 * 1000
}

fn default_cache_max_size() -> usize {
    1000
}

fn default_debounce_delay() -> u64 {
    300
}

fn default_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1000
}

fn default_backoff() -> Backoff {
    Backoff::Exponential
}

fn default_max_delay() -> Option<u64> {
    Some(30_000)
}

fn default_jitter() -> f64 {
    0.1
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_half_open_after() -> u64 {
    30_000
}

fn default_success_threshold() -> u32 {
    1
}

fn default_concurrency() -> usize {
    4
}

fn default_max_queue() -> usize {
    1000
}

fn default_cleanup_interval() -> u64 {
    60_000
}

fn default_stats_refresh() -> u64 {
    1000
}

fn default_max_tracked() -> usize {
    1000
}

fn default_pending_stale() -> u64 {
    5 * 60 * 1000
}

fn default_debounce_stale() -> u64 {
    60_000
}

fn default_circuit_idle() -> u64 {
    60 * 60 * 1000
}

impl OrchestratorConfig {
    /// Load configuration from a YAML file
    ///
    /// # Returns
    /// * `Ok(OrchestratorConfig)` if loading and validation succeed
    /// * `Err(CallError)` if the file cannot be read or the config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            CallError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        Self::from_yaml_str(&content)
    }

    /// Parse and validate configuration from a YAML string
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: OrchestratorConfig = serde_yaml::from_str(content).map_err(|e| {
            CallError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - cache ttl_ms and max_size must be > 0 when caching is enabled
    /// - queue concurrency must be > 0 when queueing is enabled
    /// - retry jitter must lie in [0, 1]
    /// - circuit breaker thresholds must be > 0 when enabled
    /// - cleanup interval must be > 0
    pub fn validate(&self) -> Result<()> {
        if self.cache.enabled {
            if self.cache.ttl_ms == 0 {
                return Err(CallError::ConfigError(
                    "cache ttl_ms must be greater than 0 when caching is enabled".to_string(),
                ));
            }
            if self.cache.max_size == 0 {
                return Err(CallError::ConfigError(
                    "cache max_size must be greater than 0 when caching is enabled".to_string(),
                ));
            }
        }

        if self.queue.enabled && self.queue.concurrency == 0 {
            return Err(CallError::ConfigError(
                "queue concurrency must be greater than 0".to_string(),
            ));
        }

        self.retry.validate()?;

        if self.maintenance.cleanup_interval_ms == 0 {
            return Err(CallError::ConfigError(
                "maintenance cleanup_interval_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Update configuration from another config
    ///
    /// The new config is validated first; on failure `self` is left untouched.
    pub fn update_from(&mut self, new_config: &OrchestratorConfig) -> Result<ConfigChanges> {
        new_config.validate()?;

        let mut changes = ConfigChanges::default();

        if self.cache != new_config.cache {
            changes.cache_changed = true;
            self.cache = new_config.cache.clone();
        }

        if self.debounce != new_config.debounce {
            changes.debounce_changed = true;
            self.debounce = new_config.debounce.clone();
        }

        if self.deduplication != new_config.deduplication {
            changes.dedup_changed = true;
            self.deduplication = new_config.deduplication.clone();
        }

        if self.retry != new_config.retry {
            changes.retry_changed = true;
            self.retry = new_config.retry.clone();
        }

        if self.queue != new_config.queue {
            changes.queue_changed = true;
            self.queue = new_config.queue.clone();
        }

        if self.maintenance != new_config.maintenance {
            changes.maintenance_changed = true;
            self.maintenance = new_config.maintenance.clone();
        }

        Ok(changes)
    }
}

/// Description of configuration changes after an update
#[derive(Debug, Default, Clone)]
pub struct ConfigChanges {
    pub cache_changed: bool,
    pub debounce_changed: bool,
    pub dedup_changed: bool,
    pub retry_changed: bool,
    pub queue_changed: bool,
    pub maintenance_changed: bool,
}

impl ConfigChanges {
    /// Check if any changes were made
    pub fn has_changes(&self) -> bool {
        self.cache_changed
            || self.debounce_changed
            || self.dedup_changed
            || self.retry_changed
            || self.queue_changed
            || self.maintenance_changed
    }

    /// Names of the sections that changed
    pub fn summary(&self) -> Vec<String> {
        let mut changes = Vec::new();

        if self.cache_changed {
            changes.push("cache".to_string());
        }
        if self.debounce_changed {
            changes.push("debounce".to_string());
        }
        if self.dedup_changed {
            changes.push("deduplication".to_string());
        }
        if self.retry_changed {
            changes.push("retry".to_string());
        }
        if self.queue_changed {
            changes.push("queue".to_string());
        }
        if self.maintenance_changed {
            changes.push("maintenance".to_string());
        }

        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert!(!config.cache.enabled);
        assert!(!config.debounce.enabled);
        assert!(config.deduplication.enabled);
        assert!(!config.retry.enabled);
        assert!(!config.queue.enabled);
        assert_eq!(config.cache.max_size, 1000);
        assert_eq!(config.queue.concurrency, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_present_section_defaults_to_enabled() {
        let yaml = r#"
cache:
  ttl_ms: 1000
retry:
  retries: 2
  delay_ms: 50
  backoff: fixed
  circuit_breaker:
    failure_threshold: 3
"#;
        let config = OrchestratorConfig::from_yaml_str(yaml).unwrap();
        assert!(config.cache.enabled);
        assert_eq!(config.cache.ttl(), Duration::from_millis(1000));
        assert_eq!(config.cache.max_size, 1000);
        assert!(config.retry.enabled);
        assert_eq!(config.retry.retries, 2);
        assert_eq!(config.retry.backoff, Backoff::Fixed);
        assert!(config.retry.circuit_breaker.enabled);
        assert_eq!(config.retry.circuit_breaker.failure_threshold, 3);
        assert!(!config.queue.enabled);
    }

    #[test]
    fn test_validate_zero_cache_ttl() {
        let mut config = OrchestratorConfig::default();
        config.cache = CacheConfig::with_ttl(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_concurrency() {
        let mut config = OrchestratorConfig::default();
        config.queue = QueueConfig::with_concurrency(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_jitter_range() {
        let mut config = OrchestratorConfig::default();
        config.retry = RetryConfig::fixed(3, Duration::from_millis(10)).with_jitter(1.5);
        assert!(config.validate().is_err());

        config.retry = RetryConfig::fixed(3, Duration::from_millis(10)).with_jitter(0.5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_circuit_thresholds() {
        let mut config = OrchestratorConfig::default();
        config.retry.circuit_breaker = CircuitBreakerConfig::new(0, Duration::from_secs(1));
        assert!(config.validate().is_err());

        config.retry.circuit_breaker =
            CircuitBreakerConfig::new(3, Duration::from_secs(1)).with_success_threshold(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_error_is_config_error() {
        let result = OrchestratorConfig::from_yaml_str("cache: [not, a, map]");
        assert!(matches!(result, Err(CallError::ConfigError(_))));
    }

    #[test]
    fn test_update_from() {
        let mut config = OrchestratorConfig::default();
        let mut new_config = OrchestratorConfig::default();

        let changes = config.update_from(&new_config).unwrap();
        assert!(!changes.has_changes());

        new_config.queue = QueueConfig::with_concurrency(8);
        let changes = config.update_from(&new_config).unwrap();
        assert!(changes.queue_changed);
        assert_eq!(changes.summary(), vec!["queue".to_string()]);
        assert_eq!(config.queue.concurrency, 8);
    }

    #[test]
    fn test_update_from_invalid_leaves_config() {
        let mut config = OrchestratorConfig::default();
        let mut new_config = OrchestratorConfig::default();
        new_config.queue = QueueConfig::with_concurrency(0);

        assert!(config.update_from(&new_config).is_err());
        assert!(!config.queue.enabled);
    }

    #[test]
    fn test_retry_builders() {
        let retry = RetryConfig::exponential(3, Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(1));
        assert!(retry.enabled);
        assert_eq!(retry.backoff, Backoff::Exponential);
        assert_eq!(retry.jitter, 0.0);
        assert_eq!(retry.max_delay_ms, Some(1000));
        assert!(!retry.disabled().enabled);
    }
}
