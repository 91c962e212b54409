//! Deterministic call keys
//!
//! Cache, deduplication and debounce all key on the method name plus a
//! content hash of the params. `serde_json::Value` objects keep their keys
//! sorted, so two params values that compare equal always serialize, and
//! therefore hash, identically.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64;

/// Custom key derivation from `(method, params)`
#[derive(Clone)]
pub struct KeyGenerator(Arc<dyn Fn(&str, &Value) -> String + Send + Sync>);

impl KeyGenerator {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str, &Value) -> String + Send + Sync + 'static,
    {
        KeyGenerator(Arc::new(f))
    }

    pub fn generate(&self, method: &str, params: &Value) -> String {
        (self.0)(method, params)
    }
}

impl fmt::Debug for KeyGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyGenerator(..)")
    }
}

impl PartialEq for KeyGenerator {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Hash of the canonical serialization of `params`
pub fn params_hash(params: &Value) -> u64 {
    // Serializing a Value cannot fail: keys are always strings.
    let serialized = serde_json::to_vec(params).unwrap_or_default();
    xxh3_64(&serialized)
}

/// Default key: `{method}:{params hash}`
pub fn generate_key(method: &str, params: &Value) -> String {
    format!("{}:{:016x}", method, params_hash(params))
}

/// Prefix shared by every default key of `method`
pub fn method_prefix(method: &str) -> String {
    format!("{}:", method)
}
