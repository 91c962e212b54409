// Property: retry delays stay within the configured backoff envelope
//
// For any base delay, attempt, jitter ratio and optional cap, the jittered
// delay lies in [d - jitter*d, d + jitter*d] where d is the capped backoff.

use callgate::{Backoff, CallError, RetryConfig, RetryPolicy};
use proptest::prelude::*;
use std::time::Duration;

fn policy(delay_ms: u64, backoff: Backoff, jitter: f64, max_delay_ms: Option<u64>) -> RetryPolicy {
    RetryPolicy::new(RetryConfig {
        enabled: true,
        retries: 10,
        delay_ms,
        backoff,
        max_delay_ms,
        jitter,
        ..Default::default()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_jittered_delay_within_bounds(
        delay_ms in 0u64..10_000,
        attempt in 0u32..40,
        jitter in 0.0f64..=1.0,
        max_delay_ms in proptest::option::of(1u64..60_000),
        exponential in any::<bool>(),
    ) {
        let backoff = if exponential { Backoff::Exponential } else { Backoff::Fixed };
        let policy = policy(delay_ms, backoff, jitter, max_delay_ms);

        let base = policy.backoff_duration(attempt).as_millis() as f64;
        let delay = policy.delay_for(attempt).as_millis() as f64;

        // Rounding to whole milliseconds can move the sample by half a unit
        prop_assert!(delay >= (base - base * jitter).floor() - 1.0);
        prop_assert!(delay <= (base + base * jitter).ceil() + 1.0);
    }

    #[test]
    fn prop_backoff_respects_cap(
        delay_ms in 1u64..10_000,
        attempt in 0u32..64,
        max_delay_ms in 1u64..60_000,
    ) {
        let policy = policy(delay_ms, Backoff::Exponential, 0.0, Some(max_delay_ms));
        let delay = policy.backoff_duration(attempt);

        prop_assert!(delay <= Duration::from_millis(max_delay_ms));
        prop_assert_eq!(policy.delay_for(attempt), delay);
    }

    #[test]
    fn prop_exponential_backoff_is_monotonic(
        delay_ms in 1u64..1_000,
        attempt in 0u32..40,
    ) {
        let policy = policy(delay_ms, Backoff::Exponential, 0.0, None);
        prop_assert!(policy.backoff_duration(attempt + 1) >= policy.backoff_duration(attempt));
    }

    #[test]
    fn prop_retry_count_bounded(
        retries in 0u32..8,
        attempt in 0u32..16,
    ) {
        let policy = RetryPolicy::new(RetryConfig::fixed(retries, Duration::ZERO));
        let err = CallError::Network("reset".to_string());

        prop_assert_eq!(policy.should_retry(attempt, &err), attempt < retries);
    }
}
