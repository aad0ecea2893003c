//! Property-based tests for the retry loop.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use instrument_health_core::{
    InstrumentError, PreRetryAction, RecoveryError, RecoveryPolicy, RetryDelay,
};
use instrument_health_recovery::{Cancellation, RecoveryManager};
use instrument_health_registry::StatusRegistry;

fn manager() -> RecoveryManager {
    let registry = Arc::new(StatusRegistry::in_memory().unwrap());
    RecoveryManager::new(registry, Arc::new(Cancellation::new()))
}

fn policy(max_retries: u32) -> RecoveryPolicy {
    RecoveryPolicy::new(max_retries)
        .with_pre_retry(PreRetryAction::None)
        .with_delay(RetryDelay::Fixed(Duration::ZERO))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A call that keeps failing recoverably runs exactly `max_retries + 1` times.
    #[test]
    fn recoverable_failures_use_every_attempt(max_retries in 0u32..6) {
        let mut calls = 0u32;
        let outcome = manager().execute_with_outcome(None, &policy(max_retries), None, || {
            calls += 1;
            Err::<(), _>(InstrumentError::Busy("instrument busy".into()))
        });

        prop_assert_eq!(calls, max_retries + 1);
        prop_assert_eq!(outcome.attempts, max_retries + 1);
        let exhausted = matches!(
            outcome.result,
            Err(RecoveryError::Exhausted { attempts, .. }) if attempts == max_retries + 1
        );
        prop_assert!(exhausted);
    }

    /// A fatal error is never retried, whatever the policy.
    #[test]
    fn fatal_failures_run_once(max_retries in 0u32..6) {
        let mut calls = 0u32;
        let outcome = manager().execute_with_outcome(None, &policy(max_retries), None, || {
            calls += 1;
            Err::<(), _>(InstrumentError::InvalidArgument("wavelength out of range".into()))
        });

        prop_assert_eq!(calls, 1);
        prop_assert!(matches!(outcome.result, Err(RecoveryError::Fatal(_))));
    }

    /// Success on attempt `k` within budget returns after exactly `k` calls.
    #[test]
    fn success_stops_the_loop(max_retries in 0u32..6, k in 1u32..7) {
        prop_assume!(k <= max_retries + 1);
        let mut calls = 0u32;
        let outcome = manager().execute_with_outcome(None, &policy(max_retries), None, || {
            calls += 1;
            if calls < k {
                Err(InstrumentError::Timeout("no ack".into()))
            } else {
                Ok(calls)
            }
        });

        prop_assert_eq!(calls, k);
        prop_assert_eq!(outcome.attempts, k);
        prop_assert_eq!(outcome.result.ok(), Some(k));
    }
}
