//! Retry delay computation from per-config backoff policies.
//!
//! The delay before attempt n+1 is `policy(attempt_count)` capped at the
//! policy maximum, plus bounded additive jitter. Jitter is at most
//! `jitter_factor * base_delay` with `jitter_factor` clamped to [0, 1],
//! and never more than the growth to the next base delay, so jittered
//! delays stay non-decreasing in the attempt count for every strategy,
//! including `Fixed` and capped policies.

use std::time::Duration;

use rand::Rng;
use relay_core::{BackoffPolicy, BackoffStrategy};

/// Deterministic delay for the given completed attempt count, before jitter.
pub fn compute_base(policy: &BackoffPolicy, attempt_count: i32) -> Duration {
    let n = u64::try_from(attempt_count.max(1)).unwrap_or(1);
    let base_ms = policy.base_delay_ms;

    let raw_ms = match policy.strategy {
        BackoffStrategy::Fixed => base_ms,
        BackoffStrategy::Linear => base_ms.saturating_mul(n),
        BackoffStrategy::Exponential => {
            let exponent = u32::try_from(n - 1).unwrap_or(u32::MAX).min(63);
            base_ms.saturating_mul(1u64.checked_shl(exponent).unwrap_or(u64::MAX))
        },
    };

    Duration::from_millis(raw_ms.min(policy.max_delay_ms))
}

/// Delay for the given completed attempt count, with jitter applied.
pub fn compute(policy: &BackoffPolicy, attempt_count: i32) -> Duration {
    let base = compute_base(policy, attempt_count);
    let next_base = compute_base(policy, attempt_count.saturating_add(1));

    // Jitter is capped at the step to the next base delay. Once the base
    // stops growing (Fixed strategy, or the cap is reached) the step is
    // zero and jitter is suppressed, keeping realized delays monotone.
    let growth_ms = u64::try_from(next_base.saturating_sub(base).as_millis()).unwrap_or(u64::MAX);
    let jitter_bound_ms = ((policy.jitter_factor.clamp(0.0, 1.0)
        * policy.base_delay_ms as f64) as u64)
        .min(growth_ms);
    if jitter_bound_ms == 0 {
        return base;
    }

    let jitter_ms = rand::thread_rng().gen_range(0..=jitter_bound_ms);
    base + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn policy(strategy: BackoffStrategy, base_ms: u64, max_ms: u64, jitter: f64) -> BackoffPolicy {
        BackoffPolicy { strategy, base_delay_ms: base_ms, max_delay_ms: max_ms, jitter_factor: jitter }
    }

    #[test]
    fn linear_delay_grows_by_base_per_attempt() {
        let p = policy(BackoffStrategy::Linear, 10_000, 3_600_000, 0.0);

        assert_eq!(compute_base(&p, 1), Duration::from_secs(10));
        assert_eq!(compute_base(&p, 2), Duration::from_secs(20));
        assert_eq!(compute_base(&p, 5), Duration::from_secs(50));
    }

    #[test]
    fn fixed_delay_is_constant() {
        let p = policy(BackoffStrategy::Fixed, 5_000, 3_600_000, 0.0);

        assert_eq!(compute_base(&p, 1), compute_base(&p, 10));
    }

    #[test]
    fn exponential_delay_doubles() {
        let p = policy(BackoffStrategy::Exponential, 1_000, 3_600_000, 0.0);

        assert_eq!(compute_base(&p, 1), Duration::from_secs(1));
        assert_eq!(compute_base(&p, 2), Duration::from_secs(2));
        assert_eq!(compute_base(&p, 4), Duration::from_secs(8));
    }

    #[test]
    fn delay_is_capped_at_the_policy_maximum() {
        let p = policy(BackoffStrategy::Exponential, 1_000, 60_000, 0.0);

        assert_eq!(compute_base(&p, 30), Duration::from_secs(60));
        // Large attempt counts must not overflow.
        assert_eq!(compute_base(&p, i32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn zero_and_negative_attempt_counts_are_treated_as_one() {
        let p = policy(BackoffStrategy::Linear, 10_000, 3_600_000, 0.0);

        assert_eq!(compute_base(&p, 0), compute_base(&p, 1));
        assert_eq!(compute_base(&p, -3), compute_base(&p, 1));
    }

    #[test]
    fn jitter_is_suppressed_once_the_delay_stops_growing() {
        // Fixed delays have no growth step, so jitter never applies.
        let fixed = policy(BackoffStrategy::Fixed, 10_000, 3_600_000, 1.0);
        for attempt in 1..=5 {
            assert_eq!(compute(&fixed, attempt), Duration::from_secs(10));
        }

        // Linear at the cap behaves the same.
        let capped = policy(BackoffStrategy::Linear, 10_000, 20_000, 0.25);
        assert_eq!(compute(&capped, 2), Duration::from_secs(20));
        assert_eq!(compute(&capped, 3), Duration::from_secs(20));
    }

    proptest! {
        #[test]
        fn base_delay_is_monotone_in_attempt_count(
            strategy in prop_oneof![
                Just(BackoffStrategy::Fixed),
                Just(BackoffStrategy::Linear),
                Just(BackoffStrategy::Exponential),
            ],
            base_ms in 1u64..100_000,
            max_ms in 1u64..10_000_000,
            attempt in 1i32..1000,
        ) {
            let p = policy(strategy, base_ms, max_ms, 0.0);
            prop_assert!(compute_base(&p, attempt) <= compute_base(&p, attempt + 1));
        }

        #[test]
        fn jittered_delay_stays_within_its_bound(
            base_ms in 1u64..100_000,
            jitter in 0.0f64..1.0,
            attempt in 1i32..100,
        ) {
            let p = policy(BackoffStrategy::Linear, base_ms, 10_000_000, jitter);
            let base = compute_base(&p, attempt);
            let jittered = compute(&p, attempt);

            prop_assert!(jittered >= base);
            prop_assert!(jittered <= base + Duration::from_millis(base_ms));
        }

        #[test]
        fn jittered_delays_never_decrease(
            strategy in prop_oneof![
                Just(BackoffStrategy::Fixed),
                Just(BackoffStrategy::Linear),
                Just(BackoffStrategy::Exponential),
            ],
            base_ms in 1u64..100_000,
            max_ms in 1u64..10_000_000,
            jitter in 0.0f64..=1.0,
            attempt in 1i32..100,
        ) {
            // Jitter is bounded by the growth step, so the largest jittered
            // delay at n never exceeds the smallest delay at n + 1. This
            // must hold for Fixed and for capped policies too.
            let p = policy(strategy, base_ms, max_ms, jitter);
            prop_assert!(compute(&p, attempt) <= compute_base(&p, attempt + 1));
        }
    }
}
