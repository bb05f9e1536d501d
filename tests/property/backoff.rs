//! Property tests for the backoff wait formula.
//!
//! Verifies against a wide-integer reference that the wait before
//! attempt `n` is exactly `min(initial_wait * 2^(n-1),
//! max_single_wait)`, that it is monotonic in `n`, and that
//! arbitrarily large attempt numbers clamp to the cap instead of
//! overflowing.

use std::time::Duration;

use proptest::prelude::*;

use chatsync::retry::{RetryOptions, wait_before_attempt};

fn opts(initial_ms: u64, max_ms: u64) -> RetryOptions {
    RetryOptions {
        initial_wait: Duration::from_millis(initial_ms),
        max_single_wait: Duration::from_millis(max_ms),
        ..RetryOptions::default()
    }
}

/// Wide-integer reference for the closed form. An exponent this side
/// of 100 cannot overflow `u128` for the generated inputs.
fn reference_ms(initial_ms: u64, max_ms: u64, attempt: u32) -> u128 {
    let exp = attempt - 1;
    if exp >= 100 {
        return u128::from(max_ms);
    }
    (u128::from(initial_ms) << exp).min(u128::from(max_ms))
}

proptest! {
    #[test]
    fn wait_matches_closed_form(
        initial_ms in 1_u64..10_000,
        max_ms in 1_u64..3_600_000,
        attempt in 1_u32..10_000,
    ) {
        let wait = wait_before_attempt(&opts(initial_ms, max_ms), attempt);
        prop_assert_eq!(
            wait.as_millis(),
            reference_ms(initial_ms, max_ms, attempt)
        );
    }

    #[test]
    fn wait_is_monotonic_in_attempt_number(
        initial_ms in 1_u64..10_000,
        max_ms in 1_u64..3_600_000,
        attempt in 1_u32..1_000,
    ) {
        let options = opts(initial_ms, max_ms);
        let here = wait_before_attempt(&options, attempt);
        let next = wait_before_attempt(&options, attempt + 1);
        prop_assert!(here <= next);
    }

    #[test]
    fn wait_never_exceeds_the_cap(
        initial_ms in 1_u64..u64::from(u32::MAX),
        max_ms in 1_u64..u64::from(u32::MAX),
        attempt in 1_u32..,
    ) {
        let wait = wait_before_attempt(&opts(initial_ms, max_ms), attempt);
        prop_assert!(wait <= Duration::from_millis(max_ms));
    }

    #[test]
    fn first_wait_is_the_initial_wait_or_the_cap(
        initial_ms in 1_u64..u64::from(u32::MAX),
        max_ms in 1_u64..u64::from(u32::MAX),
    ) {
        let wait = wait_before_attempt(&opts(initial_ms, max_ms), 1);
        prop_assert_eq!(wait, Duration::from_millis(initial_ms.min(max_ms)));
    }

    #[test]
    fn huge_attempt_numbers_saturate_to_the_cap(
        initial_ms in 1_u64..10_000,
        max_ms in 1_u64..3_600_000,
        attempt in 64_u32..,
    ) {
        let wait = wait_before_attempt(&opts(initial_ms, max_ms), attempt);
        prop_assert_eq!(wait, Duration::from_millis(max_ms));
    }
}
