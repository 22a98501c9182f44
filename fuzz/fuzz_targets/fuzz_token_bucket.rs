//! Fuzz testing for the token bucket arithmetic.
//!
//! Drives one bucket through arbitrary policies and clock movements and
//! checks the invariants every store relies on:
//!
//! - Tokens stay within `0..=burst`
//! - A rejection always carries a positive retry delay
//! - `remaining` never exceeds the burst size
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! cargo +nightly fuzz run fuzz_token_bucket -- -max_total_time=60
//! ```

#![no_main]

use api_gateway::rate_limiter::bucket::consume;
use api_gateway::routing::RateLimitPolicy;
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    requests_per_second: u16,
    burst_extra: u16,
    start_ms: u32,
    steps: Vec<u16>,
}

fuzz_target!(|input: Input| {
    let rps = u32::from(input.requests_per_second).max(1);
    let policy = RateLimitPolicy::new(rps, rps + u32::from(input.burst_extra));
    if policy.validate().is_err() {
        return;
    }

    let mut now = u64::from(input.start_ms);
    let mut state = None;
    for step in input.steps {
        // Odd steps move the clock backwards.
        if step % 2 == 1 {
            now = now.saturating_sub(u64::from(step));
        } else {
            now += u64::from(step);
        }

        let (next, result) = consume(state, &policy, now);
        assert!(next.tokens >= 0.0);
        assert!(next.tokens <= f64::from(policy.burst_size));
        assert!(result.remaining <= u64::from(policy.burst_size));
        if !result.allowed {
            assert!(result.retry_after_ms > 0);
            assert!(result.retry_after_secs() >= 1);
        }
        state = Some(next);
    }
});
