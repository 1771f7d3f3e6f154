//! Jittered exponential backoff shared by the polling loop and retry
//! scheduling: `calculate_backoff(n) = base * 2^(n-1) * (1 +/- 10%)`.

use rand::Rng;
use std::time::Duration;

/// `base * 2^(n-1) * (1 + U(-0.1, +0.1))`, truncated to integer
/// milliseconds. `n` is 1-indexed (the first failure passes `n = 1`).
pub fn calculate_backoff(base_ms: u64, n: u32) -> Duration {
    let n = n.max(1);
    let exp = 2f64.powi((n - 1) as i32);
    let jitter = 1.0 + rand::thread_rng().gen_range(-0.1..=0.1);
    let ms = (base_ms as f64 * exp * jitter).max(0.0) as u64;
    Duration::from_millis(ms)
}

/// `calculate_backoff` capped at `max_ms` — used for the polling loop's
/// error backoff (`min(calculateBackoff(errorCount+1), maxErrorBackoffMs)`).
pub fn calculate_backoff_capped(base_ms: u64, n: u32, max_ms: u64) -> Duration {
    calculate_backoff(base_ms, n).min(Duration::from_millis(max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_within_jitter() {
        for n in 1..=6 {
            let d = calculate_backoff(1000, n).as_millis() as f64;
            let expected = 1000.0 * 2f64.powi((n - 1) as i32);
            assert!(d >= expected * 0.9 - 1.0, "n={n} d={d} expected~{expected}");
            assert!(d <= expected * 1.1 + 1.0, "n={n} d={d} expected~{expected}");
        }
    }

    #[test]
    fn capped_never_exceeds_max() {
        for _ in 0..50 {
            let d = calculate_backoff_capped(1000, 10, 30_000);
            assert!(d.as_millis() <= 30_000);
        }
    }
}
