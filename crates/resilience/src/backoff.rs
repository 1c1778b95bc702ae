//! Exponential backoff with jitter.

use std::time::Duration;

use rand::RngExt;

/// Delay before retry number `attempt` (1-based).
///
/// `base * 2^(attempt-1)` plus up to 10% random jitter, never above `max`.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let base_ms = base.as_millis() as u64;
    let max_ms = max.as_millis() as u64;

    let exponential = 2u64.saturating_pow(attempt - 1);
    let capped = base_ms.saturating_mul(exponential).min(max_ms);

    let jitter_range = capped / 10;
    let jitter = if jitter_range > 0 {
        rand::rng().random_range(0..=jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped.saturating_add(jitter).min(max_ms))
}
