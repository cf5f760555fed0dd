//! Retry backoff (§4.2, §8): `delay = min(1000 * 2^retryCount, 60000)` ms.

/// Milliseconds to wait before the next attempt after `retry_count` prior
/// failures. `retry_count` is the number of attempts already made (0 on the
/// first failure), so the first retry is delayed 1s, doubling each time up
/// to a 60s ceiling.
pub fn backoff_delay_ms(retry_count: u32) -> i64 {
    let base: i64 = 1000;
    let shifted = base.saturating_mul(1i64.checked_shl(retry_count).unwrap_or(i64::MAX));
    shifted.min(60_000)
}
