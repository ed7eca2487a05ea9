//! Reconnect backoff.

use std::time::Duration;

/// Delay before reconnect attempt `attempt` (1-based): `base * 2^(attempt-1)`.
pub fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent)
}
