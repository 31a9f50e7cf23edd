//! Exponential backoff bounded by a connection timeout (spec.md §4.10,
//! §5 "Transport connection has a configurable timeout (default 30s)").
//! Pure function of attempt count; the caller owns the actual sleep so
//! this crate never depends on a host async runtime.

use std::time::Duration;

#[derive(Clone, Copy, Debug)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub connection_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { base_delay: Duration::from_millis(250), connection_timeout: Duration::from_secs(30) }
    }
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, connection_timeout: Duration) -> Self {
        Self { base_delay, connection_timeout }
    }

    /// Delay before reconnect attempt `attempt` (0-indexed), doubling
    /// each time and capped at `connection_timeout`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let scaled = self.base_delay.as_millis().saturating_mul(factor as u128);
        let capped = scaled.min(self.connection_timeout.as_millis());
        Duration::from_millis(capped as u64)
    }
}
