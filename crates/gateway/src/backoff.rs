use std::time::Duration;

/// Exponential reconnect delay: `min(base * 2^(n-1), max)` for attempt `n >= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(castle_protocol::RECONNECT_BASE_MS),
            max: Duration::from_millis(castle_protocol::RECONNECT_MAX_MS),
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before attempt `attempt`. Attempt 0 (nothing failed yet) is immediate.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let backoff = Backoff::default();
        let delays: Vec<u128> = (1..=7).map(|n| backoff.delay(n).as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[test]
    fn matches_closed_form() {
        let backoff = Backoff::default();
        for n in 1..=64u32 {
            let expected = 1000u128
                .saturating_mul(1u128.checked_shl(n - 1).unwrap_or(u128::MAX))
                .min(30_000);
            assert_eq!(backoff.delay(n).as_millis(), expected, "attempt {n}");
        }
    }

    #[test]
    fn zero_attempt_is_immediate() {
        assert_eq!(Backoff::default().delay(0), Duration::ZERO);
    }
}
