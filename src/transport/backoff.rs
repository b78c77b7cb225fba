use crate::defaults;
use std::time::Duration;

/// Exponential reconnect schedule: `base * 2^(attempt-1)`, capped at
/// `max_delay`, for at most `max_attempts` attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(defaults::RECONNECT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(defaults::RECONNECT_MAX_DELAY_MS),
            max_attempts: defaults::RECONNECT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Policy that never reconnects.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Delay before attempt number `attempt` (1-based), or `None` once the
    /// attempts are exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let multiplier = 2u32.saturating_pow(attempt - 1);
        let scaled = self.base_delay.saturating_mul(multiplier);
        Some(scaled.min(self.max_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, max_ms: u64, attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            max_attempts: attempts,
        }
    }

    #[test]
    fn test_delays_double() {
        let p = policy(500, 10_000, 5);
        let delays: Vec<u64> = (1..=3)
            .map(|a| p.delay_for(a).unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![500, 1000, 2000]);
    }

    #[test]
    fn test_delay_is_capped() {
        let p = policy(500, 3000, 10);
        assert_eq!(p.delay_for(4), Some(Duration::from_millis(3000)));
        assert_eq!(p.delay_for(10), Some(Duration::from_millis(3000)));
    }

    #[test]
    fn test_attempts_are_bounded() {
        let p = policy(500, 10_000, 5);
        assert!(p.delay_for(5).is_some());
        assert_eq!(p.delay_for(6), None);
        assert_eq!(p.delay_for(0), None);
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let p = policy(500, 10_000, u32::MAX);
        assert_eq!(p.delay_for(200), Some(Duration::from_millis(10_000)));
    }

    #[test]
    fn test_disabled_never_reconnects() {
        assert_eq!(ReconnectPolicy::disabled().delay_for(1), None);
    }
}
