//! Exponential backoff with jitter for repeatedly failing source calls.
//!
//! ```text
//! delay = min(base * 2^(failures-1), max) + random_jitter(0..=250ms)
//! ```

use rand::{Rng, rng};
use std::time::Duration;

const MAX_JITTER_MS: u64 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            max: Duration::from_secs(30),
        }
    }

    /// No delay at all between failures.
    pub fn none() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn is_disabled(&self) -> bool {
        self.base.is_zero()
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        if self.is_disabled() || failures == 0 {
            return Duration::ZERO;
        }
        let shift = (failures - 1).min(16);
        let delay = self.base.saturating_mul(1 << shift).min(self.max);
        let jitter_ms: u64 = rng().random_range(0..=MAX_JITTER_MS);
        delay + Duration::from_millis(jitter_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_backoff_never_waits() {
        let backoff = Backoff::none();
        assert_eq!(backoff.delay(1), Duration::ZERO);
        assert_eq!(backoff.delay(10), Duration::ZERO);
    }

    #[test]
    fn test_delay_doubles_per_failure() {
        let backoff = Backoff::new(Duration::from_millis(100));
        let jitter = Duration::from_millis(MAX_JITTER_MS);

        let first = backoff.delay(1);
        let base = Duration::from_millis(100);
        assert!(first >= base && first <= base + jitter);

        let third = backoff.delay(3);
        let base = Duration::from_millis(400);
        assert!(third >= base && third <= base + jitter);
    }

    #[test]
    fn test_delay_is_capped() {
        let backoff = Backoff::new(Duration::from_secs(1));
        let delay = backoff.delay(40);
        assert!(delay <= Duration::from_secs(30) + Duration::from_millis(MAX_JITTER_MS));
        assert!(delay >= Duration::from_secs(30));
    }
}
