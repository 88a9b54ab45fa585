//! Capped exponential backoff with jitter, used to space out probes of an
//! unhealthy server.

use std::time::Duration;

use rand::Rng;

/// Calculate exponential backoff delay with jitter.
///
/// `min(base * 2^(attempt-1), max)` plus up to 10% of that value.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let capped = ceiling_ms(attempt, base_ms, max_ms);

    let jitter_range = capped / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped + jitter)
}

fn ceiling_ms(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    if attempt == 0 {
        return 0;
    }
    let factor = 2u64.saturating_pow(attempt - 1);
    base_ms.saturating_mul(factor).min(max_ms)
}

/// Probe backoff policy for one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base_ms: base.as_millis() as u64,
            max_ms: max.as_millis() as u64,
        }
    }

    pub fn from_millis(base_ms: u64, max_ms: u64) -> Self {
        Self { base_ms, max_ms }
    }

    /// Delay before the next probe after `attempt` consecutive failures.
    pub fn delay(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, self.base_ms, self.max_ms)
    }

    /// The delay without jitter.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        Duration::from_millis(ceiling_ms(attempt, self.base_ms, self.max_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let b1 = calculate_backoff(1, 100, 2000);
        assert!(b1.as_millis() >= 100 && b1.as_millis() < 110);

        let b2 = calculate_backoff(2, 100, 2000);
        assert!(b2.as_millis() >= 200 && b2.as_millis() < 220);

        let max = calculate_backoff(10, 100, 1000);
        assert!(max.as_millis() >= 1000 && max.as_millis() < 1100);
    }

    #[test]
    fn zero_attempts_means_no_delay() {
        assert_eq!(calculate_backoff(0, 100, 1000), Duration::ZERO);
    }

    #[test]
    fn ceiling_is_monotonic_and_capped() {
        let backoff = Backoff::from_millis(10_000, 300_000);
        let mut previous = Duration::ZERO;
        for attempt in 1..40 {
            let ceiling = backoff.ceiling(attempt);
            assert!(ceiling >= previous);
            assert!(ceiling <= Duration::from_secs(300));
            previous = ceiling;
        }
        assert_eq!(backoff.ceiling(1), Duration::from_secs(10));
        assert_eq!(backoff.ceiling(6), Duration::from_secs(300));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let backoff = Backoff::from_millis(1_000, 60_000);
        for _ in 0..100 {
            let delay = backoff.delay(3);
            assert!(delay >= Duration::from_millis(4_000));
            assert!(delay < Duration::from_millis(4_400));
        }
    }
}
