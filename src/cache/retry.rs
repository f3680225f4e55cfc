/// Backoff policy for images that failed to fetch.
///
/// The wait grows with the fourth power of the failure count, so ten
/// attempts span roughly a week:
/// 1min, 16min, 1.3h, 4.2h, 10.5h, 21.6h, 40h, 2.8d, 4.5d, 1wk.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retry: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retry: 10 }
    }
}

impl RetryPolicy {
    pub fn new(max_retry: u32) -> Self {
        Self { max_retry }
    }

    /// Seconds to wait after `failure_count` failures.
    pub fn delay(&self, failure_count: u32) -> u64 {
        u64::from(failure_count)
            .saturating_pow(4)
            .saturating_mul(60)
    }

    pub fn is_abandoned(&self, failure_count: u32) -> bool {
        failure_count > self.max_retry
    }

    pub fn is_due(&self, failure_count: u32, last_attempt: i64, now: i64) -> bool {
        if self.is_abandoned(failure_count) {
            return false;
        }

        let elapsed = now.saturating_sub(last_attempt);
        elapsed > 0 && elapsed as u64 > self.delay(failure_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_follows_fourth_power_schedule() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay(1), 60);
        assert_eq!(policy.delay(2), 960);
        assert_eq!(policy.delay(3), 4_860);
        assert_eq!(policy.delay(10), 600_000);
        // Within rounding of a week
        assert!((policy.delay(10) as i64 - 604_800).abs() < 5_000);
    }

    #[test]
    fn delay_is_strictly_increasing() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=10).map(|n| policy.delay(n)).collect();

        assert!(delays.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn due_only_after_delay_has_passed() {
        let policy = RetryPolicy::default();

        assert!(!policy.is_due(1, 1_000, 1_060));
        assert!(policy.is_due(1, 1_000, 1_061));
        assert!(!policy.is_due(2, 1_000, 1_000 + 960));
        assert!(policy.is_due(2, 1_000, 1_000 + 961));
    }

    #[test]
    fn abandoned_entries_are_never_due() {
        let policy = RetryPolicy::new(10);

        assert!(!policy.is_abandoned(10));
        assert!(policy.is_due(10, 0, 700_000));
        assert!(policy.is_abandoned(11));
        assert!(!policy.is_due(11, 0, i64::MAX));
    }

    #[test]
    fn huge_counts_saturate() {
        let policy = RetryPolicy::new(u32::MAX);
        assert_eq!(policy.delay(u32::MAX), u64::MAX);
    }
}
