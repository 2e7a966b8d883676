//! Retry delay: decides how long a failed item waits before it is eligible again.

use std::time::Duration;

use rand::Rng;

use super::options::{DelayPolicy, RetrySettings};

/// Upper bound (exclusive) of the random part added to exponential delays.
pub const MAX_JITTER: Duration = Duration::from_millis(300);

/// Computes retry delays from `RetrySettings`.
///
/// Example with the defaults (`retry_delay = 3s`, `retry_max_delay = 10s`):
///
/// | attempt | Constant | Linear | Exponential |
/// |---|---|---|---|
/// | 1 | 3s | 3s | 2s + jitter |
/// | 2 | 3s | 6s | 4s + jitter |
/// | 3 | 3s | 9s | 8s + jitter |
/// | 4 | 3s | 10s | 10s + jitter |
#[derive(Debug, Clone, Copy)]
pub struct RetryDelayComputer {
    jitter: bool,
}

impl Default for RetryDelayComputer {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryDelayComputer {
    pub fn new() -> Self {
        Self { jitter: true }
    }

    /// Same delays with the random part switched off.
    pub fn without_jitter() -> Self {
        Self { jitter: false }
    }

    /// Delay before attempt number `attempt` (1-indexed; the value of
    /// `retry_count` after it was incremented).
    pub fn next_delay(&self, settings: &RetrySettings, attempt: i32) -> Duration {
        let base = base_delay(settings, attempt);
        if self.jitter && settings.delay_policy == DelayPolicy::Exponential {
            base + jitter()
        } else {
            base
        }
    }
}

fn base_delay(settings: &RetrySettings, attempt: i32) -> Duration {
    let attempt = u32::try_from(attempt).unwrap_or(0);
    match settings.delay_policy {
        DelayPolicy::Constant => settings.retry_delay,
        DelayPolicy::Linear => settings
            .retry_delay
            .checked_mul(attempt)
            .map_or(settings.retry_max_delay, |d| d.min(settings.retry_max_delay)),
        DelayPolicy::Exponential => 2u64
            .checked_pow(attempt)
            .map(Duration::from_secs)
            .map_or(settings.retry_max_delay, |d| d.min(settings.retry_max_delay)),
    }
}

fn jitter() -> Duration {
    let millis = rand::thread_rng().gen_range(0..MAX_JITTER.as_millis() as u64);
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn settings(policy: DelayPolicy) -> RetrySettings {
        RetrySettings {
            delay_policy: policy,
            ..RetrySettings::default()
        }
    }

    #[rstest]
    #[case(DelayPolicy::Constant, 1, 3)]
    #[case(DelayPolicy::Constant, 7, 3)]
    #[case(DelayPolicy::Linear, 1, 3)]
    #[case(DelayPolicy::Linear, 3, 9)]
    #[case(DelayPolicy::Linear, 4, 10)]
    #[case(DelayPolicy::Exponential, 1, 2)]
    #[case(DelayPolicy::Exponential, 3, 8)]
    #[case(DelayPolicy::Exponential, 4, 10)]
    fn delays_follow_the_policy(
        #[case] policy: DelayPolicy,
        #[case] attempt: i32,
        #[case] expected_secs: u64,
    ) {
        let computer = RetryDelayComputer::without_jitter();
        assert_eq!(
            computer.next_delay(&settings(policy), attempt),
            Duration::from_secs(expected_secs)
        );
    }

    #[test]
    fn huge_attempts_saturate_at_max_delay() {
        let computer = RetryDelayComputer::without_jitter();
        let linear = RetrySettings {
            retry_delay: Duration::MAX,
            ..settings(DelayPolicy::Linear)
        };

        assert_eq!(computer.next_delay(&linear, 2), Duration::from_secs(10));
        assert_eq!(
            computer.next_delay(&settings(DelayPolicy::Exponential), i32::MAX),
            Duration::from_secs(10)
        );
        assert_eq!(
            computer.next_delay(&settings(DelayPolicy::Linear), i32::MAX),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn exponential_jitter_stays_below_bound() {
        let computer = RetryDelayComputer::new();
        let exp = settings(DelayPolicy::Exponential);

        for _ in 0..200 {
            let delay = computer.next_delay(&exp, 1);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay < Duration::from_secs(2) + MAX_JITTER);
        }
    }

    #[test]
    fn jitter_only_applies_to_exponential() {
        let computer = RetryDelayComputer::new();
        assert_eq!(
            computer.next_delay(&settings(DelayPolicy::Constant), 5),
            Duration::from_secs(3)
        );
    }
}
