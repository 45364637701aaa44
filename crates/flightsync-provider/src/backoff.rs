use std::time::Duration;

use flightsync_core::SyncSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            max_retries: settings.retry_attempts,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// A provider-supplied Retry-After wins when it asks for a longer pause.
    pub fn delay_with_hint(&self, attempt_index: u32, retry_after: Option<Duration>) -> Duration {
        let computed = self.delay_for_attempt(attempt_index);
        match retry_after {
            Some(hint) => computed.max(hint),
            None => computed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn retry_after_hint_extends_delay() {
        let policy = BackoffPolicy::default();
        assert_eq!(
            policy.delay_with_hint(0, Some(Duration::from_secs(30))),
            Duration::from_secs(30)
        );
        assert_eq!(
            policy.delay_with_hint(1, Some(Duration::from_millis(10))),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn retries_follow_tenant_settings() {
        let settings = SyncSettings {
            retry_attempts: 7,
            ..SyncSettings::default()
        };
        assert_eq!(BackoffPolicy::from_settings(&settings).max_retries, 7);
    }
}
