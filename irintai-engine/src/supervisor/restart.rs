//! Restart policy for crashed model processes

use std::time::Duration;

use crate::config::RestartConfig;

/// Fixed-backoff policy with a bounded number of consecutive attempts.
///
/// A process that stayed up for at least `stable_after` is treated as having
/// recovered, so its exit starts a fresh series of attempts.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    max_attempts: u32,
    backoff: Duration,
    stable_after: Duration,
    attempts: u32,
}

impl RestartPolicy {
    pub fn new(max_attempts: u32, backoff: Duration, stable_after: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
            stable_after,
            attempts: 0,
        }
    }

    pub fn from_config(config: &RestartConfig) -> Self {
        Self::new(config.max_attempts, config.backoff, config.stable_after)
    }

    /// Record an exit after `uptime` and decide whether to respawn.
    ///
    /// Returns `Some((attempt, delay))` with the 1-based attempt number, or
    /// `None` once the attempts are exhausted.
    pub fn on_exit(&mut self, uptime: Duration) -> Option<(u32, Duration)> {
        if uptime >= self.stable_after {
            self.attempts = 0;
        }

        if self.attempts >= self.max_attempts {
            return None;
        }

        self.attempts += 1;
        Some((self.attempts, self.backoff))
    }

    /// Attempts made in the current series.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from_config(&RestartConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RestartPolicy {
        RestartPolicy::new(3, Duration::from_secs(2), Duration::from_secs(10))
    }

    #[test]
    fn allows_three_quick_restarts_then_gives_up() {
        let mut policy = policy();
        let quick = Duration::from_millis(50);

        assert_eq!(policy.on_exit(quick), Some((1, Duration::from_secs(2))));
        assert_eq!(policy.on_exit(quick), Some((2, Duration::from_secs(2))));
        assert_eq!(policy.on_exit(quick), Some((3, Duration::from_secs(2))));
        assert_eq!(policy.on_exit(quick), None);
        assert_eq!(policy.attempts(), 3);
    }

    #[test]
    fn stable_uptime_starts_new_series() {
        let mut policy = policy();
        let quick = Duration::from_millis(50);

        policy.on_exit(quick);
        policy.on_exit(quick);
        assert_eq!(policy.attempts(), 2);

        assert_eq!(
            policy.on_exit(Duration::from_secs(30)),
            Some((1, Duration::from_secs(2)))
        );
    }

    #[test]
    fn zero_attempts_never_restarts() {
        let mut policy = RestartPolicy::new(0, Duration::ZERO, Duration::from_secs(1));
        assert_eq!(policy.on_exit(Duration::ZERO), None);
    }

    #[test]
    fn default_matches_config_defaults() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
    }
}
