//! Restart gate and exponential backoff between supervision cycles.
//!
//! The delay before a cycle is `backoff_factor × 2^restart_count` and is only applied
//! once at least one failure has been recorded. There is no cap and no jitter: a
//! command that keeps crashing is throttled harder and harder. Delays too large for a
//! [`Duration`] saturate at [`Duration::MAX`].

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxRestarts {
    Unlimited,
    Limited(u32),
}

impl MaxRestarts {
    /// `-1` means unlimited; any other negative value is rejected.
    pub fn from_raw(value: i64) -> Option<Self> {
        match value {
            -1 => Some(Self::Unlimited),
            v if v >= 0 => u32::try_from(v).ok().map(Self::Limited),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i64 {
        match self {
            Self::Unlimited => -1,
            Self::Limited(max) => i64::from(max),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartPolicy {
    pub max_restarts: MaxRestarts,
    pub backoff_factor: f64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: MaxRestarts::Unlimited,
            backoff_factor: 1.0,
        }
    }
}

impl RestartPolicy {
    pub fn should_restart(&self, restart_count: u32) -> bool {
        should_restart(restart_count, self.max_restarts)
    }

    pub fn next_delay(&self, restart_count: u32) -> Duration {
        next_delay(restart_count, self.backoff_factor)
    }
}

/// Gate evaluated before every cycle, the first one included.
///
/// `restart_count` is the number of failures seen so far, so a limit of `N` allows the
/// first launch plus `N` restarts and refuses the cycle after the `(N+1)`th failure.
pub fn should_restart(restart_count: u32, max_restarts: MaxRestarts) -> bool {
    match max_restarts {
        MaxRestarts::Unlimited => true,
        MaxRestarts::Limited(max) => restart_count <= max,
    }
}

pub fn next_delay(restart_count: u32, backoff_factor: f64) -> Duration {
    if restart_count == 0 {
        return Duration::ZERO;
    }
    let exponent = restart_count.min(i32::MAX as u32) as i32;
    let secs = backoff_factor * 2f64.powi(exponent);
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_launch_has_no_delay() {
        assert_eq!(next_delay(0, 1.0), Duration::ZERO);
        assert_eq!(next_delay(0, 30.0), Duration::ZERO);
    }

    #[test]
    fn delay_doubles_per_failure() {
        assert_eq!(next_delay(1, 1.0), Duration::from_secs(2));
        assert_eq!(next_delay(2, 1.0), Duration::from_secs(4));
        assert_eq!(next_delay(3, 1.0), Duration::from_secs(8));
        assert_eq!(next_delay(3, 0.5), Duration::from_secs(4));
        assert_eq!(next_delay(5, 0.0), Duration::ZERO);
    }

    #[test]
    fn delay_grows_without_bound() {
        let mut previous = Duration::ZERO;
        for count in 1..=40 {
            let delay = next_delay(count, 1.0);
            assert!(delay > previous, "count {count} did not grow");
            previous = delay;
        }
        assert_eq!(next_delay(40, 1.0), Duration::from_secs(1 << 40));
        assert_eq!(next_delay(5_000, 1.0), Duration::MAX);
        assert_eq!(next_delay(u32::MAX, 1.0), Duration::MAX);
    }

    #[test]
    fn unlimited_never_refuses() {
        for count in [0, 1, 100, u32::MAX] {
            assert!(should_restart(count, MaxRestarts::Unlimited));
        }
    }

    #[test]
    fn limit_allows_first_launch_plus_n_restarts() {
        let limit = MaxRestarts::Limited(2);
        assert!(should_restart(0, limit));
        assert!(should_restart(1, limit));
        assert!(should_restart(2, limit));
        assert!(!should_restart(3, limit));

        assert!(should_restart(0, MaxRestarts::Limited(0)));
        assert!(!should_restart(1, MaxRestarts::Limited(0)));
    }

    #[test]
    fn raw_limits_round_trip_the_cli_convention() {
        assert_eq!(MaxRestarts::from_raw(-1), Some(MaxRestarts::Unlimited));
        assert_eq!(MaxRestarts::from_raw(3), Some(MaxRestarts::Limited(3)));
        assert_eq!(MaxRestarts::from_raw(-2), None);
        assert_eq!(MaxRestarts::from_raw(i64::MAX), None);
        assert_eq!(MaxRestarts::Limited(7).as_raw(), 7);
        assert_eq!(MaxRestarts::Unlimited.as_raw(), -1);
    }

    #[test]
    fn policy_delegates_to_free_functions() {
        let policy = RestartPolicy {
            max_restarts: MaxRestarts::Limited(1),
            backoff_factor: 1.5,
        };
        assert!(policy.should_restart(1));
        assert!(!policy.should_restart(2));
        assert_eq!(policy.next_delay(1), Duration::from_secs(3));
    }
}
