//! Reconnect backoff policies.
//!
//! Linear backoff is the default: base delay plus one second per failed
//! attempt, uncapped. Exponential backoff uses `backon` with jitter and is
//! capped at `max_delay_secs`.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use serde::{Deserialize, Serialize};

/// Backoff shape between connect attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectStrategy {
    /// `base + attempt` seconds.
    #[default]
    Linear,
    /// Doubling from `base`, with jitter, capped at `max`.
    Exponential,
}

/// Reconnect loop configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub strategy: ReconnectStrategy,
    pub base_delay_secs: u64,
    /// Only applies to the exponential strategy.
    pub max_delay_secs: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            strategy: ReconnectStrategy::Linear,
            base_delay_secs: 5,
            max_delay_secs: 30,
        }
    }
}

impl ReconnectPolicy {
    pub fn linear(base_delay_secs: u64) -> Self {
        Self {
            strategy: ReconnectStrategy::Linear,
            base_delay_secs,
            ..Default::default()
        }
    }

    pub fn exponential(base_delay_secs: u64, max_delay_secs: u64) -> Self {
        Self {
            strategy: ReconnectStrategy::Exponential,
            base_delay_secs,
            max_delay_secs,
        }
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    /// Fresh delay sequence for one reconnect cycle.
    ///
    /// The exponential sequence is finite; callers fall back to `max_delay()`.
    pub fn backoff(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        match self.strategy {
            ReconnectStrategy::Linear => {
                let base = self.base_delay_secs;
                Box::new((0u64..).map(move |attempt| Duration::from_secs(base.saturating_add(attempt))))
            }
            ReconnectStrategy::Exponential => Box::new(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_secs(self.base_delay_secs.max(1)))
                    .with_max_delay(self.max_delay())
                    .with_max_times(16)
                    .with_jitter()
                    .build(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_backoff_adds_one_second_per_attempt() {
        let delays: Vec<_> = ReconnectPolicy::linear(5).backoff().take(4).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(6),
                Duration::from_secs(7),
                Duration::from_secs(8),
            ]
        );
    }

    #[test]
    fn test_linear_backoff_is_uncapped() {
        let policy = ReconnectPolicy {
            max_delay_secs: 1,
            ..ReconnectPolicy::linear(5)
        };
        let tenth = policy.backoff().nth(9).unwrap();
        assert_eq!(tenth, Duration::from_secs(14));
    }

    #[test]
    fn test_exponential_backoff_respects_cap() {
        let policy = ReconnectPolicy::exponential(1, 4);
        // Jitter may add up to one extra delay on top of the capped value.
        for delay in policy.backoff() {
            assert!(delay <= Duration::from_secs(8), "delay {:?} above cap", delay);
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.strategy, ReconnectStrategy::Linear);
        assert_eq!(policy.base_delay_secs, 5);
    }
}
