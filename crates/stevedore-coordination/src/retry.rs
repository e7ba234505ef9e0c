//! Retry policies for tools and escalation classes.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Policy class used when nothing more specific is registered.
pub const DEFAULT_CLASS: &str = "default";

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Fixed,
    #[default]
    Exponential,
}

/// Retry policy for one tool or escalation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed,
            initial_delay: delay,
            max_delay: delay,
        }
    }

    pub fn exponential(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential,
            initial_delay,
            max_delay,
        }
    }

    /// Delay before retry number `retry` (1 for the first retry).
    ///
    /// Exponential backoff doubles from `initial_delay` and is capped at
    /// `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        match self.backoff {
            Backoff::Fixed => self.initial_delay,
            Backoff::Exponential => {
                let factor = 2u32.checked_pow(retry - 1).unwrap_or(u32::MAX);
                self.initial_delay
                    .checked_mul(factor)
                    .map_or(self.max_delay, |d| d.min(self.max_delay))
            }
        }
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// Built-in policies keyed by tool name or escalation class.
///
/// Escalated operations are already a second chance, so they get fewer
/// attempts and a fixed delay.
pub fn default_policies() -> BTreeMap<String, RetryPolicy> {
    BTreeMap::from([
        (
            "build_image".to_string(),
            RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(30)),
        ),
        (
            "deploy_kubernetes".to_string(),
            RetryPolicy::exponential(3, Duration::from_secs(2), Duration::from_secs(60)),
        ),
        (
            "escalated_build".to_string(),
            RetryPolicy::fixed(2, Duration::from_secs(5)),
        ),
        (
            "escalated_deploy".to_string(),
            RetryPolicy::fixed(2, Duration::from_secs(10)),
        ),
        (DEFAULT_CLASS.to_string(), RetryPolicy::default()),
    ])
}
