use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::ConfigurationError;

/// Backoff applied between failed long-poll attempts
///
/// Retries are unlimited: a watch loop never gives up on a store that is
/// temporarily unreachable, it only slows down.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure (unit: milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound of the delay (unit: milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor applied per consecutive failure
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,

    /// Add up to 50% random jitter on top of the computed delay
    #[serde(default)]
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: false,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after `failures` consecutive failures.
    ///
    /// Returns `Duration::ZERO` when `failures` is 0.
    pub fn delay(
        &self,
        failures: u32,
    ) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let max = self.max_delay_ms;
        let mut delay = self.base_delay_ms.min(max);
        for _ in 1..failures {
            if delay >= max {
                break;
            }
            delay = delay.saturating_mul(self.multiplier as u64).min(max);
        }

        if self.jitter && delay > 0 {
            delay += rand::thread_rng().gen_range(0..=delay / 2);
        }

        Duration::from_millis(delay)
    }

    pub(crate) fn validate(&self) -> std::result::Result<(), ConfigurationError> {
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigurationError::Invalid(format!(
                "backoff max_delay_ms ({}) must be >= base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        if self.multiplier == 0 {
            return Err(ConfigurationError::Invalid("backoff multiplier cannot be 0".into()));
        }
        Ok(())
    }
}

fn default_base_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_multiplier() -> u32 {
    2
}
