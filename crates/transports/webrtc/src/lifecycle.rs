//! Session replacement policy for the viewer engine
//!
//! When the viewer's session reports `disconnected` it is discarded and a
//! fresh one is built. This policy decides whether and when that happens.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shortest wait between two replacement attempts
///
/// Applies to every policy, `unbounded()` included.
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Reconnection policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectionPolicy {
    /// Maximum number of consecutive attempts; `None` retries forever (default: 5)
    pub max_retries: Option<u32>,
    /// Delay before the first attempt in milliseconds (default: 1000ms)
    pub backoff_initial_ms: u64,
    /// Upper bound of the delay in milliseconds (default: 30000ms)
    pub backoff_max_ms: u64,
    /// Growth factor between consecutive attempts (default: 2.0)
    pub backoff_multiplier: f64,
    /// Add up to a quarter of random spread to each delay (default: true)
    pub jitter_enabled: bool,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            max_retries: Some(5),
            backoff_initial_ms: 1000,
            backoff_max_ms: 30000,
            backoff_multiplier: 2.0,
            jitter_enabled: true,
        }
    }
}

impl ReconnectionPolicy {
    /// Rebuild as soon as possible, forever
    pub fn unbounded() -> Self {
        Self {
            max_retries: None,
            backoff_initial_ms: 0,
            backoff_max_ms: 0,
            backoff_multiplier: 1.0,
            jitter_enabled: false,
        }
    }

    /// Never rebuild a disconnected session
    pub fn disabled() -> Self {
        Self {
            max_retries: Some(0),
            ..Self::default()
        }
    }

    /// Wait before replacement attempt `attempt` (0-indexed)
    ///
    /// Grows geometrically from `backoff_initial_ms`, is capped by
    /// `backoff_max_ms` and never drops below [`MIN_RETRY_DELAY`].
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(64) as i32;
        let grown = self.backoff_initial_ms as f64 * self.backoff_multiplier.powi(exponent);
        let base_ms = (grown.min(self.backoff_max_ms as f64) as u64)
            .max(MIN_RETRY_DELAY.as_millis() as u64);

        let spread_ms = if self.jitter_enabled {
            rand::thread_rng().gen_range(0..=base_ms / 4)
        } else {
            0
        };
        Duration::from_millis(base_ms + spread_ms)
    }

    /// Whether attempt number `attempt` (0-indexed) is allowed
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_retries.map_or(true, |max| attempt < max)
    }

    /// Validate policy parameters
    pub fn validate(&self) -> crate::Result<()> {
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(crate::Error::InvalidConfig(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.backoff_initial_ms > self.backoff_max_ms {
            return Err(crate::Error::InvalidConfig(format!(
                "backoff_initial_ms ({}) must not exceed backoff_max_ms ({})",
                self.backoff_initial_ms, self.backoff_max_ms
            )));
        }
        Ok(())
    }
}
