//! Per-stage resilience policies.

use crate::errors::RegistryValidationError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a stage is retried, bounded and recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResiliencePolicy {
    /// Maximum attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Per-attempt timeout, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Whether exhaustion may be papered over with a fallback value.
    #[serde(default)]
    pub fallback_allowed: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2000
}

fn default_timeout_ms() -> u64 {
    60_000
}

impl Default for ResiliencePolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            timeout_ms: default_timeout_ms(),
            fallback_allowed: false,
        }
    }
}

impl ResiliencePolicy {
    /// Creates a policy with the default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout: u64) -> Self {
        self.timeout_ms = timeout;
        self
    }

    /// Allows a fallback value on exhaustion.
    #[must_use]
    pub fn with_fallback(mut self) -> Self {
        self.fallback_allowed = true;
        self
    }

    /// Returns the base delay as a duration.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Returns the timeout as a duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Worst-case time the stage can take, given a jitter ceiling.
    ///
    /// Counts every attempt running to its timeout plus every backoff
    /// sleep at its maximum.
    #[must_use]
    pub fn worst_case(&self, max_jitter: Duration) -> Duration {
        let attempts = self.max_attempts.max(1);
        let mut total = self.timeout() * attempts;
        for attempt in 1..attempts {
            total += self.base_delay() * 2u32.saturating_pow(attempt - 1) + max_jitter;
        }
        total
    }

    /// Validates the policy for a named stage.
    ///
    /// # Errors
    ///
    /// Returns an error if attempts, delay or timeout are zero.
    pub fn validate(&self, stage: &str) -> Result<(), RegistryValidationError> {
        if self.max_attempts == 0 {
            return Err(RegistryValidationError::new(format!(
                "Stage '{stage}' must allow at least one attempt"
            ))
            .with_stage(stage));
        }
        if self.base_delay_ms == 0 {
            return Err(RegistryValidationError::new(format!(
                "Stage '{stage}' must have a positive base delay"
            ))
            .with_stage(stage));
        }
        if self.timeout_ms == 0 {
            return Err(RegistryValidationError::new(format!(
                "Stage '{stage}' must have a positive timeout"
            ))
            .with_stage(stage));
        }
        Ok(())
    }
}

/// A partial policy used to override registry defaults from config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOverride {
    /// Replacement attempt count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Replacement base delay in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_delay_ms: Option<u64>,
    /// Replacement timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Replacement fallback flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_allowed: Option<bool>,
}

impl PolicyOverride {
    /// Applies the override on top of a policy.
    #[must_use]
    pub fn apply(&self, policy: ResiliencePolicy) -> ResiliencePolicy {
        ResiliencePolicy {
            max_attempts: self.max_attempts.unwrap_or(policy.max_attempts),
            base_delay_ms: self.base_delay_ms.unwrap_or(policy.base_delay_ms),
            timeout_ms: self.timeout_ms.unwrap_or(policy.timeout_ms),
            fallback_allowed: self.fallback_allowed.unwrap_or(policy.fallback_allowed),
        }
    }

    /// Layers `other` on top of this override; fields set in `other` win.
    #[must_use]
    pub fn then(self, other: Self) -> Self {
        Self {
            max_attempts: other.max_attempts.or(self.max_attempts),
            base_delay_ms: other.base_delay_ms.or(self.base_delay_ms),
            timeout_ms: other.timeout_ms.or(self.timeout_ms),
            fallback_allowed: other.fallback_allowed.or(self.fallback_allowed),
        }
    }
}
