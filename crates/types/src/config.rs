//! Configuration for the plaza storage layer.
//!
//! All config structs carry builder constructors with per-call defaults and a
//! `validate` method for post-deserialization checks. The reconciler's cadence
//! and drift threshold are tunables, not contracts — deployments pick values
//! appropriate to their fan-out failure rates.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Configuration validation error.
///
/// Returned when a configuration value is outside its valid range or
/// violates a cross-field constraint.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// A configuration value is invalid.
    #[snafu(display("invalid config: {message}"))]
    Validation {
        /// Description of the validation failure.
        message: String,
    },
}

/// Retry policy for must-succeed primary writes.
#[derive(Debug, Clone, PartialEq, bon::Builder, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    #[builder(default = 3)]
    pub max_attempts: u32,

    /// Initial backoff duration before the first retry.
    #[builder(default = Duration::from_millis(100))]
    pub initial_backoff: Duration,

    /// Maximum backoff duration.
    #[builder(default = Duration::from_secs(10))]
    pub max_backoff: Duration,

    /// Backoff multiplier for exponential increase.
    #[builder(default = 2.0)]
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0) for randomizing backoff.
    #[builder(default = 0.25)]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Creates a policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self { max_attempts: 1, ..Default::default() }
    }

    /// Validates the policy values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if `max_attempts` is zero, the
    /// multiplier is below 1.0, or the jitter factor is outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation {
                message: "max_attempts must be at least 1".to_string(),
            });
        }
        if self.multiplier < 1.0 {
            return Err(ConfigError::Validation {
                message: format!("multiplier {} must be >= 1.0", self.multiplier),
            });
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Validation {
                message: format!("jitter {} must be within [0.0, 1.0]", self.jitter),
            });
        }
        Ok(())
    }
}

/// Fan-out writer configuration.
#[derive(Debug, Clone, PartialEq, bon::Builder, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// Upper bound on follower-timeline rows written per post.
    ///
    /// When the follower list exceeds this bound the inline fan-out is
    /// truncated and a timeline completion task is queued for the
    /// reconciler; the bound keeps one mutation's latency independent of
    /// pathological follower counts.
    #[builder(default = 10_000)]
    pub max_timeline_fanout: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl FanoutConfig {
    /// Validates the fan-out configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if `max_timeline_fanout` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_timeline_fanout == 0 {
            return Err(ConfigError::Validation {
                message: "max_timeline_fanout must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Reconciler configuration.
#[derive(Debug, Clone, PartialEq, bon::Builder, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Pause between background passes.
    #[builder(default = Duration::from_secs(30))]
    pub interval: Duration,

    /// Absolute counter drift (vs. the edge-store recount) tolerated before
    /// a corrective delta is applied.
    #[builder(default = 0)]
    pub drift_tolerance: i64,

    /// Repair tasks are dropped after this many failed replay attempts.
    #[builder(default = 8)]
    pub max_attempts: u32,

    /// Maximum repair tasks replayed per pass.
    #[builder(default = 256)]
    pub batch: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ReconcilerConfig {
    /// Validates the reconciler configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the drift tolerance is
    /// negative or the batch size is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.drift_tolerance < 0 {
            return Err(ConfigError::Validation {
                message: format!("drift_tolerance {} must be >= 0", self.drift_tolerance),
            });
        }
        if self.batch == 0 {
            return Err(ConfigError::Validation {
                message: "batch must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Limits applied by entity validation.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Maximum post text length in UTF-8 bytes.
    #[builder(default = 64 * 1024)]
    pub max_text_bytes: usize,

    /// Maximum discussion title length in UTF-8 bytes.
    #[builder(default = 256)]
    pub max_title_bytes: usize,

    /// Maximum nick length in UTF-8 bytes.
    #[builder(default = 40)]
    pub max_nick_bytes: usize,

    /// Maximum slug length in UTF-8 bytes.
    #[builder(default = 64)]
    pub max_slug_bytes: usize,

    /// Maximum display-name length in UTF-8 bytes.
    #[builder(default = 128)]
    pub max_name_bytes: usize,

    /// Maximum entries in a user's extension map.
    #[builder(default = 64)]
    pub max_extended_entries: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Top-level configuration for the storage layer.
#[derive(Debug, Clone, Default, PartialEq, bon::Builder, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Retry policy for must-succeed primary writes.
    #[serde(default)]
    #[builder(default)]
    pub retry: RetryPolicy,

    /// Fan-out writer tunables.
    #[serde(default)]
    #[builder(default)]
    pub fanout: FanoutConfig,

    /// Reconciler tunables.
    #[serde(default)]
    #[builder(default)]
    pub reconciler: ReconcilerConfig,

    /// Entity validation limits.
    #[serde(default)]
    #[builder(default)]
    pub validation: ValidationConfig,
}

impl StoreConfig {
    /// Validates all nested configuration sections.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::Validation`] found in any section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate()?;
        self.fanout.validate()?;
        self.reconciler.validate()?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        StoreConfig::default().validate().expect("defaults must validate");
    }

    #[test]
    fn test_retry_policy_rejects_zero_attempts() {
        let policy = RetryPolicy { max_attempts: 0, ..Default::default() };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_retry_policy_rejects_bad_jitter() {
        let policy = RetryPolicy { jitter: 1.5, ..Default::default() };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_no_retry_is_single_attempt() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts, 1);
        policy.validate().expect("no_retry must validate");
    }

    #[test]
    fn test_reconciler_rejects_negative_tolerance() {
        let config = ReconcilerConfig { drift_tolerance: -1, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fanout_rejects_zero_bound() {
        let config = FanoutConfig { max_timeline_fanout: 0 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_overrides() {
        let config = ReconcilerConfig::builder()
            .interval(Duration::from_secs(5))
            .drift_tolerance(2)
            .build();
        assert_eq!(config.interval, Duration::from_secs(5));
        assert_eq!(config.drift_tolerance, 2);
        assert_eq!(config.max_attempts, 8);
    }
}
