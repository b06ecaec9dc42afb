//! Policy and backend configuration for Tollgate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, TollgateError};

/// Admission algorithm selection.
///
/// The algorithm name is part of the storage key, so two algorithms never
/// read each other's state for the same logical key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    /// Counter reset at fixed intervals
    FixedWindow,
    /// Count of timestamped events in a trailing interval
    SlidingWindow,
    /// Continuously refilling capacity pool
    TokenBucket,
}

impl Algorithm {
    /// Name used in storage keys and configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed-window",
            Algorithm::SlidingWindow => "sliding-window",
            Algorithm::TokenBucket => "token-bucket",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fixed-window" => Ok(Algorithm::FixedWindow),
            "sliding-window" => Ok(Algorithm::SlidingWindow),
            "token-bucket" => Ok(Algorithm::TokenBucket),
            other => Err(TollgateError::InvalidConfig(format!(
                "Unrecognized algorithm: {}",
                other
            ))),
        }
    }
}

/// Admission policy: how many requests a key may make per time window.
///
/// A policy is immutable for the lifetime of the [`Limiter`](crate::Limiter)
/// it is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Maximum requests admitted within one window
    pub max_requests: u64,
    /// Length of the time window
    pub window: Duration,
    /// Admission algorithm
    pub algorithm: Algorithm,
}

impl Policy {
    /// Create a policy. Validation happens at limiter construction.
    pub fn new(max_requests: u64, window: Duration, algorithm: Algorithm) -> Self {
        Self {
            max_requests,
            window,
            algorithm,
        }
    }

    /// Fixed-window policy of `max_requests` per second.
    pub fn per_second(max_requests: u64) -> Self {
        Self::new(max_requests, Duration::from_secs(1), Algorithm::FixedWindow)
    }

    /// Fixed-window policy of `max_requests` per minute.
    pub fn per_minute(max_requests: u64) -> Self {
        Self::new(max_requests, Duration::from_secs(60), Algorithm::FixedWindow)
    }

    /// Fixed-window policy of `max_requests` per hour.
    pub fn per_hour(max_requests: u64) -> Self {
        Self::new(max_requests, Duration::from_secs(3600), Algorithm::FixedWindow)
    }

    /// Replace the admission algorithm.
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Check the construction-time invariants.
    pub fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(TollgateError::InvalidConfig(
                "max_requests must be positive".to_string(),
            ));
        }
        if self.window.is_zero() {
            return Err(TollgateError::InvalidConfig(
                "window duration must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Policy description in `RateLimit-Policy` header form:
    /// `"<limit>;w=<window-seconds>"`.
    pub fn description(&self) -> String {
        format!("{};w={}", self.max_requests, self.window.as_secs())
    }
}

/// Storage backend selection for a limiter.
#[derive(Debug, Clone, Default)]
pub enum Backend {
    /// In-process store, single instance only
    #[default]
    Memory,
    /// Shared Redis store for multi-instance deployments
    Redis {
        /// Connection URL, e.g. `redis://localhost:6379`
        url: String,
    },
}

/// On-disk limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Maximum requests admitted within one window
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Admission algorithm name
    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    /// Redis connection URL; the in-process store is used when absent
    #[serde(default)]
    pub redis_url: Option<String>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
            algorithm: default_algorithm(),
            redis_url: None,
        }
    }
}

fn default_max_requests() -> u64 {
    100
}

fn default_window_secs() -> u64 {
    60
}

fn default_algorithm() -> String {
    Algorithm::FixedWindow.as_str().to_string()
}

impl LimiterConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| TollgateError::InvalidConfig(e.to_string()))?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            TollgateError::InvalidConfig(format!("Failed to parse limiter config: {}", e))
        })
    }

    /// Convert into a validated [`Policy`].
    pub fn policy(&self) -> Result<Policy> {
        let algorithm = self.algorithm.parse()?;
        let policy = Policy::new(
            self.max_requests,
            Duration::from_secs(self.window_secs),
            algorithm,
        );
        policy.validate()?;
        Ok(policy)
    }

    /// Backend selected by this configuration.
    pub fn backend(&self) -> Backend {
        match &self.redis_url {
            Some(url) => Backend::Redis { url: url.clone() },
            None => Backend::Memory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_names_round_trip() {
        for algorithm in [
            Algorithm::FixedWindow,
            Algorithm::SlidingWindow,
            Algorithm::TokenBucket,
        ] {
            let parsed: Algorithm = algorithm.as_str().parse().unwrap();
            assert_eq!(parsed, algorithm);
        }
    }

    #[test]
    fn test_algorithm_rejects_unknown_name() {
        let result: Result<Algorithm> = "leaky-bucket".parse();
        assert!(matches!(result, Err(TollgateError::InvalidConfig(_))));
    }

    #[test]
    fn test_policy_validation() {
        assert!(Policy::per_minute(100).validate().is_ok());

        let zero_requests = Policy::new(0, Duration::from_secs(60), Algorithm::FixedWindow);
        assert!(zero_requests.validate().is_err());

        let zero_window = Policy::new(100, Duration::ZERO, Algorithm::FixedWindow);
        assert!(zero_window.validate().is_err());
    }

    #[test]
    fn test_policy_description_uses_actual_window() {
        assert_eq!(Policy::per_minute(100).description(), "100;w=60");
        assert_eq!(Policy::per_second(5).description(), "5;w=1");
        assert_eq!(
            Policy::new(10, Duration::from_secs(300), Algorithm::TokenBucket).description(),
            "10;w=300"
        );
    }

    #[test]
    fn test_config_from_yaml_with_defaults() {
        let config = LimiterConfig::from_yaml("max_requests: 50").unwrap();
        assert_eq!(config.max_requests, 50);
        assert_eq!(config.window_secs, 60);
        assert_eq!(config.algorithm, "fixed-window");
        assert!(config.redis_url.is_none());

        let policy = config.policy().unwrap();
        assert_eq!(policy.max_requests, 50);
        assert_eq!(policy.window, Duration::from_secs(60));
        assert_eq!(policy.algorithm, Algorithm::FixedWindow);
        assert!(matches!(config.backend(), Backend::Memory));
    }

    #[test]
    fn test_config_selects_redis_backend() {
        let yaml = r#"
max_requests: 10
window_secs: 1
algorithm: sliding-window
redis_url: redis://localhost:6379
"#;
        let config = LimiterConfig::from_yaml(yaml).unwrap();
        match config.backend() {
            Backend::Redis { url } => assert_eq!(url, "redis://localhost:6379"),
            Backend::Memory => panic!("expected redis backend"),
        }
    }

    #[test]
    fn test_config_rejects_bad_algorithm() {
        let config = LimiterConfig::from_yaml("algorithm: best-effort").unwrap();
        assert!(config.policy().is_err());
    }
}
