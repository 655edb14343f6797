//! Configuration of the rate limiter.
//!
//! ```yaml
//! enabled: true
//! multiplier: 1.0
//! namespace: rl
//! fallback:
//!   reprobe_after_secs: 30
//! secondary:
//!   capacity: 300
//!   refill_amount: 300
//!   refill_interval_sec: 60
//! policies:
//!   create_listing:
//!     community: { capacity: 5, refill_amount: 5, refill_interval_sec: 60 }
//! audience_markers:
//!   campus: [university, college]
//! ```

use crate::policy::{
    validate_multiplier, Audience, Policy, PolicyError, PolicyOverrides, PolicyTable,
    DEFAULT_SECONDARY_POLICY,
};
use crate::resolver::FallbackMode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const ENV_ENABLED: &str = "RATE_LIMIT_ENABLED";
pub const ENV_MULTIPLIER: &str = "RATE_LIMIT_MULTIPLIER";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse rate limit config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Global kill switch; when false every request is allowed without touching any store.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Scales every capacity and refill amount.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Prefix of every bucket key.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub fallback: FallbackConfig,

    /// The coarse per-IP gate shared by every kind.
    #[serde(default = "default_secondary")]
    pub secondary: Policy,

    /// Overrides of the built-in policy table.
    #[serde(default)]
    pub policies: PolicyOverrides,

    /// Overrides of the built-in audience markers.
    #[serde(default)]
    pub audience_markers: HashMap<Audience, Vec<String>>,

    /// Mixed into every hashed subject.
    #[serde(default)]
    pub subject_salt: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            multiplier: default_multiplier(),
            namespace: default_namespace(),
            fallback: FallbackConfig::default(),
            secondary: default_secondary(),
            policies: PolicyOverrides::new(),
            audience_markers: HashMap::new(),
            subject_salt: String::new(),
        }
    }
}

/// What to do once the shared store has failed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Retry the shared store after this many seconds. When unset the in-memory engine is used
    /// for the rest of the process lifetime.
    #[serde(default)]
    pub reprobe_after_secs: Option<u64>,
}

impl FallbackConfig {
    pub fn mode(&self) -> FallbackMode {
        match self.reprobe_after_secs {
            None => FallbackMode::Pinned,
            Some(secs) => FallbackMode::Reprobe(Duration::from_secs(secs)),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_multiplier() -> f64 {
    1.0
}

fn default_namespace() -> String {
    "rl".to_string()
}

fn default_secondary() -> Policy {
    DEFAULT_SECONDARY_POLICY
}

impl RateLimitConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        log::info!("Loading rate limit configuration from {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: RateLimitConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `RATE_LIMIT_ENABLED` and `RATE_LIMIT_MULTIPLIER` from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = var(ENV_ENABLED) {
            self.enabled = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        name: ENV_ENABLED,
                        value,
                    })
                }
            };
        }
        if let Some(value) = var(ENV_MULTIPLIER) {
            self.multiplier = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                name: ENV_MULTIPLIER,
                value: value.clone(),
            })?;
        }
        self.validate()
    }

    /// Checks every policy, so that misconfiguration fails at startup rather than per request.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.policy_table()?;
        self.secondary_params()?;
        Ok(())
    }

    pub fn policy_table(&self) -> Result<PolicyTable, PolicyError> {
        PolicyTable::new(&self.policies, self.multiplier)
    }

    pub(crate) fn secondary_params(&self) -> Result<crate::backend::BucketParams, PolicyError> {
        validate_multiplier(self.multiplier)?;
        self.secondary
            .validate()
            .map_err(|reason| PolicyError::Invalid {
                kind: "_global_ip".to_string(),
                audience: "*".to_string(),
                reason,
            })?;
        Ok(self.secondary.params(self.multiplier))
    }
}
