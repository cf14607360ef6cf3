//! Configuration management

use crate::logging::LogConfig;
use crate::submission::{BulkTarget, Credentials, SubmissionError};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

// ============================================================================
// Defaults
// ============================================================================

/// Default upper bound for one bulk request body (1 MiB).
pub const DEFAULT_MAX_BATCH_BYTES: usize = 1_048_576;

/// Default timeout for one bulk HTTP call in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Default number of ETLs harvested at the same time.
pub const DEFAULT_MAX_CONCURRENT_ETLS: usize = 4;

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("A password is required when username '{username}' is configured")]
    MissingPassword { username: String },

    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },

    #[error("{key} must be greater than zero")]
    Zero { key: String },

    #[error("Logging configuration error: {0}")]
    Logging(String),
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Settings of the bulk submission target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionConfig {
    /// Bulk endpoint, e.g. `http://localhost:9200/index/_bulk`
    pub url: Option<String>,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub max_batch_bytes: usize,
    pub request_timeout_secs: u64,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            url: None,
            username: None,
            password: None,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl SubmissionConfig {
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_max_batch_bytes(mut self, max_batch_bytes: usize) -> Self {
        self.max_batch_bytes = max_batch_bytes;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_bytes == 0 {
            return Err(ConfigError::Zero {
                key: "HARVESTER_MAX_BATCH_BYTES".to_string(),
            });
        }
        self.credentials().map(|_| ())
    }

    /// Username without password is rejected; no username means anonymous.
    pub fn credentials(&self) -> Result<Option<Credentials>, ConfigError> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (None, _) | (Some(""), _) => Ok(None),
            (Some(username), Some(password)) if !password.is_empty() => Ok(Some(Credentials {
                username: username.to_string(),
                password: password.to_string(),
            })),
            (Some(username), _) => Err(ConfigError::MissingPassword {
                username: username.to_string(),
            }),
        }
    }

    /// Resolves the endpoint the pipeline should send to.
    pub fn target(&self) -> Result<BulkTarget, SubmissionError> {
        let url = self
            .url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or(SubmissionError::MissingUrl)?;

        Ok(BulkTarget {
            url: url.to_string(),
            credentials: self.credentials()?,
        })
    }
}

/// Submission settings shared with the control surface, which may replace
/// them between harvests.
#[derive(Debug, Clone, Default)]
pub struct SharedSubmissionConfig(Arc<RwLock<SubmissionConfig>>);

impl SharedSubmissionConfig {
    pub fn new(config: SubmissionConfig) -> Self {
        Self(Arc::new(RwLock::new(config)))
    }

    pub fn get(&self) -> SubmissionConfig {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn replace(&self, config: SubmissionConfig) -> Result<(), ConfigError> {
        config.validate()?;
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = config;
        Ok(())
    }
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub submission: SubmissionConfig,
    pub log: LogConfig,
    pub max_concurrent_etls: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            submission: SubmissionConfig::default(),
            log: LogConfig::default(),
            max_concurrent_etls: DEFAULT_MAX_CONCURRENT_ETLS,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from the environment (and `.env`, if present).
    ///
    /// - `HARVESTER_BULK_URL`
    /// - `HARVESTER_USERNAME` / `HARVESTER_PASSWORD`
    /// - `HARVESTER_MAX_BATCH_BYTES`
    /// - `HARVESTER_REQUEST_TIMEOUT_SECS`
    /// - `HARVESTER_MAX_CONCURRENT_ETLS`
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let submission = SubmissionConfig {
            url: lookup("HARVESTER_BULK_URL"),
            username: lookup("HARVESTER_USERNAME"),
            password: lookup("HARVESTER_PASSWORD"),
            max_batch_bytes: parse_or(
                &lookup,
                "HARVESTER_MAX_BATCH_BYTES",
                DEFAULT_MAX_BATCH_BYTES,
            )?,
            request_timeout_secs: parse_or(
                &lookup,
                "HARVESTER_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )?,
        };

        let log = LogConfig::from_lookup(&lookup).map_err(|e| ConfigError::Logging(e.to_string()))?;

        let config = Self {
            submission,
            log,
            max_concurrent_etls: parse_or(
                &lookup,
                "HARVESTER_MAX_CONCURRENT_ETLS",
                DEFAULT_MAX_CONCURRENT_ETLS,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_etls == 0 {
            return Err(ConfigError::Zero {
                key: "HARVESTER_MAX_CONCURRENT_ETLS".to_string(),
            });
        }
        self.submission.validate()
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<&str, &str> = pairs.iter().copied().collect();
        move |key| vars.get(key).map(|v| v.to_string())
    }

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.submission.max_batch_bytes, DEFAULT_MAX_BATCH_BYTES);
        assert_eq!(config.max_concurrent_etls, DEFAULT_MAX_CONCURRENT_ETLS);
        assert!(config.submission.url.is_none());
    }

    #[test]
    fn test_username_requires_password() {
        let result =
            ServiceConfig::from_lookup(lookup_from(&[("HARVESTER_USERNAME", "harvester")]));
        assert_eq!(
            result.unwrap_err(),
            ConfigError::MissingPassword {
                username: "harvester".to_string()
            }
        );
    }

    #[test]
    fn test_invalid_number() {
        let result =
            ServiceConfig::from_lookup(lookup_from(&[("HARVESTER_MAX_BATCH_BYTES", "lots")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_target_requires_url() {
        let config = SubmissionConfig::default();
        assert!(matches!(config.target(), Err(SubmissionError::MissingUrl)));

        let config = SubmissionConfig::default()
            .with_url("http://localhost:9200/_bulk")
            .with_credentials("user", "secret");
        let target = config.target().unwrap();
        assert_eq!(target.url, "http://localhost:9200/_bulk");
        assert_eq!(target.credentials.unwrap().username, "user");
    }

    #[test]
    fn test_shared_config_rejects_invalid_replacement() {
        let shared = SharedSubmissionConfig::new(SubmissionConfig::default());
        let invalid = SubmissionConfig {
            max_batch_bytes: 0,
            ..SubmissionConfig::default()
        };
        assert!(shared.replace(invalid).is_err());
        assert_eq!(shared.get().max_batch_bytes, DEFAULT_MAX_BATCH_BYTES);
    }
}
