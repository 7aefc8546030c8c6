//! Configuration management for the HITL client.
//!
//! Configuration can be set via environment variables:
//! - `HITL_BACKEND` - Required. Backend provider, one of `toloka` or `handl`.
//! - `HITL_HOST` - Required for `toloka`. Base URL of the HITL API.
//! - `HITL_TOKEN` - Optional. API token sent as `Authorization: Token <token>`.
//! - `HITL_LICENSE_ID` - Optional. Sent as the `license_id` query parameter.
//! - `HITL_SYSTEM_INFO_TOKEN` - Optional. Sent as the `system_info` query parameter.
//! - `SUGGESTIONS_GATEWAY` - Optional. Default suggestions gateway for submitted tasks.
//! - `HITL_CONFIDENCE_THRESHOLD` - Optional. Tasks predicted at or above it are not submitted.
//! - `HITL_RETRY_SCHEDULE` - Optional. Comma-separated backoff seconds. Defaults to `5,30`.
//! - `HITL_POLL_INTERVAL_SECS` - Optional. Sleep between reconciliation cycles. Defaults to `5`.
//! - `HITL_REQUEST_TIMEOUT_SECS` - Optional. Per-request transport timeout. Defaults to `60`.
//! - `HITL_ACCEPT_INVALID_CERTS` - Optional. Skip TLS verification. Defaults to `false`.
//! - `HANDL_GATEWAY`, `HANDL_USERNAME`, `HANDL_PASSWORD` - Required for `handl`.
//! - `HANDL_PREFIX` - Optional. Project title prefix. Defaults to `HITL`.
//! - `HANDL_VERSION` - Optional. Project title version. Defaults to today's `YYYYMMDD`.
//! - `HANDL_TASK_TIMEOUT` - Optional. Seconds after which a pending task is given up.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Unknown HITL backend: {0} (expected one of: toloka, handl)")]
    UnknownProvider(String),

    #[error("{provider} backend does not support {requested}")]
    UnsupportedMode {
        provider: Provider,
        requested: String,
    },
}

/// Backend providers known to the client. Selected once per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Full HITL API: tasks, documents, every mode combination.
    Toloka,
    /// Handl labeling platform: OCR-only.
    Handl,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::Toloka, Provider::Handl];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Toloka => "toloka",
            Provider::Handl => "handl",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| ConfigError::UnknownProvider(value.to_string()))
    }
}

/// Handl platform credentials and project naming.
#[derive(Debug, Clone, Default)]
pub struct HandlConfig {
    /// Base URL of the Handl API
    pub url: String,

    pub username: String,

    pub password: String,

    /// Project title prefix
    pub prefix: String,

    /// Project title version (None = today's date as `YYYYMMDD`)
    pub version: Option<String>,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Which backend gateway to construct
    pub provider: Provider,

    /// Base URL of the HITL API (toloka)
    pub host: String,

    /// API token
    pub token: Option<String>,

    /// License identifier forwarded on every request
    pub license_id: Option<String>,

    /// System info token forwarded on every request
    pub system_info_token: Option<String>,

    /// Default suggestions gateway for submitted tasks
    pub suggestions_gateway: Option<String>,

    /// Skip submission of tasks whose prediction confidence meets this value
    pub confidence_threshold: Option<f64>,

    /// Backoff schedule applied to every gateway network call
    pub retry_schedule: Vec<Duration>,

    /// Sleep between reconciliation cycles
    pub poll_interval: Duration,

    /// Give up on a pending task this long after its creation
    pub task_timeout: Option<Duration>,

    /// Per-request transport timeout
    pub request_timeout: Duration,

    /// Skip TLS certificate verification
    pub accept_invalid_certs: bool,

    /// Handl credentials (only read when `provider` is `Handl`)
    pub handl: HandlConfig,
}

pub const DEFAULT_RETRY_SCHEDULE: [Duration; 2] =
    [Duration::from_secs(5), Duration::from_secs(30)];

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `HITL_BACKEND` or a variable the
    /// selected backend needs is not set, and `ConfigError::UnknownProvider`
    /// for an unrecognized backend name.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let provider: Provider = lookup("HITL_BACKEND")
            .ok_or_else(|| ConfigError::MissingEnvVar("HITL_BACKEND".to_string()))?
            .parse()?;

        let host = lookup("HITL_HOST").unwrap_or_default();
        if provider == Provider::Toloka {
            if host.is_empty() {
                return Err(ConfigError::MissingEnvVar("HITL_HOST".to_string()));
            }
            validate_url("HITL_HOST", &host)?;
        }

        let confidence_threshold = lookup("HITL_CONFIDENCE_THRESHOLD")
            .map(|v| parse_threshold(&v))
            .transpose()?;

        let retry_schedule = lookup("HITL_RETRY_SCHEDULE")
            .map(|v| parse_schedule(&v))
            .transpose()?
            .unwrap_or_else(|| DEFAULT_RETRY_SCHEDULE.to_vec());

        let poll_interval = lookup("HITL_POLL_INTERVAL_SECS")
            .map(|v| parse_secs("HITL_POLL_INTERVAL_SECS", &v))
            .transpose()?
            .unwrap_or(DEFAULT_POLL_INTERVAL);

        let request_timeout = lookup("HITL_REQUEST_TIMEOUT_SECS")
            .map(|v| parse_secs("HITL_REQUEST_TIMEOUT_SECS", &v))
            .transpose()?
            .unwrap_or(Duration::from_secs(60));

        let accept_invalid_certs = lookup("HITL_ACCEPT_INVALID_CERTS")
            .map(|v| {
                parse_bool(&v)
                    .map_err(|e| ConfigError::InvalidValue("HITL_ACCEPT_INVALID_CERTS".to_string(), e))
            })
            .transpose()?
            .unwrap_or(false);

        let task_timeout = lookup("HANDL_TASK_TIMEOUT")
            .map(|v| parse_secs("HANDL_TASK_TIMEOUT", &v))
            .transpose()?;

        let handl = HandlConfig {
            url: lookup("HANDL_GATEWAY").unwrap_or_default(),
            username: lookup("HANDL_USERNAME").unwrap_or_default(),
            password: lookup("HANDL_PASSWORD").unwrap_or_default(),
            prefix: lookup("HANDL_PREFIX").unwrap_or_else(|| "HITL".to_string()),
            version: lookup("HANDL_VERSION").filter(|v| !v.trim().is_empty()),
        };

        // Handl has no use for HITL_HOST, but cannot work without credentials.
        if provider == Provider::Handl {
            for (name, value) in [
                ("HANDL_GATEWAY", &handl.url),
                ("HANDL_USERNAME", &handl.username),
                ("HANDL_PASSWORD", &handl.password),
            ] {
                if value.is_empty() {
                    return Err(ConfigError::MissingEnvVar(name.to_string()));
                }
            }
            validate_url("HANDL_GATEWAY", &handl.url)?;
        }

        Ok(Self {
            provider,
            host,
            token: lookup("HITL_TOKEN"),
            license_id: lookup("HITL_LICENSE_ID"),
            system_info_token: lookup("HITL_SYSTEM_INFO_TOKEN"),
            suggestions_gateway: lookup("SUGGESTIONS_GATEWAY"),
            confidence_threshold,
            retry_schedule,
            poll_interval,
            task_timeout,
            request_timeout,
            accept_invalid_certs,
            handl,
        })
    }

    /// Create a config with default values (useful for testing).
    pub fn new(provider: Provider, host: impl Into<String>) -> Self {
        Self {
            provider,
            host: host.into(),
            token: None,
            license_id: None,
            system_info_token: None,
            suggestions_gateway: None,
            confidence_threshold: None,
            retry_schedule: DEFAULT_RETRY_SCHEDULE.to_vec(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            task_timeout: None,
            request_timeout: Duration::from_secs(60),
            accept_invalid_certs: false,
            handl: HandlConfig {
                prefix: "HITL".to_string(),
                ..HandlConfig::default()
            },
        }
    }
}

fn validate_url(name: &str, value: &str) -> Result<(), ConfigError> {
    url::Url::parse(value)
        .map(|_| ())
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e)))
}

fn parse_threshold(value: &str) -> Result<f64, ConfigError> {
    let invalid = |msg: String| ConfigError::InvalidValue("HITL_CONFIDENCE_THRESHOLD".to_string(), msg);
    let threshold: f64 = value.trim().parse().map_err(|e| invalid(format!("{}", e)))?;
    if !(0.0..=1.0).contains(&threshold) {
        return Err(invalid(format!("{} is outside [0, 1]", threshold)));
    }
    Ok(threshold)
}

fn parse_secs(name: &str, value: &str) -> Result<Duration, ConfigError> {
    let secs: f64 = value
        .trim()
        .parse()
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e)))?;
    Duration::try_from_secs_f64(secs)
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e)))
}

fn parse_schedule(value: &str) -> Result<Vec<Duration>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| parse_secs("HITL_RETRY_SCHEDULE", part))
        .collect()
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "f" | "no" | "n" | "off" => Ok(false),
        other => Err(format!("expected boolean-like value, got: {}", other)),
    }
}
