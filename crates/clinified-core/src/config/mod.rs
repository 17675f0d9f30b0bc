//! Sync engine configuration.
//!
//! [`SyncConfig`] is built once (usually from the environment) and handed to
//! the orchestrator and transport explicitly. Defaults for batch size and the
//! retry budget match the backend's sync settings.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::resolver::{MergePolicy, ResolverConfig};
use crate::transport::RetryPolicy;
use crate::util::{is_http_url, normalize_text_option};

pub const DEFAULT_TENANT_ID: &str = "default";
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 5;
pub const DEFAULT_RETRY_MAX_DELAY_SECS: u64 = 60;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Base URL of the sync endpoint; required to run a cycle
    pub endpoint: Option<String>,
    /// Static bearer token attached to every request
    pub token: Option<String>,
    pub tenant_id: String,
    /// Overrides the device id persisted in the local store
    pub device_id: Option<String>,
    /// Maximum coalesced changes per batch and records per pull page
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    /// Periodic background sync, disabled when `None`
    pub sync_interval: Option<Duration>,
    pub auto_sync_on_reconnect: bool,
    pub resolver: ResolverConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            token: None,
            tenant_id: DEFAULT_TENANT_ID.to_string(),
            device_id: None,
            batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryPolicy {
                max_attempts: DEFAULT_RETRY_ATTEMPTS,
                base_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
                max_delay: Duration::from_secs(DEFAULT_RETRY_MAX_DELAY_SECS),
            },
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            sync_interval: None,
            auto_sync_on_reconnect: true,
            resolver: ResolverConfig::default(),
        }
    }
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SyncConfig")
            .field("endpoint", &self.endpoint)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("tenant_id", &self.tenant_id)
            .field("device_id", &self.device_id)
            .field("batch_size", &self.batch_size)
            .field("retry", &self.retry)
            .field("request_timeout", &self.request_timeout)
            .field("sync_interval", &self.sync_interval)
            .field("auto_sync_on_reconnect", &self.auto_sync_on_reconnect)
            .field("resolver", &self.resolver)
            .finish()
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let endpoint = optional_trimmed(&lookup, "CLINIFIED_SYNC_ENDPOINT");
        let token = optional_trimmed(&lookup, "CLINIFIED_SYNC_TOKEN");
        let tenant_id = optional_trimmed(&lookup, "CLINIFIED_TENANT_ID").unwrap_or(defaults.tenant_id);
        let device_id = optional_trimmed(&lookup, "CLINIFIED_DEVICE_ID");

        let batch_size = parse_or(&lookup, "SYNC_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        let max_attempts = parse_or(&lookup, "SYNC_RETRY_ATTEMPTS", DEFAULT_RETRY_ATTEMPTS)?;
        let base_delay = parse_or(&lookup, "SYNC_RETRY_DELAY", DEFAULT_RETRY_DELAY_SECS)?;
        let max_delay = parse_or(&lookup, "SYNC_RETRY_MAX_DELAY", DEFAULT_RETRY_MAX_DELAY_SECS)?;
        let timeout = parse_or(&lookup, "SYNC_REQUEST_TIMEOUT", DEFAULT_REQUEST_TIMEOUT_SECS)?;
        let interval = parse_or(&lookup, "SYNC_INTERVAL_SECS", 0_u64)?;
        let auto_sync_on_reconnect = parse_bool_or(&lookup, "SYNC_AUTO_ON_RECONNECT", true)?;

        let default_policy = match optional_trimmed(&lookup, "SYNC_MERGE_POLICY") {
            Some(raw) => raw
                .parse::<MergePolicy>()
                .map_err(|error| Error::Config(format!("SYNC_MERGE_POLICY: {error}")))?,
            None => MergePolicy::default(),
        };
        let overrides = match optional_trimmed(&lookup, "SYNC_MERGE_OVERRIDES") {
            Some(raw) => ResolverConfig::parse_overrides(&raw)
                .map_err(|error| Error::Config(format!("SYNC_MERGE_OVERRIDES: {error}")))?,
            None => HashMap::new(),
        };

        let config = Self {
            endpoint,
            token,
            tenant_id,
            device_id,
            batch_size,
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_secs(base_delay),
                max_delay: Duration::from_secs(max_delay),
            },
            request_timeout: Duration::from_secs(timeout),
            sync_interval: (interval > 0).then(|| Duration::from_secs(interval)),
            auto_sync_on_reconnect,
            resolver: ResolverConfig {
                default_policy,
                overrides,
            },
        };
        config.validate()
    }

    /// Check invariants and normalize the endpoint
    pub fn validate(mut self) -> Result<Self> {
        self.endpoint = match normalize_text_option(self.endpoint.take()) {
            Some(endpoint) if is_http_url(&endpoint) => {
                Some(endpoint.trim_end_matches('/').to_string())
            }
            Some(_) => {
                return Err(Error::Config(
                    "CLINIFIED_SYNC_ENDPOINT must start with http:// or https://".to_string(),
                ))
            }
            None => None,
        };
        self.token = normalize_text_option(self.token.take());

        if self.tenant_id.trim().is_empty() {
            return Err(Error::Config("tenant id must not be empty".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("SYNC_BATCH_SIZE must be at least 1".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config(
                "SYNC_RETRY_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(Error::Config(
                "SYNC_RETRY_DELAY must not exceed SYNC_RETRY_MAX_DELAY".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::Config(
                "SYNC_REQUEST_TIMEOUT must be at least 1 second".to_string(),
            ));
        }
        Ok(self)
    }

    /// Endpoint, or a configuration error when sync is not set up
    pub fn require_endpoint(&self) -> Result<&str> {
        self.endpoint.as_deref().ok_or_else(|| {
            Error::Config("CLINIFIED_SYNC_ENDPOINT is not set; sync is disabled".to_string())
        })
    }
}

fn parse_or<T: FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T> {
    optional_trimmed(lookup, name).map_or(Ok(default), |raw| {
        raw.parse::<T>()
            .map_err(|_| Error::Config(format!("{name} must be a non-negative integer, got '{raw}'")))
    })
}

fn parse_bool_or(lookup: impl Fn(&str) -> Option<String>, name: &str, default: bool) -> Result<bool> {
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{name} must be true or false, got '{raw}'"))),
    }
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    normalize_text_option(lookup(name))
}
