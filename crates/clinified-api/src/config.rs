use std::collections::HashMap;
use std::env;
use std::fmt;

use thiserror::Error;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
pub const DEFAULT_MAX_BATCH: usize = 500;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    /// Bearer token required on `/v1` routes; open access when unset
    pub api_token: Option<String>,
    /// Largest accepted batch and pull page
    pub max_batch: usize,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .field("max_batch", &self.max_batch)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "CLINIFIED_API_BIND", DEFAULT_BIND_ADDR);
        let api_token = optional_trimmed(&lookup, "CLINIFIED_API_TOKEN");
        let max_batch = match optional_trimmed(&lookup, "CLINIFIED_API_MAX_BATCH") {
            Some(raw) => raw.parse::<usize>().map_err(|_| {
                ConfigError::Invalid(format!(
                    "CLINIFIED_API_MAX_BATCH must be a positive integer, got '{raw}'"
                ))
            })?,
            None => DEFAULT_MAX_BATCH,
        };
        if max_batch == 0 {
            return Err(ConfigError::Invalid(
                "CLINIFIED_API_MAX_BATCH must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            bind_addr,
            api_token,
            max_batch,
        })
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(map: &HashMap<&str, &str>) -> Result<AppConfig, ConfigError> {
        AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn config_uses_defaults_when_unset() {
        let config = config_from(&HashMap::new()).unwrap();
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR);
        assert_eq!(config.api_token, None);
        assert_eq!(config.max_batch, DEFAULT_MAX_BATCH);
    }

    #[test]
    fn config_rejects_invalid_max_batch() {
        let mut map = HashMap::new();
        map.insert("CLINIFIED_API_MAX_BATCH", "0");
        assert!(config_from(&map).is_err());

        map.insert("CLINIFIED_API_MAX_BATCH", "lots");
        let err = config_from(&map).unwrap_err();
        assert!(err.to_string().contains("CLINIFIED_API_MAX_BATCH"));
    }

    #[test]
    fn config_redacts_token_in_debug() {
        let mut map = HashMap::new();
        map.insert("CLINIFIED_API_TOKEN", "  sensitive-api-token ");
        map.insert("CLINIFIED_API_BIND", "0.0.0.0:9000");

        let config = config_from(&map).unwrap();
        assert_eq!(config.api_token.as_deref(), Some("sensitive-api-token"));
        assert_eq!(config.bind_addr, "0.0.0.0:9000");

        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("sensitive-api-token"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
