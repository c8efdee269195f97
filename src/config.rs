//! Runtime settings
//!
//! Read from the process environment after loading an optional `.env` file.
//! Every value has a default except the secrets.

use crate::llm::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: PathBuf,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub openai_model: String,
    pub llm_timeout_secs: u64,
    pub llm_max_attempts: u32,
    pub llm_retry_backoff_ms: u64,
    pub process_batch_size: usize,
    pub bind_addr: SocketAddr,
    pub guest_password: Option<String>,
    pub dev_password: Option<String>,
    pub log_level: String,
}

impl Settings {
    /// Load `.env` (if present) then read the environment
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_map(&std::env::vars().collect())
    }

    /// Build settings from an explicit variable map (used by tests)
    pub fn from_map(env: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            env.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let openai_base_url = get("OPENAI_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        if !(openai_base_url.starts_with("https://") || openai_base_url.starts_with("http://")) {
            return Err(ConfigError::Invalid {
                var: "OPENAI_BASE_URL",
                reason: "must start with http:// or https://".to_string(),
            });
        }

        let bind_addr = match get("BIND_ADDR") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                var: "BIND_ADDR",
                reason: format!("'{}' is not a socket address", raw),
            })?,
            None => SocketAddr::from(([0, 0, 0, 0], 3000)),
        };

        let settings = Settings {
            database_path: get("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("receipty.db")),
            openai_api_key: get("OPENAI_API_KEY"),
            openai_base_url,
            openai_model: get("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            llm_timeout_secs: parse_number(get("LLM_TIMEOUT_SECS"), "LLM_TIMEOUT_SECS", 60)?,
            llm_max_attempts: parse_number(get("LLM_MAX_ATTEMPTS"), "LLM_MAX_ATTEMPTS", 3)?,
            llm_retry_backoff_ms: parse_number(get("LLM_RETRY_BACKOFF_MS"), "LLM_RETRY_BACKOFF_MS", 500)?,
            process_batch_size: parse_number(get("PROCESS_BATCH_SIZE"), "PROCESS_BATCH_SIZE", 50)?,
            bind_addr,
            guest_password: get("GUEST_PASSWORD"),
            dev_password: get("DEV_PASSWORD"),
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.llm_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "LLM_MAX_ATTEMPTS",
                reason: "must be at least 1".to_string(),
            });
        }

        if self.process_batch_size == 0 {
            return Err(ConfigError::Invalid {
                var: "PROCESS_BATCH_SIZE",
                reason: "must be at least 1".to_string(),
            });
        }

        if self.llm_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "LLM_TIMEOUT_SECS",
                reason: "must be at least 1".to_string(),
            });
        }

        if let (Some(guest), Some(dev)) = (&self.guest_password, &self.dev_password) {
            if guest == dev {
                return Err(ConfigError::Invalid {
                    var: "DEV_PASSWORD",
                    reason: "must differ from GUEST_PASSWORD".to_string(),
                });
            }
        }

        Ok(())
    }

    /// The API key, required by anything that talks to the LLM
    pub fn require_openai_key(&self) -> Result<&str, ConfigError> {
        self.openai_api_key
            .as_deref()
            .ok_or(ConfigError::Missing("OPENAI_API_KEY"))
    }
}

fn parse_number<T: std::str::FromStr>(
    raw: Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
            var,
            reason: format!("'{}' is not a valid number", value),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_map(&HashMap::new()).unwrap();

        assert_eq!(settings.database_path, PathBuf::from("receipty.db"));
        assert_eq!(settings.openai_base_url, DEFAULT_BASE_URL);
        assert_eq!(settings.openai_model, DEFAULT_MODEL);
        assert_eq!(settings.llm_max_attempts, 3);
        assert_eq!(settings.process_batch_size, 50);
        assert_eq!(settings.bind_addr.port(), 3000);
        assert_eq!(
            settings.require_openai_key(),
            Err(ConfigError::Missing("OPENAI_API_KEY"))
        );
    }

    #[test]
    fn test_overrides() {
        let settings = Settings::from_map(&env(&[
            ("DATABASE_PATH", "/tmp/receipts.db"),
            ("OPENAI_API_KEY", "sk-live"),
            ("OPENAI_MODEL", "gpt-4o"),
            ("PROCESS_BATCH_SIZE", "5"),
            ("BIND_ADDR", "127.0.0.1:8080"),
            ("GUEST_PASSWORD", "guest"),
            ("DEV_PASSWORD", "dev"),
        ]))
        .unwrap();

        assert_eq!(settings.database_path, PathBuf::from("/tmp/receipts.db"));
        assert_eq!(settings.require_openai_key(), Ok("sk-live"));
        assert_eq!(settings.openai_model, "gpt-4o");
        assert_eq!(settings.process_batch_size, 5);
        assert_eq!(settings.bind_addr.to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn test_blank_values_fall_back_to_defaults() {
        let settings = Settings::from_map(&env(&[("OPENAI_API_KEY", "  "), ("LOG_LEVEL", "")])).unwrap();
        assert!(settings.openai_api_key.is_none());
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn test_invalid_values() {
        let err = Settings::from_map(&env(&[("OPENAI_BASE_URL", "ftp://llm")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "OPENAI_BASE_URL", .. }));

        let err = Settings::from_map(&env(&[("LLM_MAX_ATTEMPTS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "LLM_MAX_ATTEMPTS", .. }));

        let err = Settings::from_map(&env(&[("PROCESS_BATCH_SIZE", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "PROCESS_BATCH_SIZE", .. }));

        let err = Settings::from_map(&env(&[("BIND_ADDR", "localhost")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "BIND_ADDR", .. }));
    }

    #[test]
    fn test_passwords_must_differ() {
        let err = Settings::from_map(&env(&[("GUEST_PASSWORD", "same"), ("DEV_PASSWORD", "same")])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid value for DEV_PASSWORD: must differ from GUEST_PASSWORD"
        );
    }
}
