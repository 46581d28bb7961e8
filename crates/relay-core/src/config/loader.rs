//! Configuration loader for YAML files and environment resolution
//!
//! Loads a `RelayConfig` from a file or string, applies environment overrides and
//! `${VAR}` expansion, then validates the result.

use crate::config::types::RelayConfig;
use crate::errors::RelayError;
use regex::Regex;
use std::env;
use std::path::Path;
use tokio::fs;

pub const ENV_WORKER_COMMAND: &str = "RELAY_WORKER_COMMAND";
pub const ENV_LOG_LEVEL: &str = "RELAY_LOG_LEVEL";
pub const ENV_MAX_PAYLOAD_BYTES: &str = "RELAY_MAX_PAYLOAD_BYTES";

/// Configuration loader with environment resolution
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<RelayConfig, RelayError> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).await.map_err(|e| {
            RelayError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        log::debug!("Loaded {} bytes of configuration from {}", content.len(), path.display());
        Self::from_str(&content)
    }

    /// Load configuration from a YAML string. An empty document yields the defaults.
    pub fn from_str(content: &str) -> Result<RelayConfig, RelayError> {
        let mut config: RelayConfig = if content.trim().is_empty() {
            RelayConfig::default()
        } else {
            serde_yaml::from_str(content).map_err(|e| {
                RelayError::ConfigError(format!("Failed to parse YAML config: {}", e))
            })?
        };

        Self::resolve_environment(&mut config)?;
        config.validate()?;

        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a config file.
    pub fn from_env() -> Result<RelayConfig, RelayError> {
        Self::from_str("")
    }

    fn resolve_environment(config: &mut RelayConfig) -> Result<(), RelayError> {
        if let Ok(command) = env::var(ENV_WORKER_COMMAND) {
            if !command.trim().is_empty() {
                log::info!("Worker command overridden by {}: {}", ENV_WORKER_COMMAND, command);
                config.worker.command = command;
            }
        }

        if let Ok(level) = env::var(ENV_LOG_LEVEL) {
            if !level.trim().is_empty() {
                config.logging.level = level;
            }
        }

        if let Ok(raw) = env::var(ENV_MAX_PAYLOAD_BYTES) {
            config.delivery.max_payload_bytes = raw.trim().parse().map_err(|e| {
                RelayError::ConfigError(format!(
                    "Invalid {} value '{}': {}",
                    ENV_MAX_PAYLOAD_BYTES, raw, e
                ))
            })?;
        }

        for value in config.worker.env.values_mut() {
            *value = expand_env_vars(value)?;
        }

        let expo = &mut config.delivery.expo;
        if expo.access_token.is_none() {
            if let Some(var) = &expo.access_token_env {
                match env::var(var) {
                    Ok(token) => expo.access_token = Some(token),
                    Err(_) => log::warn!(
                        "Expo access token variable '{}' is not set; sending unauthenticated",
                        var
                    ),
                }
            }
        }

        Ok(())
    }
}

/// Expand `${VAR}` references. Unset variables are a configuration error.
pub fn expand_env_vars(value: &str) -> Result<String, RelayError> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| RelayError::InternalError(format!("Invalid env pattern: {}", e)))?;

    let mut missing = None;
    let expanded = re.replace_all(value, |caps: &regex::Captures| {
        let name = &caps[1];
        match env::var(name) {
            Ok(v) => v,
            Err(_) => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(name) => Err(RelayError::ConfigError(format!(
            "Environment variable '{}' referenced in worker.env is not set",
            name
        ))),
        None => Ok(expanded.into_owned()),
    }
}
