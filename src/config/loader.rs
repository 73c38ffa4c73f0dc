//! Configuration Loader
//!
//! Layers pool configuration from defaults, a JSON file, `.env` and environment variables.

use crate::config::settings::PoolConfig;
use crate::error::{PoolError, Result};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// Prefix of the environment variables that override file settings
pub const ENV_PREFIX: &str = "OPENROUTER_";

/// Configuration loader with support for multiple sources
pub struct ConfigLoader {
    config: PoolConfig,
}

impl ConfigLoader {
    /// Load from the first config file found, then `.env` and the process environment
    pub fn new() -> Result<Self> {
        let mut loader = Self {
            config: PoolConfig::default(),
        };

        if let Some(path) = Self::get_config_paths().into_iter().find(|p| p.exists()) {
            loader.load_from_file(&path)?;
        }

        // A missing .env is fine
        let _ = dotenvy::dotenv();
        loader.apply_env()?;

        Ok(loader)
    }

    /// Load a specific config file, without environment overrides
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let mut loader = Self {
            config: PoolConfig::default(),
        };
        loader.load_from_file(path)?;
        Ok(loader)
    }

    /// Get list of config paths to check, most specific first
    fn get_config_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        // 1. Environment variable
        if let Ok(custom_path) = std::env::var("LLMPOOL_CONFIG") {
            paths.push(PathBuf::from(custom_path));
        }

        // 2. Current directory
        paths.push(PathBuf::from("llmpool.json"));

        // 3. User config directory
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("llmpool").join("config.json"));
        }

        // 4. Home directory
        if let Some(home_dir) = dirs::home_dir() {
            paths.push(home_dir.join(".llmpool").join("config.json"));
        }

        paths
    }

    /// Load configuration from a specific file
    fn load_from_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PoolError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        self.config = serde_json::from_str(&content).map_err(|e| {
            PoolError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;

        debug!(path = %path.display(), "loaded pool configuration file");
        Ok(())
    }

    /// Apply `OPENROUTER_*` variables from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable source
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, suffix))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let config = &mut self.config;

        if let Some(keys) = var("API_KEYS") {
            config.api_keys = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(v) = var("BASE_URL") {
            config.base_url = v;
        }
        if let Some(v) = var("APP_URL") {
            config.app_url = Some(v);
        }
        if let Some(v) = var("APP_NAME") {
            config.app_name = Some(v);
        }
        if let Some(v) = var("MODEL_TEXT") {
            config.model_text = v;
        }
        if let Some(v) = var("MODEL_VISION") {
            config.model_vision = v;
        }
        if let Some(v) = var("MODEL_EMBEDDING") {
            config.model_embedding = v;
        }

        set_parsed(&mut config.qps_per_key, "QPS_PER_KEY", var("QPS_PER_KEY"))?;
        set_parsed(&mut config.burst_multiplier, "BURST_MULTIPLIER", var("BURST_MULTIPLIER"))?;
        set_parsed(&mut config.strategy, "STRATEGY", var("STRATEGY"))?;
        set_parsed(&mut config.max_retries, "MAX_RETRIES", var("MAX_RETRIES"))?;
        set_parsed(&mut config.timeout_s, "TIMEOUT_S", var("TIMEOUT_S"))?;
        set_parsed(
            &mut config.request_deadline_s,
            "REQUEST_DEADLINE_S",
            var("REQUEST_DEADLINE_S"),
        )?;
        set_parsed(
            &mut config.circuit_failure_threshold,
            "CIRCUIT_FAILURE_THRESHOLD",
            var("CIRCUIT_FAILURE_THRESHOLD"),
        )?;
        set_parsed(
            &mut config.circuit_cooldown_s,
            "CIRCUIT_COOLDOWN_S",
            var("CIRCUIT_COOLDOWN_S"),
        )?;
        set_parsed(
            &mut config.circuit_success_threshold,
            "CIRCUIT_SUCCESS_THRESHOLD",
            var("CIRCUIT_SUCCESS_THRESHOLD"),
        )?;
        set_parsed(
            &mut config.rate_limit_cooldown_s,
            "RATE_LIMIT_COOLDOWN_S",
            var("RATE_LIMIT_COOLDOWN_S"),
        )?;
        set_parsed(
            &mut config.max_retry_after_s,
            "MAX_RETRY_AFTER_S",
            var("MAX_RETRY_AFTER_S"),
        )?;
        set_parsed(&mut config.max_tokens, "MAX_TOKENS", var("MAX_TOKENS"))?;
        set_parsed(
            &mut config.temperature_text,
            "TEMPERATURE_TEXT",
            var("TEMPERATURE_TEXT"),
        )?;
        set_parsed(
            &mut config.temperature_vision,
            "TEMPERATURE_VISION",
            var("TEMPERATURE_VISION"),
        )?;

        if let Some(mode) = var("RATE_LIMIT_MODE") {
            config.rate_limit_mode = serde_json::from_value(serde_json::Value::String(
                mode.to_lowercase(),
            ))
            .map_err(|_| {
                PoolError::Config(format!(
                    "{}RATE_LIMIT_MODE must be 'wait' or 'reject', got '{}'",
                    ENV_PREFIX, mode
                ))
            })?;
        }

        Ok(())
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Take ownership of the configuration
    pub fn into_config(self) -> PoolConfig {
        self.config
    }
}

fn set_parsed<T>(target: &mut T, name: &str, value: Option<String>) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(value) = value {
        *target = value.parse().map_err(|e| {
            PoolError::Config(format!("Invalid {}{} '{}': {}", ENV_PREFIX, name, value, e))
        })?;
    }
    Ok(())
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self {
            config: PoolConfig::default(),
        })
    }
}
