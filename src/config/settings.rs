//! Pool Configuration
//!
//! Defines the configuration schema for the key pool and its provider.

use crate::client::{CircuitBreakerConfig, RateLimitMode};
use crate::error::{PoolError, Result};
use crate::router::KeySelectionStrategy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "google/gemini-2.0-flash-001";
pub const DEFAULT_EMBEDDING_MODEL: &str = "openai/text-embedding-3-small";

/// Upper bound for every configured duration, in seconds (one year)
pub const MAX_SECONDS: f64 = 365.0 * 24.0 * 3600.0;

/// Root configuration structure
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// API keys to rotate through
    pub api_keys: Vec<String>,

    /// Base URL of the OpenAI-compatible API
    pub base_url: String,

    /// Sent as `HTTP-Referer` when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_url: Option<String>,

    /// Sent as `X-Title` when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,

    pub model_text: String,
    pub model_vision: String,
    pub model_embedding: String,

    /// Sustained requests per second allowed on each key
    pub qps_per_key: f64,

    /// Bucket capacity as a multiple of `qps_per_key`
    pub burst_multiplier: f64,

    pub rate_limit_mode: RateLimitMode,
    pub strategy: KeySelectionStrategy,

    /// Retries after the first attempt
    pub max_retries: u32,

    /// Per-attempt timeout
    pub timeout_s: f64,

    /// Upper bound on one logical request, waits and retries included
    pub request_deadline_s: f64,

    pub circuit_failure_threshold: u32,
    pub circuit_cooldown_s: f64,
    pub circuit_success_threshold: u32,

    /// Key cool-down after a 429 without `Retry-After`
    pub rate_limit_cooldown_s: f64,

    /// Cap applied to provider `Retry-After` values
    pub max_retry_after_s: f64,

    pub max_tokens: u32,
    pub temperature_text: f32,
    pub temperature_vision: f32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            app_url: None,
            app_name: None,
            model_text: DEFAULT_MODEL.to_string(),
            model_vision: DEFAULT_MODEL.to_string(),
            model_embedding: DEFAULT_EMBEDDING_MODEL.to_string(),
            qps_per_key: 0.15,
            burst_multiplier: 8.1,
            rate_limit_mode: RateLimitMode::Wait,
            strategy: KeySelectionStrategy::RoundRobin,
            max_retries: 3,
            timeout_s: 30.0,
            request_deadline_s: 300.0,
            circuit_failure_threshold: 5,
            circuit_cooldown_s: 30.0,
            circuit_success_threshold: 1,
            rate_limit_cooldown_s: 5.0,
            max_retry_after_s: 60.0,
            max_tokens: 8192,
            temperature_text: 0.7,
            temperature_vision: 0.1,
        }
    }
}

// Keys stay out of debug output
impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("api_keys", &format_args!("[{} key(s)]", self.api_keys.len()))
            .field("base_url", &self.base_url)
            .field("app_url", &self.app_url)
            .field("app_name", &self.app_name)
            .field("model_text", &self.model_text)
            .field("model_vision", &self.model_vision)
            .field("model_embedding", &self.model_embedding)
            .field("qps_per_key", &self.qps_per_key)
            .field("burst_multiplier", &self.burst_multiplier)
            .field("rate_limit_mode", &self.rate_limit_mode)
            .field("strategy", &self.strategy)
            .field("max_retries", &self.max_retries)
            .field("timeout_s", &self.timeout_s)
            .field("request_deadline_s", &self.request_deadline_s)
            .finish_non_exhaustive()
    }
}

fn positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(PoolError::Config(format!(
            "{} must be a positive number, got {}",
            name, value
        )))
    }
}

fn at_most(name: &str, value: f64, max: f64) -> Result<()> {
    if value <= max {
        Ok(())
    } else {
        Err(PoolError::Config(format!(
            "{} must be at most {}, got {}",
            name, max, value
        )))
    }
}

/// Configured seconds as a `Duration`, clamped to `[0, MAX_SECONDS]`
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.clamp(0.0, MAX_SECONDS)).unwrap_or(Duration::ZERO)
}

impl PoolConfig {
    /// Configuration with the given keys and defaults elsewhere
    pub fn with_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            api_keys: keys.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Check the configuration is usable to build a pool
    pub fn validate(&self) -> Result<()> {
        if self.api_keys.iter().all(|k| k.trim().is_empty()) {
            return Err(PoolError::Config(
                "At least one API key is required (set OPENROUTER_API_KEYS)".to_string(),
            ));
        }
        if self.base_url.trim().is_empty() {
            return Err(PoolError::Config("base_url must not be empty".to_string()));
        }

        positive("qps_per_key", self.qps_per_key)?;
        positive("burst_multiplier", self.burst_multiplier)?;
        positive("timeout_s", self.timeout_s)?;
        positive("request_deadline_s", self.request_deadline_s)?;
        positive("circuit_cooldown_s", self.circuit_cooldown_s)?;
        positive("rate_limit_cooldown_s", self.rate_limit_cooldown_s)?;
        positive("max_retry_after_s", self.max_retry_after_s)?;

        for (name, value) in [
            ("timeout_s", self.timeout_s),
            ("request_deadline_s", self.request_deadline_s),
            ("circuit_cooldown_s", self.circuit_cooldown_s),
            ("rate_limit_cooldown_s", self.rate_limit_cooldown_s),
            ("max_retry_after_s", self.max_retry_after_s),
        ] {
            at_most(name, value, MAX_SECONDS)?;
        }
        // A key must earn at least one token within the longest allowed wait
        if self.qps_per_key * MAX_SECONDS < 1.0 {
            return Err(PoolError::Config(format!(
                "qps_per_key must be at least {}, got {}",
                1.0 / MAX_SECONDS,
                self.qps_per_key
            )));
        }

        if self.circuit_failure_threshold == 0 {
            return Err(PoolError::Config(
                "circuit_failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.circuit_success_threshold == 0 {
            return Err(PoolError::Config(
                "circuit_success_threshold must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        seconds(self.timeout_s)
    }

    pub fn request_deadline(&self) -> Duration {
        seconds(self.request_deadline_s)
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        seconds(self.rate_limit_cooldown_s)
    }

    pub fn max_retry_after(&self) -> Duration {
        seconds(self.max_retry_after_s)
    }

    pub fn circuit_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_failure_threshold,
            cooldown: seconds(self.circuit_cooldown_s),
            success_threshold: self.circuit_success_threshold,
        }
    }

    /// Endpoint URL for a path such as `chat/completions`
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}
