//! API Key Pool Management
//!
//! Owns every pooled key together with its rate limiter, circuit breaker and
//! usage metrics, and picks the key that serves the next request.

use crate::client::{CircuitBreaker, CircuitBreakerConfig, CircuitState, TokenBucket};
use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::router::strategy::{Candidate, KeySelectionStrategy, Selector};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Smoothing factor of the rolling latency average
const LATENCY_ALPHA: f64 = 0.3;

/// Mask a key for logs and stats, keeping only its tail
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    let keep = if chars.len() > 16 { 8 } else { chars.len().min(4) };
    let tail: String = chars[chars.len() - keep..].iter().collect();
    format!("…{}", tail)
}

#[derive(Debug, Default)]
struct Observations {
    avg_latency_ms: Option<f64>,
    last_error_code: Option<u16>,
    last_used: Option<DateTime<Utc>>,
}

/// Usage counters for a single key
#[derive(Debug, Default)]
pub struct KeyMetrics {
    total_requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    consecutive_failures: AtomicU32,
    in_flight: AtomicU32,
    observations: Mutex<Observations>,
}

/// Marks one request as in flight until dropped
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    metrics: &'a KeyMetrics,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.metrics.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl KeyMetrics {
    /// Count a request as issued; the guard tracks it as in flight
    pub fn begin_request(&self) -> InFlightGuard<'_> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.observations.lock().last_used = Some(Utc::now());
        InFlightGuard { metrics: self }
    }

    pub fn record_success(&self, latency: Duration) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);

        let sample = latency.as_secs_f64() * 1000.0;
        let mut observations = self.observations.lock();
        observations.avg_latency_ms = Some(match observations.avg_latency_ms {
            Some(avg) => avg + LATENCY_ALPHA * (sample - avg),
            None => sample,
        });
    }

    pub fn record_failure(&self, status_code: Option<u16>) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        if let Some(code) = status_code {
            self.observations.lock().last_error_code = Some(code);
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn avg_latency(&self) -> Option<Duration> {
        self.observations
            .lock()
            .avg_latency_ms
            .map(|ms| Duration::from_secs_f64(ms / 1000.0))
    }

    pub fn last_used(&self) -> Option<DateTime<Utc>> {
        self.observations.lock().last_used
    }

    pub fn last_error_code(&self) -> Option<u16> {
        self.observations.lock().last_error_code
    }

    pub fn success_rate(&self) -> f64 {
        self.successes() as f64 / self.total_requests().max(1) as f64
    }
}

/// A pooled API key with its own admission control and health state
#[derive(Debug)]
pub struct ApiKeyRecord {
    index: usize,
    value: String,
    label: String,
    bucket: TokenBucket,
    breaker: CircuitBreaker,
    metrics: KeyMetrics,

    /// Provider-imposed cool-down after a 429
    rate_limited_until: RwLock<Option<Instant>>,
}

impl ApiKeyRecord {
    pub fn new(
        index: usize,
        value: String,
        bucket: TokenBucket,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        let label = mask_key(&value);
        Self {
            index,
            breaker: CircuitBreaker::new(label.clone(), breaker_config),
            label,
            value,
            bucket,
            metrics: KeyMetrics::default(),
            rate_limited_until: RwLock::new(None),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// The raw key, for building credentials only
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Masked form safe for logs
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn metrics(&self) -> &KeyMetrics {
        &self.metrics
    }

    pub fn is_rate_limited(&self) -> bool {
        self.rate_limit_remaining().is_some()
    }

    pub fn rate_limit_remaining(&self) -> Option<Duration> {
        let until = (*self.rate_limited_until.read())?;
        let now = Instant::now();
        (now < until).then(|| until - now)
    }

    pub fn mark_rate_limited(&self, duration: Duration) {
        let mut guard = self.rate_limited_until.write();
        *guard = Some(Instant::now() + duration);
    }

    pub fn clear_rate_limit(&self) {
        let mut guard = self.rate_limited_until.write();
        *guard = None;
    }

    /// Eligible to be picked: breaker admits traffic and no provider cool-down
    pub fn is_selectable(&self) -> bool {
        !self.is_rate_limited() && self.breaker.is_available()
    }

    fn candidate(&self) -> Candidate {
        Candidate {
            index: self.index,
            in_flight: self.metrics.in_flight(),
            total_requests: self.metrics.total_requests(),
            successes: self.metrics.successes(),
            avg_latency: self.metrics.avg_latency(),
        }
    }

    fn stats(&self) -> KeyStats {
        KeyStats {
            index: self.index,
            key: self.label.clone(),
            circuit_state: self.breaker.state(),
            requests: self.metrics.total_requests(),
            successes: self.metrics.successes(),
            failures: self.metrics.failures(),
            consecutive_failures: self.metrics.consecutive_failures(),
            in_flight: self.metrics.in_flight(),
            success_rate: self.metrics.success_rate(),
            avg_latency_ms: self.metrics.avg_latency().map(|d| d.as_secs_f64() * 1000.0),
            available_tokens: self.bucket.available_tokens(),
            rate_limited_for_ms: self.rate_limit_remaining().map(|d| d.as_millis() as u64),
            circuit_cooldown_ms: self
                .breaker
                .cooldown_remaining()
                .map(|d| d.as_millis() as u64),
            last_used: self.metrics.last_used(),
            last_error_code: self.metrics.last_error_code(),
        }
    }
}

/// No key is currently eligible to serve a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no API key is currently available")]
pub struct PoolExhausted;

/// Settings shared by every key of a pool
#[derive(Debug, Clone)]
pub struct KeyPoolSettings {
    pub qps_per_key: f64,
    pub burst_multiplier: f64,
    pub breaker: CircuitBreakerConfig,
    pub strategy: KeySelectionStrategy,
}

impl From<&PoolConfig> for KeyPoolSettings {
    fn from(config: &PoolConfig) -> Self {
        Self {
            qps_per_key: config.qps_per_key,
            burst_multiplier: config.burst_multiplier,
            breaker: config.circuit_breaker(),
            strategy: config.strategy,
        }
    }
}

/// Pool of API keys with health-aware rotation
#[derive(Debug)]
pub struct KeyPool {
    keys: Vec<ApiKeyRecord>,
    selector: Selector,
}

impl KeyPool {
    /// Create a pool; duplicate keys are collapsed, an empty pool is rejected
    pub fn new(keys: Vec<String>, settings: &KeyPoolSettings) -> Result<Self> {
        let mut unique: Vec<String> = Vec::with_capacity(keys.len());
        for key in keys {
            let key = key.trim().to_string();
            if key.is_empty() {
                return Err(PoolError::Config("API keys must not be empty".to_string()));
            }
            if unique.contains(&key) {
                warn!(key = %mask_key(&key), "ignoring duplicate API key");
                continue;
            }
            unique.push(key);
        }

        if unique.is_empty() {
            return Err(PoolError::Config(
                "At least one API key is required".to_string(),
            ));
        }

        let keys: Vec<ApiKeyRecord> = unique
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                ApiKeyRecord::new(
                    index,
                    value,
                    TokenBucket::new(settings.qps_per_key, settings.burst_multiplier),
                    settings.breaker,
                )
            })
            .collect();

        info!(
            num_keys = keys.len(),
            strategy = %settings.strategy,
            qps_per_key = settings.qps_per_key,
            burst_capacity = keys[0].bucket().capacity(),
            "key pool initialized"
        );

        Ok(Self {
            keys,
            selector: Selector::new(settings.strategy),
        })
    }

    pub fn from_config(config: &PoolConfig) -> Result<Self> {
        Self::new(config.api_keys.clone(), &KeyPoolSettings::from(config))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[ApiKeyRecord] {
        &self.keys
    }

    pub fn get(&self, index: usize) -> Option<&ApiKeyRecord> {
        self.keys.get(index)
    }

    pub fn strategy(&self) -> KeySelectionStrategy {
        self.selector.strategy()
    }

    /// Pick a key not in `exclude` and claim its breaker admission
    pub fn select_key(&self, exclude: &[usize]) -> std::result::Result<&ApiKeyRecord, PoolExhausted> {
        let mut candidates: Vec<Candidate> = self
            .keys
            .iter()
            .filter(|k| !exclude.contains(&k.index) && k.is_selectable())
            .map(ApiKeyRecord::candidate)
            .collect();

        while let Some(index) = self.selector.select(&candidates) {
            let key = &self.keys[index];
            if key.breaker().allow() {
                return Ok(key);
            }

            // Another caller claimed the half-open probe first
            debug!(key = %key.label(), "lost breaker admission race, reselecting");
            candidates.retain(|c| c.index != index);
        }

        Err(PoolExhausted)
    }

    /// Shortest provider cool-down among keys whose breaker would admit traffic
    pub fn soonest_recovery(&self) -> Option<Duration> {
        self.keys
            .iter()
            .filter(|k| k.breaker().is_available())
            .filter_map(ApiKeyRecord::rate_limit_remaining)
            .min()
    }

    /// Keys whose half-open probe is currently in flight
    pub fn probing_keys(&self) -> Vec<&ApiKeyRecord> {
        self.keys
            .iter()
            .filter(|k| k.breaker().is_probing())
            .collect()
    }

    /// Snapshot of every key. Never alters metrics.
    pub fn stats(&self) -> KeyPoolStats {
        let keys: Vec<KeyStats> = self.keys.iter().map(ApiKeyRecord::stats).collect();

        KeyPoolStats {
            strategy: self.strategy(),
            total_keys: keys.len(),
            available_keys: self.keys.iter().filter(|k| k.is_selectable()).count(),
            open_circuits: keys
                .iter()
                .filter(|k| k.circuit_state == CircuitState::Open)
                .count(),
            rate_limited_keys: keys.iter().filter(|k| k.rate_limited_for_ms.is_some()).count(),
            total_requests: keys.iter().map(|k| k.requests).sum(),
            total_successes: keys.iter().map(|k| k.successes).sum(),
            total_failures: keys.iter().map(|k| k.failures).sum(),
            keys,
        }
    }
}

/// Point-in-time view of one key
#[derive(Debug, Clone, Serialize)]
pub struct KeyStats {
    pub index: usize,
    pub key: String,
    pub circuit_state: CircuitState,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub in_flight: u32,
    pub success_rate: f64,
    pub avg_latency_ms: Option<f64>,
    pub available_tokens: f64,
    pub rate_limited_for_ms: Option<u64>,
    pub circuit_cooldown_ms: Option<u64>,
    pub last_used: Option<DateTime<Utc>>,
    pub last_error_code: Option<u16>,
}

/// Statistics about a key pool
#[derive(Debug, Clone, Serialize)]
pub struct KeyPoolStats {
    pub strategy: KeySelectionStrategy,
    pub total_keys: usize,
    pub available_keys: usize,
    pub open_circuits: usize,
    pub rate_limited_keys: usize,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub keys: Vec<KeyStats>,
}
