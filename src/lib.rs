//! llmpool - Resilient multi-key LLM API client pool
//!
//! Spreads requests to an OpenAI-compatible provider across several API keys, with a
//! per-key token bucket, a per-key circuit breaker and transparent failover, so callers
//! see a single reliable client.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod router;

#[cfg(feature = "python")]
mod python;

pub use api::{CompletionResponse, ContentPart, GenerateOptions, Message};
pub use client::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitState, HttpTransport, RateLimitMode,
    TokenBucket, Transport,
};
pub use config::{ConfigLoader, PoolConfig};
pub use error::{ApiError, ErrorKind, PoolError, Result};
pub use router::{ApiKeyRecord, KeyPool, KeyPoolStats, KeySelectionStrategy, KeyStats};

use api::{CompletionRequest, EmbeddingRequest, EmbeddingResponse};
use router::PoolExhausted;

/// Install a `tracing` subscriber honouring `RUST_LOG` (default `info`).
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Returns a claimed half-open probe if the attempt is abandoned before resolving it
struct ProbeSlot<'a> {
    key: &'a ApiKeyRecord,
    held: bool,
}

impl<'a> ProbeSlot<'a> {
    fn new(key: &'a ApiKeyRecord) -> Self {
        // Only one caller can hold the probe, so a probing breaker here means it is ours
        Self {
            held: key.breaker().is_probing(),
            key,
        }
    }

    fn resolve(&mut self) {
        self.held = false;
    }
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if self.held {
            self.key.breaker().release_probe();
        }
    }
}

/// The pooled LLM client
pub struct PoolClient {
    config: PoolConfig,
    pool: KeyPool,
    transport: Arc<dyn Transport>,

    /// Request headers per key, indexed like the pool
    headers: Vec<HeaderMap>,
}

impl std::fmt::Debug for PoolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolClient")
            .field("config", &self.config)
            .field("pool", &self.pool.len())
            .finish_non_exhaustive()
    }
}

impl PoolClient {
    /// Create a client over HTTP
    pub fn new(config: PoolConfig) -> Result<Self> {
        let transport = HttpTransport::new()?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Create a client from config files and `OPENROUTER_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(ConfigLoader::new()?.into_config())
    }

    /// Create a client over a custom transport
    pub fn with_transport(config: PoolConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let pool = KeyPool::from_config(&config)?;
        let headers = pool
            .keys()
            .iter()
            .map(|key| build_headers(&config, key.value()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            pool,
            transport,
            headers,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn pool(&self) -> &KeyPool {
        &self.pool
    }

    /// Snapshot of every key's health and usage
    pub fn stats(&self) -> KeyPoolStats {
        self.pool.stats()
    }

    /// Log a one-line summary of pool health
    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            total_keys = stats.total_keys,
            available_keys = stats.available_keys,
            open_circuits = stats.open_circuits,
            rate_limited_keys = stats.rate_limited_keys,
            total_requests = stats.total_requests,
            total_failures = stats.total_failures,
            "key pool stats"
        );
    }

    /// Generate text from a prompt
    pub async fn generate_text(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<CompletionResponse> {
        let request = CompletionRequest::new(
            self.config.model_text.clone(),
            options.messages(Message::user(prompt)),
        )
        .with_temperature(options.temperature.unwrap_or(self.config.temperature_text))
        .with_max_tokens(options.max_tokens.unwrap_or(self.config.max_tokens))
        .with_response_format(options.response_format()?);

        debug!(
            model = %request.model,
            prompt_length = prompt.len(),
            has_system = options.system_instructions.is_some(),
            "generate_text"
        );
        self.complete("generate_text", &request, options).await
    }

    /// Generate from a prompt and a PDF document
    pub async fn generate_from_pdf(
        &self,
        prompt: &str,
        pdf: &[u8],
        options: &GenerateOptions,
    ) -> Result<CompletionResponse> {
        if pdf.is_empty() {
            return Err(ApiError::validation("PDF payload is empty").into());
        }

        let message = Message::user_parts(vec![
            ContentPart::text(prompt),
            ContentPart::pdf(pdf, "document.pdf"),
        ]);
        let request = CompletionRequest::new(
            self.config.model_vision.clone(),
            options.messages(message),
        )
        .with_temperature(options.temperature.unwrap_or(self.config.temperature_vision))
        .with_max_tokens(options.max_tokens.unwrap_or(self.config.max_tokens))
        .with_response_format(options.response_format()?);

        debug!(
            model = %request.model,
            prompt_length = prompt.len(),
            pdf_size = pdf.len(),
            "generate_from_pdf"
        );
        self.complete("generate_from_pdf", &request, options).await
    }

    /// Generate from a prompt and an image
    pub async fn generate_from_image(
        &self,
        prompt: &str,
        image: &[u8],
        mime_type: &str,
        options: &GenerateOptions,
    ) -> Result<CompletionResponse> {
        if image.is_empty() {
            return Err(ApiError::validation("Image payload is empty").into());
        }
        if !mime_type.starts_with("image/") {
            return Err(ApiError::validation(format!(
                "Unsupported image MIME type '{}'",
                mime_type
            ))
            .into());
        }

        let message = Message::user_parts(vec![
            ContentPart::text(prompt),
            ContentPart::image(image, mime_type),
        ]);
        let request = CompletionRequest::new(
            self.config.model_vision.clone(),
            options.messages(message),
        )
        .with_temperature(options.temperature.unwrap_or(self.config.temperature_vision))
        .with_max_tokens(options.max_tokens.unwrap_or(self.config.max_tokens))
        .with_response_format(options.response_format()?);

        debug!(
            model = %request.model,
            image_size = image.len(),
            mime_type,
            "generate_from_image"
        );
        self.complete("generate_from_image", &request, options).await
    }

    /// Embed texts, returning one vector per input in input order
    pub async fn create_embedding(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingRequest::new(self.config.model_embedding.clone(), texts.to_vec());
        debug!(
            model = %request.model,
            input_count = texts.len(),
            total_chars = texts.iter().map(|t| t.chars().count()).sum::<usize>(),
            "create_embedding"
        );

        let body = serde_json::to_value(&request)?;
        let value = self
            .execute(
                "create_embedding",
                &self.config.endpoint("embeddings"),
                &body,
                self.config.timeout(),
            )
            .await?;

        let response: EmbeddingResponse = serde_json::from_value(value)?;
        response.into_ordered(texts.len())
    }

    async fn complete(
        &self,
        operation: &'static str,
        request: &CompletionRequest,
        options: &GenerateOptions,
    ) -> Result<CompletionResponse> {
        let body = serde_json::to_value(request)?;
        let timeout = options.timeout.unwrap_or_else(|| self.config.timeout());
        let value = self
            .execute(
                operation,
                &self.config.endpoint("chat/completions"),
                &body,
                timeout,
            )
            .await?;

        Ok(serde_json::from_value(value)?)
    }

    fn backoff_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: Duration::from_secs(1),
            initial_interval: Duration::from_secs(1),
            max_interval: self.config.max_retry_after(),
            randomization_factor: 0.1,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    fn keys_tried(&self, tried: &[usize]) -> Vec<String> {
        tried
            .iter()
            .filter_map(|&i| self.pool.get(i))
            .map(|k| k.label().to_string())
            .collect()
    }

    fn unavailable(
        &self,
        operation: &str,
        reason: String,
        attempts: u32,
        tried: &[usize],
        last_error: Option<ApiError>,
    ) -> PoolError {
        error!(operation, attempts, %reason, "request failed: service unavailable");
        PoolError::ServiceUnavailable {
            reason,
            attempts,
            keys_tried: self.keys_tried(tried),
            last_error,
        }
    }

    /// Run one logical request with key selection, admission, retries and failover
    async fn execute(
        &self,
        operation: &'static str,
        url: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<Value> {
        let deadline = Instant::now() + self.config.request_deadline();
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut backoff = self.backoff_policy();

        let mut tried: Vec<usize> = Vec::new();
        let mut attempts: u32 = 0;
        let mut last_error: Option<ApiError> = None;
        let mut last_failure_at: Option<Instant> = None;

        while attempts < max_attempts {
            let key = match self.acquire_key(&tried, deadline).await {
                Ok(key) => key,
                Err(reason) => {
                    return Err(self.unavailable(operation, reason, attempts, &tried, last_error))
                }
            };
            let mut probe = ProbeSlot::new(key);

            if tried.contains(&key.index()) {
                let target = match last_error.as_ref().and_then(|e| e.retry_after) {
                    Some(retry_after) => retry_after.min(self.config.max_retry_after()),
                    None => backoff.next_backoff().unwrap_or(self.config.max_retry_after()),
                };
                let delay = last_failure_at
                    .map_or(target, |at| target.saturating_sub(at.elapsed()));

                if Instant::now() + delay >= deadline {
                    return Err(self.unavailable(
                        operation,
                        "request deadline exceeded before retry".to_string(),
                        attempts,
                        &tried,
                        last_error,
                    ));
                }
                debug!(
                    key = %key.label(),
                    delay_ms = delay.as_millis() as u64,
                    "backing off before reusing key"
                );
                tokio::time::sleep(delay).await;
            } else {
                tried.push(key.index());
            }

            let attempt_timeout = timeout.min(deadline.saturating_duration_since(Instant::now()));
            if attempt_timeout.is_zero() {
                return Err(self.unavailable(
                    operation,
                    "request deadline exceeded".to_string(),
                    attempts,
                    &tried,
                    last_error,
                ));
            }

            attempts += 1;
            let in_flight = key.metrics().begin_request();
            let started = Instant::now();

            let outcome = match tokio::time::timeout(
                attempt_timeout,
                self.transport.request(
                    Method::POST,
                    url,
                    &self.headers[key.index()],
                    Some(body),
                    attempt_timeout,
                ),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ApiError::timeout(format!(
                    "No response within {:.1}s",
                    attempt_timeout.as_secs_f64()
                ))),
            };
            let latency = started.elapsed();
            drop(in_flight);

            let err = match outcome {
                Ok(value) => {
                    key.metrics().record_success(latency);
                    key.breaker().record_success();
                    probe.resolve();
                    debug!(
                        operation,
                        key = %key.label(),
                        attempt = attempts,
                        latency_ms = latency.as_millis() as u64,
                        "request succeeded"
                    );
                    return Ok(value);
                }
                Err(err) => err,
            };

            key.metrics().record_failure(err.status_code);
            if err.kind.trips_breaker() {
                key.breaker().record_failure(err.kind);
                probe.resolve();
            }
            drop(probe);

            if err.kind == ErrorKind::RateLimited {
                let cooldown = err
                    .retry_after
                    .unwrap_or_else(|| self.config.rate_limit_cooldown())
                    .min(self.config.max_retry_after());
                key.mark_rate_limited(cooldown);
            }

            warn!(
                operation,
                key = %key.label(),
                attempt = attempts,
                max_attempts,
                kind = %err.kind,
                status = ?err.status_code,
                error = %err.message,
                "request attempt failed"
            );

            if !err.kind.is_retryable() {
                return Err(PoolError::Api(err));
            }
            last_error = Some(err);
            last_failure_at = Some(Instant::now());
        }

        match last_error {
            Some(last_error) => {
                error!(
                    operation,
                    attempts,
                    keys = tried.len(),
                    error = %last_error,
                    "request failed after exhausting retries"
                );
                Err(PoolError::RetriesExhausted {
                    attempts,
                    keys_tried: self.keys_tried(&tried),
                    last_error,
                })
            }
            None => Err(self.unavailable(
                operation,
                "no attempt was made".to_string(),
                attempts,
                &tried,
                None,
            )),
        }
    }

    /// Find a key with breaker admission and a token, waiting when every key is blocked.
    ///
    /// Untried keys are preferred; keys already tried in this request are the fallback.
    async fn acquire_key(
        &self,
        tried: &[usize],
        deadline: Instant,
    ) -> std::result::Result<&ApiKeyRecord, String> {
        loop {
            let mut soonest_token: Option<Duration> = None;
            let mut excluded: Vec<usize> = tried.to_vec();
            let mut include_tried = tried.is_empty();

            loop {
                match self.pool.select_key(&excluded) {
                    Ok(key) => match key.bucket().try_acquire() {
                        Admission::Admitted => return Ok(key),
                        Admission::Wait(wait) => {
                            key.breaker().release_probe();
                            soonest_token = Some(soonest_token.map_or(wait, |s| s.min(wait)));
                            excluded.push(key.index());
                        }
                    },
                    Err(PoolExhausted) if !include_tried => {
                        include_tried = true;
                        excluded.retain(|i| !tried.contains(i));
                    }
                    Err(PoolExhausted) => break,
                }
            }

            let wait = match (soonest_token, self.pool.soonest_recovery()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let probing = self.pool.probing_keys();

            if wait.is_none() && probing.is_empty() {
                return Err("all keys unavailable: circuits open".to_string());
            }
            if self.config.rate_limit_mode == RateLimitMode::Reject {
                return Err(match wait {
                    Some(wait) => format!(
                        "all keys throttled; next capacity in {:.2}s",
                        wait.as_secs_f64()
                    ),
                    None => "all keys busy probing".to_string(),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err("request deadline exceeded while waiting for a key".to_string());
            }
            if probing.is_empty() && wait.is_some_and(|w| now + w > deadline) {
                return Err("no key recovers before the request deadline".to_string());
            }
            let until = wait.map_or(deadline, |w| (now + w).min(deadline));

            debug!(
                wait_ms = until.saturating_duration_since(now).as_millis() as u64,
                probing = probing.len(),
                "all keys blocked, waiting"
            );

            let sleep = tokio::time::sleep_until(until);
            if probing.is_empty() {
                sleep.await;
                continue;
            }

            let mut resolved: Vec<Pin<Box<tokio::sync::futures::Notified<'_>>>> = probing
                .iter()
                .map(|key| Box::pin(key.breaker().probe_resolved().notified()))
                .collect();
            for notified in resolved.iter_mut() {
                notified.as_mut().enable();
            }
            // A probe may have resolved before we registered
            if probing.iter().any(|key| !key.breaker().is_probing()) {
                continue;
            }

            tokio::select! {
                _ = sleep => {}
                _ = futures::future::select_all(resolved) => {}
            }
        }
    }
}

fn build_headers(config: &PoolConfig, key: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();

    let mut auth = HeaderValue::from_str(&format!("Bearer {}", key))
        .map_err(|_| PoolError::Config("API key contains invalid header characters".to_string()))?;
    auth.set_sensitive(true);
    headers.insert(AUTHORIZATION, auth);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    for (name, value) in [("http-referer", &config.app_url), ("x-title", &config.app_name)] {
        if let Some(value) = value {
            let value = HeaderValue::from_str(value).map_err(|_| {
                PoolError::Config(format!("Invalid value for header {}: {}", name, value))
            })?;
            headers.insert(HeaderName::from_static(name), value);
        }
    }

    Ok(headers)
}
