//! HTTP Transport
//!
//! `reqwest` implementation of [`Transport`] mapping provider failures to [`ApiError`].

use crate::client::transport::Transport;
use crate::error::{ApiError, ErrorKind, PoolError, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Method, Response};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// HTTP transport shared by every key in the pool
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(20)
            .build()
            .map_err(|e| PoolError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// Wrap an already configured client (proxies, custom TLS)
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn into_json(response: Response) -> std::result::Result<Value, ApiError> {
        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let text = response.text().await?;
        let body: Option<Value> = serde_json::from_str(&text).ok();

        if status.is_success() {
            let body = body.ok_or_else(|| {
                ApiError::new(
                    ErrorKind::Unexpected,
                    format!("Failed to parse response body: {}", snippet(&text)),
                )
                .with_status(status.as_u16())
            })?;

            // OpenRouter reports some upstream failures inside a 2xx envelope
            if let Some(err) = embedded_error(&body, retry_after) {
                return Err(err);
            }
            return Ok(body);
        }

        let message = body
            .as_ref()
            .and_then(error_message)
            .unwrap_or_else(|| {
                if text.is_empty() {
                    status.to_string()
                } else {
                    snippet(&text)
                }
            });

        Err(ApiError::from_status(status.as_u16(), message, retry_after))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(
        &self,
        method: Method,
        url: &str,
        headers: &HeaderMap,
        body: Option<&Value>,
        timeout: Duration,
    ) -> std::result::Result<Value, ApiError> {
        debug!(%method, url, timeout_ms = timeout.as_millis() as u64, "sending provider request");

        let mut request = self
            .client
            .request(method, url)
            .headers(headers.clone())
            .timeout(timeout);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        Self::into_json(response).await
    }
}

/// First 500 characters of a body, for error messages
fn snippet(text: &str) -> String {
    text.chars().take(500).collect()
}

fn error_message(body: &Value) -> Option<String> {
    match body.get("error")? {
        Value::String(message) => Some(message.clone()),
        error => error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn embedded_error(body: &Value, retry_after: Option<Duration>) -> Option<ApiError> {
    let error = body
        .get("error")
        .filter(|error| error.is_object() || error.is_string())?;
    let message = error_message(body).unwrap_or_else(|| error.to_string());
    let code = error
        .get("code")
        .and_then(|c| c.as_u64().or_else(|| c.as_str().and_then(|s| s.parse().ok())))
        .and_then(|c| u16::try_from(c).ok())
        .unwrap_or(502);

    Some(ApiError::from_status(code, message, retry_after))
}

/// Parse `Retry-After` as seconds or a duration string such as "1m30s"
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    value
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
        .or_else(|| parse_duration_string(value))
}

/// Parse a duration string like "1m30s" or "2h" into a Duration
fn parse_duration_string(s: &str) -> Option<Duration> {
    let s = s.trim();

    if let Some(stripped) = s.strip_suffix("ms") {
        return stripped.parse::<u64>().ok().map(Duration::from_millis);
    }

    // Compound format first (e.g., "1m30s", "2h30m")
    if s.contains('h') || (s.contains('m') && s.contains('s')) {
        let mut total_secs = 0u64;
        let mut current_num = String::new();

        for c in s.chars() {
            if c.is_ascii_digit() {
                current_num.push(c);
            } else if !current_num.is_empty() {
                if let Ok(n) = current_num.parse::<u64>() {
                    let secs = match c {
                        'h' => n.checked_mul(3600),
                        'm' => n.checked_mul(60),
                        's' => Some(n),
                        _ => Some(0),
                    };
                    total_secs = total_secs.checked_add(secs?)?;
                }
                current_num.clear();
            }
        }

        if total_secs > 0 {
            return Some(Duration::from_secs(total_secs));
        }
    }

    if let Some(stripped) = s.strip_suffix('s') {
        return stripped
            .parse::<f64>()
            .ok()
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok());
    }
    if let Some(stripped) = s.strip_suffix('m') {
        return stripped
            .parse::<u64>()
            .ok()
            .and_then(|mins| mins.checked_mul(60))
            .map(Duration::from_secs);
    }

    None
}
