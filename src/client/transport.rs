//! Transport Boundary
//!
//! The only I/O seam of the pool. Production uses [`HttpTransport`](super::HttpTransport);
//! tests substitute scripted doubles.

use crate::error::ApiError;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde_json::Value;
use std::time::Duration;

/// Sends one request and returns the parsed JSON body, or a classified error
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(
        &self,
        method: Method,
        url: &str,
        headers: &HeaderMap,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<Value, ApiError>;
}
