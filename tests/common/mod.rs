//! Shared test doubles for driving `PoolClient` without a network.

#![allow(dead_code)]

use async_trait::async_trait;
use llmpool::{ApiError, PoolConfig, Transport};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::Method;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// How the fake provider answers one call
#[derive(Debug, Clone)]
pub enum Reply {
    Json(Value),
    Error(ApiError),

    /// Answer after a delay
    Delayed(Duration, Value),

    /// Never answer
    Hang,
}

/// A chat completion reply whose content is `text`
pub fn completion(text: &str) -> Reply {
    Reply::Json(completion_body(text))
}

pub fn completion_body(text: &str) -> Value {
    json!({
        "id": "gen-1",
        "model": "test-model",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
    })
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub key: String,
    pub url: String,
    pub body: Option<Value>,
    pub timeout: Duration,
}

#[derive(Default)]
struct Script {
    queued: VecDeque<Reply>,
    fallback: Option<Reply>,
}

/// Transport answering from per-key scripts, keyed by the bearer token
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<RecordedCall>>,
    in_flight: Mutex<(usize, usize)>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every call on `key` with `reply` once queued replies run out
    pub fn always(self, key: &str, reply: Reply) -> Self {
        self.scripts.lock().entry(key.to_string()).or_default().fallback = Some(reply);
        self
    }

    /// Answer the next call on `key` with `reply`
    pub fn then(self, key: &str, reply: Reply) -> Self {
        self.scripts
            .lock()
            .entry(key.to_string())
            .or_default()
            .queued
            .push_back(reply);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_keys(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.key.clone()).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Highest number of calls that were ever in flight together
    pub fn max_concurrent(&self) -> usize {
        self.in_flight.lock().1
    }

    fn next_reply(&self, key: &str) -> Reply {
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(key) {
            Some(script) => script
                .queued
                .pop_front()
                .or_else(|| script.fallback.clone())
                .unwrap_or_else(|| Reply::Error(ApiError::server(500, "script exhausted"))),
            None => Reply::Error(ApiError::auth(format!("unknown key {}", key))),
        }
    }
}

struct InFlight<'a>(&'a Mutex<(usize, usize)>);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.lock().0 -= 1;
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn request(
        &self,
        _method: Method,
        url: &str,
        headers: &HeaderMap,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<Value, ApiError> {
        let key = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or_default()
            .to_string();

        self.calls.lock().push(RecordedCall {
            key: key.clone(),
            url: url.to_string(),
            body: body.cloned(),
            timeout,
        });

        let _guard = {
            let mut counts = self.in_flight.lock();
            counts.0 += 1;
            counts.1 = counts.1.max(counts.0);
            InFlight(&self.in_flight)
        };

        match self.next_reply(&key) {
            Reply::Json(value) => Ok(value),
            Reply::Error(err) => Err(err),
            Reply::Delayed(delay, value) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            Reply::Hang => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

/// Config with generous rate limits so tests only hit the limits they set up
pub fn config(keys: &[&str]) -> PoolConfig {
    let mut config = PoolConfig::with_keys(keys.iter().copied());
    config.base_url = "http://llm.test/v1".to_string();
    config.model_text = "text-model".to_string();
    config.model_vision = "vision-model".to_string();
    config.model_embedding = "embed-model".to_string();
    config.qps_per_key = 100.0;
    config.burst_multiplier = 1.0;
    config.max_retries = 3;
    config.circuit_failure_threshold = 5;
    config.circuit_cooldown_s = 30.0;
    config
}
