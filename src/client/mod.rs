//! Client Module
//!
//! Transport, per-key rate limiting and circuit breaking.

pub mod circuit_breaker;
pub mod http;
pub mod rate_limiter;
pub mod transport;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use http::HttpTransport;
pub use rate_limiter::{Admission, RateLimitMode, Throttled, TokenBucket, MAX_TOKEN_WAIT};
pub use transport::Transport;
