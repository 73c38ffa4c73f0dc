//! Router Module
//!
//! Handles API key pool management and key selection.

pub mod key_pool;
pub mod strategy;

pub use key_pool::{
    mask_key, ApiKeyRecord, InFlightGuard, KeyMetrics, KeyPool, KeyPoolSettings, KeyPoolStats,
    KeyStats, PoolExhausted,
};
pub use strategy::{Candidate, KeySelectionStrategy, Selector};
