//! Configuration Module
//!
//! Handles pool configuration loading and validation.

pub mod loader;
pub mod settings;

pub use loader::ConfigLoader;
pub use settings::PoolConfig;
