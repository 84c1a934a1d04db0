//! Retry, concurrency limiting and pacing for backend calls

pub mod concurrency;
pub mod config;
pub mod retry;

pub use concurrency::ConcurrencyLimiter;
pub use config::{
    ConcurrencyConfig, MonitoringConfig, RateLimitConfig, ResilienceConfig,
    ResilienceConfigBuilder,
};
pub use retry::{RetryConfig, RetryPolicy, RetryableError};
