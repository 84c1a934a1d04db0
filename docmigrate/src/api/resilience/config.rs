//! Resilience configuration with builder pattern and presets

use std::time::Duration;

use super::retry::RetryConfig;

/// Resilience settings for backend calls during a run
#[derive(Debug, Clone, Default)]
pub struct ResilienceConfig {
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub concurrency: ConcurrencyConfig,
    pub monitoring: MonitoringConfig,
}

/// Concurrency limiting within a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyConfig {
    /// Maximum in-flight calls
    pub max_concurrent_requests: usize,
    pub enabled: bool,
}

/// Pacing between batches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Pause after each batch
    pub batch_delay: Duration,
    pub enabled: bool,
}

/// Request logging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoringConfig {
    /// Log every outbound request at debug level
    pub request_logging: bool,
    /// Warn when a request takes longer than this
    pub slow_request_threshold: Duration,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 10,
            enabled: true,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            batch_delay: Duration::from_millis(250),
            enabled: true,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            request_logging: true,
            slow_request_threshold: Duration::from_secs(5),
        }
    }
}

impl RateLimitConfig {
    /// Delay to apply between batches
    pub fn effective_batch_delay(&self) -> Duration {
        if self.enabled {
            self.batch_delay
        } else {
            Duration::ZERO
        }
    }
}

impl ResilienceConfig {
    pub fn builder() -> ResilienceConfigBuilder {
        ResilienceConfigBuilder::new()
    }

    /// Slow and careful, for shared production backends
    pub fn conservative() -> Self {
        Self {
            retry: RetryConfig::conservative(),
            rate_limit: RateLimitConfig {
                batch_delay: Duration::from_secs(1),
                enabled: true,
            },
            concurrency: ConcurrencyConfig {
                max_concurrent_requests: 4,
                enabled: true,
            },
            monitoring: MonitoringConfig::default(),
        }
    }

    /// Fast iteration against a local backend
    pub fn development() -> Self {
        Self {
            retry: RetryConfig::aggressive(),
            rate_limit: RateLimitConfig {
                batch_delay: Duration::ZERO,
                enabled: false,
            },
            concurrency: ConcurrencyConfig {
                max_concurrent_requests: 25,
                enabled: false,
            },
            monitoring: MonitoringConfig {
                request_logging: true,
                slow_request_threshold: Duration::from_secs(2),
            },
        }
    }

    /// No retries, no limits, no pacing (tests, in-memory backend)
    pub fn disabled() -> Self {
        Self {
            retry: RetryConfig::disabled(),
            rate_limit: RateLimitConfig {
                batch_delay: Duration::ZERO,
                enabled: false,
            },
            concurrency: ConcurrencyConfig {
                max_concurrent_requests: usize::MAX,
                enabled: false,
            },
            monitoring: MonitoringConfig {
                request_logging: false,
                slow_request_threshold: Duration::MAX,
            },
        }
    }

    /// Bulk migration against a rate-limited backend
    pub fn migration() -> Self {
        Self {
            retry: RetryConfig {
                max_attempts: 5,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                backoff_multiplier: 2.0,
                jitter: true,
            },
            rate_limit: RateLimitConfig {
                batch_delay: Duration::from_millis(500),
                enabled: true,
            },
            concurrency: ConcurrencyConfig {
                max_concurrent_requests: 10,
                enabled: true,
            },
            monitoring: MonitoringConfig {
                request_logging: false,
                slow_request_threshold: Duration::from_secs(10),
            },
        }
    }

    /// Look up a preset by name
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "default" => Some(Self::default()),
            "conservative" => Some(Self::conservative()),
            "development" => Some(Self::development()),
            "disabled" => Some(Self::disabled()),
            "migration" => Some(Self::migration()),
            _ => None,
        }
    }
}

/// Builder for ResilienceConfig
#[derive(Debug, Default)]
pub struct ResilienceConfigBuilder {
    config: ResilienceConfig,
}

impl ResilienceConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration
    pub fn from_config(config: ResilienceConfig) -> Self {
        Self { config }
    }

    pub fn retry_config(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.retry.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.retry.max_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.retry.backoff_multiplier = multiplier;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.config.retry.jitter = enabled;
        self
    }

    pub fn batch_delay(mut self, delay: Duration) -> Self {
        self.config.rate_limit.batch_delay = delay;
        self
    }

    pub fn enable_rate_limiting(mut self, enabled: bool) -> Self {
        self.config.rate_limit.enabled = enabled;
        self
    }

    pub fn max_concurrent_requests(mut self, max: usize) -> Self {
        self.config.concurrency.max_concurrent_requests = max;
        self
    }

    pub fn enable_concurrency_limiting(mut self, enabled: bool) -> Self {
        self.config.concurrency.enabled = enabled;
        self
    }

    pub fn request_logging(mut self, enabled: bool) -> Self {
        self.config.monitoring.request_logging = enabled;
        self
    }

    pub fn build(self) -> ResilienceConfig {
        self.config
    }
}
