//! Concurrency limiter for in-flight backend calls

use std::sync::Arc;

use log::debug;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

use super::config::ConcurrencyConfig;

/// Permit count used when limiting is disabled
const UNLIMITED_PERMITS: usize = 1_000_000;

/// Semaphore-based limiter shared by all calls of a batch
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    config: ConcurrencyConfig,
}

impl ConcurrencyLimiter {
    pub fn new(config: ConcurrencyConfig) -> Self {
        let permits = if config.enabled {
            config.max_concurrent_requests.clamp(1, UNLIMITED_PERMITS)
        } else {
            UNLIMITED_PERMITS
        };

        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            config,
        }
    }

    /// Wait for a permit; it is released when dropped
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        if self.config.enabled && self.semaphore.available_permits() == 0 {
            debug!(
                "Concurrency limiter: waiting for permit ({} in use)",
                self.config.max_concurrent_requests
            );
        }
        self.semaphore.clone().acquire_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(max: usize, enabled: bool) -> ConcurrencyLimiter {
        ConcurrencyLimiter::new(ConcurrencyConfig {
            max_concurrent_requests: max,
            enabled,
        })
    }

    #[tokio::test]
    async fn test_disabled_allows_many() {
        let limiter = limiter(2, false);
        let mut permits = Vec::new();
        for _ in 0..50 {
            permits.push(limiter.acquire().await.unwrap());
        }
        assert_eq!(permits.len(), 50);
    }

    #[tokio::test]
    async fn test_caps_at_max() {
        let limiter = limiter(2, true);
        let p1 = limiter.acquire().await.unwrap();
        let _p2 = limiter.acquire().await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(20), limiter.acquire()).await;
        assert!(blocked.is_err());

        drop(p1);
        let freed = tokio::time::timeout(Duration::from_millis(200), limiter.acquire()).await;
        assert!(freed.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let limiter = limiter(1, true);
        let waiting = limiter.clone();

        let permit = limiter.acquire().await.unwrap();
        let handle = tokio::spawn(async move { waiting.acquire().await.is_ok() });

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(permit);

        let result = tokio::time::timeout(Duration::from_millis(200), handle).await;
        assert!(result.unwrap().unwrap());
    }
}
