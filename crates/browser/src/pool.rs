use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{BrowserDriver, BrowserError, BrowserLauncher};

/// When a pooled browser is thrown away and relaunched.
#[derive(Debug, Clone, Copy)]
pub struct PoolPolicy {
    pub max_age: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(30 * 60),
            idle_timeout: Duration::from_secs(5 * 60),
        }
    }
}

struct PooledBrowser {
    driver: Arc<dyn BrowserDriver>,
    launched_at: Instant,
    last_used: Instant,
}

/// Lazily launched browser shared by every job in the process.
///
/// Callers get an `Arc` to the same running browser and open their own
/// contexts on it. A browser older than `max_age`, or unused for longer than
/// `idle_timeout`, is replaced on the next `acquire`; jobs still holding the
/// old handle keep it alive until they finish.
pub struct BrowserPool {
    launcher: Arc<dyn BrowserLauncher>,
    policy: PoolPolicy,
    current: Mutex<Option<PooledBrowser>>,
}

impl BrowserPool {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, policy: PoolPolicy) -> Self {
        Self {
            launcher,
            policy,
            current: Mutex::new(None),
        }
    }

    pub async fn acquire(&self) -> Result<Arc<dyn BrowserDriver>, BrowserError> {
        let mut current = self.current.lock().await;
        let now = Instant::now();

        if let Some(pooled) = current.as_mut() {
            let expired = now.duration_since(pooled.launched_at) >= self.policy.max_age;
            let idle = now.duration_since(pooled.last_used) >= self.policy.idle_timeout;
            if !expired && !idle {
                pooled.last_used = now;
                return Ok(pooled.driver.clone());
            }

            info!(expired, idle, "Recycling pooled browser");
            if let Some(old) = current.take() {
                if let Err(e) = old.driver.close().await {
                    warn!("Failed to close recycled browser: {}", e);
                }
            }
        }

        debug!("Launching pooled browser");
        let driver = self.launcher.launch().await?;
        *current = Some(PooledBrowser {
            driver: driver.clone(),
            launched_at: now,
            last_used: now,
        });
        Ok(driver)
    }

    /// Closes the pooled browser, if any. The next `acquire` relaunches.
    pub async fn shutdown(&self) {
        if let Some(pooled) = self.current.lock().await.take() {
            if let Err(e) = pooled.driver.close().await {
                warn!("Failed to close browser on shutdown: {}", e);
            }
            info!("Browser pool shut down");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.current.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockLauncher, MockSite};

    fn pool_with(launcher: Arc<MockLauncher>, policy: PoolPolicy) -> BrowserPool {
        BrowserPool::new(launcher, policy)
    }

    #[tokio::test]
    async fn test_pool_reuses_browser() {
        let launcher = Arc::new(MockLauncher::new(MockSite::new()));
        let pool = pool_with(launcher.clone(), PoolPolicy::default());

        assert!(!pool.is_running().await);
        pool.acquire().await.unwrap();
        pool.acquire().await.unwrap();
        assert!(pool.is_running().await);
        assert_eq!(launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_pool_recycles_expired_browser() {
        let launcher = Arc::new(MockLauncher::new(MockSite::new()));
        let policy = PoolPolicy {
            max_age: Duration::ZERO,
            idle_timeout: Duration::from_secs(60),
        };
        let pool = pool_with(launcher.clone(), policy);

        pool.acquire().await.unwrap();
        pool.acquire().await.unwrap();
        assert_eq!(launcher.launch_count(), 2);
    }

    #[tokio::test]
    async fn test_pool_surfaces_launch_failure() {
        let launcher = Arc::new(MockLauncher::failing("chromium not found"));
        let pool = pool_with(launcher, PoolPolicy::default());

        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, BrowserError::LaunchFailed(_)));
        assert!(!pool.is_running().await);
    }

    #[tokio::test]
    async fn test_pool_shutdown_releases_browser() {
        let launcher = Arc::new(MockLauncher::new(MockSite::new()));
        let pool = pool_with(launcher.clone(), PoolPolicy::default());

        pool.acquire().await.unwrap();
        pool.shutdown().await;
        assert!(!pool.is_running().await);
        pool.acquire().await.unwrap();
        assert_eq!(launcher.launch_count(), 2);
    }
}
