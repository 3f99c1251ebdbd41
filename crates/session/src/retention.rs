use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::store::JobStore;

/// How long finished and abandoned jobs are kept.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub retention: Duration,
    pub sweep_interval: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Periodically evicts jobs older than the retention window, regardless of
/// status. Runs until `cancel` fires.
pub fn spawn_retention_sweeper(
    store: Arc<dyn JobStore>,
    policy: RetentionPolicy,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            retention_secs = policy.retention.as_secs(),
            interval_secs = policy.sweep_interval.as_secs(),
            "Retention sweeper started"
        );
        let mut ticker = tokio::time::interval(policy.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Ok(window) = chrono::Duration::from_std(policy.retention) else {
                error!("Retention window out of range, sweeper stopping");
                break;
            };
            match store.purge_older_than(Utc::now() - window).await {
                Ok(purged) if purged.is_empty() => debug!("Nothing to evict"),
                Ok(purged) => info!(count = purged.len(), sessions = ?purged, "Evicted expired jobs"),
                Err(e) => error!("Retention sweep failed: {}", e),
            }
        }
        info!("Retention sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CrawlJob;
    use crate::store::InMemoryJobStore;
    use url::Url;

    #[tokio::test]
    async fn test_sweeper_evicts_old_jobs_and_stops_on_cancel() {
        let store = Arc::new(InMemoryJobStore::new());
        let base = Url::parse("https://example.com").unwrap();

        let mut stale = CrawlJob::new("stale", &base);
        stale.created_at = Utc::now() - chrono::Duration::hours(2);
        store.create(stale).await.unwrap();
        store.create(CrawlJob::new("fresh", &base)).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = spawn_retention_sweeper(
            store.clone(),
            RetentionPolicy {
                retention: Duration::from_secs(3600),
                sweep_interval: Duration::from_millis(10),
            },
            cancel.clone(),
        );

        for _ in 0..100 {
            if store.get("stale").await.unwrap().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.get("stale").await.unwrap().is_none());
        assert!(store.get("fresh").await.unwrap().is_some());

        cancel.cancel();
        handle.await.unwrap();
    }
}
