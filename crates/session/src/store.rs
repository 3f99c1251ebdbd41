use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::model::{CrawlJob, JobUpdate};
use crate::SessionError;

/// Key-value persistence of crawl jobs, addressed by session id.
///
/// Each session has a single writer (the job's orchestrator run); readers
/// always receive a complete snapshot.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: CrawlJob) -> Result<(), SessionError>;

    async fn get(&self, session_id: &str) -> Result<Option<CrawlJob>, SessionError>;

    /// Returns false when the session does not exist (evicted or never
    /// created). That is logged, not treated as an error.
    async fn update(&self, session_id: &str, update: JobUpdate) -> Result<bool, SessionError>;

    async fn delete(&self, session_id: &str) -> Result<Option<CrawlJob>, SessionError>;

    async fn list_all(&self) -> Result<HashMap<String, CrawlJob>, SessionError>;

    /// Removes every job created before `cutoff`, returning their ids.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, SessionError>;
}

/// Single-process store. Updates and purges both hold the write lock, so a
/// purge never observes a half-applied update.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<String, CrawlJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: CrawlJob) -> Result<(), SessionError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.session_id) {
            return Err(SessionError::AlreadyExists(job.session_id));
        }
        info!(session_id = %job.session_id, url = %job.base_url, "Job created");
        jobs.insert(job.session_id.clone(), job);
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<CrawlJob>, SessionError> {
        Ok(self.jobs.read().await.get(session_id).cloned())
    }

    async fn update(&self, session_id: &str, update: JobUpdate) -> Result<bool, SessionError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(session_id) {
            Some(job) => {
                let applied = job.apply(update);
                debug!(
                    session_id,
                    status = job.status.as_str(),
                    current = job.progress.current,
                    total = job.progress.total,
                    "Job updated"
                );
                Ok(applied)
            }
            None => {
                warn!(session_id, "Update for unknown session ignored");
                Ok(false)
            }
        }
    }

    async fn delete(&self, session_id: &str) -> Result<Option<CrawlJob>, SessionError> {
        let removed = self.jobs.write().await.remove(session_id);
        if removed.is_some() {
            info!(session_id, "Job removed");
        }
        Ok(removed)
    }

    async fn list_all(&self) -> Result<HashMap<String, CrawlJob>, SessionError> {
        Ok(self.jobs.read().await.clone())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, SessionError> {
        let mut jobs = self.jobs.write().await;
        let expired: Vec<String> = jobs
            .values()
            .filter(|job| job.created_at < cutoff)
            .map(|job| job.session_id.clone())
            .collect();
        for session_id in &expired {
            jobs.remove(session_id);
        }
        Ok(expired)
    }
}
