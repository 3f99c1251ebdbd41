//! Crawl job records and the store that holds them while a job runs and
//! until its archive is downloaded or the retention sweeper evicts it.

use thiserror::Error;
use uuid::Uuid;

mod model;
mod retention;
mod store;

pub use model::{CapturedPage, CrawlJob, JobStatus, JobStatusReport, JobUpdate, Progress};
pub use retention::{spawn_retention_sweeper, RetentionPolicy};
pub use store::{InMemoryJobStore, JobStore};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session already exists: {0}")]
    AlreadyExists(String),
    #[error("Session not found: {0}")]
    NotFound(String),
}

/// Opaque, collision-resistant session id.
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}
