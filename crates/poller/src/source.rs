use async_trait::async_trait;
use session::{JobStatusReport, JobStore};
use std::sync::Arc;

use crate::{PollError, StatusSource};

/// Reads job state straight from an in-process store.
pub struct StoreStatusSource {
    store: Arc<dyn JobStore>,
}

impl StoreStatusSource {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StatusSource for StoreStatusSource {
    async fn fetch(&self, session_id: &str) -> Result<JobStatusReport, PollError> {
        match self.store.get(session_id).await {
            Ok(Some(job)) => Ok(job.report()),
            Ok(None) => Err(PollError::NotFound(session_id.to_string())),
            Err(e) => Err(PollError::Other(e.to_string())),
        }
    }
}
