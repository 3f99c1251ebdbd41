use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }

    /// Forward-only transitions. Nothing leaves a terminal state.
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        if *self == next {
            return true;
        }
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
}

/// One attempted URL (or flow step) of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedPage {
    pub url: String,
    pub title: String,
    pub filename: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 1-based, assigned when the result is recorded.
    pub order: usize,
    pub depth: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_step: Option<usize>,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub duration_ms: u64,
    /// Empty for failed captures. Never serialized; archives carry the bytes.
    #[serde(skip)]
    pub image_bytes: Bytes,
}

impl CapturedPage {
    pub fn has_image(&self) -> bool {
        self.success && !self.image_bytes.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlJob {
    pub session_id: String,
    pub base_url: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub pages: Vec<CapturedPage>,
    pub progress: Progress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CrawlJob {
    pub fn new(session_id: impl Into<String>, base_url: &Url) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            base_url: base_url.to_string(),
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            pages: Vec::new(),
            progress: Progress::default(),
            error: None,
        }
    }

    pub fn success_count(&self) -> usize {
        self.pages.iter().filter(|page| page.success).count()
    }

    pub fn failure_count(&self) -> usize {
        self.pages.iter().filter(|page| !page.success).count()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Applies a partial update in one step. Returns false when the update
    /// was ignored because the job already reached a terminal state.
    pub fn apply(&mut self, update: JobUpdate) -> bool {
        if self.is_terminal() {
            warn!(
                session_id = %self.session_id,
                status = self.status.as_str(),
                "Ignoring update to finished job"
            );
            return false;
        }

        self.pages.extend(update.append_pages);

        if let Some(progress) = update.progress {
            self.progress.current = self.progress.current.max(progress.current);
            self.progress.total = progress.total;
        }
        self.progress.current = self.progress.current.max(self.pages.len());
        self.progress.total = self.progress.total.max(self.progress.current);

        if let Some(status) = update.status {
            if self.status.can_advance_to(status) {
                self.status = status;
            } else {
                warn!(
                    session_id = %self.session_id,
                    from = self.status.as_str(),
                    to = status.as_str(),
                    "Ignoring status regression"
                );
            }
        }

        if self.status == JobStatus::Failed {
            self.error = update.error.or_else(|| self.error.take());
        }

        let now = Utc::now();
        if self.is_terminal() {
            self.completed_at = Some(now);
        }
        self.updated_at = now;
        true
    }

    pub fn report(&self) -> JobStatusReport {
        JobStatusReport {
            session_id: self.session_id.clone(),
            base_url: self.base_url.clone(),
            status: self.status,
            progress: self.progress,
            success_count: self.success_count(),
            failure_count: self.failure_count(),
            error: self.error.clone(),
            pages: self.pages.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Partial record written by the job's single mutator.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<Progress>,
    pub append_pages: Vec<CapturedPage>,
    pub error: Option<String>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn progress(progress: Progress) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }

    pub fn page(page: CapturedPage, progress: Progress) -> Self {
        Self {
            progress: Some(progress),
            append_pages: vec![page],
            ..Self::default()
        }
    }

    pub fn completed(progress: Progress) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            progress: Some(progress),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Externally visible snapshot of a job: what pollers and the status
/// endpoint see. Pages are listed without image bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusReport {
    pub session_id: String,
    pub base_url: String,
    pub status: JobStatus,
    pub progress: Progress,
    pub success_count: usize,
    pub failure_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub pages: Vec<CapturedPage>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}
