//! Drives one crawl job end to end: seed capture, link discovery,
//! breadth-first capture of the frontier, optional flow capture, and
//! progress reporting into the job store.

use thiserror::Error;

mod archive;
mod options;
mod runner;

pub use archive::{archive_job, archive_metadata};
pub use options::{default_flow_keywords, CrawlOptions};
pub use runner::Orchestrator;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Store error: {0}")]
    Store(#[from] session::SessionError),
}
