use browser::{ImageFormat, Viewport, WaitStrategy};
use capture::CaptureOptions;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::OrchestratorError;

pub const MAX_LINKS_LIMIT: usize = 100;
pub const MAX_DEPTH_LIMIT: usize = 5;
pub const MAX_FLOW_STEPS_LIMIT: usize = 20;

pub fn default_flow_keywords() -> Vec<String> {
    ["next", "continue", "get started", "start", "sign up", "learn more"]
        .iter()
        .map(|k| k.to_string())
        .collect()
}

/// Everything a caller can tune about one crawl job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CrawlOptions {
    /// Link-crawl pages captured in addition to the seed.
    pub max_links: usize,
    /// Deepest level whose pages are expanded further. The seed is always expanded.
    pub max_depth: usize,
    /// Per page: navigation plus render.
    pub timeout_ms: u64,
    pub concurrency: usize,
    pub wait_strategy: WaitStrategy,
    pub capture_flow: bool,
    /// Tried in order; the first visible element whose text contains one wins.
    pub flow_keywords: Vec<String>,
    pub max_flow_steps: usize,
    /// Wall-clock budget of the whole job. No new page is started after it.
    pub job_budget_ms: u64,
    pub viewport: Viewport,
    pub full_page: bool,
    pub post_load_delay_ms: u64,
    pub format: ImageFormat,
    pub quality: u32,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            max_links: 5,
            max_depth: 0,
            timeout_ms: 30_000,
            concurrency: 1,
            wait_strategy: WaitStrategy::NetworkIdle,
            capture_flow: false,
            flow_keywords: default_flow_keywords(),
            max_flow_steps: 5,
            job_budget_ms: 300_000,
            viewport: Viewport::default(),
            full_page: true,
            post_load_delay_ms: 1000,
            format: ImageFormat::Png,
            quality: 80,
        }
    }
}

impl CrawlOptions {
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        let invalid = |message: String| Err(OrchestratorError::InvalidInput(message));

        if self.concurrency == 0 {
            return invalid("concurrency must be at least 1".to_string());
        }
        if self.max_links > MAX_LINKS_LIMIT {
            return invalid(format!("maxLinks must be at most {}", MAX_LINKS_LIMIT));
        }
        if self.max_depth > MAX_DEPTH_LIMIT {
            return invalid(format!("maxDepth must be at most {}", MAX_DEPTH_LIMIT));
        }
        if self.max_flow_steps > MAX_FLOW_STEPS_LIMIT {
            return invalid(format!("maxFlowSteps must be at most {}", MAX_FLOW_STEPS_LIMIT));
        }
        if self.viewport.width == 0 || self.viewport.height == 0 {
            return invalid("viewport must be non-zero".to_string());
        }
        if self.timeout_ms == 0 {
            return invalid("timeoutMs must be positive".to_string());
        }
        if self.quality > 100 {
            return invalid("quality must be between 0 and 100".to_string());
        }
        if self.capture_flow && self.flow_keywords.iter().all(|k| k.trim().is_empty()) {
            return invalid("captureFlow needs at least one flow keyword".to_string());
        }
        Ok(())
    }

    pub fn job_budget(&self) -> Duration {
        Duration::from_millis(self.job_budget_ms)
    }

    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            timeout_ms: self.timeout_ms,
            wait_strategy: self.wait_strategy,
            viewport: self.viewport,
            full_page: self.full_page,
            post_load_delay_ms: self.post_load_delay_ms,
            format: self.format,
            quality: self.quality,
        }
    }
}
