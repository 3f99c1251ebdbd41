use browser::{
    scripts, BrowserError, Clip, ImageFormat, PageHandle, ScreenshotOptions, Viewport, WaitStrategy,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

/// Tallest full-page capture taken; longer pages are cut at this height.
pub const MAX_FULL_PAGE_HEIGHT: u32 = 16_384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Timeout,
    Connection,
    Render,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Connection => "connection",
            FailureKind::Render => "render",
        };
        f.write_str(name)
    }
}

/// Why a single page could not be captured. Always returned, never raised
/// past the worker, so a batch can continue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct CaptureFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl CaptureFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<BrowserError> for CaptureFailure {
    fn from(error: BrowserError) -> Self {
        let kind = match &error {
            BrowserError::Timeout(_) => FailureKind::Timeout,
            BrowserError::Connection(_) | BrowserError::Navigation(_) => FailureKind::Connection,
            BrowserError::Script(_)
            | BrowserError::Screenshot(_)
            | BrowserError::Closed(_)
            | BrowserError::LaunchFailed(_) => FailureKind::Render,
        };
        CaptureFailure::new(kind, error.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureOptions {
    pub timeout_ms: u64,
    pub wait_strategy: WaitStrategy,
    pub viewport: Viewport,
    pub full_page: bool,
    pub post_load_delay_ms: u64,
    pub format: ImageFormat,
    /// JPEG quality, ignored for PNG.
    pub quality: u32,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            wait_strategy: WaitStrategy::NetworkIdle,
            viewport: Viewport::default(),
            full_page: true,
            post_load_delay_ms: 1000,
            format: ImageFormat::Png,
            quality: 80,
        }
    }
}

impl CaptureOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone)]
pub struct CapturedImage {
    pub bytes: Bytes,
    pub width: u32,
    pub height: u32,
    pub duration_ms: u64,
    /// Best effort, empty when the page has none.
    pub title: String,
    pub final_url: String,
}

pub type CapturePageResult = Result<CapturedImage, CaptureFailure>;

/// Loads one URL into a page and screenshots it.
///
/// The worker only touches the page it is handed; whoever owns the page
/// decides whether captures share a browsing context.
#[derive(Debug, Clone, Default)]
pub struct CaptureWorker {
    options: CaptureOptions,
}

impl CaptureWorker {
    pub fn new(options: CaptureOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &CaptureOptions {
        &self.options
    }

    pub async fn capture(&self, page: &dyn PageHandle, url: &Url) -> CapturePageResult {
        let started = Instant::now();
        info!(url = %url, wait = self.options.wait_strategy.as_str(), "Capturing page");

        if let Err(e) = page
            .goto(url.as_str(), self.options.wait_strategy, self.options.timeout())
            .await
        {
            let failure = CaptureFailure::from(e);
            warn!(url = %url, "Navigation failed: {}", failure);
            return Err(failure);
        }

        if self.options.post_load_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.options.post_load_delay_ms)).await;
        }

        self.screenshot(page, started).await
    }

    /// Screenshots whatever the page shows right now, without navigating.
    pub async fn capture_current(&self, page: &dyn PageHandle) -> CapturePageResult {
        self.screenshot(page, Instant::now()).await
    }

    async fn screenshot(&self, page: &dyn PageHandle, started: Instant) -> CapturePageResult {
        let remaining = self.options.timeout().saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(CaptureFailure::new(
                FailureKind::Timeout,
                format!("no time left to render within {} ms", self.options.timeout_ms),
            ));
        }

        match tokio::time::timeout(remaining, self.render(page, started)).await {
            Ok(result) => result,
            Err(_) => Err(CaptureFailure::new(
                FailureKind::Timeout,
                format!("rendering exceeded {} ms", self.options.timeout_ms),
            )),
        }
    }

    async fn render(&self, page: &dyn PageHandle, started: Instant) -> CapturePageResult {
        let (width, height, clip) = self.capture_area(page).await;
        let options = ScreenshotOptions {
            format: self.options.format,
            quality: Some(self.options.quality),
            clip,
        };
        let bytes = page.screenshot(options).await.map_err(CaptureFailure::from)?;

        let title = page.title().await.unwrap_or_else(|e| {
            debug!("No title available: {}", e);
            String::new()
        });
        let final_url = page.current_url().await.unwrap_or_default();
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        debug!(url = %final_url, width, height, size = bytes.len(), duration_ms, "Screenshot taken");
        Ok(CapturedImage {
            bytes,
            width,
            height,
            duration_ms,
            title,
            final_url,
        })
    }

    async fn capture_area(&self, page: &dyn PageHandle) -> (u32, u32, Option<Clip>) {
        let viewport = self.options.viewport;
        if !self.options.full_page {
            return (viewport.width, viewport.height, None);
        }

        match page.evaluate(scripts::PAGE_DIMENSIONS).await {
            Ok(value) => {
                let measure = |index: usize| {
                    value
                        .get(index)
                        .and_then(serde_json::Value::as_u64)
                        .and_then(|v| u32::try_from(v).ok())
                };
                let width = measure(0).filter(|w| *w > 0).unwrap_or(viewport.width);
                let height = measure(1)
                    .filter(|h| *h > 0)
                    .unwrap_or(viewport.height)
                    .min(MAX_FULL_PAGE_HEIGHT);
                (width, height, Some(Clip { width, height }))
            }
            Err(e) => {
                warn!("Could not measure page, capturing viewport only: {}", e);
                (viewport.width, viewport.height, None)
            }
        }
    }
}
