//! Browser engine contract used by the crawl and capture components.
//!
//! The rest of the workspace only talks to [`BrowserDriver`], [`BrowserContext`]
//! and [`PageHandle`]. [`chrome`] implements them on top of headless Chromium,
//! `mock` (behind the `mock` feature) implements them over an in-memory site
//! for tests.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod chrome;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod pool;
pub mod scripts;

pub use chrome::{ChromeLauncher, LaunchConfig};
pub use pool::{BrowserPool, PoolPolicy};

#[derive(Debug, Clone, Error)]
pub enum BrowserError {
    #[error("Failed to launch browser: {0}")]
    LaunchFailed(String),
    #[error("Navigation error: {0}")]
    Navigation(String),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Timeout error: {0}")]
    Timeout(String),
    #[error("Script error: {0}")]
    Script(String),
    #[error("Screenshot error: {0}")]
    Screenshot(String),
    #[error("Browser closed: {0}")]
    Closed(String),
}

impl BrowserError {
    /// Classifies a raw navigation error message coming back from the engine.
    pub fn from_navigation_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        if lower.contains("timeout") || lower.contains("timed out") || lower.contains("never came") {
            BrowserError::Timeout(message)
        } else if is_connection_failure(&lower) {
            BrowserError::Connection(message)
        } else {
            BrowserError::Navigation(message)
        }
    }
}

fn is_connection_failure(lower: &str) -> bool {
    const MARKERS: [&str; 7] = [
        "err_name_not_resolved",
        "err_connection",
        "err_address_unreachable",
        "err_internet_disconnected",
        "err_network_changed",
        "err_empty_response",
        "dns",
    ];
    MARKERS.iter().any(|marker| lower.contains(marker))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

/// When a navigation counts as finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WaitStrategy {
    DomReady,
    LoadComplete,
    #[default]
    NetworkIdle,
}

impl WaitStrategy {
    /// No-new-resources window used by [`WaitStrategy::NetworkIdle`].
    pub const QUIET_WINDOW: Duration = Duration::from_millis(500);

    pub fn as_str(&self) -> &'static str {
        match self {
            WaitStrategy::DomReady => "dom-ready",
            WaitStrategy::LoadComplete => "load-complete",
            WaitStrategy::NetworkIdle => "network-idle",
        }
    }
}

impl std::str::FromStr for WaitStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dom-ready" => Ok(WaitStrategy::DomReady),
            "load-complete" => Ok(WaitStrategy::LoadComplete),
            "network-idle" => Ok(WaitStrategy::NetworkIdle),
            other => Err(format!("unknown wait strategy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn extension(&self) -> &str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
        }
    }
}

/// Region of the page to capture, in CSS pixels from the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clip {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenshotOptions {
    pub format: ImageFormat,
    pub quality: Option<u32>,
    /// `None` captures the visible viewport only.
    pub clip: Option<Clip>,
}

#[async_trait]
pub trait PageHandle: Send + Sync {
    async fn goto(&self, url: &str, wait: WaitStrategy, timeout: Duration) -> Result<(), BrowserError>;

    async fn current_url(&self) -> Result<String, BrowserError>;

    async fn title(&self) -> Result<String, BrowserError>;

    async fn content(&self) -> Result<String, BrowserError>;

    /// Evaluates a JavaScript expression and returns its JSON value.
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, BrowserError>;

    async fn screenshot(&self, options: ScreenshotOptions) -> Result<Bytes, BrowserError>;

    async fn close(&self) -> Result<(), BrowserError>;
}

#[async_trait]
pub trait BrowserContext: Send + Sync {
    async fn new_page(&self) -> Result<Box<dyn PageHandle>, BrowserError>;

    async fn close(&self) -> Result<(), BrowserError>;
}

/// A running browser. May host many contexts at once; callers only own the
/// contexts and pages they create.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn new_context(&self, viewport: Viewport) -> Result<Box<dyn BrowserContext>, BrowserError>;

    async fn close(&self) -> Result<(), BrowserError>;
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn BrowserDriver>, BrowserError>;
}
