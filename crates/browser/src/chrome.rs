//! Headless Chromium implementation of the driver contract.
//!
//! `headless_chrome` exposes a blocking API, so every call runs on the tokio
//! blocking pool and is bounded by a timeout on the async side.

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use headless_chrome::browser::context::Context;
use headless_chrome::protocol::cdp::{Page, Target};
use headless_chrome::types::Bounds;
use headless_chrome::Browser as ChromeBrowser;
use headless_chrome::{LaunchOptions, Tab};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::{
    scripts, BrowserContext, BrowserDriver, BrowserError, BrowserLauncher, ImageFormat,
    PageHandle, ScreenshotOptions, Viewport, WaitStrategy,
};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub headless: bool,
    pub window: Viewport,
    pub chrome_path: Option<PathBuf>,
    pub idle_timeout: Duration,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            headless: true,
            window: Viewport::default(),
            chrome_path: None,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

pub struct ChromeLauncher {
    config: LaunchConfig,
}

impl ChromeLauncher {
    pub fn new(config: LaunchConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self) -> Result<Arc<dyn BrowserDriver>, BrowserError> {
        let config = self.config.clone();
        let browser = blocking(move || {
            // Containers rarely allow the Chromium sandbox.
            let launch_options = LaunchOptions::default_builder()
                .headless(config.headless)
                .sandbox(false)
                .window_size(Some((config.window.width, config.window.height)))
                .idle_browser_timeout(config.idle_timeout)
                .path(config.chrome_path.clone())
                .build()
                .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

            ChromeBrowser::new(launch_options).map_err(|e| BrowserError::LaunchFailed(e.to_string()))
        })
        .await?;

        info!(headless = self.config.headless, "Browser launched successfully");
        Ok(Arc::new(ChromeDriver {
            browser: Arc::new(browser),
        }))
    }
}

pub struct ChromeDriver {
    browser: Arc<ChromeBrowser>,
}

#[async_trait]
impl BrowserDriver for ChromeDriver {
    async fn new_context(&self, viewport: Viewport) -> Result<Box<dyn BrowserContext>, BrowserError> {
        Ok(Box::new(ChromeContext {
            browser: self.browser.clone(),
            viewport,
            context_id: std::sync::Mutex::new(None),
            tabs: std::sync::Mutex::new(Vec::new()),
        }))
    }

    async fn close(&self) -> Result<(), BrowserError> {
        // The Chromium process is terminated when the last handle is dropped.
        debug!("Releasing browser handle");
        Ok(())
    }
}

/// Pages opened here share one incognito browser context, created with the
/// first page and disposed on `close`, so no cookies or history leak between
/// contexts.
pub struct ChromeContext {
    browser: Arc<ChromeBrowser>,
    viewport: Viewport,
    context_id: std::sync::Mutex<Option<String>>,
    tabs: std::sync::Mutex<Vec<Arc<Tab>>>,
}

impl ChromeContext {
    fn existing_context_id(&self) -> Option<String> {
        self.context_id.lock().ok().and_then(|id| id.clone())
    }
}

#[async_trait]
impl BrowserContext for ChromeContext {
    async fn new_page(&self) -> Result<Box<dyn PageHandle>, BrowserError> {
        let browser = self.browser.clone();
        let viewport = self.viewport;
        let existing = self.existing_context_id();
        let (context_id, tab) = blocking(move || {
            let context = match existing {
                Some(id) => Context::new(&browser, id),
                None => browser
                    .new_context()
                    .map_err(|e| BrowserError::Closed(e.to_string()))?,
            };
            let tab = context
                .new_tab()
                .map_err(|e| BrowserError::Closed(e.to_string()))?;
            let bounds = Bounds::Normal {
                left: Some(0),
                top: Some(0),
                width: Some(f64::from(viewport.width)),
                height: Some(f64::from(viewport.height)),
            };
            if let Err(e) = tab.set_bounds(bounds) {
                warn!("Failed to apply viewport {}x{}: {}", viewport.width, viewport.height, e);
            }
            Ok((context.get_id().to_string(), tab))
        })
        .await?;

        if let Ok(mut id) = self.context_id.lock() {
            id.get_or_insert(context_id);
        }
        if let Ok(mut tabs) = self.tabs.lock() {
            tabs.push(tab.clone());
        }
        Ok(Box::new(ChromePage { tab }))
    }

    async fn close(&self) -> Result<(), BrowserError> {
        let tabs: Vec<Arc<Tab>> = match self.tabs.lock() {
            Ok(mut tabs) => tabs.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        let context_id = self.context_id.lock().ok().and_then(|mut id| id.take());
        let browser = self.browser.clone();
        blocking(move || {
            for tab in tabs {
                if let Err(e) = tab.close(false) {
                    debug!("Tab already gone: {}", e);
                }
            }
            if let Some(browser_context_id) = context_id {
                browser
                    .call_method(Target::DisposeBrowserContext { browser_context_id })
                    .map_err(|e| BrowserError::Closed(e.to_string()))?;
            }
            Ok(())
        })
        .await
    }
}

pub struct ChromePage {
    tab: Arc<Tab>,
}

#[async_trait]
impl PageHandle for ChromePage {
    async fn goto(&self, url: &str, wait: WaitStrategy, timeout: Duration) -> Result<(), BrowserError> {
        let tab = self.tab.clone();
        let target = url.to_string();
        let navigation = blocking(move || {
            let deadline = Instant::now() + timeout;
            tab.set_default_timeout(timeout);
            tab.navigate_to(&target)
                .map_err(|e| BrowserError::from_navigation_message(e.to_string()))?;

            match wait {
                WaitStrategy::DomReady => wait_for_dom_ready(&tab, deadline),
                WaitStrategy::LoadComplete => tab
                    .wait_until_navigated()
                    .map(|_| ())
                    .map_err(|e| BrowserError::from_navigation_message(e.to_string())),
                WaitStrategy::NetworkIdle => {
                    tab.wait_until_navigated()
                        .map_err(|e| BrowserError::from_navigation_message(e.to_string()))?;
                    wait_for_network_quiet(&tab, deadline)
                }
            }
        });

        match tokio::time::timeout(timeout, navigation).await {
            Ok(result) => result,
            Err(_) => Err(BrowserError::Timeout(format!(
                "navigation to {} exceeded {} ms",
                url,
                timeout.as_millis()
            ))),
        }
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        Ok(self.tab.get_url())
    }

    async fn title(&self) -> Result<String, BrowserError> {
        let tab = self.tab.clone();
        blocking(move || tab.get_title().map_err(|e| BrowserError::Script(e.to_string()))).await
    }

    async fn content(&self) -> Result<String, BrowserError> {
        let tab = self.tab.clone();
        blocking(move || tab.get_content().map_err(|e| BrowserError::Script(e.to_string()))).await
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, BrowserError> {
        let tab = self.tab.clone();
        let script = script.to_string();
        blocking(move || evaluate_json(&tab, &script)).await
    }

    async fn screenshot(&self, options: ScreenshotOptions) -> Result<Bytes, BrowserError> {
        let tab = self.tab.clone();
        blocking(move || {
            let response = tab
                .call_method(screenshot_request(&options))
                .map_err(|e| BrowserError::Screenshot(e.to_string()))?;
            decode_screenshot(&response.data)
        })
        .await
    }

    async fn close(&self) -> Result<(), BrowserError> {
        let tab = self.tab.clone();
        blocking(move || {
            tab.close(false)
                .map(|_| ())
                .map_err(|e| BrowserError::Closed(e.to_string()))
        })
        .await
    }
}

/// `captureBeyondViewport` makes Chromium render a clip taller than the
/// window instead of cutting it off at the fold.
fn screenshot_request(options: &ScreenshotOptions) -> Page::CaptureScreenshot {
    let format = match options.format {
        ImageFormat::Png => Page::CaptureScreenshotFormatOption::Png,
        ImageFormat::Jpeg => Page::CaptureScreenshotFormatOption::Jpeg,
    };
    let quality = match options.format {
        ImageFormat::Jpeg => options.quality,
        ImageFormat::Png => None,
    };
    let clip = options.clip.map(|clip| Page::Viewport {
        x: 0.0,
        y: 0.0,
        width: f64::from(clip.width),
        height: f64::from(clip.height),
        scale: 1.0,
    });

    Page::CaptureScreenshot {
        format: Some(format),
        quality,
        capture_beyond_viewport: Some(clip.is_some()),
        clip,
        from_surface: Some(true),
        optimize_for_speed: None,
    }
}

fn decode_screenshot(data: &str) -> Result<Bytes, BrowserError> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map(Bytes::from)
        .map_err(|e| BrowserError::Screenshot(format!("undecodable image data: {}", e)))
}

fn evaluate_json(tab: &Tab, script: &str) -> Result<serde_json::Value, BrowserError> {
    // Remote objects are returned by reference; stringify to get the value.
    let wrapped = format!("JSON.stringify({})", script);
    let result = tab
        .evaluate(&wrapped, false)
        .map_err(|e| BrowserError::Script(e.to_string()))?;

    match result.value {
        Some(serde_json::Value::String(encoded)) => {
            serde_json::from_str(&encoded).map_err(|e| BrowserError::Script(e.to_string()))
        }
        Some(other) => Ok(other),
        None => Ok(serde_json::Value::Null),
    }
}

fn wait_for_dom_ready(tab: &Tab, deadline: Instant) -> Result<(), BrowserError> {
    loop {
        let state = evaluate_json(tab, scripts::READY_STATE)?;
        if state.as_str().map(|s| s != "loading").unwrap_or(false) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(BrowserError::Timeout("document never left the loading state".to_string()));
        }
        std::thread::sleep(READY_POLL_INTERVAL);
    }
}

/// Waits until the resource-timing entry count stops growing for one quiet
/// window. Running out of time here is not an error, the page did load.
fn wait_for_network_quiet(tab: &Tab, deadline: Instant) -> Result<(), BrowserError> {
    let mut last_count = evaluate_json(tab, scripts::RESOURCE_COUNT)?.as_u64().unwrap_or(0);
    let mut quiet_since = Instant::now();

    while Instant::now() < deadline {
        std::thread::sleep(READY_POLL_INTERVAL);
        let count = evaluate_json(tab, scripts::RESOURCE_COUNT)?.as_u64().unwrap_or(0);
        if count != last_count {
            last_count = count;
            quiet_since = Instant::now();
        } else if quiet_since.elapsed() >= WaitStrategy::QUIET_WINDOW {
            return Ok(());
        }
    }

    debug!("Network never went quiet before the deadline, continuing");
    Ok(())
}

async fn blocking<T, F>(f: F) -> Result<T, BrowserError>
where
    F: FnOnce() -> Result<T, BrowserError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BrowserError::Closed(format!("browser task aborted: {}", e)))?
}
