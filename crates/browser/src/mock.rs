//! In-memory browser used by the test suites of the crawl, capture and
//! orchestration crates.
//!
//! A [`MockSite`] maps URLs to [`MockPageSpec`]s. Pages answer the scripts in
//! [`crate::scripts`] from their spec instead of running JavaScript.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use crate::{
    scripts, BrowserContext, BrowserDriver, BrowserError, BrowserLauncher, PageHandle,
    ScreenshotOptions, Viewport, WaitStrategy,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    /// Navigation never finishes.
    Timeout,
    /// Host does not resolve.
    Dns,
    /// Page loads but the renderer dies when capturing.
    Crash,
}

#[derive(Debug, Clone)]
pub struct MockButton {
    pub text: String,
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct MockPageSpec {
    pub title: String,
    pub links: Vec<String>,
    /// Anchors that only exist once the page was scrolled to the bottom.
    pub lazy_links: Vec<String>,
    pub width: u32,
    pub scroll_height: u32,
    /// Every scroll step appends more content.
    pub infinite_scroll: bool,
    /// Link collection via script returns nothing; only `content()` has them.
    pub hide_links_from_script: bool,
    pub buttons: Vec<MockButton>,
    pub failure: Option<MockFailure>,
    pub load_delay: Duration,
}

impl MockPageSpec {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            links: Vec::new(),
            lazy_links: Vec::new(),
            width: 1280,
            scroll_height: 2400,
            infinite_scroll: false,
            hide_links_from_script: false,
            buttons: Vec::new(),
            failure: None,
            load_delay: Duration::ZERO,
        }
    }

    pub fn with_links<I, S>(mut self, links: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.links.extend(links.into_iter().map(Into::into));
        self
    }

    pub fn with_lazy_links<I, S>(mut self, links: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lazy_links.extend(links.into_iter().map(Into::into));
        self
    }

    pub fn with_height(mut self, scroll_height: u32) -> Self {
        self.scroll_height = scroll_height;
        self
    }

    pub fn with_infinite_scroll(mut self) -> Self {
        self.infinite_scroll = true;
        self
    }

    pub fn with_links_hidden_from_script(mut self) -> Self {
        self.hide_links_from_script = true;
        self
    }

    pub fn with_button(mut self, text: &str, target: &str) -> Self {
        self.buttons.push(MockButton {
            text: text.to_string(),
            target: target.to_string(),
        });
        self
    }

    pub fn with_failure(mut self, failure: MockFailure) -> Self {
        self.failure = Some(failure);
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }
}

#[derive(Default)]
struct SiteCounters {
    active_pages: AtomicUsize,
    peak_pages: AtomicUsize,
    contexts: AtomicUsize,
    visits: Mutex<Vec<String>>,
}

#[derive(Clone, Default)]
pub struct MockSite {
    pages: Arc<HashMap<String, MockPageSpec>>,
    counters: Arc<SiteCounters>,
}

impl MockSite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: &str, spec: MockPageSpec) -> Self {
        let mut pages = (*self.pages).clone();
        pages.insert(site_key(url), spec);
        self.pages = Arc::new(pages);
        self
    }

    fn lookup(&self, url: &str) -> MockPageSpec {
        self.pages
            .get(&site_key(url))
            .cloned()
            .unwrap_or_else(|| MockPageSpec::new("404 Not Found"))
    }

    /// Every URL passed to `goto`, in call order.
    pub fn visits(&self) -> Vec<String> {
        self.counters
            .visits
            .lock()
            .map(|visits| visits.clone())
            .unwrap_or_default()
    }

    pub fn active_pages(&self) -> usize {
        self.counters.active_pages.load(Ordering::SeqCst)
    }

    pub fn peak_pages(&self) -> usize {
        self.counters.peak_pages.load(Ordering::SeqCst)
    }

    pub fn contexts_opened(&self) -> usize {
        self.counters.contexts.load(Ordering::SeqCst)
    }

    /// Opens a context and page directly, for tests of single components.
    pub async fn open_page(&self, viewport: Viewport) -> Box<dyn PageHandle> {
        MockContext {
            site: self.clone(),
            viewport,
        }
        .open()
    }
}

fn site_key(url: &str) -> String {
    Url::parse(url)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| url.to_string())
}

pub struct MockLauncher {
    site: MockSite,
    error: Option<String>,
    launches: AtomicUsize,
}

impl MockLauncher {
    pub fn new(site: MockSite) -> Self {
        Self {
            site,
            error: None,
            launches: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            site: MockSite::new(),
            error: Some(message.to_string()),
            launches: AtomicUsize::new(0),
        }
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserLauncher for MockLauncher {
    async fn launch(&self) -> Result<Arc<dyn BrowserDriver>, BrowserError> {
        if let Some(message) = &self.error {
            return Err(BrowserError::LaunchFailed(message.clone()));
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockDriver {
            site: self.site.clone(),
        }))
    }
}

pub struct MockDriver {
    site: MockSite,
}

#[async_trait]
impl BrowserDriver for MockDriver {
    async fn new_context(&self, viewport: Viewport) -> Result<Box<dyn BrowserContext>, BrowserError> {
        self.site.counters.contexts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockContext {
            site: self.site.clone(),
            viewport,
        }))
    }

    async fn close(&self) -> Result<(), BrowserError> {
        Ok(())
    }
}

pub struct MockContext {
    site: MockSite,
    viewport: Viewport,
}

impl MockContext {
    fn open(&self) -> Box<dyn PageHandle> {
        let counters = &self.site.counters;
        let active = counters.active_pages.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_pages.fetch_max(active, Ordering::SeqCst);
        Box::new(MockPage {
            site: self.site.clone(),
            viewport: self.viewport,
            state: Mutex::new(PageState::default()),
        })
    }
}

#[async_trait]
impl BrowserContext for MockContext {
    async fn new_page(&self) -> Result<Box<dyn PageHandle>, BrowserError> {
        Ok(self.open())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        Ok(())
    }
}

#[derive(Default)]
struct PageState {
    url: Option<String>,
    spec: Option<MockPageSpec>,
    scroll_y: u32,
    extra_height: u32,
    reached_bottom: bool,
    closed: bool,
}

impl PageState {
    fn height(&self) -> u32 {
        self.spec
            .as_ref()
            .map(|spec| spec.scroll_height + self.extra_height)
            .unwrap_or(0)
    }

    fn enter(&mut self, url: &str, spec: MockPageSpec) {
        self.url = Some(url.to_string());
        self.spec = Some(spec);
        self.scroll_y = 0;
        self.extra_height = 0;
        self.reached_bottom = false;
    }

    fn visible_links(&self) -> Vec<String> {
        let Some(spec) = &self.spec else {
            return Vec::new();
        };
        let mut links = spec.links.clone();
        if self.reached_bottom {
            links.extend(spec.lazy_links.iter().cloned());
        }
        links
    }
}

pub struct MockPage {
    site: MockSite,
    viewport: Viewport,
    state: Mutex<PageState>,
}

impl MockPage {
    fn with_state<T>(&self, f: impl FnOnce(&mut PageState) -> Result<T, BrowserError>) -> Result<T, BrowserError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| BrowserError::Closed("page state poisoned".to_string()))?;
        if state.closed {
            return Err(BrowserError::Closed("page already closed".to_string()));
        }
        f(&mut state)
    }

    fn loaded_spec(state: &PageState) -> Result<&MockPageSpec, BrowserError> {
        state
            .spec
            .as_ref()
            .ok_or_else(|| BrowserError::Script("no document loaded".to_string()))
    }

    fn scroll(&self, state: &mut PageState, distance: u32) -> serde_json::Value {
        let infinite = state.spec.as_ref().map(|s| s.infinite_scroll).unwrap_or(false);
        let max_y = state.height().saturating_sub(self.viewport.height);
        state.scroll_y = (state.scroll_y + distance).min(max_y);
        if state.scroll_y >= max_y {
            state.reached_bottom = true;
        }
        if infinite {
            state.extra_height += distance;
        }
        serde_json::json!([state.scroll_y, state.height()])
    }

    fn click(&self, state: &mut PageState, keywords: &[String]) -> serde_json::Value {
        let buttons = state
            .spec
            .as_ref()
            .map(|spec| spec.buttons.clone())
            .unwrap_or_default();
        for keyword in keywords {
            let needle = keyword.to_lowercase();
            if let Some(button) = buttons.iter().find(|b| b.text.to_lowercase().contains(&needle)) {
                let target = button.target.clone();
                let spec = self.site.lookup(&target);
                state.enter(&target, spec);
                return serde_json::Value::String(keyword.clone());
            }
        }
        serde_json::Value::Null
    }
}

#[async_trait]
impl PageHandle for MockPage {
    async fn goto(&self, url: &str, _wait: WaitStrategy, timeout: Duration) -> Result<(), BrowserError> {
        if let Ok(mut visits) = self.site.counters.visits.lock() {
            visits.push(url.to_string());
        }
        let spec = self.site.lookup(url);

        match spec.failure {
            Some(MockFailure::Timeout) => {
                return Err(BrowserError::Timeout(format!(
                    "navigation to {} exceeded {} ms",
                    url,
                    timeout.as_millis()
                )))
            }
            Some(MockFailure::Dns) => {
                return Err(BrowserError::Connection(format!(
                    "net::ERR_NAME_NOT_RESOLVED at {}",
                    url
                )))
            }
            _ => {}
        }

        if spec.load_delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(BrowserError::Timeout(format!(
                "navigation to {} exceeded {} ms",
                url,
                timeout.as_millis()
            )));
        }
        if !spec.load_delay.is_zero() {
            tokio::time::sleep(spec.load_delay).await;
        }

        self.with_state(|state| {
            state.enter(url, spec);
            Ok(())
        })
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        self.with_state(|state| Ok(state.url.clone().unwrap_or_else(|| "about:blank".to_string())))
    }

    async fn title(&self) -> Result<String, BrowserError> {
        self.with_state(|state| Ok(Self::loaded_spec(state)?.title.clone()))
    }

    async fn content(&self) -> Result<String, BrowserError> {
        self.with_state(|state| {
            let title = Self::loaded_spec(state)?.title.clone();
            let anchors: String = state
                .visible_links()
                .iter()
                .map(|href| format!("<a href=\"{}\">link</a>", href))
                .collect();
            Ok(format!(
                "<html><head><title>{}</title></head><body>{}</body></html>",
                title, anchors
            ))
        })
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, BrowserError> {
        self.with_state(|state| {
            let spec = Self::loaded_spec(state)?.clone();

            if script.starts_with(scripts::SCROLL_STEP_TAG) {
                let distance = scripts::parse_scroll_distance(script)
                    .ok_or_else(|| BrowserError::Script("malformed scroll script".to_string()))?;
                Ok(self.scroll(state, distance))
            } else if script.starts_with(scripts::SCROLL_TOP_TAG) {
                state.scroll_y = 0;
                Ok(serde_json::Value::Bool(true))
            } else if script.starts_with(scripts::COLLECT_HREFS_TAG) {
                if spec.hide_links_from_script {
                    return Ok(serde_json::Value::Null);
                }
                Ok(serde_json::json!(state.visible_links()))
            } else if script.starts_with(scripts::PAGE_DIMENSIONS_TAG) {
                Ok(serde_json::json!([spec.width, state.height()]))
            } else if script.starts_with(scripts::READY_STATE_TAG) {
                Ok(serde_json::Value::String("complete".to_string()))
            } else if script.starts_with(scripts::RESOURCE_COUNT_TAG) {
                Ok(serde_json::json!(0))
            } else if script.starts_with(scripts::CLICK_KEYWORD_TAG) {
                let keywords = scripts::parse_click_keywords(script)
                    .ok_or_else(|| BrowserError::Script("malformed click script".to_string()))?;
                Ok(self.click(state, &keywords))
            } else {
                Err(BrowserError::Script("mock page cannot run arbitrary scripts".to_string()))
            }
        })
    }

    async fn screenshot(&self, options: ScreenshotOptions) -> Result<Bytes, BrowserError> {
        self.with_state(|state| {
            let spec = Self::loaded_spec(state)?;
            if spec.failure == Some(MockFailure::Crash) {
                return Err(BrowserError::Screenshot("Target crashed".to_string()));
            }
            let (width, height) = options
                .clip
                .map(|clip| (clip.width, clip.height))
                .unwrap_or((self.viewport.width, self.viewport.height));
            let url = state.url.clone().unwrap_or_default();
            Ok(Bytes::from(format!(
                "{}:{}:{}x{}",
                options.format.extension(),
                url,
                width,
                height
            )))
        })
    }

    async fn close(&self) -> Result<(), BrowserError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| BrowserError::Closed("page state poisoned".to_string()))?;
        if !state.closed {
            state.closed = true;
            self.site.counters.active_pages.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
