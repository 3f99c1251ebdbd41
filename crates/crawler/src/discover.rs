use browser::{scripts, PageHandle};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::{Origin, Url};

use crate::{extract_hrefs_from_html, filter_links, normalize_url, CrawlerError};

/// Pacing of the scroll-to-bottom routine that forces lazy content to render.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScrollConfig {
    pub step_px: u32,
    pub delay: Duration,
    /// Hard stop for pages that keep growing (infinite scroll).
    pub max_iterations: u32,
}

impl Default for ScrollConfig {
    fn default() -> Self {
        Self {
            step_px: 800,
            delay: Duration::from_millis(250),
            max_iterations: 40,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LinkDiscoverer {
    scroll: ScrollConfig,
}

impl LinkDiscoverer {
    pub fn new(scroll: ScrollConfig) -> Self {
        Self { scroll }
    }

    /// Scrolls in fixed steps until the scroll position stops advancing or
    /// the iteration guard fires. Returns the number of steps taken.
    pub async fn scroll_to_bottom(&self, page: &dyn PageHandle) -> Result<u32, CrawlerError> {
        let script = scripts::scroll_step(self.scroll.step_px);
        let mut last_position: Option<u64> = None;

        for step in 0..self.scroll.max_iterations {
            let measured = page.evaluate(&script).await?;
            let position = measured
                .get(0)
                .and_then(serde_json::Value::as_u64)
                .ok_or_else(|| CrawlerError::ParseError(format!("unexpected scroll result: {}", measured)))?;

            if last_position == Some(position) {
                debug!(steps = step, "Scroll position settled");
                return Ok(step);
            }
            last_position = Some(position);
            tokio::time::sleep(self.scroll.delay).await;
        }

        debug!(
            max_iterations = self.scroll.max_iterations,
            "Scroll guard reached, page keeps growing"
        );
        Ok(self.scroll.max_iterations)
    }

    /// Collects up to `max_links` normalized same-origin links from the page
    /// currently loaded in `page`. Never returns an empty list: a page with
    /// no qualifying links yields its own URL.
    pub async fn discover(
        &self,
        page: &dyn PageHandle,
        origin: &Origin,
        max_links: usize,
    ) -> Result<Vec<Url>, CrawlerError> {
        let (page_url, mut links) = self.collect_links(page, origin, max_links).await?;
        if links.is_empty() {
            links.push(normalize_url(&page_url));
        }
        Ok(links)
    }

    /// Every normalized same-origin link on the page, in first-seen order.
    /// Callers that track visited URLs apply their own budget afterwards, so
    /// links they have already seen never take up a slot. May be empty.
    pub async fn discover_all(&self, page: &dyn PageHandle, origin: &Origin) -> Result<Vec<Url>, CrawlerError> {
        let (_, links) = self.collect_links(page, origin, usize::MAX).await?;
        Ok(links)
    }

    async fn collect_links(
        &self,
        page: &dyn PageHandle,
        origin: &Origin,
        max_links: usize,
    ) -> Result<(Url, Vec<Url>), CrawlerError> {
        let current = page.current_url().await?;
        let page_url = Url::parse(&current).map_err(|e| CrawlerError::InvalidUrl(format!("{}: {}", current, e)))?;

        if let Err(e) = self.scroll_to_bottom(page).await {
            warn!(url = %page_url, "Scrolling failed, collecting visible links only: {}", e);
        }

        let hrefs = self.collect_hrefs(page).await?;
        if let Err(e) = page.evaluate(scripts::SCROLL_TO_TOP).await {
            debug!("Could not restore scroll position: {}", e);
        }

        let links = filter_links(hrefs.iter().map(String::as_str), &page_url, origin, max_links);
        debug!(
            url = %page_url,
            hrefs = hrefs.len(),
            kept = links.len(),
            "Discovered links"
        );
        Ok((page_url, links))
    }

    async fn collect_hrefs(&self, page: &dyn PageHandle) -> Result<Vec<String>, CrawlerError> {
        match page.evaluate(scripts::COLLECT_HREFS).await {
            Ok(serde_json::Value::Array(values)) => Ok(values
                .into_iter()
                .filter_map(|value| value.as_str().map(str::to_string))
                .collect()),
            Ok(other) => {
                debug!("Href script returned {}, parsing page HTML instead", other);
                extract_hrefs_from_html(&page.content().await?)
            }
            Err(e) => {
                debug!("Href script failed ({}), parsing page HTML instead", e);
                extract_hrefs_from_html(&page.content().await?)
            }
        }
    }
}
