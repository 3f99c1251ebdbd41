use indexmap::IndexSet;
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::debug;
use url::{Origin, Url};

mod discover;
mod frontier;

pub use discover::{LinkDiscoverer, ScrollConfig};
pub use frontier::Frontier;

#[derive(Debug, Error)]
pub enum CrawlerError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Browser error: {0}")]
    Browser(#[from] browser::BrowserError),
}

/// Parses a seed URL. Only absolute `http`/`https` URLs with a host qualify.
pub fn parse_seed_url(raw: &str) -> Result<Url, CrawlerError> {
    let url = Url::parse(raw.trim()).map_err(|e| CrawlerError::InvalidUrl(format!("{}: {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(CrawlerError::InvalidUrl(format!(
            "{}: unsupported scheme '{}'",
            raw,
            url.scheme()
        )));
    }
    if url.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(CrawlerError::InvalidUrl(format!("{}: missing host", raw)));
    }
    Ok(url)
}

/// Dedup form of a URL: no query string, no fragment.
pub fn normalize_url(url: &Url) -> Url {
    let mut normalized = url.clone();
    normalized.set_query(None);
    normalized.set_fragment(None);
    normalized
}

pub fn is_same_origin(url: &Url, origin: &Origin) -> bool {
    &url.origin() == origin
}

/// Resolves raw `href` values against `page_url` and keeps the normalized,
/// same-origin, first-seen-unique ones, at most `max_links` of them.
/// Values that do not resolve to an http(s) URL are skipped.
pub fn filter_links<'a, I>(hrefs: I, page_url: &Url, origin: &Origin, max_links: usize) -> Vec<Url>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut links: IndexSet<Url> = IndexSet::new();

    for href in hrefs {
        if links.len() >= max_links {
            break;
        }
        let href = href.trim();
        if href.is_empty() || href.starts_with('#') {
            continue;
        }
        let Ok(absolute) = page_url.join(href) else {
            continue;
        };
        if !matches!(absolute.scheme(), "http" | "https") {
            continue;
        }
        if !is_same_origin(&absolute, origin) {
            continue;
        }
        links.insert(normalize_url(&absolute));
    }

    links.into_iter().collect()
}

/// Raw `href` values of every anchor in an HTML document.
pub fn extract_hrefs_from_html(html: &str) -> Result<Vec<String>, CrawlerError> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("a[href]").map_err(|e| CrawlerError::ParseError(e.to_string()))?;

    let hrefs: Vec<String> = document
        .select(&selector)
        .filter_map(|element| element.value().attr("href"))
        .map(str::to_string)
        .collect();

    debug!("Extracted {} hrefs from HTML", hrefs.len());
    Ok(hrefs)
}
