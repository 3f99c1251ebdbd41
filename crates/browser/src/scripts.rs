//! In-page JavaScript used by the crawl and capture components.
//!
//! Every script starts with a `/*tag*/` comment so drivers that do not run a
//! real JavaScript engine (see [`crate::mock`]) can recognise it.

pub const SCROLL_STEP_TAG: &str = "/*scroll-step*/";
pub const SCROLL_TOP_TAG: &str = "/*scroll-top*/";
pub const COLLECT_HREFS_TAG: &str = "/*collect-hrefs*/";
pub const PAGE_DIMENSIONS_TAG: &str = "/*page-dimensions*/";
pub const READY_STATE_TAG: &str = "/*ready-state*/";
pub const RESOURCE_COUNT_TAG: &str = "/*resource-count*/";
pub const CLICK_KEYWORD_TAG: &str = "/*click-keyword*/";

const KEYWORDS_START: &str = "/*kw*/";
const KEYWORDS_END: &str = "/*end-kw*/";

/// Scrolls down by `distance_px` and returns `[scrollY, scrollHeight]`.
pub fn scroll_step(distance_px: u32) -> String {
    format!(
        "{SCROLL_STEP_TAG}(function() {{ \
            window.scrollBy(0, {distance_px}); \
            var root = document.scrollingElement || document.documentElement; \
            return [Math.round(window.scrollY), root.scrollHeight]; \
        }})()"
    )
}

pub const SCROLL_TO_TOP: &str = "/*scroll-top*/(function() { window.scrollTo(0, 0); return true; })()";

/// Raw `href` attribute values of every anchor in the document.
pub const COLLECT_HREFS: &str = "/*collect-hrefs*/Array.from(document.querySelectorAll('a[href]'))\
    .map(function(a) { return a.getAttribute('href'); })";

/// `[scrollWidth, scrollHeight]` of the whole document.
pub const PAGE_DIMENSIONS: &str = "/*page-dimensions*/(function() { \
    var root = document.documentElement; \
    var body = document.body || root; \
    return [Math.max(root.scrollWidth, body.scrollWidth), Math.max(root.scrollHeight, body.scrollHeight)]; \
})()";

pub const READY_STATE: &str = "/*ready-state*/document.readyState";

pub const RESOURCE_COUNT: &str = "/*resource-count*/performance.getEntriesByType('resource').length";

/// Clicks the first visible clickable element whose text contains one of
/// `keywords`, trying keywords in order. Returns the matched keyword or null.
pub fn click_keyword(keywords: &[String]) -> String {
    let encoded = serde_json::to_string(keywords).unwrap_or_else(|_| "[]".to_string());
    format!(
        "{CLICK_KEYWORD_TAG}(function() {{ \
            var keywords = {KEYWORDS_START}{encoded}{KEYWORDS_END}; \
            var candidates = Array.from(document.querySelectorAll( \
                'a, button, [role=button], input[type=submit], input[type=button]')); \
            var visible = candidates.filter(function(el) {{ \
                var rect = el.getBoundingClientRect(); \
                return rect.width > 0 && rect.height > 0; \
            }}); \
            for (var i = 0; i < keywords.length; i++) {{ \
                var keyword = keywords[i].toLowerCase(); \
                for (var j = 0; j < visible.length; j++) {{ \
                    var el = visible[j]; \
                    var text = (el.innerText || el.value || el.getAttribute('aria-label') || '').toLowerCase(); \
                    if (text.indexOf(keyword) !== -1) {{ el.click(); return keywords[i]; }} \
                }} \
            }} \
            return null; \
        }})()"
    )
}

/// Recovers the distance embedded by [`scroll_step`].
pub fn parse_scroll_distance(script: &str) -> Option<u32> {
    let start = script.find("scrollBy(0, ")? + "scrollBy(0, ".len();
    let end = script[start..].find(')')? + start;
    script[start..end].trim().parse().ok()
}

/// Recovers the keyword list embedded by [`click_keyword`].
pub fn parse_click_keywords(script: &str) -> Option<Vec<String>> {
    let start = script.find(KEYWORDS_START)? + KEYWORDS_START.len();
    let end = script[start..].find(KEYWORDS_END)? + start;
    serde_json::from_str(&script[start..end]).ok()
}
