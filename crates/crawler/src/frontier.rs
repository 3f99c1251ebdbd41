use std::collections::{HashSet, VecDeque};
use tracing::debug;
use url::Url;

use crate::normalize_url;

/// Breadth-first work queue of discovered-but-not-yet-captured URLs.
///
/// A URL is accepted at most once per frontier, compared in its normalized
/// form, whether or not it has been popped since.
#[derive(Debug, Default)]
pub struct Frontier {
    queue: VecDeque<(Url, usize)>,
    seen: HashSet<String>,
}

impl Frontier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `url` as visited without queueing it (the seed page).
    pub fn mark_seen(&mut self, url: &Url) -> bool {
        self.seen.insert(normalize_url(url).to_string())
    }

    pub fn is_seen(&self, url: &Url) -> bool {
        self.seen.contains(normalize_url(url).as_str())
    }

    /// Queues `url` at `depth` unless it was seen before.
    pub fn push(&mut self, url: Url, depth: usize) -> bool {
        if !self.mark_seen(&url) {
            return false;
        }
        debug!(url = %url, depth, "Queued URL");
        self.queue.push_back((url, depth));
        true
    }

    pub fn pop(&mut self) -> Option<(Url, usize)> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }
}
