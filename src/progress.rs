use indicatif::{ProgressBar, ProgressStyle};
use poller::PollState;
use std::cell::Cell;

/// Terminal progress bar fed from the polling coordinator's state.
pub struct CrawlProgress {
    bar: Option<ProgressBar>,
    finished: Cell<bool>,
}

impl CrawlProgress {
    pub fn new(enabled: bool) -> Self {
        let bar = if enabled {
            let pb = ProgressBar::new(1);
            let style = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} pages {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-");
            pb.set_style(style);
            Some(pb)
        } else {
            None
        };

        Self {
            bar,
            finished: Cell::new(false),
        }
    }

    pub fn update(&self, state: &PollState) {
        let Some(ref pb) = self.bar else {
            return;
        };
        match state {
            PollState::Waiting => pb.set_message("starting"),
            PollState::Polling {
                progress: Some(progress),
                ..
            } => {
                pb.set_length(progress.total.max(1) as u64);
                pb.set_position(progress.current as u64);
                pb.set_message("");
            }
            _ => {}
        }
    }

    pub fn finish(&self, message: &str) {
        // If we've already finished once, don't finish again or clear the message later.
        if self.finished.replace(true) {
            return;
        }

        if let Some(ref pb) = self.bar {
            pb.finish_with_message(message.to_string());
        }
    }
}

impl Drop for CrawlProgress {
    fn drop(&mut self) {
        // Only auto-clear the progress bar if we haven't explicitly finished it.
        if !self.finished.get() {
            if let Some(ref pb) = self.bar {
                pb.finish_and_clear();
            }
        }
    }
}
