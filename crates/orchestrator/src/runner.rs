use browser::{scripts, BrowserDriver, BrowserPool, PageHandle};
use bytes::Bytes;
use capture::{CapturePageResult, CaptureWorker};
use crawler::{Frontier, LinkDiscoverer};
use futures::stream::{FuturesUnordered, StreamExt};
use session::{
    new_session_id, CapturedPage, CrawlJob, JobStatus, JobStore, JobUpdate, Progress, SessionError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::{Origin, Url};

use crate::{CrawlOptions, OrchestratorError};

/// One screenshot attempt made during a visit.
struct Attempt {
    url: String,
    flow_step: Option<usize>,
    result: CapturePageResult,
}

/// Everything a single visit produced, handed back to the job loop.
struct Visit {
    depth: usize,
    attempts: Vec<Attempt>,
    links: Vec<Url>,
}

/// Counters of the running job.
struct Tally {
    recorded: usize,
    total: usize,
    link_budget: usize,
}

impl Tally {
    fn progress(&self) -> Progress {
        Progress {
            current: self.recorded,
            total: self.total,
        }
    }
}

/// Runs crawl jobs against a shared browser and records them in a store.
///
/// The job's run is the only writer of its record. Each page is visited in
/// a fresh browser context that is closed afterwards, so concurrent visits
/// never share cookies or history.
pub struct Orchestrator {
    pool: Arc<BrowserPool>,
    store: Arc<dyn JobStore>,
    discoverer: LinkDiscoverer,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(pool: Arc<BrowserPool>, store: Arc<dyn JobStore>) -> Self {
        Self {
            pool,
            store,
            discoverer: LinkDiscoverer::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_discoverer(mut self, discoverer: LinkDiscoverer) -> Self {
        self.discoverer = discoverer;
        self
    }

    /// Running jobs stop dispatching new pages once `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    pub fn pool(&self) -> Arc<BrowserPool> {
        self.pool.clone()
    }

    /// Validates the request and registers a `processing` job for it.
    /// Nothing is stored when validation fails.
    async fn prepare(
        &self,
        raw_url: &str,
        options: &CrawlOptions,
    ) -> Result<(String, Url), OrchestratorError> {
        options.validate()?;
        let mut seed = crawler::parse_seed_url(raw_url)
            .map_err(|e| OrchestratorError::InvalidInput(e.to_string()))?;
        seed.set_fragment(None);

        let session_id = new_session_id();
        self.store.create(CrawlJob::new(session_id.clone(), &seed)).await?;
        self.store
            .update(&session_id, JobUpdate::status(JobStatus::Processing))
            .await?;
        Ok((session_id, seed))
    }

    /// Starts a job in the background and returns its session id at once.
    pub async fn submit(
        self: &Arc<Self>,
        raw_url: &str,
        options: CrawlOptions,
    ) -> Result<String, OrchestratorError> {
        let (session_id, seed) = self.prepare(raw_url, &options).await?;

        let this = Arc::clone(self);
        let id = session_id.clone();
        tokio::spawn(async move {
            this.execute(&id, seed, options).await;
        });
        Ok(session_id)
    }

    /// Runs a job to its terminal state and returns the final record.
    pub async fn run(&self, raw_url: &str, options: CrawlOptions) -> Result<CrawlJob, OrchestratorError> {
        let (session_id, seed) = self.prepare(raw_url, &options).await?;
        self.execute(&session_id, seed, options).await;
        self.store
            .get(&session_id)
            .await?
            .ok_or(OrchestratorError::Store(SessionError::NotFound(session_id)))
    }

    async fn record(&self, session_id: &str, update: JobUpdate) {
        if let Err(e) = self.store.update(session_id, update).await {
            error!(session_id, "Failed to record job update: {}", e);
        }
    }

    async fn execute(&self, session_id: &str, seed: Url, options: CrawlOptions) {
        let started = Instant::now();
        let deadline = started + options.job_budget();
        info!(
            session_id,
            url = %seed,
            max_links = options.max_links,
            max_depth = options.max_depth,
            concurrency = options.concurrency,
            flow = options.capture_flow,
            "Crawl started"
        );

        let driver = match self.pool.acquire().await {
            Ok(driver) => driver,
            Err(e) => {
                error!(session_id, "Browser unavailable: {}", e);
                self.record(session_id, JobUpdate::failed(e.to_string())).await;
                return;
            }
        };

        let worker = CaptureWorker::new(options.capture_options());
        let origin = seed.origin();
        let extension = options.format.extension().to_string();

        let mut frontier = Frontier::new();
        frontier.push(seed, 0);
        let mut tally = Tally {
            recorded: 0,
            total: 1,
            link_budget: options.max_links,
        };
        self.record(session_id, JobUpdate::progress(tally.progress())).await;

        let mut in_flight = FuturesUnordered::new();
        let mut stopped: Option<&str> = None;

        loop {
            while stopped.is_none() && in_flight.len() < options.concurrency {
                if self.shutdown.is_cancelled() {
                    stopped = Some("shutdown requested");
                    break;
                }
                if Instant::now() >= deadline {
                    stopped = Some("job budget exhausted");
                    break;
                }
                let Some((url, depth)) = frontier.pop() else {
                    break;
                };
                let expand = options.max_links > 0 && (depth == 0 || depth < options.max_depth);
                in_flight.push(self.visit(driver.clone(), &worker, url, depth, expand, &options, &origin));
            }

            let Some(visit) = in_flight.next().await else {
                break;
            };

            let depth = visit.depth;
            for attempt in visit.attempts {
                if attempt.flow_step.is_some() {
                    tally.total += 1;
                }
                tally.recorded += 1;
                let page = to_captured_page(attempt, depth, tally.recorded, &extension);
                info!(
                    session_id,
                    order = page.order,
                    url = %page.url,
                    success = page.success,
                    "Page recorded"
                );
                self.record(session_id, JobUpdate::page(page, tally.progress())).await;
            }

            let mut queued = 0;
            for link in visit.links {
                if tally.link_budget == 0 {
                    break;
                }
                if frontier.push(link, depth + 1) {
                    tally.link_budget -= 1;
                    tally.total += 1;
                    queued += 1;
                }
            }
            if queued > 0 {
                debug!(session_id, queued, depth = depth + 1, "Frontier expanded");
                self.record(session_id, JobUpdate::progress(tally.progress())).await;
            }
        }

        if let Some(reason) = stopped {
            warn!(session_id, skipped = frontier.len(), "Stopped early: {}", reason);
        }

        let done = Progress {
            current: tally.recorded,
            total: tally.recorded,
        };
        self.record(session_id, JobUpdate::completed(done)).await;
        info!(
            session_id,
            pages = tally.recorded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Crawl completed"
        );
    }

    #[allow(clippy::too_many_arguments)]
    async fn visit(
        &self,
        driver: Arc<dyn BrowserDriver>,
        worker: &CaptureWorker,
        url: Url,
        depth: usize,
        expand: bool,
        options: &CrawlOptions,
        origin: &Origin,
    ) -> Visit {
        let mut visit = Visit {
            depth,
            attempts: Vec::new(),
            links: Vec::new(),
        };

        let context = match driver.new_context(options.viewport).await {
            Ok(context) => context,
            Err(e) => {
                visit.attempts.push(Attempt {
                    url: url.to_string(),
                    flow_step: None,
                    result: Err(e.into()),
                });
                return visit;
            }
        };

        match context.new_page().await {
            Ok(page) => {
                self.drive(page.as_ref(), worker, &url, expand, options, origin, &mut visit)
                    .await;
                if let Err(e) = page.close().await {
                    debug!(url = %url, "Failed to close page: {}", e);
                }
            }
            Err(e) => visit.attempts.push(Attempt {
                url: url.to_string(),
                flow_step: None,
                result: Err(e.into()),
            }),
        }

        if let Err(e) = context.close().await {
            debug!(url = %url, "Failed to close context: {}", e);
        }
        visit
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        page: &dyn PageHandle,
        worker: &CaptureWorker,
        url: &Url,
        expand: bool,
        options: &CrawlOptions,
        origin: &Origin,
        visit: &mut Visit,
    ) {
        let result = worker.capture(page, url).await;
        let captured = result.is_ok();
        visit.attempts.push(Attempt {
            url: url.to_string(),
            flow_step: None,
            result,
        });
        if !captured {
            return;
        }

        if expand {
            match self.discoverer.discover_all(page, origin).await {
                Ok(links) => visit.links = links,
                Err(e) => warn!(url = %url, "Link discovery failed: {}", e),
            }
        }

        if options.capture_flow {
            self.follow_flow(page, worker, options, visit).await;
        }
    }

    /// Clicks through "next step" triggers, screenshotting after each one,
    /// until no trigger matches, a capture fails, or the step limit is hit.
    async fn follow_flow(
        &self,
        page: &dyn PageHandle,
        worker: &CaptureWorker,
        options: &CrawlOptions,
        visit: &mut Visit,
    ) {
        let script = scripts::click_keyword(&options.flow_keywords);

        for step in 1..=options.max_flow_steps {
            let keyword = match page.evaluate(&script).await {
                Ok(serde_json::Value::String(keyword)) => keyword,
                Ok(_) => {
                    debug!(step, "No flow trigger on page");
                    break;
                }
                Err(e) => {
                    warn!(step, "Flow trigger failed: {}", e);
                    break;
                }
            };

            if options.post_load_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(options.post_load_delay_ms)).await;
            }

            let result = worker.capture_current(page).await;
            let url = page.current_url().await.unwrap_or_default();
            debug!(step, keyword = %keyword, url = %url, "Flow step captured");

            let failed = result.is_err();
            visit.attempts.push(Attempt {
                url,
                flow_step: Some(step),
                result,
            });
            if failed {
                break;
            }
        }
    }
}

fn to_captured_page(attempt: Attempt, depth: usize, order: usize, extension: &str) -> CapturedPage {
    let filename = format!("page_{:03}.{}", order, extension);
    match attempt.result {
        Ok(image) => CapturedPage {
            url: attempt.url,
            title: image.title,
            filename,
            success: true,
            error: None,
            order,
            depth,
            flow_step: attempt.flow_step,
            width: image.width,
            height: image.height,
            duration_ms: image.duration_ms,
            image_bytes: image.bytes,
        },
        Err(failure) => CapturedPage {
            url: attempt.url,
            title: String::new(),
            filename,
            success: false,
            error: Some(failure.to_string()),
            order,
            depth,
            flow_step: attempt.flow_step,
            width: 0,
            height: 0,
            duration_ms: 0,
            image_bytes: Bytes::new(),
        },
    }
}
