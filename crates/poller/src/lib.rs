//! Caller-side polling of a crawl job until it reaches a terminal state.
//!
//! The coordinator moves through `Idle -> Waiting -> Polling -> terminal`,
//! bounded by a fixed number of attempts at a fixed interval. A session that
//! does not exist fails fast; transient transport errors use up an attempt
//! and polling continues.

use async_trait::async_trait;
use session::{JobStatus, JobStatusReport, Progress};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod remote;
mod source;

pub use remote::{RemoteClient, SubmitResponse};
pub use source::StoreStatusSource;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PollError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Transient error: {0}")]
    Transient(String),
    #[error("{0}")]
    Other(String),
}

/// Anything that can answer "what is the state of this session".
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch(&self, session_id: &str) -> Result<JobStatusReport, PollError>;
}

#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub initial_delay: Duration,
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            interval: Duration::from_secs(2),
            max_attempts: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Waiting,
    Polling {
        attempt: u32,
        progress: Option<Progress>,
    },
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl PollState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PollState::Completed | PollState::Failed | PollState::TimedOut | PollState::Cancelled
        )
    }
}

/// The three outcomes a caller must be able to tell apart, plus an explicit
/// stop by the caller.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    Completed(JobStatusReport),
    Failed(String),
    /// Gave up on the client side; the job may still finish on the server.
    TimedOut { attempts: u32 },
    Cancelled,
}

pub struct PollingCoordinator {
    source: Arc<dyn StatusSource>,
    config: PollConfig,
    state: watch::Sender<PollState>,
    cancel: CancellationToken,
}

impl PollingCoordinator {
    pub fn new(source: Arc<dyn StatusSource>, config: PollConfig) -> Self {
        let (state, _) = watch::channel(PollState::Idle);
        Self {
            source,
            config,
            state,
            cancel: CancellationToken::new(),
        }
    }

    /// Stops the coordinator when `cancel` fires, in addition to [`stop`](Self::stop).
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<PollState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> PollState {
        self.state.borrow().clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn set_state(&self, state: PollState) {
        self.state.send_replace(state);
    }

    /// Sleeps unless cancelled first. Returns false on cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    fn finish(&self, outcome: PollOutcome) -> PollOutcome {
        let state = match &outcome {
            PollOutcome::Completed(_) => PollState::Completed,
            PollOutcome::Failed(_) => PollState::Failed,
            PollOutcome::TimedOut { .. } => PollState::TimedOut,
            PollOutcome::Cancelled => PollState::Cancelled,
        };
        self.set_state(state);
        outcome
    }

    pub async fn poll(&self, session_id: &str) -> PollOutcome {
        self.set_state(PollState::Waiting);
        if !self.pause(self.config.initial_delay).await {
            return self.finish(PollOutcome::Cancelled);
        }

        let mut last_progress = None;
        for attempt in 1..=self.config.max_attempts {
            self.set_state(PollState::Polling {
                attempt,
                progress: last_progress,
            });

            let fetched = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.finish(PollOutcome::Cancelled),
                fetched = self.source.fetch(session_id) => fetched,
            };

            match fetched {
                Ok(report) => match report.status {
                    JobStatus::Completed => {
                        info!(session_id, attempt, pages = report.pages.len(), "Job completed");
                        return self.finish(PollOutcome::Completed(report));
                    }
                    JobStatus::Failed => {
                        let message = report.error.unwrap_or_else(|| "job failed".to_string());
                        warn!(session_id, attempt, "Job failed: {}", message);
                        return self.finish(PollOutcome::Failed(message));
                    }
                    JobStatus::Pending | JobStatus::Processing => {
                        debug!(
                            session_id,
                            attempt,
                            current = report.progress.current,
                            total = report.progress.total,
                            "Job still running"
                        );
                        last_progress = Some(report.progress);
                        self.set_state(PollState::Polling {
                            attempt,
                            progress: last_progress,
                        });
                    }
                },
                Err(PollError::Transient(message)) => {
                    warn!(session_id, attempt, "Status query failed, retrying: {}", message);
                }
                Err(e) => {
                    warn!(session_id, attempt, "Status query failed: {}", e);
                    return self.finish(PollOutcome::Failed(e.to_string()));
                }
            }

            if attempt < self.config.max_attempts && !self.pause(self.config.interval).await {
                return self.finish(PollOutcome::Cancelled);
            }
        }

        warn!(session_id, attempts = self.config.max_attempts, "Gave up waiting for job");
        self.finish(PollOutcome::TimedOut {
            attempts: self.config.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use session::{CrawlJob, JobUpdate};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use url::Url;

    /// Replays scripted answers, then keeps reporting `processing`.
    struct ScriptedSource {
        answers: Mutex<VecDeque<Result<JobStatus, PollError>>>,
        calls: AtomicU32,
    }

    impl ScriptedSource {
        fn new(answers: Vec<Result<JobStatus, PollError>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn report(status: JobStatus) -> JobStatusReport {
        let mut job = CrawlJob::new("s-1", &Url::parse("https://example.com").unwrap());
        job.apply(JobUpdate::status(JobStatus::Processing));
        match status {
            JobStatus::Completed => {
                job.apply(JobUpdate::completed(Progress::default()));
            }
            JobStatus::Failed => {
                job.apply(JobUpdate::failed("browser did not start"));
            }
            _ => {}
        }
        job.report()
    }

    #[async_trait]
    impl StatusSource for ScriptedSource {
        async fn fetch(&self, _session_id: &str) -> Result<JobStatusReport, PollError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self
                .answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(JobStatus::Processing));
            next.map(report)
        }
    }

    fn config(max_attempts: u32) -> PollConfig {
        PollConfig {
            initial_delay: Duration::from_secs(1),
            interval: Duration::from_secs(2),
            max_attempts,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_after_processing_rounds() {
        let source = ScriptedSource::new(vec![
            Ok(JobStatus::Pending),
            Ok(JobStatus::Processing),
            Ok(JobStatus::Completed),
        ]);
        let coordinator = PollingCoordinator::new(source.clone(), config(10));

        let outcome = coordinator.poll("s-1").await;
        assert!(matches!(outcome, PollOutcome::Completed(ref r) if r.status == JobStatus::Completed));
        assert_eq!(source.calls(), 3);
        assert_eq!(coordinator.state(), PollState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_when_job_never_finishes() {
        let source = ScriptedSource::new(vec![]);
        let coordinator = PollingCoordinator::new(source.clone(), config(5));
        let started = tokio::time::Instant::now();

        let outcome = coordinator.poll("s-1").await;
        assert!(matches!(outcome, PollOutcome::TimedOut { attempts: 5 }));
        assert_eq!(source.calls(), 5);
        // initial delay plus four intervals between five attempts
        assert_eq!(started.elapsed(), Duration::from_secs(9));
        assert_eq!(coordinator.state(), PollState::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_fails_fast() {
        let source = ScriptedSource::new(vec![Err(PollError::NotFound("s-1".to_string()))]);
        let coordinator = PollingCoordinator::new(source.clone(), config(10));

        let outcome = coordinator.poll("s-1").await;
        match outcome {
            PollOutcome::Failed(message) => assert!(message.contains("not found")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_keep_polling() {
        let source = ScriptedSource::new(vec![
            Err(PollError::Transient("connection refused".to_string())),
            Err(PollError::Transient("connection refused".to_string())),
            Ok(JobStatus::Completed),
        ]);
        let coordinator = PollingCoordinator::new(source.clone(), config(10));

        assert!(matches!(coordinator.poll("s-1").await, PollOutcome::Completed(_)));
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_job_surfaces_message() {
        let source = ScriptedSource::new(vec![Ok(JobStatus::Processing), Ok(JobStatus::Failed)]);
        let coordinator = PollingCoordinator::new(source, config(10));

        match coordinator.poll("s-1").await {
            PollOutcome::Failed(message) => assert_eq!(message, "browser did not start"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_timer() {
        let source = ScriptedSource::new(vec![]);
        let coordinator = Arc::new(PollingCoordinator::new(source.clone(), config(10)));
        let mut states = coordinator.subscribe();

        let task = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.poll("s-1").await })
        };

        states.wait_for(|state| *state == PollState::Waiting).await.unwrap();
        coordinator.stop();

        assert!(matches!(task.await.unwrap(), PollOutcome::Cancelled));
        assert_eq!(source.calls(), 0);
        assert_eq!(coordinator.state(), PollState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_is_published() {
        let source = ScriptedSource::new(vec![Ok(JobStatus::Processing)]);
        let coordinator = Arc::new(PollingCoordinator::new(source, config(3)));
        let mut states = coordinator.subscribe();

        let task = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.poll("s-1").await })
        };

        let seen = states
            .wait_for(|state| matches!(state, PollState::Polling { progress: Some(_), .. }))
            .await
            .unwrap()
            .clone();
        assert!(matches!(seen, PollState::Polling { attempt: 1, .. }));

        assert!(matches!(task.await.unwrap(), PollOutcome::TimedOut { attempts: 3 }));
    }

    #[tokio::test]
    async fn test_zero_attempts_times_out_immediately() {
        let source = ScriptedSource::new(vec![Ok(JobStatus::Completed)]);
        let coordinator = PollingCoordinator::new(
            source.clone(),
            PollConfig {
                initial_delay: Duration::ZERO,
                interval: Duration::ZERO,
                max_attempts: 0,
            },
        );
        assert!(matches!(
            coordinator.poll("s-1").await,
            PollOutcome::TimedOut { attempts: 0 }
        ));
        assert_eq!(source.calls(), 0);
    }
}
