use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use browser::{BrowserPool, ChromeLauncher};
use orchestrator::{archive_job, Orchestrator};
use poller::{PollConfig, PollOutcome, PollingCoordinator, RemoteClient, StoreStatusSource};
use session::{spawn_retention_sweeper, InMemoryJobStore, JobStore};

mod api;
mod cli;
mod progress;
mod shutdown;

use cli::{BrowserArgs, Cli, Commands, JobArgs, ServeArgs};
use progress::CrawlProgress;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = <Cli as clap::Parser>::parse();
    init_tracing(cli.verbose, cli.quiet);

    let shutdown_token = CancellationToken::new();
    shutdown::install(shutdown_token.clone()).context("failed to install signal handlers")?;

    match cli.command {
        Commands::Serve(args) => serve(args, shutdown_token).await,
        Commands::Crawl {
            url,
            output,
            job,
            browser,
        } => crawl(&url, &output, &job, &browser, shutdown_token, !cli.quiet).await,
        Commands::Submit {
            url,
            server,
            output,
            poll_interval_secs,
            max_attempts,
            job,
        } => {
            let config = PollConfig {
                interval: std::time::Duration::from_secs(poll_interval_secs),
                max_attempts,
                ..PollConfig::default()
            };
            submit(&url, &server, &output, &job, config, shutdown_token, !cli.quiet).await
        }
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn browser_pool(args: &BrowserArgs) -> Arc<BrowserPool> {
    let launcher = Arc::new(ChromeLauncher::new(args.launch_config()));
    Arc::new(BrowserPool::new(launcher, args.pool_policy()))
}

async fn serve(args: ServeArgs, shutdown_token: CancellationToken) -> Result<()> {
    info!("Site capture service starting...");

    let pool = browser_pool(&args.browser);
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let orchestrator =
        Arc::new(Orchestrator::new(pool.clone(), store.clone()).with_shutdown(shutdown_token.clone()));
    let sweeper = spawn_retention_sweeper(store, args.retention_policy(), shutdown_token.clone());

    let app = api::create_router(api::AppState { orchestrator });
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!("Listening on {}", args.bind);

    let token = shutdown_token.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .context("HTTP server failed")?;

    shutdown_token.cancel();
    if let Err(e) = sweeper.await {
        warn!("Retention sweeper ended abnormally: {}", e);
    }
    pool.shutdown().await;
    info!("Site capture service stopped");
    Ok(())
}

/// Polls until the job ends, mirroring its progress on the terminal.
async fn wait_for_job(coordinator: &PollingCoordinator, session_id: &str, progress: &CrawlProgress) -> PollOutcome {
    let mut states = coordinator.subscribe();
    let poll = coordinator.poll(session_id);
    tokio::pin!(poll);

    loop {
        tokio::select! {
            outcome = &mut poll => return outcome,
            changed = states.changed() => {
                if changed.is_err() {
                    return (&mut poll).await;
                }
                let state = states.borrow_and_update().clone();
                progress.update(&state);
            }
        }
    }
}

async fn write_archive(output: &Path, session_id: &str, archive: &[u8]) -> Result<PathBuf> {
    tokio::fs::create_dir_all(output)
        .await
        .with_context(|| format!("failed to create {}", output.display()))?;
    let path = output.join(format!("capture-{}.zip", session_id));
    tokio::fs::write(&path, archive)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

async fn crawl(
    url: &str,
    output: &Path,
    job: &JobArgs,
    browser: &BrowserArgs,
    shutdown_token: CancellationToken,
    show_progress: bool,
) -> Result<()> {
    let pool = browser_pool(browser);
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let orchestrator = Arc::new(Orchestrator::new(pool.clone(), store.clone()).with_shutdown(shutdown_token));

    let session_id = orchestrator.submit(url, job.crawl_options()).await?;
    info!("Crawling {} (session {})", url, session_id);

    let coordinator = PollingCoordinator::new(Arc::new(StoreStatusSource::new(store.clone())), job.local_poll_config());
    let progress = CrawlProgress::new(show_progress);
    let outcome = wait_for_job(&coordinator, &session_id, &progress).await;
    pool.shutdown().await;

    let report = match outcome {
        PollOutcome::Completed(report) => report,
        PollOutcome::Failed(message) => {
            progress.finish("✗ Crawl failed");
            bail!("crawl failed: {}", message);
        }
        PollOutcome::TimedOut { attempts } => {
            progress.finish("✗ Gave up waiting");
            bail!("crawl did not finish after {} status checks", attempts);
        }
        PollOutcome::Cancelled => bail!("crawl cancelled"),
    };
    progress.finish("✓ Crawl completed");

    let finished = store
        .get(&session_id)
        .await?
        .context("finished job disappeared from the store")?;
    let archive = archive_job(&finished).context("failed to package screenshots")?;
    let path = write_archive(output, &session_id, &archive).await?;

    info!(
        "Captured {} pages ({} failed), archive written to {}",
        report.success_count,
        report.failure_count,
        path.display()
    );
    println!("{}", path.display());
    Ok(())
}

async fn submit(
    url: &str,
    server: &str,
    output: &Path,
    job: &JobArgs,
    config: PollConfig,
    shutdown_token: CancellationToken,
    show_progress: bool,
) -> Result<()> {
    let client = RemoteClient::new(server)?;
    let options = job.crawl_options();
    let submitted = client
        .submit(url, Some(&options))
        .await
        .with_context(|| format!("failed to submit {} to {}", url, server))?;
    info!("Submitted {} (session {})", url, submitted.session_id);

    let coordinator =
        PollingCoordinator::new(Arc::new(client.clone()), config).with_cancellation(shutdown_token);
    let progress = CrawlProgress::new(show_progress);

    match wait_for_job(&coordinator, &submitted.session_id, &progress).await {
        PollOutcome::Completed(report) => {
            progress.finish("✓ Crawl completed");
            info!(
                "Captured {} pages ({} failed)",
                report.success_count, report.failure_count
            );
        }
        PollOutcome::Failed(message) => {
            progress.finish("✗ Crawl failed");
            bail!("crawl failed: {}", message);
        }
        PollOutcome::TimedOut { attempts } => {
            progress.finish("✗ Gave up waiting");
            bail!(
                "session {} still running after {} status checks",
                submitted.session_id,
                attempts
            );
        }
        PollOutcome::Cancelled => bail!("stopped waiting for session {}", submitted.session_id),
    }

    let archive = client
        .download(&submitted.session_id)
        .await
        .context("failed to download archive")?;
    let path = write_archive(output, &submitted.session_id, &archive).await?;
    info!("Archive written to {}", path.display());
    println!("{}", path.display());
    Ok(())
}
