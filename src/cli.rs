use browser::{ImageFormat, LaunchConfig, PoolPolicy, Viewport, WaitStrategy};
use clap::{Args, Parser, Subcommand};
use orchestrator::CrawlOptions;
use poller::PollConfig;
use session::RetentionPolicy;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "site-capture")]
#[command(author = "CharaTech")]
#[command(version)]
#[command(about = "Site crawling and full-page screenshot capture", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the capture HTTP service
    Serve(ServeArgs),

    /// Crawl a site locally and write the archive to disk
    Crawl {
        /// URL to start crawling from
        #[arg(value_name = "URL")]
        url: String,

        /// Directory the archive is written to
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        #[command(flatten)]
        job: JobArgs,

        #[command(flatten)]
        browser: BrowserArgs,
    },

    /// Submit a crawl to a running service, wait for it and download the archive
    Submit {
        /// URL to start crawling from
        #[arg(value_name = "URL")]
        url: String,

        /// Base URL of the capture service
        #[arg(long, env = "SITE_CAPTURE_SERVER", default_value = "http://localhost:3000")]
        server: String,

        /// Directory the archive is written to
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Seconds between status checks
        #[arg(long, default_value = "2")]
        poll_interval_secs: u64,

        /// Status checks before giving up
        #[arg(long, default_value = "60")]
        max_attempts: u32,

        #[command(flatten)]
        job: JobArgs,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address the HTTP service listens on
    #[arg(long, env = "SITE_CAPTURE_BIND", default_value = "0.0.0.0:3000")]
    pub bind: SocketAddr,

    /// Seconds a job is kept before the sweeper evicts it
    #[arg(long, env = "SITE_CAPTURE_RETENTION_SECS", default_value = "3600")]
    pub retention_secs: u64,

    /// Seconds between retention sweeps
    #[arg(long, default_value = "60")]
    pub sweep_interval_secs: u64,

    #[command(flatten)]
    pub browser: BrowserArgs,
}

impl ServeArgs {
    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            retention: Duration::from_secs(self.retention_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct BrowserArgs {
    /// Chrome/Chromium executable (auto-detected when omitted)
    #[arg(long, env = "SITE_CAPTURE_CHROME")]
    pub chrome_path: Option<PathBuf>,

    /// Show the browser window instead of running headless
    #[arg(long)]
    pub headful: bool,

    /// Relaunch the shared browser after this many seconds
    #[arg(long, default_value = "1800")]
    pub browser_max_age_secs: u64,

    /// Relaunch the shared browser after this many idle seconds
    #[arg(long, default_value = "300")]
    pub browser_idle_secs: u64,
}

impl BrowserArgs {
    /// The engine's own idle cut-off outlives the pool's, so the pool always
    /// recycles a browser before the engine drops the connection.
    pub fn launch_config(&self) -> LaunchConfig {
        LaunchConfig {
            headless: !self.headful,
            chrome_path: self.chrome_path.clone(),
            idle_timeout: Duration::from_secs(self.browser_idle_secs.saturating_add(60)),
            ..LaunchConfig::default()
        }
    }

    pub fn pool_policy(&self) -> PoolPolicy {
        PoolPolicy {
            max_age: Duration::from_secs(self.browser_max_age_secs),
            idle_timeout: Duration::from_secs(self.browser_idle_secs),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct JobArgs {
    /// Pages to capture besides the seed
    #[arg(short = 'n', long, default_value = "5")]
    pub max_links: usize,

    /// Deepest level whose pages are expanded further
    #[arg(long, default_value = "0")]
    pub max_depth: usize,

    /// Per-page timeout in milliseconds
    #[arg(long, default_value = "30000")]
    pub timeout_ms: u64,

    /// Pages captured at the same time
    #[arg(short, long, default_value = "1")]
    pub concurrency: usize,

    /// When a page counts as loaded: dom-ready, load-complete or network-idle
    #[arg(long, default_value = "network-idle")]
    pub wait: WaitStrategy,

    /// Follow "next step" buttons and capture each step
    #[arg(long)]
    pub flow: bool,

    /// Flow steps per page
    #[arg(long, default_value = "5")]
    pub max_flow_steps: usize,

    /// Wall-clock budget of the whole job in seconds
    #[arg(long, default_value = "300")]
    pub budget_secs: u64,

    /// Settle time after load, in milliseconds
    #[arg(long, default_value = "1000")]
    pub post_load_delay_ms: u64,

    /// Capture the viewport only instead of the full page
    #[arg(long)]
    pub viewport_only: bool,

    /// Save JPEG instead of PNG
    #[arg(long)]
    pub jpeg: bool,

    #[arg(long, default_value = "1920")]
    pub width: u32,

    #[arg(long, default_value = "1080")]
    pub height: u32,
}

impl JobArgs {
    pub fn crawl_options(&self) -> CrawlOptions {
        CrawlOptions {
            max_links: self.max_links,
            max_depth: self.max_depth,
            timeout_ms: self.timeout_ms,
            concurrency: self.concurrency,
            wait_strategy: self.wait,
            capture_flow: self.flow,
            max_flow_steps: self.max_flow_steps,
            job_budget_ms: self.budget_secs.saturating_mul(1000),
            viewport: Viewport {
                width: self.width,
                height: self.height,
            },
            full_page: !self.viewport_only,
            post_load_delay_ms: self.post_load_delay_ms,
            format: if self.jpeg { ImageFormat::Jpeg } else { ImageFormat::Png },
            ..CrawlOptions::default()
        }
    }

    /// Polling bound for a local job: long enough for the budget plus the
    /// pages still in flight when it runs out.
    pub fn local_poll_config(&self) -> PollConfig {
        let interval = Duration::from_millis(500);
        let horizon_ms = self
            .budget_secs
            .saturating_mul(1000)
            .saturating_add(self.timeout_ms.saturating_mul(2 + self.max_flow_steps as u64))
            .saturating_add(30_000);
        PollConfig {
            initial_delay: Duration::ZERO,
            interval,
            max_attempts: u32::try_from(horizon_ms / 500).unwrap_or(u32::MAX),
        }
    }
}
