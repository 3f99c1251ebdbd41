use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Cancels `token` on the first SIGINT or SIGTERM. Everything that should
/// wind down on shutdown watches a clone of it.
pub fn install(token: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals = Signals::new([SIGTERM, SIGINT])?;

        std::thread::Builder::new()
            .name("shutdown-signals".to_string())
            .spawn(move || {
                if let Some(sig) = signals.forever().next() {
                    info!("Received shutdown signal ({}), initiating graceful shutdown", sig);
                    token.cancel();
                }
            })?;
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, initiating graceful shutdown");
                token.cancel();
            }
        });
    }

    Ok(())
}
