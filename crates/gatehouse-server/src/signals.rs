use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

/// Resolve on the first SIGINT or SIGTERM.
pub async fn wait_for_shutdown() -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}
