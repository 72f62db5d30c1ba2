use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Sleep for `duration` unless `cancel` fires first.
///
/// Returns `true` when the full duration elapsed and `false` when the sleep
/// was cut short by shutdown.
pub async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Cancel `cancel` on SIGINT or SIGTERM.
#[cfg(unix)]
pub fn install_signal_handlers(cancel: CancellationToken) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, finishing current work before exit"),
            _ = sigint.recv() => info!("Received SIGINT, finishing current work before exit"),
        }
        cancel.cancel();
    });
    Ok(())
}

#[cfg(not(unix))]
pub fn install_signal_handlers(cancel: CancellationToken) -> std::io::Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, finishing current work before exit");
            cancel.cancel();
        }
    });
    Ok(())
}
