use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cancel `token` on SIGTERM or SIGINT.
///
/// The node's HTTP server, dispatch loop, offer timers and alert loops all
/// watch the same token and wind down when it fires.
pub fn cancel_on_signal(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!(error = %e, "Could not install signal handlers");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, draining open offers");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, draining open offers");
            }
            _ = token.cancelled() => return,
        }

        token.cancel();
    })
}
