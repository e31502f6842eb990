use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a handler for SIGTERM and ctrl-c.
///
/// Returns a `CancellationToken` cancelled on the first signal. Every
/// long-running loop in the scheduler selects on this token, so a single
/// cancellation drains the whole process. The bus consumer also cancels
/// it when the broker connection is lost beyond recovery.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let handle = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received ctrl-c, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        handle.cancel();
    });

    token
}
