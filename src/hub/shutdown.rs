//! Termination signals

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Resolve on SIGINT or SIGTERM.
///
/// If a handler cannot be installed the relay keeps running and relies on
/// the remaining triggers.
pub async fn wait_for_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => Some(sigterm),
        Err(e) => {
            log::error!("Failed to set up SIGTERM handler: {}", e);
            None
        }
    };

    let terminate = async {
        match sigterm.as_mut() {
            Some(sigterm) => {
                sigterm.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = interrupt => log::info!("Received SIGINT, initiating graceful shutdown..."),
        _ = terminate => log::info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}

/// Cancel `token` when a termination signal arrives.
pub fn spawn_signal_listener(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_signal() => token.cancel(),
            _ = token.cancelled() => {}
        }
    });
}
