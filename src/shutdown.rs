//! Process signal wiring for cooperative shutdown.

use tokio_util::sync::CancellationToken;

use crate::Result;

/// Spawn a task that cancels `token` on SIGINT, SIGTERM or SIGHUP.
///
/// The consumer polls the token between deliveries, so a signal never interrupts a message
/// that is being handled. Listener registration happens before this returns, so a signal
/// arriving right after the call is not lost.
pub fn listen_for_signals(token: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate()).map_err(crate::Error::Signal)?;
        let mut hangup = signal(SignalKind::hangup()).map_err(crate::Error::Signal)?;
        let mut interrupt = signal(SignalKind::interrupt()).map_err(crate::Error::Signal)?;

        tokio::spawn(async move {
            let name = tokio::select! {
                _ = token.cancelled() => return,
                _ = terminate.recv() => "SIGTERM",
                _ = hangup.recv() => "SIGHUP",
                _ = interrupt.recv() => "SIGINT",
            };
            tracing::info!(signal = name, "shutdown signal received");
            token.cancel();
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                result = tokio::signal::ctrl_c() => match result {
                    Ok(()) => {
                        tracing::info!(signal = "ctrl-c", "shutdown signal received");
                        token.cancel();
                    }
                    Err(e) => tracing::error!(error = ?e, "unable to listen for ctrl-c"),
                },
            }
        });
    }

    Ok(())
}
