use super::Result;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Signals that interrupt a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Int,
    Term,
}

/// Resolves on the first SIGINT or SIGTERM.
///
/// The handlers are installed when this is called, not when it is first
/// polled, so a signal arriving before the first poll is not lost.
pub fn shutdown_signal() -> Result<impl std::future::Future<Output = Interrupt>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => Interrupt::Int,
            _ = sigterm.recv() => Interrupt::Term,
        }
    })
}

/// Cancels `token` when SIGINT or SIGTERM arrives
pub fn cancel_on_signal(token: CancellationToken) -> Result<()> {
    let interrupted = shutdown_signal()?;
    tokio::spawn(async move {
        tokio::select! {
            signal = interrupted => {
                info!("received {:?}, stopping the run", signal);
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    });
    Ok(())
}
