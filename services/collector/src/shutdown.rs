//! Shutdown signalling.
//!
//! Every long-running loop takes a `watch::Receiver<bool>`; `true` means stop.

use tokio::sync::watch;

/// Resolves once `signal` is set, or once its sender is gone.
pub async fn signalled(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|stop| *stop).await;
}

/// Whether `signal` is already set.
pub fn is_set(signal: &watch::Receiver<bool>) -> bool {
    *signal.borrow()
}
