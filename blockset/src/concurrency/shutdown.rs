//! Graceful stop requests.
//!
//! Built on a watch channel of unit values: a request is a send, so every receiver observes
//! it, including receivers that start waiting after it was sent.

use tokio::sync::watch;

/// Sending side of a stop request.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<()>);

impl ShutdownTx {
    /// Asks every subscribed receiver to stop.
    ///
    /// Succeeds even when no receiver is alive anymore, a finished block has nothing left to
    /// stop.
    pub fn shutdown(&self) {
        self.0.send_replace(());
    }

    pub fn subscribe(&self) -> ShutdownRx {
        ShutdownRx(self.0.subscribe())
    }
}

/// Receiving side of a stop request.
#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<()>);

impl ShutdownRx {
    /// Resolves once a stop was requested.
    ///
    /// Also resolves when the sender is gone, since nobody can keep the receiver running then.
    pub async fn requested(&mut self) {
        let _ = self.0.changed().await;
    }

    /// Returns `true` if a stop was requested and not yet observed through [`Self::requested`].
    pub fn is_requested(&self) -> bool {
        self.0.has_changed().unwrap_or(true)
    }
}

/// Creates a stop request channel.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(());
    (ShutdownTx(tx), ShutdownRx(rx))
}
