//! Completion signals for block tasks.
//!
//! The sender lives inside the block task. It fires when the block returns and is dropped when
//! the task is aborted, and receivers treat both the same way.

use tokio::sync::watch;

pub type SignalTx = watch::Sender<()>;

#[derive(Debug, Clone)]
pub struct SignalRx(watch::Receiver<()>);

impl SignalRx {
    /// Resolves once the signal fired or its sender was dropped.
    pub async fn fired(&mut self) {
        let _ = self.0.changed().await;
    }

    pub fn has_fired(&self) -> bool {
        self.0.has_changed().unwrap_or(true)
    }
}

/// Creates a completion signal, initially not fired.
pub fn create_signal() -> (SignalTx, SignalRx) {
    let (tx, rx) = watch::channel(());
    (tx, SignalRx(rx))
}
