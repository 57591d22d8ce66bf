//! Connection-scoped cancellation
//!
//! Every inbound connection owns a [`CancelOnDrop`]; the requests it carries
//! hold [`Cancellation`] handles. When the connection task ends, in-flight
//! upstream calls and body relays observe the signal and stop.

use tokio::sync::watch;

/// Create a linked trigger/handle pair
pub fn cancellation() -> (CancelOnDrop, Cancellation) {
    let (tx, rx) = watch::channel(false);
    (CancelOnDrop { tx }, Cancellation { rx })
}

/// Fires the signal when dropped
pub struct CancelOnDrop {
    tx: watch::Sender<bool>,
}

impl CancelOnDrop {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the owning connection is gone
    pub async fn cancelled(mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            // Sender dropped counts as cancelled.
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}
