//! Broadcast-once exit signal shared by every persister task.

use tokio::sync::watch;

/// Owner side of the exit signal.
///
/// Firing is idempotent. Dropping the signal also releases every listener.
#[derive(Debug)]
pub struct ExitSignal {
    tx: watch::Sender<bool>,
}

impl ExitSignal {
    /// Creates an unfired signal.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Fires the signal. Later calls are no-ops.
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }

    /// Returns `true` once the signal has fired.
    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Creates a listener for a task.
    pub fn listener(&self) -> ExitListener {
        ExitListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ExitSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Task side of the exit signal.
#[derive(Debug, Clone)]
pub struct ExitListener {
    rx: watch::Receiver<bool>,
}

impl ExitListener {
    /// Resolves once the signal fires or its owner is dropped.
    ///
    /// Cancel safe; intended as a `tokio::select!` branch.
    pub async fn wait(&mut self) {
        // An Err means the owner is gone, which counts as exit.
        let _ = self.rx.wait_for(|fired| *fired).await;
    }

    /// Returns `true` if the signal has fired.
    pub fn is_fired(&self) -> bool {
        *self.rx.borrow()
    }
}
