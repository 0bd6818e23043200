//! Cooperative cancellation for connector cycles.

use tokio::sync::watch;

/// Cancellation flag observed by a running cycle.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Create a flag and the sender that trips it.
    #[must_use]
    pub fn new() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until cancellation is requested.
    ///
    /// Never completes if the sender is dropped without triggering.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trip_is_observed() {
        let (tx, shutdown) = Shutdown::new();
        assert!(!shutdown.is_triggered());

        tx.send(true).unwrap();

        assert!(shutdown.is_triggered());
        shutdown.triggered().await;
    }
}
