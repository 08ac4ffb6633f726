use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// ShutdownSignal
// ---------------------------------------------------------------------------

/// Cooperative shutdown coordinator.
///
/// Loops take a [`ShutdownListener`] and `select!` on it next to their work.
/// Work already in progress is allowed to finish; the listener only tells the
/// loop not to start another round.
///
/// ```ignore
/// let shutdown = ShutdownSignal::new();
/// let mut listener = shutdown.subscribe();
///
/// tokio::select! {
///     _ = listener.recv() => { /* stop */ }
///     _ = tokio::time::sleep(interval) => { /* next tick */ }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.tx.borrow()
    }

    /// Idempotent.
    pub fn trigger(&self) {
        let first = self.tx.send_if_modified(|stopping| {
            if *stopping {
                false
            } else {
                *stopping = true;
                true
            }
        });
        if first {
            info!("shutdown signal triggered");
        } else {
            debug!("shutdown already triggered");
        }
    }
}

/// Receiving side of a [`ShutdownSignal`].
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Resolves once shutdown has been triggered, immediately if it already was.
    pub async fn recv(&mut self) {
        let _ = self.rx.wait_for(|stopping| *stopping).await;
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn listeners_observe_trigger() {
        let signal = ShutdownSignal::new();
        let mut a = signal.subscribe();
        let mut b = signal.subscribe();
        assert!(!signal.is_shutting_down());

        signal.trigger();
        signal.trigger();

        tokio::time::timeout(Duration::from_secs(1), a.recv())
            .await
            .expect("listener a woke");
        tokio::time::timeout(Duration::from_secs(1), b.recv())
            .await
            .expect("listener b woke");
        assert!(signal.is_shutting_down());
    }

    #[tokio::test]
    async fn late_subscriber_sees_past_trigger() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        let mut late = signal.subscribe();
        assert!(late.is_triggered());
        tokio::time::timeout(Duration::from_secs(1), late.recv())
            .await
            .expect("resolves immediately");
    }

    #[tokio::test]
    async fn untriggered_listener_stays_pending() {
        let signal = ShutdownSignal::new();
        let mut listener = signal.subscribe();
        let waited = tokio::time::timeout(Duration::from_millis(20), listener.recv()).await;
        assert!(waited.is_err());
    }
}
