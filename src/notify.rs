//! Edge-triggered notifiers and close-once signals built on watch channels.

use tokio::sync::watch;

/// A repeatable notifier.
///
/// Subscribers observe every [`notify`](Self::notify) that happens after they
/// subscribed; notifications are not queued, only the latest generation
/// matters. Used for leader-change events such as the first commit in a term.
#[derive(Debug)]
pub struct Notifier {
    tx: watch::Sender<u64>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx }
    }

    /// Subscribe to future notifications. `changed().await` on the returned
    /// receiver resolves on the next [`notify`](Self::notify).
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }

    pub fn notify(&self) {
        self.tx.send_modify(|gen| *gen += 1);
    }
}

/// A one-way close signal, the channel-close idiom of the lifecycle
/// machinery: `stop`, `stopping` and `done` are all `Closer`s. Clones share
/// the signal.
#[derive(Debug, Clone)]
pub struct Closer {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl Default for Closer {
    fn default() -> Self {
        Self::new()
    }
}

impl Closer {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: std::sync::Arc::new(tx) }
    }

    /// Close the signal. Idempotent; returns true on the first close.
    pub fn close(&self) -> bool {
        let mut first = false;
        self.tx.send_if_modified(|closed| {
            first = !*closed;
            *closed = true;
            first
        });
        first
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal is closed. Resolves immediately if it already is.
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        // wait_for only errs when the sender is dropped, and self holds it.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_notifier_wakes_subscriber() {
        let n = Notifier::new();
        let mut rx = n.subscribe();
        n.notify();
        tokio::time::timeout(Duration::from_secs(1), rx.changed()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_closer_close_once() {
        let c = Closer::new();
        assert!(!c.is_closed());
        assert!(c.close());
        assert!(!c.close());
        assert!(c.is_closed());

        // closed() resolves immediately after close.
        tokio::time::timeout(Duration::from_secs(1), c.closed()).await.unwrap();
    }
}
