//! Wait registries that wake proposal issuers.
//!
//! [`WaitList`] maps a request id to a one-shot channel: the proposer
//! registers before proposing, the applier triggers when the entry carrying
//! that id is applied. [`WaitTime`] is the index-threshold variant used to
//! wait until the applied index reaches a target.

use std::collections::hash_map::Entry as MapEntry;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

const SHARD_COUNT: usize = 64;

/// ID-indexed single-shot result delivery.
///
/// Each id may have at most one outstanding registration. Registering a
/// duplicate id yields an already-closed channel (the receiver resolves with
/// a recv error immediately). Triggering an unregistered id is a silent
/// no-op; the applier triggers every entry it sees, registered or not.
pub trait Wait<T>: Send + Sync {
    /// Register interest in `id`; the returned receiver fires when the
    /// applier triggers it.
    fn register(&self, id: u64) -> oneshot::Receiver<T>;

    /// Deliver `value` to the waiter for `id`, freeing the registration.
    /// Returns false if nothing was registered.
    fn trigger(&self, id: u64, value: T) -> bool;

    fn is_registered(&self, id: u64) -> bool;
}

/// The standard sharded wait registry.
#[derive(Debug)]
pub struct WaitList<T> {
    shards: Vec<Mutex<HashMap<u64, oneshot::Sender<T>>>>,
}

impl<T> Default for WaitList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WaitList<T> {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, id: u64) -> &Mutex<HashMap<u64, oneshot::Sender<T>>> {
        &self.shards[(id % SHARD_COUNT as u64) as usize]
    }
}

impl<T: Send> Wait<T> for WaitList<T> {
    fn register(&self, id: u64) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        let mut shard = self.shard(id).lock().unwrap();
        match shard.entry(id) {
            MapEntry::Vacant(v) => {
                v.insert(tx);
            }
            MapEntry::Occupied(_) => {
                // Drop tx: the receiver resolves closed right away and the
                // existing registration stays intact.
                tracing::error!(id = id, "duplicate registration in wait registry");
            }
        }
        rx
    }

    fn trigger(&self, id: u64, value: T) -> bool {
        let tx = self.shard(id).lock().unwrap().remove(&id);
        match tx {
            // The receiver may have been dropped by a cancelled caller;
            // delivery failure is indistinguishable from a lazy free.
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    fn is_registered(&self, id: u64) -> bool {
        self.shard(id).lock().unwrap().contains_key(&id)
    }
}

/// Threshold-triggered waiters: `wait(n)` resolves once some `trigger(m)`
/// with `m >= n` has happened.
#[derive(Debug, Default)]
pub struct WaitTime {
    inner: Mutex<WaitTimeInner>,
}

#[derive(Debug, Default)]
struct WaitTimeInner {
    last_triggered: u64,
    pending: BTreeMap<u64, Vec<oneshot::Sender<()>>>,
}

impl WaitTime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait(&self, index: u64) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap();
        if index <= inner.last_triggered {
            let _ = tx.send(());
        } else {
            inner.pending.entry(index).or_default().push(tx);
        }
        rx
    }

    /// Fire every waiter with a threshold `<= index`.
    pub fn trigger(&self, index: u64) {
        let mut inner = self.inner.lock().unwrap();
        if index < inner.last_triggered {
            return;
        }
        inner.last_triggered = index;
        let still_pending = inner.pending.split_off(&(index + 1));
        let ready = std::mem::replace(&mut inner.pending, still_pending);
        for (_, txs) in ready {
            for tx in txs {
                let _ = tx.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_then_trigger() {
        let w: WaitList<u64> = WaitList::new();
        let rx = w.register(7);
        assert!(w.is_registered(7));

        assert!(w.trigger(7, 42));
        assert_eq!(42, rx.await.unwrap());
        assert!(!w.is_registered(7));
    }

    #[tokio::test]
    async fn test_trigger_unregistered_is_noop() {
        let w: WaitList<u64> = WaitList::new();
        assert!(!w.trigger(1, 0));
    }

    #[tokio::test]
    async fn test_duplicate_register_gets_closed_channel() {
        let w: WaitList<u64> = WaitList::new();
        let first = w.register(9);
        let dup = w.register(9);

        // The duplicate resolves closed immediately; the original still works.
        assert!(dup.await.is_err());
        assert!(w.trigger(9, 1));
        assert_eq!(1, first.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_time_already_triggered() {
        let wt = WaitTime::new();
        wt.trigger(10);
        wt.wait(10).await.unwrap();
        wt.wait(3).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_time_fires_all_below_threshold() {
        let wt = WaitTime::new();
        let a = wt.wait(5);
        let b = wt.wait(8);
        let c = wt.wait(9);

        wt.trigger(8);
        a.await.unwrap();
        b.await.unwrap();

        // 9 is still pending.
        let mut c = c;
        assert!(c.try_recv().is_err());
        wt.trigger(9);
        c.await.unwrap();
    }
}
