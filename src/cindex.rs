//! The consistent-index cursor.
//!
//! The cursor is the persisted copy of the applied index (and its term). It
//! is staged in memory while a batch of entries applies and written into the
//! meta bucket by the backend pre-commit hook, so the cursor and the entry's
//! effects commit in the same transaction. On restart it is read back to
//! suppress duplicate application of re-delivered entries.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::storage;
use crate::storage::Backend;
use crate::storage::BatchTx;

/// The cursor contract used by the apply engine and the backend hook.
pub trait ConsistentIndexer: Send + Sync {
    /// The latest committed consistent index.
    fn consistent_index(&self) -> u64;

    /// The term recorded with the latest committed consistent index.
    fn consistent_term(&self) -> u64;

    /// Stage the position of the entry currently being applied; persisted by
    /// the next [`unsafe_save`](Self::unsafe_save).
    fn set_consistent_applying(&self, term: u64, index: u64);

    /// Overwrite the committed value directly. Restart/bootstrap only.
    fn set_consistent_index(&self, term: u64, index: u64);

    /// Write the staged position into the meta bucket of an open batch
    /// transaction. Runs as the pre-commit hook.
    fn unsafe_save(&self, tx: &mut BatchTx<'_>);
}

/// Backend-backed cursor.
pub struct ConsistentIndex {
    be: Arc<Backend>,

    /// Cached committed values; zero means not yet read from the backend.
    index: AtomicU64,
    term: AtomicU64,

    /// Values staged by the applier for the open transaction.
    applying_index: AtomicU64,
    applying_term: AtomicU64,
}

impl ConsistentIndex {
    pub fn new(be: Arc<Backend>) -> Self {
        Self {
            be,
            index: AtomicU64::new(0),
            term: AtomicU64::new(0),
            applying_index: AtomicU64::new(0),
            applying_term: AtomicU64::new(0),
        }
    }
}

impl ConsistentIndexer for ConsistentIndex {
    fn consistent_index(&self) -> u64 {
        let cached = self.index.load(Ordering::Acquire);
        if cached != 0 {
            return cached;
        }
        let (term, index) = storage::schema::read_consistent_index(&self.be.read_tx());
        self.index.store(index, Ordering::Release);
        self.term.store(term, Ordering::Release);
        index
    }

    fn consistent_term(&self) -> u64 {
        // Populate the cache alongside the index.
        let _ = self.consistent_index();
        self.term.load(Ordering::Acquire)
    }

    fn set_consistent_applying(&self, term: u64, index: u64) {
        self.applying_term.store(term, Ordering::Release);
        self.applying_index.store(index, Ordering::Release);
    }

    fn set_consistent_index(&self, term: u64, index: u64) {
        self.term.store(term, Ordering::Release);
        self.index.store(index, Ordering::Release);
    }

    fn unsafe_save(&self, tx: &mut BatchTx<'_>) {
        let index = self.applying_index.load(Ordering::Acquire);
        let term = self.applying_term.load(Ordering::Acquire);
        if index == 0 {
            // Nothing staged yet; an empty cursor must never clobber a
            // persisted one.
            return;
        }
        storage::schema::unsafe_update_consistent_index(tx, term, index);
        self.set_consistent_index(term, index);
    }
}

/// Fixed cursor for tests that do not exercise persistence.
pub struct FakeConsistentIndex {
    index: AtomicU64,
    term: AtomicU64,
}

impl FakeConsistentIndex {
    pub fn new(index: u64) -> Self {
        Self {
            index: AtomicU64::new(index),
            term: AtomicU64::new(0),
        }
    }
}

impl ConsistentIndexer for FakeConsistentIndex {
    fn consistent_index(&self) -> u64 {
        self.index.load(Ordering::Acquire)
    }

    fn consistent_term(&self) -> u64 {
        self.term.load(Ordering::Acquire)
    }

    fn set_consistent_applying(&self, term: u64, index: u64) {
        self.term.store(term, Ordering::Release);
        self.index.store(index, Ordering::Release);
    }

    fn set_consistent_index(&self, term: u64, index: u64) {
        self.term.store(term, Ordering::Release);
        self.index.store(index, Ordering::Release);
    }

    fn unsafe_save(&self, _tx: &mut BatchTx<'_>) {}
}
