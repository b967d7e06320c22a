//! The server's backend pre-commit hook.

use std::sync::Arc;
use std::sync::Mutex;

use crate::cindex::ConsistentIndexer;
use crate::raft::ConfState;
use crate::storage;
use crate::storage::BatchTx;
use crate::storage::Hooks;

/// Persists the staged consistent index, and the voting configuration when a
/// conf change dirtied it, into every committing batch transaction. This is
/// what makes applying an entry and advancing the cursor atomic.
pub struct BackendHooks {
    indexer: Option<Arc<dyn ConsistentIndexer>>,
    conf_state: Mutex<ConfStateCache>,
}

#[derive(Default)]
struct ConfStateCache {
    dirty: bool,
    conf_state: ConfState,
}

impl BackendHooks {
    pub fn new(indexer: Option<Arc<dyn ConsistentIndexer>>) -> Self {
        Self {
            indexer,
            conf_state: Mutex::new(ConfStateCache::default()),
        }
    }

    /// Stage a new voting configuration for the next commit.
    pub fn set_conf_state(&self, conf_state: &ConfState) {
        let mut cache = self.conf_state.lock().unwrap();
        cache.conf_state = conf_state.clone();
        cache.dirty = true;
    }
}

impl Hooks for BackendHooks {
    fn on_pre_commit(&self, tx: &mut BatchTx<'_>) {
        if let Some(indexer) = &self.indexer {
            indexer.unsafe_save(tx);
        }
        let mut cache = self.conf_state.lock().unwrap();
        if cache.dirty {
            storage::schema::unsafe_save_conf_state(tx, &cache.conf_state);
            cache.dirty = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::cindex::ConsistentIndex;
    use crate::cindex::ConsistentIndexer;
    use crate::raft::ConfState;
    use crate::storage;
    use crate::storage::Backend;
    use crate::storage::BackendHooks;

    #[test]
    fn test_pre_commit_saves_index_and_conf_state() {
        let be = Arc::new(Backend::new());
        let ci = Arc::new(ConsistentIndex::new(be.clone()));
        let hooks = Arc::new(BackendHooks::new(Some(ci.clone())));
        be.set_hooks(hooks.clone());

        ci.set_consistent_applying(3, 7);
        hooks.set_conf_state(&ConfState {
            voters: vec![1],
            learners: vec![],
        });
        be.force_commit();

        let rtx = be.read_tx();
        assert_eq!((3, 7), storage::schema::read_consistent_index(&rtx));
        assert_eq!(
            Some(ConfState {
                voters: vec![1],
                learners: vec![]
            }),
            storage::schema::conf_state_from_backend(&rtx)
        );
    }
}
