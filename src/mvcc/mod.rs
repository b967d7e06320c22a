//! The revision-keyed key-value store.
//!
//! Every mutation gets a new revision. The `key` bucket maps a 16-byte
//! revision (main, sub; both big-endian) to the full record written at that
//! revision, tombstones included; the `key_index` bucket maps a user key to
//! its revision history, so ranges at any revision are resolved without
//! scanning the whole revision space. Reads at a compacted revision fail
//! `Compacted`; reads ahead of the store fail `FutureRev`.

use std::sync::Arc;
use std::sync::RwLock;

use serde::Deserialize;
use serde::Serialize;

use crate::storage::Backend;
use crate::storage::BatchTx;
use crate::storage::Bucket;
use crate::storage::TxReader;

/// Key in the meta bucket recording the last finished compaction.
const FINISHED_COMPACT_KEY: &[u8] = b"finishedCompactRev";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MvccError {
    #[error("required revision has been compacted")]
    Compacted,

    #[error("required revision is a future revision")]
    FutureRev,
}

/// A stored record: one version of one key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub create_revision: u64,
    pub mod_revision: u64,
    pub version: u64,
    pub value: Vec<u8>,
    pub lease: u64,
}

/// One entry of a key's revision history in the `key_index` bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RevRecord {
    rev: u64,
    create_rev: u64,
    version: u64,
    tombstone: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KeyHistory {
    revs: Vec<RevRecord>,
}

/// Result of a range read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeResult {
    pub kvs: Vec<KeyValue>,
    /// The revision the read was served at.
    pub rev: u64,
    /// Number of keys matching, ignoring `limit`.
    pub count: u64,
}

fn rev_key(main: u64, sub: u64) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[..8].copy_from_slice(&main.to_be_bytes());
    buf[8..].copy_from_slice(&sub.to_be_bytes());
    buf
}

#[derive(Debug, Default)]
struct RevisionState {
    current_rev: u64,
    compact_rev: u64,
}

/// The MVCC store over the backend's `key` / `key_index` buckets.
///
/// Writers pass the open batch transaction of the entry being applied so the
/// revision data and the consistent index commit atomically.
pub struct KvStore {
    be: Arc<Backend>,
    state: RwLock<RevisionState>,
}

impl KvStore {
    pub fn new(be: Arc<Backend>) -> Self {
        let store = Self {
            be,
            state: RwLock::new(RevisionState::default()),
        };
        store.restore();
        store
    }

    /// Re-derive revision counters from the backend, after construction and
    /// after a snapshot restore.
    pub fn restore(&self) {
        let tx = self.be.read_tx();
        let current_rev = tx
            .unsafe_range(Bucket::Key, &[], Some(&[0]), 0)
            .last()
            .map(|(k, _)| u64::from_be_bytes(k[..8].try_into().unwrap()))
            .unwrap_or(0);
        let compact_rev = tx
            .unsafe_get(Bucket::Meta, FINISHED_COMPACT_KEY)
            .map(|v| u64::from_be_bytes(v[..8].try_into().unwrap()))
            .unwrap_or(0);

        let mut state = self.state.write().unwrap();
        state.current_rev = current_rev;
        state.compact_rev = compact_rev;
        tracing::info!(current_rev, compact_rev, "restored mvcc revision state");
    }

    pub fn current_revision(&self) -> u64 {
        self.state.read().unwrap().current_rev
    }

    pub fn compact_revision(&self) -> u64 {
        self.state.read().unwrap().compact_rev
    }

    fn read_history(tx: &impl TxReader, key: &[u8]) -> KeyHistory {
        tx.unsafe_get(Bucket::KeyIndex, key)
            .map(|v| serde_json::from_slice(&v).expect("key history is well formed"))
            .unwrap_or_default()
    }

    fn write_history(tx: &mut BatchTx<'_>, key: &[u8], history: &KeyHistory) {
        if history.revs.is_empty() {
            tx.unsafe_delete(Bucket::KeyIndex, key);
        } else {
            let value = serde_json::to_vec(history).expect("key history serializes");
            tx.unsafe_put(Bucket::KeyIndex, key, &value);
        }
    }

    /// Write one version of `key`, returning the new revision.
    pub fn put(&self, tx: &mut BatchTx<'_>, key: &[u8], value: &[u8], lease: u64) -> u64 {
        let rev = {
            let mut state = self.state.write().unwrap();
            state.current_rev += 1;
            state.current_rev
        };

        let mut history = Self::read_history(tx, key);
        let (create_rev, version) = match history.revs.last() {
            Some(last) if !last.tombstone => (last.create_rev, last.version + 1),
            _ => (rev, 1),
        };

        let kv = KeyValue {
            key: key.to_vec(),
            create_revision: create_rev,
            mod_revision: rev,
            version,
            value: value.to_vec(),
            lease,
        };
        tx.unsafe_put(Bucket::Key, &rev_key(rev, 0), &serde_json::to_vec(&kv).expect("kv serializes"));

        history.revs.push(RevRecord {
            rev,
            create_rev,
            version,
            tombstone: false,
        });
        Self::write_history(tx, key, &history);

        rev
    }

    /// Tombstone all live keys in `[key, range_end)`; `range_end` of `None`
    /// addresses the single key. Returns `(deleted, rev)`; the revision is
    /// unchanged when nothing matched.
    pub fn delete_range(&self, tx: &mut BatchTx<'_>, key: &[u8], range_end: Option<&[u8]>) -> (u64, u64) {
        let live: Vec<Vec<u8>> = self
            .live_keys(tx, key, range_end, 0)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        if live.is_empty() {
            return (0, self.current_revision());
        }

        let rev = {
            let mut state = self.state.write().unwrap();
            state.current_rev += 1;
            state.current_rev
        };

        for (sub, k) in live.iter().enumerate() {
            let kv = KeyValue {
                key: k.clone(),
                mod_revision: rev,
                ..KeyValue::default()
            };
            tx.unsafe_put(
                Bucket::Key,
                &rev_key(rev, sub as u64),
                &serde_json::to_vec(&kv).expect("kv serializes"),
            );

            let mut history = Self::read_history(tx, k);
            history.revs.push(RevRecord {
                rev,
                create_rev: 0,
                version: 0,
                tombstone: true,
            });
            Self::write_history(tx, k, &history);
        }

        (live.len() as u64, rev)
    }

    /// `(key, RevRecord)` of every key live at the current revision.
    fn live_keys(&self, tx: &impl TxReader, key: &[u8], range_end: Option<&[u8]>, limit: usize) -> Vec<(Vec<u8>, RevRecord)> {
        let entries = match range_end {
            None => tx.unsafe_get(Bucket::KeyIndex, key).map(|v| vec![(key.to_vec(), v)]).unwrap_or_default(),
            Some(end) => tx.unsafe_range(Bucket::KeyIndex, key, Some(end), 0),
        };

        let mut out = Vec::new();
        for (k, raw) in entries {
            let history: KeyHistory = serde_json::from_slice(&raw).expect("key history is well formed");
            if let Some(last) = history.revs.last() {
                if !last.tombstone {
                    out.push((k, last.clone()));
                    if limit != 0 && out.len() >= limit {
                        break;
                    }
                }
            }
        }
        out
    }

    /// Read keys in `[key, range_end)` at revision `rev` (0 = latest).
    pub fn range(
        &self,
        tx: &impl TxReader,
        key: &[u8],
        range_end: Option<&[u8]>,
        rev: u64,
        limit: usize,
    ) -> Result<RangeResult, MvccError> {
        let (current_rev, compact_rev) = {
            let state = self.state.read().unwrap();
            (state.current_rev, state.compact_rev)
        };
        let at = if rev == 0 { current_rev } else { rev };
        if at < compact_rev {
            return Err(MvccError::Compacted);
        }
        if at > current_rev {
            return Err(MvccError::FutureRev);
        }

        let entries = match range_end {
            None => tx.unsafe_get(Bucket::KeyIndex, key).map(|v| vec![(key.to_vec(), v)]).unwrap_or_default(),
            Some(end) => tx.unsafe_range(Bucket::KeyIndex, key, Some(end), 0),
        };

        let mut kvs = Vec::new();
        let mut count = 0u64;
        for (_k, raw) in entries {
            let history: KeyHistory = serde_json::from_slice(&raw).expect("key history is well formed");
            let visible = history.revs.iter().rev().find(|r| r.rev <= at);
            let Some(visible) = visible else { continue };
            if visible.tombstone {
                continue;
            }
            count += 1;
            if limit != 0 && kvs.len() >= limit {
                continue;
            }

            let kv = Self::read_value_at(tx, visible.rev).unwrap_or_else(|| {
                panic!("missing value for revision {} in key bucket", visible.rev)
            });
            kvs.push(kv);
        }

        Ok(RangeResult { kvs, rev: at, count })
    }

    fn read_value_at(tx: &impl TxReader, rev: u64) -> Option<KeyValue> {
        // Puts always land at sub 0; a shared-revision record only exists
        // for multi-key deletes, which never serve reads.
        let raw = tx.unsafe_get(Bucket::Key, &rev_key(rev, 0))?;
        Some(serde_json::from_slice(&raw).expect("kv record is well formed"))
    }

    /// Compact history below `rev`. Everything needed to read at `rev` and
    /// later survives; older versions are dropped from both buckets.
    pub fn compact(&self, tx: &mut BatchTx<'_>, rev: u64) -> Result<(), MvccError> {
        {
            let mut state = self.state.write().unwrap();
            if rev <= state.compact_rev {
                return Err(MvccError::Compacted);
            }
            if rev > state.current_rev {
                return Err(MvccError::FutureRev);
            }
            state.compact_rev = rev;
        }

        let histories = tx.unsafe_range(Bucket::KeyIndex, &[], Some(&[0]), 0);
        for (key, raw) in histories {
            let mut history: KeyHistory = serde_json::from_slice(&raw).expect("key history is well formed");

            // Keep the newest record at or below `rev` (it serves reads at
            // `rev`) unless it is a tombstone, plus everything newer.
            let keep_from = match history.revs.iter().rposition(|r| r.rev <= rev) {
                Some(pos) if history.revs[pos].tombstone => pos + 1,
                Some(pos) => pos,
                None => 0,
            };
            for dropped in &history.revs[..keep_from] {
                // Multi-key delete records fan out over sub revisions; probe.
                let mut sub = 0u64;
                while {
                    let k = rev_key(dropped.rev, sub);
                    let existed = tx.unsafe_get(Bucket::Key, &k).is_some();
                    if existed {
                        tx.unsafe_delete(Bucket::Key, &k);
                    }
                    existed && dropped.tombstone
                } {
                    sub += 1;
                }
            }
            history.revs.drain(..keep_from);
            Self::write_history(tx, &key, &history);
        }

        tx.unsafe_put(Bucket::Meta, FINISHED_COMPACT_KEY, &rev.to_be_bytes());
        tracing::info!(compact_rev = rev, "finished mvcc compaction");
        Ok(())
    }
}

#[cfg(test)]
mod kv_test;
