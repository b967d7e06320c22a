//! Lease bookkeeping.
//!
//! Leases are granted and revoked through the log; the applier persists them
//! in the `lease` bucket inside the entry's transaction and deletes attached
//! keys on revoke. TTL enforcement (expiry election on the leader) is outside
//! the apply pipeline.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;

use crate::storage::Backend;
use crate::storage::BatchTx;
use crate::storage::Bucket;
use crate::storage::TxReader;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeaseError {
    #[error("lease not found")]
    NotFound,

    #[error("lease already exists")]
    Exists,
}

/// A granted lease and the keys attached to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub id: u64,
    pub ttl_secs: u64,
    keys: BTreeSet<Vec<u8>>,
}

impl Lease {
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.keys.iter().cloned().collect()
    }
}

/// Persisted shape of a lease; attachments are replayed from the key space.
#[derive(Serialize, Deserialize)]
struct LeaseRecord {
    id: u64,
    ttl_secs: u64,
}

/// The lease table.
#[derive(Debug)]
pub struct Lessor {
    be: Arc<Backend>,
    leases: Mutex<HashMap<u64, Lease>>,
}

impl Lessor {
    pub fn new(be: Arc<Backend>) -> Self {
        let lessor = Self {
            be,
            leases: Mutex::new(HashMap::new()),
        };
        lessor.restore();
        lessor
    }

    /// Reload the table from the `lease` bucket.
    pub fn restore(&self) {
        let tx = self.be.read_tx();
        let mut leases = HashMap::new();
        for (_k, raw) in tx.unsafe_range(Bucket::Lease, &[], Some(&[0]), 0) {
            let rec: LeaseRecord = serde_json::from_slice(&raw).expect("lease record is well formed");
            leases.insert(
                rec.id,
                Lease {
                    id: rec.id,
                    ttl_secs: rec.ttl_secs,
                    keys: BTreeSet::new(),
                },
            );
        }
        let count = leases.len();
        *self.leases.lock().unwrap() = leases;
        tracing::info!(leases = count, "restored lessor state");
    }

    pub fn grant(&self, tx: &mut BatchTx<'_>, id: u64, ttl_secs: u64) -> Result<Lease, LeaseError> {
        let mut leases = self.leases.lock().unwrap();
        if leases.contains_key(&id) {
            return Err(LeaseError::Exists);
        }

        let lease = Lease {
            id,
            ttl_secs,
            keys: BTreeSet::new(),
        };
        let rec = LeaseRecord { id, ttl_secs };
        tx.unsafe_put(Bucket::Lease, &id.to_be_bytes(), &serde_json::to_vec(&rec).expect("lease serializes"));

        leases.insert(id, lease.clone());
        Ok(lease)
    }

    /// Drop a lease, returning the keys that were attached so the caller can
    /// delete them in the same transaction.
    pub fn revoke(&self, tx: &mut BatchTx<'_>, id: u64) -> Result<Vec<Vec<u8>>, LeaseError> {
        let mut leases = self.leases.lock().unwrap();
        let Some(lease) = leases.remove(&id) else {
            return Err(LeaseError::NotFound);
        };
        tx.unsafe_delete(Bucket::Lease, &id.to_be_bytes());
        Ok(lease.keys())
    }

    /// Attach a key to a lease; the key dies with the lease.
    pub fn attach(&self, id: u64, key: &[u8]) -> Result<(), LeaseError> {
        let mut leases = self.leases.lock().unwrap();
        let lease = leases.get_mut(&id).ok_or(LeaseError::NotFound)?;
        lease.keys.insert(key.to_vec());
        Ok(())
    }

    pub fn detach(&self, id: u64, key: &[u8]) {
        if let Some(lease) = self.leases.lock().unwrap().get_mut(&id) {
            lease.keys.remove(key);
        }
    }

    pub fn lookup(&self, id: u64) -> Option<Lease> {
        self.leases.lock().unwrap().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.leases.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.lock().unwrap().is_empty()
    }
}
