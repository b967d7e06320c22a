//! The transactional bucketed key-value backend.
//!
//! This is an in-memory rendition of the backend contract the server core is
//! written against: named buckets, a single-writer batch transaction with a
//! pre-commit hook, and shared read transactions. The bucket names are part
//! of the on-disk schema and must not change.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::StorageError;

/// The named buckets of the backend schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Bucket {
    Meta,
    Members,
    MembersRemoved,
    Cluster,
    Auth,
    AuthUsers,
    AuthRoles,
    Alarm,
    Key,
    KeyIndex,
    Lease,
}

impl Bucket {
    /// The on-disk bucket name. Bit-exact for compatibility.
    pub fn name(&self) -> &'static str {
        match self {
            Bucket::Meta => "meta",
            Bucket::Members => "members",
            Bucket::MembersRemoved => "members_removed",
            Bucket::Cluster => "cluster",
            Bucket::Auth => "auth",
            Bucket::AuthUsers => "authUsers",
            Bucket::AuthRoles => "authRoles",
            Bucket::Alarm => "alarm",
            Bucket::Key => "key",
            Bucket::KeyIndex => "key_index",
            Bucket::Lease => "lease",
        }
    }

    pub fn all() -> &'static [Bucket] {
        &[
            Bucket::Meta,
            Bucket::Members,
            Bucket::MembersRemoved,
            Bucket::Cluster,
            Bucket::Auth,
            Bucket::AuthUsers,
            Bucket::AuthRoles,
            Bucket::Alarm,
            Bucket::Key,
            Bucket::KeyIndex,
            Bucket::Lease,
        ]
    }
}

type BucketData = BTreeMap<&'static str, BTreeMap<Vec<u8>, Vec<u8>>>;

/// Serialized form of the whole backend, the payload of DB snapshot files.
#[derive(Serialize, Deserialize)]
struct BackendImage {
    buckets: Vec<(String, Vec<(Vec<u8>, Vec<u8>)>)>,
}

/// Pre-commit hook, run inside the batch transaction right before it commits.
pub trait Hooks: Send + Sync {
    fn on_pre_commit(&self, tx: &mut BatchTx<'_>);
}

/// Read access shared by batch and read transactions, so code that only
/// reads can run under whichever transaction the caller already holds.
pub trait TxReader {
    fn unsafe_get(&self, bucket: Bucket, key: &[u8]) -> Option<Vec<u8>>;

    fn unsafe_range(
        &self,
        bucket: Bucket,
        key: &[u8],
        end_key: Option<&[u8]>,
        limit: usize,
    ) -> Vec<(Vec<u8>, Vec<u8>)>;
}

/// The backend. One open batch transaction at a time; any number of read
/// transactions between commits.
pub struct Backend {
    data: RwLock<BucketData>,
    hooks: Mutex<Option<Arc<dyn Hooks>>>,
    commits: AtomicU64,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").field("commits", &self.commits).finish()
    }
}

impl Default for Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend {
    pub fn new() -> Self {
        let mut data = BucketData::new();
        for b in Bucket::all() {
            data.insert(b.name(), BTreeMap::new());
        }
        Self {
            data: RwLock::new(data),
            hooks: Mutex::new(None),
            commits: AtomicU64::new(0),
        }
    }

    /// Install the pre-commit hook. Set once, after the consistent-index
    /// cursor exists; the hook is what persists the cursor.
    pub fn set_hooks(&self, hooks: Arc<dyn Hooks>) {
        *self.hooks.lock().unwrap() = Some(hooks);
    }

    /// Open the batch transaction, taking the single-writer lock.
    pub fn batch_tx(&self) -> BatchTx<'_> {
        BatchTx {
            data: self.data.write().unwrap(),
            backend: self,
        }
    }

    /// Open a read transaction.
    pub fn read_tx(&self) -> ReadTx<'_> {
        ReadTx {
            data: self.data.read().unwrap(),
        }
    }

    /// Open and immediately commit an empty batch transaction, forcing the
    /// pre-commit hook to run.
    pub fn force_commit(&self) {
        self.batch_tx().commit();
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Acquire)
    }

    /// Logical size of the stored data in bytes.
    pub fn size(&self) -> u64 {
        let data = self.data.read().unwrap();
        data.values()
            .flat_map(|b| b.iter())
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum()
    }

    /// A consistent serialized image of every bucket.
    pub fn snapshot_data(&self) -> Vec<u8> {
        let data = self.data.read().unwrap();
        let image = BackendImage {
            buckets: data
                .iter()
                .map(|(name, b)| {
                    (
                        name.to_string(),
                        b.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                    )
                })
                .collect(),
        };
        serde_json::to_vec(&image).expect("bucket data serializes")
    }

    /// Replace all buckets with a previously serialized image. Buckets
    /// missing from the image come back empty; unknown buckets are dropped.
    pub fn restore_from_data(&self, image: &[u8]) -> Result<(), StorageError> {
        let image: BackendImage =
            serde_json::from_slice(image).map_err(|e| StorageError::new("restore backend image", e))?;

        let mut restored = BucketData::new();
        for b in Bucket::all() {
            restored.insert(b.name(), BTreeMap::new());
        }
        for (name, kvs) in image.buckets {
            let Some(bucket) = Bucket::all().iter().find(|b| b.name() == name) else {
                tracing::warn!("dropping unknown bucket {:?} from backend image", name);
                continue;
            };
            restored.insert(bucket.name(), kvs.into_iter().collect());
        }
        *self.data.write().unwrap() = restored;
        Ok(())
    }

    /// Restore from a DB file previously staged by the snapshot pipeline.
    pub fn restore_from_file(&self, path: &Path) -> Result<(), StorageError> {
        let image = std::fs::read(path).map_err(|e| StorageError::from_io(format!("read db file {path:?}"), e))?;
        self.restore_from_data(&image)
    }

    /// Write the current image to the live DB file.
    pub fn write_db_file(&self, path: &Path) -> Result<(), StorageError> {
        std::fs::write(path, self.snapshot_data())
            .map_err(|e| StorageError::from_io(format!("write db file {path:?}"), e))
    }
}

/// Where the live DB file lives under the snapshot directory.
///
/// `ETCD_TMPFS` is a test/perf hack: when the variable is non-empty the DB
/// file is placed on a freshly mounted tmpfs under `/mnt/tmpfs-<rand>`
/// instead. Do not set it in production; a failed mount falls back to the
/// regular path.
pub fn live_db_path(snap_dir: &Path) -> PathBuf {
    let default = snap_dir.join("db");

    if std::env::var("ETCD_TMPFS").map(|v| !v.is_empty()).unwrap_or(false) {
        match mount_tmpfs_dir() {
            Ok(dir) => return dir.join("db"),
            Err(e) => {
                tracing::warn!("tmpfs mount for backend DB failed, using {:?}: {}", default, e);
            }
        }
    }
    default
}

fn mount_tmpfs_dir() -> Result<PathBuf, std::io::Error> {
    let dir = PathBuf::from(format!("/mnt/tmpfs-{:08x}", rand::random::<u32>()));
    std::fs::create_dir_all(&dir)?;

    let status = std::process::Command::new("mount")
        .args(["-t", "tmpfs", "tmpfs"])
        .arg(&dir)
        .status()?;
    if !status.success() {
        return Err(std::io::Error::other(format!("mount exited with {status}")));
    }
    tracing::info!("mounted tmpfs for backend DB at {:?}", dir);
    Ok(dir)
}

/// The single open batch transaction. Holding it excludes readers; dropping
/// it without [`commit`](Self::commit) discards nothing (writes are applied
/// in place) but skips the pre-commit hook, so writers must commit.
pub struct BatchTx<'a> {
    data: RwLockWriteGuard<'a, BucketData>,
    backend: &'a Backend,
}

impl<'a> BatchTx<'a> {
    fn bucket_mut(&mut self, bucket: Bucket) -> &mut BTreeMap<Vec<u8>, Vec<u8>> {
        self.data.entry(bucket.name()).or_default()
    }

    pub fn unsafe_create_bucket(&mut self, bucket: Bucket) {
        self.bucket_mut(bucket);
    }

    pub fn unsafe_put(&mut self, bucket: Bucket, key: &[u8], value: &[u8]) {
        self.bucket_mut(bucket).insert(key.to_vec(), value.to_vec());
    }

    pub fn unsafe_delete(&mut self, bucket: Bucket, key: &[u8]) {
        self.bucket_mut(bucket).remove(key);
    }

    /// Run the pre-commit hook and publish the transaction.
    pub fn commit(mut self) {
        let hooks = self.backend.hooks.lock().unwrap().clone();
        if let Some(hooks) = hooks {
            hooks.on_pre_commit(&mut self);
        }
        self.backend.commits.fetch_add(1, Ordering::AcqRel);
    }
}

impl<'a> TxReader for BatchTx<'a> {
    fn unsafe_get(&self, bucket: Bucket, key: &[u8]) -> Option<Vec<u8>> {
        range_impl(&self.data, bucket, key, None, 1).pop().map(|(_k, v)| v)
    }

    fn unsafe_range(
        &self,
        bucket: Bucket,
        key: &[u8],
        end_key: Option<&[u8]>,
        limit: usize,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        range_impl(&self.data, bucket, key, end_key, limit)
    }
}

/// A shared read transaction.
pub struct ReadTx<'a> {
    data: RwLockReadGuard<'a, BucketData>,
}

impl<'a> TxReader for ReadTx<'a> {
    fn unsafe_get(&self, bucket: Bucket, key: &[u8]) -> Option<Vec<u8>> {
        range_impl(&self.data, bucket, key, None, 1).pop().map(|(_k, v)| v)
    }

    fn unsafe_range(
        &self,
        bucket: Bucket,
        key: &[u8],
        end_key: Option<&[u8]>,
        limit: usize,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        range_impl(&self.data, bucket, key, end_key, limit)
    }
}

/// Range semantics follow the wire convention: `end_key` of `None` addresses
/// the single `key`; a single zero byte means "from `key` to the end of the
/// bucket"; anything else is an exclusive upper bound.
fn range_impl(
    data: &BucketData,
    bucket: Bucket,
    key: &[u8],
    end_key: Option<&[u8]>,
    limit: usize,
) -> Vec<(Vec<u8>, Vec<u8>)> {
    let Some(b) = data.get(bucket.name()) else {
        return Vec::new();
    };
    let limit = if limit == 0 { usize::MAX } else { limit };

    let upper = match end_key {
        None => return b.get(key).map(|v| (key.to_vec(), v.clone())).into_iter().collect(),
        Some([0]) => Bound::Unbounded,
        Some(end) => Bound::Excluded(end.to_vec()),
    };
    b.range((Bound::Included(key.to_vec()), upper))
        .take(limit)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_range() {
        let be = Backend::new();
        {
            let mut tx = be.batch_tx();
            tx.unsafe_put(Bucket::Key, b"a", b"1");
            tx.unsafe_put(Bucket::Key, b"b", b"2");
            tx.unsafe_put(Bucket::Key, b"c", b"3");
            tx.commit();
        }

        let rtx = be.read_tx();
        assert_eq!(Some(b"2".to_vec()), rtx.unsafe_get(Bucket::Key, b"b"));
        let kvs = rtx.unsafe_range(Bucket::Key, b"a", Some(b"c"), 0);
        assert_eq!(2, kvs.len());
        assert_eq!(b"a".to_vec(), kvs[0].0);

        let limited = rtx.unsafe_range(Bucket::Key, b"a", Some(b"z"), 1);
        assert_eq!(1, limited.len());
    }

    #[test]
    fn test_commit_runs_hook_and_counts() {
        struct MarkHook;
        impl Hooks for MarkHook {
            fn on_pre_commit(&self, tx: &mut BatchTx<'_>) {
                tx.unsafe_put(Bucket::Meta, b"marked", b"yes");
            }
        }

        let be = Backend::new();
        be.set_hooks(Arc::new(MarkHook));
        assert_eq!(0, be.commits());

        be.force_commit();
        assert_eq!(1, be.commits());
        assert_eq!(Some(b"yes".to_vec()), be.read_tx().unsafe_get(Bucket::Meta, b"marked"));
    }

    #[test]
    fn test_snapshot_image_round_trip() -> anyhow::Result<()> {
        let be = Backend::new();
        {
            let mut tx = be.batch_tx();
            tx.unsafe_put(Bucket::Key, b"k", b"v");
            tx.commit();
        }
        let image = be.snapshot_data();

        let other = Backend::new();
        other.restore_from_data(&image)?;
        assert_eq!(Some(b"v".to_vec()), other.read_tx().unsafe_get(Bucket::Key, b"k"));
        Ok(())
    }
}
