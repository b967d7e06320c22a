use std::sync::Arc;

use pretty_assertions::assert_eq;

use crate::mvcc::KvStore;
use crate::mvcc::MvccError;
use crate::storage::Backend;

fn store() -> (Arc<Backend>, KvStore) {
    let be = Arc::new(Backend::new());
    let kv = KvStore::new(be.clone());
    (be, kv)
}

#[test]
fn test_put_bumps_revision_and_version() {
    let (be, kv) = store();

    let mut tx = be.batch_tx();
    assert_eq!(1, kv.put(&mut tx, b"foo", b"bar", 0));
    assert_eq!(2, kv.put(&mut tx, b"foo", b"baz", 0));
    tx.commit();

    let r = kv.range(&be.read_tx(), b"foo", None, 0, 0).unwrap();
    assert_eq!(2, r.rev);
    assert_eq!(1, r.count);
    assert_eq!(b"baz".to_vec(), r.kvs[0].value);
    assert_eq!(1, r.kvs[0].create_revision);
    assert_eq!(2, r.kvs[0].mod_revision);
    assert_eq!(2, r.kvs[0].version);
}

#[test]
fn test_range_at_old_revision() {
    let (be, kv) = store();

    let mut tx = be.batch_tx();
    kv.put(&mut tx, b"foo", b"v1", 0);
    kv.put(&mut tx, b"foo", b"v2", 0);
    tx.commit();

    let r = kv.range(&be.read_tx(), b"foo", None, 1, 0).unwrap();
    assert_eq!(b"v1".to_vec(), r.kvs[0].value);

    assert_eq!(Err(MvccError::FutureRev), kv.range(&be.read_tx(), b"foo", None, 9, 0));
}

#[test]
fn test_delete_range_tombstones() {
    let (be, kv) = store();

    let mut tx = be.batch_tx();
    kv.put(&mut tx, b"a", b"1", 0);
    kv.put(&mut tx, b"b", b"2", 0);
    kv.put(&mut tx, b"c", b"3", 0);
    let (deleted, rev) = kv.delete_range(&mut tx, b"a", Some(b"c"));
    tx.commit();

    assert_eq!(2, deleted);
    assert_eq!(4, rev);

    let r = kv.range(&be.read_tx(), b"a", Some(&[0]), 0, 0).unwrap();
    assert_eq!(1, r.count);
    assert_eq!(b"c".to_vec(), r.kvs[0].key);

    // The deleted keys are still visible at the pre-delete revision.
    let r = kv.range(&be.read_tx(), b"a", Some(&[0]), 3, 0).unwrap();
    assert_eq!(3, r.count);

    // Deleting nothing does not burn a revision.
    let mut tx = be.batch_tx();
    let (deleted, rev) = kv.delete_range(&mut tx, b"zz", None);
    tx.commit();
    assert_eq!(0, deleted);
    assert_eq!(4, rev);
}

#[test]
fn test_compact_drops_old_versions() {
    let (be, kv) = store();

    let mut tx = be.batch_tx();
    kv.put(&mut tx, b"foo", b"v1", 0);
    kv.put(&mut tx, b"foo", b"v2", 0);
    kv.put(&mut tx, b"foo", b"v3", 0);
    kv.compact(&mut tx, 2).unwrap();
    tx.commit();

    assert_eq!(Err(MvccError::Compacted), kv.range(&be.read_tx(), b"foo", None, 1, 0));

    // Reads at and after the compaction revision still work.
    let r = kv.range(&be.read_tx(), b"foo", None, 2, 0).unwrap();
    assert_eq!(b"v2".to_vec(), r.kvs[0].value);
    let r = kv.range(&be.read_tx(), b"foo", None, 0, 0).unwrap();
    assert_eq!(b"v3".to_vec(), r.kvs[0].value);

    // Compacting backwards or past the head is refused.
    let mut tx = be.batch_tx();
    assert_eq!(Err(MvccError::Compacted), kv.compact(&mut tx, 2));
    assert_eq!(Err(MvccError::FutureRev), kv.compact(&mut tx, 99));
    tx.commit();
}

#[test]
fn test_restore_recovers_revision_counters() {
    let (be, kv) = store();

    let mut tx = be.batch_tx();
    kv.put(&mut tx, b"foo", b"v1", 0);
    kv.put(&mut tx, b"foo", b"v2", 0);
    kv.compact(&mut tx, 1).unwrap();
    tx.commit();

    // A fresh store over the same backend sees the same counters.
    let fresh = KvStore::new(be.clone());
    assert_eq!(2, fresh.current_revision());
    assert_eq!(1, fresh.compact_revision());

    let r = fresh.range(&be.read_tx(), b"foo", None, 0, 0).unwrap();
    assert_eq!(b"v2".to_vec(), r.kvs[0].value);
}

#[test]
fn test_limit_caps_results_not_count() {
    let (be, kv) = store();

    let mut tx = be.batch_tx();
    for k in [b"a", b"b", b"c"] {
        kv.put(&mut tx, k, b"v", 0);
    }
    tx.commit();

    let r = kv.range(&be.read_tx(), b"a", Some(&[0]), 0, 2).unwrap();
    assert_eq!(2, r.kvs.len());
    assert_eq!(3, r.count);
}
