//! Storage-layer behavior: id issuance, caching, deltas, and commit
//! batching.

use crate::array::Array;
use crate::storable::Value;
use crate::storage::SlabStorage;
use crate::test_values::{test_storage, uint64_value, OTHER_ADDRESS, TEST_ADDRESS};
use canopy_error::{CanopyError, Result};
use canopy_store::{BlobStore, MemBlobStore};
use canopy_types::{Address, SlabId, StorageConfig, TypeInfo};

#[test]
fn test_generate_id_monotonic_per_address() {
    let mut storage = test_storage(1024);
    let a1 = storage.generate_id(TEST_ADDRESS).unwrap();
    let a2 = storage.generate_id(TEST_ADDRESS).unwrap();
    let b1 = storage.generate_id(OTHER_ADDRESS).unwrap();
    let a3 = storage.generate_id(TEST_ADDRESS).unwrap();

    assert_eq!(a1.index.as_u64(), 1);
    assert_eq!(a2.index.as_u64(), 2);
    assert_eq!(a3.index.as_u64(), 3);
    assert_eq!(b1.index.as_u64(), 1);
    assert!(!a1.is_sentinel());
    assert_ne!(a1, b1);
}

#[test]
fn test_ids_resume_above_committed_indices() {
    let mut storage = test_storage(1024);
    let mut array = Array::new(&mut storage, TEST_ADDRESS, TypeInfo::from_u64(1)).unwrap();
    array
        .append(&mut storage, Value::Bytes(uint64_value(1)))
        .unwrap();
    storage.commit().unwrap();

    let config = StorageConfig::new(1024, 0).unwrap();
    let mut reopened = SlabStorage::new(
        MemBlobStore::with_blobs(storage.base().blobs().clone()),
        config,
    );
    let fresh = reopened.generate_id(TEST_ADDRESS).unwrap();
    assert!(fresh.index.as_u64() > array.root_id().index.as_u64());
}

#[test]
fn test_writes_deferred_until_commit() {
    let mut storage = test_storage(1024);
    let mut array = Array::new(&mut storage, TEST_ADDRESS, TypeInfo::from_u64(1)).unwrap();
    array
        .append(&mut storage, Value::Bytes(uint64_value(1)))
        .unwrap();

    assert_eq!(storage.base().len(), 0);
    assert_eq!(storage.count(), 1);

    storage.commit().unwrap();
    assert_eq!(storage.base().len(), 1);
    assert_eq!(storage.count(), 1);
}

#[test]
fn test_remove_dirty_new_drops_without_tombstone() {
    let mut storage = test_storage(1024);
    let array = Array::new(&mut storage, TEST_ADDRESS, TypeInfo::from_u64(1)).unwrap();
    storage.remove(array.root_id()).unwrap();

    assert_eq!(storage.count(), 0);
    storage.commit().unwrap();
    assert_eq!(storage.base().len(), 0);
}

#[test]
fn test_remove_committed_slab_tombstones() {
    let mut storage = test_storage(1024);
    let array = Array::new(&mut storage, TEST_ADDRESS, TypeInfo::from_u64(1)).unwrap();
    storage.commit().unwrap();
    assert_eq!(storage.base().len(), 1);

    storage.remove(array.root_id()).unwrap();
    assert_eq!(storage.count(), 0);
    // Still on disk until the tombstone is flushed.
    assert_eq!(storage.base().len(), 1);
    storage.commit().unwrap();
    assert_eq!(storage.base().len(), 0);
}

#[test]
fn test_retrieve_missing_and_not_found() {
    let mut storage = test_storage(1024);
    let id = SlabId::new(TEST_ADDRESS, canopy_types::SlabIndex::from_u64(99));
    assert!(storage.retrieve(id).unwrap().is_none());
    assert!(matches!(
        storage.retrieve_slab(id).unwrap_err(),
        CanopyError::SlabNotFound { .. }
    ));
}

#[test]
fn test_garbage_blob_is_corruption() {
    let mut base = MemBlobStore::new();
    let id = SlabId::new(TEST_ADDRESS, canopy_types::SlabIndex::from_u64(1));
    base.put_batch(vec![(id, vec![0x00, 0xff, 0x01, 0x02])])
        .unwrap();
    let mut storage = SlabStorage::new(base, StorageConfig::default());
    assert!(matches!(
        storage.retrieve(id).unwrap_err(),
        CanopyError::Corruption { .. }
    ));

    let mut base = MemBlobStore::new();
    base.put_batch(vec![(id, vec![0x07, 0x20])]).unwrap();
    let mut storage = SlabStorage::new(base, StorageConfig::default());
    let err = storage.retrieve(id).unwrap_err();
    assert!(err.to_string().contains("version"));
}

#[test]
fn test_wrong_slab_type_on_payload_fetch() {
    let mut storage = test_storage(1024);
    let array = Array::new(&mut storage, TEST_ADDRESS, TypeInfo::from_u64(1)).unwrap();
    assert!(matches!(
        storage.storable_payload(array.root_id()).unwrap_err(),
        CanopyError::WrongSlabType { .. }
    ));
}

#[test]
fn test_count_matches_live_containers() {
    let mut storage = test_storage(256);
    let mut a = Array::new(&mut storage, TEST_ADDRESS, TypeInfo::from_u64(1)).unwrap();
    let mut b = Array::new(&mut storage, OTHER_ADDRESS, TypeInfo::from_u64(2)).unwrap();
    for i in 0..300u64 {
        a.append(&mut storage, Value::Bytes(uint64_value(i))).unwrap();
        b.append(&mut storage, Value::Bytes(uint64_value(i * 2)))
            .unwrap();
    }
    let total = a.slab_count(&mut storage).unwrap() + b.slab_count(&mut storage).unwrap();
    assert_eq!(total, storage.count() as u64);

    storage.commit().unwrap();
    assert_eq!(storage.base().len(), storage.count());
}

// ---------------------------------------------------------------------------
// Commit batching
// ---------------------------------------------------------------------------

/// A blob store that records the address grouping of each batch call.
#[derive(Default)]
struct RecordingStore {
    inner: MemBlobStore,
    put_batches: Vec<Vec<Address>>,
    delete_batches: Vec<Vec<Address>>,
}

impl BlobStore for RecordingStore {
    fn get(&self, id: SlabId) -> Result<Option<Vec<u8>>> {
        self.inner.get(id)
    }

    fn put_batch(&mut self, blobs: Vec<(SlabId, Vec<u8>)>) -> Result<()> {
        self.put_batches
            .push(blobs.iter().map(|(id, _)| id.address).collect());
        self.inner.put_batch(blobs)
    }

    fn delete_batch(&mut self, ids: Vec<SlabId>) -> Result<()> {
        self.delete_batches
            .push(ids.iter().map(|id| id.address).collect());
        self.inner.delete_batch(ids)
    }

    fn ids(&self) -> Vec<SlabId> {
        self.inner.ids()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

#[test]
fn test_commit_issues_one_batch_per_address() {
    let mut storage = SlabStorage::new(RecordingStore::default(), StorageConfig::default());
    let _ = Array::new(&mut storage, TEST_ADDRESS, TypeInfo::from_u64(1)).unwrap();
    let _ = Array::new(&mut storage, OTHER_ADDRESS, TypeInfo::from_u64(2)).unwrap();
    storage.commit().unwrap();

    assert_eq!(storage.base().put_batches.len(), 2);
    for batch in &storage.base().put_batches {
        assert!(!batch.is_empty());
        assert!(
            batch.windows(2).all(|w| w[0] == w[1]),
            "a put batch mixed addresses"
        );
    }
    assert!(storage.base().delete_batches.is_empty());

    // A second commit with no new work flushes nothing.
    storage.commit().unwrap();
    assert_eq!(storage.base().put_batches.len(), 2);
}
