//! Backing blob store abstraction.
//!
//! A [`BlobStore`] keeps opaque byte values keyed by 16-byte [`SlabId`]s.
//! It knows nothing about slab contents; the engine's slab storage sits
//! on top, decoding blobs into live slabs and batching writes back down
//! at commit time.
//!
//! The one contract that matters for crash consistency: a single
//! `put_batch` or `delete_batch` call is atomic. The engine groups its
//! commit work per address and issues one batch pair per address, so a
//! torn commit can lose whole addresses but never half of one.

use canopy_error::Result;
use canopy_types::SlabId;
use std::collections::BTreeMap;
use tracing::debug;

/// A keyed blob store holding encoded slabs.
pub trait BlobStore {
    /// Fetch the blob stored under `id`, if any.
    fn get(&self, id: SlabId) -> Result<Option<Vec<u8>>>;

    /// Atomically store every `(id, blob)` pair.
    fn put_batch(&mut self, blobs: Vec<(SlabId, Vec<u8>)>) -> Result<()>;

    /// Atomically remove every listed id. Absent ids are ignored.
    fn delete_batch(&mut self, ids: Vec<SlabId>) -> Result<()>;

    /// All ids currently stored, in id order.
    fn ids(&self) -> Vec<SlabId>;

    /// Number of blobs currently stored.
    fn len(&self) -> usize;

    /// Whether the store is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An in-memory [`BlobStore`] over a `BTreeMap`.
///
/// The ordered map keeps `ids()` deterministic, which the validator and
/// the byte-identity tests rely on.
#[derive(Debug, Default)]
pub struct MemBlobStore {
    blobs: BTreeMap<SlabId, Vec<u8>>,
}

impl MemBlobStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-seeded with blobs, e.g. a previously committed
    /// image being re-opened.
    #[must_use]
    pub fn with_blobs(blobs: BTreeMap<SlabId, Vec<u8>>) -> Self {
        Self { blobs }
    }

    /// Borrow the underlying map. Test helper for byte-level assertions.
    #[must_use]
    pub fn blobs(&self) -> &BTreeMap<SlabId, Vec<u8>> {
        &self.blobs
    }
}

impl BlobStore for MemBlobStore {
    fn get(&self, id: SlabId) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.get(&id).cloned())
    }

    fn put_batch(&mut self, blobs: Vec<(SlabId, Vec<u8>)>) -> Result<()> {
        debug!(count = blobs.len(), "blob store put batch");
        for (id, blob) in blobs {
            self.blobs.insert(id, blob);
        }
        Ok(())
    }

    fn delete_batch(&mut self, ids: Vec<SlabId>) -> Result<()> {
        debug!(count = ids.len(), "blob store delete batch");
        for id in ids {
            self.blobs.remove(&id);
        }
        Ok(())
    }

    fn ids(&self) -> Vec<SlabId> {
        self.blobs.keys().copied().collect()
    }

    fn len(&self) -> usize {
        self.blobs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_types::{Address, SlabIndex};

    fn id(n: u64) -> SlabId {
        SlabId::new(Address([1; 8]), SlabIndex::from_u64(n))
    }

    #[test]
    fn test_put_get_delete() {
        let mut store = MemBlobStore::new();
        store
            .put_batch(vec![(id(1), vec![0xaa]), (id(2), vec![0xbb])])
            .unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(id(1)).unwrap(), Some(vec![0xaa]));
        assert_eq!(store.get(id(3)).unwrap(), None);

        store.delete_batch(vec![id(1), id(3)]).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(id(1)).unwrap(), None);
    }

    #[test]
    fn test_ids_are_sorted() {
        let mut store = MemBlobStore::new();
        store
            .put_batch(vec![(id(3), vec![]), (id(1), vec![]), (id(2), vec![])])
            .unwrap();
        assert_eq!(store.ids(), vec![id(1), id(2), id(3)]);
    }

    #[test]
    fn test_put_overwrites() {
        let mut store = MemBlobStore::new();
        store.put_batch(vec![(id(1), vec![1])]).unwrap();
        store.put_batch(vec![(id(1), vec![2])]).unwrap();
        assert_eq!(store.get(id(1)).unwrap(), Some(vec![2]));
        assert_eq!(store.len(), 1);
    }
}
