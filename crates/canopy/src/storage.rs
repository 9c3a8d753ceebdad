//! The slab storage layer: an in-memory cache of decoded slabs over a
//! backing blob store, with deferred writes.
//!
//! Mutations never touch the backing store directly. `store` and
//! `remove` record deltas in the cache; `commit` encodes every dirty
//! slab and flushes puts and deletes grouped per address, one atomic
//! batch pair each. Dropping the storage without committing loses all
//! pending writes.
//!
//! Retrieval hands out clones of cached slabs. Every mutation path in
//! the containers writes its slab back through `store`, so the cache
//! stays authoritative and later retrievals observe the mutation.

use crate::digest::DefaultDigesterBuilder;
use crate::slab::{Slab, StorableSlab};
use crate::storable::{Storable, Value};
use canopy_error::{CanopyError, Result};
use canopy_store::BlobStore;
use canopy_types::config::MAX_STORABLE_SLAB_SIZE;
use canopy_types::{Address, SlabId, SlabIndex, StorageConfig};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Slab cache and delta tracker over a [`BlobStore`].
#[derive(Debug)]
pub struct SlabStorage<B: BlobStore> {
    base: B,
    config: StorageConfig,
    cache: BTreeMap<SlabId, Slab>,
    dirty: BTreeSet<SlabId>,
    deleted: BTreeSet<SlabId>,
    /// Next index to issue, per address. Populated lazily from the
    /// backing store so re-opened storages never reuse an index.
    counters: BTreeMap<Address, u64>,
}

impl<B: BlobStore> SlabStorage<B> {
    /// Wrap a backing store with the given configuration.
    pub fn new(base: B, config: StorageConfig) -> Self {
        Self {
            base,
            config,
            cache: BTreeMap::new(),
            dirty: BTreeSet::new(),
            deleted: BTreeSet::new(),
            counters: BTreeMap::new(),
        }
    }

    /// The storage-wide configuration.
    #[must_use]
    pub fn config(&self) -> StorageConfig {
        self.config
    }

    /// The digester builder implied by this storage's hash seed.
    #[must_use]
    pub fn default_digester_builder(&self) -> DefaultDigesterBuilder {
        DefaultDigesterBuilder::new(self.config.hash_seed())
    }

    /// Borrow the backing store. Mostly useful to tests asserting on
    /// committed bytes.
    #[must_use]
    pub fn base(&self) -> &B {
        &self.base
    }

    /// Issue a fresh id under `address`. Indices start at one and are
    /// never reused, so the sentinel id is never returned.
    pub fn generate_id(&mut self, address: Address) -> Result<SlabId> {
        let next = match self.counters.get(&address) {
            Some(n) => *n,
            None => {
                // First issue under this address: resume above every
                // index the backing store, cache, or tombstone set has
                // ever seen for it.
                let mut max = 0u64;
                for id in self.base.ids() {
                    if id.address == address {
                        max = max.max(id.index.as_u64());
                    }
                }
                for id in self.cache.keys().chain(self.deleted.iter()) {
                    if id.address == address {
                        max = max.max(id.index.as_u64());
                    }
                }
                max + 1
            }
        };
        self.counters.insert(address, next + 1);
        Ok(SlabId::new(address, SlabIndex::from_u64(next)))
    }

    /// Fetch the slab stored under `id`, decoding from the backing
    /// store and caching on a miss. Returns a clone; mutations must be
    /// written back via [`store`](Self::store).
    pub fn retrieve(&mut self, id: SlabId) -> Result<Option<Slab>> {
        if self.deleted.contains(&id) {
            return Ok(None);
        }
        if let Some(slab) = self.cache.get(&id) {
            return Ok(Some(slab.clone()));
        }
        match self.base.get(id)? {
            None => Ok(None),
            Some(bytes) => {
                let slab = Slab::decode(id, &bytes)?;
                self.cache.insert(id, slab.clone());
                Ok(Some(slab))
            }
        }
    }

    /// Like [`retrieve`](Self::retrieve), but a missing slab is the
    /// error it almost always is: a dangling reference.
    pub fn retrieve_slab(&mut self, id: SlabId) -> Result<Slab> {
        self.retrieve(id)?
            .ok_or(CanopyError::SlabNotFound { id })
    }

    /// Record `slab` as the authoritative state of its id. No I/O.
    pub fn store(&mut self, slab: Slab) {
        let id = slab.id();
        debug_assert!(!id.is_sentinel(), "storing a slab under the sentinel id");
        self.deleted.remove(&id);
        self.cache.insert(id, slab);
        self.dirty.insert(id);
    }

    /// Record deletion of `id`. A slab that was never committed is
    /// simply dropped; a committed one gets a tombstone flushed at the
    /// next commit.
    pub fn remove(&mut self, id: SlabId) -> Result<()> {
        self.cache.remove(&id);
        self.dirty.remove(&id);
        if self.base.get(id)?.is_some() {
            self.deleted.insert(id);
        }
        Ok(())
    }

    /// Flush every dirty slab and tombstone to the backing store, one
    /// atomic put batch and delete batch per address, then clear the
    /// delta sets.
    pub fn commit(&mut self) -> Result<()> {
        let mut puts: BTreeMap<Address, Vec<(SlabId, Vec<u8>)>> = BTreeMap::new();
        for id in &self.dirty {
            let slab = self
                .cache
                .get(id)
                .unwrap_or_else(|| panic!("dirty slab {id} missing from cache"));
            puts.entry(id.address).or_default().push((*id, slab.encode()));
        }

        let mut dels: BTreeMap<Address, Vec<SlabId>> = BTreeMap::new();
        for id in &self.deleted {
            dels.entry(id.address).or_default().push(*id);
        }

        let mut addresses: BTreeSet<Address> = puts.keys().copied().collect();
        addresses.extend(dels.keys().copied());

        for address in addresses {
            if let Some(batch) = puts.remove(&address) {
                self.base.put_batch(batch)?;
            }
            if let Some(batch) = dels.remove(&address) {
                self.base.delete_batch(batch)?;
            }
        }

        debug!(
            flushed = self.dirty.len(),
            deleted = self.deleted.len(),
            "slab storage commit"
        );
        self.dirty.clear();
        self.deleted.clear();
        Ok(())
    }

    /// Number of live slabs: committed plus dirty-new minus deleted.
    #[must_use]
    pub fn count(&self) -> usize {
        let mut live: BTreeSet<SlabId> = self.base.ids().into_iter().collect();
        live.extend(self.dirty.iter().copied());
        for id in &self.deleted {
            live.remove(id);
        }
        live.len()
    }

    /// Turn an application value into the storable that will sit in a
    /// data slab, spilling oversized payloads to their own slab.
    pub fn make_storable(&mut self, address: Address, value: Value) -> Result<Storable> {
        match value {
            Value::Container(id) => Ok(Storable::Pointer(id)),
            Value::Bytes(bytes) => {
                let size = bytes.len() as u32;
                if size > MAX_STORABLE_SLAB_SIZE {
                    return Err(CanopyError::OverLimit {
                        size,
                        limit: MAX_STORABLE_SLAB_SIZE,
                    });
                }
                if size > self.config.max_inline_element_size() {
                    let id = self.generate_id(address)?;
                    let slab = StorableSlab::new(id, Storable::Value(bytes));
                    self.store(slab.into());
                    Ok(Storable::Pointer(id))
                } else {
                    Ok(Storable::Value(bytes))
                }
            }
        }
    }

    /// Fetch the payload of a storable slab, for dereferencing spilled
    /// elements.
    pub fn storable_payload(&mut self, id: SlabId) -> Result<Storable> {
        match self.retrieve_slab(id)? {
            Slab::Storable(slab) => Ok(slab.payload),
            other => Err(CanopyError::WrongSlabType {
                id,
                expected: "storable slab",
                found: other.kind_name(),
            }),
        }
    }
}
