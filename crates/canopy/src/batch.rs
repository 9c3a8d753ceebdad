//! Bottom-up bulk construction.
//!
//! Building a large container by repeated `append` or `set` pays a tree
//! walk per element. The batch builders instead fill data slabs
//! directly from an input iterator, emitting each as soon as the next
//! element would cross the target threshold, then group the emitted
//! headers under meta slabs with the same rule until a single root
//! remains. The result obeys every structural invariant and holds
//! exactly the elements of the input; the physical layout packs slabs
//! to the target rather than reproducing the half-full split pattern
//! incremental insertion leaves behind.
//!
//! If the final slab of a pass lands under the minimum threshold it
//! borrows backward from its left neighbor, mirroring rebalance.

use crate::array::{Array, ArrayDataSlab, ArrayMetaSlab, ARRAY_DATA_PREFIX, ARRAY_META_PREFIX};
use crate::digest::{check_digester_levels, Digester, DigesterBuilder};
use crate::map::{
    GroupBody, Map, MapChildHeader, MapDataSlab, MapEntry, MapMetaSlab, MAP_DATA_PREFIX,
    MAP_META_CHILD_SIZE, MAP_META_PREFIX,
};
use crate::slab::{Slab, SlabHeader};
use crate::storable::{Storable, Value};
use crate::storage::SlabStorage;
use canopy_error::{CanopyError, Result};
use canopy_store::BlobStore;
use canopy_types::{Address, SlabId, StorageConfig, TypeInfo};
use std::collections::BTreeMap;
use std::rc::Rc;

/// Partition items into slab-sized runs: a run is emitted when adding
/// the next item would push it past the target threshold.
fn partition_runs<T>(items: Vec<T>, prefix: u32, config: &StorageConfig, size_of: impl Fn(&T) -> u32) -> Vec<Vec<T>> {
    let mut runs = Vec::new();
    let mut run = Vec::new();
    let mut run_size = prefix;
    for item in items {
        let size = size_of(&item);
        if !run.is_empty() && run_size + size > config.target_threshold() {
            runs.push(std::mem::take(&mut run));
            run_size = prefix;
        }
        run_size += size;
        run.push(item);
    }
    if !run.is_empty() || runs.is_empty() {
        runs.push(run);
    }
    runs
}

/// Mirror of rebalance for the tail of a pass: a final run under the
/// minimum threshold borrows items backward from its left neighbor.
/// Borrowing cascades leftward when it pushes the neighbor under the
/// minimum in turn; the leftmost run always ends legal because every
/// run before the last was filled to the target.
fn borrow_back<T>(
    runs: &mut [Vec<T>],
    prefix: u32,
    config: &StorageConfig,
    size_of: impl Fn(&T) -> u32,
) {
    let min = config.min_threshold();
    for j in (1..runs.len()).rev() {
        let mut size = prefix + runs[j].iter().map(&size_of).sum::<u32>();
        while size < min {
            let Some(moved) = runs[j - 1].pop() else {
                break;
            };
            size += size_of(&moved);
            runs[j].insert(0, moved);
        }
    }
}

// ---------------------------------------------------------------------------
// Array
// ---------------------------------------------------------------------------

impl Array {
    /// Build an array from an iterator of values, bottom-up.
    ///
    /// Element-equal to creating an empty array and appending the same
    /// sequence, with the packed physical layout described in the
    /// module docs.
    pub fn from_batch<B, I>(
        storage: &mut SlabStorage<B>,
        address: Address,
        type_info: TypeInfo,
        values: I,
    ) -> Result<Self>
    where
        B: BlobStore,
        I: IntoIterator<Item = Value>,
    {
        let config = storage.config();
        let root_id = storage.generate_id(address)?;

        let mut storables = Vec::new();
        for value in values {
            storables.push(storage.make_storable(address, value)?);
        }
        let mut runs = partition_runs(storables, ARRAY_DATA_PREFIX, &config, Storable::byte_size);
        borrow_back(&mut runs, ARRAY_DATA_PREFIX, &config, Storable::byte_size);

        if runs.len() == 1 {
            let mut root =
                ArrayDataSlab::from_elements(root_id, SlabId::SENTINEL, runs.pop().expect("one run"));
            root.set_extra(Some(type_info.clone()));
            storage.store(root.into());
            return Ok(Self::from_parts(root_id, address, type_info));
        }

        // Leaf pass: issue ids left to right and chain them.
        let ids: Vec<SlabId> = runs
            .iter()
            .map(|_| storage.generate_id(address))
            .collect::<Result<_>>()?;
        let mut headers = Vec::with_capacity(runs.len());
        for (i, elements) in runs.into_iter().enumerate() {
            let next = ids.get(i + 1).copied().unwrap_or(SlabId::SENTINEL);
            let leaf = ArrayDataSlab::from_elements(ids[i], next, elements);
            headers.push(leaf.header);
            storage.store(leaf.into());
        }

        // Meta passes until one run remains; it becomes the root.
        loop {
            let mut runs = partition_runs(headers, ARRAY_META_PREFIX, &config, |_| {
                SlabHeader::ENCODED_SIZE
            });
            borrow_back(&mut runs, ARRAY_META_PREFIX, &config, |_| {
                SlabHeader::ENCODED_SIZE
            });

            if runs.len() == 1 {
                let meta =
                    ArrayMetaSlab::new(root_id, Some(type_info.clone()), runs.pop().expect("one run"));
                storage.store(meta.into());
                return Ok(Self::from_parts(root_id, address, type_info));
            }

            let mut next_headers = Vec::with_capacity(runs.len());
            for children in runs {
                let id = storage.generate_id(address)?;
                let meta = ArrayMetaSlab::new(id, None, children);
                next_headers.push(meta.header);
                storage.store(meta.into());
            }
            headers = next_headers;
        }
    }
}

// ---------------------------------------------------------------------------
// Map
// ---------------------------------------------------------------------------

struct BatchItem {
    key_bytes: Vec<u8>,
    key: Storable,
    value: Storable,
    digester: Box<dyn Digester>,
}

impl Map {
    /// Build a map from an iterator of key/value pairs, bottom-up.
    ///
    /// Duplicate keys resolve to the last occurrence, matching repeated
    /// `set`. Entries are ordered by the digest ladder before slabs are
    /// filled, so collision groups materialize exactly as incremental
    /// insertion would produce them.
    pub fn from_batch<B, I>(
        storage: &mut SlabStorage<B>,
        address: Address,
        type_info: TypeInfo,
        builder: Rc<dyn DigesterBuilder>,
        pairs: I,
    ) -> Result<Self>
    where
        B: BlobStore,
        I: IntoIterator<Item = (Vec<u8>, Value)>,
    {
        check_digester_levels(builder.as_ref())?;
        let config = storage.config();
        let max_inline = config.max_inline_element_size();
        let root_id = storage.generate_id(address)?;

        let mut last_wins: BTreeMap<Vec<u8>, Value> = BTreeMap::new();
        for (key, value) in pairs {
            if key.len() as u32 > max_inline {
                return Err(CanopyError::OverLimit {
                    size: key.len() as u32,
                    limit: max_inline,
                });
            }
            last_wins.insert(key, value);
        }

        let mut items = Vec::with_capacity(last_wins.len());
        for (key_bytes, value) in last_wins {
            let value = storage.make_storable(address, value)?;
            let digester = builder.digest(&key_bytes);
            items.push(BatchItem {
                key: Storable::Value(key_bytes.clone()),
                key_bytes,
                value,
                digester,
            });
        }

        let entries = build_entries(storage, address, builder.levels(), 0, items)?;

        let mut runs = partition_runs(entries, MAP_DATA_PREFIX, &config, MapEntry::byte_size);
        borrow_back(&mut runs, MAP_DATA_PREFIX, &config, MapEntry::byte_size);

        if runs.len() == 1 {
            let mut root =
                MapDataSlab::from_entries(root_id, SlabId::SENTINEL, runs.pop().expect("one run"));
            root.set_extra(Some(type_info.clone()));
            storage.store(Slab::MapData(root));
            return Ok(Self::from_parts(root_id, address, type_info, builder));
        }

        let ids: Vec<SlabId> = runs
            .iter()
            .map(|_| storage.generate_id(address))
            .collect::<Result<_>>()?;
        let mut headers = Vec::with_capacity(runs.len());
        for (i, entries) in runs.into_iter().enumerate() {
            let next = ids.get(i + 1).copied().unwrap_or(SlabId::SENTINEL);
            let leaf = MapDataSlab::from_entries(ids[i], next, entries);
            headers.push(MapChildHeader {
                first_digest: leaf.first_digest(),
                header: leaf.header,
            });
            storage.store(Slab::MapData(leaf));
        }

        loop {
            let mut runs =
                partition_runs(headers, MAP_META_PREFIX, &config, |_| MAP_META_CHILD_SIZE);
            borrow_back(&mut runs, MAP_META_PREFIX, &config, |_| MAP_META_CHILD_SIZE);

            if runs.len() == 1 {
                let meta =
                    MapMetaSlab::new(root_id, Some(type_info.clone()), runs.pop().expect("one run"));
                storage.store(Slab::MapMeta(meta));
                return Ok(Self::from_parts(root_id, address, type_info, builder));
            }

            let mut next_headers = Vec::with_capacity(runs.len());
            for children in runs {
                let id = storage.generate_id(address)?;
                let meta = MapMetaSlab::new(id, None, children);
                next_headers.push(MapChildHeader {
                    first_digest: meta.first_digest(),
                    header: meta.header,
                });
                storage.store(Slab::MapMeta(meta));
            }
            headers = next_headers;
        }
    }
}

/// Turn digest-sorted items into an entry run for one level, nesting
/// collision groups and externalizing the ones over the cap.
fn build_entries<B: BlobStore>(
    storage: &mut SlabStorage<B>,
    address: Address,
    levels: u32,
    level: u32,
    mut items: Vec<BatchItem>,
) -> Result<Vec<MapEntry>> {
    if level >= levels {
        items.sort_by(|a, b| a.key_bytes.cmp(&b.key_bytes));
        return Ok(items
            .into_iter()
            .map(|item| MapEntry::Pair {
                key: item.key,
                value: item.value,
            })
            .collect());
    }

    let mut keyed: Vec<(u64, BatchItem)> = Vec::with_capacity(items.len());
    for mut item in items.drain(..) {
        let digest = item.digester.digest_at(level)?;
        keyed.push((digest, item));
    }
    keyed.sort_by_key(|(digest, _)| *digest);

    let cap = storage.config().collision_group_cap();
    let mut entries = Vec::new();
    let mut iter = keyed.into_iter().peekable();
    while let Some((digest, item)) = iter.next() {
        let mut group = vec![item];
        while iter.peek().is_some_and(|(d, _)| *d == digest) {
            group.push(iter.next().expect("peeked").1);
        }
        if group.len() == 1 {
            let item = group.pop().expect("one item");
            entries.push(MapEntry::Single {
                digest,
                key: item.key,
                value: item.value,
            });
        } else {
            let inner = build_entries(storage, address, levels, level + 1, group)?;
            let mut entry = MapEntry::Group {
                digest,
                body: GroupBody::Inline(inner),
            };
            if entry.byte_size() > cap {
                let MapEntry::Group { body, .. } = &mut entry else {
                    unreachable!("constructed a group above");
                };
                let GroupBody::Inline(inner) =
                    std::mem::replace(body, GroupBody::Inline(Vec::new()))
                else {
                    unreachable!("constructed inline above");
                };
                let id = storage.generate_id(address)?;
                let slab = MapDataSlab::new_collision(id, level + 1, inner);
                *body = GroupBody::External {
                    id,
                    count: slab.header.count,
                    size: slab.header.size,
                };
                storage.store(Slab::MapData(slab));
            }
            entries.push(entry);
        }
    }
    Ok(entries)
}
