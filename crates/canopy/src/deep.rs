//! Deep operations over the reference graph.
//!
//! A container's tree references other slabs in two ways: element
//! storables may point at spilled payloads or at the roots of nested
//! containers, and map collision groups may live in their own slabs.
//! The functions here walk the whole reachable graph, dispatching on
//! each slab's decoded shape, so freeing and counting need neither the
//! container handles nor the digester that built the map.

use crate::array::Array;
use crate::basic_array::BasicArray;
use crate::digest::DigesterBuilder;
use crate::map::{flatten_group_slab_ids, Map, MapDataSlab};
use crate::slab::Slab;
use crate::storable::{Storable, Value};
use crate::storage::SlabStorage;
use canopy_error::{CanopyError, Result};
use canopy_store::BlobStore;
use canopy_types::{Address, SlabId};
use std::rc::Rc;

/// Free every slab reachable from `id`, bottom-up: element spills and
/// nested containers first, then the tree itself.
pub fn deep_remove_slab<B: BlobStore>(storage: &mut SlabStorage<B>, id: SlabId) -> Result<()> {
    let slab = storage.retrieve_slab(id)?;
    match slab {
        Slab::ArrayData(d) => {
            for element in &d.elements {
                deep_remove_storable(storage, element)?;
            }
        }
        Slab::ArrayMeta(m) => {
            for child in &m.children {
                deep_remove_slab(storage, child.id)?;
            }
        }
        Slab::MapData(d) => {
            deep_remove_entries(storage, &d)?;
        }
        Slab::MapMeta(m) => {
            for child in &m.children {
                deep_remove_slab(storage, child.header.id)?;
            }
        }
        Slab::Storable(s) => {
            deep_remove_storable(storage, &s.payload)?;
        }
        Slab::BasicArrayData(d) => {
            for element in &d.elements {
                deep_remove_storable(storage, element)?;
            }
        }
    }
    storage.remove(id)
}

/// Free whatever a storable references: nothing for inline values, the
/// whole reachable graph for pointers.
pub fn deep_remove_storable<B: BlobStore>(
    storage: &mut SlabStorage<B>,
    storable: &Storable,
) -> Result<()> {
    match storable.as_pointer() {
        Some(id) => deep_remove_slab(storage, id),
        None => Ok(()),
    }
}

fn deep_remove_entries<B: BlobStore>(
    storage: &mut SlabStorage<B>,
    slab: &MapDataSlab,
) -> Result<()> {
    let mut values = Vec::new();
    let mut group_ids = Vec::new();
    flatten_group_slab_ids(storage, &slab.entries, &mut values, &mut group_ids)?;
    for value in &values {
        deep_remove_storable(storage, value)?;
    }
    for group_id in group_ids {
        storage.remove(group_id)?;
    }
    Ok(())
}

/// Turn a stored element back into a value insertable under a new
/// address: inline bytes copy as-is, spilled payloads are re-read so
/// they re-spill on insert, nested containers deep-copy recursively.
pub fn deep_copy_storable<B: BlobStore>(
    storage: &mut SlabStorage<B>,
    new_address: Address,
    storable: &Storable,
) -> Result<Value> {
    let Some(id) = storable.as_pointer() else {
        let Storable::Value(bytes) = storable else {
            unreachable!("a storable is a value or a pointer");
        };
        return Ok(Value::Bytes(bytes.clone()));
    };

    match storage.retrieve_slab(id)? {
        Slab::Storable(s) => {
            let bytes = s
                .payload
                .as_value_bytes()
                .ok_or_else(|| CanopyError::corrupt(id, "storable slab holds a pointer"))?
                .to_vec();
            Ok(Value::Bytes(bytes))
        }
        Slab::ArrayData(_) | Slab::ArrayMeta(_) => {
            let array = Array::open(storage, id)?;
            let copy = array.deep_copy(storage, new_address)?;
            Ok(Value::Container(copy.root_id()))
        }
        Slab::MapData(s) if !s.is_collision_group() => {
            let builder: Rc<dyn DigesterBuilder> =
                Rc::new(storage.default_digester_builder());
            let map = Map::open(storage, id, builder)?;
            let copy = map.deep_copy(storage, new_address)?;
            Ok(Value::Container(copy.root_id()))
        }
        Slab::MapMeta(_) => {
            let builder: Rc<dyn DigesterBuilder> =
                Rc::new(storage.default_digester_builder());
            let map = Map::open(storage, id, builder)?;
            let copy = map.deep_copy(storage, new_address)?;
            Ok(Value::Container(copy.root_id()))
        }
        Slab::BasicArrayData(_) => {
            let basic = BasicArray::open(storage, id)?;
            let copy = basic.deep_copy(storage, new_address)?;
            Ok(Value::Container(copy.root_id()))
        }
        Slab::MapData(_) => Err(CanopyError::corrupt(
            id,
            "element points at a collision group slab",
        )),
    }
}

/// Number of slabs reachable from `id`: the tree, collision slabs,
/// spilled payloads, and nested containers.
pub fn count_reachable_slabs<B: BlobStore>(
    storage: &mut SlabStorage<B>,
    id: SlabId,
) -> Result<u64> {
    let mut total = 1u64;
    let slab = storage.retrieve_slab(id)?;
    match slab {
        Slab::ArrayData(d) => {
            for element in &d.elements {
                total += count_storable(storage, element)?;
            }
        }
        Slab::ArrayMeta(m) => {
            for child in &m.children {
                total += count_reachable_slabs(storage, child.id)?;
            }
        }
        Slab::MapData(d) => {
            let mut values = Vec::new();
            let mut group_ids = Vec::new();
            flatten_group_slab_ids(storage, &d.entries, &mut values, &mut group_ids)?;
            for value in &values {
                total += count_storable(storage, value)?;
            }
            total += group_ids.len() as u64;
        }
        Slab::MapMeta(m) => {
            for child in &m.children {
                total += count_reachable_slabs(storage, child.header.id)?;
            }
        }
        Slab::Storable(s) => {
            total += count_storable(storage, &s.payload)?;
        }
        Slab::BasicArrayData(d) => {
            for element in &d.elements {
                total += count_storable(storage, element)?;
            }
        }
    }
    Ok(total)
}

fn count_storable<B: BlobStore>(
    storage: &mut SlabStorage<B>,
    storable: &Storable,
) -> Result<u64> {
    match storable.as_pointer() {
        Some(id) => count_reachable_slabs(storage, id),
        None => Ok(0),
    }
}
