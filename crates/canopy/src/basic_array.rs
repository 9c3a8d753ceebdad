//! The `BasicArray`: a single-slab ordered sequence.
//!
//! No B+-tree discipline, no size envelope: every element lives in the
//! one root slab, which grows and shrinks freely. Useful for small
//! fixed collections that want a stable id without tree overhead, and
//! as the simplest possible exercise of the storable codec.

use crate::cbor;
use crate::slab::{
    decode_extra_data, encode_extra_data, encode_version_and_flag, extra_data_size, Slab,
    SlabHeader, VERSION_AND_FLAG_SIZE,
};
use crate::storable::{Storable, Value};
use crate::storage::SlabStorage;
use canopy_error::{CanopyError, Result};
use canopy_store::BlobStore;
use canopy_types::flags::{SlabFamily, SlabKind};
use canopy_types::{Address, SlabId, TypeInfo};

/// The one slab shape of a basic array. Always a root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicArrayDataSlab {
    pub(crate) header: SlabHeader,
    pub(crate) extra: Option<TypeInfo>,
    pub(crate) elements: Vec<Storable>,
}

impl BasicArrayDataSlab {
    fn new(id: SlabId, type_info: TypeInfo) -> Self {
        let mut slab = Self {
            header: SlabHeader { id, count: 0, size: 0 },
            extra: Some(type_info),
            elements: Vec::new(),
        };
        slab.recompute();
        slab
    }

    fn prefix_size(&self) -> u32 {
        let extra = self.extra.as_ref().map_or(0, extra_data_size);
        VERSION_AND_FLAG_SIZE + extra + cbor::ARRAY_HEAD16_SIZE
    }

    fn recompute(&mut self) {
        self.header.count = self.elements.len() as u32;
        self.header.size = self.prefix_size()
            + self.elements.iter().map(Storable::byte_size).sum::<u32>();
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        encode_version_and_flag(
            out,
            SlabKind::Data,
            SlabFamily::BasicArray,
            self.extra.is_some(),
        );
        if let Some(ti) = &self.extra {
            encode_extra_data(out, ti);
        }
        cbor::write_array_head16(out, self.elements.len() as u16);
        for element in &self.elements {
            element.encode(out);
        }
    }

    pub(crate) fn decode(id: SlabId, has_extra: bool, body: &[u8]) -> Result<Self> {
        let mut rest = body;
        let mut extra = None;
        if has_extra {
            let (ti, after) = decode_extra_data(rest)
                .ok_or_else(|| CanopyError::corrupt(id, "bad extra data in basic array slab"))?;
            extra = Some(ti);
            rest = after;
        }
        let (count, mut rest) = cbor::read_array_head16(rest)
            .ok_or_else(|| CanopyError::corrupt(id, "bad element count in basic array slab"))?;
        let mut elements = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let (storable, used) = Storable::decode(rest)
                .ok_or_else(|| CanopyError::corrupt(id, "bad element storable"))?;
            elements.push(storable);
            rest = &rest[used..];
        }
        if !rest.is_empty() {
            return Err(CanopyError::corrupt(
                id,
                "trailing bytes after basic array elements",
            ));
        }
        let mut slab = Self {
            header: SlabHeader { id, count: 0, size: 0 },
            extra,
            elements,
        };
        slab.recompute();
        Ok(slab)
    }
}

/// A single-slab ordered sequence with a stable root id.
#[derive(Debug, Clone)]
pub struct BasicArray {
    root_id: SlabId,
    address: Address,
    type_info: TypeInfo,
}

impl BasicArray {
    /// Create an empty basic array under `address`.
    pub fn new<B: BlobStore>(
        storage: &mut SlabStorage<B>,
        address: Address,
        type_info: TypeInfo,
    ) -> Result<Self> {
        let root_id = storage.generate_id(address)?;
        let root = BasicArrayDataSlab::new(root_id, type_info.clone());
        storage.store(Slab::BasicArrayData(root));
        Ok(Self {
            root_id,
            address,
            type_info,
        })
    }

    /// Re-open a basic array from its root id.
    pub fn open<B: BlobStore>(storage: &mut SlabStorage<B>, root_id: SlabId) -> Result<Self> {
        let slab = storage.retrieve_slab(root_id)?;
        let Slab::BasicArrayData(root) = &slab else {
            return Err(CanopyError::TypeInfoMismatch {
                expected: "basic array data slab",
                found: slab.kind_name(),
            });
        };
        let type_info = root.extra.clone().ok_or(CanopyError::TypeInfoMismatch {
            expected: "basic array root slab",
            found: "basic array data slab",
        })?;
        Ok(Self {
            root_id,
            address: root_id.address,
            type_info,
        })
    }

    /// The stable root id.
    #[must_use]
    pub fn root_id(&self) -> SlabId {
        self.root_id
    }

    /// The owning address.
    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    /// The container's opaque type info.
    #[must_use]
    pub fn type_info(&self) -> &TypeInfo {
        &self.type_info
    }

    fn retrieve_root<B: BlobStore>(
        &self,
        storage: &mut SlabStorage<B>,
    ) -> Result<BasicArrayDataSlab> {
        match storage.retrieve_slab(self.root_id)? {
            Slab::BasicArrayData(root) => Ok(root),
            other => Err(CanopyError::WrongSlabType {
                id: self.root_id,
                expected: "basic array data slab",
                found: other.kind_name(),
            }),
        }
    }

    /// Number of elements.
    pub fn count<B: BlobStore>(&self, storage: &mut SlabStorage<B>) -> Result<u64> {
        Ok(u64::from(self.retrieve_root(storage)?.header.count))
    }

    /// The element at `index`.
    pub fn get<B: BlobStore>(
        &self,
        storage: &mut SlabStorage<B>,
        index: u64,
    ) -> Result<Storable> {
        let root = self.retrieve_root(storage)?;
        let count = u64::from(root.header.count);
        if index >= count {
            return Err(CanopyError::IndexOutOfBounds { index, count });
        }
        Ok(root.elements[index as usize].clone())
    }

    /// Replace the element at `index`, returning the old storable.
    pub fn set<B: BlobStore>(
        &mut self,
        storage: &mut SlabStorage<B>,
        index: u64,
        value: Value,
    ) -> Result<Storable> {
        let mut root = self.retrieve_root(storage)?;
        let count = u64::from(root.header.count);
        if index >= count {
            return Err(CanopyError::IndexOutOfBounds { index, count });
        }
        let storable = storage.make_storable(self.address, value)?;
        let old = std::mem::replace(&mut root.elements[index as usize], storable);
        root.recompute();
        storage.store(Slab::BasicArrayData(root));
        Ok(old)
    }

    /// Insert a value before `index`; `index == count` appends.
    pub fn insert<B: BlobStore>(
        &mut self,
        storage: &mut SlabStorage<B>,
        index: u64,
        value: Value,
    ) -> Result<()> {
        let mut root = self.retrieve_root(storage)?;
        let count = u64::from(root.header.count);
        if index > count {
            return Err(CanopyError::IndexOutOfBounds { index, count });
        }
        let storable = storage.make_storable(self.address, value)?;
        root.elements.insert(index as usize, storable);
        root.recompute();
        storage.store(Slab::BasicArrayData(root));
        Ok(())
    }

    /// Append a value.
    pub fn append<B: BlobStore>(
        &mut self,
        storage: &mut SlabStorage<B>,
        value: Value,
    ) -> Result<()> {
        let count = self.count(storage)?;
        self.insert(storage, count, value)
    }

    /// Remove and return the element at `index`.
    pub fn remove<B: BlobStore>(
        &mut self,
        storage: &mut SlabStorage<B>,
        index: u64,
    ) -> Result<Storable> {
        let mut root = self.retrieve_root(storage)?;
        let count = u64::from(root.header.count);
        if index >= count {
            return Err(CanopyError::IndexOutOfBounds { index, count });
        }
        let removed = root.elements.remove(index as usize);
        root.recompute();
        storage.store(Slab::BasicArrayData(root));
        Ok(removed)
    }

    /// Rebuild under `new_address` with fresh ids.
    pub fn deep_copy<B: BlobStore>(
        &self,
        storage: &mut SlabStorage<B>,
        new_address: Address,
    ) -> Result<Self> {
        let elements = self.retrieve_root(storage)?.elements;
        let mut out = Self::new(storage, new_address, self.type_info.clone())?;
        for (i, storable) in elements.iter().enumerate() {
            let value = crate::deep::deep_copy_storable(storage, new_address, storable)?;
            out.insert(storage, i as u64, value)?;
        }
        Ok(out)
    }

    /// Free every slab reachable from this basic array. Consumes the
    /// handle.
    pub fn deep_remove<B: BlobStore>(self, storage: &mut SlabStorage<B>) -> Result<()> {
        crate::deep::deep_remove_slab(storage, self.root_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_values::{test_storage, uint64_value, OTHER_ADDRESS, TEST_ADDRESS};

    #[test]
    fn test_basic_array_operations() {
        let mut storage = test_storage(1024);
        let mut array =
            BasicArray::new(&mut storage, TEST_ADDRESS, TypeInfo::from_u64(3)).unwrap();

        for i in 0..10u64 {
            array
                .append(&mut storage, Value::Bytes(uint64_value(i)))
                .unwrap();
        }
        assert_eq!(array.count(&mut storage).unwrap(), 10);
        assert_eq!(storage.count(), 1);

        array
            .insert(&mut storage, 0, Value::Bytes(uint64_value(99)))
            .unwrap();
        let got = array.get(&mut storage, 0).unwrap();
        assert_eq!(got, Storable::Value(uint64_value(99)));

        let old = array
            .set(&mut storage, 0, Value::Bytes(uint64_value(1)))
            .unwrap();
        assert_eq!(old, Storable::Value(uint64_value(99)));

        let removed = array.remove(&mut storage, 0).unwrap();
        assert_eq!(removed, Storable::Value(uint64_value(1)));
        assert_eq!(array.count(&mut storage).unwrap(), 10);

        assert!(matches!(
            array.get(&mut storage, 10).unwrap_err(),
            CanopyError::IndexOutOfBounds { .. }
        ));
    }

    #[test]
    fn test_basic_array_round_trip() {
        let mut storage = test_storage(1024);
        let mut array =
            BasicArray::new(&mut storage, TEST_ADDRESS, TypeInfo::from_u64(3)).unwrap();
        for i in 0..5u64 {
            array
                .append(&mut storage, Value::Bytes(uint64_value(i)))
                .unwrap();
        }
        storage.commit().unwrap();

        let slab = storage.retrieve_slab(array.root_id()).unwrap();
        let bytes = slab.encode();
        let decoded = Slab::decode(array.root_id(), &bytes).unwrap();
        assert_eq!(decoded.encode(), bytes);

        let reopened = BasicArray::open(&mut storage, array.root_id()).unwrap();
        assert_eq!(reopened.count(&mut storage).unwrap(), 5);
        assert_eq!(reopened.type_info(), &TypeInfo::from_u64(3));
    }

    #[test]
    fn test_basic_array_deep_copy() {
        let mut storage = test_storage(1024);
        let mut array =
            BasicArray::new(&mut storage, TEST_ADDRESS, TypeInfo::from_u64(3)).unwrap();
        for i in 0..5u64 {
            array
                .append(&mut storage, Value::Bytes(uint64_value(i)))
                .unwrap();
        }
        let copy = array.deep_copy(&mut storage, OTHER_ADDRESS).unwrap();
        assert_eq!(copy.count(&mut storage).unwrap(), 5);
        assert_eq!(copy.root_id().address, OTHER_ADDRESS);
        for i in 0..5u64 {
            assert_eq!(
                copy.get(&mut storage, i).unwrap(),
                Storable::Value(uint64_value(i))
            );
        }
        array.deep_remove(&mut storage).unwrap();
        copy.deep_remove(&mut storage).unwrap();
        assert_eq!(storage.count(), 0);
    }
}
