//! The `Array`: an ordered indexed sequence over the slab B+-tree.
//!
//! Data slabs hold element storables and chain to their right neighbor
//! by id, so iteration never climbs the tree. Meta slabs hold child
//! headers; locating index `i` walks children subtracting counts. All
//! structural maintenance is byte-size driven: a slab exceeding the
//! target threshold splits, one dropping below half merges with or
//! borrows from a sibling.
//!
//! Root slabs are special in two ways: they carry the container's type
//! info as extra data, and their id never changes. A root data slab
//! that splits becomes a meta slab under the same id; a meta root left
//! with a single child absorbs that child's content back under the old
//! id. External references to the container stay valid across both.

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
use canopy_types::{Address, SlabId, StorageConfig, TypeInfo, SLAB_ID_SIZE};

/// Fixed prefix of a non-root array data slab: version, flag, next id,
/// element count head.
pub(crate) const ARRAY_DATA_PREFIX: u32 =
    VERSION_AND_FLAG_SIZE + SLAB_ID_SIZE as u32 + cbor::ARRAY_HEAD16_SIZE;

/// Fixed prefix of a non-root array meta slab: version, flag, child
/// count.
pub(crate) const ARRAY_META_PREFIX: u32 = VERSION_AND_FLAG_SIZE + 2;

// ---------------------------------------------------------------------------
// Split point selection
// ---------------------------------------------------------------------------

/// Number of items the left half keeps when a slab splits.
///
/// Picks the leftmost boundary where the left half reaches the minimum
/// threshold and both halves land inside the envelope, preferring
/// boundaries that keep the right half above the minimum as well. The
/// fallbacks cover element-size distributions so skewed that no fully
/// legal boundary exists.
pub(crate) fn split_index(sizes: &[u32], prefix: u32, config: &StorageConfig) -> usize {
    debug_assert!(sizes.len() >= 2, "splitting a slab with fewer than two items");
    let total: u32 = sizes.iter().sum();
    // Halves are capped at the packing target, not the hard maximum,
    // so freshly split slabs sit inside the normal operating band.
    let cap = config.target_threshold();
    let min = config.min_threshold();

    let mut left = 0u32;
    let mut min_crossing = None;
    let mut half_legal = None;
    for k in 1..sizes.len() {
        left += sizes[k - 1];
        let left_size = prefix + left;
        if left_size >= min {
            if min_crossing.is_none() {
                min_crossing = Some(k);
            }
            let right_size = prefix + (total - left);
            if left_size <= cap && right_size <= cap {
                if right_size >= min {
                    return k;
                }
                if half_legal.is_none() {
                    half_legal = Some(k);
                }
            }
            if left_size > cap {
                break;
            }
        }
    }
    half_legal
        .or(min_crossing)
        .unwrap_or(sizes.len() / 2)
        .max(1)
}

// ---------------------------------------------------------------------------
// Array data slab
// ---------------------------------------------------------------------------

/// A leaf slab: an ordered run of element storables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayDataSlab {
    pub(crate) header: SlabHeader,
    /// Right neighbor in the leaf chain; sentinel when rightmost or
    /// root.
    pub(crate) next: SlabId,
    /// Container type info; present exactly on the root.
    pub(crate) extra: Option<TypeInfo>,
    pub(crate) elements: Vec<Storable>,
}

impl ArrayDataSlab {
    pub(crate) fn new_root(id: SlabId, type_info: TypeInfo) -> Self {
        let mut slab = Self {
            header: SlabHeader { id, count: 0, size: 0 },
            next: SlabId::SENTINEL,
            extra: Some(type_info),
            elements: Vec::new(),
        };
        slab.recompute();
        slab
    }

    pub(crate) fn from_elements(id: SlabId, next: SlabId, elements: Vec<Storable>) -> Self {
        let mut slab = Self {
            header: SlabHeader { id, count: 0, size: 0 },
            next,
            extra: None,
            elements,
        };
        slab.recompute();
        slab
    }

    pub(crate) fn prefix_size(&self) -> u32 {
        match &self.extra {
            Some(ti) => {
                VERSION_AND_FLAG_SIZE + extra_data_size(ti) + cbor::ARRAY_HEAD16_SIZE
            }
            None => ARRAY_DATA_PREFIX,
        }
    }

    fn recompute(&mut self) {
        self.header.count = self.elements.len() as u32;
        self.header.size = self.prefix_size()
            + self.elements.iter().map(Storable::byte_size).sum::<u32>();
    }

    /// Attach or detach root extra data, fixing up the recorded size.
    /// Root data slabs carry extra data and no next pointer.
    pub(crate) fn set_extra(&mut self, extra: Option<TypeInfo>) {
        if extra.is_some() {
            debug_assert!(
                self.next.is_sentinel(),
                "promoting a data slab that still has a right neighbor"
            );
        }
        self.extra = extra;
        self.recompute();
    }

    pub(crate) fn get_local(&self, index: u64) -> &Storable {
        &self.elements[index as usize]
    }

    pub(crate) fn set_local(&mut self, index: u64, storable: Storable) -> Storable {
        let slot = &mut self.elements[index as usize];
        let old = std::mem::replace(slot, storable);
        self.header.size =
            self.header.size - old.byte_size() + self.elements[index as usize].byte_size();
        old
    }

    pub(crate) fn insert_local(&mut self, index: u64, storable: Storable) {
        self.header.size += storable.byte_size();
        self.header.count += 1;
        self.elements.insert(index as usize, storable);
    }

    pub(crate) fn remove_local(&mut self, index: u64) -> Storable {
        let removed = self.elements.remove(index as usize);
        self.header.size -= removed.byte_size();
        self.header.count -= 1;
        removed
    }

    /// Split off a right half under `right_id`, keeping this slab as
    /// the left half and relinking the leaf chain.
    pub(crate) fn split(&mut self, right_id: SlabId, config: &StorageConfig) -> Self {
        debug_assert!(self.extra.is_none(), "root data slabs split at the array level");
        let sizes: Vec<u32> = self.elements.iter().map(Storable::byte_size).collect();
        let k = split_index(&sizes, ARRAY_DATA_PREFIX, config);
        let right_elements = self.elements.split_off(k);
        let right = Self::from_elements(right_id, self.next, right_elements);
        self.next = right_id;
        self.recompute();
        right
    }

    /// Absorb the right neighbor.
    pub(crate) fn merge(&mut self, right: Self) {
        self.elements.extend(right.elements);
        self.next = right.next;
        self.recompute();
    }

    /// Move leading elements of `right` here until this slab reaches
    /// the minimum threshold.
    pub(crate) fn borrow_from_right(&mut self, right: &mut Self, config: &StorageConfig) {
        let min = config.min_threshold();
        let mut take = 0;
        let mut moved = 0u32;
        while self.header.size + moved < min && take < right.elements.len() {
            moved += right.elements[take].byte_size();
            take += 1;
        }
        let tail = right.elements.split_off(take);
        let head = std::mem::replace(&mut right.elements, tail);
        self.elements.extend(head);
        self.recompute();
        right.recompute();
    }

    /// Move trailing elements to `right` until it reaches the minimum
    /// threshold.
    pub(crate) fn lend_to_right(&mut self, right: &mut Self, config: &StorageConfig) {
        let min = config.min_threshold();
        let mut keep = self.elements.len();
        let mut moved = 0u32;
        while right.header.size + moved < min && keep > 0 {
            keep -= 1;
            moved += self.elements[keep].byte_size();
        }
        let tail = self.elements.split_off(keep);
        right.elements.splice(0..0, tail);
        self.recompute();
        right.recompute();
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        encode_version_and_flag(out, SlabKind::Data, SlabFamily::Array, self.extra.is_some());
        match &self.extra {
            Some(ti) => encode_extra_data(out, ti),
            None => out.extend_from_slice(&self.next.to_bytes()),
        }
        cbor::write_array_head16(out, self.elements.len() as u16);
        for element in &self.elements {
            element.encode(out);
        }
    }

    pub(crate) fn decode(id: SlabId, has_extra: bool, body: &[u8]) -> Result<Self> {
        let mut rest = body;
        let mut extra = None;
        let mut next = SlabId::SENTINEL;
        if has_extra {
            let (ti, after) = decode_extra_data(rest)
                .ok_or_else(|| CanopyError::corrupt(id, "bad extra data in array data slab"))?;
            extra = Some(ti);
            rest = after;
        } else {
            if rest.len() < SLAB_ID_SIZE {
                return Err(CanopyError::corrupt(id, "array data slab missing next id"));
            }
            let mut raw = [0u8; SLAB_ID_SIZE];
            raw.copy_from_slice(&rest[..SLAB_ID_SIZE]);
            next = SlabId::from_bytes(&raw);
            rest = &rest[SLAB_ID_SIZE..];
        }

        let (count, mut rest) = cbor::read_array_head16(rest)
            .ok_or_else(|| CanopyError::corrupt(id, "bad element count in array data slab"))?;
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
                "trailing bytes after array data slab elements",
            ));
        }

        let mut slab = Self {
            header: SlabHeader { id, count: 0, size: 0 },
            next,
            extra,
            elements,
        };
        slab.recompute();
        Ok(slab)
    }
}

// ---------------------------------------------------------------------------
// Array meta slab
// ---------------------------------------------------------------------------

/// An interior slab: an ordered run of child headers covering a
/// contiguous index range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayMetaSlab {
    pub(crate) header: SlabHeader,
    pub(crate) extra: Option<TypeInfo>,
    pub(crate) children: Vec<SlabHeader>,
}

impl ArrayMetaSlab {
    pub(crate) fn new(id: SlabId, extra: Option<TypeInfo>, children: Vec<SlabHeader>) -> Self {
        let mut slab = Self {
            header: SlabHeader { id, count: 0, size: 0 },
            extra,
            children,
        };
        slab.recompute();
        slab
    }

    pub(crate) fn prefix_size(&self) -> u32 {
        match &self.extra {
            Some(ti) => ARRAY_META_PREFIX + extra_data_size(ti),
            None => ARRAY_META_PREFIX,
        }
    }

    pub(crate) fn recompute(&mut self) {
        self.header.count = self.children.iter().map(|c| c.count).sum();
        self.header.size =
            self.prefix_size() + SlabHeader::ENCODED_SIZE * self.children.len() as u32;
    }

    pub(crate) fn set_extra(&mut self, extra: Option<TypeInfo>) {
        self.extra = extra;
        self.recompute();
    }

    /// Child holding `index`, and the index localized to that child.
    /// Ties break leftward: an index on a child boundary belongs to the
    /// left child's successor, never past it.
    fn locate(&self, index: u64) -> (usize, u64) {
        let mut remaining = index;
        for (i, child) in self.children.iter().enumerate() {
            if remaining < u64::from(child.count) {
                return (i, remaining);
            }
            remaining -= u64::from(child.count);
        }
        unreachable!("index {index} beyond checked bounds");
    }

    /// Like [`locate`](Self::locate), but an index equal to the total
    /// count lands after the last element of the last child.
    fn locate_for_insert(&self, index: u64) -> (usize, u64) {
        let mut remaining = index;
        for (i, child) in self.children.iter().enumerate() {
            let count = u64::from(child.count);
            if remaining < count || (i + 1 == self.children.len() && remaining == count) {
                return (i, remaining);
            }
            remaining -= count;
        }
        unreachable!("insert index {index} beyond checked bounds");
    }

    pub(crate) fn get<B: BlobStore>(
        &self,
        storage: &mut SlabStorage<B>,
        index: u64,
    ) -> Result<Storable> {
        let (i, local) = self.locate(index);
        match retrieve_array_slab(storage, self.children[i].id)? {
            ArraySlab::Data(d) => Ok(d.get_local(local).clone()),
            ArraySlab::Meta(m) => m.get(storage, local),
        }
    }

    pub(crate) fn set<B: BlobStore>(
        &mut self,
        storage: &mut SlabStorage<B>,
        index: u64,
        storable: Storable,
    ) -> Result<Storable> {
        let (i, local) = self.locate(index);
        let mut child = retrieve_array_slab(storage, self.children[i].id)?;
        let old = match &mut child {
            ArraySlab::Data(d) => d.set_local(local, storable),
            ArraySlab::Meta(m) => m.set(storage, local, storable)?,
        };
        self.finalize_child(storage, i, child)?;
        Ok(old)
    }

    pub(crate) fn insert<B: BlobStore>(
        &mut self,
        storage: &mut SlabStorage<B>,
        index: u64,
        storable: Storable,
    ) -> Result<()> {
        let (i, local) = self.locate_for_insert(index);
        let mut child = retrieve_array_slab(storage, self.children[i].id)?;
        match &mut child {
            ArraySlab::Data(d) => d.insert_local(local, storable),
            ArraySlab::Meta(m) => m.insert(storage, local, storable)?,
        }
        self.finalize_child(storage, i, child)
    }

    pub(crate) fn remove<B: BlobStore>(
        &mut self,
        storage: &mut SlabStorage<B>,
        index: u64,
    ) -> Result<Storable> {
        let (i, local) = self.locate(index);
        let mut child = retrieve_array_slab(storage, self.children[i].id)?;
        let removed = match &mut child {
            ArraySlab::Data(d) => d.remove_local(local),
            ArraySlab::Meta(m) => m.remove(storage, local)?,
        };
        self.finalize_child(storage, i, child)?;
        Ok(removed)
    }

    /// Re-admit a mutated child: split it if it overflowed, merge or
    /// rebalance if it underflowed, otherwise just refresh its header.
    fn finalize_child<B: BlobStore>(
        &mut self,
        storage: &mut SlabStorage<B>,
        i: usize,
        child: ArraySlab,
    ) -> Result<()> {
        let config = storage.config();
        if child.header().size > config.max_threshold() {
            let (left, right) = split_array_slab(storage, child)?;
            self.children[i] = left.header();
            self.children.insert(i + 1, right.header());
            storage.store(left.into_slab());
            storage.store(right.into_slab());
        } else if child.header().size < config.min_threshold() {
            self.merge_or_rebalance_child(storage, i, child)?;
        } else {
            self.children[i] = child.header();
            storage.store(child.into_slab());
        }
        self.recompute();
        Ok(())
    }

    /// Underflow handling. Rebalance with the right neighbor, then the
    /// left, whenever the neighbor can lend without underflowing
    /// itself. Otherwise merge with the right neighbor, or the left
    /// when no right exists; a neighbor too poor to lend always fits in
    /// one slab with this one.
    fn merge_or_rebalance_child<B: BlobStore>(
        &mut self,
        storage: &mut SlabStorage<B>,
        i: usize,
        mut child: ArraySlab,
    ) -> Result<()> {
        let config = storage.config();
        let max = config.max_threshold();
        let has_right = i + 1 < self.children.len();
        let has_left = i > 0;

        if has_right {
            let mut right = retrieve_array_slab(storage, self.children[i + 1].id)?;
            if child.can_borrow_from_right(&right, &config) {
                child.borrow_from_right(&mut right, &config)?;
                self.children[i] = child.header();
                self.children[i + 1] = right.header();
                storage.store(child.into_slab());
                storage.store(right.into_slab());
                return Ok(());
            }
        }
        if has_left {
            let mut left = retrieve_array_slab(storage, self.children[i - 1].id)?;
            if left.can_lend_to_right(&child, &config) {
                left.lend_to_right(&mut child, &config)?;
                self.children[i - 1] = left.header();
                self.children[i] = child.header();
                storage.store(left.into_slab());
                storage.store(child.into_slab());
                return Ok(());
            }
        }
        if has_right {
            let right = retrieve_array_slab(storage, self.children[i + 1].id)?;
            let right_id = right.header().id;
            child.merge(right)?;
            debug_assert!(
                child.header().size <= max,
                "merging two unlendable siblings overflowed the envelope"
            );
            storage.remove(right_id)?;
            self.children[i] = child.header();
            self.children.remove(i + 1);
            storage.store(child.into_slab());
            return Ok(());
        }
        if has_left {
            let mut left = retrieve_array_slab(storage, self.children[i - 1].id)?;
            let child_id = child.header().id;
            left.merge(child)?;
            debug_assert!(
                left.header().size <= max,
                "merging two unlendable siblings overflowed the envelope"
            );
            storage.remove(child_id)?;
            self.children[i - 1] = left.header();
            self.children.remove(i);
            storage.store(left.into_slab());
            return Ok(());
        }

        // An only child: the root collapse above this call will absorb
        // it; nothing to rebalance against.
        self.children[i] = child.header();
        storage.store(child.into_slab());
        Ok(())
    }

    /// Split off a right half of the child list under `right_id`.
    pub(crate) fn split(&mut self, right_id: SlabId, config: &StorageConfig) -> Self {
        debug_assert!(self.extra.is_none(), "root meta slabs split at the array level");
        let sizes = vec![SlabHeader::ENCODED_SIZE; self.children.len()];
        let k = split_index(&sizes, ARRAY_META_PREFIX, config);
        let right_children = self.children.split_off(k);
        let right = Self::new(right_id, None, right_children);
        self.recompute();
        right
    }

    pub(crate) fn merge(&mut self, right: Self) {
        self.children.extend(right.children);
        self.recompute();
    }

    pub(crate) fn borrow_from_right(&mut self, right: &mut Self, config: &StorageConfig) {
        let min = config.min_threshold();
        let mut take = 0usize;
        while self.header.size + SlabHeader::ENCODED_SIZE * (take as u32) < min
            && take < right.children.len()
        {
            take += 1;
        }
        let tail = right.children.split_off(take);
        let head = std::mem::replace(&mut right.children, tail);
        self.children.extend(head);
        self.recompute();
        right.recompute();
    }

    pub(crate) fn lend_to_right(&mut self, right: &mut Self, config: &StorageConfig) {
        let min = config.min_threshold();
        let mut keep = self.children.len();
        let mut moved = 0u32;
        while right.header.size + moved < min && keep > 0 {
            keep -= 1;
            moved += SlabHeader::ENCODED_SIZE;
        }
        let tail = self.children.split_off(keep);
        right.children.splice(0..0, tail);
        self.recompute();
        right.recompute();
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        encode_version_and_flag(out, SlabKind::Meta, SlabFamily::Array, self.extra.is_some());
        if let Some(ti) = &self.extra {
            encode_extra_data(out, ti);
        }
        out.extend_from_slice(&(self.children.len() as u16).to_be_bytes());
        for child in &self.children {
            out.extend_from_slice(&child.id.to_bytes());
            out.extend_from_slice(&child.count.to_be_bytes());
            out.extend_from_slice(&child.size.to_be_bytes());
        }
    }

    pub(crate) fn decode(id: SlabId, has_extra: bool, body: &[u8]) -> Result<Self> {
        let mut rest = body;
        let mut extra = None;
        if has_extra {
            let (ti, after) = decode_extra_data(rest)
                .ok_or_else(|| CanopyError::corrupt(id, "bad extra data in array meta slab"))?;
            extra = Some(ti);
            rest = after;
        }
        if rest.len() < 2 {
            return Err(CanopyError::corrupt(id, "array meta slab missing child count"));
        }
        let count = u16::from_be_bytes([rest[0], rest[1]]);
        rest = &rest[2..];

        let entry = SlabHeader::ENCODED_SIZE as usize;
        if rest.len() != usize::from(count) * entry {
            return Err(CanopyError::corrupt(
                id,
                "array meta slab body length disagrees with child count",
            ));
        }
        let mut children = Vec::with_capacity(usize::from(count));
        for chunk in rest.chunks_exact(entry) {
            let mut raw = [0u8; SLAB_ID_SIZE];
            raw.copy_from_slice(&chunk[..SLAB_ID_SIZE]);
            children.push(SlabHeader {
                id: SlabId::from_bytes(&raw),
                count: u32::from_be_bytes([chunk[16], chunk[17], chunk[18], chunk[19]]),
                size: u32::from_be_bytes([chunk[20], chunk[21], chunk[22], chunk[23]]),
            });
        }
        Ok(Self::new(id, extra, children))
    }
}

// ---------------------------------------------------------------------------
// ArraySlab: data-or-meta dispatch
// ---------------------------------------------------------------------------

/// A slab participating in an array tree.
#[derive(Debug, Clone)]
pub(crate) enum ArraySlab {
    Data(ArrayDataSlab),
    Meta(ArrayMetaSlab),
}

impl ArraySlab {
    pub(crate) fn header(&self) -> SlabHeader {
        match self {
            Self::Data(s) => s.header,
            Self::Meta(s) => s.header,
        }
    }

    pub(crate) fn id(&self) -> SlabId {
        self.header().id
    }

    pub(crate) fn set_id(&mut self, id: SlabId) {
        match self {
            Self::Data(s) => s.header.id = id,
            Self::Meta(s) => s.header.id = id,
        }
    }

    pub(crate) fn set_extra(&mut self, extra: Option<TypeInfo>) {
        match self {
            Self::Data(s) => s.set_extra(extra),
            Self::Meta(s) => s.set_extra(extra),
        }
    }

    pub(crate) fn merge(&mut self, right: Self) -> Result<()> {
        match (self, right) {
            (Self::Data(l), Self::Data(r)) => {
                l.merge(r);
                Ok(())
            }
            (Self::Meta(l), Self::Meta(r)) => {
                l.merge(r);
                Ok(())
            }
            (l, r) => Err(CanopyError::corrupt(
                l.id(),
                format!("sibling {} is a different slab shape", r.id()),
            )),
        }
    }

    /// Whether taking leading items from `right` leaves both slabs
    /// inside the envelope. Mirrors [`borrow_from_right`] exactly.
    ///
    /// [`borrow_from_right`]: Self::borrow_from_right
    pub(crate) fn can_borrow_from_right(&self, right: &Self, config: &StorageConfig) -> bool {
        let min = config.min_threshold();
        match (self, right) {
            (Self::Data(l), Self::Data(r)) => {
                let mut moved = 0u32;
                for element in &r.elements {
                    if l.header.size + moved >= min {
                        break;
                    }
                    moved += element.byte_size();
                }
                l.header.size + moved >= min && r.header.size - moved >= min
            }
            (Self::Meta(l), Self::Meta(r)) => {
                let mut take = 0u32;
                while l.header.size + SlabHeader::ENCODED_SIZE * take < min
                    && (take as usize) < r.children.len()
                {
                    take += 1;
                }
                let moved = SlabHeader::ENCODED_SIZE * take;
                l.header.size + moved >= min && r.header.size - moved >= min
            }
            _ => false,
        }
    }

    /// Whether giving trailing items to `right` leaves both slabs
    /// inside the envelope. Mirrors [`lend_to_right`] exactly.
    ///
    /// [`lend_to_right`]: Self::lend_to_right
    pub(crate) fn can_lend_to_right(&self, right: &Self, config: &StorageConfig) -> bool {
        let min = config.min_threshold();
        match (self, right) {
            (Self::Data(l), Self::Data(r)) => {
                let mut moved = 0u32;
                for element in l.elements.iter().rev() {
                    if r.header.size + moved >= min {
                        break;
                    }
                    moved += element.byte_size();
                }
                r.header.size + moved >= min && l.header.size - moved >= min
            }
            (Self::Meta(l), Self::Meta(r)) => {
                let mut moved = 0u32;
                let mut keep = l.children.len();
                while r.header.size + moved < min && keep > 0 {
                    keep -= 1;
                    moved += SlabHeader::ENCODED_SIZE;
                }
                r.header.size + moved >= min && l.header.size - moved >= min
            }
            _ => false,
        }
    }

    pub(crate) fn borrow_from_right(
        &mut self,
        right: &mut Self,
        config: &StorageConfig,
    ) -> Result<()> {
        match (self, right) {
            (Self::Data(l), Self::Data(r)) => {
                l.borrow_from_right(r, config);
                Ok(())
            }
            (Self::Meta(l), Self::Meta(r)) => {
                l.borrow_from_right(r, config);
                Ok(())
            }
            (l, r) => Err(CanopyError::corrupt(
                l.id(),
                format!("sibling {} is a different slab shape", r.id()),
            )),
        }
    }

    pub(crate) fn lend_to_right(
        &mut self,
        right: &mut Self,
        config: &StorageConfig,
    ) -> Result<()> {
        match (self, right) {
            (Self::Data(l), Self::Data(r)) => {
                l.lend_to_right(r, config);
                Ok(())
            }
            (Self::Meta(l), Self::Meta(r)) => {
                l.lend_to_right(r, config);
                Ok(())
            }
            (l, r) => Err(CanopyError::corrupt(
                l.id(),
                format!("sibling {} is a different slab shape", r.id()),
            )),
        }
    }

    pub(crate) fn into_slab(self) -> Slab {
        match self {
            Self::Data(s) => Slab::ArrayData(s),
            Self::Meta(s) => Slab::ArrayMeta(s),
        }
    }
}

/// Retrieve a slab expected to belong to an array tree.
pub(crate) fn retrieve_array_slab<B: BlobStore>(
    storage: &mut SlabStorage<B>,
    id: SlabId,
) -> Result<ArraySlab> {
    match storage.retrieve_slab(id)? {
        Slab::ArrayData(s) => Ok(ArraySlab::Data(s)),
        Slab::ArrayMeta(s) => Ok(ArraySlab::Meta(s)),
        other => Err(CanopyError::WrongSlabType {
            id,
            expected: "array slab",
            found: other.kind_name(),
        }),
    }
}

/// Split an overflowing non-root array slab, issuing a fresh id for the
/// right half.
fn split_array_slab<B: BlobStore>(
    storage: &mut SlabStorage<B>,
    child: ArraySlab,
) -> Result<(ArraySlab, ArraySlab)> {
    let config = storage.config();
    let right_id = storage.generate_id(child.id().address)?;
    match child {
        ArraySlab::Data(mut d) => {
            let right = d.split(right_id, &config);
            Ok((ArraySlab::Data(d), ArraySlab::Data(right)))
        }
        ArraySlab::Meta(mut m) => {
            let right = m.split(right_id, &config);
            Ok((ArraySlab::Meta(m), ArraySlab::Meta(right)))
        }
    }
}

// ---------------------------------------------------------------------------
// Array
// ---------------------------------------------------------------------------

/// An ordered indexed sequence of storables.
///
/// The handle holds only the root id, owning address, and type info;
/// every operation takes the storage explicitly. The root id is stable
/// for the container's whole life, including growth through meta levels
/// and shrinkage back to a single data slab.
#[derive(Debug, Clone)]
pub struct Array {
    root_id: SlabId,
    address: Address,
    type_info: TypeInfo,
}

impl Array {
    /// Create an empty array under `address`.
    pub fn new<B: BlobStore>(
        storage: &mut SlabStorage<B>,
        address: Address,
        type_info: TypeInfo,
    ) -> Result<Self> {
        let root_id = storage.generate_id(address)?;
        let root = ArrayDataSlab::new_root(root_id, type_info.clone());
        storage.store(root.into());
        Ok(Self {
            root_id,
            address,
            type_info,
        })
    }

    /// Re-open an array from its root id.
    pub fn open<B: BlobStore>(storage: &mut SlabStorage<B>, root_id: SlabId) -> Result<Self> {
        let slab = storage.retrieve_slab(root_id)?;
        let (extra, kind_name) = match &slab {
            Slab::ArrayData(s) => (s.extra.clone(), "array data slab"),
            Slab::ArrayMeta(s) => (s.extra.clone(), "array meta slab"),
            other => {
                return Err(CanopyError::TypeInfoMismatch {
                    expected: "array root slab",
                    found: other.kind_name(),
                })
            }
        };
        let type_info = extra.ok_or(CanopyError::TypeInfoMismatch {
            expected: "array root slab",
            found: kind_name,
        })?;
        Ok(Self {
            root_id,
            address: root_id.address,
            type_info,
        })
    }

    pub(crate) fn from_parts(root_id: SlabId, address: Address, type_info: TypeInfo) -> Self {
        Self {
            root_id,
            address,
            type_info,
        }
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

    fn retrieve_root<B: BlobStore>(&self, storage: &mut SlabStorage<B>) -> Result<ArraySlab> {
        retrieve_array_slab(storage, self.root_id)
    }

    /// Number of elements.
    pub fn count<B: BlobStore>(&self, storage: &mut SlabStorage<B>) -> Result<u64> {
        Ok(u64::from(self.retrieve_root(storage)?.header().count))
    }

    /// The element at `index`.
    pub fn get<B: BlobStore>(
        &self,
        storage: &mut SlabStorage<B>,
        index: u64,
    ) -> Result<Storable> {
        let count = self.count(storage)?;
        if index >= count {
            return Err(CanopyError::IndexOutOfBounds { index, count });
        }
        match self.retrieve_root(storage)? {
            ArraySlab::Data(d) => Ok(d.get_local(index).clone()),
            ArraySlab::Meta(m) => m.get(storage, index),
        }
    }

    /// Replace the element at `index`, returning the old storable.
    pub fn set<B: BlobStore>(
        &mut self,
        storage: &mut SlabStorage<B>,
        index: u64,
        value: Value,
    ) -> Result<Storable> {
        let count = self.count(storage)?;
        if index >= count {
            return Err(CanopyError::IndexOutOfBounds { index, count });
        }
        let storable = storage.make_storable(self.address, value)?;
        match self.retrieve_root(storage)? {
            ArraySlab::Data(mut d) => {
                let old = d.set_local(index, storable);
                self.finalize_root_data(storage, d)?;
                Ok(old)
            }
            ArraySlab::Meta(mut m) => {
                let old = m.set(storage, index, storable)?;
                self.finalize_root_meta(storage, m)?;
                Ok(old)
            }
        }
    }

    /// Insert a value before `index`; `index == count` appends.
    pub fn insert<B: BlobStore>(
        &mut self,
        storage: &mut SlabStorage<B>,
        index: u64,
        value: Value,
    ) -> Result<()> {
        let count = self.count(storage)?;
        if index > count {
            return Err(CanopyError::IndexOutOfBounds { index, count });
        }
        let storable = storage.make_storable(self.address, value)?;
        match self.retrieve_root(storage)? {
            ArraySlab::Data(mut d) => {
                d.insert_local(index, storable);
                self.finalize_root_data(storage, d)
            }
            ArraySlab::Meta(mut m) => {
                m.insert(storage, index, storable)?;
                self.finalize_root_meta(storage, m)
            }
        }
    }

    /// Append a value.
    pub fn append<B: BlobStore>(
        &mut self,
        storage: &mut SlabStorage<B>,
        value: Value,
    ) -> Result<()> {
        let count = self.count(storage)?;
        let storable = storage.make_storable(self.address, value)?;
        match self.retrieve_root(storage)? {
            ArraySlab::Data(mut d) => {
                d.insert_local(count, storable);
                self.finalize_root_data(storage, d)
            }
            ArraySlab::Meta(mut m) => {
                m.insert(storage, count, storable)?;
                self.finalize_root_meta(storage, m)
            }
        }
    }

    /// Remove and return the element at `index`.
    ///
    /// Spilled payloads and nested containers referenced by the removed
    /// storable stay in storage; freeing them is the caller's choice,
    /// usually via [`crate::deep::deep_remove_storable`].
    pub fn remove<B: BlobStore>(
        &mut self,
        storage: &mut SlabStorage<B>,
        index: u64,
    ) -> Result<Storable> {
        let count = self.count(storage)?;
        if index >= count {
            return Err(CanopyError::IndexOutOfBounds { index, count });
        }
        match self.retrieve_root(storage)? {
            ArraySlab::Data(mut d) => {
                let removed = d.remove_local(index);
                self.finalize_root_data(storage, d)?;
                Ok(removed)
            }
            ArraySlab::Meta(mut m) => {
                let removed = m.remove(storage, index)?;
                self.finalize_root_meta(storage, m)?;
                Ok(removed)
            }
        }
    }

    fn finalize_root_data<B: BlobStore>(
        &self,
        storage: &mut SlabStorage<B>,
        root: ArrayDataSlab,
    ) -> Result<()> {
        if root.header.size > storage.config().max_threshold() {
            self.split_root_data(storage, root)
        } else {
            storage.store(root.into());
            Ok(())
        }
    }

    /// An overflowing data root becomes a meta root under the same id,
    /// with the elements redistributed into two fresh leaves.
    fn split_root_data<B: BlobStore>(
        &self,
        storage: &mut SlabStorage<B>,
        mut root: ArrayDataSlab,
    ) -> Result<()> {
        let config = storage.config();
        let type_info = root.extra.take().expect("data root carries type info");
        let mut elements = std::mem::take(&mut root.elements);

        let sizes: Vec<u32> = elements.iter().map(Storable::byte_size).collect();
        let k = split_index(&sizes, ARRAY_DATA_PREFIX, &config);

        let left_id = storage.generate_id(self.address)?;
        let right_id = storage.generate_id(self.address)?;
        let right_elements = elements.split_off(k);
        let right = ArrayDataSlab::from_elements(right_id, SlabId::SENTINEL, right_elements);
        let left = ArrayDataSlab::from_elements(left_id, right_id, elements);

        let meta = ArrayMetaSlab::new(
            self.root_id,
            Some(type_info),
            vec![left.header, right.header],
        );
        storage.store(left.into());
        storage.store(right.into());
        storage.store(meta.into());
        Ok(())
    }

    fn finalize_root_meta<B: BlobStore>(
        &self,
        storage: &mut SlabStorage<B>,
        mut root: ArrayMetaSlab,
    ) -> Result<()> {
        if root.header.size > storage.config().max_threshold() {
            return self.split_root_meta(storage, root);
        }
        // Root collapse: a meta root with a single child hands the root
        // id to that child, preserving external references.
        while root.children.len() == 1 {
            let type_info = root.extra.take().expect("meta root carries type info");
            let child_id = root.children[0].id;
            let child = retrieve_array_slab(storage, child_id)?;
            storage.remove(child_id)?;
            match child {
                ArraySlab::Data(mut d) => {
                    d.header.id = self.root_id;
                    d.set_extra(Some(type_info));
                    storage.store(d.into());
                    return Ok(());
                }
                ArraySlab::Meta(mut m) => {
                    m.header.id = self.root_id;
                    m.set_extra(Some(type_info));
                    root = m;
                }
            }
        }
        storage.store(root.into());
        Ok(())
    }

    /// An overflowing meta root deepens the tree: its children move to
    /// two fresh meta slabs and the root id stays on top.
    fn split_root_meta<B: BlobStore>(
        &self,
        storage: &mut SlabStorage<B>,
        mut root: ArrayMetaSlab,
    ) -> Result<()> {
        let config = storage.config();
        let type_info = root.extra.take().expect("meta root carries type info");
        let mut children = std::mem::take(&mut root.children);

        let sizes = vec![SlabHeader::ENCODED_SIZE; children.len()];
        let k = split_index(&sizes, ARRAY_META_PREFIX, &config);

        let left_id = storage.generate_id(self.address)?;
        let right_id = storage.generate_id(self.address)?;
        let right_children = children.split_off(k);
        let right = ArrayMetaSlab::new(right_id, None, right_children);
        let left = ArrayMetaSlab::new(left_id, None, children);

        let meta = ArrayMetaSlab::new(
            self.root_id,
            Some(type_info),
            vec![left.header, right.header],
        );
        storage.store(left.into());
        storage.store(right.into());
        storage.store(meta.into());
        Ok(())
    }

    /// A lazy iterator positioned before the first element.
    pub fn iter<B: BlobStore>(&self, storage: &mut SlabStorage<B>) -> Result<ArrayIterator> {
        let mut slab = self.retrieve_root(storage)?;
        loop {
            match slab {
                ArraySlab::Data(d) => {
                    return Ok(ArrayIterator {
                        elements: d.elements,
                        pos: 0,
                        next_id: d.next,
                    })
                }
                ArraySlab::Meta(m) => {
                    slab = retrieve_array_slab(storage, m.children[0].id)?;
                }
            }
        }
    }

    /// Visit elements first to last. The callback returns `Ok(true)` to
    /// continue, `Ok(false)` to stop cleanly; errors propagate.
    pub fn iterate<B, F>(&self, storage: &mut SlabStorage<B>, mut f: F) -> Result<()>
    where
        B: BlobStore,
        F: FnMut(&Storable) -> Result<bool>,
    {
        let mut iter = self.iter(storage)?;
        while let Some(storable) = iter.next(storage)? {
            if !f(&storable)? {
                break;
            }
        }
        Ok(())
    }

    /// Drain the array last to first, handing each storable to the
    /// callback, then reset to an empty container under the same root
    /// id. Tree slabs are freed; spilled payloads and nested containers
    /// are handed to the callback to deal with.
    pub fn pop_iterate<B, F>(&mut self, storage: &mut SlabStorage<B>, mut f: F) -> Result<()>
    where
        B: BlobStore,
        F: FnMut(Storable),
    {
        let leaves = self.collect_leaves(storage)?;
        for (_, elements) in leaves.iter().rev() {
            for storable in elements.iter().rev() {
                f(storable.clone());
            }
        }

        for id in self.tree_slab_ids(storage)? {
            if id != self.root_id {
                storage.remove(id)?;
            }
        }
        let root = ArrayDataSlab::new_root(self.root_id, self.type_info.clone());
        storage.store(root.into());
        Ok(())
    }

    /// Every element, in order, as a flat vector.
    pub(crate) fn collect_elements<B: BlobStore>(
        &self,
        storage: &mut SlabStorage<B>,
    ) -> Result<Vec<Storable>> {
        let mut out = Vec::new();
        let mut iter = self.iter(storage)?;
        while let Some(storable) = iter.next(storage)? {
            out.push(storable);
        }
        Ok(out)
    }

    fn collect_leaves<B: BlobStore>(
        &self,
        storage: &mut SlabStorage<B>,
    ) -> Result<Vec<(SlabId, Vec<Storable>)>> {
        let mut slab = self.retrieve_root(storage)?;
        loop {
            match slab {
                ArraySlab::Data(d) => {
                    let mut leaves = vec![(d.header.id, d.elements)];
                    let mut next = d.next;
                    while !next.is_sentinel() {
                        match retrieve_array_slab(storage, next)? {
                            ArraySlab::Data(leaf) => {
                                leaves.push((leaf.header.id, leaf.elements));
                                next = leaf.next;
                            }
                            ArraySlab::Meta(m) => {
                                return Err(CanopyError::corrupt(
                                    m.header.id,
                                    "meta slab linked into the leaf chain",
                                ))
                            }
                        }
                    }
                    return Ok(leaves);
                }
                ArraySlab::Meta(m) => {
                    slab = retrieve_array_slab(storage, m.children[0].id)?;
                }
            }
        }
    }

    /// Ids of every slab in this array's tree proper (no spilled
    /// payloads, no nested containers).
    pub(crate) fn tree_slab_ids<B: BlobStore>(
        &self,
        storage: &mut SlabStorage<B>,
    ) -> Result<Vec<SlabId>> {
        fn walk<B: BlobStore>(
            storage: &mut SlabStorage<B>,
            id: SlabId,
            out: &mut Vec<SlabId>,
        ) -> Result<()> {
            out.push(id);
            if let ArraySlab::Meta(m) = retrieve_array_slab(storage, id)? {
                for child in &m.children {
                    walk(storage, child.id, out)?;
                }
            }
            Ok(())
        }
        let mut out = Vec::new();
        walk(storage, self.root_id, &mut out)?;
        Ok(out)
    }

    /// Number of slabs this container accounts for in storage: its tree
    /// plus spilled payloads plus nested containers, recursively.
    pub fn slab_count<B: BlobStore>(&self, storage: &mut SlabStorage<B>) -> Result<u64> {
        crate::deep::count_reachable_slabs(storage, self.root_id)
    }

    /// Rebuild this array under `new_address` with fresh ids. The
    /// encoded content matches rebuilding from the same element
    /// sequence via `new` and `append`.
    pub fn deep_copy<B: BlobStore>(
        &self,
        storage: &mut SlabStorage<B>,
        new_address: Address,
    ) -> Result<Self> {
        let elements = self.collect_elements(storage)?;
        let mut out = Self::new(storage, new_address, self.type_info.clone())?;
        for storable in elements {
            let value = crate::deep::deep_copy_storable(storage, new_address, &storable)?;
            out.append(storage, value)?;
        }
        Ok(out)
    }

    /// Free every slab reachable from this array: the tree, spilled
    /// payloads, and nested containers. Consumes the handle.
    pub fn deep_remove<B: BlobStore>(self, storage: &mut SlabStorage<B>) -> Result<()> {
        crate::deep::deep_remove_slab(storage, self.root_id)
    }
}

/// Lazy forward iterator over an array's elements.
///
/// Holds the current leaf's elements and the id of the next leaf;
/// advancing never touches meta slabs. Not restartable.
#[derive(Debug)]
pub struct ArrayIterator {
    elements: Vec<Storable>,
    pos: usize,
    next_id: SlabId,
}

impl ArrayIterator {
    /// The next element, or `None` at the end.
    pub fn next<B: BlobStore>(
        &mut self,
        storage: &mut SlabStorage<B>,
    ) -> Result<Option<Storable>> {
        loop {
            if self.pos < self.elements.len() {
                let storable = self.elements[self.pos].clone();
                self.pos += 1;
                return Ok(Some(storable));
            }
            if self.next_id.is_sentinel() {
                return Ok(None);
            }
            match retrieve_array_slab(storage, self.next_id)? {
                ArraySlab::Data(d) => {
                    self.elements = d.elements;
                    self.pos = 0;
                    self.next_id = d.next;
                }
                ArraySlab::Meta(m) => {
                    return Err(CanopyError::corrupt(
                        m.header.id,
                        "meta slab linked into the leaf chain",
                    ))
                }
            }
        }
    }
}
