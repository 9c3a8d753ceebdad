//! Structural validation of container trees.
//!
//! Walks a container's whole slab graph and checks everything the
//! engine promises: header counts and sizes against recomputation, the
//! size envelope, sort order, reference uniqueness, leaf chain
//! integrity, and an encode → decode → re-encode byte round-trip for
//! every slab. Tests run this after every interesting operation
//! sequence; embedders can run it against suspect storage.

use crate::array::Array;
use crate::map::{GroupBody, Map, MapChildHeader, MapEntry};
use crate::slab::{Slab, SlabHeader};
use crate::storable::Storable;
use crate::storage::SlabStorage;
use canopy_error::{CanopyError, Result};
use canopy_store::BlobStore;
use canopy_types::{SlabId, StorageConfig};
use std::collections::HashSet;

/// What a validation walk saw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub data_slab_count: u64,
    pub meta_slab_count: u64,
    pub storable_slab_count: u64,
    pub collision_slab_count: u64,
    /// Tree levels from the root to the data slabs, inclusive. A
    /// single-slab container has depth one.
    pub depth: u32,
}

/// Validate an array's tree. Returns walk statistics on success.
pub fn validate_array<B: BlobStore>(
    storage: &mut SlabStorage<B>,
    array: &Array,
) -> Result<TreeStats> {
    let mut v = Validator::new(storage);
    let mut leaves = Vec::new();
    let depth = v.walk_array(array.root_id(), true, None, &mut leaves)?;
    v.check_leaf_chain(&leaves)?;
    let mut stats = v.stats;
    stats.depth = depth;
    Ok(stats)
}

/// Validate a map's tree. Returns walk statistics on success.
pub fn validate_map<B: BlobStore>(storage: &mut SlabStorage<B>, map: &Map) -> Result<TreeStats> {
    let mut v = Validator::new(storage);
    let mut leaves = Vec::new();
    let depth = v.walk_map(map.root_id(), true, None, &mut leaves)?;
    v.check_leaf_chain(&leaves)?;
    let mut stats = v.stats;
    stats.depth = depth;
    Ok(stats)
}

struct Validator<'a, B: BlobStore> {
    storage: &'a mut SlabStorage<B>,
    config: StorageConfig,
    seen: HashSet<SlabId>,
    stats: TreeStats,
}

impl<'a, B: BlobStore> Validator<'a, B> {
    fn new(storage: &'a mut SlabStorage<B>) -> Self {
        let config = storage.config();
        Self {
            storage,
            config,
            seen: HashSet::new(),
            stats: TreeStats::default(),
        }
    }

    /// Uniqueness plus the encode/decode/re-encode round-trip.
    fn check_slab(&mut self, id: SlabId) -> Result<Slab> {
        if !self.seen.insert(id) {
            return Err(CanopyError::corrupt(id, "slab referenced more than once"));
        }
        let slab = self.storage.retrieve_slab(id)?;
        let bytes = slab.encode();
        let decoded = Slab::decode(id, &bytes)?;
        if decoded.header() != slab.header() {
            return Err(CanopyError::corrupt(
                id,
                "header fields change across a decode round-trip",
            ));
        }
        let reencoded = decoded.encode();
        if reencoded != bytes {
            return Err(CanopyError::corrupt(
                id,
                "re-encoded bytes differ from the original encoding",
            ));
        }
        Ok(slab)
    }

    /// The size envelope: every slab fits the target, and non-root tree
    /// slabs stay above the minimum.
    fn check_envelope(&self, header: SlabHeader, is_root: bool) -> Result<()> {
        if header.size > self.config.max_threshold() {
            return Err(CanopyError::corrupt(
                header.id,
                format!(
                    "slab size {} exceeds the maximum threshold {}",
                    header.size,
                    self.config.max_threshold()
                ),
            ));
        }
        if !is_root && header.size < self.config.min_threshold() {
            return Err(CanopyError::corrupt(
                header.id,
                format!(
                    "non-root slab size {} below the minimum threshold {}",
                    header.size,
                    self.config.min_threshold()
                ),
            ));
        }
        Ok(())
    }

    fn check_expected(&self, actual: SlabHeader, expected: Option<SlabHeader>) -> Result<()> {
        if let Some(expected) = expected {
            if expected != actual {
                return Err(CanopyError::corrupt(
                    actual.id,
                    format!(
                        "parent records count {} size {}, child has count {} size {}",
                        expected.count, expected.size, actual.count, actual.size
                    ),
                ));
            }
        }
        Ok(())
    }

    fn check_root_marker(&self, id: SlabId, is_root: bool, has_extra: bool) -> Result<()> {
        if is_root != has_extra {
            return Err(CanopyError::corrupt(
                id,
                if has_extra {
                    "extra data on a non-root slab"
                } else {
                    "root slab without extra data"
                },
            ));
        }
        Ok(())
    }

    /// Inline values respect the inline bound; pointers resolve, and
    /// spill slabs get the full check.
    fn check_element(&mut self, owner: SlabId, element: &Storable) -> Result<()> {
        match element {
            Storable::Value(bytes) => {
                if bytes.len() as u32 > self.config.max_inline_element_size() {
                    return Err(CanopyError::corrupt(
                        owner,
                        format!(
                            "inline element of {} bytes exceeds the inline limit {}",
                            bytes.len(),
                            self.config.max_inline_element_size()
                        ),
                    ));
                }
                Ok(())
            }
            Storable::Pointer(target) => {
                let is_spill = matches!(self.storage.retrieve_slab(*target)?, Slab::Storable(_));
                if is_spill {
                    self.check_slab(*target)?;
                    self.stats.storable_slab_count += 1;
                }
                // A nested container root is validated by its own walk.
                Ok(())
            }
        }
    }

    fn check_leaf_chain(&self, leaves: &[(SlabId, SlabId)]) -> Result<()> {
        for window in leaves.windows(2) {
            let (id, next) = window[0];
            let (successor, _) = window[1];
            if next != successor {
                return Err(CanopyError::corrupt(
                    id,
                    format!("next pointer {next} does not name the successor {successor}"),
                ));
            }
        }
        if let Some(&(id, next)) = leaves.last() {
            if !next.is_sentinel() {
                return Err(CanopyError::corrupt(
                    id,
                    "rightmost leaf has a dangling next pointer",
                ));
            }
        }
        Ok(())
    }

    // -- array ----------------------------------------------------------

    fn walk_array(
        &mut self,
        id: SlabId,
        is_root: bool,
        expected: Option<SlabHeader>,
        leaves: &mut Vec<(SlabId, SlabId)>,
    ) -> Result<u32> {
        match self.check_slab(id)? {
            Slab::ArrayData(d) => {
                self.check_expected(d.header, expected)?;
                self.check_root_marker(id, is_root, d.extra.is_some())?;
                self.check_envelope(d.header, is_root)?;
                if d.header.count as usize != d.elements.len() {
                    return Err(CanopyError::corrupt(id, "element count disagrees"));
                }
                for element in &d.elements {
                    self.check_element(id, element)?;
                }
                leaves.push((d.header.id, d.next));
                self.stats.data_slab_count += 1;
                Ok(1)
            }
            Slab::ArrayMeta(m) => {
                self.check_expected(m.header, expected)?;
                self.check_root_marker(id, is_root, m.extra.is_some())?;
                self.check_envelope(m.header, is_root)?;
                if m.children.is_empty() {
                    return Err(CanopyError::corrupt(id, "meta slab with no children"));
                }
                let total: u32 = m.children.iter().map(|c| c.count).sum();
                if total != m.header.count {
                    return Err(CanopyError::corrupt(
                        id,
                        "meta count is not the sum of its children",
                    ));
                }
                let mut depth = None;
                for child in &m.children {
                    let child_depth = self.walk_array(child.id, false, Some(*child), leaves)?;
                    if *depth.get_or_insert(child_depth) != child_depth {
                        return Err(CanopyError::corrupt(id, "children at unequal depths"));
                    }
                }
                self.stats.meta_slab_count += 1;
                Ok(depth.expect("children checked non-empty") + 1)
            }
            other => Err(CanopyError::WrongSlabType {
                id,
                expected: "array slab",
                found: other.kind_name(),
            }),
        }
    }

    // -- map ------------------------------------------------------------

    fn walk_map(
        &mut self,
        id: SlabId,
        is_root: bool,
        expected: Option<MapChildHeader>,
        leaves: &mut Vec<(SlabId, SlabId)>,
    ) -> Result<u32> {
        match self.check_slab(id)? {
            Slab::MapData(d) if !d.is_collision_group() => {
                self.check_expected(d.header, expected.map(|e| e.header))?;
                self.check_root_marker(id, is_root, d.extra.is_some())?;
                self.check_envelope(d.header, is_root)?;
                if let Some(e) = expected {
                    if d.first_digest() != e.first_digest {
                        return Err(CanopyError::corrupt(
                            id,
                            "parent first-digest disagrees with the leaf",
                        ));
                    }
                }
                let total: u32 = d.entries.iter().map(MapEntry::count).sum();
                if total != d.header.count {
                    return Err(CanopyError::corrupt(
                        id,
                        "entry count is not the sum of its entries",
                    ));
                }
                self.check_map_entries(id, &d.entries, false)?;
                leaves.push((d.header.id, d.next));
                self.stats.data_slab_count += 1;
                Ok(1)
            }
            Slab::MapMeta(m) => {
                self.check_expected(m.header, expected.map(|e| e.header))?;
                self.check_root_marker(id, is_root, m.extra.is_some())?;
                self.check_envelope(m.header, is_root)?;
                if m.children.is_empty() {
                    return Err(CanopyError::corrupt(id, "meta slab with no children"));
                }
                if let Some(e) = expected {
                    if m.children[0].first_digest != e.first_digest {
                        return Err(CanopyError::corrupt(
                            id,
                            "parent first-digest disagrees with the subtree",
                        ));
                    }
                }
                for window in m.children.windows(2) {
                    if window[0].first_digest >= window[1].first_digest {
                        return Err(CanopyError::corrupt(
                            id,
                            "children not strictly ordered by first digest",
                        ));
                    }
                }
                let total: u32 = m.children.iter().map(|c| c.header.count).sum();
                if total != m.header.count {
                    return Err(CanopyError::corrupt(
                        id,
                        "meta count is not the sum of its children",
                    ));
                }
                let mut depth = None;
                for child in &m.children {
                    let child_depth =
                        self.walk_map(child.header.id, false, Some(*child), leaves)?;
                    if *depth.get_or_insert(child_depth) != child_depth {
                        return Err(CanopyError::corrupt(id, "children at unequal depths"));
                    }
                }
                self.stats.meta_slab_count += 1;
                Ok(depth.expect("children checked non-empty") + 1)
            }
            other => Err(CanopyError::WrongSlabType {
                id,
                expected: "map slab",
                found: other.kind_name(),
            }),
        }
    }

    /// Sort order and structure of one entry run. `bucket` marks a
    /// linear bucket, where pairs sort by key bytes instead of digests.
    fn check_map_entries(
        &mut self,
        owner: SlabId,
        entries: &[MapEntry],
        bucket: bool,
    ) -> Result<()> {
        let mut last_digest: Option<u64> = None;
        let mut last_key: Option<Vec<u8>> = None;

        for entry in entries {
            match entry {
                MapEntry::Pair { key, value } => {
                    if !bucket {
                        return Err(CanopyError::corrupt(
                            owner,
                            "bucket pair at a digest level",
                        ));
                    }
                    let key_bytes = key
                        .as_value_bytes()
                        .ok_or_else(|| {
                            CanopyError::corrupt(owner, "map key stored as a pointer")
                        })?
                        .to_vec();
                    if let Some(prev) = &last_key {
                        if *prev >= key_bytes {
                            return Err(CanopyError::corrupt(
                                owner,
                                "bucket pairs not strictly ordered by key bytes",
                            ));
                        }
                    }
                    last_key = Some(key_bytes);
                    self.check_element(owner, value)?;
                }
                MapEntry::Single { digest, key, value } => {
                    if bucket {
                        return Err(CanopyError::corrupt(owner, "digest entry in a bucket"));
                    }
                    self.check_digest_order(owner, &mut last_digest, *digest)?;
                    if key.as_value_bytes().is_none() {
                        return Err(CanopyError::corrupt(owner, "map key stored as a pointer"));
                    }
                    self.check_element(owner, key)?;
                    self.check_element(owner, value)?;
                }
                MapEntry::Group { digest, body } => {
                    if bucket {
                        return Err(CanopyError::corrupt(owner, "group entry in a bucket"));
                    }
                    self.check_digest_order(owner, &mut last_digest, *digest)?;
                    match body {
                        GroupBody::Inline(inner) => {
                            if inner.len() < 2 && !matches!(inner.first(), Some(MapEntry::Group { .. })) {
                                return Err(CanopyError::corrupt(
                                    owner,
                                    "inline group too small to be a group",
                                ));
                            }
                            if entry.byte_size() > self.config.collision_group_cap() {
                                return Err(CanopyError::corrupt(
                                    owner,
                                    "inline group above the externalization cap",
                                ));
                            }
                            let inner_bucket = matches!(inner.first(), Some(MapEntry::Pair { .. }));
                            self.check_map_entries(owner, inner, inner_bucket)?;
                        }
                        GroupBody::External { id, count, size } => {
                            let slab = self.check_slab(*id)?;
                            let Slab::MapData(group) = slab else {
                                return Err(CanopyError::WrongSlabType {
                                    id: *id,
                                    expected: "map collision data slab",
                                    found: slab.kind_name(),
                                });
                            };
                            if !group.is_collision_group() {
                                return Err(CanopyError::corrupt(
                                    *id,
                                    "external group entry names a regular leaf",
                                ));
                            }
                            if group.header.count != *count || group.header.size != *size {
                                return Err(CanopyError::corrupt(
                                    *id,
                                    "external group header disagrees with the parent entry",
                                ));
                            }
                            let inner_bucket =
                                matches!(group.entries.first(), Some(MapEntry::Pair { .. }));
                            self.check_map_entries(*id, &group.entries, inner_bucket)?;
                            self.stats.collision_slab_count += 1;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn check_digest_order(
        &self,
        owner: SlabId,
        last: &mut Option<u64>,
        digest: u64,
    ) -> Result<()> {
        if let Some(prev) = *last {
            if prev >= digest {
                return Err(CanopyError::corrupt(
                    owner,
                    "entries not strictly ordered by digest",
                ));
            }
        }
        *last = Some(digest);
        Ok(())
    }
}
