//! The `Map`: an ordered associative container keyed by layered
//! digests.
//!
//! Data slabs hold entries sorted by their level-0 digest. Keys whose
//! digests collide at a level form a *collision group*: a nested entry
//! run discriminated by the next digest level. Small groups live inline
//! in their parent slab; a group outgrowing the configured cap moves to
//! its own collision slab and is referenced by id. When the digester is
//! exhausted the innermost group degrades to a linear bucket ordered by
//! key bytes.
//!
//! Because equal digests always collapse into one group entry, every
//! top-level digest in the tree is unique, and meta slabs can route by
//! the first digest of each child subtree alone.
//!
//! Structural maintenance (split, merge, borrow) and root id stability
//! work exactly as for [`crate::array`]; split points fall on entry
//! boundaries, so a collision group is never divided across slabs.

use crate::array::split_index;
use crate::cbor;
use crate::digest::{check_digester_levels, Digester, DigesterBuilder};
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
use std::rc::Rc;

/// Fixed prefix of a non-root map data slab: version, flag, next id,
/// entry count head.
pub(crate) const MAP_DATA_PREFIX: u32 =
    VERSION_AND_FLAG_SIZE + SLAB_ID_SIZE as u32 + cbor::ARRAY_HEAD16_SIZE;

/// Fixed prefix of a collision slab: version, flag, level byte, entry
/// count head.
pub(crate) const MAP_COLLISION_PREFIX: u32 =
    VERSION_AND_FLAG_SIZE + 1 + cbor::ARRAY_HEAD16_SIZE;

/// Fixed prefix of a non-root map meta slab: version, flag, child
/// count.
pub(crate) const MAP_META_PREFIX: u32 = VERSION_AND_FLAG_SIZE + 2;

/// Encoded size of one map meta child entry: first digest, id, count,
/// size.
pub(crate) const MAP_META_CHILD_SIZE: u32 = 8 + SLAB_ID_SIZE as u32 + 4 + 4;

/// Child counts below this are routed by linear scan; at or above it,
/// binary search.
const BINARY_SEARCH_MIN_CHILDREN: usize = 8;

const SINGLE_OVERHEAD: u32 = 1 + cbor::FIXED_U64_SIZE;
const PAIR_OVERHEAD: u32 = 1;
const INLINE_GROUP_OVERHEAD: u32 = 2 + 1 + cbor::FIXED_U64_SIZE + cbor::ARRAY_HEAD16_SIZE;
const EXTERNAL_GROUP_ENTRY_SIZE: u32 =
    2 + 1 + cbor::FIXED_U64_SIZE + 1 + SLAB_ID_SIZE as u32 + 2 * cbor::FIXED_U32_SIZE;

/// CBOR tag number marking an inline collision group entry.
const INLINE_GROUP_TAG: u8 = 0xfd;
/// CBOR tag number marking an external collision group entry.
const EXTERNAL_GROUP_TAG: u8 = 0xfe;

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// One entry in a map data slab, at some digest level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MapEntry {
    /// A key/value pair discriminated by its digest at this level.
    Single {
        digest: u64,
        key: Storable,
        value: Storable,
    },
    /// A key/value pair in a linear bucket, past digester exhaustion.
    Pair { key: Storable, value: Storable },
    /// All entries sharing `digest` at this level, discriminated one
    /// level deeper.
    Group { digest: u64, body: GroupBody },
}

/// Where a collision group's entries live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum GroupBody {
    Inline(Vec<MapEntry>),
    External { id: SlabId, count: u32, size: u32 },
}

impl MapEntry {
    pub(crate) fn byte_size(&self) -> u32 {
        match self {
            Self::Single { key, value, .. } => {
                SINGLE_OVERHEAD + key.byte_size() + value.byte_size()
            }
            Self::Pair { key, value } => PAIR_OVERHEAD + key.byte_size() + value.byte_size(),
            Self::Group { body, .. } => match body {
                GroupBody::Inline(inner) => {
                    INLINE_GROUP_OVERHEAD + inner.iter().map(Self::byte_size).sum::<u32>()
                }
                GroupBody::External { .. } => EXTERNAL_GROUP_ENTRY_SIZE,
            },
        }
    }

    /// Digest at this entry's level. Bucket pairs carry none.
    pub(crate) fn digest(&self) -> Option<u64> {
        match self {
            Self::Single { digest, .. } | Self::Group { digest, .. } => Some(*digest),
            Self::Pair { .. } => None,
        }
    }

    /// Number of key/value pairs under this entry, recursively.
    pub(crate) fn count(&self) -> u32 {
        match self {
            Self::Single { .. } | Self::Pair { .. } => 1,
            Self::Group { body, .. } => match body {
                GroupBody::Inline(inner) => inner.iter().map(Self::count).sum(),
                GroupBody::External { count, .. } => *count,
            },
        }
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::Single { digest, key, value } => {
                out.push(0x83);
                cbor::write_u64_fixed(out, *digest);
                key.encode(out);
                value.encode(out);
            }
            Self::Pair { key, value } => {
                out.push(0x82);
                key.encode(out);
                value.encode(out);
            }
            Self::Group { digest, body } => match body {
                GroupBody::Inline(inner) => {
                    out.push(0xd8);
                    out.push(INLINE_GROUP_TAG);
                    out.push(0x82);
                    cbor::write_u64_fixed(out, *digest);
                    cbor::write_array_head16(out, inner.len() as u16);
                    for entry in inner {
                        entry.encode(out);
                    }
                }
                GroupBody::External { id, count, size } => {
                    out.push(0xd8);
                    out.push(EXTERNAL_GROUP_TAG);
                    out.push(0x84);
                    cbor::write_u64_fixed(out, *digest);
                    out.push(0x50);
                    out.extend_from_slice(&id.to_bytes());
                    cbor::write_u32_fixed(out, *count);
                    cbor::write_u32_fixed(out, *size);
                }
            },
        }
    }

    pub(crate) fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        match *buf.first()? {
            0x83 => {
                let (digest, rest) = cbor::read_u64_fixed(&buf[1..])?;
                let (key, key_used) = Storable::decode(rest)?;
                let (value, value_used) = Storable::decode(&rest[key_used..])?;
                let used = 1 + cbor::FIXED_U64_SIZE as usize + key_used + value_used;
                Some((Self::Single { digest, key, value }, used))
            }
            0x82 => {
                let (key, key_used) = Storable::decode(&buf[1..])?;
                let (value, value_used) = Storable::decode(&buf[1 + key_used..])?;
                Some((Self::Pair { key, value }, 1 + key_used + value_used))
            }
            0xd8 => match *buf.get(1)? {
                INLINE_GROUP_TAG => {
                    if *buf.get(2)? != 0x82 {
                        return None;
                    }
                    let (digest, rest) = cbor::read_u64_fixed(&buf[3..])?;
                    let (count, mut rest) = cbor::read_array_head16(rest)?;
                    let mut used =
                        3 + cbor::FIXED_U64_SIZE as usize + cbor::ARRAY_HEAD16_SIZE as usize;
                    let mut inner = Vec::with_capacity(usize::from(count));
                    for _ in 0..count {
                        let (entry, entry_used) = Self::decode(rest)?;
                        inner.push(entry);
                        rest = &rest[entry_used..];
                        used += entry_used;
                    }
                    Some((
                        Self::Group {
                            digest,
                            body: GroupBody::Inline(inner),
                        },
                        used,
                    ))
                }
                EXTERNAL_GROUP_TAG => {
                    if *buf.get(2)? != 0x84 {
                        return None;
                    }
                    let (digest, rest) = cbor::read_u64_fixed(&buf[3..])?;
                    if *rest.first()? != 0x50 || rest.len() < 1 + SLAB_ID_SIZE {
                        return None;
                    }
                    let mut raw = [0u8; SLAB_ID_SIZE];
                    raw.copy_from_slice(&rest[1..=SLAB_ID_SIZE]);
                    let id = SlabId::from_bytes(&raw);
                    let rest = &rest[1 + SLAB_ID_SIZE..];
                    let (count, rest) = cbor::read_u32_fixed(rest)?;
                    let (size, _) = cbor::read_u32_fixed(rest)?;
                    Some((
                        Self::Group {
                            digest,
                            body: GroupBody::External { id, count, size },
                        },
                        EXTERNAL_GROUP_ENTRY_SIZE as usize,
                    ))
                }
                _ => None,
            },
            _ => None,
        }
    }
}

/// Key bytes of a `Single` or `Pair` entry. Map keys are always stored
/// inline; a pointer key is corruption.
fn entry_key_bytes(entry: &MapEntry) -> Result<&[u8]> {
    let key = match entry {
        MapEntry::Single { key, .. } | MapEntry::Pair { key, .. } => key,
        MapEntry::Group { .. } => {
            return Err(CanopyError::corrupt(
                SlabId::SENTINEL,
                "expected a key-bearing map entry",
            ))
        }
    };
    key.as_value_bytes().ok_or_else(|| {
        CanopyError::corrupt(SlabId::SENTINEL, "map key stored as a pointer")
    })
}

fn search_by_digest(entries: &[MapEntry], digest: u64) -> std::result::Result<usize, usize> {
    // A bucket pair at a digest level is corruption; sort it last so the
    // caller's entry inspection reports it instead of a panic here.
    entries.binary_search_by(|e| e.digest().unwrap_or(u64::MAX).cmp(&digest))
}

// ---------------------------------------------------------------------------
// Entry-run operations, shared by regular and collision slabs
// ---------------------------------------------------------------------------

pub(crate) struct SetOutcome {
    pub(crate) old: Option<Storable>,
    pub(crate) size_delta: i64,
    pub(crate) count_delta: u32,
}

pub(crate) struct RemoveOutcome {
    pub(crate) removed: Option<(Storable, Storable)>,
    pub(crate) size_delta: i64,
    pub(crate) count_delta: u32,
}

/// Build the nested entry run for two keys colliding at `level - 1`.
/// Descends as long as the digests keep colliding, ending in a linear
/// bucket at digester exhaustion.
fn make_group_entries(
    levels: u32,
    level: u32,
    first: (Storable, Storable, &mut dyn Digester),
    second: (Storable, Storable, &mut dyn Digester),
) -> Result<Vec<MapEntry>> {
    let (k1, v1, d1) = first;
    let (k2, v2, d2) = second;

    if level >= levels {
        let mut pair1 = MapEntry::Pair { key: k1, value: v1 };
        let mut pair2 = MapEntry::Pair { key: k2, value: v2 };
        if entry_key_bytes(&pair1)? > entry_key_bytes(&pair2)? {
            std::mem::swap(&mut pair1, &mut pair2);
        }
        return Ok(vec![pair1, pair2]);
    }

    let a = d1.digest_at(level)?;
    let b = d2.digest_at(level)?;
    if a == b {
        let inner = make_group_entries(levels, level + 1, (k1, v1, d1), (k2, v2, d2))?;
        return Ok(vec![MapEntry::Group {
            digest: a,
            body: GroupBody::Inline(inner),
        }]);
    }

    let entry1 = MapEntry::Single {
        digest: a,
        key: k1,
        value: v1,
    };
    let entry2 = MapEntry::Single {
        digest: b,
        key: k2,
        value: v2,
    };
    Ok(if a < b {
        vec![entry1, entry2]
    } else {
        vec![entry2, entry1]
    })
}

#[allow(clippy::too_many_arguments)]
fn entries_set<B: BlobStore>(
    storage: &mut SlabStorage<B>,
    builder: &dyn DigesterBuilder,
    digester: &mut dyn Digester,
    level: u32,
    entries: &mut Vec<MapEntry>,
    key_bytes: &[u8],
    key: Storable,
    value: Storable,
    owner: SlabId,
) -> Result<SetOutcome> {
    // Past the last digest level: linear bucket ordered by key bytes.
    if level >= digester.levels() {
        for i in 0..entries.len() {
            let existing = entry_key_bytes(&entries[i])?;
            if existing == key_bytes {
                let MapEntry::Pair { value: slot, .. } = &mut entries[i] else {
                    return Err(CanopyError::corrupt(owner, "non-pair entry in bucket"));
                };
                let old = std::mem::replace(slot, value);
                let new_size = slot.byte_size();
                return Ok(SetOutcome {
                    size_delta: i64::from(new_size) - i64::from(old.byte_size()),
                    old: Some(old),
                    count_delta: 0,
                });
            }
            if existing > key_bytes {
                let entry = MapEntry::Pair { key, value };
                let size = entry.byte_size();
                entries.insert(i, entry);
                return Ok(SetOutcome {
                    old: None,
                    size_delta: i64::from(size),
                    count_delta: 1,
                });
            }
        }
        let entry = MapEntry::Pair { key, value };
        let size = entry.byte_size();
        entries.push(entry);
        return Ok(SetOutcome {
            old: None,
            size_delta: i64::from(size),
            count_delta: 1,
        });
    }

    let digest = digester.digest_at(level)?;
    let i = match search_by_digest(entries, digest) {
        Err(i) => {
            let entry = MapEntry::Single { digest, key, value };
            let size = entry.byte_size();
            entries.insert(i, entry);
            return Ok(SetOutcome {
                old: None,
                size_delta: i64::from(size),
                count_delta: 1,
            });
        }
        Ok(i) => i,
    };

    let before = i64::from(entries[i].byte_size());
    let (mut replacement, old, count_delta) = match entries.remove(i) {
        MapEntry::Pair { .. } => {
            return Err(CanopyError::corrupt(owner, "bucket pair at a digest level"));
        }
        MapEntry::Single {
            digest: d,
            key: existing_key,
            value: existing_value,
        } => {
            let existing_bytes = existing_key
                .as_value_bytes()
                .ok_or_else(|| CanopyError::corrupt(owner, "map key stored as a pointer"))?
                .to_vec();
            if existing_bytes == key_bytes {
                (
                    MapEntry::Single {
                        digest: d,
                        key: existing_key,
                        value,
                    },
                    Some(existing_value),
                    0,
                )
            } else {
                // First collision at this digest: nest one level deeper.
                let mut existing_digester = builder.digest(&existing_bytes);
                let inner = make_group_entries(
                    digester.levels(),
                    level + 1,
                    (existing_key, existing_value, existing_digester.as_mut()),
                    (key, value, digester),
                )?;
                (
                    MapEntry::Group {
                        digest: d,
                        body: GroupBody::Inline(inner),
                    },
                    None,
                    1,
                )
            }
        }
        MapEntry::Group { digest: d, mut body } => {
            let inner_outcome = match &mut body {
                GroupBody::Inline(inner) => entries_set(
                    storage, builder, digester, level + 1, inner, key_bytes, key, value, owner,
                )?,
                GroupBody::External { id, count, size } => {
                    let mut slab = retrieve_collision_slab(storage, *id)?;
                    let out = slab.set(storage, builder, digester, key_bytes, key, value)?;
                    *count = slab.header.count;
                    *size = slab.header.size;
                    storage.store(Slab::MapData(slab));
                    out
                }
            };
            (
                MapEntry::Group { digest: d, body },
                inner_outcome.old,
                inner_outcome.count_delta,
            )
        }
    };

    maybe_externalize_group(storage, &mut replacement, owner, level + 1)?;
    let after = i64::from(replacement.byte_size());
    entries.insert(i, replacement);
    Ok(SetOutcome {
        old,
        size_delta: after - before,
        count_delta,
    })
}

/// Move an inline group that outgrew the configured cap into its own
/// collision slab. `inner_level` is the digest level of the group's
/// entries.
fn maybe_externalize_group<B: BlobStore>(
    storage: &mut SlabStorage<B>,
    entry: &mut MapEntry,
    owner: SlabId,
    inner_level: u32,
) -> Result<()> {
    let cap = storage.config().collision_group_cap();
    if entry.byte_size() <= cap {
        return Ok(());
    }
    let MapEntry::Group { body, .. } = entry else {
        return Ok(());
    };
    if matches!(body, GroupBody::External { .. }) {
        return Ok(());
    }
    let GroupBody::Inline(inner) = std::mem::replace(body, GroupBody::Inline(Vec::new()))
    else {
        unreachable!("checked inline above");
    };
    let id = storage.generate_id(owner.address)?;
    let slab = MapDataSlab::new_collision(id, inner_level, inner);
    *body = GroupBody::External {
        id,
        count: slab.header.count,
        size: slab.header.size,
    };
    storage.store(Slab::MapData(slab));
    Ok(())
}

fn entries_get<B: BlobStore>(
    storage: &mut SlabStorage<B>,
    digester: &mut dyn Digester,
    level: u32,
    entries: &[MapEntry],
    key_bytes: &[u8],
) -> Result<Option<Storable>> {
    if level >= digester.levels() {
        for entry in entries {
            if entry_key_bytes(entry)? == key_bytes {
                let MapEntry::Pair { value, .. } = entry else {
                    return Err(CanopyError::corrupt(
                        SlabId::SENTINEL,
                        "non-pair entry in bucket",
                    ));
                };
                return Ok(Some(value.clone()));
            }
        }
        return Ok(None);
    }

    let digest = digester.digest_at(level)?;
    let Ok(i) = search_by_digest(entries, digest) else {
        return Ok(None);
    };
    match &entries[i] {
        MapEntry::Pair { .. } => Err(CanopyError::corrupt(
            SlabId::SENTINEL,
            "bucket pair at a digest level",
        )),
        MapEntry::Single { key, value, .. } => {
            if key.as_value_bytes() == Some(key_bytes) {
                Ok(Some(value.clone()))
            } else {
                Ok(None)
            }
        }
        MapEntry::Group { body, .. } => match body {
            GroupBody::Inline(inner) => {
                entries_get(storage, digester, level + 1, inner, key_bytes)
            }
            GroupBody::External { id, .. } => {
                let slab = retrieve_collision_slab(storage, *id)?;
                let inner_level = slab
                    .collision_level
                    .expect("collision slab carries its level");
                entries_get(storage, digester, inner_level, &slab.entries, key_bytes)
            }
        },
    }
}

fn entries_remove<B: BlobStore>(
    storage: &mut SlabStorage<B>,
    digester: &mut dyn Digester,
    level: u32,
    entries: &mut Vec<MapEntry>,
    key_bytes: &[u8],
    owner: SlabId,
) -> Result<RemoveOutcome> {
    let absent = RemoveOutcome {
        removed: None,
        size_delta: 0,
        count_delta: 0,
    };

    if level >= digester.levels() {
        for i in 0..entries.len() {
            if entry_key_bytes(&entries[i])? == key_bytes {
                let size = entries[i].byte_size();
                let MapEntry::Pair { key, value } = entries.remove(i) else {
                    return Err(CanopyError::corrupt(owner, "non-pair entry in bucket"));
                };
                return Ok(RemoveOutcome {
                    removed: Some((key, value)),
                    size_delta: -i64::from(size),
                    count_delta: 1,
                });
            }
        }
        return Ok(absent);
    }

    let digest = digester.digest_at(level)?;
    let Ok(i) = search_by_digest(entries, digest) else {
        return Ok(absent);
    };

    let before = i64::from(entries[i].byte_size());
    match &entries[i] {
        MapEntry::Pair { .. } => {
            return Err(CanopyError::corrupt(owner, "bucket pair at a digest level"));
        }
        MapEntry::Single { key, .. } => {
            if key.as_value_bytes() != Some(key_bytes) {
                return Ok(absent);
            }
            let MapEntry::Single { key, value, .. } = entries.remove(i) else {
                unreachable!("matched a single above");
            };
            return Ok(RemoveOutcome {
                removed: Some((key, value)),
                size_delta: -before,
                count_delta: 1,
            });
        }
        MapEntry::Group { .. } => {}
    }

    let MapEntry::Group {
        digest: group_digest,
        mut body,
    } = entries.remove(i)
    else {
        unreachable!("matched a group above");
    };

    let inner_outcome = match &mut body {
        GroupBody::Inline(inner) => {
            entries_remove(storage, digester, level + 1, inner, key_bytes, owner)?
        }
        GroupBody::External { id, count, size } => {
            let mut slab = retrieve_collision_slab(storage, *id)?;
            let out = slab.remove(storage, digester, key_bytes)?;
            *count = slab.header.count;
            *size = slab.header.size;
            storage.store(Slab::MapData(slab));
            out
        }
    };

    // Normalize the group: drop it when emptied, re-inline a last
    // surviving pair under the group's digest.
    let replacement: Option<MapEntry> = match body {
        GroupBody::Inline(mut inner) => {
            if inner.is_empty() {
                None
            } else if inner.len() == 1
                && matches!(inner[0], MapEntry::Single { .. } | MapEntry::Pair { .. })
            {
                let (key, value) = take_key_value(inner.remove(0));
                Some(MapEntry::Single {
                    digest: group_digest,
                    key,
                    value,
                })
            } else {
                Some(MapEntry::Group {
                    digest: group_digest,
                    body: GroupBody::Inline(inner),
                })
            }
        }
        GroupBody::External { id, count, size } => {
            if count == 0 {
                storage.remove(id)?;
                None
            } else if count == 1 {
                let mut slab = retrieve_collision_slab(storage, id)?;
                if slab.entries.len() == 1
                    && matches!(
                        slab.entries[0],
                        MapEntry::Single { .. } | MapEntry::Pair { .. }
                    )
                {
                    let (key, value) = take_key_value(slab.entries.remove(0));
                    storage.remove(id)?;
                    Some(MapEntry::Single {
                        digest: group_digest,
                        key,
                        value,
                    })
                } else {
                    Some(MapEntry::Group {
                        digest: group_digest,
                        body: GroupBody::External { id, count, size },
                    })
                }
            } else {
                Some(MapEntry::Group {
                    digest: group_digest,
                    body: GroupBody::External { id, count, size },
                })
            }
        }
    };

    let after = match &replacement {
        Some(entry) => i64::from(entry.byte_size()),
        None => 0,
    };
    if let Some(entry) = replacement {
        entries.insert(i, entry);
    }
    Ok(RemoveOutcome {
        removed: inner_outcome.removed,
        size_delta: after - before,
        count_delta: inner_outcome.count_delta,
    })
}

fn take_key_value(entry: MapEntry) -> (Storable, Storable) {
    match entry {
        MapEntry::Single { key, value, .. } | MapEntry::Pair { key, value } => (key, value),
        MapEntry::Group { .. } => unreachable!("caller checked for a direct pair"),
    }
}

/// Flatten an entry run into key/value pairs in digest order, loading
/// external groups as needed.
pub(crate) fn flatten_entries<B: BlobStore>(
    storage: &mut SlabStorage<B>,
    entries: &[MapEntry],
    out: &mut Vec<(Storable, Storable)>,
) -> Result<()> {
    for entry in entries {
        match entry {
            MapEntry::Single { key, value, .. } | MapEntry::Pair { key, value } => {
                out.push((key.clone(), value.clone()));
            }
            MapEntry::Group { body, .. } => match body {
                GroupBody::Inline(inner) => flatten_entries(storage, inner, out)?,
                GroupBody::External { id, .. } => {
                    let slab = retrieve_collision_slab(storage, *id)?;
                    flatten_entries(storage, &slab.entries, out)?;
                }
            },
        }
    }
    Ok(())
}
// ---------------------------------------------------------------------------
// Map data slab
// ---------------------------------------------------------------------------

/// A leaf slab holding map entries, or an externalized collision group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapDataSlab {
    pub(crate) header: SlabHeader,
    /// Right neighbor in the leaf chain; sentinel when rightmost, root,
    /// or a collision slab.
    pub(crate) next: SlabId,
    pub(crate) extra: Option<TypeInfo>,
    /// Digest level of the entries when this slab is an externalized
    /// collision group; `None` for regular leaves (level zero).
    pub(crate) collision_level: Option<u32>,
    pub(crate) entries: Vec<MapEntry>,
}

impl MapDataSlab {
    pub(crate) fn new_root(id: SlabId, type_info: TypeInfo) -> Self {
        let mut slab = Self {
            header: SlabHeader { id, count: 0, size: 0 },
            next: SlabId::SENTINEL,
            extra: Some(type_info),
            collision_level: None,
            entries: Vec::new(),
        };
        slab.recompute();
        slab
    }

    pub(crate) fn from_entries(id: SlabId, next: SlabId, entries: Vec<MapEntry>) -> Self {
        let mut slab = Self {
            header: SlabHeader { id, count: 0, size: 0 },
            next,
            extra: None,
            collision_level: None,
            entries,
        };
        slab.recompute();
        slab
    }

    pub(crate) fn new_collision(id: SlabId, level: u32, entries: Vec<MapEntry>) -> Self {
        let mut slab = Self {
            header: SlabHeader { id, count: 0, size: 0 },
            next: SlabId::SENTINEL,
            extra: None,
            collision_level: Some(level),
            entries,
        };
        slab.recompute();
        slab
    }

    /// Whether this slab is an externalized collision group.
    #[must_use]
    pub fn is_collision_group(&self) -> bool {
        self.collision_level.is_some()
    }

    pub(crate) fn prefix_size(&self) -> u32 {
        if self.collision_level.is_some() {
            MAP_COLLISION_PREFIX
        } else {
            match &self.extra {
                Some(ti) => {
                    VERSION_AND_FLAG_SIZE + extra_data_size(ti) + cbor::ARRAY_HEAD16_SIZE
                }
                None => MAP_DATA_PREFIX,
            }
        }
    }

    pub(crate) fn recompute(&mut self) {
        self.header.count = self.entries.iter().map(MapEntry::count).sum();
        self.header.size = self.prefix_size()
            + self.entries.iter().map(MapEntry::byte_size).sum::<u32>();
    }

    pub(crate) fn set_extra(&mut self, extra: Option<TypeInfo>) {
        if extra.is_some() {
            debug_assert!(
                self.next.is_sentinel(),
                "promoting a map data slab that still has a right neighbor"
            );
            debug_assert!(self.collision_level.is_none());
        }
        self.extra = extra;
        self.recompute();
    }

    /// Level-0 digest of this slab's first entry.
    pub(crate) fn first_digest(&self) -> u64 {
        self.entries
            .first()
            .and_then(MapEntry::digest)
            .expect("map data slab under a meta is never empty")
    }

    pub(crate) fn set<B: BlobStore>(
        &mut self,
        storage: &mut SlabStorage<B>,
        builder: &dyn DigesterBuilder,
        digester: &mut dyn Digester,
        key_bytes: &[u8],
        key: Storable,
        value: Storable,
    ) -> Result<SetOutcome> {
        let level = self.collision_level.unwrap_or(0);
        let out = entries_set(
            storage,
            builder,
            digester,
            level,
            &mut self.entries,
            key_bytes,
            key,
            value,
            self.header.id,
        )?;
        self.header.size = (i64::from(self.header.size) + out.size_delta) as u32;
        self.header.count += out.count_delta;
        Ok(out)
    }

    pub(crate) fn get<B: BlobStore>(
        &self,
        storage: &mut SlabStorage<B>,
        digester: &mut dyn Digester,
        key_bytes: &[u8],
    ) -> Result<Option<Storable>> {
        let level = self.collision_level.unwrap_or(0);
        entries_get(storage, digester, level, &self.entries, key_bytes)
    }

    pub(crate) fn remove<B: BlobStore>(
        &mut self,
        storage: &mut SlabStorage<B>,
        digester: &mut dyn Digester,
        key_bytes: &[u8],
    ) -> Result<RemoveOutcome> {
        let level = self.collision_level.unwrap_or(0);
        let out = entries_remove(
            storage,
            digester,
            level,
            &mut self.entries,
            key_bytes,
            self.header.id,
        )?;
        self.header.size = (i64::from(self.header.size) + out.size_delta) as u32;
        self.header.count -= out.count_delta;
        Ok(out)
    }

    /// Split off a right half under `right_id`. Entry boundaries keep
    /// collision groups whole by construction.
    pub(crate) fn split(&mut self, right_id: SlabId, config: &StorageConfig) -> Self {
        debug_assert!(self.extra.is_none() && self.collision_level.is_none());
        let sizes: Vec<u32> = self.entries.iter().map(MapEntry::byte_size).collect();
        let k = split_index(&sizes, MAP_DATA_PREFIX, config);
        let right_entries = self.entries.split_off(k);
        let right = Self::from_entries(right_id, self.next, right_entries);
        self.next = right_id;
        self.recompute();
        right
    }

    pub(crate) fn merge(&mut self, right: Self) {
        self.entries.extend(right.entries);
        self.next = right.next;
        self.recompute();
    }

    pub(crate) fn borrow_from_right(&mut self, right: &mut Self, config: &StorageConfig) {
        let min = config.min_threshold();
        let mut take = 0;
        let mut moved = 0u32;
        while self.header.size + moved < min && take < right.entries.len() {
            moved += right.entries[take].byte_size();
            take += 1;
        }
        let tail = right.entries.split_off(take);
        let head = std::mem::replace(&mut right.entries, tail);
        self.entries.extend(head);
        self.recompute();
        right.recompute();
    }

    pub(crate) fn lend_to_right(&mut self, right: &mut Self, config: &StorageConfig) {
        let min = config.min_threshold();
        let mut keep = self.entries.len();
        let mut moved = 0u32;
        while right.header.size + moved < min && keep > 0 {
            keep -= 1;
            moved += self.entries[keep].byte_size();
        }
        let tail = self.entries.split_off(keep);
        right.entries.splice(0..0, tail);
        self.recompute();
        right.recompute();
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        if let Some(level) = self.collision_level {
            encode_version_and_flag(out, SlabKind::Data, SlabFamily::MapCollision, false);
            out.push(level as u8);
        } else {
            encode_version_and_flag(out, SlabKind::Data, SlabFamily::Map, self.extra.is_some());
            match &self.extra {
                Some(ti) => encode_extra_data(out, ti),
                None => out.extend_from_slice(&self.next.to_bytes()),
            }
        }
        cbor::write_array_head16(out, self.entries.len() as u16);
        for entry in &self.entries {
            entry.encode(out);
        }
    }

    fn decode_entries(id: SlabId, mut rest: &[u8]) -> Result<Vec<MapEntry>> {
        let (count, after) = cbor::read_array_head16(rest)
            .ok_or_else(|| CanopyError::corrupt(id, "bad entry count in map data slab"))?;
        rest = after;
        let mut entries = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let (entry, used) = MapEntry::decode(rest)
                .ok_or_else(|| CanopyError::corrupt(id, "bad map entry"))?;
            entries.push(entry);
            rest = &rest[used..];
        }
        if !rest.is_empty() {
            return Err(CanopyError::corrupt(
                id,
                "trailing bytes after map data slab entries",
            ));
        }
        Ok(entries)
    }

    pub(crate) fn decode(id: SlabId, has_extra: bool, body: &[u8]) -> Result<Self> {
        let mut rest = body;
        let mut extra = None;
        let mut next = SlabId::SENTINEL;
        if has_extra {
            let (ti, after) = decode_extra_data(rest)
                .ok_or_else(|| CanopyError::corrupt(id, "bad extra data in map data slab"))?;
            extra = Some(ti);
            rest = after;
        } else {
            if rest.len() < SLAB_ID_SIZE {
                return Err(CanopyError::corrupt(id, "map data slab missing next id"));
            }
            let mut raw = [0u8; SLAB_ID_SIZE];
            raw.copy_from_slice(&rest[..SLAB_ID_SIZE]);
            next = SlabId::from_bytes(&raw);
            rest = &rest[SLAB_ID_SIZE..];
        }
        let entries = Self::decode_entries(id, rest)?;
        let mut slab = Self {
            header: SlabHeader { id, count: 0, size: 0 },
            next,
            extra,
            collision_level: None,
            entries,
        };
        slab.recompute();
        Ok(slab)
    }

    pub(crate) fn decode_collision(id: SlabId, body: &[u8]) -> Result<Self> {
        let Some((&level, rest)) = body.split_first() else {
            return Err(CanopyError::corrupt(id, "collision slab missing level byte"));
        };
        let entries = Self::decode_entries(id, rest)?;
        let mut slab = Self {
            header: SlabHeader { id, count: 0, size: 0 },
            next: SlabId::SENTINEL,
            extra: None,
            collision_level: Some(u32::from(level)),
            entries,
        };
        slab.recompute();
        Ok(slab)
    }
}

/// Retrieve a slab expected to be an externalized collision group.
fn retrieve_collision_slab<B: BlobStore>(
    storage: &mut SlabStorage<B>,
    id: SlabId,
) -> Result<MapDataSlab> {
    match storage.retrieve_slab(id)? {
        Slab::MapData(s) if s.is_collision_group() => Ok(s),
        other => Err(CanopyError::WrongSlabType {
            id,
            expected: "map collision data slab",
            found: other.kind_name(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Map meta slab
// ---------------------------------------------------------------------------

/// Child summary in a map meta slab: the subtree's routing digest plus
/// the plain header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapChildHeader {
    pub(crate) first_digest: u64,
    pub(crate) header: SlabHeader,
}

/// An interior slab routing by first digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapMetaSlab {
    pub(crate) header: SlabHeader,
    pub(crate) extra: Option<TypeInfo>,
    pub(crate) children: Vec<MapChildHeader>,
}

impl MapMetaSlab {
    pub(crate) fn new(
        id: SlabId,
        extra: Option<TypeInfo>,
        children: Vec<MapChildHeader>,
    ) -> Self {
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
            Some(ti) => MAP_META_PREFIX + extra_data_size(ti),
            None => MAP_META_PREFIX,
        }
    }

    pub(crate) fn recompute(&mut self) {
        self.header.count = self.children.iter().map(|c| c.header.count).sum();
        self.header.size =
            self.prefix_size() + MAP_META_CHILD_SIZE * self.children.len() as u32;
    }

    pub(crate) fn set_extra(&mut self, extra: Option<TypeInfo>) {
        self.extra = extra;
        self.recompute();
    }

    pub(crate) fn first_digest(&self) -> u64 {
        self.children
            .first()
            .expect("map meta slab is never empty")
            .first_digest
    }

    /// Greatest child whose first digest does not exceed the lookup
    /// digest; the first child when every digest does. Linear scan for
    /// small fan-out, binary search above.
    fn locate(&self, digest: u64) -> usize {
        if self.children.len() < BINARY_SEARCH_MIN_CHILDREN {
            let mut found = 0;
            for (i, child) in self.children.iter().enumerate().skip(1) {
                if child.first_digest <= digest {
                    found = i;
                } else {
                    break;
                }
            }
            found
        } else {
            self.children
                .partition_point(|c| c.first_digest <= digest)
                .saturating_sub(1)
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn set<B: BlobStore>(
        &mut self,
        storage: &mut SlabStorage<B>,
        builder: &dyn DigesterBuilder,
        digester: &mut dyn Digester,
        digest0: u64,
        key_bytes: &[u8],
        key: Storable,
        value: Storable,
    ) -> Result<SetOutcome> {
        let i = self.locate(digest0);
        let mut child = retrieve_map_slab(storage, self.children[i].header.id)?;
        let out = match &mut child {
            MapSlab::Data(d) => d.set(storage, builder, digester, key_bytes, key, value)?,
            MapSlab::Meta(m) => {
                m.set(storage, builder, digester, digest0, key_bytes, key, value)?
            }
        };
        self.finalize_child(storage, i, child)?;
        Ok(out)
    }

    pub(crate) fn remove<B: BlobStore>(
        &mut self,
        storage: &mut SlabStorage<B>,
        digester: &mut dyn Digester,
        digest0: u64,
        key_bytes: &[u8],
    ) -> Result<RemoveOutcome> {
        let i = self.locate(digest0);
        let mut child = retrieve_map_slab(storage, self.children[i].header.id)?;
        let out = match &mut child {
            MapSlab::Data(d) => d.remove(storage, digester, key_bytes)?,
            MapSlab::Meta(m) => m.remove(storage, digester, digest0, key_bytes)?,
        };
        self.finalize_child(storage, i, child)?;
        Ok(out)
    }

    fn finalize_child<B: BlobStore>(
        &mut self,
        storage: &mut SlabStorage<B>,
        i: usize,
        child: MapSlab,
    ) -> Result<()> {
        let config = storage.config();
        if child.header().size > config.max_threshold() {
            let (left, right) = split_map_slab(storage, child)?;
            self.children[i] = left.child_header();
            self.children.insert(i + 1, right.child_header());
            storage.store(left.into_slab());
            storage.store(right.into_slab());
        } else if child.header().size < config.min_threshold() {
            self.merge_or_rebalance_child(storage, i, child)?;
        } else {
            self.children[i] = child.child_header();
            storage.store(child.into_slab());
        }
        self.recompute();
        Ok(())
    }

    /// Underflow handling, pinned the same way as the array's:
    /// rebalance right then left when the neighbor can lend, otherwise
    /// merge, right neighbor preferred.
    fn merge_or_rebalance_child<B: BlobStore>(
        &mut self,
        storage: &mut SlabStorage<B>,
        i: usize,
        mut child: MapSlab,
    ) -> Result<()> {
        let config = storage.config();
        let max = config.max_threshold();
        let has_right = i + 1 < self.children.len();
        let has_left = i > 0;

        if has_right {
            let mut right = retrieve_map_slab(storage, self.children[i + 1].header.id)?;
            if child.can_borrow_from_right(&right, &config) {
                child.borrow_from_right(&mut right, &config)?;
                self.children[i] = child.child_header();
                self.children[i + 1] = right.child_header();
                storage.store(child.into_slab());
                storage.store(right.into_slab());
                return Ok(());
            }
        }
        if has_left {
            let mut left = retrieve_map_slab(storage, self.children[i - 1].header.id)?;
            if left.can_lend_to_right(&child, &config) {
                left.lend_to_right(&mut child, &config)?;
                self.children[i - 1] = left.child_header();
                self.children[i] = child.child_header();
                storage.store(left.into_slab());
                storage.store(child.into_slab());
                return Ok(());
            }
        }
        if has_right {
            let right = retrieve_map_slab(storage, self.children[i + 1].header.id)?;
            let right_id = right.header().id;
            child.merge(right)?;
            debug_assert!(
                child.header().size <= max,
                "merging two unlendable siblings overflowed the envelope"
            );
            storage.remove(right_id)?;
            self.children[i] = child.child_header();
            self.children.remove(i + 1);
            storage.store(child.into_slab());
            return Ok(());
        }
        if has_left {
            let mut left = retrieve_map_slab(storage, self.children[i - 1].header.id)?;
            let child_id = child.header().id;
            left.merge(child)?;
            debug_assert!(
                left.header().size <= max,
                "merging two unlendable siblings overflowed the envelope"
            );
            storage.remove(child_id)?;
            self.children[i - 1] = left.child_header();
            self.children.remove(i);
            storage.store(left.into_slab());
            return Ok(());
        }

        self.children[i] = child.child_header();
        storage.store(child.into_slab());
        Ok(())
    }

    pub(crate) fn split(&mut self, right_id: SlabId, config: &StorageConfig) -> Self {
        debug_assert!(self.extra.is_none(), "root meta slabs split at the map level");
        let sizes = vec![MAP_META_CHILD_SIZE; self.children.len()];
        let k = split_index(&sizes, MAP_META_PREFIX, config);
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
        while self.header.size + MAP_META_CHILD_SIZE * (take as u32) < min
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
            moved += MAP_META_CHILD_SIZE;
        }
        let tail = self.children.split_off(keep);
        right.children.splice(0..0, tail);
        self.recompute();
        right.recompute();
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        encode_version_and_flag(out, SlabKind::Meta, SlabFamily::Map, self.extra.is_some());
        if let Some(ti) = &self.extra {
            encode_extra_data(out, ti);
        }
        out.extend_from_slice(&(self.children.len() as u16).to_be_bytes());
        for child in &self.children {
            out.extend_from_slice(&child.first_digest.to_be_bytes());
            out.extend_from_slice(&child.header.id.to_bytes());
            out.extend_from_slice(&child.header.count.to_be_bytes());
            out.extend_from_slice(&child.header.size.to_be_bytes());
        }
    }

    pub(crate) fn decode(id: SlabId, has_extra: bool, body: &[u8]) -> Result<Self> {
        let mut rest = body;
        let mut extra = None;
        if has_extra {
            let (ti, after) = decode_extra_data(rest)
                .ok_or_else(|| CanopyError::corrupt(id, "bad extra data in map meta slab"))?;
            extra = Some(ti);
            rest = after;
        }
        if rest.len() < 2 {
            return Err(CanopyError::corrupt(id, "map meta slab missing child count"));
        }
        let count = u16::from_be_bytes([rest[0], rest[1]]);
        rest = &rest[2..];

        let entry = MAP_META_CHILD_SIZE as usize;
        if rest.len() != usize::from(count) * entry {
            return Err(CanopyError::corrupt(
                id,
                "map meta slab body length disagrees with child count",
            ));
        }
        let mut children = Vec::with_capacity(usize::from(count));
        for chunk in rest.chunks_exact(entry) {
            let first_digest = u64::from_be_bytes([
                chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
            ]);
            let mut raw = [0u8; SLAB_ID_SIZE];
            raw.copy_from_slice(&chunk[8..8 + SLAB_ID_SIZE]);
            children.push(MapChildHeader {
                first_digest,
                header: SlabHeader {
                    id: SlabId::from_bytes(&raw),
                    count: u32::from_be_bytes([chunk[24], chunk[25], chunk[26], chunk[27]]),
                    size: u32::from_be_bytes([chunk[28], chunk[29], chunk[30], chunk[31]]),
                },
            });
        }
        Ok(Self::new(id, extra, children))
    }
}

// ---------------------------------------------------------------------------
// MapSlab: data-or-meta dispatch
// ---------------------------------------------------------------------------

/// A slab participating in a map tree.
#[derive(Debug, Clone)]
pub(crate) enum MapSlab {
    Data(MapDataSlab),
    Meta(MapMetaSlab),
}

impl MapSlab {
    pub(crate) fn header(&self) -> SlabHeader {
        match self {
            Self::Data(s) => s.header,
            Self::Meta(s) => s.header,
        }
    }

    pub(crate) fn child_header(&self) -> MapChildHeader {
        MapChildHeader {
            first_digest: match self {
                Self::Data(s) => s.first_digest(),
                Self::Meta(s) => s.first_digest(),
            },
            header: self.header(),
        }
    }

    /// Whether taking leading entries from `right` leaves both slabs
    /// inside the envelope. Mirrors [`borrow_from_right`] exactly.
    ///
    /// [`borrow_from_right`]: Self::borrow_from_right
    pub(crate) fn can_borrow_from_right(&self, right: &Self, config: &StorageConfig) -> bool {
        let min = config.min_threshold();
        match (self, right) {
            (Self::Data(l), Self::Data(r)) => {
                let mut moved = 0u32;
                for entry in &r.entries {
                    if l.header.size + moved >= min {
                        break;
                    }
                    moved += entry.byte_size();
                }
                l.header.size + moved >= min && r.header.size - moved >= min
            }
            (Self::Meta(l), Self::Meta(r)) => {
                let mut take = 0u32;
                while l.header.size + MAP_META_CHILD_SIZE * take < min
                    && (take as usize) < r.children.len()
                {
                    take += 1;
                }
                let moved = MAP_META_CHILD_SIZE * take;
                l.header.size + moved >= min && r.header.size - moved >= min
            }
            _ => false,
        }
    }

    /// Whether giving trailing entries to `right` leaves both slabs
    /// inside the envelope. Mirrors [`lend_to_right`] exactly.
    ///
    /// [`lend_to_right`]: Self::lend_to_right
    pub(crate) fn can_lend_to_right(&self, right: &Self, config: &StorageConfig) -> bool {
        let min = config.min_threshold();
        match (self, right) {
            (Self::Data(l), Self::Data(r)) => {
                let mut moved = 0u32;
                for entry in l.entries.iter().rev() {
                    if r.header.size + moved >= min {
                        break;
                    }
                    moved += entry.byte_size();
                }
                r.header.size + moved >= min && l.header.size - moved >= min
            }
            (Self::Meta(l), Self::Meta(r)) => {
                let mut moved = 0u32;
                let mut keep = l.children.len();
                while r.header.size + moved < min && keep > 0 {
                    keep -= 1;
                    moved += MAP_META_CHILD_SIZE;
                }
                r.header.size + moved >= min && l.header.size - moved >= min
            }
            _ => false,
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
                l.header().id,
                format!("sibling {} is a different slab shape", r.header().id),
            )),
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
                l.header().id,
                format!("sibling {} is a different slab shape", r.header().id),
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
                l.header().id,
                format!("sibling {} is a different slab shape", r.header().id),
            )),
        }
    }

    pub(crate) fn into_slab(self) -> Slab {
        match self {
            Self::Data(s) => Slab::MapData(s),
            Self::Meta(s) => Slab::MapMeta(s),
        }
    }
}

/// Retrieve a slab expected to belong to a map tree proper (collision
/// slabs are reached through group entries, never this way).
pub(crate) fn retrieve_map_slab<B: BlobStore>(
    storage: &mut SlabStorage<B>,
    id: SlabId,
) -> Result<MapSlab> {
    match storage.retrieve_slab(id)? {
        Slab::MapData(s) if !s.is_collision_group() => Ok(MapSlab::Data(s)),
        Slab::MapMeta(s) => Ok(MapSlab::Meta(s)),
        other => Err(CanopyError::WrongSlabType {
            id,
            expected: "map slab",
            found: other.kind_name(),
        }),
    }
}

fn split_map_slab<B: BlobStore>(
    storage: &mut SlabStorage<B>,
    child: MapSlab,
) -> Result<(MapSlab, MapSlab)> {
    let config = storage.config();
    let right_id = storage.generate_id(child.header().id.address)?;
    match child {
        MapSlab::Data(mut d) => {
            let right = d.split(right_id, &config);
            Ok((MapSlab::Data(d), MapSlab::Data(right)))
        }
        MapSlab::Meta(mut m) => {
            let right = m.split(right_id, &config);
            Ok((MapSlab::Meta(m), MapSlab::Meta(right)))
        }
    }
}

// ---------------------------------------------------------------------------
// Map
// ---------------------------------------------------------------------------

/// An ordered associative container keyed by layered digests.
///
/// Keys are pre-encoded byte items compared by byte equality; they must
/// fit the inline element limit. Values may be arbitrary payloads or
/// nested containers and spill like array elements. Iteration order is
/// digest-lexicographic, which for a good digester approximates uniform
/// random order; consumers wanting key order sort externally.
#[derive(Clone)]
pub struct Map {
    root_id: SlabId,
    address: Address,
    type_info: TypeInfo,
    builder: Rc<dyn DigesterBuilder>,
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("root_id", &self.root_id)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Map {
    /// Create an empty map under `address`.
    pub fn new<B: BlobStore>(
        storage: &mut SlabStorage<B>,
        address: Address,
        type_info: TypeInfo,
        builder: Rc<dyn DigesterBuilder>,
    ) -> Result<Self> {
        check_digester_levels(builder.as_ref())?;
        let root_id = storage.generate_id(address)?;
        let root = MapDataSlab::new_root(root_id, type_info.clone());
        storage.store(Slab::MapData(root));
        Ok(Self {
            root_id,
            address,
            type_info,
            builder,
        })
    }

    /// Re-open a map from its root id.
    pub fn open<B: BlobStore>(
        storage: &mut SlabStorage<B>,
        root_id: SlabId,
        builder: Rc<dyn DigesterBuilder>,
    ) -> Result<Self> {
        check_digester_levels(builder.as_ref())?;
        let slab = storage.retrieve_slab(root_id)?;
        let (extra, kind_name) = match &slab {
            Slab::MapData(s) if !s.is_collision_group() => (s.extra.clone(), "map data slab"),
            Slab::MapMeta(s) => (s.extra.clone(), "map meta slab"),
            other => {
                return Err(CanopyError::TypeInfoMismatch {
                    expected: "map root slab",
                    found: other.kind_name(),
                })
            }
        };
        let type_info = extra.ok_or(CanopyError::TypeInfoMismatch {
            expected: "map root slab",
            found: kind_name,
        })?;
        Ok(Self {
            root_id,
            address: root_id.address,
            type_info,
            builder,
        })
    }

    pub(crate) fn from_parts(
        root_id: SlabId,
        address: Address,
        type_info: TypeInfo,
        builder: Rc<dyn DigesterBuilder>,
    ) -> Self {
        Self {
            root_id,
            address,
            type_info,
            builder,
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

    /// The digester builder keys are routed with.
    #[must_use]
    pub fn digester_builder(&self) -> Rc<dyn DigesterBuilder> {
        Rc::clone(&self.builder)
    }

    fn retrieve_root<B: BlobStore>(&self, storage: &mut SlabStorage<B>) -> Result<MapSlab> {
        retrieve_map_slab(storage, self.root_id)
    }

    /// Number of key/value pairs.
    pub fn count<B: BlobStore>(&self, storage: &mut SlabStorage<B>) -> Result<u64> {
        Ok(u64::from(self.retrieve_root(storage)?.header().count))
    }

    /// Look up a key, returning its value storable if present.
    pub fn get<B: BlobStore>(
        &self,
        storage: &mut SlabStorage<B>,
        key: &[u8],
    ) -> Result<Option<Storable>> {
        let mut digester = self.builder.digest(key);
        let digest0 = digester.digest_at(0)?;
        let mut slab = self.retrieve_root(storage)?;
        loop {
            match slab {
                MapSlab::Data(d) => return d.get(storage, digester.as_mut(), key),
                MapSlab::Meta(m) => {
                    let i = m.locate(digest0);
                    slab = retrieve_map_slab(storage, m.children[i].header.id)?;
                }
            }
        }
    }

    /// Insert or replace a key, returning the previous value storable
    /// if the key was present.
    pub fn set<B: BlobStore>(
        &mut self,
        storage: &mut SlabStorage<B>,
        key: Vec<u8>,
        value: Value,
    ) -> Result<Option<Storable>> {
        let max_inline = storage.config().max_inline_element_size();
        if key.len() as u32 > max_inline {
            return Err(CanopyError::OverLimit {
                size: key.len() as u32,
                limit: max_inline,
            });
        }
        let value_storable = storage.make_storable(self.address, value)?;
        let key_storable = Storable::Value(key.clone());
        let mut digester = self.builder.digest(&key);
        let digest0 = digester.digest_at(0)?;

        match self.retrieve_root(storage)? {
            MapSlab::Data(mut d) => {
                let out = d.set(
                    storage,
                    self.builder.as_ref(),
                    digester.as_mut(),
                    &key,
                    key_storable,
                    value_storable,
                )?;
                self.finalize_root_data(storage, d)?;
                Ok(out.old)
            }
            MapSlab::Meta(mut m) => {
                let out = m.set(
                    storage,
                    self.builder.as_ref(),
                    digester.as_mut(),
                    digest0,
                    &key,
                    key_storable,
                    value_storable,
                )?;
                self.finalize_root_meta(storage, m)?;
                Ok(out.old)
            }
        }
    }

    /// Remove a key, returning the stored key and value storables.
    /// Absent keys return `None`, not an error.
    pub fn remove<B: BlobStore>(
        &mut self,
        storage: &mut SlabStorage<B>,
        key: &[u8],
    ) -> Result<Option<(Storable, Storable)>> {
        let mut digester = self.builder.digest(key);
        let digest0 = digester.digest_at(0)?;
        match self.retrieve_root(storage)? {
            MapSlab::Data(mut d) => {
                let out = d.remove(storage, digester.as_mut(), key)?;
                self.finalize_root_data(storage, d)?;
                Ok(out.removed)
            }
            MapSlab::Meta(mut m) => {
                let out = m.remove(storage, digester.as_mut(), digest0, key)?;
                self.finalize_root_meta(storage, m)?;
                Ok(out.removed)
            }
        }
    }

    fn finalize_root_data<B: BlobStore>(
        &self,
        storage: &mut SlabStorage<B>,
        root: MapDataSlab,
    ) -> Result<()> {
        if root.header.size > storage.config().max_threshold() {
            self.split_root_data(storage, root)
        } else {
            storage.store(Slab::MapData(root));
            Ok(())
        }
    }

    fn split_root_data<B: BlobStore>(
        &self,
        storage: &mut SlabStorage<B>,
        mut root: MapDataSlab,
    ) -> Result<()> {
        let config = storage.config();
        let type_info = root.extra.take().expect("data root carries type info");
        let mut entries = std::mem::take(&mut root.entries);

        let sizes: Vec<u32> = entries.iter().map(MapEntry::byte_size).collect();
        let k = split_index(&sizes, MAP_DATA_PREFIX, &config);

        let left_id = storage.generate_id(self.address)?;
        let right_id = storage.generate_id(self.address)?;
        let right_entries = entries.split_off(k);
        let right = MapDataSlab::from_entries(right_id, SlabId::SENTINEL, right_entries);
        let left = MapDataSlab::from_entries(left_id, right_id, entries);

        let meta = MapMetaSlab::new(
            self.root_id,
            Some(type_info),
            vec![
                MapSlab::Data(left.clone()).child_header(),
                MapSlab::Data(right.clone()).child_header(),
            ],
        );
        storage.store(Slab::MapData(left));
        storage.store(Slab::MapData(right));
        storage.store(Slab::MapMeta(meta));
        Ok(())
    }

    fn finalize_root_meta<B: BlobStore>(
        &self,
        storage: &mut SlabStorage<B>,
        mut root: MapMetaSlab,
    ) -> Result<()> {
        if root.header.size > storage.config().max_threshold() {
            return self.split_root_meta(storage, root);
        }
        while root.children.len() == 1 {
            let type_info = root.extra.take().expect("meta root carries type info");
            let child_id = root.children[0].header.id;
            let child = retrieve_map_slab(storage, child_id)?;
            storage.remove(child_id)?;
            match child {
                MapSlab::Data(mut d) => {
                    d.header.id = self.root_id;
                    d.set_extra(Some(type_info));
                    storage.store(Slab::MapData(d));
                    return Ok(());
                }
                MapSlab::Meta(mut m) => {
                    m.header.id = self.root_id;
                    m.set_extra(Some(type_info));
                    root = m;
                }
            }
        }
        storage.store(Slab::MapMeta(root));
        Ok(())
    }

    fn split_root_meta<B: BlobStore>(
        &self,
        storage: &mut SlabStorage<B>,
        mut root: MapMetaSlab,
    ) -> Result<()> {
        let config = storage.config();
        let type_info = root.extra.take().expect("meta root carries type info");
        let mut children = std::mem::take(&mut root.children);

        let sizes = vec![MAP_META_CHILD_SIZE; children.len()];
        let k = split_index(&sizes, MAP_META_PREFIX, &config);

        let left_id = storage.generate_id(self.address)?;
        let right_id = storage.generate_id(self.address)?;
        let right_children = children.split_off(k);
        let right = MapMetaSlab::new(right_id, None, right_children);
        let left = MapMetaSlab::new(left_id, None, children);

        let meta = MapMetaSlab::new(
            self.root_id,
            Some(type_info),
            vec![
                MapSlab::Meta(left.clone()).child_header(),
                MapSlab::Meta(right.clone()).child_header(),
            ],
        );
        storage.store(Slab::MapMeta(left));
        storage.store(Slab::MapMeta(right));
        storage.store(Slab::MapMeta(meta));
        Ok(())
    }

    /// A lazy iterator positioned before the first pair in digest
    /// order.
    pub fn iter<B: BlobStore>(&self, storage: &mut SlabStorage<B>) -> Result<MapIterator> {
        let mut slab = self.retrieve_root(storage)?;
        loop {
            match slab {
                MapSlab::Data(d) => {
                    let mut pairs = Vec::new();
                    flatten_entries(storage, &d.entries, &mut pairs)?;
                    return Ok(MapIterator {
                        pairs,
                        pos: 0,
                        next_id: d.next,
                    });
                }
                MapSlab::Meta(m) => {
                    slab = retrieve_map_slab(storage, m.children[0].header.id)?;
                }
            }
        }
    }

    /// Visit pairs in digest order. The callback returns `Ok(true)` to
    /// continue, `Ok(false)` to stop cleanly; errors propagate.
    pub fn iterate<B, F>(&self, storage: &mut SlabStorage<B>, mut f: F) -> Result<()>
    where
        B: BlobStore,
        F: FnMut(&Storable, &Storable) -> Result<bool>,
    {
        let mut iter = self.iter(storage)?;
        while let Some((key, value)) = iter.next(storage)? {
            if !f(&key, &value)? {
                break;
            }
        }
        Ok(())
    }

    /// Every pair in iteration order, with keys as raw bytes.
    pub(crate) fn collect_pairs<B: BlobStore>(
        &self,
        storage: &mut SlabStorage<B>,
    ) -> Result<Vec<(Vec<u8>, Storable)>> {
        let mut out = Vec::new();
        let mut iter = self.iter(storage)?;
        while let Some((key, value)) = iter.next(storage)? {
            let key_bytes = key
                .as_value_bytes()
                .ok_or_else(|| {
                    CanopyError::corrupt(self.root_id, "map key stored as a pointer")
                })?
                .to_vec();
            out.push((key_bytes, value));
        }
        Ok(out)
    }

    /// Number of slabs this container accounts for in storage.
    pub fn slab_count<B: BlobStore>(&self, storage: &mut SlabStorage<B>) -> Result<u64> {
        crate::deep::count_reachable_slabs(storage, self.root_id)
    }

    /// Rebuild this map under `new_address` with fresh ids, re-keying
    /// through the same digester builder.
    pub fn deep_copy<B: BlobStore>(
        &self,
        storage: &mut SlabStorage<B>,
        new_address: Address,
    ) -> Result<Self> {
        let pairs = self.collect_pairs(storage)?;
        let mut out = Self::new(
            storage,
            new_address,
            self.type_info.clone(),
            Rc::clone(&self.builder),
        )?;
        for (key_bytes, value_storable) in pairs {
            let value = crate::deep::deep_copy_storable(storage, new_address, &value_storable)?;
            out.set(storage, key_bytes, value)?;
        }
        Ok(out)
    }

    /// Free every slab reachable from this map. Consumes the handle.
    pub fn deep_remove<B: BlobStore>(self, storage: &mut SlabStorage<B>) -> Result<()> {
        crate::deep::deep_remove_slab(storage, self.root_id)
    }
}

/// Lazy forward iterator over a map's pairs in digest order.
///
/// Holds the current leaf flattened (collision groups expanded) and the
/// id of the next leaf. Not restartable.
#[derive(Debug)]
pub struct MapIterator {
    pairs: Vec<(Storable, Storable)>,
    pos: usize,
    next_id: SlabId,
}

impl MapIterator {
    /// The next key/value pair, or `None` at the end.
    pub fn next<B: BlobStore>(
        &mut self,
        storage: &mut SlabStorage<B>,
    ) -> Result<Option<(Storable, Storable)>> {
        loop {
            if self.pos < self.pairs.len() {
                let pair = self.pairs[self.pos].clone();
                self.pos += 1;
                return Ok(Some(pair));
            }
            if self.next_id.is_sentinel() {
                return Ok(None);
            }
            match retrieve_map_slab(storage, self.next_id)? {
                MapSlab::Data(d) => {
                    let mut pairs = Vec::new();
                    flatten_entries(storage, &d.entries, &mut pairs)?;
                    self.pairs = pairs;
                    self.pos = 0;
                    self.next_id = d.next;
                }
                MapSlab::Meta(m) => {
                    return Err(CanopyError::corrupt(
                        m.header.id,
                        "meta slab linked into the leaf chain",
                    ))
                }
            }
        }
    }
}

/// Collect every value storable and every external collision slab id
/// reachable from an entry run, for the deep operations.
pub(crate) fn flatten_group_slab_ids<B: BlobStore>(
    storage: &mut SlabStorage<B>,
    entries: &[MapEntry],
    values: &mut Vec<Storable>,
    group_ids: &mut Vec<SlabId>,
) -> Result<()> {
    for entry in entries {
        match entry {
            MapEntry::Single { value, .. } | MapEntry::Pair { value, .. } => {
                values.push(value.clone());
            }
            MapEntry::Group { body, .. } => match body {
                GroupBody::Inline(inner) => {
                    flatten_group_slab_ids(storage, inner, values, group_ids)?;
                }
                GroupBody::External { id, .. } => {
                    group_ids.push(*id);
                    let slab = retrieve_collision_slab(storage, *id)?;
                    flatten_group_slab_ids(storage, &slab.entries, values, group_ids)?;
                }
            },
        }
    }
    Ok(())
}
