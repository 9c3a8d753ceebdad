//! The slab: canopy's unit of persistence.
//!
//! Every slab serializes to `version byte, flag byte, [extra data],
//! body`. The flag byte carries the slab kind (data / meta / storable)
//! and family (array / map / …); the extra-data bit marks root slabs,
//! which carry the container's opaque type info so a container can be
//! re-opened from its root id alone.
//!
//! [`Slab`] is the tagged union over the six variants. The variants'
//! element logic lives with their containers ([`crate::array`],
//! [`crate::map`], [`crate::basic_array`]); this module owns the shared
//! header type, the extra-data framing, the storable slab, and the
//! decode dispatch.

use crate::array::{ArrayDataSlab, ArrayMetaSlab};
use crate::basic_array::BasicArrayDataSlab;
use crate::cbor;
use crate::map::{MapDataSlab, MapMetaSlab};
use crate::storable::Storable;
use canopy_error::{CanopyError, Result};
use canopy_types::flags::{self, SlabFamily, SlabKind};
use canopy_types::{SlabId, TypeInfo, SLAB_VERSION};

/// Encoded size of the version and flag bytes.
pub(crate) const VERSION_AND_FLAG_SIZE: u32 = 2;

/// The in-memory summary of a slab held by its parent: identity,
/// recursive element count, and exact encoded byte length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabHeader {
    pub id: SlabId,
    pub count: u32,
    pub size: u32,
}

impl SlabHeader {
    /// Encoded size of one child header entry in an array meta slab.
    pub(crate) const ENCODED_SIZE: u32 = 24;
}

// ---------------------------------------------------------------------------
// Extra data
// ---------------------------------------------------------------------------

/// Encoded size of the extra-data section for the given type info:
/// a one-element CBOR array head plus the opaque type info item.
pub(crate) fn extra_data_size(type_info: &TypeInfo) -> u32 {
    1 + type_info.byte_size()
}

/// Append the extra-data section: `0x81` then the type info item.
pub(crate) fn encode_extra_data(out: &mut Vec<u8>, type_info: &TypeInfo) {
    out.push(0x81);
    out.extend_from_slice(type_info.as_bytes());
}

/// Read the extra-data section from the front of `buf`.
pub(crate) fn decode_extra_data(buf: &[u8]) -> Option<(TypeInfo, &[u8])> {
    let rest = buf.strip_prefix(&[0x81u8][..])?;
    let len = cbor::item_length(rest)?;
    Some((TypeInfo::from_bytes(rest[..len].to_vec()), &rest[len..]))
}

/// Append the two-byte version-and-flag prefix.
pub(crate) fn encode_version_and_flag(
    out: &mut Vec<u8>,
    kind: SlabKind,
    family: SlabFamily,
    extra: bool,
) {
    out.push(SLAB_VERSION);
    out.push(flags::make_flag(kind, family, extra));
}

// ---------------------------------------------------------------------------
// Storable slab
// ---------------------------------------------------------------------------

/// A slab holding a single oversized payload, referenced from a data
/// slab by a pointer storable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorableSlab {
    pub(crate) header: SlabHeader,
    /// Present when the spilled payload is itself a container root.
    pub(crate) extra: Option<TypeInfo>,
    pub(crate) payload: Storable,
}

impl StorableSlab {
    pub(crate) fn new(id: SlabId, payload: Storable) -> Self {
        let size = VERSION_AND_FLAG_SIZE + payload.byte_size();
        Self {
            header: SlabHeader { id, count: 1, size },
            extra: None,
            payload,
        }
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        encode_version_and_flag(
            out,
            SlabKind::Storable,
            SlabFamily::Storable,
            self.extra.is_some(),
        );
        if let Some(ti) = &self.extra {
            encode_extra_data(out, ti);
        }
        self.payload.encode(out);
    }

    pub(crate) fn decode(id: SlabId, has_extra: bool, body: &[u8]) -> Result<Self> {
        let mut rest = body;
        let mut extra = None;
        if has_extra {
            let (ti, after) = decode_extra_data(rest)
                .ok_or_else(|| CanopyError::corrupt(id, "bad extra data in storable slab"))?;
            extra = Some(ti);
            rest = after;
        }
        let (payload, used) = Storable::decode(rest)
            .ok_or_else(|| CanopyError::corrupt(id, "bad storable payload"))?;
        if used != rest.len() {
            return Err(CanopyError::corrupt(
                id,
                "trailing bytes after storable payload",
            ));
        }
        let mut size = VERSION_AND_FLAG_SIZE + payload.byte_size();
        if let Some(ti) = &extra {
            size += extra_data_size(ti);
        }
        Ok(Self {
            header: SlabHeader { id, count: 1, size },
            extra,
            payload,
        })
    }
}

// ---------------------------------------------------------------------------
// Slab
// ---------------------------------------------------------------------------

/// The tagged union over every persisted slab shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slab {
    ArrayData(ArrayDataSlab),
    ArrayMeta(ArrayMetaSlab),
    MapData(MapDataSlab),
    MapMeta(MapMetaSlab),
    Storable(StorableSlab),
    BasicArrayData(BasicArrayDataSlab),
}

impl Slab {
    /// The slab's parent-facing header.
    #[must_use]
    pub fn header(&self) -> SlabHeader {
        match self {
            Self::ArrayData(s) => s.header,
            Self::ArrayMeta(s) => s.header,
            Self::MapData(s) => s.header,
            Self::MapMeta(s) => s.header,
            Self::Storable(s) => s.header,
            Self::BasicArrayData(s) => s.header,
        }
    }

    /// The slab's id.
    #[must_use]
    pub fn id(&self) -> SlabId {
        self.header().id
    }

    /// Human-readable variant name, used in type mismatch errors.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::ArrayData(_) => "array data slab",
            Self::ArrayMeta(_) => "array meta slab",
            Self::MapData(s) => {
                if s.is_collision_group() {
                    "map collision data slab"
                } else {
                    "map data slab"
                }
            }
            Self::MapMeta(_) => "map meta slab",
            Self::Storable(_) => "storable slab",
            Self::BasicArrayData(_) => "basic array data slab",
        }
    }

    /// Serialize the slab to its wire form.
    ///
    /// Panics if the encoded length disagrees with the recorded header
    /// size: that is a bookkeeping bug, not a recoverable condition.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header().size as usize);
        match self {
            Self::ArrayData(s) => s.encode(&mut out),
            Self::ArrayMeta(s) => s.encode(&mut out),
            Self::MapData(s) => s.encode(&mut out),
            Self::MapMeta(s) => s.encode(&mut out),
            Self::Storable(s) => s.encode(&mut out),
            Self::BasicArrayData(s) => s.encode(&mut out),
        }
        assert_eq!(
            out.len(),
            self.header().size as usize,
            "slab {} encoded to {} bytes but header records {}",
            self.id(),
            out.len(),
            self.header().size,
        );
        out
    }

    /// Decode a slab from its wire form.
    pub fn decode(id: SlabId, data: &[u8]) -> Result<Self> {
        if data.len() < VERSION_AND_FLAG_SIZE as usize {
            return Err(CanopyError::corrupt(id, "slab shorter than its prefix"));
        }
        if data[0] != SLAB_VERSION {
            return Err(CanopyError::corrupt(
                id,
                format!("unsupported slab version {:#04x}", data[0]),
            ));
        }
        let flag = data[1];
        let kind = SlabKind::from_flag(flag)
            .ok_or_else(|| CanopyError::corrupt(id, format!("bad kind bits in flag {flag:#04x}")))?;
        let family = SlabFamily::from_flag(flag).ok_or_else(|| {
            CanopyError::corrupt(id, format!("bad family bits in flag {flag:#04x}"))
        })?;
        let has_extra = flags::has_extra_data(flag);
        let body = &data[2..];

        match (kind, family) {
            (SlabKind::Data, SlabFamily::Array) => {
                ArrayDataSlab::decode(id, has_extra, body).map(Self::ArrayData)
            }
            (SlabKind::Meta, SlabFamily::Array) => {
                ArrayMetaSlab::decode(id, has_extra, body).map(Self::ArrayMeta)
            }
            (SlabKind::Data, SlabFamily::Map) => {
                MapDataSlab::decode(id, has_extra, body).map(Self::MapData)
            }
            (SlabKind::Data, SlabFamily::MapCollision) => {
                MapDataSlab::decode_collision(id, body).map(Self::MapData)
            }
            (SlabKind::Meta, SlabFamily::Map) => {
                MapMetaSlab::decode(id, has_extra, body).map(Self::MapMeta)
            }
            (SlabKind::Storable, SlabFamily::Storable) => {
                StorableSlab::decode(id, has_extra, body).map(Self::Storable)
            }
            (SlabKind::Data, SlabFamily::BasicArray) => {
                BasicArrayDataSlab::decode(id, has_extra, body).map(Self::BasicArrayData)
            }
            _ => Err(CanopyError::corrupt(
                id,
                format!("flag {flag:#04x} names no defined slab shape"),
            )),
        }
    }
}

impl From<ArrayDataSlab> for Slab {
    fn from(s: ArrayDataSlab) -> Self {
        Self::ArrayData(s)
    }
}

impl From<ArrayMetaSlab> for Slab {
    fn from(s: ArrayMetaSlab) -> Self {
        Self::ArrayMeta(s)
    }
}

impl From<MapDataSlab> for Slab {
    fn from(s: MapDataSlab) -> Self {
        Self::MapData(s)
    }
}

impl From<MapMetaSlab> for Slab {
    fn from(s: MapMetaSlab) -> Self {
        Self::MapMeta(s)
    }
}

impl From<StorableSlab> for Slab {
    fn from(s: StorableSlab) -> Self {
        Self::Storable(s)
    }
}

impl From<BasicArrayDataSlab> for Slab {
    fn from(s: BasicArrayDataSlab) -> Self {
        Self::BasicArrayData(s)
    }
}
