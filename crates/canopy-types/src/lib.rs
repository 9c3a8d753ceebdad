//! Core identifier, flag, and configuration types for canopy.
//!
//! A *slab* is the unit of persistence: a byte blob addressed by a
//! 16-byte [`SlabId`] made of an owning [`Address`] and a per-address
//! monotonically issued [`SlabIndex`]. Everything here is plain data;
//! the engine crate owns the behavior.

pub mod config;
pub mod flags;

pub use config::StorageConfig;
pub use flags::{SlabFamily, SlabKind, FLAG_EXTRA_DATA, SLAB_VERSION};

use std::fmt;

/// Size in bytes of an encoded [`Address`].
pub const ADDRESS_SIZE: usize = 8;

/// Size in bytes of an encoded [`SlabIndex`].
pub const SLAB_INDEX_SIZE: usize = 8;

/// Size in bytes of an encoded [`SlabId`].
pub const SLAB_ID_SIZE: usize = ADDRESS_SIZE + SLAB_INDEX_SIZE;

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// The 8-byte owning address of a slab.
///
/// Addresses partition the id space: every container lives under exactly
/// one address, and commit batches are atomic per address. The all-zero
/// address is reserved for the [`SlabId::SENTINEL`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct Address(pub [u8; ADDRESS_SIZE]);

impl Address {
    /// The all-zero address, reserved for the sentinel id.
    pub const ZERO: Self = Self([0; ADDRESS_SIZE]);

    /// Raw bytes of this address.
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; ADDRESS_SIZE] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex(&self.0))
    }
}

// ---------------------------------------------------------------------------
// SlabIndex
// ---------------------------------------------------------------------------

/// The 8-byte per-address slab counter value, big-endian.
///
/// Indices are issued monotonically by the storage and never reused.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct SlabIndex(pub [u8; SLAB_INDEX_SIZE]);

impl SlabIndex {
    /// The all-zero index, reserved for the sentinel id.
    pub const ZERO: Self = Self([0; SLAB_INDEX_SIZE]);

    /// Construct an index from a u64 counter value.
    #[inline]
    #[must_use]
    pub const fn from_u64(n: u64) -> Self {
        Self(n.to_be_bytes())
    }

    /// The counter value of this index.
    #[inline]
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    /// The next index in issue order.
    ///
    /// Wrapping at `u64::MAX` is a non-event in practice: an address would
    /// need to issue 2^64 slabs first.
    #[inline]
    #[must_use]
    pub const fn next(&self) -> Self {
        Self::from_u64(self.as_u64().wrapping_add(1))
    }
}

impl fmt::Display for SlabIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u64())
    }
}

// ---------------------------------------------------------------------------
// SlabId
// ---------------------------------------------------------------------------

/// The stable 16-byte identity of a slab: owning address plus issue index.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct SlabId {
    pub address: Address,
    pub index: SlabIndex,
}

impl SlabId {
    /// The all-zero sentinel id. Never issued by storage; used as the
    /// "no next slab" marker in the wire format.
    pub const SENTINEL: Self = Self {
        address: Address::ZERO,
        index: SlabIndex::ZERO,
    };

    /// Construct an id from its parts.
    #[inline]
    #[must_use]
    pub const fn new(address: Address, index: SlabIndex) -> Self {
        Self { address, index }
    }

    /// Whether this is the sentinel id.
    #[inline]
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        *self == Self::SENTINEL
    }

    /// Fixed 16-byte big-endian encoding: address then index.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; SLAB_ID_SIZE] {
        let mut out = [0u8; SLAB_ID_SIZE];
        out[..ADDRESS_SIZE].copy_from_slice(&self.address.0);
        out[ADDRESS_SIZE..].copy_from_slice(&self.index.0);
        out
    }

    /// Decode an id from its fixed 16-byte layout.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; SLAB_ID_SIZE]) -> Self {
        let mut address = [0u8; ADDRESS_SIZE];
        let mut index = [0u8; SLAB_INDEX_SIZE];
        address.copy_from_slice(&bytes[..ADDRESS_SIZE]);
        index.copy_from_slice(&bytes[ADDRESS_SIZE..]);
        Self {
            address: Address(address),
            index: SlabIndex(index),
        }
    }
}

impl fmt::Display for SlabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.address, self.index)
    }
}

// ---------------------------------------------------------------------------
// TypeInfo
// ---------------------------------------------------------------------------

/// Opaque application-level container type descriptor.
///
/// The bytes are one pre-encoded CBOR item produced by the embedder's
/// codec; the engine only stores them in root slab extra data, compares
/// them for equality, and re-emits them verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TypeInfo(Vec<u8>);

impl TypeInfo {
    /// Wrap pre-encoded type info bytes.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Encode a small unsigned integer as type info (CBOR uint).
    ///
    /// Convenience for embedders whose type ids are plain numbers; also
    /// the form used throughout the test body.
    #[must_use]
    pub fn from_u64(n: u64) -> Self {
        let mut out = Vec::with_capacity(9);
        if n < 24 {
            out.push(n as u8);
        } else if n <= u64::from(u8::MAX) {
            out.push(0x18);
            out.push(n as u8);
        } else if n <= u64::from(u16::MAX) {
            out.push(0x19);
            out.extend_from_slice(&(n as u16).to_be_bytes());
        } else if n <= u64::from(u32::MAX) {
            out.push(0x1a);
            out.extend_from_slice(&(n as u32).to_be_bytes());
        } else {
            out.push(0x1b);
            out.extend_from_slice(&n.to_be_bytes());
        }
        Self(out)
    }

    /// The raw encoded bytes.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encoded length in bytes.
    #[inline]
    #[must_use]
    pub fn byte_size(&self) -> u32 {
        self.0.len() as u32
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slab_id_byte_roundtrip() {
        let id = SlabId::new(
            Address([1, 2, 3, 4, 5, 6, 7, 8]),
            SlabIndex::from_u64(42),
        );
        let bytes = id.to_bytes();
        assert_eq!(bytes[..8], [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(bytes[8..], 42u64.to_be_bytes());
        assert_eq!(SlabId::from_bytes(&bytes), id);
    }

    #[test]
    fn test_sentinel_is_all_zero() {
        assert_eq!(SlabId::SENTINEL.to_bytes(), [0u8; SLAB_ID_SIZE]);
        assert!(SlabId::SENTINEL.is_sentinel());
        let real = SlabId::new(Address([0; 8]), SlabIndex::from_u64(1));
        assert!(!real.is_sentinel());
    }

    #[test]
    fn test_index_monotonic() {
        let mut idx = SlabIndex::ZERO;
        for expected in 1..=5u64 {
            idx = idx.next();
            assert_eq!(idx.as_u64(), expected);
        }
    }

    #[test]
    fn test_id_ordering_is_address_then_index() {
        let a = SlabId::new(Address([1; 8]), SlabIndex::from_u64(9));
        let b = SlabId::new(Address([2; 8]), SlabIndex::from_u64(1));
        assert!(a < b);
        let c = SlabId::new(Address([1; 8]), SlabIndex::from_u64(10));
        assert!(a < c);
    }

    #[test]
    fn test_type_info_uint_forms() {
        assert_eq!(TypeInfo::from_u64(10).as_bytes(), &[0x0a]);
        assert_eq!(TypeInfo::from_u64(42).as_bytes(), &[0x18, 0x2a]);
        assert_eq!(TypeInfo::from_u64(1000).as_bytes(), &[0x19, 0x03, 0xe8]);
        assert_eq!(TypeInfo::from_u64(42).byte_size(), 2);
    }
}
