//! Leaf payloads: inline values and cross-slab pointers.
//!
//! A [`Storable`] is what actually sits inside a data slab: either one
//! opaque, pre-encoded CBOR item, or a pointer to another slab. The
//! pointer form covers both oversized payloads spilled to their own
//! storable slab and the roots of nested containers; the distinction is
//! made by decoding the referenced slab, not by the pointer itself.
//!
//! The pointer encoding is CBOR tag 255 wrapping the 16-byte id:
//!
//! ```text
//! 0xd8 0xff 0x50 <address: 8 bytes> <index: 8 bytes>
//! ```

use crate::cbor;
use canopy_types::{SlabId, SLAB_ID_SIZE};

/// CBOR tag number marking a slab id pointer.
pub const POINTER_TAG: u8 = 0xff;

/// Encoded size of a pointer storable: two tag bytes, one byte-string
/// head, sixteen id bytes.
pub const POINTER_STORABLE_SIZE: u32 = 19;

/// A leaf payload stored in a data slab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Storable {
    /// One pre-encoded CBOR item supplied by the application codec.
    Value(Vec<u8>),
    /// A reference to another slab: an oversized payload spilled to its
    /// own storable slab, or the root of a nested container.
    Pointer(SlabId),
}

impl Storable {
    /// Exact encoded size in bytes.
    #[must_use]
    pub fn byte_size(&self) -> u32 {
        match self {
            Self::Value(bytes) => bytes.len() as u32,
            Self::Pointer(_) => POINTER_STORABLE_SIZE,
        }
    }

    /// Append the encoding of this storable to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::Value(bytes) => out.extend_from_slice(bytes),
            Self::Pointer(id) => {
                out.push(0xd8);
                out.push(POINTER_TAG);
                out.push(0x50);
                out.extend_from_slice(&id.to_bytes());
            }
        }
    }

    /// Decode one storable from the front of `buf`.
    ///
    /// Returns the storable and the number of bytes consumed, or `None`
    /// if the input is truncated or malformed.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() >= 2 && buf[0] == 0xd8 && buf[1] == POINTER_TAG {
            if buf.len() < POINTER_STORABLE_SIZE as usize || buf[2] != 0x50 {
                return None;
            }
            let mut raw = [0u8; SLAB_ID_SIZE];
            raw.copy_from_slice(&buf[3..POINTER_STORABLE_SIZE as usize]);
            let id = SlabId::from_bytes(&raw);
            return Some((Self::Pointer(id), POINTER_STORABLE_SIZE as usize));
        }
        let len = cbor::item_length(buf)?;
        Some((Self::Value(buf[..len].to_vec()), len))
    }

    /// The inline payload bytes, if this is an inline value.
    #[must_use]
    pub fn as_value_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Value(bytes) => Some(bytes),
            Self::Pointer(_) => None,
        }
    }

    /// The referenced slab id, if this is a pointer.
    #[must_use]
    pub fn as_pointer(&self) -> Option<SlabId> {
        match self {
            Self::Pointer(id) => Some(*id),
            Self::Value(_) => None,
        }
    }
}

/// A value handed to a container by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// One pre-encoded CBOR item. Spills to its own storable slab when
    /// it exceeds the configured inline limit.
    Bytes(Vec<u8>),
    /// The root of a container already living in the same storage,
    /// stored by reference.
    Container(SlabId),
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_types::{Address, SlabIndex};

    #[test]
    fn test_pointer_encoding() {
        let id = SlabId::new(
            Address([1, 2, 3, 4, 5, 6, 7, 8]),
            SlabIndex::from_u64(4),
        );
        let s = Storable::Pointer(id);
        assert_eq!(s.byte_size(), POINTER_STORABLE_SIZE);

        let mut out = Vec::new();
        s.encode(&mut out);
        assert_eq!(
            out,
            [
                0xd8, 0xff, 0x50, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x00, 0x00,
                0x00, 0x00, 0x00, 0x00, 0x00, 0x04,
            ]
        );

        let (decoded, used) = Storable::decode(&out).unwrap();
        assert_eq!(used, out.len());
        assert_eq!(decoded, s);
    }

    #[test]
    fn test_value_decode_consumes_one_item() {
        let mut buf = vec![0x18, 0x2a]; // uint 42
        buf.extend_from_slice(&[0x01]); // next item
        let (decoded, used) = Storable::decode(&buf).unwrap();
        assert_eq!(used, 2);
        assert_eq!(decoded, Storable::Value(vec![0x18, 0x2a]));
    }

    #[test]
    fn test_tagged_value_is_not_a_pointer() {
        // Tag 164 (an application value tag) must decode as an inline
        // value, not a pointer.
        let buf = [0xd8, 0xa4, 0x00];
        let (decoded, used) = Storable::decode(&buf).unwrap();
        assert_eq!(used, 3);
        assert_eq!(decoded, Storable::Value(buf.to_vec()));
    }

    #[test]
    fn test_truncated_pointer_rejected() {
        let buf = [0xd8, 0xff, 0x50, 0x01];
        assert!(Storable::decode(&buf).is_none());
    }
}
