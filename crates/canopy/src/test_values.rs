//! Shared helpers for the test body: a tiny application codec and a
//! handful of rigged digesters.
//!
//! The engine treats element payloads as opaque CBOR items; these
//! helpers play the application side, encoding unsigned integers under
//! tag 164 and strings as plain text items.

use crate::digest::{Digester, DigesterBuilder, MIN_DIGEST_LEVELS};
use crate::storage::SlabStorage;
use canopy_error::Result;
use canopy_store::MemBlobStore;
use canopy_types::{Address, StorageConfig};
use xxhash_rust::xxh64::xxh64;

pub(crate) const TEST_ADDRESS: Address = Address([1, 2, 3, 4, 5, 6, 7, 8]);
pub(crate) const OTHER_ADDRESS: Address = Address([2, 3, 4, 5, 6, 7, 8, 9]);

pub(crate) fn test_storage(target_threshold: u32) -> SlabStorage<MemBlobStore> {
    let config = StorageConfig::new(target_threshold, 0).expect("valid test threshold");
    SlabStorage::new(MemBlobStore::new(), config)
}

fn encode_uint_head(out: &mut Vec<u8>, n: u64) {
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
}

/// Encode `n` the way the test codec stores unsigned integers: CBOR tag
/// 164 around a shortest-form uint.
pub(crate) fn uint64_value(n: u64) -> Vec<u8> {
    let mut out = vec![0xd8, 0xa4];
    encode_uint_head(&mut out, n);
    out
}

/// Decode a test-codec unsigned integer.
pub(crate) fn decode_uint64_value(bytes: &[u8]) -> Option<u64> {
    let rest = bytes.strip_prefix(&[0xd8u8, 0xa4][..])?;
    match *rest.first()? {
        n @ 0..=23 => Some(u64::from(n)),
        0x18 => Some(u64::from(*rest.get(1)?)),
        0x19 => Some(u64::from(u16::from_be_bytes([*rest.get(1)?, *rest.get(2)?]))),
        0x1a => Some(u64::from(u32::from_be_bytes([
            *rest.get(1)?,
            *rest.get(2)?,
            *rest.get(3)?,
            *rest.get(4)?,
        ]))),
        0x1b => {
            let raw = rest.get(1..9)?;
            let mut arr = [0u8; 8];
            arr.copy_from_slice(raw);
            Some(u64::from_be_bytes(arr))
        }
        _ => None,
    }
}

/// Encode a string as a CBOR text item with a shortest-form head.
pub(crate) fn string_value(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() + 3);
    match bytes.len() {
        0..=23 => out.push(0x60 | bytes.len() as u8),
        24..=255 => {
            out.push(0x78);
            out.push(bytes.len() as u8);
        }
        _ => {
            out.push(0x79);
            out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        }
    }
    out.extend_from_slice(bytes);
    out
}

// ---------------------------------------------------------------------------
// Rigged digesters
// ---------------------------------------------------------------------------

/// Constant level-0 digest, distinct deeper levels: every key collides
/// once and is separated at level 1.
pub(crate) struct CollidingDigesterBuilder;

/// Constant digests at every level: all keys end up in linear buckets.
pub(crate) struct BucketDigesterBuilder;

struct RiggedDigester {
    key: Vec<u8>,
    constant_levels: u32,
}

impl Digester for RiggedDigester {
    fn levels(&self) -> u32 {
        MIN_DIGEST_LEVELS
    }

    fn digest_at(&mut self, level: u32) -> Result<u64> {
        assert!(level < self.levels(), "digest level out of range");
        if level < self.constant_levels {
            Ok(42)
        } else {
            Ok(xxh64(&self.key, u64::from(level)))
        }
    }
}

impl DigesterBuilder for CollidingDigesterBuilder {
    fn levels(&self) -> u32 {
        MIN_DIGEST_LEVELS
    }

    fn digest(&self, key: &[u8]) -> Box<dyn Digester> {
        Box::new(RiggedDigester {
            key: key.to_vec(),
            constant_levels: 1,
        })
    }
}

impl DigesterBuilder for BucketDigesterBuilder {
    fn levels(&self) -> u32 {
        MIN_DIGEST_LEVELS
    }

    fn digest(&self, key: &[u8]) -> Box<dyn Digester> {
        Box::new(RiggedDigester {
            key: key.to_vec(),
            constant_levels: MIN_DIGEST_LEVELS,
        })
    }
}

/// A builder reporting too few levels, for the construction-time check.
pub(crate) struct ShallowDigesterBuilder;

impl DigesterBuilder for ShallowDigesterBuilder {
    fn levels(&self) -> u32 {
        2
    }

    fn digest(&self, key: &[u8]) -> Box<dyn Digester> {
        Box::new(RiggedDigester {
            key: key.to_vec(),
            constant_levels: 0,
        })
    }
}
