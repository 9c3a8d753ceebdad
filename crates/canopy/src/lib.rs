//! Scalable persistent containers over a slab-addressed, copy-on-write,
//! high-fanout B+-tree.
//!
//! canopy provides two addressable collections for deterministic
//! storage layers such as smart-contract runtimes:
//!
//! - [`Array`]: an ordered indexed sequence with O(log n) get, set,
//!   insert, and remove;
//! - [`Map`]: an ordered associative container routed by layered key
//!   digests with chained collision groups.
//!
//! Both persist as *slabs*: byte blobs bounded by a configured size
//! envelope, addressed by stable 16-byte ids, cached and batch-committed
//! by [`SlabStorage`] over any [`BlobStore`]. Equal configurations fed
//! equal operation sequences produce bit-identical persisted layouts.
//! Values may themselves be containers, referenced by id; oversized
//! elements spill to their own slabs transparently.
//!
//! ```
//! use canopy::{Address, Array, MemBlobStore, SlabStorage, StorageConfig, TypeInfo, Value};
//!
//! let mut storage = SlabStorage::new(MemBlobStore::new(), StorageConfig::default());
//! let address = Address([1, 2, 3, 4, 5, 6, 7, 8]);
//!
//! let mut array = Array::new(&mut storage, address, TypeInfo::from_u64(1))?;
//! array.append(&mut storage, Value::Bytes(vec![0x18, 0x2a]))?;
//! assert_eq!(array.count(&mut storage)?, 1);
//!
//! storage.commit()?;
//! let reopened = Array::open(&mut storage, array.root_id())?;
//! assert_eq!(reopened.count(&mut storage)?, 1);
//! # Ok::<(), canopy::CanopyError>(())
//! ```

pub mod array;
pub mod basic_array;
mod batch;
mod cbor;
pub mod deep;
pub mod digest;
pub mod map;
pub mod slab;
pub mod storable;
pub mod storage;
pub mod validate;

#[cfg(test)]
mod test_values;

#[cfg(test)]
mod map_tests;
#[cfg(test)]
mod storage_tests;

pub use array::{Array, ArrayIterator};
pub use basic_array::BasicArray;
pub use digest::{DefaultDigesterBuilder, Digester, DigesterBuilder, MIN_DIGEST_LEVELS};
pub use map::{Map, MapIterator};
pub use slab::{Slab, SlabHeader};
pub use storable::{Storable, Value};
pub use storage::SlabStorage;
pub use validate::{validate_array, validate_map, TreeStats};

pub use canopy_error::{CanopyError, Result};
pub use canopy_store::{BlobStore, MemBlobStore};
pub use canopy_types::{Address, SlabId, SlabIndex, StorageConfig, TypeInfo};
