//! Primary error type for canopy operations.
//!
//! Errors are plain values returned to the caller; nothing is thrown and
//! no user input panics. Internal invariant violations (a slab whose
//! recorded size disagrees with its encoding at encode time, for
//! example) are programmer errors and abort via `panic!` instead of
//! surfacing here.
//!
//! Note the deliberate absences: a map lookup or removal of an absent
//! key is `None`, not an error.

use canopy_types::SlabId;
use thiserror::Error;

/// Primary error type for canopy operations.
#[derive(Error, Debug)]
pub enum CanopyError {
    /// Array index outside the container's bounds.
    #[error("index {index} out of bounds for container of {count} elements")]
    IndexOutOfBounds { index: u64, count: u64 },

    /// A referenced slab id is absent from storage.
    #[error("slab {id} not found in storage")]
    SlabNotFound { id: SlabId },

    /// A decoded slab's kind or family does not match what its consumer
    /// expected.
    #[error("slab {id} has wrong type: expected {expected}, found {found}")]
    WrongSlabType {
        id: SlabId,
        expected: &'static str,
        found: &'static str,
    },

    /// A slab's bytes could not be decoded, or its header disagrees with
    /// its body.
    #[error("slab {id} is corrupt: {detail}")]
    Corruption { id: SlabId, detail: String },

    /// A single element is too large to store even as its own slab.
    #[error("element of {size} bytes exceeds the storable limit of {limit} bytes")]
    OverLimit { size: u32, limit: u32 },

    /// A container was opened with a root slab of an unexpected kind.
    #[error("container type mismatch: expected {expected}, found {found}")]
    TypeInfoMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// Storage or container configuration is invalid.
    #[error("invalid configuration: {detail}")]
    InvalidConfig { detail: String },

    /// A digester builder reports fewer digest levels than the map
    /// requires for collision handling.
    #[error("digester provides {got} levels, need at least {min}")]
    TooFewDigestLevels { got: u32, min: u32 },
}

impl CanopyError {
    /// Shorthand for a corruption error on a known slab.
    #[must_use]
    pub fn corrupt(id: SlabId, detail: impl Into<String>) -> Self {
        Self::Corruption {
            id,
            detail: detail.into(),
        }
    }
}

/// Result alias used across all canopy crates.
pub type Result<T> = std::result::Result<T, CanopyError>;

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_types::{Address, SlabIndex};

    #[test]
    fn test_display_messages() {
        let err = CanopyError::IndexOutOfBounds { index: 5, count: 3 };
        assert_eq!(
            err.to_string(),
            "index 5 out of bounds for container of 3 elements"
        );

        let id = SlabId::new(Address([1; 8]), SlabIndex::from_u64(2));
        let err = CanopyError::corrupt(id, "bad flag byte");
        assert!(err.to_string().contains("bad flag byte"));
        assert!(err.to_string().contains("0x0101010101010101"));
    }

    #[test]
    fn test_errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CanopyError>();
    }
}
