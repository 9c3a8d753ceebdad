//! Per-storage configuration.
//!
//! The slab size envelope and the digest seed are fixed when the storage
//! is constructed and shared by every container living in it. Two
//! storages built with equal configuration and fed equal operation
//! sequences produce byte-identical slab images.

/// Default maximum slab size in bytes.
pub const DEFAULT_TARGET_THRESHOLD: u32 = 1024;

/// Smallest accepted `target_threshold`. Below this the fixed per-slab
/// prefixes dominate and the tree degenerates.
pub const MIN_TARGET_THRESHOLD: u32 = 64;

/// Hard cap on the encoded size of a single storable slab payload.
/// Elements larger than this cannot be stored at all.
pub const MAX_STORABLE_SLAB_SIZE: u32 = 1 << 20;

/// Storage-wide tuning knobs, validated at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageConfig {
    target_threshold: u32,
    hash_seed: u64,
}

impl StorageConfig {
    /// Build a configuration with the given slab size threshold and
    /// digest seed.
    ///
    /// Returns `None` if `target_threshold` is below
    /// [`MIN_TARGET_THRESHOLD`] or odd (the minimum threshold is exactly
    /// half the target, so the target must be even).
    #[must_use]
    pub const fn new(target_threshold: u32, hash_seed: u64) -> Option<Self> {
        if target_threshold < MIN_TARGET_THRESHOLD || target_threshold % 2 != 0 {
            return None;
        }
        Some(Self {
            target_threshold,
            hash_seed,
        })
    }

    /// The slab size operations aim for: bulk construction fills slabs
    /// to this size, and split points land the left half at half of it.
    #[inline]
    #[must_use]
    pub const fn target_threshold(&self) -> u32 {
        self.target_threshold
    }

    /// Hard upper bound on slab size: one and a half times the target.
    /// Slabs exceeding this split.
    ///
    /// The headroom above the target is load-bearing: with a hard bound
    /// equal to the target, a slab of eleven fixed-width child headers
    /// has no split point leaving both halves above the minimum, so the
    /// envelope could not be maintained at all.
    #[inline]
    #[must_use]
    pub const fn max_threshold(&self) -> u32 {
        self.target_threshold + self.target_threshold / 2
    }

    /// Hard lower bound on non-root slab size: half the target. Slabs
    /// dropping below this rebalance or merge.
    #[inline]
    #[must_use]
    pub const fn min_threshold(&self) -> u32 {
        self.target_threshold / 2
    }

    /// Largest element payload stored inline. Anything bigger spills to
    /// its own storable slab and is referenced by id.
    ///
    /// Keeping this at half the target guarantees a legal split boundary
    /// always exists in an overflowing slab.
    #[inline]
    #[must_use]
    pub const fn max_inline_element_size(&self) -> u32 {
        self.target_threshold / 2
    }

    /// Encoded size above which an inline map collision group is
    /// externalized into its own slab.
    #[inline]
    #[must_use]
    pub const fn collision_group_cap(&self) -> u32 {
        self.target_threshold / 2
    }

    /// Seed for the fast non-cryptographic level-0 digest.
    #[inline]
    #[must_use]
    pub const fn hash_seed(&self) -> u64 {
        self.hash_seed
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            target_threshold: DEFAULT_TARGET_THRESHOLD,
            hash_seed: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_thresholds() {
        let cfg = StorageConfig::new(1024, 7).unwrap();
        assert_eq!(cfg.target_threshold(), 1024);
        assert_eq!(cfg.max_threshold(), 1536);
        assert_eq!(cfg.min_threshold(), 512);
        assert_eq!(cfg.max_inline_element_size(), 512);
        assert_eq!(cfg.collision_group_cap(), 512);
        assert_eq!(cfg.hash_seed(), 7);
    }

    #[test]
    fn test_rejects_tiny_and_odd_thresholds() {
        assert!(StorageConfig::new(32, 0).is_none());
        assert!(StorageConfig::new(257, 0).is_none());
        assert!(StorageConfig::new(256, 0).is_some());
    }

    #[test]
    fn test_default_matches_constants() {
        let cfg = StorageConfig::default();
        assert_eq!(cfg.target_threshold(), DEFAULT_TARGET_THRESHOLD);
    }
}
