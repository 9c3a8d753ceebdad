//! Layered key digesting for map routing.
//!
//! Every map key gets a ladder of fixed-width 64-bit digests. Level 0
//! is a fast seeded non-cryptographic hash and routes the common case;
//! deeper levels discriminate colliding keys and come from successive
//! words of a 256-bit cryptographic hash, computed lazily so keys that
//! never collide never pay for it. Past the last level the map falls
//! back to a linear bucket keyed by byte equality, which is what makes
//! adversarial flooding degrade gracefully instead of corrupting the
//! tree.

use canopy_error::{CanopyError, Result};
use sha2::{Digest as _, Sha256};
use xxhash_rust::xxh64::xxh64;

/// Minimum number of digest levels a builder must provide: one fast
/// level plus four cryptographic words.
pub const MIN_DIGEST_LEVELS: u32 = 5;

/// Per-key digest ladder.
pub trait Digester {
    /// Number of digest levels available for this key.
    fn levels(&self) -> u32;

    /// The digest at `level`.
    ///
    /// # Panics
    ///
    /// Implementations may panic when `level >= levels()`; callers are
    /// expected to fall back to the linear bucket at exhaustion instead
    /// of asking.
    fn digest_at(&mut self, level: u32) -> Result<u64>;
}

/// Factory turning key bytes into a [`Digester`].
pub trait DigesterBuilder {
    /// Number of levels every digester from this builder provides.
    fn levels(&self) -> u32;

    /// Build the digester for one key.
    fn digest(&self, key: &[u8]) -> Box<dyn Digester>;
}

// ---------------------------------------------------------------------------
// Default implementation
// ---------------------------------------------------------------------------

/// The standard digester: seeded xxh64 at level 0, the four big-endian
/// words of `Sha256(seed_be || key)` at levels 1 through 4.
#[derive(Debug, Clone, Copy)]
pub struct DefaultDigesterBuilder {
    seed: u64,
}

impl DefaultDigesterBuilder {
    /// Build with the storage's hash seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl DigesterBuilder for DefaultDigesterBuilder {
    fn levels(&self) -> u32 {
        MIN_DIGEST_LEVELS
    }

    fn digest(&self, key: &[u8]) -> Box<dyn Digester> {
        Box::new(DefaultDigester {
            seed: self.seed,
            key: key.to_vec(),
            level0: xxh64(key, self.seed),
            crypto: None,
        })
    }
}

struct DefaultDigester {
    seed: u64,
    key: Vec<u8>,
    level0: u64,
    /// Words of the cryptographic hash, computed on first use.
    crypto: Option<[u64; 4]>,
}

impl DefaultDigester {
    fn crypto_words(&mut self) -> [u64; 4] {
        if let Some(words) = self.crypto {
            return words;
        }
        let mut hasher = Sha256::new();
        hasher.update(self.seed.to_be_bytes());
        hasher.update(&self.key);
        let digest = hasher.finalize();
        let mut words = [0u64; 4];
        for (i, word) in words.iter_mut().enumerate() {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&digest[i * 8..(i + 1) * 8]);
            *word = u64::from_be_bytes(raw);
        }
        self.crypto = Some(words);
        words
    }
}

impl Digester for DefaultDigester {
    fn levels(&self) -> u32 {
        MIN_DIGEST_LEVELS
    }

    fn digest_at(&mut self, level: u32) -> Result<u64> {
        match level {
            0 => Ok(self.level0),
            1..=4 => Ok(self.crypto_words()[(level - 1) as usize]),
            _ => panic!("digest level {level} out of range"),
        }
    }
}

/// Reject builders that cannot discriminate deeply enough.
pub(crate) fn check_digester_levels(builder: &dyn DigesterBuilder) -> Result<()> {
    let got = builder.levels();
    if got < MIN_DIGEST_LEVELS {
        return Err(CanopyError::TooFewDigestLevels {
            got,
            min: MIN_DIGEST_LEVELS,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level0_depends_on_seed() {
        let a = DefaultDigesterBuilder::new(0);
        let b = DefaultDigesterBuilder::new(1);
        let da = a.digest(b"key").digest_at(0).unwrap();
        let db = b.digest(b"key").digest_at(0).unwrap();
        assert_ne!(da, db);
    }

    #[test]
    fn test_digests_are_stable() {
        let builder = DefaultDigesterBuilder::new(42);
        let mut d1 = builder.digest(b"hello");
        let mut d2 = builder.digest(b"hello");
        for level in 0..builder.levels() {
            assert_eq!(d1.digest_at(level).unwrap(), d2.digest_at(level).unwrap());
        }
    }

    #[test]
    fn test_crypto_levels_distinct_from_level0() {
        let builder = DefaultDigesterBuilder::new(42);
        let mut d = builder.digest(b"hello");
        let d0 = d.digest_at(0).unwrap();
        let d1 = d.digest_at(1).unwrap();
        let d2 = d.digest_at(2).unwrap();
        assert_ne!(d0, d1);
        assert_ne!(d1, d2);
    }

    #[test]
    fn test_crypto_is_lazy() {
        // Nothing observable from the outside, but level 0 must work
        // without ever touching the cryptographic path.
        let builder = DefaultDigesterBuilder::new(42);
        let mut d = builder.digest(b"only level zero");
        let _ = d.digest_at(0).unwrap();
    }

    #[test]
    fn test_level_check() {
        struct Shallow;
        impl DigesterBuilder for Shallow {
            fn levels(&self) -> u32 {
                2
            }
            fn digest(&self, _key: &[u8]) -> Box<dyn Digester> {
                unimplemented!("never built in this test")
            }
        }
        let err = check_digester_levels(&Shallow).unwrap_err();
        assert!(matches!(
            err,
            CanopyError::TooFewDigestLevels { got: 2, min: 5 }
        ));
    }
}
