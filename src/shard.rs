//! Shard routing for per-variant-day aggregates.
//!
//! History rows for one experiment always live in exactly one of `shard_count` parallel
//! tables. The shard is `stable_hash64(identity) % shard_count`, so reads and writes for
//! an experiment never split across shards.
//!
//! This is **not** a cryptographic hash and carries no cross-version bucket compatibility;
//! the only promise is "same identity, same shard" for a given `shard_count`.

use std::fmt;

use crate::{EngineError, ExperimentId};

/// Default number of aggregate tables.
pub const DEFAULT_SHARD_COUNT: u32 = 100;

/// Base name of the per-shard history tables.
pub const HISTORY_TABLE_PREFIX: &str = "variant_history";

/// Deterministic (non-crypto) stable hash.
///
/// - FNV-1a over bytes (cheap, stable across platforms)
/// - SplitMix64 finalizer (spreads FNV's weak low bits before the modulo)
#[must_use]
pub fn stable_hash64(seed: u64, s: &str) -> u64 {
    let mut h: u64 = 14695981039346656037u64;
    for b in s.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(1099511628211u64);
    }
    splitmix64(seed ^ h)
}

#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// One shard of the history tables, in `[0, shard_count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ShardLocator(u32);

impl ShardLocator {
    /// Locator for a raw shard index. Range checks happen in the router and the stores.
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn index(self) -> u32 {
        self.0
    }

    /// Name of this shard's history table, e.g. `variant_history_07`.
    pub fn table_name(self) -> String {
        format!("{HISTORY_TABLE_PREFIX}_{:02}", self.0)
    }
}

impl fmt::Display for ShardLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Maps experiment identities onto a fixed number of shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    shard_count: u32,
}

impl ShardRouter {
    /// Router over `shard_count` shards (must be at least 1).
    pub fn new(shard_count: u32) -> Result<Self, EngineError> {
        if shard_count == 0 {
            return Err(EngineError::InvalidConfig(
                "shard_count must be at least 1".to_string(),
            ));
        }
        Ok(Self { shard_count })
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// Shard for an experiment identity.
    #[must_use]
    pub fn route(&self, experiment: &ExperimentId) -> ShardLocator {
        let h = stable_hash64(0, experiment.as_str());
        ShardLocator((h % self.shard_count as u64) as u32)
    }
}

impl Default for ShardRouter {
    fn default() -> Self {
        Self {
            shard_count: DEFAULT_SHARD_COUNT,
        }
    }
}
