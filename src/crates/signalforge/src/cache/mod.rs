//! Fingerprinted result cache with single-flight coalescing
//!
//! Concurrent lookups for the same [`Fingerprint`] share one producer run.
//! Completed outcomes are stored with a per-type TTL and replaced wholesale
//! once expired.

mod fingerprint;
mod store;

pub use fingerprint::Fingerprint;
pub use store::{CacheEntry, CacheSource, CacheStats, Lookup, ResultCache};
