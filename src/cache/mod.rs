//! Read caching with expiry and request deduplication.
//!
//! This module provides:
//! - A TTL cache keyed by request fingerprints
//! - At most one in-flight fetch per fingerprint, shared by every caller
//! - Capacity eviction by oldest store time
//! - Optional snapshots in a [`PersistentStore`](crate::store::PersistentStore)

mod fingerprint;
mod traits;
mod ttl;

pub use fingerprint::{fingerprint, CoachQuery};
pub use traits::{CacheEntry, CacheStats, Cacheable, Invalidate};
pub use ttl::{TtlCache, TtlCacheBuilder, DEFAULT_CAPACITY};
