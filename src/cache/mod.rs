//! Versioned response cache for intercepted requests.
//!
//! This module provides the caching half of the interception layer:
//! - Named, versioned buckets of request -> response entries
//! - Capture-time stamping and max-age expiration carried in the entry itself
//! - Oldest-first eviction that keeps each bucket within its entry bound
//! - Five strategies combining cache and network (cache-first, network-first,
//!   stale-while-revalidate, network-only, cache-only)

mod keys;
mod layer;
mod storage;
mod traits;

pub use keys::RequestKey;
pub use layer::CacheLayer;
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use traits::{CacheEntry, CacheResult, CacheSource, Destination, Request, Response};
