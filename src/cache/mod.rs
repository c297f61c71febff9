//! Named response caches backing the worker strategies.
//!
//! This module provides:
//! - Request-keyed response storage partitioned into named caches
//! - A versioned name set so a deploy can invalidate a whole generation
//! - Provenance tags for responses handed back to the page

mod storage;
mod traits;

pub use storage::{KeyedCache, SqliteCacheStorage};
pub use traits::{CacheNames, CachedResponse, ResponseSource};
