//! Local cache store for data persistence and offline support.
//!
//! This module provides an entity-agnostic caching mechanism that:
//! - Caches entities by id with their remote updated_at
//! - Caches ordered list results keyed by query signature
//! - Stamps every list with the time of its last successful fetch
//! - Decides staleness with a per-entity-type window

mod staleness;
mod storage;
mod traits;

pub use staleness::{default_window, is_entry_stale, is_stale, StalenessPolicy};
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use traits::{CacheEntry, Cacheable, SyncValue};
