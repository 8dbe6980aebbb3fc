//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::signature::QuerySignature;

/// Trait for entities that can be cached.
///
/// Implementors must provide a unique cache key and optionally an updated_at timestamp.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Unique identifier for this entity (the document id)
  fn cache_key(&self) -> String;

  /// Last modification timestamp reported by the remote store.
  fn updated_at(&self) -> Option<DateTime<Utc>>;

  /// Entity type name for storage organization (e.g., "team", "player")
  fn entity_type() -> &'static str;
}

/// Values the synchronizer can emit.
///
/// `is_empty_result` feeds the "empty implies stale" rule: an empty list is
/// always refetched regardless of its age.
pub trait SyncValue: Clone + Send + Sync + 'static {
  fn is_empty_result(&self) -> bool {
    false
  }
}

impl<T: Clone + Send + Sync + 'static> SyncValue for Vec<T> {
  fn is_empty_result(&self) -> bool {
    self.is_empty()
  }
}

/// A snapshot held by the cache store.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
  /// The cached value
  pub value: T,
  /// When the value was last written from a successful remote fetch
  pub last_fetched_at: DateTime<Utc>,
  /// Which logical query produced it
  pub signature: QuerySignature,
}

impl<T> CacheEntry<T> {
  pub fn new(value: T, last_fetched_at: DateTime<Utc>, signature: QuerySignature) -> Self {
    Self {
      value,
      last_fetched_at,
      signature,
    }
  }
}
