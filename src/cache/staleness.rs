//! Staleness policy: decides whether a cached value warrants a refetch.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use super::traits::{CacheEntry, SyncValue};

/// Default staleness window applied to every entity type without an override.
pub fn default_window() -> Duration {
  Duration::hours(1)
}

/// `now - last_fetched_at > window`
pub fn is_stale(last_fetched_at: DateTime<Utc>, window: Duration, now: DateTime<Utc>) -> bool {
  now - last_fetched_at > window
}

/// Staleness check for a whole cache entry. Empty results are always stale.
pub fn is_entry_stale<T: SyncValue>(
  entry: &CacheEntry<T>,
  window: Duration,
  now: DateTime<Utc>,
) -> bool {
  entry.value.is_empty_result() || is_stale(entry.last_fetched_at, window, now)
}

/// Staleness windows, one default plus per-entity-type overrides.
#[derive(Debug, Clone)]
pub struct StalenessPolicy {
  default_window: Duration,
  overrides: HashMap<String, Duration>,
}

impl Default for StalenessPolicy {
  fn default() -> Self {
    Self::new(default_window())
  }
}

impl StalenessPolicy {
  pub fn new(default_window: Duration) -> Self {
    Self {
      default_window,
      overrides: HashMap::new(),
    }
  }

  /// Use a different window for one entity type (e.g. "live_game").
  pub fn with_override(mut self, entity_type: impl Into<String>, window: Duration) -> Self {
    self.overrides.insert(entity_type.into(), window);
    self
  }

  pub fn window_for(&self, entity_type: &str) -> Duration {
    self
      .overrides
      .get(entity_type)
      .copied()
      .unwrap_or(self.default_window)
  }

  /// A cold cache, an empty result, or an entry older than the window all fetch.
  pub fn should_fetch<T: SyncValue>(
    &self,
    cached: Option<&CacheEntry<T>>,
    entity_type: &str,
    now: DateTime<Utc>,
  ) -> bool {
    match cached {
      None => true,
      Some(entry) => is_entry_stale(entry, self.window_for(entity_type), now),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::signature::QuerySignature;

  fn entry(value: Vec<u32>, age: Duration, now: DateTime<Utc>) -> CacheEntry<Vec<u32>> {
    CacheEntry::new(value, now - age, QuerySignature::new("teams:all"))
  }

  #[test]
  fn test_two_hours_old_is_stale() {
    let now = Utc::now();
    assert!(is_stale(now - Duration::hours(2), Duration::hours(1), now));
  }

  #[test]
  fn test_thirty_minutes_old_is_fresh() {
    let now = Utc::now();
    assert!(!is_stale(now - Duration::minutes(30), Duration::hours(1), now));
  }

  #[test]
  fn test_exactly_at_window_is_fresh() {
    let now = Utc::now();
    assert!(!is_stale(now - Duration::hours(1), Duration::hours(1), now));
  }

  #[test]
  fn test_empty_entry_is_always_stale() {
    let now = Utc::now();
    let fresh_but_empty = entry(Vec::new(), Duration::seconds(1), now);
    assert!(is_entry_stale(&fresh_but_empty, Duration::hours(1), now));
  }

  #[test]
  fn test_policy_fetches_on_cold_cache() {
    let policy = StalenessPolicy::default();
    assert!(policy.should_fetch::<Vec<u32>>(None, "team", Utc::now()));
  }

  #[test]
  fn test_policy_override_per_entity_type() {
    let now = Utc::now();
    let policy = StalenessPolicy::default().with_override("live_game", Duration::seconds(30));
    let cached = entry(vec![1], Duration::minutes(5), now);

    assert!(!policy.should_fetch(Some(&cached), "team", now));
    assert!(policy.should_fetch(Some(&cached), "live_game", now));
    assert_eq!(policy.window_for("team"), Duration::hours(1));
  }
}
