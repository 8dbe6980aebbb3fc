//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::traits::{CacheEntry, Cacheable};
use crate::signature::QuerySignature;

/// Trait for cache storage backends.
///
/// Implementations must be safe for concurrent use. Writes to the same key
/// are serialized; the last writer wins.
pub trait CacheStorage: Send + Sync + 'static {
  /// Store entities from a query result, stamped with `fetched_at`.
  fn store_query_result_at<T: Cacheable>(
    &self,
    signature: &QuerySignature,
    entities: &[T],
    fetched_at: DateTime<Utc>,
  ) -> Result<()>;

  /// Store entities from a query result fetched just now.
  fn store_query_result<T: Cacheable>(
    &self,
    signature: &QuerySignature,
    entities: &[T],
  ) -> Result<()> {
    self.store_query_result_at(signature, entities, Utc::now())
  }

  /// Get cached entities for a query, in the order they were stored.
  fn get_query_result<T: Cacheable>(
    &self,
    signature: &QuerySignature,
  ) -> Result<Option<CacheEntry<Vec<T>>>>;

  /// Drop a cached query result. Entity rows stay.
  fn invalidate(&self, signature: &QuerySignature) -> Result<()>;

  /// Get a single entity by id.
  fn get_entity<T: Cacheable>(&self, entity_key: &str) -> Result<Option<CacheEntry<T>>>;

  /// Store (or overwrite) a single entity.
  fn store_entity<T: Cacheable>(&self, entity: &T) -> Result<()>;

  /// Drop a single entity. Query results that referenced it read as misses.
  fn invalidate_entity<T: Cacheable>(&self, entity_key: &str) -> Result<()>;

  /// Remove everything.
  fn clear(&self) -> Result<()>;

  /// Release the backing resources. Later calls fail.
  fn close(&self) -> Result<()>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn store_query_result_at<T: Cacheable>(
    &self,
    _signature: &QuerySignature,
    _entities: &[T],
    _fetched_at: DateTime<Utc>,
  ) -> Result<()> {
    Ok(()) // Discard
  }

  fn get_query_result<T: Cacheable>(
    &self,
    _signature: &QuerySignature,
  ) -> Result<Option<CacheEntry<Vec<T>>>> {
    Ok(None) // Always miss
  }

  fn invalidate(&self, _signature: &QuerySignature) -> Result<()> {
    Ok(())
  }

  fn get_entity<T: Cacheable>(&self, _entity_key: &str) -> Result<Option<CacheEntry<T>>> {
    Ok(None) // Always miss
  }

  fn store_entity<T: Cacheable>(&self, _entity: &T) -> Result<()> {
    Ok(()) // Discard
  }

  fn invalidate_entity<T: Cacheable>(&self, _entity_key: &str) -> Result<()> {
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    Ok(())
  }

  fn close(&self) -> Result<()> {
    Ok(())
  }
}

/// SQLite-based cache storage implementation.
///
/// The connection lives behind a mutex, which serializes all writes.
/// `close` takes the connection out; the storage cannot be reopened in place.
pub struct SqliteStorage {
  conn: Mutex<Option<Connection>>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    info!(path = %path.display(), "opened cache database");
    Self::with_connection(conn)
  }

  /// Open the cache database at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open a throwaway in-memory cache.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(Some(conn)),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("rostersync").join("cache.db"))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Option<Connection>>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Run `f` against the open connection, or fail if the cache was closed.
fn with_open<R>(
  guard: &mut MutexGuard<'_, Option<Connection>>,
  f: impl FnOnce(&mut Connection) -> Result<R>,
) -> Result<R> {
  match guard.as_mut() {
    Some(conn) => f(conn),
    None => Err(eyre!("Cache database is closed")),
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Generic entity cache (stores serialized JSON)
CREATE TABLE IF NOT EXISTS entity_cache (
    entity_type TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    data BLOB NOT NULL,
    updated_at TEXT,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (entity_type, entity_key)
);

-- Query result tracking
CREATE TABLE IF NOT EXISTS query_cache (
    query_hash TEXT PRIMARY KEY,
    query_signature TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    cached_at TEXT NOT NULL,
    result_count INTEGER NOT NULL
);

-- Query to entity mapping (preserves order)
CREATE TABLE IF NOT EXISTS query_results (
    query_hash TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY (query_hash, entity_key)
);

CREATE INDEX IF NOT EXISTS idx_query_results_hash ON query_results(query_hash);
"#;

impl CacheStorage for SqliteStorage {
  fn store_query_result_at<T: Cacheable>(
    &self,
    signature: &QuerySignature,
    entities: &[T],
    fetched_at: DateTime<Utc>,
  ) -> Result<()> {
    let mut guard = self.lock()?;
    with_open(&mut guard, |conn| {
      let entity_type = T::entity_type();
      let query_hash = signature.cache_hash();
      let cached_at = fetched_at.to_rfc3339();

      let tx = conn
        .transaction()
        .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

      tx.execute(
        "DELETE FROM query_results WHERE query_hash = ?",
        params![query_hash],
      )
      .map_err(|e| eyre!("Failed to delete old query results: {}", e))?;

      tx.execute(
        "INSERT OR REPLACE INTO query_cache (query_hash, query_signature, entity_type, cached_at, result_count)
         VALUES (?, ?, ?, ?, ?)",
        params![
          query_hash,
          signature.as_str(),
          entity_type,
          cached_at,
          entities.len() as i64
        ],
      )
      .map_err(|e| eyre!("Failed to update query cache: {}", e))?;

      for (position, entity) in entities.iter().enumerate() {
        let entity_key = entity.cache_key();
        let data =
          serde_json::to_vec(entity).map_err(|e| eyre!("Failed to serialize entity: {}", e))?;
        let updated_at = entity.updated_at().map(|t| t.to_rfc3339());

        tx.execute(
          "INSERT OR REPLACE INTO entity_cache (entity_type, entity_key, data, updated_at, cached_at)
           VALUES (?, ?, ?, ?, ?)",
          params![entity_type, entity_key, data, updated_at, cached_at],
        )
        .map_err(|e| eyre!("Failed to store entity: {}", e))?;

        tx.execute(
          "INSERT OR REPLACE INTO query_results (query_hash, entity_key, position)
           VALUES (?, ?, ?)",
          params![query_hash, entity_key, position as i64],
        )
        .map_err(|e| eyre!("Failed to store query result: {}", e))?;
      }

      tx.commit()
        .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

      debug!(signature = %signature, count = entities.len(), "stored query result");
      Ok(())
    })
  }

  fn get_query_result<T: Cacheable>(
    &self,
    signature: &QuerySignature,
  ) -> Result<Option<CacheEntry<Vec<T>>>> {
    let mut guard = self.lock()?;
    with_open(&mut guard, |conn| {
      let entity_type = T::entity_type();
      let query_hash = signature.cache_hash();

      let query_info: Option<(String, i64)> = conn
        .query_row(
          "SELECT cached_at, result_count FROM query_cache
           WHERE query_hash = ? AND entity_type = ?",
          params![query_hash, entity_type],
          |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| eyre!("Failed to read query cache: {}", e))?;

      let (cached_at_str, result_count) = match query_info {
        Some(info) => info,
        None => return Ok(None),
      };

      let cached_at = parse_datetime(&cached_at_str)?;

      let mut stmt = conn
        .prepare(
          "SELECT ec.data FROM entity_cache ec
           INNER JOIN query_results qr ON ec.entity_type = ? AND ec.entity_key = qr.entity_key
           WHERE qr.query_hash = ?
           ORDER BY qr.position",
        )
        .map_err(|e| eyre!("Failed to prepare entity query: {}", e))?;

      let rows: Vec<Vec<u8>> = stmt
        .query_map(params![entity_type, query_hash], |row| row.get(0))
        .map_err(|e| eyre!("Failed to query entities: {}", e))?
        .collect::<rusqlite::Result<_>>()
        .map_err(|e| eyre!("Failed to read entity row: {}", e))?;

      // An entity invalidated since the query was stored leaves a hole
      if rows.len() as i64 != result_count {
        debug!(signature = %signature, "cached query result is incomplete");
        return Ok(None);
      }

      let entities = rows
        .iter()
        .map(|data| serde_json::from_slice(data))
        .collect::<serde_json::Result<Vec<T>>>()
        .map_err(|e| eyre!("Failed to deserialize cached {}: {}", entity_type, e))?;

      Ok(Some(CacheEntry::new(
        entities,
        cached_at,
        signature.clone(),
      )))
    })
  }

  fn invalidate(&self, signature: &QuerySignature) -> Result<()> {
    let mut guard = self.lock()?;
    with_open(&mut guard, |conn| {
      let query_hash = signature.cache_hash();
      let tx = conn
        .transaction()
        .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
      tx.execute(
        "DELETE FROM query_results WHERE query_hash = ?",
        params![query_hash],
      )
      .map_err(|e| eyre!("Failed to delete query results: {}", e))?;
      tx.execute(
        "DELETE FROM query_cache WHERE query_hash = ?",
        params![query_hash],
      )
      .map_err(|e| eyre!("Failed to delete query cache: {}", e))?;
      tx.commit()
        .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
      debug!(signature = %signature, "invalidated query result");
      Ok(())
    })
  }

  fn get_entity<T: Cacheable>(&self, entity_key: &str) -> Result<Option<CacheEntry<T>>> {
    let mut guard = self.lock()?;
    with_open(&mut guard, |conn| {
      let entity_type = T::entity_type();

      let result: Option<(Vec<u8>, String)> = conn
        .query_row(
          "SELECT data, cached_at FROM entity_cache
           WHERE entity_type = ? AND entity_key = ?",
          params![entity_type, entity_key],
          |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| eyre!("Failed to read entity cache: {}", e))?;

      match result {
        Some((data, cached_at_str)) => {
          let entity: T = serde_json::from_slice(&data)
            .map_err(|e| eyre!("Failed to deserialize entity: {}", e))?;
          let cached_at = parse_datetime(&cached_at_str)?;
          Ok(Some(CacheEntry::new(
            entity,
            cached_at,
            QuerySignature::new(format!("{}:{}", entity_type, entity_key)),
          )))
        }
        None => Ok(None),
      }
    })
  }

  fn store_entity<T: Cacheable>(&self, entity: &T) -> Result<()> {
    let mut guard = self.lock()?;
    with_open(&mut guard, |conn| {
      let entity_type = T::entity_type();
      let key = entity.cache_key();
      let data =
        serde_json::to_vec(entity).map_err(|e| eyre!("Failed to serialize entity: {}", e))?;
      let updated_at = entity.updated_at().map(|t| t.to_rfc3339());

      conn
        .execute(
          "INSERT OR REPLACE INTO entity_cache (entity_type, entity_key, data, updated_at, cached_at)
           VALUES (?, ?, ?, ?, ?)",
          params![entity_type, key, data, updated_at, Utc::now().to_rfc3339()],
        )
        .map_err(|e| eyre!("Failed to store entity: {}", e))?;

      Ok(())
    })
  }

  fn invalidate_entity<T: Cacheable>(&self, entity_key: &str) -> Result<()> {
    let mut guard = self.lock()?;
    with_open(&mut guard, |conn| {
      conn
        .execute(
          "DELETE FROM entity_cache WHERE entity_type = ? AND entity_key = ?",
          params![T::entity_type(), entity_key],
        )
        .map_err(|e| eyre!("Failed to delete entity: {}", e))?;
      Ok(())
    })
  }

  fn clear(&self) -> Result<()> {
    let mut guard = self.lock()?;
    with_open(&mut guard, |conn| {
      conn
        .execute_batch(
          "DELETE FROM query_results; DELETE FROM query_cache; DELETE FROM entity_cache;",
        )
        .map_err(|e| eyre!("Failed to clear cache: {}", e))?;
      info!("cleared cache");
      Ok(())
    })
  }

  fn close(&self) -> Result<()> {
    let mut guard = self.lock()?;
    if let Some(conn) = guard.take() {
      conn
        .close()
        .map_err(|(_, e)| eyre!("Failed to close cache database: {}", e))?;
      debug!("closed cache database");
    }
    Ok(())
  }
}

/// Parse an RFC 3339 timestamp stored by this module.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::Team;
  use chrono::Duration;

  fn team(id: &str, name: &str) -> Team {
    Team {
      id: id.to_string(),
      name: name.to_string(),
      club: None,
      age_group: Some("U12".to_string()),
      updated_at: Utc::now(),
    }
  }

  #[test]
  fn test_query_result_round_trip_preserves_order() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let sig = QuerySignature::new("teams:all");
    let teams = vec![team("b", "Bears"), team("a", "Ants")];

    storage.store_query_result(&sig, &teams).unwrap();
    let cached = storage.get_query_result::<Team>(&sig).unwrap().unwrap();

    assert_eq!(cached.value, teams);
    assert_eq!(cached.signature, sig);
  }

  #[test]
  fn test_missing_query_is_none() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let cached = storage
      .get_query_result::<Team>(&QuerySignature::new("teams:all"))
      .unwrap();
    assert!(cached.is_none());
  }

  #[test]
  fn test_empty_result_is_cached_as_empty() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let sig = QuerySignature::new("teams:all");
    storage.store_query_result::<Team>(&sig, &[]).unwrap();

    let cached = storage.get_query_result::<Team>(&sig).unwrap().unwrap();
    assert!(cached.value.is_empty());
  }

  #[test]
  fn test_fetched_at_is_preserved() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let sig = QuerySignature::new("teams:all");
    let two_hours_ago = Utc::now() - Duration::hours(2);

    storage
      .store_query_result_at(&sig, &[team("a", "Ants")], two_hours_ago)
      .unwrap();
    let cached = storage.get_query_result::<Team>(&sig).unwrap().unwrap();

    assert_eq!(
      cached.last_fetched_at.timestamp(),
      two_hours_ago.timestamp()
    );
  }

  #[test]
  fn test_invalidate_drops_query() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let sig = QuerySignature::new("teams:all");
    storage.store_query_result(&sig, &[team("a", "Ants")]).unwrap();

    storage.invalidate(&sig).unwrap();

    assert!(storage.get_query_result::<Team>(&sig).unwrap().is_none());
    // The entity row survives
    assert!(storage.get_entity::<Team>("a").unwrap().is_some());
  }

  #[test]
  fn test_invalidated_entity_makes_query_a_miss() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let sig = QuerySignature::new("teams:all");
    storage
      .store_query_result(&sig, &[team("a", "Ants"), team("b", "Bears")])
      .unwrap();

    storage.invalidate_entity::<Team>("a").unwrap();

    assert!(storage.get_query_result::<Team>(&sig).unwrap().is_none());
  }

  #[test]
  fn test_store_entity_overwrites() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.store_entity(&team("a", "Ants")).unwrap();
    storage.store_entity(&team("a", "Army Ants")).unwrap();

    let cached = storage.get_entity::<Team>("a").unwrap().unwrap();
    assert_eq!(cached.value.name, "Army Ants");
    assert_eq!(cached.signature.as_str(), "team:a");
  }

  #[test]
  fn test_clear_removes_everything() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let sig = QuerySignature::new("teams:all");
    storage.store_query_result(&sig, &[team("a", "Ants")]).unwrap();

    storage.clear().unwrap();

    assert!(storage.get_query_result::<Team>(&sig).unwrap().is_none());
    assert!(storage.get_entity::<Team>("a").unwrap().is_none());
  }

  #[test]
  fn test_closed_storage_errors() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.close().unwrap();

    let result = storage.get_query_result::<Team>(&QuerySignature::new("teams:all"));
    assert!(result.is_err());
    // Closing twice is fine
    storage.close().unwrap();
  }

  #[test]
  fn test_file_backed_cache_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    let sig = QuerySignature::new("teams:all");

    {
      let storage = SqliteStorage::open(&path).unwrap();
      storage.store_query_result(&sig, &[team("a", "Ants")]).unwrap();
      storage.close().unwrap();
    }

    let storage = SqliteStorage::open(&path).unwrap();
    let cached = storage.get_query_result::<Team>(&sig).unwrap().unwrap();
    assert_eq!(cached.value.len(), 1);
  }

  #[test]
  fn test_noop_storage_always_misses() {
    let storage = NoopStorage;
    let sig = QuerySignature::new("teams:all");
    storage.store_query_result(&sig, &[team("a", "Ants")]).unwrap();
    assert!(storage.get_query_result::<Team>(&sig).unwrap().is_none());
  }
}
