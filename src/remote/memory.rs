//! In-process document store.
//!
//! Backs the offline demo and the test suite. Documents are held as raw JSON
//! so they go through the same fail-closed decoding as HTTP responses.
//! Failures can be injected per operation and every call is counted.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::trace;

use super::query::{CursorKey, Page, PageRequest, RemoteQuery};
use super::{Document, PushFeed, RemoteError, RemoteStore};
use crate::models::decode_documents;

#[derive(Debug, Clone)]
enum Change {
  Collection(String),
  Disconnect,
}

#[derive(Default)]
struct State {
  collections: HashMap<String, BTreeMap<String, Value>>,
  failing_fetches: usize,
  failing_pages: usize,
  failing_subscribes: usize,
  fetch_delay: Option<Duration>,
}

struct Shared {
  state: Mutex<State>,
  changes: broadcast::Sender<Change>,
  fetch_calls: AtomicUsize,
  page_calls: AtomicUsize,
  subscribe_calls: AtomicUsize,
  open_feeds: AtomicUsize,
}

/// Thread-safe in-memory document store with push notifications.
#[derive(Clone)]
pub struct MemoryDocumentStore {
  shared: Arc<Shared>,
}

impl Default for MemoryDocumentStore {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryDocumentStore {
  pub fn new() -> Self {
    let (changes, _) = broadcast::channel(256);
    Self {
      shared: Arc::new(Shared {
        state: Mutex::new(State::default()),
        changes,
        fetch_calls: AtomicUsize::new(0),
        page_calls: AtomicUsize::new(0),
        subscribe_calls: AtomicUsize::new(0),
        open_feeds: AtomicUsize::new(0),
      }),
    }
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    self
      .shared
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn notify(&self, change: Change) {
    if let Err(e) = self.shared.changes.send(change) {
      trace!(error = %e, "no feeds listening for change");
    }
  }

  /// Insert or replace a typed document and notify open feeds.
  pub fn insert<T: Document>(&self, document: &T) {
    let raw = match serde_json::to_value(document) {
      Ok(raw) => raw,
      Err(e) => {
        trace!(error = %e, "document did not serialize, skipping");
        return;
      }
    };
    self.insert_raw(T::collection(), raw);
  }

  /// Insert a raw JSON document, bypassing the typed schema.
  pub fn insert_raw(&self, collection: &str, raw: Value) {
    let id = raw
      .get("id")
      .and_then(Value::as_str)
      .unwrap_or_default()
      .to_string();
    self
      .lock()
      .collections
      .entry(collection.to_string())
      .or_default()
      .insert(id, raw);
    self.notify(Change::Collection(collection.to_string()));
  }

  /// Remove a document by id and notify open feeds.
  pub fn remove<T: Document>(&self, id: &str) {
    if let Some(docs) = self.lock().collections.get_mut(T::collection()) {
      docs.remove(id);
    }
    self.notify(Change::Collection(T::collection().to_string()));
  }

  /// Make the next `n` fetches fail with a connection error.
  pub fn fail_next_fetches(&self, n: usize) {
    self.lock().failing_fetches = n;
  }

  /// Make the next `n` page fetches fail with a connection error.
  pub fn fail_next_pages(&self, n: usize) {
    self.lock().failing_pages = n;
  }

  /// Make the next `n` subscribe attempts fail with a connection error.
  pub fn fail_next_subscribes(&self, n: usize) {
    self.lock().failing_subscribes = n;
  }

  /// Delay every fetch, keeping it in flight long enough to observe.
  pub fn set_fetch_delay(&self, delay: Duration) {
    self.lock().fetch_delay = Some(delay);
  }

  /// Break every open feed: each yields one error and ends.
  pub fn disconnect_feeds(&self) {
    self.notify(Change::Disconnect);
  }

  pub fn fetch_calls(&self) -> usize {
    self.shared.fetch_calls.load(Ordering::SeqCst)
  }

  pub fn page_calls(&self) -> usize {
    self.shared.page_calls.load(Ordering::SeqCst)
  }

  pub fn subscribe_calls(&self) -> usize {
    self.shared.subscribe_calls.load(Ordering::SeqCst)
  }

  /// Number of push feeds currently held open by consumers.
  pub fn open_feeds(&self) -> usize {
    self.shared.open_feeds.load(Ordering::SeqCst)
  }

  fn take_failure(&self, pick: impl FnOnce(&mut State) -> &mut usize) -> bool {
    let mut state = self.lock();
    let remaining = pick(&mut state);
    if *remaining > 0 {
      *remaining -= 1;
      true
    } else {
      false
    }
  }

  fn snapshot(&self, query: &RemoteQuery) -> Vec<Value> {
    self
      .lock()
      .collections
      .get(&query.collection)
      .map(|docs| {
        docs
          .values()
          .filter(|doc| query.matches(doc))
          .cloned()
          .collect()
      })
      .unwrap_or_default()
  }

  fn materialize<T: Document>(&self, query: &RemoteQuery) -> Result<Vec<T>, RemoteError> {
    Ok(decode_documents(self.snapshot(query))?)
  }
}

/// Keeps the open feed count accurate for as long as a feed stream lives.
struct FeedGuard {
  shared: Arc<Shared>,
}

impl FeedGuard {
  fn new(shared: Arc<Shared>) -> Self {
    shared.open_feeds.fetch_add(1, Ordering::SeqCst);
    Self { shared }
  }
}

impl Drop for FeedGuard {
  fn drop(&mut self) {
    self.shared.open_feeds.fetch_sub(1, Ordering::SeqCst);
  }
}

struct FeedState {
  store: MemoryDocumentStore,
  query: RemoteQuery,
  changes: broadcast::Receiver<Change>,
  initial: bool,
  done: bool,
  _guard: FeedGuard,
}

impl RemoteStore for MemoryDocumentStore {
  async fn fetch<T: Document>(&self, query: &RemoteQuery) -> Result<Vec<T>, RemoteError> {
    self.shared.fetch_calls.fetch_add(1, Ordering::SeqCst);
    let delay = self.lock().fetch_delay;
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
    if self.take_failure(|s| &mut s.failing_fetches) {
      return Err(RemoteError::Connection("injected fetch failure".into()));
    }
    self.materialize(query)
  }

  async fn fetch_page<T: Document>(
    &self,
    query: &RemoteQuery,
    page: &PageRequest,
  ) -> Result<Page<T>, RemoteError> {
    self.shared.page_calls.fetch_add(1, Ordering::SeqCst);
    if self.take_failure(|s| &mut s.failing_pages) {
      return Err(RemoteError::Connection("injected page failure".into()));
    }

    let mut keyed: Vec<(CursorKey, Value)> = self
      .snapshot(query)
      .into_iter()
      .map(|doc| (CursorKey::from_json(&doc, &page.order.field), doc))
      .collect();
    keyed.sort_by(|a, b| page.order.compare(&a.0, &b.0));

    let raw = keyed
      .into_iter()
      .filter(|(key, _)| {
        page
          .start_after
          .as_ref()
          .map_or(true, |cursor| page.order.is_after(key, cursor))
      })
      .take(page.limit)
      .map(|(_, doc)| doc)
      .collect();

    Ok(Page {
      items: decode_documents(raw)?,
    })
  }

  async fn subscribe<T: Document>(&self, query: &RemoteQuery) -> Result<PushFeed<T>, RemoteError> {
    self.shared.subscribe_calls.fetch_add(1, Ordering::SeqCst);
    if self.take_failure(|s| &mut s.failing_subscribes) {
      return Err(RemoteError::Connection("injected subscribe failure".into()));
    }

    let state = FeedState {
      store: self.clone(),
      query: query.clone(),
      changes: self.shared.changes.subscribe(),
      initial: true,
      done: false,
      _guard: FeedGuard::new(Arc::clone(&self.shared)),
    };

    let feed = futures::stream::unfold(state, |mut st| async move {
      if st.done {
        return None;
      }
      if st.initial {
        st.initial = false;
        let snapshot = st.store.materialize::<T>(&st.query);
        return Some((snapshot, st));
      }
      loop {
        match st.changes.recv().await {
          Ok(Change::Collection(c)) if c == st.query.collection => {
            let snapshot = st.store.materialize::<T>(&st.query);
            return Some((snapshot, st));
          }
          Ok(Change::Collection(_)) => continue,
          Ok(Change::Disconnect) => {
            st.done = true;
            let err = RemoteError::Connection("push feed disconnected".into());
            return Some((Err(err), st));
          }
          // Missed changes are harmless: every item is a full snapshot
          Err(RecvError::Lagged(_)) => {
            let snapshot = st.store.materialize::<T>(&st.query);
            return Some((snapshot, st));
          }
          Err(RecvError::Closed) => return None,
        }
      }
    });

    Ok(feed.boxed())
  }

  async fn put<T: Document>(&self, document: &T) -> Result<(), RemoteError> {
    self.insert(document);
    Ok(())
  }

  async fn delete<T: Document>(&self, id: &str) -> Result<(), RemoteError> {
    self.remove::<T>(id);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{NewsItem, Team};
  use crate::remote::{FieldValue, OrderBy};
  use chrono::{TimeZone, Utc};
  use serde_json::json;

  fn team(id: &str) -> Team {
    Team {
      id: id.into(),
      name: format!("Team {}", id),
      club: None,
      age_group: None,
      updated_at: Utc::now(),
    }
  }

  fn news(id: &str, minute: u32) -> NewsItem {
    let at = Utc.with_ymd_and_hms(2026, 5, 1, 12, minute, 0).unwrap();
    NewsItem {
      id: id.into(),
      title: id.into(),
      body: String::new(),
      author: None,
      published_at: at,
      updated_at: at,
    }
  }

  #[tokio::test]
  async fn test_fetch_filters_and_counts() {
    let store = MemoryDocumentStore::new();
    store.insert(&team("t1"));
    store.insert(&team("t2"));

    let query = RemoteQuery::new("teams").where_eq("id", FieldValue::Text("t2".into()));
    let teams: Vec<Team> = store.fetch(&query).await.unwrap();

    assert_eq!(teams.len(), 1);
    assert_eq!(teams[0].id, "t2");
    assert_eq!(store.fetch_calls(), 1);
  }

  #[tokio::test]
  async fn test_injected_failure_is_consumed() {
    let store = MemoryDocumentStore::new();
    store.fail_next_fetches(1);
    let query = RemoteQuery::new("teams");

    assert!(store.fetch::<Team>(&query).await.is_err());
    assert!(store.fetch::<Team>(&query).await.is_ok());
  }

  #[tokio::test]
  async fn test_raw_documents_decode_fail_closed() {
    let store = MemoryDocumentStore::new();
    store.insert_raw("teams", json!({"id": "broken"}));

    let err = store
      .fetch::<Team>(&RemoteQuery::new("teams"))
      .await
      .unwrap_err();
    assert!(matches!(err, RemoteError::Decode(d) if d.id == "broken"));
  }

  #[tokio::test]
  async fn test_fetch_page_orders_and_resumes() {
    let store = MemoryDocumentStore::new();
    for (id, minute) in [("a", 1), ("b", 3), ("c", 2)] {
      store.insert(&news(id, minute));
    }
    let query = RemoteQuery::new("news");
    let mut request = PageRequest {
      order: OrderBy::descending("publishedAt"),
      limit: 2,
      start_after: None,
    };

    let first: Page<NewsItem> = store.fetch_page(&query, &request).await.unwrap();
    let ids: Vec<_> = first.items.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, vec!["b", "c"]);

    request.start_after = Some(CursorKey::for_document(&first.items[1], "publishedAt"));
    let second: Page<NewsItem> = store.fetch_page(&query, &request).await.unwrap();
    let ids: Vec<_> = second.items.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, vec!["a"]);
  }

  #[tokio::test]
  async fn test_feed_emits_snapshot_then_changes() {
    let store = MemoryDocumentStore::new();
    store.insert(&team("t1"));

    let mut feed = store.subscribe::<Team>(&RemoteQuery::new("teams")).await.unwrap();
    assert_eq!(store.open_feeds(), 1);
    assert_eq!(feed.next().await.unwrap().unwrap().len(), 1);

    store.insert(&team("t2"));
    assert_eq!(feed.next().await.unwrap().unwrap().len(), 2);

    store.disconnect_feeds();
    assert!(feed.next().await.unwrap().is_err());
    assert!(feed.next().await.is_none());

    drop(feed);
    assert_eq!(store.open_feeds(), 0);
  }
}
