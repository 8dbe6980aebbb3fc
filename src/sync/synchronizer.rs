//! Resource synchronizer: stale-while-revalidate over the cache store.
//!
//! For one logical query the synchronizer:
//! 1. emits `Loading` with whatever the cache holds, before `observe` returns
//! 2. if the cache is fresh, emits `Success` and waits for invalidation
//! 3. otherwise fetches, writes back to the cache and emits `Success`
//! 4. on fetch failure emits `Error` carrying the last good value
//!
//! Concurrent fetches for the same signature are shared. Each stream drives
//! the shared fetch from its own task; dropping the last stream drops the
//! fetch.

use chrono::Utc;
use color_eyre::Result;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use futures::{Stream, StreamExt};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::result::SyncResult;
use crate::cache::{CacheEntry, CacheStorage, Cacheable, StalenessPolicy, SyncValue};
use crate::error::SyncError;
use crate::remote::Document;
use crate::session::IdentityProvider;
use crate::signature::QuerySignature;

type FetchFn<T> =
  Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<T, SyncError>> + Send + Sync>;
type ReadFn<T> = Arc<dyn Fn() -> Result<Option<CacheEntry<T>>> + Send + Sync>;
type WriteFn<T> = Arc<dyn Fn(&T) -> Result<()> + Send + Sync>;
type ShouldFetchFn<T> = Arc<dyn Fn(Option<&CacheEntry<T>>) -> bool + Send + Sync>;

/// Everything the synchronizer needs to know about one logical query.
#[derive(Clone)]
pub struct Resource<T> {
  signature: QuerySignature,
  entity_type: &'static str,
  fetch: FetchFn<T>,
  read: Option<ReadFn<T>>,
  write: Option<WriteFn<T>>,
  should_fetch: Option<ShouldFetchFn<T>>,
  identity_scoped: bool,
}

impl<T: SyncValue> Resource<T> {
  /// A resource with only a remote fetch. Add cache access with the builders.
  pub fn new<F, Fut>(signature: QuerySignature, fetch: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<T, SyncError>> + Send + 'static,
  {
    Self {
      signature,
      entity_type: "resource",
      fetch: Arc::new(move || fetch().boxed()),
      read: None,
      write: None,
      should_fetch: None,
      identity_scoped: false,
    }
  }

  pub fn with_cache_read<F>(mut self, read: F) -> Self
  where
    F: Fn() -> Result<Option<CacheEntry<T>>> + Send + Sync + 'static,
  {
    self.read = Some(Arc::new(read));
    self
  }

  pub fn with_cache_write<F>(mut self, write: F) -> Self
  where
    F: Fn(&T) -> Result<()> + Send + Sync + 'static,
  {
    self.write = Some(Arc::new(write));
    self
  }

  /// Replace the staleness policy for this resource. A cold cache still fetches.
  pub fn with_should_fetch<F>(mut self, should_fetch: F) -> Self
  where
    F: Fn(Option<&CacheEntry<T>>) -> bool + Send + Sync + 'static,
  {
    self.should_fetch = Some(Arc::new(should_fetch));
    self
  }

  /// Entity type used to pick the staleness window.
  pub fn with_entity_type(mut self, entity_type: &'static str) -> Self {
    self.entity_type = entity_type;
    self
  }

  /// Refuse to run without a signed-in identity.
  pub fn requires_identity(mut self) -> Self {
    self.identity_scoped = true;
    self
  }

  pub fn signature(&self) -> &QuerySignature {
    &self.signature
  }
}

/// Output of a shared fetch: the value and whether the cache accepted it.
#[derive(Clone)]
struct Fetched<T> {
  value: T,
  cached: bool,
}

type FetchTask<T> = BoxFuture<'static, std::result::Result<Fetched<T>, SyncError>>;
type SharedFetch<T> = Shared<FetchTask<T>>;

struct InFlightEntry {
  generation: u64,
  /// A `WeakShared<FetchTask<T>>` for the signature's value type
  fetch: Box<dyn Any + Send>,
}

#[derive(Default)]
struct InFlightState {
  fetches: HashMap<QuerySignature, InFlightEntry>,
  /// Bumped whenever a signature's cache entry is dropped or overwritten
  epochs: HashMap<QuerySignature, u64>,
}

impl InFlightState {
  fn epoch(&self, signature: &QuerySignature) -> u64 {
    self.epochs.get(signature).copied().unwrap_or(0)
  }
}

/// In-flight fetches by signature. Holds only weak handles, so a fetch
/// nobody is waiting on is dropped.
#[derive(Default)]
struct InFlight {
  state: Mutex<InFlightState>,
  next_generation: AtomicU64,
}

impl InFlight {
  fn lock(&self) -> MutexGuard<'_, InFlightState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn join_or_start<T: SyncValue>(self: &Arc<Self>, resource: &Resource<T>) -> SharedFetch<T> {
    let mut state = self.lock();

    let existing = state
      .fetches
      .get(&resource.signature)
      .and_then(|entry| entry.fetch.downcast_ref::<WeakShared<FetchTask<T>>>())
      .and_then(WeakShared::upgrade);
    if let Some(shared) = existing {
      debug!(signature = %resource.signature, "joining in-flight fetch");
      return shared;
    }

    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
    let epoch = state.epoch(&resource.signature);
    let fetch = (resource.fetch)();
    let write = resource.write.clone();
    let signature = resource.signature.clone();
    let registry = Arc::clone(self);
    let guard = FinishGuard {
      registry: Arc::clone(self),
      signature: signature.clone(),
      generation,
    };

    info!(signature = %signature, "fetching from remote");
    let task: FetchTask<T> = async move {
      // Dropped on completion and on cancellation alike
      let _guard = guard;
      let value = fetch.await?;
      let cached = match &write {
        Some(write) => registry.write_if_current(&signature, epoch, || write(&value)),
        None => false,
      };
      Ok::<_, SyncError>(Fetched { value, cached })
    }
    .boxed();

    let shared = task.shared();
    if let Some(weak) = shared.downgrade() {
      state.fetches.insert(
        resource.signature.clone(),
        InFlightEntry {
          generation,
          fetch: Box::new(weak),
        },
      );
    }
    shared
  }

  /// Run a cache write unless the signature was invalidated since `epoch`.
  /// Returns whether the cache now holds the written value.
  fn write_if_current(
    &self,
    signature: &QuerySignature,
    epoch: u64,
    write: impl FnOnce() -> Result<()>,
  ) -> bool {
    let state = self.lock();
    if state.epoch(signature) != epoch {
      debug!(signature = %signature, "fetch superseded, skipping cache write");
      return false;
    }
    match write() {
      Ok(()) => true,
      Err(e) => {
        warn!(signature = %signature, error = %e, "cache write failed");
        false
      }
    }
  }

  /// Detach running fetches from the cache: their results are not written
  /// back and the next cycle starts a new fetch.
  fn supersede(&self, signature: &QuerySignature) {
    let mut state = self.lock();
    *state.epochs.entry(signature.clone()).or_insert(0) += 1;
    state.fetches.remove(signature);
  }

  fn finish(&self, signature: &QuerySignature, generation: u64) {
    let mut state = self.lock();
    if state
      .fetches
      .get(signature)
      .is_some_and(|entry| entry.generation == generation)
    {
      state.fetches.remove(signature);
    }
  }
}

/// Removes a fetch's registry entry when the fetch future goes away.
struct FinishGuard {
  registry: Arc<InFlight>,
  signature: QuerySignature,
  generation: u64,
}

impl Drop for FinishGuard {
  fn drop(&mut self) {
    self.registry.finish(&self.signature, self.generation);
  }
}

/// Orchestrates cache, staleness policy and remote fetches per query signature.
pub struct Synchronizer<S: CacheStorage> {
  storage: Arc<S>,
  policy: Arc<StalenessPolicy>,
  identity: Arc<dyn IdentityProvider>,
  in_flight: Arc<InFlight>,
  invalidations: broadcast::Sender<QuerySignature>,
}

impl<S: CacheStorage> Synchronizer<S> {
  pub fn new(storage: Arc<S>, identity: Arc<dyn IdentityProvider>) -> Self {
    let (invalidations, _) = broadcast::channel(64);
    Self {
      storage,
      policy: Arc::new(StalenessPolicy::default()),
      identity,
      in_flight: Arc::new(InFlight::default()),
      invalidations,
    }
  }

  /// Set the staleness policy for resources that don't bring their own.
  pub fn with_policy(mut self, policy: StalenessPolicy) -> Self {
    self.policy = Arc::new(policy);
    self
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  /// A list resource cached under `signature` in this synchronizer's store.
  pub fn list_resource<E, F, Fut>(&self, signature: QuerySignature, fetch: F) -> Resource<Vec<E>>
  where
    E: Cacheable,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Vec<E>, SyncError>> + Send + 'static,
  {
    let read_storage = Arc::clone(&self.storage);
    let read_signature = signature.clone();
    let write_storage = Arc::clone(&self.storage);
    let write_signature = signature.clone();

    Resource::new(signature, fetch)
      .with_entity_type(E::entity_type())
      .with_cache_read(move || read_storage.get_query_result::<E>(&read_signature))
      .with_cache_write(move |entities: &Vec<E>| {
        write_storage.store_query_result::<E>(&write_signature, entities)
      })
  }

  /// A single-entity resource cached by id in this synchronizer's store.
  pub fn entity_resource<E, F, Fut>(&self, id: &str, fetch: F) -> Resource<E>
  where
    E: Document + SyncValue,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<E, SyncError>> + Send + 'static,
  {
    let read_storage = Arc::clone(&self.storage);
    let write_storage = Arc::clone(&self.storage);
    let id = id.to_string();

    Resource::new(QuerySignature::entity::<E>(&id), fetch)
      .with_entity_type(E::entity_type())
      .with_cache_read(move || read_storage.get_entity::<E>(&id))
      .with_cache_write(move |entity: &E| write_storage.store_entity(entity))
  }

  /// Observe a resource as a continuous stream of results.
  ///
  /// The first `Loading` emission is queued before this returns. Fails with
  /// `NotAuthenticated` for identity-scoped resources when nobody is signed in.
  pub fn observe<T: SyncValue>(&self, resource: Resource<T>) -> Result<SyncStream<T>, SyncError> {
    if resource.identity_scoped && self.identity.current_user().is_none() {
      debug!(signature = %resource.signature, "identity-scoped query without identity");
      return Err(SyncError::NotAuthenticated);
    }

    let (tx, rx) = mpsc::unbounded_channel();
    // Subscribe before the first cycle so no invalidation slips between
    let invalidations = self.invalidations.subscribe();

    let mut driver = Driver {
      resource,
      policy: Arc::clone(&self.policy),
      in_flight: Arc::clone(&self.in_flight),
      tx,
      last_value: None,
    };
    let pending = driver.begin_cycle();
    let task = tokio::spawn(driver.run(pending, invalidations));

    Ok(SyncStream { rx, task })
  }

  /// Observe a list query cached in this synchronizer's own store.
  pub fn observe_query<E, F, Fut>(
    &self,
    signature: QuerySignature,
    fetch: F,
  ) -> Result<SyncStream<Vec<E>>, SyncError>
  where
    E: Cacheable,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Vec<E>, SyncError>> + Send + 'static,
  {
    self.observe(self.list_resource(signature, fetch))
  }

  /// Observe, fetching even if the cache is fresh (pull-to-refresh).
  pub fn refresh<T: SyncValue>(&self, resource: Resource<T>) -> Result<SyncStream<T>, SyncError> {
    self.observe(resource.with_should_fetch(|_| true))
  }

  /// Drop a cached query and re-run every open stream on it.
  ///
  /// A fetch already running for the signature keeps its result out of the
  /// cache; the re-run fetches again.
  pub fn invalidate(&self, signature: &QuerySignature) {
    self.in_flight.supersede(signature);
    if let Err(e) = self.storage.invalidate(signature) {
      warn!(signature = %signature, error = %e, "cache invalidation failed");
    }
    self.broadcast(signature);
  }

  /// Drop a cached entity and re-run every open stream on it.
  pub fn invalidate_entity<E: Document>(&self, id: &str) {
    let signature = QuerySignature::entity::<E>(id);
    self.in_flight.supersede(&signature);
    if let Err(e) = self.storage.invalidate_entity::<E>(id) {
      warn!(entity = E::entity_type(), id, error = %e, "cache invalidation failed");
    }
    self.broadcast(&signature);
  }

  /// Write an entity the app just saved and re-run every open stream on it.
  /// A fetch still running for the entity can't overwrite it.
  pub fn overwrite_entity<E: Document>(&self, entity: &E) {
    let signature = QuerySignature::entity::<E>(entity.id());
    self.in_flight.supersede(&signature);
    if let Err(e) = self.storage.store_entity(entity) {
      warn!(signature = %signature, error = %e, "cache write failed");
    }
    self.broadcast(&signature);
  }

  fn broadcast(&self, signature: &QuerySignature) {
    if self.invalidations.send(signature.clone()).is_err() {
      trace!(signature = %signature, "no open streams to invalidate");
    }
  }
}

impl<S: CacheStorage> Clone for Synchronizer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      policy: Arc::clone(&self.policy),
      identity: Arc::clone(&self.identity),
      in_flight: Arc::clone(&self.in_flight),
      invalidations: self.invalidations.clone(),
    }
  }
}

/// Per-stream state, owned by the stream's task.
struct Driver<T> {
  resource: Resource<T>,
  policy: Arc<StalenessPolicy>,
  in_flight: Arc<InFlight>,
  tx: mpsc::UnboundedSender<SyncResult<T>>,
  /// Last value this stream emitted; later emissions never fall back past it
  last_value: Option<T>,
}

impl<T: SyncValue> Driver<T> {
  /// Cache errors never reach the caller: they read as a miss.
  fn read_cache(&self) -> Option<CacheEntry<T>> {
    let read = self.resource.read.as_ref()?;
    match read() {
      Ok(entry) => entry,
      Err(e) => {
        warn!(
          signature = %self.resource.signature,
          error = %e,
          "cache read failed, treating as miss"
        );
        None
      }
    }
  }

  fn should_fetch(&self, entry: &CacheEntry<T>) -> bool {
    match &self.resource.should_fetch {
      Some(should_fetch) => should_fetch(Some(entry)),
      None => self
        .policy
        .should_fetch(Some(entry), self.resource.entity_type, Utc::now()),
    }
  }

  fn emit(&mut self, result: SyncResult<T>) {
    if let Some(data) = result.data() {
      self.last_value = Some(data.clone());
    }
    if self.tx.send(result).is_err() {
      trace!(signature = %self.resource.signature, "stream dropped");
    }
  }

  /// Steps 1 and 2. Returns the fetch to await, or `None` if the cache settled it.
  fn begin_cycle(&mut self) -> Option<SharedFetch<T>> {
    let cached = self.read_cache();

    // An empty cached list is no data yet; it still fetches
    let partial = cached
      .as_ref()
      .filter(|entry| !entry.value.is_empty_result())
      .map(|entry| entry.value.clone())
      .or_else(|| self.last_value.clone());
    self.emit(SyncResult::Loading { partial });

    match cached {
      Some(entry) if !self.should_fetch(&entry) => {
        debug!(signature = %self.resource.signature, "cache is fresh");
        self.emit(SyncResult::Success { value: entry.value });
        None
      }
      _ => Some(self.in_flight.join_or_start(&self.resource)),
    }
  }

  /// Steps 3 and 4.
  async fn complete(&mut self, fetch: SharedFetch<T>) {
    match fetch.await {
      Ok(fetched) => {
        let fresh = if fetched.cached {
          self
            .read_cache()
            .map(|entry| entry.value)
            .unwrap_or(fetched.value)
        } else {
          fetched.value
        };
        self.emit(SyncResult::Success { value: fresh });
      }
      Err(error) => {
        warn!(signature = %self.resource.signature, error = %error, "remote fetch failed");
        let partial = self.last_value.clone();
        self.emit(SyncResult::Error { error, partial });
      }
    }
  }

  async fn run(
    mut self,
    mut pending: Option<SharedFetch<T>>,
    mut invalidations: broadcast::Receiver<QuerySignature>,
  ) {
    loop {
      if let Some(fetch) = pending.take() {
        self.complete(fetch).await;
      }
      if !self.wait_for_invalidation(&mut invalidations).await {
        return;
      }
      debug!(signature = %self.resource.signature, "invalidated, re-running");
      pending = self.begin_cycle();
    }
  }

  async fn wait_for_invalidation(
    &self,
    invalidations: &mut broadcast::Receiver<QuerySignature>,
  ) -> bool {
    loop {
      match invalidations.recv().await {
        Ok(signature) if signature == self.resource.signature => return true,
        Ok(_) => continue,
        // Ours may be among the missed ones
        Err(RecvError::Lagged(_)) => return true,
        Err(RecvError::Closed) => return false,
      }
    }
  }
}

/// Continuous stream of results for one observed resource.
///
/// Dropping it stops its task; a fetch shared with other streams keeps going.
pub struct SyncStream<T> {
  rx: mpsc::UnboundedReceiver<SyncResult<T>>,
  task: JoinHandle<()>,
}

impl<T> SyncStream<T> {
  /// Skip to the next `Success` or `Error`.
  pub async fn settled(&mut self) -> Option<SyncResult<T>> {
    while let Some(result) = self.next().await {
      if !result.is_loading() {
        return Some(result);
      }
    }
    None
  }
}

impl<T> Stream for SyncStream<T> {
  type Item = SyncResult<T>;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    self.get_mut().rx.poll_recv(cx)
  }
}

impl<T> Drop for SyncStream<T> {
  fn drop(&mut self) {
    self.task.abort();
  }
}
