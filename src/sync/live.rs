//! Live change bridge.
//!
//! One push connection per query signature, fanned out to every subscriber.
//! Each push is a full result set; subscribers filter it themselves. The
//! connection reconnects with exponential backoff and gives up loudly with
//! `Stalled` once the attempts run out.

use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use std::any::Any;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::remote::{Document, RemoteQuery, RemoteStore};
use crate::signature::QuerySignature;

/// One item on a live subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveUpdate<T> {
  /// The full current result set, after this subscriber's filter
  Snapshot(Vec<T>),
  /// The connection dropped; a reconnect follows after backoff
  Reconnecting { attempt: u32, error: String },
  /// Reconnects exhausted. Last item on the stream.
  Stalled { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
  /// Consecutive failed connections before giving up
  pub max_attempts: u32,
  pub initial_backoff: Duration,
  pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      initial_backoff: Duration::from_millis(500),
      max_backoff: Duration::from_secs(30),
    }
  }
}

impl ReconnectPolicy {
  /// Delay before reconnect `attempt` (1-based): initial, doubling, capped.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let doublings = attempt.saturating_sub(1).min(31);
    self
      .initial_backoff
      .saturating_mul(1u32 << doublings)
      .min(self.max_backoff)
  }
}

/// Fan-out point for one connection.
struct Channel<T> {
  updates: broadcast::Sender<LiveUpdate<T>>,
  latest: Mutex<Option<Vec<T>>>,
}

impl<T: Clone> Channel<T> {
  fn new() -> Self {
    let (updates, _) = broadcast::channel(32);
    Self {
      updates,
      latest: Mutex::new(None),
    }
  }

  fn latest(&self) -> MutexGuard<'_, Option<Vec<T>>> {
    self.latest.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Publishing and attaching both hold `latest`, so an attaching
  /// subscriber sees each snapshot exactly once.
  fn publish(&self, update: LiveUpdate<T>) {
    let mut latest = self.latest();
    if let LiveUpdate::Snapshot(items) = &update {
      *latest = Some(items.clone());
    }
    // No receivers just means nobody is attached right now
    let _ = self.updates.send(update);
  }

  fn attach(&self) -> (Option<Vec<T>>, broadcast::Receiver<LiveUpdate<T>>) {
    let latest = self.latest();
    (latest.clone(), self.updates.subscribe())
  }
}

struct Connection {
  generation: u64,
  subscribers: usize,
  task: AbortHandle,
  /// `Arc<Channel<T>>` for the signature's document type
  channel: Box<dyn Any + Send>,
  /// Ends every subscription on the channel with `Stalled`
  stall: Box<dyn Fn(String) + Send>,
}

#[derive(Default)]
struct Registry {
  connections: Mutex<HashMap<QuerySignature, Connection>>,
  next_generation: AtomicU64,
}

impl Registry {
  fn lock(&self) -> MutexGuard<'_, HashMap<QuerySignature, Connection>> {
    self
      .connections
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn detach(&self, signature: &QuerySignature, generation: u64) {
    let mut connections = self.lock();
    let Some(connection) = connections.get_mut(signature) else {
      return;
    };
    if connection.generation != generation {
      return;
    }
    connection.subscribers = connection.subscribers.saturating_sub(1);
    if connection.subscribers == 0 {
      if let Some(connection) = connections.remove(signature) {
        info!(signature = %signature, "last subscriber left, closing live connection");
        connection.task.abort();
      }
    }
  }

  /// Called by a connection task on its way out.
  fn remove(&self, signature: &QuerySignature, generation: u64) {
    let mut connections = self.lock();
    if connections
      .get(signature)
      .is_some_and(|connection| connection.generation == generation)
    {
      connections.remove(signature);
    }
  }
}

/// Shares push connections between subscribers of the same query.
pub struct LiveBridge<R: RemoteStore> {
  remote: Arc<R>,
  policy: ReconnectPolicy,
  registry: Arc<Registry>,
}

impl<R: RemoteStore> Clone for LiveBridge<R> {
  fn clone(&self) -> Self {
    Self {
      remote: Arc::clone(&self.remote),
      policy: self.policy.clone(),
      registry: Arc::clone(&self.registry),
    }
  }
}

impl<R: RemoteStore> LiveBridge<R> {
  pub fn new(remote: Arc<R>, policy: ReconnectPolicy) -> Self {
    Self {
      remote,
      policy,
      registry: Arc::new(Registry::default()),
    }
  }

  /// Number of open push connections.
  pub fn connection_count(&self) -> usize {
    self.registry.lock().len()
  }

  /// Subscribe to every document the query matches.
  pub fn subscribe<T: Document>(
    &self,
    signature: QuerySignature,
    query: RemoteQuery,
  ) -> LiveSubscription<T> {
    self.subscribe_live(signature, query, |_: &T| true)
  }

  /// Subscribe with a per-subscriber filter over each pushed result set.
  ///
  /// Joins the signature's connection if one is open, otherwise opens it.
  /// The latest snapshot, if any, is the first item.
  pub fn subscribe_live<T, F>(
    &self,
    signature: QuerySignature,
    query: RemoteQuery,
    filter: F,
  ) -> LiveSubscription<T>
  where
    T: Document,
    F: Fn(&T) -> bool + Send + Sync + 'static,
  {
    let mut connections = self.registry.lock();

    let existing = connections.get_mut(&signature).and_then(|connection| {
      let channel = connection
        .channel
        .downcast_ref::<Arc<Channel<T>>>()?
        .clone();
      connection.subscribers += 1;
      Some((channel, connection.generation))
    });

    let (channel, generation) = match existing {
      Some(joined) => {
        debug!(signature = %signature, "joining live connection");
        joined
      }
      None => {
        let generation = self.registry.next_generation.fetch_add(1, Ordering::Relaxed);
        let channel = Arc::new(Channel::<T>::new());
        let task = tokio::spawn(run_connection(
          Arc::clone(&self.remote),
          query,
          signature.clone(),
          generation,
          self.policy.clone(),
          Arc::clone(&channel),
          Arc::clone(&self.registry),
        ));
        let stalled = Arc::clone(&channel);
        let replaced = connections.insert(
          signature.clone(),
          Connection {
            generation,
            subscribers: 1,
            task: task.abort_handle(),
            channel: Box::new(Arc::clone(&channel)),
            stall: Box::new(move |error| stalled.publish(LiveUpdate::Stalled { error })),
          },
        );
        if let Some(old) = replaced {
          warn!(signature = %signature, "signature reused for another document type");
          old.task.abort();
          (old.stall)(format!("live connection {} replaced", signature));
        }
        info!(signature = %signature, "opening live connection");
        (channel, generation)
      }
    };

    // Attach under the registry lock: a connection that stalls has either
    // already left the registry or will still reach this receiver
    let (initial, updates) = channel.attach();
    drop(connections);

    LiveSubscription::new(
      initial,
      updates,
      channel,
      Arc::new(filter),
      Detach {
        registry: Arc::clone(&self.registry),
        signature,
        generation,
      },
    )
  }
}

async fn run_connection<R: RemoteStore, T: Document>(
  remote: Arc<R>,
  query: RemoteQuery,
  signature: QuerySignature,
  generation: u64,
  policy: ReconnectPolicy,
  channel: Arc<Channel<T>>,
  registry: Arc<Registry>,
) {
  let mut attempt: u32 = 0;

  let reason = loop {
    let failure = match remote.subscribe::<T>(&query).await {
      Ok(mut feed) => {
        debug!(signature = %signature, "push feed open");
        loop {
          match feed.next().await {
            Some(Ok(items)) => {
              attempt = 0;
              channel.publish(LiveUpdate::Snapshot(items));
            }
            Some(Err(e)) => break e.to_string(),
            None => break "push feed ended".to_string(),
          }
        }
      }
      Err(e) => e.to_string(),
    };

    attempt += 1;
    if attempt > policy.max_attempts {
      break failure;
    }
    let delay = policy.delay_for(attempt);
    warn!(
      signature = %signature,
      attempt,
      delay_ms = delay.as_millis() as u64,
      error = %failure,
      "live connection lost, reconnecting"
    );
    channel.publish(LiveUpdate::Reconnecting {
      attempt,
      error: failure,
    });
    tokio::time::sleep(delay).await;
  };

  error!(signature = %signature, error = %reason, "live connection stalled");
  registry.remove(&signature, generation);
  channel.publish(LiveUpdate::Stalled { error: reason });
}

struct Detach {
  registry: Arc<Registry>,
  signature: QuerySignature,
  generation: u64,
}

type Filter<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

struct Subscriber<T> {
  updates: broadcast::Receiver<LiveUpdate<T>>,
  channel: Arc<Channel<T>>,
  filter: Filter<T>,
  done: bool,
}

impl<T: Clone> Subscriber<T> {
  fn filtered(&self, items: Vec<T>) -> LiveUpdate<T> {
    LiveUpdate::Snapshot(items.into_iter().filter(|item| (self.filter)(item)).collect())
  }

  async fn next_update(&mut self) -> Option<LiveUpdate<T>> {
    if self.done {
      return None;
    }
    loop {
      let update = match self.updates.recv().await {
        Ok(update) => update,
        // Snapshots are whole; catching up means taking the newest one
        Err(RecvError::Lagged(skipped)) => {
          debug!(skipped, "live subscriber lagged, resyncing");
          let latest = self.channel.latest().clone();
          match latest {
            Some(items) => LiveUpdate::Snapshot(items),
            None => continue,
          }
        }
        Err(RecvError::Closed) => return None,
      };
      return Some(match update {
        LiveUpdate::Snapshot(items) => self.filtered(items),
        stalled @ LiveUpdate::Stalled { .. } => {
          self.done = true;
          stalled
        }
        reconnecting => reconnecting,
      });
    }
  }
}

/// A subscriber's view of a live query.
///
/// Dropping it (or calling [`close`](Self::close)) detaches; the connection
/// closes when its last subscriber detaches.
pub struct LiveSubscription<T> {
  updates: BoxStream<'static, LiveUpdate<T>>,
  detach: Option<Detach>,
}

impl<T: Document> LiveSubscription<T> {
  fn new(
    initial: Option<Vec<T>>,
    updates: broadcast::Receiver<LiveUpdate<T>>,
    channel: Arc<Channel<T>>,
    filter: Filter<T>,
    detach: Detach,
  ) -> Self {
    let subscriber = Subscriber {
      updates,
      channel,
      filter,
      done: false,
    };
    let initial = initial.map(|items| subscriber.filtered(items));
    let rest = stream::unfold(subscriber, |mut subscriber| async move {
      let update = subscriber.next_update().await?;
      Some((update, subscriber))
    });

    Self {
      updates: stream::iter(initial).chain(rest).boxed(),
      detach: Some(detach),
    }
  }
}

impl<T> LiveSubscription<T> {
  pub fn close(mut self) {
    self.release();
  }

  fn release(&mut self) {
    if let Some(detach) = self.detach.take() {
      detach.registry.detach(&detach.signature, detach.generation);
    }
  }
}

impl<T> Stream for LiveSubscription<T> {
  type Item = LiveUpdate<T>;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    self.updates.poll_next_unpin(cx)
  }
}

impl<T> Drop for LiveSubscription<T> {
  fn drop(&mut self) {
    self.release();
  }
}
