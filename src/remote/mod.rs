//! Accessors for the hosted document store.
//!
//! The sync core only depends on three shapes: a one-shot fetch, a push feed
//! of full result sets, and an ordered paged fetch. Transport and query
//! language stay behind the [`RemoteStore`] trait.

mod event_stream;
mod http;
mod memory;
mod query;

use futures::stream::BoxStream;
use std::future::Future;
use thiserror::Error;

use crate::cache::Cacheable;
use crate::models::DecodeError;

pub use http::HttpDocumentStore;
pub use memory::MemoryDocumentStore;
pub use query::{
  CursorKey, Direction, FieldValue, Filter, FilterOp, OrderBy, Page, PageRequest, RemoteQuery,
};

/// An entity stored as a document in a remote collection.
pub trait Document: Cacheable {
  /// Collection the document lives in (e.g., "teams")
  fn collection() -> &'static str;

  /// Document id, unique within the collection
  fn id(&self) -> &str;
}

/// Transport-level failures from a remote store.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
  #[error("connection error: {0}")]
  Connection(String),
  #[error("server returned status {status}: {message}")]
  Status { status: u16, message: String },
  #[error("unauthorized")]
  Unauthorized,
  #[error("invalid response: {0}")]
  InvalidResponse(String),
  #[error(transparent)]
  Decode(#[from] DecodeError),
}

/// A live feed: each item is the full materialized result set after a change.
pub type PushFeed<T> = BoxStream<'static, Result<Vec<T>, RemoteError>>;

/// Request/response and push access to a remote document store.
pub trait RemoteStore: Send + Sync + 'static {
  /// Fetch the full result set for a query.
  fn fetch<T: Document>(
    &self,
    query: &RemoteQuery,
  ) -> impl Future<Output = Result<Vec<T>, RemoteError>> + Send;

  /// Fetch one page of an ordered query, starting after the request's cursor.
  fn fetch_page<T: Document>(
    &self,
    query: &RemoteQuery,
    page: &PageRequest,
  ) -> impl Future<Output = Result<Page<T>, RemoteError>> + Send;

  /// Open a push feed. The first item is the current result set.
  fn subscribe<T: Document>(
    &self,
    query: &RemoteQuery,
  ) -> impl Future<Output = Result<PushFeed<T>, RemoteError>> + Send;

  /// Create or replace a document.
  fn put<T: Document>(&self, document: &T) -> impl Future<Output = Result<(), RemoteError>> + Send;

  /// Delete a document by id.
  fn delete<T: Document>(&self, id: &str)
    -> impl Future<Output = Result<(), RemoteError>> + Send;
}
