//! Resumable cursor over an ordered remote query.

use tracing::{debug, warn};

use crate::error::SyncError;
use crate::remote::{CursorKey, Document, OrderBy, PageRequest, RemoteQuery, RemoteStore};
use std::sync::Arc;

/// Where the next page starts.
#[derive(Debug, Clone, PartialEq)]
pub struct PaginationCursor {
  pub order: OrderBy,
  pub page_size: usize,
  /// Sort key of the last item delivered; `None` before the first page
  pub last_key: Option<CursorKey>,
}

impl PaginationCursor {
  fn request(&self) -> PageRequest {
    PageRequest {
      order: self.order.clone(),
      limit: self.page_size,
      start_after: self.last_key.clone(),
    }
  }
}

/// Pages through a remote collection in a fixed order.
///
/// The cursor only moves after a page arrives, so a failed load can simply
/// be retried: nothing is skipped and nothing repeats.
pub struct Paginator<T, R> {
  remote: Arc<R>,
  query: RemoteQuery,
  cursor: PaginationCursor,
  started: bool,
  items: Vec<T>,
}

impl<T: Document, R: RemoteStore> Paginator<T, R> {
  pub fn new(remote: Arc<R>, query: RemoteQuery, order: OrderBy, page_size: usize) -> Self {
    Self {
      remote,
      query,
      cursor: PaginationCursor {
        order,
        page_size: page_size.max(1),
        last_key: None,
      },
      started: false,
      items: Vec::new(),
    }
  }

  /// Everything loaded since the last `load_first_page`.
  pub fn items(&self) -> &[T] {
    &self.items
  }

  pub fn cursor(&self) -> &PaginationCursor {
    &self.cursor
  }

  /// Reset and load page one. Accumulated items are only discarded once it arrives.
  pub async fn load_first_page(&mut self) -> Result<Vec<T>, SyncError> {
    let mut request = self.cursor.request();
    request.start_after = None;

    let page = self.fetch(&request).await?;
    self.items.clear();
    self.cursor.last_key = None;
    self.started = true;
    Ok(self.accept(page))
  }

  /// Load the page after the cursor. Empty at the end of the collection.
  pub async fn load_next_page(&mut self) -> Result<Vec<T>, SyncError> {
    if !self.started {
      return self.load_first_page().await;
    }

    let request = self.cursor.request();
    let page = self.fetch(&request).await?;
    Ok(self.accept(page))
  }

  async fn fetch(&self, request: &PageRequest) -> Result<Vec<T>, SyncError> {
    debug!(
      collection = %self.query.collection,
      order_by = %request.order.field,
      limit = request.limit,
      "loading page"
    );
    match self.remote.fetch_page::<T>(&self.query, request).await {
      Ok(page) => Ok(page.items),
      Err(e) => {
        warn!(collection = %self.query.collection, error = %e, "page load failed");
        Err(SyncError::fetch_failure(e))
      }
    }
  }

  /// Keep only items strictly past the cursor, then advance it.
  fn accept(&mut self, page: Vec<T>) -> Vec<T> {
    let order = &self.cursor.order;
    let page: Vec<T> = match &self.cursor.last_key {
      Some(last) => page
        .into_iter()
        .filter(|item| order.is_after(&CursorKey::for_document(item, &order.field), last))
        .collect(),
      None => page,
    };

    if let Some(last) = page.last() {
      self.cursor.last_key = Some(CursorKey::for_document(last, &self.cursor.order.field));
    }
    self.items.extend(page.iter().cloned());
    page
  }
}
