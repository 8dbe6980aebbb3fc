//! HTTP client for the hosted document store.
//!
//! Wire format:
//! - `GET  {base}/v1/{collection}?where=field:op:value` -> `{"documents": [...]}`
//! - paged requests add `orderBy`, `direction`, `limit`, `startAfter`, `startAfterId`
//! - `GET  {base}/v1/{collection}:listen` -> `text/event-stream`, one full
//!   document array per `data:` event
//! - `PUT` / `DELETE {base}/v1/{collection}/{id}` for writes

use color_eyre::{eyre::eyre, Result};
use futures::StreamExt;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::collections::VecDeque;
use tracing::{debug, warn};
use url::Url;

use super::event_stream::EventStreamDecoder;
use super::query::{Page, PageRequest, RemoteQuery};
use super::{Document, PushFeed, RemoteError, RemoteStore};
use crate::config::{Config, RemoteConfig};
use crate::models::decode_documents;

#[derive(Debug, Deserialize)]
struct ListResponse {
  documents: Vec<Value>,
}

/// Document store client over HTTP.
#[derive(Clone)]
pub struct HttpDocumentStore {
  client: reqwest::Client,
  base: Url,
  token: Option<String>,
}

impl HttpDocumentStore {
  pub fn new(config: &RemoteConfig) -> Result<Self> {
    if config.url.is_empty() {
      return Err(eyre!("remote.url is not configured"));
    }

    // Url::join drops the last segment unless the base ends with a slash
    let mut base = config.url.clone();
    if !base.ends_with('/') {
      base.push('/');
    }
    let mut base =
      Url::parse(&base).map_err(|e| eyre!("Invalid remote.url {}: {}", config.url, e))?;
    if let Some(project) = &config.project {
      base = base
        .join(&format!("{}/", project.trim_matches('/')))
        .map_err(|e| eyre!("Invalid remote.project {}: {}", project, e))?;
    }

    let client = reqwest::Client::builder()
      .gzip(true)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      token: Config::get_api_token(),
    })
  }

  fn url(&self, path: &str) -> Result<Url, RemoteError> {
    self
      .base
      .join(&format!("v1/{}", path))
      .map_err(|e| RemoteError::InvalidResponse(format!("bad url for {}: {}", path, e)))
  }

  fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
    match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    }
  }

  async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
    let response = self
      .authorize(request)
      .send()
      .await
      .map_err(|e| RemoteError::Connection(e.to_string()))?;

    match response.status() {
      StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RemoteError::Unauthorized),
      status if !status.is_success() => {
        let message = response.text().await.unwrap_or_default();
        Err(RemoteError::Status {
          status: status.as_u16(),
          message,
        })
      }
      _ => Ok(response),
    }
  }

  fn with_filters(url: &mut Url, query: &RemoteQuery) {
    if query.filters.is_empty() {
      return;
    }
    let mut pairs = url.query_pairs_mut();
    for filter in &query.filters {
      pairs.append_pair("where", &filter.encode());
    }
  }

  async fn list(&self, url: Url) -> Result<Vec<Value>, RemoteError> {
    debug!(url = %url, "fetching documents");
    let response = self.send(self.client.get(url)).await?;
    let body: ListResponse = response
      .json()
      .await
      .map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;
    Ok(body.documents)
  }
}

/// Turn one event payload into a typed snapshot.
fn decode_snapshot<T: Document>(payload: &str) -> Result<Vec<T>, RemoteError> {
  let raw: Vec<Value> =
    serde_json::from_str(payload).map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;
  Ok(decode_documents(raw)?)
}

impl RemoteStore for HttpDocumentStore {
  async fn fetch<T: Document>(&self, query: &RemoteQuery) -> Result<Vec<T>, RemoteError> {
    let mut url = self.url(&query.collection)?;
    Self::with_filters(&mut url, query);
    let raw = self.list(url).await?;
    Ok(decode_documents(raw)?)
  }

  async fn fetch_page<T: Document>(
    &self,
    query: &RemoteQuery,
    page: &PageRequest,
  ) -> Result<Page<T>, RemoteError> {
    let mut url = self.url(&query.collection)?;
    Self::with_filters(&mut url, query);
    {
      let mut pairs = url.query_pairs_mut();
      pairs
        .append_pair("orderBy", &page.order.field)
        .append_pair("direction", page.order.direction.as_str())
        .append_pair("limit", &page.limit.to_string());
      if let Some(cursor) = &page.start_after {
        pairs
          .append_pair("startAfter", &cursor.value.to_string())
          .append_pair("startAfterId", &cursor.id);
      }
    }
    let raw = self.list(url).await?;
    Ok(Page {
      items: decode_documents(raw)?,
    })
  }

  async fn subscribe<T: Document>(&self, query: &RemoteQuery) -> Result<PushFeed<T>, RemoteError> {
    let mut url = self.url(&format!("{}:listen", query.collection))?;
    Self::with_filters(&mut url, query);
    debug!(url = %url, "opening push feed");

    let response = self
      .send(
        self
          .client
          .get(url)
          .header(reqwest::header::ACCEPT, "text/event-stream"),
      )
      .await?;

    let state = (
      response.bytes_stream().boxed(),
      EventStreamDecoder::new(),
      VecDeque::<String>::new(),
    );

    let feed = futures::stream::unfold(state, |(mut body, mut decoder, mut pending)| async move {
      loop {
        if let Some(payload) = pending.pop_front() {
          let snapshot = decode_snapshot::<T>(&payload);
          return Some((snapshot, (body, decoder, pending)));
        }
        match body.next().await {
          Some(Ok(chunk)) => match decoder.push(&chunk) {
            Ok(events) => pending.extend(events),
            Err(err) => {
              warn!(error = %err, "push feed body is unreadable");
              return Some((Err(err), (futures::stream::empty().boxed(), decoder, pending)));
            }
          },
          Some(Err(e)) => {
            warn!(error = %e, "push feed body failed");
            let err = RemoteError::Connection(e.to_string());
            // Yield the error once; the next poll sees the exhausted body
            return Some((Err(err), (futures::stream::empty().boxed(), decoder, pending)));
          }
          None => return None,
        }
      }
    });

    Ok(feed.boxed())
  }

  async fn put<T: Document>(&self, document: &T) -> Result<(), RemoteError> {
    let url = self.url(&format!("{}/{}", T::collection(), document.id()))?;
    self.send(self.client.put(url).json(document)).await?;
    Ok(())
  }

  async fn delete<T: Document>(&self, id: &str) -> Result<(), RemoteError> {
    let url = self.url(&format!("{}/{}", T::collection(), id))?;
    self.send(self.client.delete(url)).await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::Team;

  fn config(url: &str, project: Option<&str>) -> RemoteConfig {
    RemoteConfig {
      url: url.to_string(),
      project: project.map(String::from),
    }
  }

  #[test]
  fn test_requires_url() {
    assert!(HttpDocumentStore::new(&config("", None)).is_err());
  }

  #[test]
  fn test_collection_url_keeps_base_path() {
    let store = HttpDocumentStore::new(&config("https://store.example.com/api", None)).unwrap();
    assert_eq!(
      store.url("teams").unwrap().as_str(),
      "https://store.example.com/api/v1/teams"
    );
  }

  #[test]
  fn test_project_is_prefixed() {
    let store =
      HttpDocumentStore::new(&config("https://store.example.com/", Some("club-42"))).unwrap();
    assert_eq!(
      store.url("teams:listen").unwrap().as_str(),
      "https://store.example.com/club-42/v1/teams:listen"
    );
  }

  #[test]
  fn test_filters_become_where_params() {
    let store = HttpDocumentStore::new(&config("https://store.example.com/", None)).unwrap();
    let mut url = store.url("players").unwrap();
    let query = RemoteQuery::new("players").where_eq(
      "teamId",
      crate::remote::FieldValue::Text("t1".into()),
    );
    HttpDocumentStore::with_filters(&mut url, &query);
    assert_eq!(url.query(), Some("where=teamId%3Aeq%3At1"));
  }

  #[test]
  fn test_decode_snapshot_fails_closed() {
    let err = decode_snapshot::<Team>(r#"[{"id": "t1"}]"#).unwrap_err();
    assert!(matches!(err, RemoteError::Decode(_)));

    let err = decode_snapshot::<Team>("not json").unwrap_err();
    assert!(matches!(err, RemoteError::InvalidResponse(_)));
  }
}
