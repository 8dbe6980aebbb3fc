//! Error taxonomy surfaced by the sync core.
//!
//! An empty result is not an error: it is a `Success` carrying an empty list.

use thiserror::Error;

use crate::models::DecodeError;
use crate::remote::RemoteError;

/// Errors delivered to callers of the synchronizer, live bridge and paginator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
  /// No signed-in identity for an identity-scoped query
  #[error("not authenticated")]
  NotAuthenticated,
  /// Remote fetch failed; cached data is preserved alongside this error
  #[error("network failure: {0}")]
  NetworkFailure(String),
  /// Pagination request failed; the cursor did not move
  #[error("fetch failure: {0}")]
  FetchFailure(String),
  /// A single document lookup found nothing
  #[error("{collection}/{id} not found")]
  NotFound { collection: String, id: String },
  /// A remote document did not match its schema
  #[error("failed to decode {collection}/{id}: {message}")]
  Decode {
    collection: String,
    id: String,
    message: String,
  },
}

impl From<DecodeError> for SyncError {
  fn from(e: DecodeError) -> Self {
    SyncError::Decode {
      collection: e.collection,
      id: e.id,
      message: e.message,
    }
  }
}

impl From<RemoteError> for SyncError {
  fn from(e: RemoteError) -> Self {
    match e {
      RemoteError::Unauthorized => SyncError::NotAuthenticated,
      RemoteError::Decode(decode) => decode.into(),
      other => SyncError::NetworkFailure(other.to_string()),
    }
  }
}

impl SyncError {
  /// Pagination surfaces every remote failure as a cursor-preserving fetch failure.
  pub fn fetch_failure(e: RemoteError) -> Self {
    SyncError::FetchFailure(e.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_unauthorized_maps_to_not_authenticated() {
    assert_eq!(
      SyncError::from(RemoteError::Unauthorized),
      SyncError::NotAuthenticated
    );
  }

  #[test]
  fn test_connection_error_maps_to_network_failure() {
    let err = SyncError::from(RemoteError::Connection("reset by peer".into()));
    assert!(matches!(err, SyncError::NetworkFailure(msg) if msg.contains("reset by peer")));
  }

  #[test]
  fn test_decode_keeps_document_context() {
    let err = SyncError::from(RemoteError::Decode(DecodeError {
      collection: "teams".into(),
      id: "t1".into(),
      message: "missing field `name`".into(),
    }));
    assert_eq!(
      err.to_string(),
      "failed to decode teams/t1: missing field `name`"
    );
  }
}
