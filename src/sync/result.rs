//! Emissions of a synchronized query.

use crate::error::SyncError;

/// One emission on a synchronized query stream.
///
/// Once a subscription has emitted a value, later `Loading` and `Error`
/// emissions carry it (or a newer one) as `partial`; data never disappears
/// because a refetch failed.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncResult<T> {
  /// A fetch may follow; `partial` is what we already have
  Loading { partial: Option<T> },
  /// Settled on a value
  Success { value: T },
  /// The refetch failed; `partial` is the last good value
  Error {
    error: SyncError,
    partial: Option<T>,
  },
}

impl<T> SyncResult<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, SyncResult::Loading { .. })
  }

  pub fn is_success(&self) -> bool {
    matches!(self, SyncResult::Success { .. })
  }

  pub fn is_error(&self) -> bool {
    matches!(self, SyncResult::Error { .. })
  }

  /// Whatever data this emission carries, settled or not.
  pub fn data(&self) -> Option<&T> {
    match self {
      SyncResult::Loading { partial } | SyncResult::Error { partial, .. } => partial.as_ref(),
      SyncResult::Success { value } => Some(value),
    }
  }

  pub fn into_data(self) -> Option<T> {
    match self {
      SyncResult::Loading { partial } | SyncResult::Error { partial, .. } => partial,
      SyncResult::Success { value } => Some(value),
    }
  }

  pub fn error(&self) -> Option<&SyncError> {
    match self {
      SyncResult::Error { error, .. } => Some(error),
      _ => None,
    }
  }
}
