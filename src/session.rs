//! Signed-in identity, as seen by the sync core.
//!
//! Authentication itself happens elsewhere; the core only asks "who is
//! signed in right now" before running identity-scoped queries.

use std::sync::{PoisonError, RwLock};

/// Source of the current user's identity.
pub trait IdentityProvider: Send + Sync {
  fn current_user(&self) -> Option<String>;
}

/// Identity holder updated by the auth flow.
#[derive(Debug, Default)]
pub struct Session {
  user_id: RwLock<Option<String>>,
}

impl Session {
  pub fn new(user_id: Option<String>) -> Self {
    Self {
      user_id: RwLock::new(user_id),
    }
  }

  pub fn sign_in(&self, user_id: impl Into<String>) {
    *self.user_id.write().unwrap_or_else(PoisonError::into_inner) = Some(user_id.into());
  }

  pub fn sign_out(&self) {
    *self.user_id.write().unwrap_or_else(PoisonError::into_inner) = None;
  }
}

impl IdentityProvider for Session {
  fn current_user(&self) -> Option<String> {
    self
      .user_id
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }
}
