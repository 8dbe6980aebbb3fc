//! Query signatures: stable identifiers for logical queries.
//!
//! A signature is both the cache key for a list query and the de-duplication
//! key for in-flight fetches and live connections.

use sha2::{Digest, Sha256};
use std::fmt;

use crate::models::{Event, LiveGame, NewsItem, Player, Team, User};
use crate::remote::{Document, FieldValue, RemoteQuery};

/// Opaque identifier for a logical query (filter + entity type).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QuerySignature(String);

impl QuerySignature {
  pub fn new(signature: impl Into<String>) -> Self {
    Self(signature.into())
  }

  /// Signature of a single entity looked up by id.
  pub fn entity<T: Document>(id: &str) -> Self {
    Self(format!("{}:{}", T::entity_type(), normalize_id(id)))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// SHA256 hash for stable, fixed-length storage keys
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.0.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for QuerySignature {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for QuerySignature {
  fn from(s: &str) -> Self {
    Self::new(s)
  }
}

/// The list queries the front end issues.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RosterQuery {
  AllTeams,
  PlayersForTeam { team_id: String },
  AllEvents,
  /// Events the given user attends. Identity-scoped.
  EventsForUser { user_id: String },
  AllUsers,
  News,
  /// Live games, optionally for one team
  LiveGames { team_id: Option<String> },
}

impl RosterQuery {
  pub fn signature(&self) -> QuerySignature {
    let s = match self {
      Self::AllTeams => "teams:all".to_string(),
      Self::PlayersForTeam { team_id } => format!("players-for-team:{}", normalize_id(team_id)),
      Self::AllEvents => "all-events".to_string(),
      Self::EventsForUser { user_id } => format!("events-for-user:{}", normalize_id(user_id)),
      Self::AllUsers => "users:all".to_string(),
      Self::News => "news:all".to_string(),
      Self::LiveGames { team_id } => match team_id {
        Some(team) => format!("live-games:{}", normalize_id(team)),
        None => "live-games:all".to_string(),
      },
    };
    QuerySignature(s)
  }

  /// The remote query that materializes this result set.
  ///
  /// Live game queries fetch the whole collection; per-team narrowing happens
  /// in the subscriber's filter so every screen shares one connection.
  pub fn remote_query(&self) -> RemoteQuery {
    match self {
      Self::AllTeams => RemoteQuery::new(Team::collection()),
      Self::PlayersForTeam { team_id } => RemoteQuery::new(Player::collection())
        .where_eq("teamId", FieldValue::Text(normalize_id(team_id))),
      Self::AllEvents => RemoteQuery::new(Event::collection()),
      Self::EventsForUser { user_id } => RemoteQuery::new(Event::collection())
        .where_contains("attendeeIds", FieldValue::Text(normalize_id(user_id))),
      Self::AllUsers => RemoteQuery::new(User::collection()),
      Self::News => RemoteQuery::new(NewsItem::collection()),
      Self::LiveGames { .. } => RemoteQuery::new(LiveGame::collection()),
    }
  }

  pub fn requires_identity(&self) -> bool {
    matches!(self, Self::EventsForUser { .. })
  }

  pub fn description(&self) -> String {
    match self {
      Self::AllTeams => "all teams".to_string(),
      Self::PlayersForTeam { team_id } => format!("players of team {}", team_id),
      Self::AllEvents => "all events".to_string(),
      Self::EventsForUser { user_id } => format!("events for user {}", user_id),
      Self::AllUsers => "all users".to_string(),
      Self::News => "news".to_string(),
      Self::LiveGames { team_id } => match team_id {
        Some(team) => format!("live games for team {}", team),
        None => "all live games".to_string(),
      },
    }
  }
}

/// Ids come from user input and URLs; trim them so " t1" and "t1" share a cache slot.
fn normalize_id(id: &str) -> String {
  id.trim().to_string()
}
