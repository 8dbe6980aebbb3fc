//! Typed domain entities and their decoding from remote documents.
//!
//! Documents decode in a single serde step. Required fields are required:
//! a missing or mistyped field is reported as a [`DecodeError`] naming the
//! collection and document id instead of being papered over with a default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::cache::{Cacheable, SyncValue};
use crate::remote::Document;

/// A remote document that failed to match its schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to decode {collection}/{id}: {message}")]
pub struct DecodeError {
  pub collection: String,
  pub id: String,
  pub message: String,
}

/// Decode one raw document into its typed entity.
pub fn decode_document<T: Document>(raw: Value) -> Result<T, DecodeError> {
  let id = raw
    .get("id")
    .and_then(Value::as_str)
    .unwrap_or("<missing id>")
    .to_string();

  serde_json::from_value(raw).map_err(|e| DecodeError {
    collection: T::collection().to_string(),
    id,
    message: e.to_string(),
  })
}

/// Decode a result set. The first bad document fails the whole set.
pub fn decode_documents<T: Document>(raw: Vec<Value>) -> Result<Vec<T>, DecodeError> {
  raw.into_iter().map(decode_document).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
  pub id: String,
  pub name: String,
  pub club: Option<String>,
  pub age_group: Option<String>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
  pub id: String,
  pub team_id: String,
  pub name: String,
  pub shirt_number: Option<u32>,
  pub position: Option<String>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
  pub id: String,
  pub title: String,
  pub starts_at: DateTime<Utc>,
  pub location: Option<String>,
  pub attendee_ids: Vec<String>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewsItem {
  pub id: String,
  pub title: String,
  pub body: String,
  pub author: Option<String>,
  pub published_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
  Scheduled,
  InProgress,
  Finished,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveGame {
  pub id: String,
  pub home_team_id: String,
  pub away_team_id: String,
  pub home_score: u32,
  pub away_score: u32,
  pub status: GameStatus,
  pub updated_at: DateTime<Utc>,
}

impl LiveGame {
  pub fn involves(&self, team_id: &str) -> bool {
    self.home_team_id == team_id || self.away_team_id == team_id
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
  pub id: String,
  pub display_name: String,
  pub email: Option<String>,
  pub team_ids: Vec<String>,
  pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Cacheable / Document implementations
// ============================================================================

macro_rules! document {
  ($ty:ty, $entity_type:literal, $collection:literal) => {
    impl Cacheable for $ty {
      fn cache_key(&self) -> String {
        self.id.clone()
      }

      fn updated_at(&self) -> Option<DateTime<Utc>> {
        Some(self.updated_at)
      }

      fn entity_type() -> &'static str {
        $entity_type
      }
    }

    impl Document for $ty {
      fn collection() -> &'static str {
        $collection
      }

      fn id(&self) -> &str {
        &self.id
      }
    }

    impl SyncValue for $ty {}
  };
}

document!(Team, "team", "teams");
document!(Player, "player", "players");
document!(Event, "event", "events");
document!(NewsItem, "news_item", "news");
document!(LiveGame, "live_game", "live_games");
document!(User, "user", "users");

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_decode_team() {
    let team: Team = decode_document(json!({
      "id": "t1",
      "name": "Falcons",
      "club": null,
      "ageGroup": "U14",
      "updatedAt": "2026-03-01T10:00:00Z"
    }))
    .unwrap();

    assert_eq!(team.name, "Falcons");
    assert_eq!(team.age_group.as_deref(), Some("U14"));
    assert!(team.club.is_none());
  }

  #[test]
  fn test_missing_optional_field_is_none() {
    let player: Player = decode_document(json!({
      "id": "p1",
      "teamId": "t1",
      "name": "Sam",
      "updatedAt": "2026-03-01T10:00:00Z"
    }))
    .unwrap();

    assert!(player.shirt_number.is_none());
    assert!(player.position.is_none());
  }

  #[test]
  fn test_missing_required_field_fails_closed() {
    let err = decode_document::<Team>(json!({
      "id": "t9",
      "updatedAt": "2026-03-01T10:00:00Z"
    }))
    .unwrap_err();

    assert_eq!(err.collection, "teams");
    assert_eq!(err.id, "t9");
    assert!(err.message.contains("name"));
  }

  #[test]
  fn test_wrong_type_fails_closed() {
    let err = decode_document::<LiveGame>(json!({
      "id": "g1",
      "homeTeamId": "t1",
      "awayTeamId": "t2",
      "homeScore": "three",
      "awayScore": 1,
      "status": "in_progress",
      "updatedAt": "2026-03-01T10:00:00Z"
    }))
    .unwrap_err();

    assert_eq!(err.id, "g1");
  }

  #[test]
  fn test_one_bad_document_fails_the_set() {
    let result = decode_documents::<Team>(vec![
      json!({
        "id": "t1",
        "name": "A",
        "club": null,
        "ageGroup": null,
        "updatedAt": "2026-03-01T10:00:00Z"
      }),
      json!({"id": "t2"}),
    ]);
    let err = result.unwrap_err();
    assert_eq!(err.id, "t2");
    assert!(err.to_string().starts_with("failed to decode teams/t2: "));
  }

  #[test]
  fn test_missing_id_is_reported() {
    let err = decode_document::<Team>(json!({"name": "A"})).unwrap_err();
    assert_eq!(err.id, "<missing id>");
  }

  #[test]
  fn test_live_game_involves_either_side() {
    let game = LiveGame {
      id: "g1".into(),
      home_team_id: "t1".into(),
      away_team_id: "t2".into(),
      home_score: 0,
      away_score: 0,
      status: GameStatus::InProgress,
      updated_at: Utc::now(),
    };
    assert!(game.involves("t1"));
    assert!(game.involves("t2"));
    assert!(!game.involves("t3"));
  }
}
