//! Roster data access with transparent caching.
//!
//! Wraps the remote store and the sync core behind one API per entity type,
//! the way screens consume it: cached streams for browse lists, live
//! subscriptions for match screens, a paginator for the news feed.

use color_eyre::Result;
use std::sync::Arc;
use tracing::info;

use crate::cache::CacheStorage;
use crate::config::Config;
use crate::error::SyncError;
use crate::models::{Event, GameStatus, LiveGame, NewsItem, Player, Team, User};
use crate::remote::{Document, FieldValue, OrderBy, RemoteQuery, RemoteStore};
use crate::session::{IdentityProvider, Session};
use crate::signature::RosterQuery;
use crate::sync::{LiveBridge, LiveSubscription, Paginator, Resource, SyncStream, Synchronizer};

/// News is browsed newest first.
const NEWS_ORDER_FIELD: &str = "publishedAt";

pub struct Repository<S: CacheStorage, R: RemoteStore> {
  remote: Arc<R>,
  sync: Synchronizer<S>,
  live: LiveBridge<R>,
  session: Arc<Session>,
  page_size: usize,
}

impl<S: CacheStorage, R: RemoteStore> Clone for Repository<S, R> {
  fn clone(&self) -> Self {
    Self {
      remote: Arc::clone(&self.remote),
      sync: self.sync.clone(),
      live: self.live.clone(),
      session: Arc::clone(&self.session),
      page_size: self.page_size,
    }
  }
}

impl<S: CacheStorage, R: RemoteStore> Repository<S, R> {
  pub fn new(storage: Arc<S>, remote: Arc<R>, session: Arc<Session>, config: &Config) -> Self {
    let identity: Arc<dyn IdentityProvider> = session.clone();
    let sync = Synchronizer::new(storage, identity).with_policy(config.staleness.policy());
    let live = LiveBridge::new(Arc::clone(&remote), config.live.reconnect_policy());

    Self {
      remote,
      sync,
      live,
      session,
      page_size: config.pagination.page_size,
    }
  }

  pub fn session(&self) -> &Arc<Session> {
    &self.session
  }

  pub fn synchronizer(&self) -> &Synchronizer<S> {
    &self.sync
  }

  /// Configured default page size.
  pub fn page_size(&self) -> usize {
    self.page_size
  }

  fn list<E: Document>(&self, query: &RosterQuery) -> Resource<Vec<E>> {
    let remote = Arc::clone(&self.remote);
    let remote_query = query.remote_query();
    let resource = self.sync.list_resource(query.signature(), move || {
      let remote = Arc::clone(&remote);
      let remote_query = remote_query.clone();
      async move {
        remote
          .fetch::<E>(&remote_query)
          .await
          .map_err(SyncError::from)
      }
    });

    if query.requires_identity() {
      resource.requires_identity()
    } else {
      resource
    }
  }

  pub fn teams(&self) -> Result<SyncStream<Vec<Team>>, SyncError> {
    self.sync.observe(self.list(&RosterQuery::AllTeams))
  }

  /// Teams, fetched even if the cache is fresh.
  pub fn refresh_teams(&self) -> Result<SyncStream<Vec<Team>>, SyncError> {
    self.sync.refresh(self.list(&RosterQuery::AllTeams))
  }

  pub fn team(&self, id: &str) -> Result<SyncStream<Team>, SyncError> {
    let remote = Arc::clone(&self.remote);
    let id = id.trim().to_string();
    let lookup = id.clone();
    let resource = self.sync.entity_resource::<Team, _, _>(&id, move || {
      let remote = Arc::clone(&remote);
      let id = lookup.clone();
      async move {
        let query =
          RemoteQuery::new(Team::collection()).where_eq("id", FieldValue::Text(id.clone()));
        let found: Vec<Team> = remote.fetch(&query).await.map_err(SyncError::from)?;
        found.into_iter().next().ok_or(SyncError::NotFound {
          collection: Team::collection().to_string(),
          id,
        })
      }
    });
    self.sync.observe(resource)
  }

  pub fn players_for_team(&self, team_id: &str) -> Result<SyncStream<Vec<Player>>, SyncError> {
    self.sync.observe(self.list(&RosterQuery::PlayersForTeam {
      team_id: team_id.to_string(),
    }))
  }

  pub fn events(&self) -> Result<SyncStream<Vec<Event>>, SyncError> {
    self.sync.observe(self.list(&RosterQuery::AllEvents))
  }

  /// Events the signed-in user attends.
  pub fn events_for_current_user(&self) -> Result<SyncStream<Vec<Event>>, SyncError> {
    let user_id = self
      .session
      .current_user()
      .ok_or(SyncError::NotAuthenticated)?;
    self
      .sync
      .observe(self.list(&RosterQuery::EventsForUser { user_id }))
  }

  pub fn users(&self) -> Result<SyncStream<Vec<User>>, SyncError> {
    self.sync.observe(self.list(&RosterQuery::AllUsers))
  }

  /// A fresh paginator over the news feed, newest first.
  pub fn news_pages(&self, page_size: usize) -> Paginator<NewsItem, R> {
    Paginator::new(
      Arc::clone(&self.remote),
      RosterQuery::News.remote_query(),
      OrderBy::descending(NEWS_ORDER_FIELD),
      page_size,
    )
  }

  /// Games in progress, optionally only those involving one team.
  ///
  /// Every caller shares the one connection on the live games collection.
  pub fn live_games(&self, team_id: Option<&str>) -> LiveSubscription<LiveGame> {
    let all = RosterQuery::LiveGames { team_id: None };
    let team_id = team_id.map(|t| t.trim().to_string());
    self
      .live
      .subscribe_live(all.signature(), all.remote_query(), move |game: &LiveGame| {
        game.status == GameStatus::InProgress
          && team_id.as_deref().map_or(true, |team| game.involves(team))
      })
  }

  /// Write a team remotely, then overwrite its cache entry.
  pub async fn save_team(&self, team: &Team) -> Result<(), SyncError> {
    self.remote.put(team).await?;
    info!(team = %team.id, "team saved");

    self.sync.overwrite_entity(team);
    self.sync.invalidate(&RosterQuery::AllTeams.signature());
    Ok(())
  }

  /// Delete a team remotely, then drop every cache entry that held it.
  pub async fn delete_team(&self, id: &str) -> Result<(), SyncError> {
    self.remote.delete::<Team>(id).await?;
    info!(team = %id, "team deleted");

    self.sync.invalidate_entity::<Team>(id);
    self.sync.invalidate(&RosterQuery::AllTeams.signature());
    self.sync.invalidate(
      &RosterQuery::PlayersForTeam {
        team_id: id.to_string(),
      }
      .signature(),
    );
    Ok(())
  }

  /// Drop a cached query so its next observe refetches.
  pub fn invalidate(&self, query: &RosterQuery) {
    info!(query = %query.description(), "invalidating");
    self.sync.invalidate(&query.signature());
  }

  pub fn clear_cache(&self) -> Result<()> {
    self.sync.storage().clear()
  }

  pub fn close(&self) -> Result<()> {
    self.sync.storage().close()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::remote::MemoryDocumentStore;
  use crate::sync::{LiveUpdate, SyncResult};
  use chrono::{TimeZone, Utc};
  use futures::StreamExt;

  fn team(id: &str, name: &str) -> Team {
    Team {
      id: id.into(),
      name: name.into(),
      club: Some("FC Example".into()),
      age_group: None,
      updated_at: Utc::now(),
    }
  }

  fn player(id: &str, team_id: &str) -> Player {
    Player {
      id: id.into(),
      team_id: team_id.into(),
      name: format!("Player {}", id),
      shirt_number: Some(7),
      position: None,
      updated_at: Utc::now(),
    }
  }

  fn event(id: &str, attendees: &[&str]) -> Event {
    Event {
      id: id.into(),
      title: format!("Event {}", id),
      starts_at: Utc.with_ymd_and_hms(2026, 6, 1, 18, 0, 0).unwrap(),
      location: None,
      attendee_ids: attendees.iter().map(|a| a.to_string()).collect(),
      updated_at: Utc::now(),
    }
  }

  fn setup() -> (Repository<SqliteStorage, MemoryDocumentStore>, MemoryDocumentStore) {
    let remote = MemoryDocumentStore::new();
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let repo = Repository::new(
      storage,
      Arc::new(remote.clone()),
      Arc::new(Session::default()),
      &Config::default(),
    );
    (repo, remote)
  }

  async fn settled<T>(mut stream: SyncStream<T>) -> SyncResult<T> {
    stream.settled().await.unwrap()
  }

  #[tokio::test]
  async fn test_teams_are_served_from_cache_second_time() {
    let (repo, remote) = setup();
    remote.insert(&team("t1", "Under 12"));

    let first = settled(repo.teams().unwrap()).await;
    assert_eq!(first.data().unwrap().len(), 1);
    let second = settled(repo.teams().unwrap()).await;
    assert_eq!(second.data().unwrap().len(), 1);
    assert_eq!(remote.fetch_calls(), 1);

    let refreshed = settled(repo.refresh_teams().unwrap()).await;
    assert!(refreshed.is_success());
    assert_eq!(remote.fetch_calls(), 2);
  }

  #[tokio::test]
  async fn test_players_are_scoped_to_team() {
    let (repo, remote) = setup();
    remote.insert(&player("p1", "t1"));
    remote.insert(&player("p2", "t2"));

    let players = settled(repo.players_for_team(" t1 ").unwrap()).await.into_data().unwrap();
    assert_eq!(players.len(), 1);
    assert_eq!(players[0].id, "p1");
  }

  #[tokio::test]
  async fn test_my_events_need_a_signed_in_user() {
    let (repo, remote) = setup();
    remote.insert(&event("e1", &["u1"]));
    remote.insert(&event("e2", &["u2"]));

    assert!(matches!(
      repo.events_for_current_user(),
      Err(SyncError::NotAuthenticated)
    ));

    repo.session().sign_in("u1");
    let events = settled(repo.events_for_current_user().unwrap()).await.into_data().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, "e1");

    let all = settled(repo.events().unwrap()).await.into_data().unwrap();
    assert_eq!(all.len(), 2);
  }

  #[tokio::test]
  async fn test_missing_team_is_not_found() {
    let (repo, _remote) = setup();

    match settled(repo.team("nope").unwrap()).await {
      SyncResult::Error {
        error: SyncError::NotFound { collection, id },
        partial: None,
      } => {
        assert_eq!(collection, "teams");
        assert_eq!(id, "nope");
      }
      other => panic!("expected not found, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_save_team_updates_open_streams() {
    let (repo, remote) = setup();
    remote.insert(&team("t1", "Under 12"));

    let mut teams = repo.teams().unwrap();
    assert_eq!(teams.settled().await.unwrap().data().unwrap().len(), 1);
    let mut one = repo.team("t1").unwrap();
    assert!(one.settled().await.unwrap().is_success());

    repo.save_team(&team("t1", "Under 13")).await.unwrap();

    match one.settled().await {
      Some(SyncResult::Success { value }) => assert_eq!(value.name, "Under 13"),
      other => panic!("expected success, got {:?}", other),
    }
    match teams.settled().await {
      Some(SyncResult::Success { value }) => assert_eq!(value[0].name, "Under 13"),
      other => panic!("expected success, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_delete_team_drops_cached_copies() {
    let (repo, remote) = setup();
    remote.insert(&team("t1", "Under 12"));
    remote.insert(&team("t2", "Under 14"));
    settled(repo.teams().unwrap()).await;

    repo.delete_team("t1").await.unwrap();

    let signature = RosterQuery::AllTeams.signature();
    assert!(repo
      .synchronizer()
      .storage()
      .get_query_result::<Team>(&signature)
      .unwrap()
      .is_none());
    let teams = settled(repo.teams().unwrap()).await.into_data().unwrap();
    assert_eq!(teams.len(), 1);
    assert_eq!(teams[0].id, "t2");
  }

  #[tokio::test]
  async fn test_live_games_filter_by_team_and_status() {
    let (repo, remote) = setup();
    let game = |id: &str, home: &str, away: &str, status| LiveGame {
      id: id.into(),
      home_team_id: home.into(),
      away_team_id: away.into(),
      home_score: 1,
      away_score: 0,
      status,
      updated_at: Utc::now(),
    };
    remote.insert(&game("g1", "t1", "t2", GameStatus::InProgress));
    remote.insert(&game("g2", "t3", "t4", GameStatus::InProgress));
    remote.insert(&game("g3", "t1", "t5", GameStatus::Finished));

    let mut mine = repo.live_games(Some("t1"));
    let mut all = repo.live_games(None);

    match mine.next().await {
      Some(LiveUpdate::Snapshot(games)) => {
        assert_eq!(games.iter().map(|g| g.id.as_str()).collect::<Vec<_>>(), vec!["g1"])
      }
      other => panic!("expected snapshot, got {:?}", other),
    }
    match all.next().await {
      Some(LiveUpdate::Snapshot(games)) => assert_eq!(games.len(), 2),
      other => panic!("expected snapshot, got {:?}", other),
    }
    assert_eq!(remote.subscribe_calls(), 1);
  }

  #[tokio::test]
  async fn test_news_pages_newest_first() {
    let (repo, remote) = setup();
    for minute in 0..5u32 {
      let at = Utc.with_ymd_and_hms(2026, 5, 1, 9, minute, 0).unwrap();
      remote.insert(&NewsItem {
        id: format!("n{}", minute),
        title: "News".into(),
        body: String::new(),
        author: None,
        published_at: at,
        updated_at: at,
      });
    }

    let mut pages = repo.news_pages(repo.page_size().min(3));
    let first = pages.load_first_page().await.unwrap();
    assert_eq!(first[0].id, "n4");
    let second = pages.load_next_page().await.unwrap();
    assert_eq!(second.len(), 2);
    assert_eq!(pages.items().len(), 5);
  }

  #[tokio::test]
  async fn test_clear_cache_forces_refetch() {
    let (repo, remote) = setup();
    remote.insert(&team("t1", "Under 12"));
    settled(repo.teams().unwrap()).await;

    repo.clear_cache().unwrap();
    settled(repo.teams().unwrap()).await;
    assert_eq!(remote.fetch_calls(), 2);
  }
}
