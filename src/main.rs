use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rostersync::cache::{CacheStorage, NoopStorage, SqliteStorage};
use rostersync::config::Config;
use rostersync::models::{Event, GameStatus, LiveGame, NewsItem, Player, Team, User};
use rostersync::remote::{HttpDocumentStore, MemoryDocumentStore, RemoteStore};
use rostersync::session::{IdentityProvider, Session};
use rostersync::signature::RosterQuery;
use rostersync::sync::{LiveUpdate, SyncResult, SyncStream};
use rostersync::Repository;

#[derive(Parser, Debug)]
#[command(name = "rostersync")]
#[command(about = "Cached, live and paged access to a sports club's document store")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/rostersync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Use an in-process store with sample data instead of the remote
  #[arg(long)]
  offline_demo: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List teams
  Teams {
    /// Fetch even if the cached list is fresh
    #[arg(long)]
    refresh: bool,
  },
  /// List a team's players
  Players {
    #[arg(long)]
    team: String,
  },
  /// List events
  Events {
    /// Only events the signed-in user attends
    #[arg(long)]
    mine: bool,
  },
  /// List users
  Users,
  /// Page through news, newest first
  News {
    #[arg(long, default_value_t = 1)]
    pages: usize,
    #[arg(long)]
    page_size: Option<usize>,
  },
  /// Follow games in progress until Ctrl-C
  Live {
    #[arg(long)]
    team: Option<String>,
  },
  /// Drop a cached list so the next read refetches
  Invalidate {
    /// teams, players, events, my-events, users or news
    entity: String,
    /// Team id, for `players`
    #[arg(long)]
    team: Option<String>,
  },
  /// Manage the local cache
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  /// Remove every cached entry
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging()?;

  let config = match Config::load(args.config.as_deref()) {
    Ok(config) => config,
    // The demo runs without a config file
    Err(_) if args.offline_demo && args.config.is_none() => Config::default(),
    Err(e) => return Err(e),
  };
  let session = Arc::new(Session::new(config.user_id.clone()));

  if args.offline_demo {
    info!("running against the offline demo store");
    let remote = demo_store();
    let ticker = tokio::spawn(tick_scores(remote.clone()));
    let storage = Arc::new(SqliteStorage::open_in_memory()?);
    let repo = Repository::new(storage, Arc::new(remote), session, &config);
    let result = run(repo, args.command).await;
    ticker.abort();
    return result;
  }

  let remote = Arc::new(HttpDocumentStore::new(&config.remote)?);
  if config.cache.enabled {
    let storage = match &config.cache.path {
      Some(path) => SqliteStorage::open(path)?,
      None => SqliteStorage::open_default()?,
    };
    run(Repository::new(Arc::new(storage), remote, session, &config), args.command).await
  } else {
    run(Repository::new(Arc::new(NoopStorage), remote, session, &config), args.command).await
  }
}

/// Log to a daily file in the data directory; stdout is for command output.
fn init_logging() -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let dir = dirs::data_dir()
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("rostersync");
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, "rostersync.log"));

  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rostersync=info")))
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false),
    )
    .init();

  Ok(guard)
}

async fn run<S: CacheStorage, R: RemoteStore>(
  repo: Repository<S, R>,
  command: Command,
) -> Result<()> {
  match command {
    Command::Teams { refresh } => {
      let stream = if refresh { repo.refresh_teams() } else { repo.teams() }?;
      print_list(stream, |team: &Team| match &team.club {
        Some(club) => format!("{}  {} ({})", team.id, team.name, club),
        None => format!("{}  {}", team.id, team.name),
      })
      .await?;
    }
    Command::Players { team } => {
      print_list(repo.players_for_team(&team)?, |player: &Player| {
        let number = player
          .shirt_number
          .map(|n| format!("#{:<3}", n))
          .unwrap_or_else(|| "    ".to_string());
        format!("{} {}  {}", number, player.name, player.position.as_deref().unwrap_or(""))
      })
      .await?;
    }
    Command::Events { mine } => {
      let stream = if mine { repo.events_for_current_user() } else { repo.events() }?;
      print_list(stream, |event: &Event| {
        format!(
          "{}  {}  {}",
          event.starts_at.format("%Y-%m-%d %H:%M"),
          event.title,
          event.location.as_deref().unwrap_or("")
        )
      })
      .await?;
    }
    Command::Users => {
      print_list(repo.users()?, |user: &User| match &user.email {
        Some(email) => format!("{}  {} <{}>", user.id, user.display_name, email),
        None => format!("{}  {}", user.id, user.display_name),
      })
      .await?;
    }
    Command::News { pages, page_size } => {
      let mut news = repo.news_pages(page_size.unwrap_or(repo.page_size()));
      for page_number in 1..=pages.max(1) {
        let page = news.load_next_page().await?;
        if page.is_empty() {
          println!("(end of news)");
          break;
        }
        println!("-- page {} --", page_number);
        for item in &page {
          print_news(item);
        }
      }
    }
    Command::Live { team } => follow_live(&repo, team.as_deref()).await?,
    Command::Invalidate { entity, team } => {
      let query = parse_query(&entity, team, repo.session())?;
      repo.invalidate(&query);
      println!("invalidated {}", query.description());
    }
    Command::Cache {
      action: CacheAction::Clear,
    } => {
      repo.clear_cache()?;
      println!("cache cleared");
    }
  }

  repo.close()
}

/// Print a list once the stream settles. Progress goes to stderr.
async fn print_list<T>(mut stream: SyncStream<Vec<T>>, line: impl Fn(&T) -> String) -> Result<()> {
  while let Some(result) = stream.next().await {
    match result {
      SyncResult::Loading { partial: Some(items) } => {
        eprintln!("({} cached, checking for updates)", items.len());
      }
      SyncResult::Loading { partial: None } => eprintln!("(loading)"),
      SyncResult::Success { value } => {
        if value.is_empty() {
          println!("(none)");
        }
        for item in &value {
          println!("{}", line(item));
        }
        return Ok(());
      }
      SyncResult::Error { error, partial } => {
        if let Some(items) = partial {
          eprintln!("(refresh failed, showing cached data)");
          for item in &items {
            println!("{}", line(item));
          }
        }
        return Err(error.into());
      }
    }
  }
  Ok(())
}

fn print_news(item: &NewsItem) {
  match &item.author {
    Some(author) => println!(
      "{}  {} ({})",
      item.published_at.format("%Y-%m-%d %H:%M"),
      item.title,
      author
    ),
    None => println!("{}  {}", item.published_at.format("%Y-%m-%d %H:%M"), item.title),
  }
}

async fn follow_live<S: CacheStorage, R: RemoteStore>(
  repo: &Repository<S, R>,
  team: Option<&str>,
) -> Result<()> {
  let mut games = repo.live_games(team);
  loop {
    tokio::select! {
      update = games.next() => match update {
        Some(LiveUpdate::Snapshot(snapshot)) => {
          println!("-- {} --", Utc::now().format("%H:%M:%S"));
          if snapshot.is_empty() {
            println!("(no games in progress)");
          }
          for game in &snapshot {
            println!(
              "{} {} - {} {}",
              game.home_team_id, game.home_score, game.away_score, game.away_team_id
            );
          }
        }
        Some(LiveUpdate::Reconnecting { attempt, error }) => {
          eprintln!("(connection lost: {}; reconnect attempt {})", error, attempt);
        }
        Some(LiveUpdate::Stalled { error }) => {
          return Err(eyre!("Live feed gave up: {}", error));
        }
        None => break,
      },
      _ = tokio::signal::ctrl_c() => break,
    }
  }
  games.close();
  Ok(())
}

fn parse_query(entity: &str, team: Option<String>, session: &Session) -> Result<RosterQuery> {
  let query = match entity {
    "teams" => RosterQuery::AllTeams,
    "players" => RosterQuery::PlayersForTeam {
      team_id: team.ok_or_else(|| eyre!("`invalidate players` needs --team"))?,
    },
    "events" => RosterQuery::AllEvents,
    "my-events" => RosterQuery::EventsForUser {
      user_id: session
        .current_user()
        .ok_or_else(|| eyre!("No user_id configured"))?,
    },
    "users" => RosterQuery::AllUsers,
    "news" => RosterQuery::News,
    other => {
      return Err(eyre!(
        "Unknown entity '{}': expected teams, players, events, my-events, users or news",
        other
      ))
    }
  };
  Ok(query)
}

fn demo_store() -> MemoryDocumentStore {
  let store = MemoryDocumentStore::new();
  let now = Utc::now();

  for (id, name, age_group) in [
    ("u12", "Under 12 Blue", "U12"),
    ("u14", "Under 14 Red", "U14"),
    ("seniors", "First Team", "Senior"),
  ] {
    store.insert(&Team {
      id: id.to_string(),
      name: name.to_string(),
      club: Some("Riverside FC".to_string()),
      age_group: Some(age_group.to_string()),
      updated_at: now,
    });
  }

  for (i, (name, team_id, position)) in [
    ("Sam Ortiz", "u12", "GK"),
    ("Lee Park", "u12", "DF"),
    ("Ada Moss", "u14", "MF"),
    ("Kit Hale", "seniors", "FW"),
  ]
  .into_iter()
  .enumerate()
  {
    store.insert(&Player {
      id: format!("p{}", i + 1),
      team_id: team_id.to_string(),
      name: name.to_string(),
      shirt_number: Some(i as u32 + 1),
      position: Some(position.to_string()),
      updated_at: now,
    });
  }

  store.insert(&User {
    id: "demo".to_string(),
    display_name: "Demo Coach".to_string(),
    email: Some("coach@example.com".to_string()),
    team_ids: vec!["u12".to_string()],
    updated_at: now,
  });

  for (i, (title, attendees)) in [
    ("Training", vec!["demo"]),
    ("Club BBQ", vec![]),
    ("Away match", vec!["demo"]),
  ]
  .into_iter()
  .enumerate()
  {
    store.insert(&Event {
      id: format!("e{}", i + 1),
      title: title.to_string(),
      starts_at: now + chrono::Duration::days(i as i64 + 1),
      location: None,
      attendee_ids: attendees.into_iter().map(String::from).collect(),
      updated_at: now,
    });
  }

  for i in 0..12i64 {
    let published_at = now - chrono::Duration::hours(i);
    store.insert(&NewsItem {
      id: format!("news-{:02}", i),
      title: format!("Club news #{}", 12 - i),
      body: String::new(),
      author: Some("Club office".to_string()),
      published_at,
      updated_at: published_at,
    });
  }

  store.insert(&LiveGame {
    id: "g1".to_string(),
    home_team_id: "u12".to_string(),
    away_team_id: "visitors".to_string(),
    home_score: 0,
    away_score: 0,
    status: GameStatus::InProgress,
    updated_at: now,
  });

  store
}

/// Score a goal in the demo game every few seconds.
async fn tick_scores(store: MemoryDocumentStore) {
  let mut game = LiveGame {
    id: "g1".to_string(),
    home_team_id: "u12".to_string(),
    away_team_id: "visitors".to_string(),
    home_score: 0,
    away_score: 0,
    status: GameStatus::InProgress,
    updated_at: Utc::now(),
  };
  let mut interval = tokio::time::interval(Duration::from_secs(3));
  interval.tick().await;
  loop {
    interval.tick().await;
    if (game.home_score + game.away_score) % 2 == 0 {
      game.home_score += 1;
    } else {
      game.away_score += 1;
    }
    game.updated_at = Utc::now();
    if let Err(e) = store.put(&game).await {
      warn!(error = %e, "demo score update failed");
    }
  }
}
