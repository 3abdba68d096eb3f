//! CLI subcommands and their handlers.
//!
//! Every handler writes its user-facing output to a caller-supplied writer
//! so the flows can be exercised without a terminal.
use anyhow::{Context, Result};
use clap::Subcommand;
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::config::Config;
use crate::feed::{Fetcher, Scheduler};
use crate::storage::{Database, User};
use crate::util::{parse_duration, validate_feed_url, DurationParseError, UrlValidationError};

const DEFAULT_BROWSE_LIMIT: u32 = 2;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("not logged in; run `gator login <name>` first")]
    NotLoggedIn,

    #[error("user {0:?} does not exist")]
    UserNotFound(String),

    #[error("user {0:?} already exists")]
    UserExists(String),

    #[error("no feed registered for {0}")]
    FeedNotFound(String),

    #[error("feed {0} is already registered")]
    FeedExists(String),

    #[error("already following {0}")]
    AlreadyFollowing(String),

    #[error("not following {0}")]
    NotFollowing(String),

    #[error(transparent)]
    InvalidUrl(#[from] UrlValidationError),

    #[error("invalid interval: {0}")]
    InvalidDuration(String),
}

impl From<DurationParseError> for CommandError {
    fn from(e: DurationParseError) -> Self {
        CommandError::InvalidDuration(e.to_string())
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create a user and log in as them
    Register { name: String },

    /// Switch the current user
    Login { name: String },

    /// List all users
    Users,

    /// Register a feed and follow it
    Addfeed { name: String, url: String },

    /// List all registered feeds
    Feeds,

    /// Follow an already registered feed
    Follow { url: String },

    /// Stop following a feed
    Unfollow { url: String },

    /// List the feeds the current user follows
    Following,

    /// Show the newest posts from followed feeds
    Browse {
        #[arg(default_value_t = DEFAULT_BROWSE_LIMIT, value_parser = clap::value_parser!(u32).range(1..))]
        limit: u32,
    },

    /// Poll feeds continuously, one feed per interval (e.g. `30s`, `1m`)
    Agg { interval: String },

    /// Delete every user, feed, follow and post
    Reset,
}

/// Open database plus the config it was resolved from.
pub struct Session {
    pub db: Database,
    pub config: Config,
    pub config_path: PathBuf,
}

impl Session {
    pub fn new(db: Database, config: Config, config_path: PathBuf) -> Self {
        Self {
            db,
            config,
            config_path,
        }
    }

    /// The logged-in user. A stale id (e.g. after `reset`) counts as logged out.
    async fn current_user(&self) -> Result<User> {
        let id = self.config.current_user_id.ok_or(CommandError::NotLoggedIn)?;
        let user = self
            .db
            .get_user(id)
            .await
            .context("Failed to load current user")?
            .ok_or(CommandError::NotLoggedIn)?;
        Ok(user)
    }
}

/// Run one subcommand to completion.
pub async fn execute<W: Write>(session: &mut Session, command: Command, out: &mut W) -> Result<()> {
    match command {
        Command::Register { name } => register(session, &name, out).await,
        Command::Login { name } => login(session, &name, out).await,
        Command::Users => users(session, out).await,
        Command::Addfeed { name, url } => add_feed(session, &name, &url, out).await,
        Command::Feeds => feeds(session, out).await,
        Command::Follow { url } => follow(session, &url, out).await,
        Command::Unfollow { url } => unfollow(session, &url, out).await,
        Command::Following => following(session, out).await,
        Command::Browse { limit } => browse(session, limit, out).await,
        Command::Agg { interval } => {
            agg(session, &interval, shutdown_signal(), out).await?;
            Ok(())
        }
        Command::Reset => reset(session, out).await,
    }
}

async fn register<W: Write>(session: &mut Session, name: &str, out: &mut W) -> Result<()> {
    let user = match session.db.create_user(name).await {
        Ok(user) => user,
        Err(e) if e.is_unique_violation() => {
            return Err(CommandError::UserExists(name.to_string()).into())
        }
        Err(e) => return Err(e).context("Failed to create user"),
    };
    session
        .config
        .set_current_user(&session.config_path, user.id)
        .context("Failed to save config")?;

    tracing::info!(user_id = user.id, name = %user.name, "User registered");
    writeln!(out, "User {} created and logged in", user.name)?;
    Ok(())
}

async fn login<W: Write>(session: &mut Session, name: &str, out: &mut W) -> Result<()> {
    let user = session
        .db
        .get_user_by_name(name)
        .await
        .context("Failed to look up user")?
        .ok_or_else(|| CommandError::UserNotFound(name.to_string()))?;
    session
        .config
        .set_current_user(&session.config_path, user.id)
        .context("Failed to save config")?;

    writeln!(out, "Logged in as {}", user.name)?;
    Ok(())
}

async fn users<W: Write>(session: &Session, out: &mut W) -> Result<()> {
    let users = session.db.list_users().await.context("Failed to list users")?;
    for user in users {
        if Some(user.id) == session.config.current_user_id {
            writeln!(out, "* {} (current)", user.name)?;
        } else {
            writeln!(out, "* {}", user.name)?;
        }
    }
    Ok(())
}

async fn add_feed<W: Write>(session: &Session, name: &str, url: &str, out: &mut W) -> Result<()> {
    let user = session.current_user().await?;
    let url = validate_feed_url(url).map_err(CommandError::from)?;

    let (feed, _) = match session
        .db
        .create_feed_with_follow(name, url.as_str(), user.id)
        .await
    {
        Ok(created) => created,
        Err(e) if e.is_unique_violation() => {
            return Err(CommandError::FeedExists(url.to_string()).into())
        }
        Err(e) => return Err(e).context("Failed to create feed"),
    };

    tracing::info!(feed_id = feed.id, url = %feed.url, "Feed added");
    writeln!(out, "Added feed {} ({})", feed.name, feed.url)?;
    writeln!(out, "{} is now following {}", user.name, feed.name)?;
    Ok(())
}

async fn feeds<W: Write>(session: &Session, out: &mut W) -> Result<()> {
    let feeds = session.db.list_feeds().await.context("Failed to list feeds")?;
    for feed in feeds {
        writeln!(out, "* {}", feed.name)?;
        writeln!(out, "  URL:          {}", feed.url)?;
        writeln!(out, "  Added by:     {}", feed.owner_name)?;
        let fetched = feed
            .last_fetched_at
            .map(format_timestamp)
            .unwrap_or_else(|| "never".to_string());
        writeln!(out, "  Last fetched: {}", fetched)?;
        if let Some(error) = feed.last_error {
            writeln!(out, "  Last error:   {}", error)?;
        }
    }
    Ok(())
}

async fn follow<W: Write>(session: &Session, url: &str, out: &mut W) -> Result<()> {
    let user = session.current_user().await?;
    let url = validate_feed_url(url).map_err(CommandError::from)?;
    let feed = session
        .db
        .get_feed_by_url(url.as_str())
        .await
        .context("Failed to look up feed")?
        .ok_or_else(|| CommandError::FeedNotFound(url.to_string()))?;

    let follow = match session.db.create_feed_follow(user.id, feed.id).await {
        Ok(follow) => follow,
        Err(e) if e.is_unique_violation() => {
            return Err(CommandError::AlreadyFollowing(feed.name).into())
        }
        Err(e) => return Err(e).context("Failed to follow feed"),
    };

    writeln!(out, "{} is now following {}", follow.user_name, follow.feed_name)?;
    Ok(())
}

async fn unfollow<W: Write>(session: &Session, url: &str, out: &mut W) -> Result<()> {
    let user = session.current_user().await?;
    let url = validate_feed_url(url).map_err(CommandError::from)?;
    let feed = session
        .db
        .get_feed_by_url(url.as_str())
        .await
        .context("Failed to look up feed")?
        .ok_or_else(|| CommandError::FeedNotFound(url.to_string()))?;

    let removed = session
        .db
        .delete_feed_follow(user.id, feed.id)
        .await
        .context("Failed to unfollow feed")?;
    if !removed {
        return Err(CommandError::NotFollowing(feed.name).into());
    }

    writeln!(out, "{} unfollowed {}", user.name, feed.name)?;
    Ok(())
}

async fn following<W: Write>(session: &Session, out: &mut W) -> Result<()> {
    let user = session.current_user().await?;
    let follows = session
        .db
        .get_feed_follows_for_user(user.id)
        .await
        .context("Failed to list follows")?;
    for follow in follows {
        writeln!(out, "* {}", follow.feed_name)?;
    }
    Ok(())
}

async fn browse<W: Write>(session: &Session, limit: u32, out: &mut W) -> Result<()> {
    let user = session.current_user().await?;
    let posts = session
        .db
        .get_posts_for_user(user.id, i64::from(limit))
        .await
        .context("Failed to load posts")?;

    if posts.is_empty() {
        writeln!(out, "No posts yet. Follow a feed and run `gator agg`.")?;
        return Ok(());
    }

    for post in posts {
        let published = post
            .published_at
            .map(format_timestamp)
            .unwrap_or_else(|| "unknown date".to_string());
        writeln!(out, "{}", published)?;
        writeln!(out, "--- {} ---", post.title)?;
        if let Some(description) = post.description.as_deref().filter(|d| !d.is_empty()) {
            writeln!(out, "    {}", description)?;
        }
        writeln!(out, "Link: {}", post.url)?;
        writeln!(out, "=====================================")?;
    }
    Ok(())
}

/// Parse `interval`, then run the scheduler until `shutdown` resolves.
/// Returns the number of completed cycles.
pub async fn agg<W, F>(session: &Session, interval: &str, shutdown: F, out: &mut W) -> Result<u64>
where
    W: Write,
    F: Future<Output = ()>,
{
    let interval = parse_interval(interval)?;
    let fetcher = Fetcher::new(&session.config.user_agent, session.config.fetch_timeout())
        .context("Failed to build HTTP client")?;
    let scheduler = Scheduler::new(
        session.db.clone(),
        fetcher,
        interval,
        session.config.failure_policy(),
    );

    writeln!(out, "Collecting feeds every {:?}", interval)?;
    out.flush()?;
    Ok(scheduler.run(shutdown).await)
}

async fn reset<W: Write>(session: &mut Session, out: &mut W) -> Result<()> {
    let deleted = session
        .db
        .delete_all_users()
        .await
        .context("Failed to reset database")?;
    if session.config.current_user_id.take().is_some() {
        session
            .config
            .save(&session.config_path)
            .context("Failed to save config")?;
    }

    tracing::info!(users = deleted, "Database reset");
    writeln!(out, "Database reset ({} users deleted)", deleted)?;
    Ok(())
}

fn parse_interval(input: &str) -> Result<Duration, CommandError> {
    let interval = parse_duration(input)?;
    if interval.is_zero() {
        return Err(CommandError::InvalidDuration(format!(
            "{:?} must be greater than zero",
            input
        )));
    }
    Ok(interval)
}

fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
