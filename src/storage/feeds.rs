use super::schema::Database;
use super::types::{DatabaseError, Feed, FeedWithOwner};

pub(super) const FEED_COLUMNS: &str =
    "id, created_at, updated_at, name, url, user_id, last_fetched_at, last_error";

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Register a feed owned by `user_id`.
    ///
    /// Fails with a unique violation if the URL is already registered.
    pub async fn create_feed(
        &self,
        name: &str,
        url: &str,
        user_id: i64,
    ) -> Result<Feed, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let feed = sqlx::query_as::<_, Feed>(&format!(
            "INSERT INTO feeds (created_at, updated_at, name, url, user_id) \
             VALUES (?, ?, ?, ?, ?) RETURNING {FEED_COLUMNS}"
        ))
        .bind(now)
        .bind(now)
        .bind(name)
        .bind(url)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(feed)
    }

    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>, DatabaseError> {
        let feed = sqlx::query_as::<_, Feed>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?"
        ))
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(feed)
    }

    pub async fn get_feed_by_url(&self, url: &str) -> Result<Option<Feed>, DatabaseError> {
        let feed = sqlx::query_as::<_, Feed>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE url = ?"
        ))
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(feed)
    }

    /// All feeds with the name of the user who added them
    pub async fn list_feeds(&self) -> Result<Vec<FeedWithOwner>, DatabaseError> {
        let feeds = sqlx::query_as::<_, FeedWithOwner>(
            r#"
            SELECT f.id, f.name, f.url, u.name AS owner_name,
                   f.last_fetched_at, f.last_error
            FROM feeds f
            JOIN users u ON u.id = f.user_id
            ORDER BY f.name, f.id
        "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    // ========================================================================
    // Fetch Cursor
    // ========================================================================

    /// The feed the scheduler should fetch next.
    ///
    /// Oldest `last_fetched_at` first, never-fetched feeds before all others,
    /// ties broken by id so the order is deterministic.
    pub async fn next_feed_to_fetch(&self) -> Result<Option<Feed>, DatabaseError> {
        let feed = sqlx::query_as::<_, Feed>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds \
             ORDER BY last_fetched_at ASC NULLS FIRST, id ASC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;
        Ok(feed)
    }

    /// Record a completed fetch: set `last_fetched_at` and `updated_at`,
    /// clear any stored error.
    pub async fn mark_feed_fetched(
        &self,
        feed_id: i64,
        fetched_at: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE feeds SET last_fetched_at = ?, updated_at = ?, last_error = NULL WHERE id = ?",
        )
        .bind(fetched_at)
        .bind(fetched_at)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Store a fetch failure for a feed.
    ///
    /// With `fetched_at = Some(ts)` the fetch cursor also moves to `ts`;
    /// with `None` the feed keeps its place at the front of the queue.
    pub async fn record_feed_failure(
        &self,
        feed_id: i64,
        error: &str,
        fetched_at: Option<i64>,
    ) -> Result<(), DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            UPDATE feeds
            SET last_error = ?,
                last_fetched_at = COALESCE(?, last_fetched_at),
                updated_at = ?
            WHERE id = ?
        "#,
        )
        .bind(error)
        .bind(fetched_at)
        .bind(fetched_at.unwrap_or(now))
        .bind(feed_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
