use super::feeds::FEED_COLUMNS;
use super::schema::Database;
use super::types::{DatabaseError, Feed, FeedFollow};

impl Database {
    // ========================================================================
    // Follow Operations
    // ========================================================================

    /// Subscribe a user to a feed.
    ///
    /// Fails with a unique violation if the user already follows the feed.
    pub async fn create_feed_follow(
        &self,
        user_id: i64,
        feed_id: i64,
    ) -> Result<FeedFollow, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feed_follows (created_at, updated_at, user_id, feed_id)
            VALUES (?, ?, ?, ?)
            RETURNING id
        "#,
        )
        .bind(now)
        .bind(now)
        .bind(user_id)
        .bind(feed_id)
        .fetch_one(&mut *tx)
        .await?;

        let follow = sqlx::query_as::<_, FeedFollow>(
            r#"
            SELECT ff.id, ff.created_at, ff.user_id, ff.feed_id,
                   u.name AS user_name, f.name AS feed_name
            FROM feed_follows ff
            JOIN users u ON u.id = ff.user_id
            JOIN feeds f ON f.id = ff.feed_id
            WHERE ff.id = ?
        "#,
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(follow)
    }

    /// Register a feed and subscribe its owner to it in one transaction.
    ///
    /// Either both rows exist afterwards or neither does. Fails with a unique
    /// violation if the URL is already registered.
    pub async fn create_feed_with_follow(
        &self,
        name: &str,
        url: &str,
        user_id: i64,
    ) -> Result<(Feed, FeedFollow), DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let feed = sqlx::query_as::<_, Feed>(&format!(
            "INSERT INTO feeds (created_at, updated_at, name, url, user_id) \
             VALUES (?, ?, ?, ?, ?) RETURNING {FEED_COLUMNS}"
        ))
        .bind(now)
        .bind(now)
        .bind(name)
        .bind(url)
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;

        let (follow_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feed_follows (created_at, updated_at, user_id, feed_id)
            VALUES (?, ?, ?, ?)
            RETURNING id
        "#,
        )
        .bind(now)
        .bind(now)
        .bind(user_id)
        .bind(feed.id)
        .fetch_one(&mut *tx)
        .await?;

        let follow = sqlx::query_as::<_, FeedFollow>(
            r#"
            SELECT ff.id, ff.created_at, ff.user_id, ff.feed_id,
                   u.name AS user_name, f.name AS feed_name
            FROM feed_follows ff
            JOIN users u ON u.id = ff.user_id
            JOIN feeds f ON f.id = ff.feed_id
            WHERE ff.id = ?
        "#,
        )
        .bind(follow_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((feed, follow))
    }

    /// Remove a follow. Returns `false` if the user was not following the feed.
    pub async fn delete_feed_follow(
        &self,
        user_id: i64,
        feed_id: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM feed_follows WHERE user_id = ? AND feed_id = ?")
            .bind(user_id)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Follows of a user, ordered by feed name
    pub async fn get_feed_follows_for_user(
        &self,
        user_id: i64,
    ) -> Result<Vec<FeedFollow>, DatabaseError> {
        let follows = sqlx::query_as::<_, FeedFollow>(
            r#"
            SELECT ff.id, ff.created_at, ff.user_id, ff.feed_id,
                   u.name AS user_name, f.name AS feed_name
            FROM feed_follows ff
            JOIN users u ON u.id = ff.user_id
            JOIN feeds f ON f.id = ff.feed_id
            WHERE ff.user_id = ?
            ORDER BY f.name, ff.id
        "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(follows)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::Database;

    async fn setup() -> (Database, i64, i64) {
        let db = Database::open(":memory:").await.unwrap();
        let user = db.create_user("alice").await.unwrap();
        let feed = db
            .create_feed("Tech Blog", "https://blog.example.com/rss", user.id)
            .await
            .unwrap();
        (db, user.id, feed.id)
    }

    #[tokio::test]
    async fn test_follow_returns_names() {
        let (db, user_id, feed_id) = setup().await;
        let follow = db.create_feed_follow(user_id, feed_id).await.unwrap();
        assert_eq!(follow.user_name, "alice");
        assert_eq!(follow.feed_name, "Tech Blog");
    }

    #[tokio::test]
    async fn test_double_follow_is_unique_violation() {
        let (db, user_id, feed_id) = setup().await;
        db.create_feed_follow(user_id, feed_id).await.unwrap();
        let err = db.create_feed_follow(user_id, feed_id).await.unwrap_err();
        assert!(err.is_unique_violation());
        assert_eq!(db.get_feed_follows_for_user(user_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unfollow() {
        let (db, user_id, feed_id) = setup().await;
        db.create_feed_follow(user_id, feed_id).await.unwrap();

        assert!(db.delete_feed_follow(user_id, feed_id).await.unwrap());
        assert!(!db.delete_feed_follow(user_id, feed_id).await.unwrap());
        assert!(db.get_feed_follows_for_user(user_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_follows_are_per_user() {
        let (db, alice, feed_id) = setup().await;
        let bob = db.create_user("bob").await.unwrap();
        db.create_feed_follow(alice, feed_id).await.unwrap();

        assert_eq!(db.get_feed_follows_for_user(alice).await.unwrap().len(), 1);
        assert!(db.get_feed_follows_for_user(bob.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_feed_with_follow() {
        let (db, user_id, _) = setup().await;
        let (feed, follow) = db
            .create_feed_with_follow("News", "https://news.example.com/rss", user_id)
            .await
            .unwrap();
        assert_eq!(follow.feed_id, feed.id);
        assert_eq!(follow.user_name, "alice");
        assert_eq!(follow.feed_name, "News");

        let err = db
            .create_feed_with_follow("Again", "https://news.example.com/rss", user_id)
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());
        assert_eq!(db.get_feed_follows_for_user(user_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_follow_rolls_back_feed() {
        let (db, user_id, _) = setup().await;
        sqlx::query(
            "CREATE TRIGGER reject_follows BEFORE INSERT ON feed_follows \
             BEGIN SELECT RAISE(ABORT, 'follows disabled'); END",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        assert!(db
            .create_feed_with_follow("News", "https://news.example.com/rss", user_id)
            .await
            .is_err());
        assert!(db
            .get_feed_by_url("https://news.example.com/rss")
            .await
            .unwrap()
            .is_none());
    }
}
