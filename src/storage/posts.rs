use super::schema::Database;
use super::types::{DatabaseError, NewPost, Post, PostInsert};

const POST_COLUMNS: &str =
    "id, created_at, updated_at, feed_id, url, title, description, published_at";

impl Database {
    // ========================================================================
    // Post Operations
    // ========================================================================

    /// Insert a post for a feed.
    ///
    /// Post URLs are unique across all feeds. If the URL is already stored the
    /// existing row is left untouched and [`PostInsert::Duplicate`] is
    /// returned; the first write wins.
    pub async fn insert_post(
        &self,
        feed_id: i64,
        post: &NewPost,
    ) -> Result<PostInsert, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO posts (created_at, updated_at, feed_id, url, title, description, published_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(url) DO NOTHING
            RETURNING id
        "#,
        )
        .bind(now)
        .bind(now)
        .bind(feed_id)
        .bind(&post.url)
        .bind(&post.title)
        .bind(&post.description)
        .bind(post.published_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((id,)) => PostInsert::Inserted(id),
            None => PostInsert::Duplicate,
        })
    }

    /// Posts of one feed, newest first. Posts without a date sort last.
    pub async fn get_posts_for_feed(&self, feed_id: i64) -> Result<Vec<Post>, DatabaseError> {
        let posts = sqlx::query_as::<_, Post>(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE feed_id = ? \
             ORDER BY published_at DESC NULLS LAST, id DESC"
        ))
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(posts)
    }

    /// Newest posts across every feed the user follows
    pub async fn get_posts_for_user(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<Post>, DatabaseError> {
        let posts = sqlx::query_as::<_, Post>(
            r#"
            SELECT p.id, p.created_at, p.updated_at, p.feed_id, p.url,
                   p.title, p.description, p.published_at
            FROM posts p
            JOIN feed_follows ff ON ff.feed_id = p.feed_id
            WHERE ff.user_id = ?
            ORDER BY p.published_at DESC NULLS LAST, p.id DESC
            LIMIT ?
        "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(posts)
    }

    pub async fn count_posts(&self) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, NewPost, PostInsert};
    use pretty_assertions::assert_eq;

    async fn setup() -> (Database, i64, i64) {
        let db = Database::open(":memory:").await.unwrap();
        let user = db.create_user("alice").await.unwrap();
        let feed = db
            .create_feed("Feed", "https://example.com/rss", user.id)
            .await
            .unwrap();
        (db, user.id, feed.id)
    }

    fn test_post(slug: &str, title: &str, published_at: Option<i64>) -> NewPost {
        NewPost {
            url: format!("https://example.com/{}", slug),
            title: title.to_string(),
            description: Some("Test description".to_string()),
            published_at,
        }
    }

    #[tokio::test]
    async fn test_insert_post() {
        let (db, _, feed_id) = setup().await;
        let outcome = db
            .insert_post(feed_id, &test_post("a", "A", Some(1_700_000_000)))
            .await
            .unwrap();
        assert!(matches!(outcome, PostInsert::Inserted(_)));

        let posts = db.get_posts_for_feed(feed_id).await.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].title, "A");
        assert_eq!(posts[0].published_at, Some(1_700_000_000));
    }

    #[tokio::test]
    async fn test_duplicate_url_first_write_wins() {
        let (db, _, feed_id) = setup().await;
        db.insert_post(feed_id, &test_post("same", "Original", None))
            .await
            .unwrap();
        let outcome = db
            .insert_post(feed_id, &test_post("same", "Rewritten", None))
            .await
            .unwrap();

        assert_eq!(outcome, PostInsert::Duplicate);
        let posts = db.get_posts_for_feed(feed_id).await.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].title, "Original");
    }

    #[tokio::test]
    async fn test_post_url_unique_across_feeds() {
        let (db, user_id, feed_id) = setup().await;
        let other = db
            .create_feed("Other", "https://other.example.com/rss", user_id)
            .await
            .unwrap();

        db.insert_post(feed_id, &test_post("shared", "Shared", None))
            .await
            .unwrap();
        let outcome = db
            .insert_post(other.id, &test_post("shared", "Shared", None))
            .await
            .unwrap();

        assert_eq!(outcome, PostInsert::Duplicate);
        assert!(db.get_posts_for_feed(other.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_posts_for_user_only_followed_feeds() {
        let (db, user_id, feed_id) = setup().await;
        let unfollowed = db
            .create_feed("Unfollowed", "https://other.example.com/rss", user_id)
            .await
            .unwrap();
        db.create_feed_follow(user_id, feed_id).await.unwrap();

        db.insert_post(feed_id, &test_post("old", "Old", Some(100)))
            .await
            .unwrap();
        db.insert_post(feed_id, &test_post("new", "New", Some(200)))
            .await
            .unwrap();
        db.insert_post(feed_id, &test_post("undated", "Undated", None))
            .await
            .unwrap();
        db.insert_post(unfollowed.id, &test_post("hidden", "Hidden", Some(300)))
            .await
            .unwrap();

        let titles: Vec<String> = db
            .get_posts_for_user(user_id, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.title)
            .collect();
        assert_eq!(titles, vec!["New", "Old", "Undated"]);

        let limited = db.get_posts_for_user(user_id, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_posts_removed_with_feed_owner() {
        let (db, _, feed_id) = setup().await;
        db.insert_post(feed_id, &test_post("a", "A", None))
            .await
            .unwrap();
        assert_eq!(db.count_posts().await.unwrap(), 1);

        db.delete_all_users().await.unwrap();
        assert_eq!(db.count_posts().await.unwrap(), 0);
    }
}
