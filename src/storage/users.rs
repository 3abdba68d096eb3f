use super::schema::Database;
use super::types::{DatabaseError, User};

impl Database {
    // ========================================================================
    // User Operations
    // ========================================================================

    /// Create a user. Fails with a unique violation if the name is taken.
    pub async fn create_user(&self, name: &str) -> Result<User, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (created_at, updated_at, name)
            VALUES (?, ?, ?)
            RETURNING id, created_at, updated_at, name
        "#,
        )
        .bind(now)
        .bind(now)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn get_user_by_name(&self, name: &str) -> Result<Option<User>, DatabaseError> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, created_at, updated_at, name FROM users WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn get_user(&self, user_id: i64) -> Result<Option<User>, DatabaseError> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, created_at, updated_at, name FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    /// All users ordered by name
    pub async fn list_users(&self) -> Result<Vec<User>, DatabaseError> {
        let users = sqlx::query_as::<_, User>(
            "SELECT id, created_at, updated_at, name FROM users ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    /// Delete every user. Feeds, follows and posts go with them via
    /// `ON DELETE CASCADE`. Returns the number of users removed.
    pub async fn delete_all_users(&self) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM users")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
