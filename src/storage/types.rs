use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds a lock on the database file
    #[error("The database is locked by another gator process. Please try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        // SQLITE_CANTOPEN (14): unable to open database file
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }

    /// True when the underlying error is a UNIQUE constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            DatabaseError::Other(sqlx::Error::Database(db_err)) => db_err.is_unique_violation(),
            _ => false,
        }
    }
}

// ============================================================================
// Input Types
// ============================================================================

/// A post ready to be stored, built from a parsed feed entry.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    /// Unix seconds; `None` when the feed gave no usable date
    pub published_at: Option<i64>,
}

/// Outcome of a single post insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostInsert {
    /// A new row was created with this id
    Inserted(i64),
    /// A post with the same URL already exists; nothing was written
    Duplicate,
}

// ============================================================================
// Data Structures
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub name: String,
}

/// Feed data from database
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Feed {
    pub id: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub name: String,
    pub url: String,
    pub user_id: i64,
    /// `None` until the scheduler has attempted the feed once
    pub last_fetched_at: Option<i64>,
    /// Most recent fetch failure, cleared by a successful reconcile
    pub last_error: Option<String>,
}

/// Feed joined with the name of the user who registered it
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FeedWithOwner {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub owner_name: String,
    pub last_fetched_at: Option<i64>,
    pub last_error: Option<String>,
}

/// A follow row joined with the user and feed names
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FeedFollow {
    pub id: i64,
    pub created_at: i64,
    pub user_id: i64,
    pub feed_id: i64,
    pub user_name: String,
    pub feed_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Post {
    pub id: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub feed_id: i64,
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    pub published_at: Option<i64>,
}
