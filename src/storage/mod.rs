//! SQLite persistence for users, feeds, follows and posts.

mod feeds;
mod follows;
mod posts;
mod schema;
mod types;
mod users;

pub use schema::Database;
pub use types::{
    DatabaseError, Feed, FeedFollow, FeedWithOwner, NewPost, Post, PostInsert, User,
};
