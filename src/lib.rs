//! gator: a multi-user RSS/Atom aggregator backed by SQLite.
//!
//! The binary in `main.rs` is a thin wrapper over [`commands`]; the
//! long-running `agg` loop lives in [`feed::Scheduler`].

pub mod commands;
pub mod config;
pub mod feed;
pub mod storage;
pub mod util;
