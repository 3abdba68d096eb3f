//! Feed ingestion: fetching, parsing, reconciling and the polling loop.
//!
//! - [`fetcher`] - one bounded HTTP GET per feed, no retries
//! - [`parser`] - bytes to entries, with encoding and entity handling
//! - [`reconciler`] - idempotent merge of entries into stored posts
//! - [`scheduler`] - least-recently-fetched-first polling loop
//!
//! # Example
//!
//! ```ignore
//! use gator::feed::{Fetcher, FailurePolicy, Scheduler};
//!
//! let fetcher = Fetcher::new("gator", Duration::from_secs(10))?;
//! let scheduler = Scheduler::new(db, fetcher, Duration::from_secs(60), FailurePolicy::default());
//! scheduler.run(tokio::signal::ctrl_c().map(|_| ())).await;
//! ```

pub mod fetcher;
pub mod parser;
pub mod reconciler;
pub mod scheduler;

pub use fetcher::{FetchError, FetchedDocument, Fetcher, DEFAULT_FETCH_TIMEOUT, DEFAULT_USER_AGENT};
pub use parser::{parse_feed, FeedFlavor, ParseError, ParsedEntry, ParsedFeed};
pub use reconciler::{reconcile, ReconcileReport};
pub use scheduler::{CycleError, CycleOutcome, FailurePolicy, Scheduler, SchedulerState};
