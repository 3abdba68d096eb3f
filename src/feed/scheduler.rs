//! The polling loop: pick the least recently fetched feed, fetch it, parse
//! it, reconcile its entries, sleep, repeat.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::feed::fetcher::{FetchError, Fetcher};
use crate::feed::parser::{parse_feed, ParseError};
use crate::feed::reconciler::{reconcile, ReconcileReport};
use crate::storage::{Database, DatabaseError, Feed};

/// What happens to a feed's fetch cursor when an attempt fails.
///
/// Definitive failures (bad status, oversized body, malformed document)
/// always move the cursor so a broken feed cannot hold the front of the
/// queue. The policies differ only for transient network failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Move the cursor after every attempt, including timeouts
    #[default]
    AdvanceAlways,
    /// Leave the cursor alone on network errors and timeouts so the feed is
    /// picked again on the next cycle
    RetryTransient,
}

/// Why a cycle failed for the selected feed.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl CycleError {
    /// True when the feed itself was never evaluated
    pub fn is_transient(&self) -> bool {
        match self {
            CycleError::Fetch(e) => e.is_transient(),
            CycleError::Parse(_) => false,
            CycleError::Database(_) => true,
        }
    }
}

/// Scheduler state. `run_cycle` takes `&mut self`, so one scheduler has at
/// most one feed in flight.
///
/// Nothing coordinates separate `gator agg` processes: two of them can select
/// and fetch the same feed at once. The unique post URL keeps that harmless,
/// since the slower reconcile only counts duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Fetching { feed_id: i64 },
}

/// Result of one cycle.
#[derive(Debug)]
pub enum CycleOutcome {
    /// No feeds are registered; nothing was fetched
    NoFeeds,
    /// The next feed could not be selected
    SelectionFailed(DatabaseError),
    /// The feed was fetched, parsed and reconciled
    Reconciled {
        feed: Feed,
        report: ReconcileReport,
    },
    /// The feed failed; `advanced` tells whether its cursor moved
    Failed {
        feed: Feed,
        error: CycleError,
        advanced: bool,
    },
}

pub struct Scheduler {
    db: Database,
    fetcher: Fetcher,
    interval: Duration,
    policy: FailurePolicy,
    state: SchedulerState,
}

impl Scheduler {
    pub fn new(db: Database, fetcher: Fetcher, interval: Duration, policy: FailurePolicy) -> Self {
        Self {
            db,
            fetcher,
            interval,
            policy,
            state: SchedulerState::Idle,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Run cycles until `shutdown` resolves. Returns the number of cycles
    /// that ran to completion.
    ///
    /// `shutdown` is checked while a cycle is in flight and during the sleep
    /// between cycles, so cancellation never waits out an interval. Dropping
    /// a cycle halfway is safe: reconciliation can be repeated.
    pub async fn run<F>(mut self, shutdown: F) -> u64
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut cycles: u64 = 0;

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = self.run_cycle() => cycles += 1,
            }

            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        self.state = SchedulerState::Idle;
        tracing::info!(cycles = cycles, "Scheduler stopped");
        cycles
    }

    /// Run a single select → fetch → parse → reconcile cycle.
    ///
    /// Never returns an error: every failure is logged, recorded on the feed
    /// where possible and reported in the [`CycleOutcome`].
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let feed = match self.db.next_feed_to_fetch().await {
            Ok(Some(feed)) => feed,
            Ok(None) => {
                tracing::debug!("No feeds registered, staying idle");
                return CycleOutcome::NoFeeds;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to select next feed");
                return CycleOutcome::SelectionFailed(e);
            }
        };

        let started_at = chrono::Utc::now().timestamp();
        self.state = SchedulerState::Fetching { feed_id: feed.id };
        tracing::debug!(feed_id = feed.id, url = %feed.url, "Fetching feed");

        let result = self.process(&feed, started_at).await;
        self.state = SchedulerState::Idle;

        match result {
            Ok(report) => {
                tracing::info!(
                    feed = %feed.name,
                    url = %feed.url,
                    inserted = report.inserted,
                    duplicates = report.duplicates,
                    "Feed reconciled"
                );
                CycleOutcome::Reconciled { feed, report }
            }
            Err(error) => {
                let advanced = self.record_failure(&feed, &error, started_at).await;
                tracing::warn!(
                    feed = %feed.name,
                    url = %feed.url,
                    error = %error,
                    advanced = advanced,
                    "Feed fetch failed"
                );
                CycleOutcome::Failed {
                    feed,
                    error,
                    advanced,
                }
            }
        }
    }

    async fn process(&self, feed: &Feed, started_at: i64) -> Result<ReconcileReport, CycleError> {
        let document = self.fetcher.fetch(&feed.url).await?;
        let parsed = parse_feed(
            &document.body,
            document.content_type.as_deref(),
            Some(&feed.url),
        )?;
        let report = reconcile(&self.db, feed.id, &parsed.entries, started_at).await?;
        Ok(report)
    }

    /// Store the error on the feed and, per policy, move its cursor.
    /// Returns whether the cursor moved.
    async fn record_failure(&self, feed: &Feed, error: &CycleError, started_at: i64) -> bool {
        let advance = match self.policy {
            FailurePolicy::AdvanceAlways => true,
            FailurePolicy::RetryTransient => !error.is_transient(),
        };

        match self
            .db
            .record_feed_failure(feed.id, &error.to_string(), advance.then_some(started_at))
            .await
        {
            Ok(()) => advance,
            Err(db_err) => {
                tracing::warn!(
                    feed_id = feed.id,
                    error = %db_err,
                    "Failed to record feed failure"
                );
                false
            }
        }
    }
}
