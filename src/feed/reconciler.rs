use crate::feed::parser::ParsedEntry;
use crate::storage::{Database, DatabaseError, NewPost, PostInsert};

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Posts created by this pass
    pub inserted: usize,
    /// Entries whose URL was already stored
    pub duplicates: usize,
    /// Entries without a link, which cannot be keyed and are not stored
    pub skipped: usize,
}

/// Merge parsed entries into the posts of `feed_id`, then move the feed's
/// fetch cursor to `fetched_at`.
///
/// Inserts are not wrapped in a transaction with the cursor update. If the
/// process dies halfway, running the same entries again inserts only what is
/// missing: a post URL can exist once, and a conflicting insert is counted as
/// a duplicate rather than treated as an error.
pub async fn reconcile(
    db: &Database,
    feed_id: i64,
    entries: &[ParsedEntry],
    fetched_at: i64,
) -> Result<ReconcileReport, DatabaseError> {
    let mut report = ReconcileReport::default();

    for entry in entries {
        let Some(url) = entry.link.as_deref() else {
            report.skipped += 1;
            continue;
        };

        let post = NewPost {
            url: url.to_string(),
            title: entry.title.clone(),
            description: entry.description.clone(),
            published_at: entry.published,
        };

        match db.insert_post(feed_id, &post).await? {
            PostInsert::Inserted(_) => report.inserted += 1,
            PostInsert::Duplicate => report.duplicates += 1,
        }
    }

    db.mark_feed_fetched(feed_id, fetched_at).await?;

    if report.skipped > 0 {
        tracing::debug!(
            feed_id = feed_id,
            skipped = report.skipped,
            "Entries without a link were not stored"
        );
    }

    Ok(report)
}
