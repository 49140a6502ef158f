use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use store::{meta, CompactionSummary, PersistentStore, StoreTx};
use tasks::parse_timestamp;
use tracing::{debug, info};

use crate::Result;

/// What a compaction pass did
#[derive(Debug, Clone, PartialEq)]
pub enum CompactionOutcome {
    Archived(CompactionSummary),

    /// Ran, but no synced event was old enough
    NothingToArchive,

    /// The previous pass is still within the retention window
    NotDue { next_due: DateTime<Utc> },
}

/// Archives acknowledged ledger events older than the retention window.
#[derive(Clone)]
pub struct CompactionScheduler {
    store: Arc<PersistentStore>,
}

impl CompactionScheduler {
    pub fn new(store: Arc<PersistentStore>) -> Self {
        Self { store }
    }

    pub async fn last_compaction(&self) -> Result<Option<DateTime<Utc>>> {
        let value = self.store.meta(meta::LAST_COMPACTION).await?;
        Ok(value.as_ref().and_then(parse_timestamp))
    }

    /// Unconditionally archives every synced event older than
    /// `now - retention_days` into one summary.
    pub async fn compact(
        &self,
        retention_days: u32,
        now: DateTime<Utc>,
    ) -> Result<CompactionOutcome> {
        let outcome = self
            .store
            .transaction(|tx| compact_in(tx, retention_days, now))
            .await?;
        log_outcome(&outcome);
        Ok(outcome)
    }

    /// Compacts only if no pass ran within the last retention window.
    pub async fn compact_if_due(
        &self,
        retention_days: u32,
        now: DateTime<Utc>,
    ) -> Result<CompactionOutcome> {
        let window = Duration::days(i64::from(retention_days));
        let outcome = self
            .store
            .transaction(|tx| {
                let last = tx.meta(meta::LAST_COMPACTION)?;
                if let Some(last) = last.as_ref().and_then(parse_timestamp) {
                    let next_due = last + window;
                    if next_due > now {
                        return Ok(CompactionOutcome::NotDue { next_due });
                    }
                }
                compact_in(tx, retention_days, now)
            })
            .await?;
        log_outcome(&outcome);
        Ok(outcome)
    }
}

fn compact_in(
    tx: &StoreTx<'_>,
    retention_days: u32,
    now: DateTime<Utc>,
) -> store::Result<CompactionOutcome> {
    let cutoff = now - Duration::days(i64::from(retention_days));
    let events = tx.synced_events_before(cutoff)?;
    tx.put_meta(meta::LAST_COMPACTION, &Value::from(now.to_rfc3339()))?;

    let (Some(first), Some(last)) = (events.first(), events.last()) else {
        return Ok(CompactionOutcome::NothingToArchive);
    };

    let mut type_counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut range_start = first.timestamp;
    let mut range_end = last.timestamp;
    for event in &events {
        *type_counts
            .entry(event.event_type.as_str().to_string())
            .or_insert(0) += 1;
        range_start = range_start.min(event.timestamp);
        range_end = range_end.max(event.timestamp);
    }

    let mut summary = CompactionSummary {
        id: None,
        date: now.date_naive(),
        archived_event_count: events.len() as u64,
        range_start,
        range_end,
        type_counts,
    };
    summary.id = Some(tx.insert_summary(&summary)?);
    for event in &events {
        if let Some(seq) = event.seq {
            tx.delete_event(seq)?;
        }
    }
    Ok(CompactionOutcome::Archived(summary))
}

fn log_outcome(outcome: &CompactionOutcome) {
    match outcome {
        CompactionOutcome::Archived(summary) => info!(
            archived = summary.archived_event_count,
            range_start = %summary.range_start,
            range_end = %summary.range_end,
            "ledger compacted"
        ),
        CompactionOutcome::NothingToArchive => debug!("no ledger events eligible for compaction"),
        CompactionOutcome::NotDue { next_due } => {
            debug!(%next_due, "compaction not due")
        }
    }
}
