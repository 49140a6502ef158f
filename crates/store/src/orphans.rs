use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use tasks::{Task, TaskId};
use tracing::{debug, info};

use crate::records::ProvisionalState;
use crate::{PersistentStore, Result};

/// Minimum age in seconds before an unreferenced provisional task counts as
/// orphaned
pub const DEFAULT_ORPHAN_THRESHOLD_SECS: i64 = 600;

/// Creation timestamps older than this are treated as a parsing bug.
const MAX_PLAUSIBLE_AGE_DAYS: i64 = 365;

/// Why a provisional task was kept or removed by orphan cleanup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanVerdict {
    /// A queued operation still points at the task
    Referenced,

    /// The create failed and is waiting for a manual retry
    AwaitingRetry,

    MissingTimestamp,

    /// Created in the future relative to `now`
    FutureTimestamp,

    ImplausiblyOld,

    TooYoung,

    Orphan,
}

impl OrphanVerdict {
    pub fn removes(&self) -> bool {
        matches!(self, Self::Orphan)
    }
}

/// Decides the fate of one provisional task. Anything that looks like bad
/// data rather than a genuine orphan is kept.
pub fn classify_orphan(
    task: &Task,
    state: ProvisionalState,
    referenced: bool,
    now: DateTime<Utc>,
    threshold: Duration,
) -> OrphanVerdict {
    if referenced {
        return OrphanVerdict::Referenced;
    }
    if state == ProvisionalState::Failed {
        return OrphanVerdict::AwaitingRetry;
    }
    let Some(created_at) = task.created_at else {
        return OrphanVerdict::MissingTimestamp;
    };
    let age = now - created_at;
    if age < Duration::zero() {
        return OrphanVerdict::FutureTimestamp;
    }
    if age > Duration::days(MAX_PLAUSIBLE_AGE_DAYS) {
        return OrphanVerdict::ImplausiblyOld;
    }
    if age < threshold {
        return OrphanVerdict::TooYoung;
    }
    OrphanVerdict::Orphan
}

impl PersistentStore {
    /// Deletes provisional tasks that nothing references and that are old
    /// enough to be abandoned. Returns the removed ids.
    pub async fn cleanup_orphans(
        &self,
        now: DateTime<Utc>,
        threshold: Duration,
    ) -> Result<Vec<TaskId>> {
        let removed = self
            .transaction(|tx| {
                let referenced: HashSet<TaskId> = tx
                    .queued_operations()?
                    .into_iter()
                    .map(|op| op.entity_id)
                    .collect();

                let mut removed = Vec::new();
                for row in tx.provisional_tasks()? {
                    let verdict = classify_orphan(
                        &row.task,
                        row.state,
                        referenced.contains(&row.task.id),
                        now,
                        threshold,
                    );
                    if !verdict.removes() {
                        debug!(entity_id = %row.task.id, ?verdict, "provisional task kept");
                        continue;
                    }
                    if let Some(id) = row.task.id.as_provisional() {
                        tx.delete_provisional(id)?;
                        removed.push(row.task.id.clone());
                    }
                }
                Ok(removed)
            })
            .await?;

        for id in &removed {
            info!(entity_id = %id, "removed orphaned provisional task");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{OperationType, ProvisionalTask, QueuedOperation, Record, Space};
    use serde_json::json;

    fn threshold() -> Duration {
        Duration::seconds(DEFAULT_ORPHAN_THRESHOLD_SECS)
    }

    fn aged(title: &str, now: DateTime<Utc>, minutes: i64) -> Task {
        Task::provisional(title, now - Duration::minutes(minutes))
    }

    async fn seed(store: &PersistentStore, task: Task) {
        store
            .put(Space::Provisional, Record::Provisional(ProvisionalTask::pending(task)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_respects_age_threshold() {
        let store = PersistentStore::in_memory();
        let now = Utc::now();
        let young = aged("nine minutes", now, 9);
        let old = aged("eleven minutes", now, 11);
        seed(&store, young.clone()).await;
        seed(&store, old.clone()).await;

        let removed = store.cleanup_orphans(now, threshold()).await.unwrap();

        assert_eq!(removed, vec![old.id]);
        let left = store.get_all(Space::Provisional).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].key(), Some((&young.id).into()));
    }

    #[tokio::test]
    async fn test_cleanup_keeps_referenced_tasks() {
        let store = PersistentStore::in_memory();
        let now = Utc::now();
        let old = aged("queued", now, 11);
        seed(&store, old.clone()).await;
        let op = QueuedOperation::new(OperationType::Create, old.id.clone(), json!({}));
        store.put(Space::Queue, Record::Queue(op)).await.unwrap();

        let removed = store.cleanup_orphans(now, threshold()).await.unwrap();
        assert!(removed.is_empty());
        assert_eq!(store.stats().await.unwrap().provisional, 1);
    }

    #[test]
    fn test_suspicious_timestamps_are_kept() {
        let now = Utc::now();
        let threshold = threshold();
        let pending = ProvisionalState::Pending;

        let mut missing = aged("missing", now, 30);
        missing.created_at = None;
        assert_eq!(
            classify_orphan(&missing, pending, false, now, threshold),
            OrphanVerdict::MissingTimestamp
        );

        let future = Task::provisional("future", now + Duration::minutes(5));
        assert_eq!(
            classify_orphan(&future, pending, false, now, threshold),
            OrphanVerdict::FutureTimestamp
        );

        let ancient = Task::provisional("ancient", now - Duration::days(4000));
        assert_eq!(
            classify_orphan(&ancient, pending, false, now, threshold),
            OrphanVerdict::ImplausiblyOld
        );

        let failed = aged("failed", now, 60);
        assert_eq!(
            classify_orphan(&failed, ProvisionalState::Failed, false, now, threshold),
            OrphanVerdict::AwaitingRetry
        );
    }

    #[test]
    fn test_non_finite_created_at_parses_as_missing() {
        let task = Task::from_remote(json!({
            "id": "temp_nan",
            "title": "bad clock",
            "created_at": "NaN"
        }))
        .unwrap();
        assert_eq!(
            classify_orphan(
                &task,
                ProvisionalState::Pending,
                false,
                Utc::now(),
                threshold()
            ),
            OrphanVerdict::MissingTimestamp
        );
    }
}
