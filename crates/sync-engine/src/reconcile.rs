use chrono::Utc;
use std::sync::Arc;
use store::{
    ConfirmedState, EventType, LedgerEvent, PersistentStore, ProvisionalState, ProvisionalTask,
    SyncStatus,
};
use tasks::{Task, TaskId};
use tracing::{debug, info, warn};

use crate::{Result, SyncError};

/// Result of a reconcile call
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// The provisional task now lives under its confirmed id
    Reconciled(Task),

    /// No provisional record was found, e.g. a duplicate notification
    AlreadyReconciled,
}

/// Moves optimistically created tasks from provisional to confirmed
/// identity once the remote authority has assigned one.
#[derive(Clone)]
pub struct ReconciliationEngine {
    store: Arc<PersistentStore>,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<PersistentStore>) -> Self {
        Self { store }
    }

    /// Replaces provisional task `provisional_id` with a confirmed copy
    /// under `confirmed_id`.
    ///
    /// Runs as two transactions: the provisional row is read and deleted,
    /// and only after that commit does the confirmed write begin. Calling it
    /// again for the same pair is a no-op.
    pub async fn reconcile(
        &self,
        provisional_id: &str,
        confirmed_id: i64,
    ) -> Result<ReconcileOutcome> {
        let from = TaskId::Provisional(provisional_id.to_string());
        let to = TaskId::confirmed(confirmed_id)?;

        let taken = self
            .store
            .transaction(|tx| {
                let Some(row) = tx.provisional_task(provisional_id)? else {
                    return Ok(None);
                };
                tx.delete_provisional(provisional_id)?;
                Ok(Some(row))
            })
            .await?;
        let Some(row) = taken else {
            debug!(provisional_id, confirmed_id, "nothing to reconcile");
            return Ok(ReconcileOutcome::AlreadyReconciled);
        };

        let mut task = row.task;
        task.id = to.clone();
        let retargeted = self
            .store
            .transaction(|tx| {
                tx.write_task(&task)?;
                let retargeted = tx.retarget_operations(&from, &to)?;
                let state = if retargeted > 0 {
                    ConfirmedState::Pending
                } else {
                    ConfirmedState::Complete
                };
                tx.set_confirmed_state(confirmed_id, state)?;

                let mut event = LedgerEvent::pending(
                    EventType::Reconciled,
                    &to,
                    Utc::now(),
                    tx.local_clock()?,
                );
                event.sync_status = SyncStatus::Synced;
                tx.append_event(&event)?;
                Ok(retargeted)
            })
            .await?;

        info!(provisional_id, confirmed_id, retargeted, "reconciled provisional task");
        Ok(ReconcileOutcome::Reconciled(task))
    }

    /// Records a failed create. The task stays in the provisional space.
    pub async fn mark_failed(&self, provisional_id: &str, error: &str) -> Result<ProvisionalTask> {
        let row = self
            .update(provisional_id, |row| {
                row.state = ProvisionalState::Failed;
                row.retry_count += 1;
                row.last_error = Some(error.to_string());
            })
            .await?;
        warn!(provisional_id, retry_count = row.retry_count, error, "provisional create failed");
        Ok(row)
    }

    /// Moves a failed task back to pending and re-arms its queued
    /// operations.
    pub async fn retry(&self, provisional_id: &str) -> Result<ProvisionalTask> {
        let id = TaskId::Provisional(provisional_id.to_string());
        let row = self
            .store
            .transaction(|tx| {
                let Some(mut row) = tx.provisional_task(provisional_id)? else {
                    return Ok(None);
                };
                row.state = ProvisionalState::Pending;
                row.last_error = None;
                tx.put_provisional(&row)?;
                for mut op in tx.queued_operations()? {
                    if op.entity_id == id && op.failed {
                        op.failed = false;
                        op.retry_count = 0;
                        tx.put_operation(&op)?;
                    }
                }
                Ok(Some(row))
            })
            .await?
            .ok_or_else(|| SyncError::TaskNotFound(id.clone()))?;
        info!(provisional_id, "provisional create re-armed");
        Ok(row)
    }

    /// Gives up on a provisional task: removes it together with every
    /// queued operation that targets it.
    pub async fn discard(&self, provisional_id: &str) -> Result<bool> {
        let id = TaskId::Provisional(provisional_id.to_string());
        let removed = self
            .store
            .transaction(|tx| {
                for op in tx.queued_operations()? {
                    if op.entity_id == id {
                        if let Some(op_id) = op.id {
                            tx.delete_operation(op_id)?;
                        }
                    }
                }
                tx.delete_provisional(provisional_id)
            })
            .await?;
        if removed {
            info!(provisional_id, "provisional task discarded");
        }
        Ok(removed)
    }

    /// First half of the guarded two-step delete.
    pub async fn mark_confirmed_for_cleanup(&self, provisional_id: &str) -> Result<bool> {
        let marked = self
            .store
            .transaction(|tx| {
                let Some(mut row) = tx.provisional_task(provisional_id)? else {
                    return Ok(false);
                };
                row.state = ProvisionalState::Confirmed;
                tx.put_provisional(&row)?;
                Ok(true)
            })
            .await?;
        Ok(marked)
    }

    /// Second half: deletes the row only if its stored state is still
    /// exactly `confirmed`, so a late pending write is never removed.
    pub async fn remove_if_confirmed(&self, provisional_id: &str) -> Result<bool> {
        let removed = self
            .store
            .transaction(|tx| tx.delete_provisional_if(provisional_id, ProvisionalState::Confirmed))
            .await?;
        if !removed {
            debug!(provisional_id, "cleanup skipped, row is not confirmed");
        }
        Ok(removed)
    }

    async fn update(
        &self,
        provisional_id: &str,
        change: impl FnOnce(&mut ProvisionalTask),
    ) -> Result<ProvisionalTask> {
        self.store
            .transaction(|tx| {
                let Some(mut row) = tx.provisional_task(provisional_id)? else {
                    return Ok(None);
                };
                change(&mut row);
                tx.put_provisional(&row)?;
                Ok(Some(row))
            })
            .await?
            .ok_or_else(|| SyncError::TaskNotFound(TaskId::Provisional(provisional_id.into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use store::{OperationType, QueuedOperation, Record, Space};
    use tasks::NodeId;

    use crate::OfflineQueue;

    async fn seeded(id: &str) -> (Arc<PersistentStore>, ReconciliationEngine) {
        let store = Arc::new(PersistentStore::in_memory());
        let task = Task::new(TaskId::Provisional(id.to_string()), "Buy milk")
            .with_created_at(Utc::now());
        store
            .put(
                Space::Provisional,
                Record::Provisional(ProvisionalTask::pending(task)),
            )
            .await
            .unwrap();
        let engine = ReconciliationEngine::new(store.clone());
        (store, engine)
    }

    async fn snapshot(store: &PersistentStore) -> (Vec<Record>, Vec<Record>) {
        (
            store.get_all(Space::Confirmed).await.unwrap(),
            store.get_all(Space::Provisional).await.unwrap(),
        )
    }

    #[tokio::test]
    async fn test_reconcile_moves_task() {
        let (store, engine) = seeded("temp_abc").await;
        let outcome = engine.reconcile("temp_abc", 42).await.unwrap();
        let ReconcileOutcome::Reconciled(task) = outcome else {
            panic!("expected reconciliation");
        };
        assert_eq!(task.id, TaskId::Confirmed(42));

        let (confirmed, provisional) = snapshot(&store).await;
        assert!(provisional.is_empty());
        assert_eq!(confirmed.len(), 1);
        let Record::Confirmed(stored) = &confirmed[0] else {
            panic!("wrong space");
        };
        assert_eq!(stored.title, "Buy milk");

        let views = store.get_all_entities().await.unwrap();
        assert_eq!(views[0].sync, None);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let (store, engine) = seeded("temp_abc").await;
        engine.reconcile("temp_abc", 42).await.unwrap();
        let once = snapshot(&store).await;

        let again = engine.reconcile("temp_abc", 42).await.unwrap();
        assert_eq!(again, ReconcileOutcome::AlreadyReconciled);
        assert_eq!(snapshot(&store).await, once);
    }

    #[tokio::test]
    async fn test_reconcile_rejects_bad_confirmed_id() {
        let (store, engine) = seeded("temp_abc").await;
        assert!(matches!(
            engine.reconcile("temp_abc", 0).await,
            Err(SyncError::Validation(_))
        ));
        assert_eq!(store.stats().await.unwrap().provisional, 1);
    }

    #[tokio::test]
    async fn test_reconcile_retargets_queued_followups() {
        let (store, engine) = seeded("temp_abc").await;
        let queue = OfflineQueue::new(store.clone(), NodeId::from("device-a"));
        queue
            .enqueue(QueuedOperation::new(
                OperationType::Update,
                TaskId::Provisional("temp_abc".into()),
                json!({"id": "temp_abc", "title": "Buy oat milk"}),
            ))
            .await
            .unwrap();

        engine.reconcile("temp_abc", 42).await.unwrap();

        let ops = queue.dequeue_in_order().await.unwrap();
        assert_eq!(ops[0].entity_id, TaskId::Confirmed(42));
        assert_eq!(ops[0].payload["id"], json!(42));
        let views = store.get_all_entities().await.unwrap();
        assert_eq!(views[0].sync, Some(store::SyncMarker::Pending));
    }

    #[tokio::test]
    async fn test_mark_failed_keeps_record() {
        let (store, engine) = seeded("temp_abc").await;
        let row = engine.mark_failed("temp_abc", "503").await.unwrap();
        assert_eq!(row.state, ProvisionalState::Failed);
        assert_eq!(row.retry_count, 1);
        assert_eq!(row.last_error.as_deref(), Some("503"));

        let row = engine.mark_failed("temp_abc", "504").await.unwrap();
        assert_eq!(row.retry_count, 2);
        assert_eq!(store.stats().await.unwrap().provisional, 1);

        let row = engine.retry("temp_abc").await.unwrap();
        assert_eq!(row.state, ProvisionalState::Pending);
        assert_eq!(row.retry_count, 2);
    }

    #[tokio::test]
    async fn test_discard_removes_task_and_operations() {
        let (store, engine) = seeded("temp_abc").await;
        let queue = OfflineQueue::new(store.clone(), NodeId::from("device-a"));
        queue
            .enqueue(QueuedOperation::new(
                OperationType::Create,
                TaskId::Provisional("temp_abc".into()),
                json!({}),
            ))
            .await
            .unwrap();

        assert!(engine.discard("temp_abc").await.unwrap());
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.provisional, 0);
        assert_eq!(stats.queue, 0);
    }

    #[tokio::test]
    async fn test_remove_if_confirmed_guards_late_pending_write() {
        let (store, engine) = seeded("temp_abc").await;
        assert!(engine.mark_confirmed_for_cleanup("temp_abc").await.unwrap());

        // a late write puts the row back to pending before cleanup runs
        let Some(Record::Provisional(mut row)) =
            store.get(Space::Provisional, "temp_abc").await.unwrap()
        else {
            panic!("row missing");
        };
        row.state = ProvisionalState::Pending;
        store
            .put(Space::Provisional, Record::Provisional(row))
            .await
            .unwrap();

        assert!(!engine.remove_if_confirmed("temp_abc").await.unwrap());
        assert_eq!(store.stats().await.unwrap().provisional, 1);

        engine.mark_confirmed_for_cleanup("temp_abc").await.unwrap();
        assert!(engine.remove_if_confirmed("temp_abc").await.unwrap());
        assert_eq!(store.stats().await.unwrap().provisional, 0);
    }
}
