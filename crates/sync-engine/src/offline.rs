/// Offline mutation queue and its replay order
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use store::{
    ConfirmedState, EventType, LedgerEvent, OperationType, PersistentStore, QueuedOperation,
    StoreTx,
};
use tasks::{NodeId, TaskId};
use tracing::{debug, info, warn};

use crate::{Result, SyncError};

fn event_type_for(op_type: OperationType) -> EventType {
    match op_type {
        OperationType::Create => EventType::Created,
        OperationType::Update => EventType::Updated,
        OperationType::Delete => EventType::Deleted,
    }
}

/// Enqueues `op` inside an open transaction: ticks the local node's clock,
/// persists the new clock, stamps the operation with a snapshot of it, and
/// records a pending ledger event. Lets callers pair the enqueue with their
/// optimistic entity write in one atomic unit.
pub fn enqueue_in(
    tx: &StoreTx<'_>,
    node: &NodeId,
    mut op: QueuedOperation,
) -> store::Result<QueuedOperation> {
    let mut clock = tx.local_clock()?;
    clock.increment(node);
    tx.put_local_clock(&clock)?;

    op.id = None;
    op.failed = false;
    op.vector_clock = clock.clone();
    let event_type = event_type_for(op.op_type);
    let event = LedgerEvent::pending(event_type, &op.entity_id, op.timestamp, clock);
    op.ledger_seq = Some(tx.append_event(&event)?);
    op.id = Some(tx.put_operation(&op)?);
    Ok(op)
}

/// Sorts operations into replay order.
///
/// Three levels, each breaking ties of the one before: higher priority
/// first; then causal order, where an operation whose clock is dominated by
/// another's goes first; then the earlier timestamp. Equal clocks count as
/// concurrent and fall through to the timestamp.
///
/// Priority only orders different entities. Operations on one entity keep
/// their causal order: they take over the slots the comparator gave that
/// entity, earliest first, so an edit that raises a task's priority never
/// overtakes the task's create.
pub fn sort_for_replay(ops: Vec<QueuedOperation>) -> Vec<QueuedOperation> {
    let ranked = priority_order(ops);
    let slots: Vec<TaskId> = ranked.iter().map(|op| op.entity_id.clone()).collect();

    let mut per_entity: HashMap<TaskId, Vec<QueuedOperation>> = HashMap::new();
    for op in ranked {
        per_entity.entry(op.entity_id.clone()).or_default().push(op);
    }
    let mut per_entity: HashMap<TaskId, VecDeque<QueuedOperation>> = per_entity
        .into_iter()
        .map(|(id, ops)| (id, causal_order(ops).into()))
        .collect();

    slots
        .iter()
        .filter_map(|id| per_entity.get_mut(id).and_then(VecDeque::pop_front))
        .collect()
}

/// Clock dominance is only a partial order, so this picks, within each
/// priority band, the earliest operation that dominates nothing still
/// waiting. Deterministic for any input.
fn priority_order(mut ops: Vec<QueuedOperation>) -> Vec<QueuedOperation> {
    ops.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.timestamp.cmp(&b.timestamp))
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut ordered = Vec::with_capacity(ops.len());
    while !ops.is_empty() {
        let priority = ops[0].priority;
        let band = ops.iter().take_while(|op| op.priority == priority).count();
        ordered.push(ops.remove(earliest_undominating(&ops[..band])));
    }
    ordered
}

/// Causal order ignoring priority.
fn causal_order(mut ops: Vec<QueuedOperation>) -> Vec<QueuedOperation> {
    ops.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    let mut ordered = Vec::with_capacity(ops.len());
    while !ops.is_empty() {
        ordered.push(ops.remove(earliest_undominating(&ops)));
    }
    ordered
}

fn earliest_undominating(ops: &[QueuedOperation]) -> usize {
    (0..ops.len())
        .find(|&i| {
            !ops
                .iter()
                .any(|other| ops[i].vector_clock.dominates(&other.vector_clock))
        })
        .unwrap_or(0)
}

/// Persistent queue of mutations not yet acknowledged by the remote
/// service. Operations leave the queue only on acknowledgement or explicit
/// discard.
#[derive(Clone)]
pub struct OfflineQueue {
    store: Arc<PersistentStore>,
    node: NodeId,
}

impl OfflineQueue {
    pub fn new(store: Arc<PersistentStore>, node: NodeId) -> Self {
        Self { store, node }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node
    }

    /// Returns the operation as stored, with its id, clock and ledger seq.
    pub async fn enqueue(&self, op: QueuedOperation) -> Result<QueuedOperation> {
        let node = &self.node;
        let stored = self
            .store
            .transaction(|tx| enqueue_in(tx, node, op))
            .await?;
        debug!(
            op_id = ?stored.id,
            entity_id = %stored.entity_id,
            op_type = stored.op_type.as_str(),
            "operation queued"
        );
        Ok(stored)
    }

    /// The whole queue, failed operations included, in replay order.
    pub async fn dequeue_in_order(&self) -> Result<Vec<QueuedOperation>> {
        let ops = self.store.transaction(|tx| tx.queued_operations()).await?;
        Ok(sort_for_replay(ops))
    }

    /// Up to `limit` operations that may be sent now: each entity's causally
    /// earliest operation, and none for an entity whose earliest operation
    /// has failed.
    pub async fn next_batch(&self, limit: usize) -> Result<Vec<QueuedOperation>> {
        let mut seen: HashSet<TaskId> = HashSet::new();
        let mut batch = Vec::new();
        for op in self.dequeue_in_order().await? {
            if batch.len() >= limit {
                break;
            }
            if !seen.insert(op.entity_id.clone()) {
                continue;
            }
            if op.failed {
                continue;
            }
            batch.push(op);
        }
        Ok(batch)
    }

    pub async fn get(&self, id: i64) -> Result<Option<QueuedOperation>> {
        Ok(self.store.transaction(|tx| tx.queued_operation(id)).await?)
    }

    pub async fn len(&self) -> Result<usize> {
        let stats = self.store.stats().await?;
        Ok(stats.queue.max(0) as usize)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Removes an acknowledged operation.
    pub async fn remove(&self, id: i64) -> Result<bool> {
        Ok(self.store.transaction(|tx| tx.delete_operation(id)).await?)
    }

    /// Notes a failed attempt that will be retried.
    pub async fn record_retry(&self, id: i64, error: &str) -> Result<QueuedOperation> {
        self.update(id, |op| {
            op.retry_count += 1;
            op.last_error = Some(error.to_string());
        })
        .await
    }

    /// Marks an operation failed. It stays queued, surfaced for manual
    /// retry, and blocks later operations on the same entity.
    pub async fn mark_failed(&self, id: i64, error: &str) -> Result<QueuedOperation> {
        let op = self
            .update(id, |op| {
                op.failed = true;
                op.retry_count += 1;
                op.last_error = Some(error.to_string());
            })
            .await?;
        warn!(op_id = id, entity_id = %op.entity_id, error, "operation marked failed");
        Ok(op)
    }

    /// Makes a failed operation eligible for replay again.
    pub async fn reset_failed(&self, id: i64) -> Result<QueuedOperation> {
        self.update(id, |op| {
            op.failed = false;
            op.retry_count = 0;
        })
        .await
    }

    async fn update(
        &self,
        id: i64,
        change: impl FnOnce(&mut QueuedOperation),
    ) -> Result<QueuedOperation> {
        let updated = self
            .store
            .transaction(|tx| {
                let Some(mut op) = tx.queued_operation(id)? else {
                    return Ok(None);
                };
                change(&mut op);
                tx.put_operation(&op)?;
                Ok(Some(op))
            })
            .await?;
        updated.ok_or(SyncError::OperationNotFound(id))
    }

    /// Gives up on an operation and undoes its optimistic write: the
    /// rollback snapshot is restored, or a never-confirmed create is removed.
    pub async fn discard(&self, id: i64) -> Result<QueuedOperation> {
        let discarded = self
            .store
            .transaction(|tx| {
                let Some(op) = tx.queued_operation(id)? else {
                    return Ok(None);
                };
                tx.delete_operation(id)?;
                match (&op.rollback_snapshot, &op.entity_id) {
                    (Some(snapshot), _) => {
                        tx.write_task(snapshot)?;
                    }
                    (None, TaskId::Provisional(pid)) if op.op_type == OperationType::Create => {
                        tx.delete_provisional(pid)?;
                    }
                    _ => {}
                }
                if let TaskId::Confirmed(cid) = op.entity_id {
                    let still_queued = tx
                        .queued_operations()?
                        .iter()
                        .any(|other| other.entity_id == op.entity_id);
                    if !still_queued {
                        tx.set_confirmed_state(cid, ConfirmedState::Complete)?;
                    }
                }
                Ok(Some(op))
            })
            .await?;
        let op = discarded.ok_or(SyncError::OperationNotFound(id))?;
        info!(op_id = id, entity_id = %op.entity_id, "operation discarded");
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use store::{ProvisionalTask, Record, Space};
    use tasks::{Task, VectorClock};

    fn clock(pairs: &[(&str, u64)]) -> VectorClock {
        VectorClock::from_canonical_form(
            pairs
                .iter()
                .map(|(node, count)| (NodeId::from(*node), *count))
                .collect(),
        )
    }

    fn op(id: i64, priority: i32, vc: VectorClock, ts_offset: i64) -> QueuedOperation {
        let mut op = QueuedOperation::new(
            OperationType::Update,
            TaskId::Confirmed(id),
            json!({"id": id}),
        )
        .with_priority(priority)
        .with_timestamp(Utc::now() + Duration::seconds(ts_offset));
        op.id = Some(id);
        op.vector_clock = vc;
        op
    }

    fn ids(ops: &[QueuedOperation]) -> Vec<i64> {
        ops.iter().filter_map(|op| op.id).collect()
    }

    fn queue() -> OfflineQueue {
        OfflineQueue::new(Arc::new(PersistentStore::in_memory()), NodeId::from("device-a"))
    }

    #[test]
    fn test_priority_wins_over_clock_and_time() {
        let ops = vec![
            op(1, 0, clock(&[("a", 1)]), 0),
            op(2, 5, clock(&[("a", 9)]), 10),
        ];
        assert_eq!(ids(&sort_for_replay(ops)), vec![2, 1]);
    }

    #[test]
    fn test_dominated_operation_goes_first_despite_later_timestamp() {
        let ops = vec![
            op(1, 0, clock(&[("a", 2), ("b", 1)]), 0),
            op(2, 0, clock(&[("a", 1)]), 60),
        ];
        assert_eq!(ids(&sort_for_replay(ops)), vec![2, 1]);
    }

    #[test]
    fn test_concurrent_operations_fall_back_to_timestamp() {
        let ops = vec![
            op(1, 0, clock(&[("a", 1)]), 30),
            op(2, 0, clock(&[("b", 1)]), 0),
        ];
        assert_eq!(ids(&sort_for_replay(ops)), vec![2, 1]);
    }

    #[test]
    fn test_dominating_always_after_dominated() {
        let clocks = [
            clock(&[("a", 3), ("b", 2)]),
            clock(&[("b", 1)]),
            clock(&[("a", 1)]),
            clock(&[("a", 2), ("b", 1)]),
            clock(&[("c", 4)]),
            clock(&[("a", 1), ("b", 1)]),
        ];
        let ops: Vec<_> = clocks
            .iter()
            .enumerate()
            .map(|(i, vc)| op(i as i64 + 1, 0, vc.clone(), 100 - i as i64 * 10))
            .collect();
        let sorted = sort_for_replay(ops);
        for (i, earlier) in sorted.iter().enumerate() {
            for later in &sorted[i + 1..] {
                assert!(
                    !earlier.vector_clock.dominates(&later.vector_clock),
                    "op {:?} replayed before an op it dominates",
                    earlier.id
                );
            }
        }
    }

    /// Equal clocks are not deduplicated: both operations survive and are
    /// ordered by timestamp. Flagged here because identical clocks on one
    /// device usually mean a duplicate enqueue.
    #[test]
    fn test_equal_clocks_are_not_deduplicated() {
        let vc = clock(&[("a", 4)]);
        let ops = vec![op(1, 0, vc.clone(), 5), op(2, 0, vc, 1)];
        let sorted = sort_for_replay(ops);
        assert_eq!(ids(&sorted), vec![2, 1]);
    }

    #[test]
    fn test_same_entity_keeps_causal_order_across_priorities() {
        let mut create = op(1, 1, clock(&[("a", 1)]), 0);
        create.op_type = OperationType::Create;
        let mut raise = op(2, 3, clock(&[("a", 3)]), 20);
        raise.entity_id = TaskId::Confirmed(1);
        let other = op(3, 2, clock(&[("a", 2)]), 10);

        let sorted = sort_for_replay(vec![raise, other, create]);
        assert_eq!(ids(&sorted), vec![1, 3, 2]);
        assert_eq!(sorted[0].op_type, OperationType::Create);
    }

    #[tokio::test]
    async fn test_next_batch_picks_earliest_operation_per_entity() {
        let queue = queue();
        let draft = TaskId::Provisional("temp_abc".into());
        let create = queue
            .enqueue(
                QueuedOperation::new(OperationType::Create, draft.clone(), json!({"title": "x"}))
                    .with_priority(1),
            )
            .await
            .unwrap();
        queue
            .enqueue(
                QueuedOperation::new(OperationType::Update, draft.clone(), json!({"title": "y"}))
                    .with_priority(3),
            )
            .await
            .unwrap();
        let other = queue
            .enqueue(
                QueuedOperation::new(OperationType::Update, TaskId::Confirmed(9), json!({}))
                    .with_priority(2),
            )
            .await
            .unwrap();

        let batch = queue.next_batch(10).await.unwrap();
        assert_eq!(ids(&batch), vec![create.id.unwrap(), other.id.unwrap()]);

        let all = queue.dequeue_in_order().await.unwrap();
        let draft_ops: Vec<_> = all
            .iter()
            .filter(|op| op.entity_id == draft)
            .map(|op| op.op_type)
            .collect();
        assert_eq!(draft_ops, vec![OperationType::Create, OperationType::Update]);
    }

    #[tokio::test]
    async fn test_enqueue_ticks_clock_and_records_ledger() {
        let queue = queue();
        let first = queue
            .enqueue(QueuedOperation::new(
                OperationType::Create,
                TaskId::Provisional("temp_abc".into()),
                json!({"id": "temp_abc", "title": "Buy milk"}),
            ))
            .await
            .unwrap();
        let second = queue
            .enqueue(QueuedOperation::new(
                OperationType::Update,
                TaskId::Provisional("temp_abc".into()),
                json!({"title": "Buy oat milk"}),
            ))
            .await
            .unwrap();

        let node = NodeId::from("device-a");
        assert_eq!(first.vector_clock.get(&node), 1);
        assert_eq!(second.vector_clock.get(&node), 2);
        assert!(second.vector_clock.dominates(&first.vector_clock));
        assert!(first.ledger_seq.is_some());

        let events = queue.store.get_all(Space::Ledger).await.unwrap();
        assert_eq!(events.len(), 2);

        let ordered = queue.dequeue_in_order().await.unwrap();
        assert_eq!(ordered[0].id, first.id);
    }

    #[tokio::test]
    async fn test_next_batch_sends_one_per_entity() {
        let queue = queue();
        for title in ["a", "b"] {
            queue
                .enqueue(QueuedOperation::new(
                    OperationType::Update,
                    TaskId::Confirmed(1),
                    json!({"title": title}),
                ))
                .await
                .unwrap();
        }
        queue
            .enqueue(QueuedOperation::new(
                OperationType::Update,
                TaskId::Confirmed(2),
                json!({"title": "c"}),
            ))
            .await
            .unwrap();

        let batch = queue.next_batch(10).await.unwrap();
        let entities: Vec<_> = batch.iter().map(|op| op.entity_id.clone()).collect();
        assert_eq!(entities, vec![TaskId::Confirmed(1), TaskId::Confirmed(2)]);
        assert_eq!(batch[0].payload, json!({"title": "a"}));

        assert_eq!(queue.next_batch(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_operation_blocks_its_entity() {
        let queue = queue();
        let failed = queue
            .enqueue(QueuedOperation::new(
                OperationType::Update,
                TaskId::Confirmed(1),
                json!({"title": "a"}),
            ))
            .await
            .unwrap();
        queue
            .enqueue(QueuedOperation::new(
                OperationType::Update,
                TaskId::Confirmed(1),
                json!({"title": "b"}),
            ))
            .await
            .unwrap();
        let failed_id = failed.id.unwrap();

        let marked = queue.mark_failed(failed_id, "boom").await.unwrap();
        assert!(marked.failed);
        assert_eq!(marked.retry_count, 1);
        assert!(queue.next_batch(10).await.unwrap().is_empty());
        assert_eq!(queue.len().await.unwrap(), 2);

        queue.reset_failed(failed_id).await.unwrap();
        let batch = queue.next_batch(10).await.unwrap();
        assert_eq!(batch[0].id, Some(failed_id));
    }

    #[tokio::test]
    async fn test_remove_and_missing_ids() {
        let queue = queue();
        let stored = queue
            .enqueue(QueuedOperation::new(
                OperationType::Delete,
                TaskId::Confirmed(3),
                json!({"id": 3}),
            ))
            .await
            .unwrap();
        assert!(queue.remove(stored.id.unwrap()).await.unwrap());
        assert!(queue.is_empty().await.unwrap());
        assert!(matches!(
            queue.mark_failed(999, "x").await,
            Err(SyncError::OperationNotFound(999))
        ));
    }

    #[tokio::test]
    async fn test_discard_restores_snapshot() {
        let queue = queue();
        let before = Task::new(TaskId::Confirmed(1), "original");
        let mut after = before.clone();
        after.title = "edited".into();
        queue.store.save_entity(after.clone()).await.unwrap();
        let stored = queue
            .enqueue(
                QueuedOperation::new(
                    OperationType::Update,
                    after.id.clone(),
                    json!({"title": "edited"}),
                )
                .with_rollback(before.clone()),
            )
            .await
            .unwrap();

        queue.discard(stored.id.unwrap()).await.unwrap();
        let Some(Record::Confirmed(task)) = queue.store.get(Space::Confirmed, 1i64).await.unwrap()
        else {
            panic!("task 1 missing");
        };
        assert_eq!(task.title, "original");
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_discard_create_removes_provisional() {
        let queue = queue();
        let task = Task::provisional("draft", Utc::now());
        queue
            .store
            .put(
                Space::Provisional,
                Record::Provisional(ProvisionalTask::pending(task.clone())),
            )
            .await
            .unwrap();
        let stored = queue
            .enqueue(QueuedOperation::new(
                OperationType::Create,
                task.id.clone(),
                task.to_value(),
            ))
            .await
            .unwrap();

        queue.discard(stored.id.unwrap()).await.unwrap();
        assert!(queue.store.get_all(Space::Provisional).await.unwrap().is_empty());
    }
}
