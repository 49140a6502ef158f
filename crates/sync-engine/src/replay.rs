use serde_json::Value;
use std::sync::Arc;
use store::{meta, ConfirmedState, PersistentStore, ProvisionalState, QueuedOperation, StoreTx};
use tasks::{TaskId, WireTask};
use tracing::{debug, info, warn};

use crate::{
    OfflineQueue, ReconcileOutcome, ReconciliationEngine, RemoteAck, RemoteError, RemoteRequest,
    RemoteService, Result, SyncConfig, SyncError,
};

/// What one replay pass achieved
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayReport {
    /// Operations acknowledged and removed from the queue
    pub acknowledged: usize,

    /// Operations marked failed during this pass
    pub failed: Vec<i64>,

    /// Provisional ids retired, with the confirmed id they now live under
    pub reconciled: Vec<(String, i64)>,

    /// The remote service reported a conflict; local state should be
    /// refreshed from the authority
    pub needs_refresh: bool,
}

/// Drains the offline queue against the remote service.
pub struct Replayer {
    store: Arc<PersistentStore>,
    queue: OfflineQueue,
    reconciler: ReconciliationEngine,
    remote: Arc<dyn RemoteService>,
    config: SyncConfig,
}

impl Replayer {
    pub fn new(
        store: Arc<PersistentStore>,
        queue: OfflineQueue,
        reconciler: ReconciliationEngine,
        remote: Arc<dyn RemoteService>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            queue,
            reconciler,
            remote,
            config,
        }
    }

    /// Sends batches until nothing sendable is left. Each operation ends
    /// acknowledged or failed, so every round shrinks the sendable set.
    pub async fn replay(&self) -> Result<ReplayReport> {
        let mut report = ReplayReport::default();
        let mut previous: Vec<Option<i64>> = Vec::new();
        loop {
            let batch = self.queue.next_batch(self.config.replay_batch_size).await?;
            if batch.is_empty() {
                break;
            }
            let ids: Vec<Option<i64>> = batch.iter().map(|op| op.id).collect();
            if ids == previous {
                warn!(?ids, "replay made no progress, stopping");
                break;
            }
            previous = ids;

            for op in batch {
                self.replay_one(op, &mut report).await?;
            }
        }

        if report.acknowledged > 0 || !report.failed.is_empty() {
            info!(
                acknowledged = report.acknowledged,
                failed = report.failed.len(),
                reconciled = report.reconciled.len(),
                "replay finished"
            );
        }
        Ok(report)
    }

    async fn replay_one(&self, op: QueuedOperation, report: &mut ReplayReport) -> Result<()> {
        let Some(op_id) = op.id else {
            return Ok(());
        };
        let request = match RemoteRequest::from_operation(&op) {
            Ok(request) => request,
            Err(SyncError::NotSendable { reason, .. }) => {
                self.fail(&op, &reason, report).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut attempts = op.retry_count;
        loop {
            match self.remote.send(request.clone()).await {
                Ok(ack) => {
                    self.acknowledge(&op, ack, report).await?;
                    report.acknowledged += 1;
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    attempts += 1;
                    if attempts >= self.config.max_attempts {
                        self.fail(&op, &e.to_string(), report).await?;
                        return Ok(());
                    }
                    self.queue.record_retry(op_id, &e.to_string()).await?;
                    let delay = self.config.backoff_delay(attempts);
                    debug!(op_id, attempts, ?delay, error = %e, "retrying operation");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if matches!(e, RemoteError::Conflict(_)) {
                        report.needs_refresh = true;
                    }
                    self.fail(&op, &e.to_string(), report).await?;
                    return Ok(());
                }
            }
        }
    }

    async fn fail(
        &self,
        op: &QueuedOperation,
        error: &str,
        report: &mut ReplayReport,
    ) -> Result<()> {
        let Some(op_id) = op.id else {
            return Ok(());
        };
        self.queue.mark_failed(op_id, error).await?;
        if let TaskId::Provisional(pid) = &op.entity_id {
            self.reconciler.mark_failed(pid, error).await?;
        }
        report.failed.push(op_id);
        Ok(())
    }

    async fn acknowledge(
        &self,
        op: &QueuedOperation,
        ack: RemoteAck,
        report: &mut ReplayReport,
    ) -> Result<()> {
        match ack {
            RemoteAck::Created {
                confirmed_id,
                entity,
            } => {
                let TaskId::Provisional(pid) = &op.entity_id else {
                    self.settle(op, None).await?;
                    return Ok(());
                };
                // the row is flagged first so a crash before reconcile
                // leaves it visible as awaiting cleanup, not pending
                self.store
                    .transaction(|tx| {
                        settle_in(tx, op)?;
                        if let Some(mut row) = tx.provisional_task(pid)? {
                            row.state = ProvisionalState::Confirmed;
                            tx.put_provisional(&row)?;
                        }
                        Ok(())
                    })
                    .await?;

                if let ReconcileOutcome::Reconciled(_) =
                    self.reconciler.reconcile(pid, confirmed_id).await?
                {
                    report.reconciled.push((pid.clone(), confirmed_id));
                }
                if let Some(entity) = entity {
                    let id = TaskId::confirmed(confirmed_id)?;
                    self.store
                        .transaction(|tx| absorb_entity(tx, &id, entity))
                        .await?;
                }
            }
            RemoteAck::Updated { entity } => {
                self.settle(op, entity).await?;
            }
            RemoteAck::Deleted => {
                self.settle(op, None).await?;
                if let TaskId::Confirmed(id) = op.entity_id {
                    self.store.purge_deleted(id).await?;
                }
            }
        }
        Ok(())
    }

    /// Removes an acknowledged operation and, when nothing else is queued
    /// for its task, marks the task synced and absorbs the returned entity.
    async fn settle(&self, op: &QueuedOperation, entity: Option<Value>) -> Result<()> {
        self.store
            .transaction(|tx| {
                settle_in(tx, op)?;
                if let Some(entity) = entity {
                    absorb_entity(tx, &op.entity_id, entity)?;
                } else if let TaskId::Confirmed(id) = op.entity_id {
                    if !has_queued(tx, &op.entity_id)? {
                        tx.set_confirmed_state(id, ConfirmedState::Complete)?;
                    }
                }
                Ok(())
            })
            .await?;
        Ok(())
    }
}

fn settle_in(tx: &StoreTx<'_>, op: &QueuedOperation) -> store::Result<()> {
    if let Some(op_id) = op.id {
        tx.delete_operation(op_id)?;
    }
    if let Some(seq) = op.ledger_seq {
        tx.mark_event_synced(seq)?;
        let last = tx
            .meta(meta::LAST_SYNCED_SEQ)?
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        if seq > last {
            tx.put_meta(meta::LAST_SYNCED_SEQ, &Value::from(seq))?;
        }
    }
    Ok(())
}

fn has_queued(tx: &StoreTx<'_>, id: &TaskId) -> store::Result<bool> {
    Ok(tx.queued_operations()?.iter().any(|op| &op.entity_id == id))
}

/// Stores the entity echoed back by the remote service, unless later local
/// edits are still queued for it. Malformed echoes are logged and ignored.
fn absorb_entity(tx: &StoreTx<'_>, id: &TaskId, entity: Value) -> store::Result<()> {
    let TaskId::Confirmed(confirmed) = *id else {
        return Ok(());
    };
    if has_queued(tx, id)? {
        debug!(entity_id = %id, "later edits queued, keeping local copy");
        return Ok(());
    }
    match WireTask::parse(entity) {
        Ok(wire) if wire.task.id == *id => {
            tx.write_wire(&wire)?;
        }
        Ok(wire) => {
            warn!(entity_id = %id, echoed = %wire.task.id, "remote echoed a different task");
        }
        Err(e) => {
            warn!(entity_id = %id, error = %e, "ignoring malformed remote echo");
        }
    }
    tx.set_confirmed_state(confirmed, ConfirmedState::Complete)?;
    Ok(())
}
