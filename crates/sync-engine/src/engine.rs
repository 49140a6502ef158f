use chrono::Utc;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use store::{
    meta, ConfirmedState, OperationType, PersistentStore, ProvisionalTask, QueuedOperation,
    StoreTx, TaskView,
};
use tasks::{hash_collection, Checksum, NodeId, Task, TaskId, TaskPatch, WireTask};
use tracing::{debug, info, warn};

use crate::{
    enqueue_in, Admission, CompactionScheduler, MaintenanceRunner, OfflineQueue, Presenter,
    ReconciliationEngine, RemoteService, RemoteSnapshot, RenderAdmissionGate, ReplayReport,
    Replayer, Result, Snapshot, SnapshotSource, SyncConfig, SyncError,
};

/// What a refresh from the remote authority found
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshReport {
    /// Local confirmed tasks disagreed with the remote digest
    pub drift: bool,

    /// Remote tasks written locally
    pub ingested: usize,

    /// The authoritative digest, now stored as the last known checksum
    pub checksum: Checksum,

    pub admission: Admission,
}

/// Entry point tying the store, queue, reconciliation, remote service and
/// render gate together for one session.
pub struct SyncEngine {
    store: Arc<PersistentStore>,
    node: NodeId,
    config: SyncConfig,
    queue: OfflineQueue,
    reconciler: ReconciliationEngine,
    compaction: CompactionScheduler,
    remote: Arc<dyn RemoteService>,
    gate: Arc<RenderAdmissionGate>,
}

impl SyncEngine {
    /// Opens the store, loads the node identity and proposes the cached
    /// task list for first paint.
    pub async fn start(
        store: Arc<PersistentStore>,
        remote: Arc<dyn RemoteService>,
        presenter: Arc<dyn Presenter>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        store.init().await?;
        let node = store.node_id().await?;
        let engine = Self {
            queue: OfflineQueue::new(store.clone(), node.clone()),
            reconciler: ReconciliationEngine::new(store.clone()),
            compaction: CompactionScheduler::new(store.clone()),
            gate: Arc::new(RenderAdmissionGate::new(presenter)),
            store,
            node,
            config,
            remote,
        };
        let admission = engine.present(SnapshotSource::LocalCache).await?;
        info!(node_id = %engine.node, ?admission, "sync engine started");
        Ok(engine)
    }

    pub fn store(&self) -> &Arc<PersistentStore> {
        &self.store
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn reconciler(&self) -> &ReconciliationEngine {
        &self.reconciler
    }

    pub fn compaction(&self) -> &CompactionScheduler {
        &self.compaction
    }

    pub fn gate(&self) -> &Arc<RenderAdmissionGate> {
        &self.gate
    }

    pub fn maintenance(&self) -> MaintenanceRunner {
        MaintenanceRunner::new(self.store.clone(), self.config.clone())
    }

    pub async fn tasks(&self) -> Result<Vec<TaskView>> {
        Ok(self.store.get_all_entities().await?)
    }

    /// Creates a task optimistically under a provisional id. The row, its
    /// ledger event and the queued create commit together.
    pub async fn create_task(&self, title: impl Into<String>) -> Result<Task> {
        let task = Task::provisional(title, Utc::now());
        task.validate()?;
        let node = &self.node;
        self.store
            .transaction(|tx| {
                tx.put_provisional(&ProvisionalTask::pending(task.clone()))?;
                let op =
                    QueuedOperation::new(OperationType::Create, task.id.clone(), task.to_value())
                        .with_priority(task.priority.rank());
                enqueue_in(tx, node, op)?;
                Ok(())
            })
            .await?;
        info!(entity_id = %task.id, "task created offline");
        self.repaint(SnapshotSource::Optimistic).await;
        Ok(task)
    }

    /// Applies `patch` locally and queues the update. The previous version
    /// is kept on the operation for rollback.
    pub async fn update_task(&self, id: &TaskId, patch: TaskPatch) -> Result<Task> {
        let node = &self.node;
        let updated = self
            .store
            .transaction(|tx| {
                let Some(before) = live_task(tx, id)? else {
                    return Ok(None);
                };
                let mut after = before.clone();
                after.apply_patch(&patch);
                after.touch(Utc::now());
                after.validate()?;
                tx.write_task(&after)?;
                if let TaskId::Confirmed(cid) = id {
                    tx.set_confirmed_state(*cid, ConfirmedState::Pending)?;
                }
                let op =
                    QueuedOperation::new(OperationType::Update, id.clone(), after.to_value())
                        .with_priority(after.priority.rank())
                        .with_rollback(before);
                enqueue_in(tx, node, op)?;
                Ok(Some(after))
            })
            .await?
            .ok_or_else(|| SyncError::TaskNotFound(id.clone()))?;
        debug!(entity_id = %id, "task updated offline");
        self.repaint(SnapshotSource::Optimistic).await;
        Ok(updated)
    }

    /// Deletes a task. Confirmed tasks are soft-deleted until the remote
    /// service acknowledges; a provisional task the remote never saw is
    /// dropped together with its queued operations.
    pub async fn delete_task(&self, id: &TaskId) -> Result<()> {
        match id {
            TaskId::Provisional(pid) => {
                if !self.reconciler.discard(pid).await? {
                    return Err(SyncError::TaskNotFound(id.clone()));
                }
            }
            TaskId::Confirmed(cid) => {
                let node = &self.node;
                let deleted = self
                    .store
                    .transaction(|tx| {
                        let Some(before) = live_task(tx, id)? else {
                            return Ok(false);
                        };
                        let mut after = before.clone();
                        let now = Utc::now();
                        after.deleted_at = Some(now);
                        after.touch(now);
                        tx.write_task(&after)?;
                        tx.set_confirmed_state(*cid, ConfirmedState::Pending)?;
                        let op = QueuedOperation::new(
                            OperationType::Delete,
                            id.clone(),
                            serde_json::json!({ "id": cid }),
                        )
                        .with_priority(before.priority.rank())
                        .with_rollback(before);
                        enqueue_in(tx, node, op)?;
                        Ok(true)
                    })
                    .await?;
                if !deleted {
                    return Err(SyncError::TaskNotFound(id.clone()));
                }
            }
        }
        debug!(entity_id = %id, "task deleted offline");
        self.repaint(SnapshotSource::Optimistic).await;
        Ok(())
    }

    /// Fetches the authoritative list and compares its digest with the
    /// local confirmed tasks. On drift, remote tasks are written locally,
    /// except those with local edits still waiting to be sent. Nothing is
    /// ever wiped.
    pub async fn refresh(&self) -> Result<RefreshReport> {
        let RemoteSnapshot {
            entities,
            users_map,
            checksum,
        } = self.remote.fetch().await?;
        let remote_empty = entities.is_empty();
        let remote_tasks = parse_remote(entities);
        let remote_checksum = checksum.unwrap_or_else(|| {
            let payloads: Vec<&Value> = remote_tasks.iter().map(|wire| &wire.payload).collect();
            hash_collection(&payloads)
        });

        let local_checksum = self
            .store
            .transaction(|tx| tx.confirmed_checksum())
            .await?;
        let drift = !local_checksum.matches(&remote_checksum);

        let ingested = if drift {
            warn!(
                local = %local_checksum,
                remote = %remote_checksum,
                "checksum drift, re-syncing from remote"
            );
            self.store
                .transaction(|tx| ingest_unblocked(tx, &remote_tasks))
                .await?
        } else {
            0
        };

        let checksum_value = Value::from(remote_checksum.as_str());
        self.store
            .transaction(|tx| {
                tx.put_meta(meta::LAST_CHECKSUM, &checksum_value)?;
                tx.put_meta(meta::USERS_MAP, &Value::Object(users_map))
            })
            .await?;

        let mut admission = self.present(SnapshotSource::RemoteFetch).await?;
        if admission == Admission::Deferred && remote_empty {
            admission = self.gate.flush_deferred().await?.unwrap_or(admission);
        }
        Ok(RefreshReport {
            drift,
            ingested,
            checksum: remote_checksum,
            admission,
        })
    }

    /// Sends everything queued, then refreshes if the remote service
    /// reported a conflict.
    pub async fn replay(&self) -> Result<ReplayReport> {
        let replayer = Replayer::new(
            self.store.clone(),
            self.queue.clone(),
            self.reconciler.clone(),
            self.remote.clone(),
            self.config.clone(),
        );
        let report = replayer.replay().await?;
        if report.needs_refresh {
            self.refresh().await?;
        } else {
            self.repaint(SnapshotSource::LocalCache).await;
        }
        Ok(report)
    }

    /// Re-arms a failed operation for the next replay.
    pub async fn retry_operation(&self, op_id: i64) -> Result<QueuedOperation> {
        let op = self.queue.reset_failed(op_id).await?;
        if let TaskId::Provisional(pid) = &op.entity_id {
            self.reconciler.retry(pid).await?;
        }
        info!(op_id, entity_id = %op.entity_id, "operation re-armed");
        self.repaint(SnapshotSource::Optimistic).await;
        Ok(op)
    }

    /// Abandons a queued operation and rolls its optimistic write back.
    pub async fn discard_operation(&self, op_id: i64) -> Result<QueuedOperation> {
        let op = self.queue.discard(op_id).await?;
        self.repaint(SnapshotSource::Optimistic).await;
        Ok(op)
    }

    async fn present(&self, source: SnapshotSource) -> Result<Admission> {
        let tasks = self.store.get_all_entities().await?;
        self.gate.propose(Snapshot::new(source, tasks)).await
    }

    /// Presents after a local write. The write has already committed, so a
    /// presentation failure is only logged.
    async fn repaint(&self, source: SnapshotSource) {
        if let Err(e) = self.present(source).await {
            warn!(?source, error = %e, "failed to present task list");
        }
    }
}

fn live_task(tx: &StoreTx<'_>, id: &TaskId) -> store::Result<Option<Task>> {
    let task = match id {
        TaskId::Confirmed(cid) => tx.confirmed_task(*cid)?.map(|row| row.task),
        TaskId::Provisional(pid) => tx.provisional_task(pid)?.map(|row| row.task),
    };
    Ok(task.filter(|task| !task.is_deleted()))
}

fn parse_remote(entities: Vec<Value>) -> Vec<WireTask> {
    entities
        .into_iter()
        .filter_map(|value| match WireTask::parse(value) {
            Ok(wire) => Some(wire),
            Err(e) => {
                warn!(error = %e, "dropping invalid remote entity");
                None
            }
        })
        .collect()
}

/// Writes remote tasks that have no local edits waiting to be sent.
fn ingest_unblocked(tx: &StoreTx<'_>, remote: &[WireTask]) -> store::Result<usize> {
    let blocked: HashSet<TaskId> = tx
        .queued_operations()?
        .into_iter()
        .map(|op| op.entity_id)
        .collect();
    let mut written = 0;
    for wire in remote {
        let task = &wire.task;
        if blocked.contains(&task.id) {
            debug!(entity_id = %task.id, "local edits pending, remote copy skipped");
            continue;
        }
        if let TaskId::Confirmed(cid) = task.id {
            if let Some(row) = tx.confirmed_task(cid)? {
                if row.state == ConfirmedState::Pending {
                    continue;
                }
            }
            tx.write_wire(wire)?;
            written += 1;
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RemoteAck, RemoteError, RemoteRequest};
    use parking_lot::Mutex;
    use serde_json::json;
    use store::SyncMarker;
    use tasks::Priority;

    /// Remote that serves a fixed list and acknowledges every send.
    #[derive(Default)]
    struct StaticRemote {
        entities: Mutex<Vec<Value>>,
        checksum: Mutex<Option<Checksum>>,
        sent: Mutex<Vec<RemoteRequest>>,
    }

    #[async_trait::async_trait]
    impl RemoteService for StaticRemote {
        async fn fetch(&self) -> std::result::Result<RemoteSnapshot, RemoteError> {
            Ok(RemoteSnapshot {
                entities: self.entities.lock().clone(),
                checksum: self.checksum.lock().clone(),
                ..Default::default()
            })
        }

        async fn send(
            &self,
            request: RemoteRequest,
        ) -> std::result::Result<RemoteAck, RemoteError> {
            self.sent.lock().push(request.clone());
            Ok(match request {
                RemoteRequest::Create { .. } => RemoteAck::Created {
                    confirmed_id: 100,
                    entity: None,
                },
                RemoteRequest::Update { .. } => RemoteAck::Updated { entity: None },
                RemoteRequest::Delete { .. } => RemoteAck::Deleted,
            })
        }
    }

    struct NullPresenter;

    #[async_trait::async_trait]
    impl Presenter for NullPresenter {
        async fn present(&self, _snapshot: &Snapshot) -> Result<()> {
            Ok(())
        }
    }

    async fn engine(remote: Arc<StaticRemote>) -> SyncEngine {
        SyncEngine::start(
            Arc::new(PersistentStore::in_memory()),
            remote,
            Arc::new(NullPresenter),
            SyncConfig::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_is_optimistic_and_queued() {
        let engine = engine(Arc::default()).await;
        let task = engine.create_task("Buy milk").await.unwrap();
        assert!(task.id.is_provisional());

        let views = engine.tasks().await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].sync, Some(SyncMarker::Pending));

        let ops = engine.queue().dequeue_in_order().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].vector_clock.get(engine.node_id()), 1);
        assert!(engine.gate().is_hydrated());
    }

    #[tokio::test]
    async fn test_empty_title_is_rejected_without_side_effects() {
        let engine = engine(Arc::default()).await;
        assert!(matches!(
            engine.create_task("   ").await,
            Err(SyncError::Validation(_))
        ));
        assert!(engine.queue().is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_update_missing_task_is_not_found() {
        let engine = engine(Arc::default()).await;
        let err = engine
            .update_task(&TaskId::Confirmed(5), TaskPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_provisional_drops_it_locally() {
        let engine = engine(Arc::default()).await;
        let task = engine.create_task("draft").await.unwrap();
        engine.delete_task(&task.id).await.unwrap();
        assert!(engine.tasks().await.unwrap().is_empty());
        assert!(engine.queue().is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_skips_tasks_with_pending_edits() {
        let remote = Arc::new(StaticRemote::default());
        let engine = engine(remote.clone()).await;
        engine
            .store()
            .save_entity(Task::new(TaskId::Confirmed(1), "local"))
            .await
            .unwrap();
        engine
            .update_task(
                &TaskId::Confirmed(1),
                TaskPatch {
                    title: Some("edited offline".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        *remote.entities.lock() = vec![
            json!({"id": 1, "title": "remote title"}),
            json!({"id": 2, "title": "from elsewhere"}),
        ];

        let report = engine.refresh().await.unwrap();
        assert!(report.drift);
        assert_eq!(report.ingested, 1);

        let views = engine.tasks().await.unwrap();
        let one = views.iter().find(|v| v.task.id == TaskId::Confirmed(1)).unwrap();
        assert_eq!(one.task.title, "edited offline");
        assert_eq!(views.len(), 2);
    }

    #[tokio::test]
    async fn test_remote_checksum_settles_after_one_ingest() {
        let remote = Arc::new(StaticRemote::default());
        let raw = vec![json!({"id": 7, "title": "Water plants"})];
        *remote.entities.lock() = raw.clone();
        *remote.checksum.lock() = Some(hash_collection(&raw));
        let engine = engine(remote.clone()).await;

        let first = engine.refresh().await.unwrap();
        assert!(first.drift);
        assert_eq!(first.ingested, 1);

        let second = engine.refresh().await.unwrap();
        assert!(!second.drift);
        assert_eq!(second.ingested, 0);
    }

    #[tokio::test]
    async fn test_raising_priority_keeps_create_ahead_of_update() {
        let remote = Arc::new(StaticRemote::default());
        let engine = engine(remote.clone()).await;
        let task = engine.create_task("Buy milk").await.unwrap();
        engine
            .update_task(
                &task.id,
                TaskPatch {
                    priority: Some(Priority::Urgent),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let report = engine.replay().await.unwrap();
        assert!(report.failed.is_empty());
        assert_eq!(report.acknowledged, 2);

        let sent = remote.sent.lock().clone();
        assert!(matches!(sent[0], RemoteRequest::Create { .. }));
        assert!(matches!(sent[1], RemoteRequest::Update { id: 100, .. }));

        let views = engine.tasks().await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].task.id, TaskId::Confirmed(100));
        assert_eq!(views[0].task.priority, Priority::Urgent);
        assert!(engine.queue().is_empty().await.unwrap());
    }
}
