use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tasks::{NodeId, Task, TaskId, WireTask};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::db::{LocalDb, StoreTx};
use crate::records::{
    meta, ConfirmedState, MetaEntry, ProvisionalState, Record, RecordKey, Space, SyncMarker,
    TaskView, ViewState,
};
use crate::{Result, StoreError};

enum Location {
    File(PathBuf),
    Memory,
}

/// Row counts per record space
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub confirmed: i64,
    pub provisional: i64,
    pub ledger: i64,
    pub pending_events: i64,
    pub queue: i64,
    pub failed_operations: i64,
    pub archive: i64,
    pub metadata: i64,
}

/// The explicitly constructed local store shared by every sync component.
///
/// Opening is lazy: the first call to [`PersistentStore::init`] (or any
/// operation) opens and migrates the database. Concurrent first callers
/// await the same initialization.
pub struct PersistentStore {
    location: Location,
    db: OnceCell<Mutex<LocalDb>>,
    opens: AtomicUsize,
}

impl PersistentStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            location: Location::File(path.into()),
            db: OnceCell::new(),
            opens: AtomicUsize::new(0),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            location: Location::Memory,
            db: OnceCell::new(),
            opens: AtomicUsize::new(0),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.location {
            Location::File(path) => Some(path),
            Location::Memory => None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.db.initialized()
    }

    /// Number of times the underlying database has been opened. Stays at
    /// one no matter how many callers race on `init`.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub async fn init(&self) -> Result<()> {
        self.db().await.map(|_| ())
    }

    async fn db(&self) -> Result<&Mutex<LocalDb>> {
        self.db
            .get_or_try_init(|| async {
                self.opens.fetch_add(1, Ordering::SeqCst);
                let db = match &self.location {
                    Location::File(path) => {
                        let target = path.clone();
                        let db = tokio::task::spawn_blocking(move || LocalDb::open_or_create(&target))
                            .await
                            .map_err(|e| StoreError::Init(e.to_string()))??;
                        info!(path = %path.display(), "store opened");
                        db
                    }
                    Location::Memory => {
                        let db = LocalDb::open_in_memory()?;
                        debug!("in-memory store opened");
                        db
                    }
                };
                Ok::<_, StoreError>(Mutex::new(db))
            })
            .await
    }

    /// Runs `f` inside one transaction. Commits when `f` returns `Ok`,
    /// rolls back otherwise. The connection lock is released before this
    /// future completes, so it is never held across an await point.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&StoreTx<'_>) -> Result<T>,
    {
        let db = self.db().await?;
        let mut conn = db.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    // ── generic CRUD ───────────────────────────────────────────────────

    pub async fn get_all(&self, space: Space) -> Result<Vec<Record>> {
        self.transaction(|tx| read_all(tx, space)).await
    }

    pub async fn get(&self, space: Space, key: impl Into<RecordKey>) -> Result<Option<Record>> {
        let key = key.into();
        self.transaction(|tx| read_one(tx, space, &key)).await
    }

    /// Upserts `record` by primary key and returns the key it was stored
    /// under.
    pub async fn put(&self, space: Space, record: Record) -> Result<RecordKey> {
        if record.space() != space {
            return Err(StoreError::SpaceMismatch {
                space,
                record: record.space(),
            });
        }
        self.transaction(|tx| write_record(tx, &record)).await
    }

    pub async fn delete(&self, space: Space, key: impl Into<RecordKey>) -> Result<bool> {
        let key = key.into();
        self.transaction(|tx| delete_record(tx, space, &key)).await
    }

    // ── entities ───────────────────────────────────────────────────────

    /// Union of confirmed and provisional tasks, each tagged with its sync
    /// marker. Soft-deleted tasks and malformed rows are left out.
    pub async fn get_all_entities(&self) -> Result<Vec<TaskView>> {
        let (mut confirmed, provisional) =
            tokio::try_join!(self.confirmed_views(), self.provisional_views())?;
        confirmed.extend(provisional);
        Ok(confirmed)
    }

    async fn confirmed_views(&self) -> Result<Vec<TaskView>> {
        let rows = self.transaction(|tx| tx.confirmed_tasks()).await?;
        Ok(rows
            .into_iter()
            .filter(|row| !row.task.is_deleted())
            .map(|row| TaskView {
                sync: match row.state {
                    ConfirmedState::Complete => None,
                    ConfirmedState::Pending => Some(SyncMarker::Pending),
                },
                task: row.task,
            })
            .collect())
    }

    async fn provisional_views(&self) -> Result<Vec<TaskView>> {
        let mut rows = self.transaction(|tx| tx.provisional_tasks()).await?;
        rows.sort_by(|a, b| {
            a.task
                .created_at
                .cmp(&b.task.created_at)
                .then_with(|| a.task.id.cmp(&b.task.id))
        });
        Ok(rows
            .into_iter()
            .filter(|row| !row.task.is_deleted())
            .map(|row| TaskView {
                sync: Some(match row.state {
                    ProvisionalState::Pending => SyncMarker::Pending,
                    ProvisionalState::Failed => SyncMarker::Failed,
                    ProvisionalState::Confirmed => SyncMarker::ConfirmedAwaitingCleanup,
                }),
                task: row.task,
            })
            .collect())
    }

    /// Validates, stamps `updated_at`, and writes the task together with its
    /// checksum. Returns the task as stored.
    pub async fn save_entity(&self, mut task: Task) -> Result<Task> {
        if let Err(e) = task.validate() {
            warn!(entity_id = %task.id, error = %e, "rejected entity write");
            return Err(e.into());
        }
        task.touch(Utc::now());
        self.transaction(|tx| tx.write_task(&task)).await?;
        Ok(task)
    }

    /// Like [`save_entity`](Self::save_entity) for an untyped payload.
    pub async fn save_entity_value(&self, value: Value) -> Result<Task> {
        let task = Task::from_remote(value).map_err(|e| {
            warn!(error = %e, "rejected malformed entity");
            StoreError::from(e)
        })?;
        self.save_entity(task).await
    }

    /// Saves every valid item of `batch` in one transaction, stamping
    /// `updated_at`. Invalid items are dropped with a warning. Returns the
    /// number of tasks written.
    pub async fn save_entities(&self, batch: Vec<Value>) -> Result<usize> {
        let now = Utc::now();
        let valid = accept_valid(batch)
            .into_iter()
            .map(|wire| {
                let mut task = wire.task;
                task.touch(now);
                WireTask::local(task)
            })
            .collect();
        self.write_batch(valid).await
    }

    /// Stores tasks received from the remote authority as-is, payload
    /// included. Same partial-rejection policy as
    /// [`save_entities`](Self::save_entities), but remote timestamps are kept.
    pub async fn ingest_remote(&self, batch: Vec<Value>) -> Result<usize> {
        let valid = accept_valid(batch);
        self.write_batch(valid).await
    }

    async fn write_batch(&self, tasks: Vec<WireTask>) -> Result<usize> {
        if tasks.is_empty() {
            return Ok(0);
        }
        self.transaction(|tx| {
            for wire in &tasks {
                tx.write_wire(wire)?;
            }
            Ok(tasks.len())
        })
        .await
    }

    /// Physically removes a soft-deleted confirmed task once its delete has
    /// been acknowledged. Live tasks are left alone.
    pub async fn purge_deleted(&self, id: i64) -> Result<bool> {
        self.transaction(|tx| match tx.confirmed_task(id)? {
            Some(row) if row.task.is_deleted() => {
                let removed = tx.delete_confirmed(id)?;
                info!(entity_id = id, "purged acknowledged delete");
                Ok(removed)
            }
            _ => Ok(false),
        })
        .await
    }

    // ── metadata ───────────────────────────────────────────────────────

    /// The per-installation node id, created on first use.
    pub async fn node_id(&self) -> Result<NodeId> {
        self.transaction(|tx| {
            if let Some(Value::String(id)) = tx.meta(meta::NODE_ID)? {
                return Ok(NodeId(id));
            }
            let id = NodeId::new();
            tx.put_meta(meta::NODE_ID, &Value::from(id.as_str()))?;
            info!(node_id = %id, "generated node id");
            Ok(id)
        })
        .await
    }

    pub async fn meta(&self, key: &str) -> Result<Option<Value>> {
        self.transaction(|tx| tx.meta(key)).await
    }

    pub async fn set_meta(&self, key: &str, value: Value) -> Result<()> {
        self.transaction(|tx| tx.put_meta(key, &value)).await
    }

    pub async fn view_state(&self) -> Result<ViewState> {
        match self.meta(meta::VIEW_STATE).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(ViewState::default()),
        }
    }

    pub async fn save_view_state(&self, state: &ViewState) -> Result<()> {
        let value = serde_json::to_value(state)?;
        self.set_meta(meta::VIEW_STATE, value).await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.transaction(|tx| {
            Ok(StoreStats {
                confirmed: tx.count(Space::Confirmed)?,
                provisional: tx.count(Space::Provisional)?,
                ledger: tx.count(Space::Ledger)?,
                pending_events: tx.pending_event_count()?,
                queue: tx.count(Space::Queue)?,
                failed_operations: tx.failed_operation_count()?,
                archive: tx.count(Space::Archive)?,
                metadata: tx.count(Space::Metadata)?,
            })
        })
        .await
    }

    /// Wipes every space. Used on logout or reset.
    pub async fn clear_all(&self) -> Result<()> {
        self.transaction(|tx| tx.clear_all()).await?;
        info!("store cleared");
        Ok(())
    }
}

fn accept_valid(batch: Vec<Value>) -> Vec<WireTask> {
    let total = batch.len();
    let valid: Vec<WireTask> = batch
        .into_iter()
        .filter_map(|value| {
            let id = value.get("id").cloned();
            match WireTask::parse(value) {
                Ok(wire) => Some(wire),
                Err(e) => {
                    warn!(entity_id = ?id, error = %e, "dropping invalid batch item");
                    None
                }
            }
        })
        .collect();
    if valid.len() < total {
        warn!(dropped = total - valid.len(), kept = valid.len(), "batch partially rejected");
    }
    valid
}

fn int_key(space: Space, key: &RecordKey) -> Result<i64> {
    match key {
        RecordKey::Int(v) => Ok(*v),
        RecordKey::Text(raw) => raw.parse().map_err(|_| StoreError::KeyMismatch {
            space,
            key: key.clone(),
        }),
    }
}

fn text_key(space: Space, key: &RecordKey) -> Result<&str> {
    match key {
        RecordKey::Text(v) => Ok(v),
        RecordKey::Int(_) => Err(StoreError::KeyMismatch {
            space,
            key: key.clone(),
        }),
    }
}

fn read_all(tx: &StoreTx<'_>, space: Space) -> Result<Vec<Record>> {
    Ok(match space {
        Space::Confirmed => tx
            .confirmed_tasks()?
            .into_iter()
            .map(|row| Record::Confirmed(row.task))
            .collect(),
        Space::Provisional => tx
            .provisional_tasks()?
            .into_iter()
            .map(Record::Provisional)
            .collect(),
        Space::Ledger => tx.ledger_events()?.into_iter().map(Record::Ledger).collect(),
        Space::Queue => tx
            .queued_operations()?
            .into_iter()
            .map(Record::Queue)
            .collect(),
        Space::Archive => tx.summaries()?.into_iter().map(Record::Archive).collect(),
        Space::Metadata => tx
            .meta_entries()?
            .into_iter()
            .map(Record::Metadata)
            .collect(),
    })
}

fn read_one(tx: &StoreTx<'_>, space: Space, key: &RecordKey) -> Result<Option<Record>> {
    Ok(match space {
        Space::Confirmed => tx
            .confirmed_task(int_key(space, key)?)?
            .map(|row| Record::Confirmed(row.task)),
        Space::Provisional => tx
            .provisional_task(text_key(space, key)?)?
            .map(Record::Provisional),
        Space::Ledger => tx.ledger_event(int_key(space, key)?)?.map(Record::Ledger),
        Space::Queue => tx.queued_operation(int_key(space, key)?)?.map(Record::Queue),
        Space::Archive => tx.summary(int_key(space, key)?)?.map(Record::Archive),
        Space::Metadata => {
            let key = text_key(space, key)?;
            tx.meta(key)?.map(|value| {
                Record::Metadata(MetaEntry {
                    key: key.to_string(),
                    value,
                })
            })
        }
    })
}

fn write_record(tx: &StoreTx<'_>, record: &Record) -> Result<RecordKey> {
    match record {
        Record::Confirmed(task) => {
            let TaskId::Confirmed(id) = task.id else {
                return Err(StoreError::SpaceMismatch {
                    space: Space::Confirmed,
                    record: Space::Provisional,
                });
            };
            tx.write_task(task)?;
            Ok(RecordKey::Int(id))
        }
        Record::Provisional(row) => {
            tx.put_provisional(row)?;
            Ok(RecordKey::from(&row.task.id))
        }
        Record::Ledger(event) => Ok(RecordKey::Int(tx.put_event(event)?)),
        Record::Queue(op) => Ok(RecordKey::Int(tx.put_operation(op)?)),
        Record::Archive(summary) => Ok(RecordKey::Int(tx.insert_summary(summary)?)),
        Record::Metadata(entry) => {
            tx.put_meta(&entry.key, &entry.value)?;
            Ok(RecordKey::Text(entry.key.clone()))
        }
    }
}

fn delete_record(tx: &StoreTx<'_>, space: Space, key: &RecordKey) -> Result<bool> {
    match space {
        Space::Confirmed => tx.delete_confirmed(int_key(space, key)?),
        Space::Provisional => tx.delete_provisional(text_key(space, key)?),
        Space::Ledger => tx.delete_event(int_key(space, key)?),
        Space::Queue => tx.delete_operation(int_key(space, key)?),
        Space::Archive => tx.delete_summary(int_key(space, key)?),
        Space::Metadata => tx.delete_meta(text_key(space, key)?),
    }
}
