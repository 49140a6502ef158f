use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tasks::{hash_collection, hash_value, Checksum, Task, TaskId, VectorClock, WireTask};
use tracing::warn;

use crate::records::{
    meta, CompactionSummary, ConfirmedState, EventType, LedgerEvent, MetaEntry, OperationType,
    ProvisionalState, ProvisionalTask, QueuedOperation, Space, SyncStatus,
};
use crate::schema::apply_migrations;
use crate::{Result, StoreError};

/// Synchronous SQLite handle. Everything above it goes through `StoreTx`.
pub(crate) struct LocalDb {
    conn: Connection,
}

impl LocalDb {
    pub fn open_or_create(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", &"WAL")?;
        conn.pragma_update(None, "synchronous", &"NORMAL")?;
        conn.pragma_update(None, "foreign_keys", &"ON")?;
        apply_migrations(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_migrations(&conn)?;
        Ok(Self { conn })
    }

    pub fn transaction(&mut self) -> Result<StoreTx<'_>> {
        Ok(StoreTx {
            tx: self.conn.transaction()?,
        })
    }
}

/// A confirmed row together with its sync state
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmedTask {
    pub task: Task,
    /// The JSON as stored, which is what digests are computed over
    pub payload: Value,
    pub state: ConfirmedState,
}

/// An open transaction over all record spaces.
///
/// Writes become durable only on [`StoreTx::commit`]; dropping the handle
/// rolls everything back.
pub struct StoreTx<'conn> {
    tx: Transaction<'conn>,
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(space: Space, millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| StoreError::Corrupt {
        space,
        detail: format!("timestamp out of range: {millis}"),
    })
}

fn corrupt(space: Space, detail: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        space,
        detail: detail.into(),
    }
}

/// Parses a stored task row. Malformed rows are logged and skipped so that
/// one bad payload cannot take down a full read.
fn parse_task_row(space: Space, key: &str, json: &str) -> Option<WireTask> {
    let value: Value = match serde_json::from_str(json) {
        Ok(value) => value,
        Err(e) => {
            warn!(%space, entity_id = key, error = %e, "skipping unreadable task row");
            return None;
        }
    };
    match WireTask::parse(value) {
        Ok(wire) => Some(wire),
        Err(e) => {
            warn!(%space, entity_id = key, error = %e, "skipping malformed task row");
            None
        }
    }
}

struct ProvisionalRow {
    id: String,
    json: String,
    state: String,
    retry_count: i64,
    last_error: Option<String>,
}

impl ProvisionalRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            json: row.get(1)?,
            state: row.get(2)?,
            retry_count: row.get(3)?,
            last_error: row.get(4)?,
        })
    }

    fn into_record(self) -> Option<ProvisionalTask> {
        let task = parse_task_row(Space::Provisional, &self.id, &self.json)?.task;
        let Some(state) = ProvisionalState::parse(&self.state) else {
            warn!(entity_id = %self.id, state = %self.state, "skipping provisional row with unknown state");
            return None;
        };
        Some(ProvisionalTask {
            task,
            state,
            retry_count: self.retry_count.max(0) as u32,
            last_error: self.last_error,
        })
    }
}

struct LedgerRow {
    seq: i64,
    event_type: String,
    entity_id: String,
    timestamp: i64,
    vector_clock: String,
    sync_status: String,
}

impl LedgerRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            event_type: row.get(1)?,
            entity_id: row.get(2)?,
            timestamp: row.get(3)?,
            vector_clock: row.get(4)?,
            sync_status: row.get(5)?,
        })
    }

    fn into_record(self) -> Result<LedgerEvent> {
        Ok(LedgerEvent {
            seq: Some(self.seq),
            event_type: EventType::parse(&self.event_type)
                .ok_or_else(|| corrupt(Space::Ledger, format!("event type {}", self.event_type)))?,
            entity_id: self.entity_id,
            timestamp: from_millis(Space::Ledger, self.timestamp)?,
            vector_clock: serde_json::from_str(&self.vector_clock)?,
            sync_status: SyncStatus::parse(&self.sync_status)
                .ok_or_else(|| corrupt(Space::Ledger, format!("status {}", self.sync_status)))?,
        })
    }
}

const LEDGER_COLUMNS: &str = "seq, event_type, entity_id, timestamp, vector_clock, sync_status";

struct OperationRow {
    id: i64,
    op_type: String,
    entity_id: String,
    payload: String,
    timestamp: i64,
    vector_clock: String,
    priority: i32,
    failed: bool,
    retry_count: i64,
    last_error: Option<String>,
    rollback_snapshot: Option<String>,
    ledger_seq: Option<i64>,
}

impl OperationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            op_type: row.get(1)?,
            entity_id: row.get(2)?,
            payload: row.get(3)?,
            timestamp: row.get(4)?,
            vector_clock: row.get(5)?,
            priority: row.get(6)?,
            failed: row.get(7)?,
            retry_count: row.get(8)?,
            last_error: row.get(9)?,
            rollback_snapshot: row.get(10)?,
            ledger_seq: row.get(11)?,
        })
    }

    fn into_record(self) -> Result<QueuedOperation> {
        let rollback_snapshot = match self.rollback_snapshot {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        };
        Ok(QueuedOperation {
            id: Some(self.id),
            op_type: OperationType::parse(&self.op_type)
                .ok_or_else(|| corrupt(Space::Queue, format!("op type {}", self.op_type)))?,
            entity_id: TaskId::parse(&self.entity_id)?,
            payload: serde_json::from_str(&self.payload)?,
            timestamp: from_millis(Space::Queue, self.timestamp)?,
            vector_clock: serde_json::from_str(&self.vector_clock)?,
            priority: self.priority,
            failed: self.failed,
            retry_count: self.retry_count.max(0) as u32,
            last_error: self.last_error,
            rollback_snapshot,
            ledger_seq: self.ledger_seq,
        })
    }
}

const OPERATION_COLUMNS: &str = "id, op_type, entity_id, payload, timestamp, vector_clock, \
     priority, failed, retry_count, last_error, rollback_snapshot, ledger_seq";

struct SummaryRow {
    id: i64,
    date: String,
    count: i64,
    range_start: i64,
    range_end: i64,
    type_counts: String,
}

impl SummaryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            date: row.get(1)?,
            count: row.get(2)?,
            range_start: row.get(3)?,
            range_end: row.get(4)?,
            type_counts: row.get(5)?,
        })
    }

    fn into_record(self) -> Result<CompactionSummary> {
        let date = NaiveDate::parse_from_str(&self.date, "%Y-%m-%d")
            .map_err(|e| corrupt(Space::Archive, format!("date {}: {e}", self.date)))?;
        let type_counts: BTreeMap<String, u64> = serde_json::from_str(&self.type_counts)?;
        Ok(CompactionSummary {
            id: Some(self.id),
            date,
            archived_event_count: self.count.max(0) as u64,
            range_start: from_millis(Space::Archive, self.range_start)?,
            range_end: from_millis(Space::Archive, self.range_end)?,
            type_counts,
        })
    }
}

const SUMMARY_COLUMNS: &str =
    "id, date, archived_event_count, range_start, range_end, type_counts";

impl StoreTx<'_> {
    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }

    pub fn count(&self, space: Space) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", space.table());
        Ok(self.tx.query_row(&sql, [], |row| row.get(0))?)
    }

    // ── tasks ──────────────────────────────────────────────────────────

    /// Writes a task to the space its id routes to, together with its
    /// checksum, inside this transaction. Existing sync state is kept.
    pub fn write_task(&self, task: &Task) -> Result<Checksum> {
        self.write_payload(task, &task.to_value())
    }

    /// Like [`write_task`](Self::write_task), storing the payload exactly as
    /// the remote authority sent it.
    pub fn write_wire(&self, wire: &WireTask) -> Result<Checksum> {
        self.write_payload(&wire.task, &wire.payload)
    }

    fn write_payload(&self, task: &Task, payload: &Value) -> Result<Checksum> {
        task.validate()?;
        let json = serde_json::to_string(payload)?;
        let now = to_millis(Utc::now());
        match &task.id {
            TaskId::Confirmed(id) => {
                self.tx.execute(
                    "INSERT INTO confirmed_tasks(id, json, sync_state, updated_at) VALUES(?1, ?2, 'complete', ?3)
                     ON CONFLICT(id) DO UPDATE SET json = excluded.json, updated_at = excluded.updated_at",
                    params![id, json, now],
                )?;
            }
            TaskId::Provisional(id) => {
                self.tx.execute(
                    "INSERT INTO provisional_tasks(id, json, sync_state, created_at, updated_at) VALUES(?1, ?2, 'pending', ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET json = excluded.json, updated_at = excluded.updated_at",
                    params![id, json, task.created_at.map(to_millis), now],
                )?;
            }
        }
        let checksum = hash_value(payload);
        self.put_meta(&meta::checksum_key(&task.id), &Value::from(checksum.as_str()))?;
        Ok(checksum)
    }

    pub fn confirmed_task(&self, id: i64) -> Result<Option<ConfirmedTask>> {
        let row: Option<(String, String)> = self
            .tx
            .query_row(
                "SELECT json, sync_state FROM confirmed_tasks WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row.and_then(|(json, state)| {
            let wire = parse_task_row(Space::Confirmed, &id.to_string(), &json)?;
            Some(ConfirmedTask {
                task: wire.task,
                payload: wire.payload,
                state: ConfirmedState::parse(&state).unwrap_or(ConfirmedState::Complete),
            })
        }))
    }

    pub fn confirmed_tasks(&self) -> Result<Vec<ConfirmedTask>> {
        let mut stmt = self
            .tx
            .prepare("SELECT id, json, sync_state FROM confirmed_tasks ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for r in rows {
            let (id, json, state) = r?;
            if let Some(wire) = parse_task_row(Space::Confirmed, &id.to_string(), &json) {
                out.push(ConfirmedTask {
                    task: wire.task,
                    payload: wire.payload,
                    state: ConfirmedState::parse(&state).unwrap_or(ConfirmedState::Complete),
                });
            }
        }
        Ok(out)
    }

    /// Aggregate digest of every readable confirmed row, computed over the
    /// stored payloads.
    pub fn confirmed_checksum(&self) -> Result<Checksum> {
        let payloads: Vec<Value> = self
            .confirmed_tasks()?
            .into_iter()
            .map(|row| row.payload)
            .collect();
        Ok(hash_collection(&payloads))
    }

    pub fn set_confirmed_state(&self, id: i64, state: ConfirmedState) -> Result<bool> {
        let changed = self.tx.execute(
            "UPDATE confirmed_tasks SET sync_state = ?2 WHERE id = ?1",
            params![id, state.as_str()],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_confirmed(&self, id: i64) -> Result<bool> {
        let removed = self
            .tx
            .execute("DELETE FROM confirmed_tasks WHERE id = ?1", params![id])?;
        self.delete_meta(&meta::checksum_key(&TaskId::Confirmed(id)))?;
        Ok(removed > 0)
    }

    pub fn provisional_task(&self, id: &str) -> Result<Option<ProvisionalTask>> {
        let row = self
            .tx
            .query_row(
                "SELECT id, json, sync_state, retry_count, last_error FROM provisional_tasks WHERE id = ?1",
                params![id],
                ProvisionalRow::from_row,
            )
            .optional()?;
        Ok(row.and_then(ProvisionalRow::into_record))
    }

    pub fn provisional_tasks(&self) -> Result<Vec<ProvisionalTask>> {
        let mut stmt = self.tx.prepare(
            "SELECT id, json, sync_state, retry_count, last_error FROM provisional_tasks ORDER BY id",
        )?;
        let rows = stmt.query_map([], ProvisionalRow::from_row)?;
        let mut out = Vec::new();
        for r in rows {
            if let Some(record) = r?.into_record() {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Full upsert of a provisional row, sync state included.
    pub fn put_provisional(&self, record: &ProvisionalTask) -> Result<Checksum> {
        let Some(id) = record.task.id.as_provisional() else {
            return Err(StoreError::SpaceMismatch {
                space: Space::Provisional,
                record: Space::Confirmed,
            });
        };
        let checksum = self.write_task(&record.task)?;
        self.tx.execute(
            "UPDATE provisional_tasks SET sync_state = ?2, retry_count = ?3, last_error = ?4 WHERE id = ?1",
            params![
                id,
                record.state.as_str(),
                record.retry_count as i64,
                record.last_error
            ],
        )?;
        Ok(checksum)
    }

    pub fn delete_provisional(&self, id: &str) -> Result<bool> {
        let removed = self
            .tx
            .execute("DELETE FROM provisional_tasks WHERE id = ?1", params![id])?;
        self.delete_meta(&meta::checksum_key(&TaskId::Provisional(id.to_string())))?;
        Ok(removed > 0)
    }

    /// Deletes the row only if its stored state is exactly `state`.
    pub fn delete_provisional_if(&self, id: &str, state: ProvisionalState) -> Result<bool> {
        let removed = self.tx.execute(
            "DELETE FROM provisional_tasks WHERE id = ?1 AND sync_state = ?2",
            params![id, state.as_str()],
        )?;
        if removed > 0 {
            self.delete_meta(&meta::checksum_key(&TaskId::Provisional(id.to_string())))?;
        }
        Ok(removed > 0)
    }

    // ── ledger ─────────────────────────────────────────────────────────

    pub fn append_event(&self, event: &LedgerEvent) -> Result<i64> {
        self.tx.execute(
            "INSERT INTO ledger_events(event_type, entity_id, timestamp, vector_clock, sync_status)
             VALUES(?1, ?2, ?3, ?4, ?5)",
            params![
                event.event_type.as_str(),
                event.entity_id,
                to_millis(event.timestamp),
                serde_json::to_string(&event.vector_clock)?,
                event.sync_status.as_str()
            ],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    /// Appends a new event, or advances the status of an existing one.
    /// Every other field of an existing event is immutable.
    pub fn put_event(&self, event: &LedgerEvent) -> Result<i64> {
        let Some(seq) = event.seq else {
            return self.append_event(event);
        };
        let Some(existing) = self.ledger_event(seq)? else {
            self.tx.execute(
                "INSERT INTO ledger_events(seq, event_type, entity_id, timestamp, vector_clock, sync_status)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    seq,
                    event.event_type.as_str(),
                    event.entity_id,
                    to_millis(event.timestamp),
                    serde_json::to_string(&event.vector_clock)?,
                    event.sync_status.as_str()
                ],
            )?;
            return Ok(seq);
        };
        let same_body = existing.event_type == event.event_type
            && existing.entity_id == event.entity_id
            && existing.timestamp.timestamp_millis() == event.timestamp.timestamp_millis()
            && existing.vector_clock == event.vector_clock;
        let reverts =
            existing.sync_status == SyncStatus::Synced && event.sync_status == SyncStatus::Pending;
        if !same_body || reverts {
            return Err(StoreError::LedgerImmutable(seq));
        }
        if event.sync_status == SyncStatus::Synced {
            self.mark_event_synced(seq)?;
        }
        Ok(seq)
    }

    pub fn mark_event_synced(&self, seq: i64) -> Result<bool> {
        let changed = self.tx.execute(
            "UPDATE ledger_events SET sync_status = 'synced' WHERE seq = ?1 AND sync_status = 'pending'",
            params![seq],
        )?;
        Ok(changed > 0)
    }

    pub fn ledger_event(&self, seq: i64) -> Result<Option<LedgerEvent>> {
        let sql = format!("SELECT {LEDGER_COLUMNS} FROM ledger_events WHERE seq = ?1");
        let row = self
            .tx
            .query_row(&sql, params![seq], LedgerRow::from_row)
            .optional()?;
        row.map(LedgerRow::into_record).transpose()
    }

    pub fn ledger_events(&self) -> Result<Vec<LedgerEvent>> {
        let sql = format!("SELECT {LEDGER_COLUMNS} FROM ledger_events ORDER BY seq");
        self.collect_events(&sql, params![])
    }

    /// Synced events strictly older than `cutoff`. Pending events are never
    /// returned.
    pub fn synced_events_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<LedgerEvent>> {
        let sql = format!(
            "SELECT {LEDGER_COLUMNS} FROM ledger_events
             WHERE sync_status = 'synced' AND timestamp < ?1 ORDER BY seq"
        );
        self.collect_events(&sql, params![to_millis(cutoff)])
    }

    fn collect_events(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<LedgerEvent>> {
        let mut stmt = self.tx.prepare(sql)?;
        let rows = stmt.query_map(args, LedgerRow::from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?.into_record()?);
        }
        Ok(out)
    }

    pub fn delete_event(&self, seq: i64) -> Result<bool> {
        let removed = self
            .tx
            .execute("DELETE FROM ledger_events WHERE seq = ?1", params![seq])?;
        Ok(removed > 0)
    }

    // ── offline queue ──────────────────────────────────────────────────

    /// Inserts or replaces an operation. Returns its id.
    pub fn put_operation(&self, op: &QueuedOperation) -> Result<i64> {
        let rollback = match &op.rollback_snapshot {
            Some(task) => Some(serde_json::to_string(task)?),
            None => None,
        };
        self.tx.execute(
            "INSERT INTO offline_queue(id, op_type, entity_id, payload, timestamp, vector_clock, priority,
                                       failed, retry_count, last_error, rollback_snapshot, ledger_seq)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                op_type = excluded.op_type, entity_id = excluded.entity_id, payload = excluded.payload,
                timestamp = excluded.timestamp, vector_clock = excluded.vector_clock,
                priority = excluded.priority, failed = excluded.failed,
                retry_count = excluded.retry_count, last_error = excluded.last_error,
                rollback_snapshot = excluded.rollback_snapshot, ledger_seq = excluded.ledger_seq",
            params![
                op.id,
                op.op_type.as_str(),
                op.entity_id.key(),
                serde_json::to_string(&op.payload)?,
                to_millis(op.timestamp),
                serde_json::to_string(&op.vector_clock)?,
                op.priority,
                op.failed,
                op.retry_count as i64,
                op.last_error,
                rollback,
                op.ledger_seq
            ],
        )?;
        Ok(op.id.unwrap_or_else(|| self.tx.last_insert_rowid()))
    }

    pub fn queued_operation(&self, id: i64) -> Result<Option<QueuedOperation>> {
        let sql = format!("SELECT {OPERATION_COLUMNS} FROM offline_queue WHERE id = ?1");
        let row = self
            .tx
            .query_row(&sql, params![id], OperationRow::from_row)
            .optional()?;
        row.map(OperationRow::into_record).transpose()
    }

    /// All queued operations in insertion order.
    pub fn queued_operations(&self) -> Result<Vec<QueuedOperation>> {
        let sql = format!("SELECT {OPERATION_COLUMNS} FROM offline_queue ORDER BY id");
        let mut stmt = self.tx.prepare(&sql)?;
        let rows = stmt.query_map([], OperationRow::from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?.into_record()?);
        }
        Ok(out)
    }

    pub fn delete_operation(&self, id: i64) -> Result<bool> {
        let removed = self
            .tx
            .execute("DELETE FROM offline_queue WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    /// Points every queued operation for `from` at `to`, including an `id`
    /// field inside the payload. Returns the number of operations changed.
    pub fn retarget_operations(&self, from: &TaskId, to: &TaskId) -> Result<usize> {
        let mut changed = 0;
        for mut op in self.queued_operations()? {
            if &op.entity_id != from {
                continue;
            }
            op.entity_id = to.clone();
            if let Value::Object(fields) = &mut op.payload {
                if fields.contains_key("id") {
                    fields.insert("id".to_string(), to.to_value());
                }
            }
            self.put_operation(&op)?;
            changed += 1;
        }
        Ok(changed)
    }

    // ── compaction archive ─────────────────────────────────────────────

    pub fn insert_summary(&self, summary: &CompactionSummary) -> Result<i64> {
        if let Some(id) = summary.id {
            if self.summary(id)?.is_some() {
                return Err(StoreError::ArchiveImmutable(id));
            }
        }
        self.tx.execute(
            "INSERT INTO compaction_archive(id, date, archived_event_count, range_start, range_end, type_counts, created_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                summary.id,
                summary.date.format("%Y-%m-%d").to_string(),
                summary.archived_event_count as i64,
                to_millis(summary.range_start),
                to_millis(summary.range_end),
                serde_json::to_string(&summary.type_counts)?,
                to_millis(Utc::now())
            ],
        )?;
        Ok(summary.id.unwrap_or_else(|| self.tx.last_insert_rowid()))
    }

    pub fn summary(&self, id: i64) -> Result<Option<CompactionSummary>> {
        let sql = format!("SELECT {SUMMARY_COLUMNS} FROM compaction_archive WHERE id = ?1");
        let row = self
            .tx
            .query_row(&sql, params![id], SummaryRow::from_row)
            .optional()?;
        row.map(SummaryRow::into_record).transpose()
    }

    pub fn summaries(&self) -> Result<Vec<CompactionSummary>> {
        let sql = format!("SELECT {SUMMARY_COLUMNS} FROM compaction_archive ORDER BY id");
        let mut stmt = self.tx.prepare(&sql)?;
        let rows = stmt.query_map([], SummaryRow::from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?.into_record()?);
        }
        Ok(out)
    }

    pub fn delete_summary(&self, id: i64) -> Result<bool> {
        let removed = self
            .tx
            .execute("DELETE FROM compaction_archive WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    // ── metadata ───────────────────────────────────────────────────────

    pub fn meta(&self, key: &str) -> Result<Option<Value>> {
        let raw: Option<String> = self
            .tx
            .query_row(
                "SELECT value FROM metadata WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
    }

    /// Last writer wins.
    pub fn put_meta(&self, key: &str, value: &Value) -> Result<()> {
        self.tx.execute(
            "INSERT INTO metadata(key, value, updated_at) VALUES(?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, serde_json::to_string(value)?, to_millis(Utc::now())],
        )?;
        Ok(())
    }

    pub fn delete_meta(&self, key: &str) -> Result<bool> {
        let removed = self
            .tx
            .execute("DELETE FROM metadata WHERE key = ?1", params![key])?;
        Ok(removed > 0)
    }

    pub fn meta_entries(&self) -> Result<Vec<MetaEntry>> {
        let mut stmt = self
            .tx
            .prepare("SELECT key, value FROM metadata ORDER BY key")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for r in rows {
            let (key, raw) = r?;
            out.push(MetaEntry {
                key,
                value: serde_json::from_str(&raw)?,
            });
        }
        Ok(out)
    }

    /// The persisted local vector clock, empty before the first enqueue.
    pub fn local_clock(&self) -> Result<VectorClock> {
        match self.meta(meta::LOCAL_CLOCK)? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(VectorClock::new()),
        }
    }

    pub fn put_local_clock(&self, clock: &VectorClock) -> Result<()> {
        self.put_meta(meta::LOCAL_CLOCK, &serde_json::to_value(clock)?)
    }

    pub fn pending_event_count(&self) -> Result<i64> {
        Ok(self.tx.query_row(
            "SELECT COUNT(*) FROM ledger_events WHERE sync_status = 'pending'",
            [],
            |row| row.get(0),
        )?)
    }

    pub fn failed_operation_count(&self) -> Result<i64> {
        Ok(self.tx.query_row(
            "SELECT COUNT(*) FROM offline_queue WHERE failed = 1",
            [],
            |row| row.get(0),
        )?)
    }

    #[cfg(test)]
    pub(crate) fn raw_execute(&self, sql: &str) -> Result<usize> {
        Ok(self.tx.execute(sql, [])?)
    }

    /// Removes every row from every space, keeping the schema.
    pub fn clear_all(&self) -> Result<()> {
        for space in Space::ALL {
            self.tx
                .execute(&format!("DELETE FROM {}", space.table()), [])?;
        }
        Ok(())
    }
}
