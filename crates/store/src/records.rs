//! Typed records for each of the six record spaces.
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use tasks::{Task, TaskId, VectorClock};

/// The logical record spaces of the local store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Space {
    /// Tasks whose identity the remote authority has assigned
    Confirmed,
    /// Tasks created locally and awaiting a confirmed id
    Provisional,
    /// Append-only event ledger
    Ledger,
    /// Mutations not yet acknowledged by the remote service
    Queue,
    /// Write-once compaction summaries
    Archive,
    /// Key-value metadata and view state
    Metadata,
}

impl Space {
    pub const ALL: [Space; 6] = [
        Space::Confirmed,
        Space::Provisional,
        Space::Ledger,
        Space::Queue,
        Space::Archive,
        Space::Metadata,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Provisional => "provisional",
            Self::Ledger => "ledger",
            Self::Queue => "queue",
            Self::Archive => "archive",
            Self::Metadata => "metadata",
        }
    }

    pub(crate) fn table(&self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed_tasks",
            Self::Provisional => "provisional_tasks",
            Self::Ledger => "ledger_events",
            Self::Queue => "offline_queue",
            Self::Archive => "compaction_archive",
            Self::Metadata => "metadata",
        }
    }
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primary key of a record in any space
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKey {
    Int(i64),
    Text(String),
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for RecordKey {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for RecordKey {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<&TaskId> for RecordKey {
    fn from(id: &TaskId) -> Self {
        match id {
            TaskId::Confirmed(v) => Self::Int(*v),
            TaskId::Provisional(v) => Self::Text(v.clone()),
        }
    }
}

/// Sync state of a confirmed row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmedState {
    Complete,
    /// Local edits are queued and not yet acknowledged
    Pending,
}

impl ConfirmedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Pending => "pending",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "complete" => Some(Self::Complete),
            "pending" => Some(Self::Pending),
            _ => None,
        }
    }
}

/// Lifecycle of a provisional row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionalState {
    Pending,
    Failed,
    /// The remote has confirmed the create; the row waits for removal
    Confirmed,
}

impl ProvisionalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Failed => "failed",
            Self::Confirmed => "confirmed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "failed" => Some(Self::Failed),
            "confirmed" => Some(Self::Confirmed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionalTask {
    pub task: Task,
    pub state: ProvisionalState,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl ProvisionalTask {
    pub fn pending(task: Task) -> Self {
        Self {
            task,
            state: ProvisionalState::Pending,
            retry_count: 0,
            last_error: None,
        }
    }
}

/// Synchronization marker attached to tasks handed to presentation layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMarker {
    Pending,
    Failed,
    ConfirmedAwaitingCleanup,
}

/// A task together with its sync marker; `None` means fully synced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub task: Task,
    pub sync: Option<SyncMarker>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Updated,
    Deleted,
    Reconciled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Reconciled => "reconciled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "created" => Some(Self::Created),
            "updated" => Some(Self::Updated),
            "deleted" => Some(Self::Deleted),
            "reconciled" => Some(Self::Reconciled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Synced,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "synced" => Some(Self::Synced),
            _ => None,
        }
    }
}

/// Immutable ledger entry. Only `sync_status` may change, and only from
/// `pending` to `synced`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    /// Assigned by the store on append
    pub seq: Option<i64>,
    pub event_type: EventType,
    pub entity_id: String,
    pub timestamp: DateTime<Utc>,
    pub vector_clock: VectorClock,
    pub sync_status: SyncStatus,
}

impl LedgerEvent {
    pub fn pending(
        event_type: EventType,
        entity_id: &TaskId,
        timestamp: DateTime<Utc>,
        vector_clock: VectorClock,
    ) -> Self {
        Self {
            seq: None,
            event_type,
            entity_id: entity_id.key(),
            timestamp,
            vector_clock,
            sync_status: SyncStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// A mutation waiting for acknowledgement from the remote service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// Assigned by the store on enqueue
    pub id: Option<i64>,
    pub op_type: OperationType,
    /// Confirmed or provisional id of the target task
    pub entity_id: TaskId,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub vector_clock: VectorClock,
    pub priority: i32,
    pub failed: bool,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// State of the task before this operation was applied optimistically
    pub rollback_snapshot: Option<Task>,
    /// Ledger event recorded alongside this operation
    pub ledger_seq: Option<i64>,
}

impl QueuedOperation {
    pub fn new(op_type: OperationType, entity_id: TaskId, payload: Value) -> Self {
        Self {
            id: None,
            op_type,
            entity_id,
            payload,
            timestamp: Utc::now(),
            vector_clock: VectorClock::new(),
            priority: 0,
            failed: false,
            retry_count: 0,
            last_error: None,
            rollback_snapshot: None,
            ledger_seq: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_rollback(mut self, snapshot: Task) -> Self {
        self.rollback_snapshot = Some(snapshot);
        self
    }
}

/// Aggregate of archived ledger events. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionSummary {
    pub id: Option<i64>,
    pub date: NaiveDate,
    pub archived_event_count: u64,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub type_counts: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaEntry {
    pub key: String,
    pub value: Value,
}

/// Persisted presentation state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewState {
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub scroll_offset: f64,
}

/// Well-known metadata keys
pub mod meta {
    use tasks::TaskId;

    pub const NODE_ID: &str = "node_id";
    pub const LOCAL_CLOCK: &str = "vector_clock";
    pub const LAST_CHECKSUM: &str = "last_checksum";
    pub const LAST_SYNCED_SEQ: &str = "last_synced_seq";
    pub const LAST_COMPACTION: &str = "last_compaction_at";
    pub const VIEW_STATE: &str = "view_state";
    pub const USERS_MAP: &str = "users_map";

    pub const CHECKSUM_PREFIX: &str = "checksum:";

    pub fn checksum_key(id: &TaskId) -> String {
        format!("{CHECKSUM_PREFIX}{id}")
    }
}

/// A record tagged with the space it belongs to
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Confirmed(Task),
    Provisional(ProvisionalTask),
    Ledger(LedgerEvent),
    Queue(QueuedOperation),
    Archive(CompactionSummary),
    Metadata(MetaEntry),
}

impl Record {
    pub fn space(&self) -> Space {
        match self {
            Self::Confirmed(_) => Space::Confirmed,
            Self::Provisional(_) => Space::Provisional,
            Self::Ledger(_) => Space::Ledger,
            Self::Queue(_) => Space::Queue,
            Self::Archive(_) => Space::Archive,
            Self::Metadata(_) => Space::Metadata,
        }
    }

    /// Primary key, if already assigned
    pub fn key(&self) -> Option<RecordKey> {
        match self {
            Self::Confirmed(task) => Some(RecordKey::from(&task.id)),
            Self::Provisional(p) => Some(RecordKey::from(&p.task.id)),
            Self::Ledger(event) => event.seq.map(RecordKey::Int),
            Self::Queue(op) => op.id.map(RecordKey::Int),
            Self::Archive(summary) => summary.id.map(RecordKey::Int),
            Self::Metadata(entry) => Some(RecordKey::Text(entry.key.clone())),
        }
    }
}
