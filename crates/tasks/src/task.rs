use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use crate::checksum::sanitize_for_remote;
use crate::{Result, TaskId, ValidationError};

/// Task workflow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Task priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn rank(&self) -> i32 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Urgent => 3,
        }
    }
}

/// A task as held in the local store and exchanged with the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub assignees: BTreeSet<String>,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Soft-delete marker. The row is only physically removed once the
    /// delete has been acknowledged by the remote service.
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub deleted_at: Option<DateTime<Utc>>,

    /// Remote fields this client does not model, kept so checksums stay
    /// comparable with the remote authority.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    pub fn new(id: TaskId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            status: TaskStatus::default(),
            priority: Priority::default(),
            due_date: None,
            assignees: BTreeSet::new(),
            labels: BTreeSet::new(),
            pinned: false,
            created_at: None,
            updated_at: None,
            deleted_at: None,
            extra: Map::new(),
        }
    }

    /// New locally created task with a fresh provisional id.
    pub fn provisional(title: impl Into<String>, now: DateTime<Utc>) -> Self {
        let mut task = Self::new(TaskId::new_provisional(), title);
        task.created_at = Some(now);
        task.updated_at = Some(now);
        task
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = Some(now);
    }

    /// Checks an in-memory task before it is written anywhere.
    pub fn validate(&self) -> Result<()> {
        if let TaskId::Confirmed(id) = self.id {
            if id <= 0 {
                return Err(ValidationError::NonNumericId(id.to_string()));
            }
        }
        if self.title.trim().is_empty() {
            return Err(ValidationError::EmptyTitle);
        }
        Ok(())
    }

    /// Validates an inbound payload from the remote service or an older
    /// store row.
    ///
    /// Rejects payloads with an explicit `error` marker so that a failed
    /// network response cannot be persisted as a task.
    pub fn from_remote(value: Value) -> Result<Self> {
        let Value::Object(fields) = &value else {
            return Err(ValidationError::Malformed {
                field: "entity",
                reason: "expected a JSON object".to_string(),
            });
        };
        if let Some(marker) = fields.get("error").filter(|v| !v.is_null()) {
            return Err(ValidationError::ErrorMarker(marker.to_string()));
        }
        match fields.get("id") {
            None | Some(Value::Null) => return Err(ValidationError::MissingField("id")),
            Some(id) => {
                TaskId::from_value(id)?;
            }
        }
        if !fields.contains_key("title") {
            return Err(ValidationError::MissingField("title"));
        }

        let task: Task = serde_json::from_value(value).map_err(|e| ValidationError::Malformed {
            field: "entity",
            reason: e.to_string(),
        })?;
        task.validate()?;
        Ok(task)
    }

    pub fn to_value(&self) -> Value {
        // Task serializes infallibly: every field is a plain JSON type.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn apply_patch(&mut self, patch: &TaskPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(due_date) = patch.due_date {
            self.due_date = due_date;
        }
        if let Some(assignees) = &patch.assignees {
            self.assignees = assignees.clone();
        }
        if let Some(labels) = &patch.labels {
            self.labels = labels.clone();
        }
        if let Some(pinned) = patch.pinned {
            self.pinned = pinned;
        }
    }
}

/// A task together with the JSON it travels as.
///
/// Payloads received from the remote authority are kept verbatim (minus
/// volatile fields) so that local digests are computed over the same bytes
/// the remote hashes. Re-serializing a `Task` would add defaulted fields and
/// rewrite timestamp encodings.
#[derive(Debug, Clone, PartialEq)]
pub struct WireTask {
    pub task: Task,
    pub payload: Value,
}

impl WireTask {
    /// Validates an inbound payload and keeps it as received.
    pub fn parse(value: Value) -> Result<Self> {
        let payload = sanitize_for_remote(value);
        let task = Task::from_remote(payload.clone())?;
        Ok(Self { task, payload })
    }

    /// Wire form of a task built or edited on this device.
    pub fn local(task: Task) -> Self {
        let payload = task.to_value();
        Self { task, payload }
    }
}

/// Partial update of a task's mutable fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<Option<NaiveDate>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignees: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Accepts RFC 3339 strings and epoch-millisecond numbers. Anything else,
/// including non-finite numbers, becomes `None` so callers can tell a
/// missing timestamp from a real one.
fn lenient_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(parse_timestamp))
}

pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => {
            let millis = n.as_f64().filter(|m| m.is_finite())?;
            Utc.timestamp_millis_opt(millis as i64).single()
        }
        _ => None,
    }
}
