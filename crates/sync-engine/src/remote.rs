/// Boundary to the remote synchronization service.
///
/// Transport (HTTP, WebSocket) lives behind [`RemoteService`]; the engine
/// only hands over sanitized payloads and receives acknowledgements.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use store::{OperationType, QueuedOperation};
use tasks::checksum::sanitize_for_remote;
use tasks::{Checksum, TaskId};
use thiserror::Error;

use crate::{Result, SyncError};

/// Authoritative state returned by a fetch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    pub entities: Vec<Value>,

    #[serde(default)]
    pub users_map: Map<String, Value>,

    /// Aggregate digest computed by the remote authority
    #[serde(default)]
    pub checksum: Option<Checksum>,
}

/// A mutation on its way to the remote service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RemoteRequest {
    Create { provisional_id: String, payload: Value },
    Update { id: i64, payload: Value },
    Delete { id: i64 },
}

impl RemoteRequest {
    /// Builds the request for a queued operation with internal-only fields
    /// stripped from its payload.
    pub fn from_operation(op: &QueuedOperation) -> Result<Self> {
        let op_id = op.id.unwrap_or_default();
        let payload = sanitize_for_remote(op.payload.clone());
        match (op.op_type, &op.entity_id) {
            (OperationType::Create, TaskId::Provisional(pid)) => Ok(Self::Create {
                provisional_id: pid.clone(),
                payload,
            }),
            (OperationType::Update, TaskId::Confirmed(id)) => Ok(Self::Update { id: *id, payload }),
            (OperationType::Delete, TaskId::Confirmed(id)) => Ok(Self::Delete { id: *id }),
            (OperationType::Create, TaskId::Confirmed(id)) => Err(SyncError::NotSendable {
                op_id,
                reason: format!("task {id} already has a confirmed id"),
            }),
            (_, TaskId::Provisional(pid)) => Err(SyncError::NotSendable {
                op_id,
                reason: format!("task {pid} has not been confirmed yet"),
            }),
        }
    }
}

/// Acknowledgement from the remote service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RemoteAck {
    Created {
        #[serde(alias = "real_id")]
        confirmed_id: i64,
        #[serde(default)]
        entity: Option<Value>,
    },
    Updated {
        #[serde(default)]
        entity: Option<Value>,
    },
    Deleted,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Network or server hiccup; worth retrying
    #[error("transient failure: {0}")]
    Transient(String),

    /// The service refused the request; retrying will not help
    #[error("rejected: {0}")]
    Rejected(String),

    /// The remote state moved on; a refresh is needed
    #[error("conflict: {0}")]
    Conflict(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Remote synchronization service
#[async_trait::async_trait]
pub trait RemoteService: Send + Sync {
    /// Fetch the authoritative task list
    async fn fetch(&self) -> std::result::Result<RemoteSnapshot, RemoteError>;

    /// Send one mutation
    async fn send(&self, request: RemoteRequest) -> std::result::Result<RemoteAck, RemoteError>;
}
