//! Offline-first synchronization core for the task list.
//!
//! Components, leaf first: the local [`store`], the replay-ordered
//! [`OfflineQueue`], the [`ReconciliationEngine`] that retires provisional
//! ids, the [`CompactionScheduler`], and the [`RenderAdmissionGate`] that
//! decides which snapshots reach the presentation layer. [`SyncEngine`]
//! wires them together.
use tasks::{TaskId, ValidationError};
use thiserror::Error;

pub use tasks::checksum;
pub use tasks::{hash_collection, hash_entity, Checksum, ClockOrdering, NodeId, VectorClock};

mod admission;
pub use admission::*;

mod compaction;
pub use compaction::*;

mod config;
pub use config::*;

mod engine;
pub use engine::*;

mod maintenance;
pub use maintenance::*;

mod offline;
pub use offline::*;

mod reconcile;
pub use reconcile::*;

mod remote;
pub use remote::*;

mod replay;
pub use replay::*;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("queued operation not found: {0}")]
    OperationNotFound(i64),

    #[error("operation {op_id} cannot be sent: {reason}")]
    NotSendable { op_id: i64, reason: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("presentation channel closed")]
    PresenterClosed,
}

pub type Result<T> = std::result::Result<T, SyncError>;
