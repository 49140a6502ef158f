//! Durable local storage for the task sync engine.
//!
//! One SQLite database holds six record spaces: confirmed tasks,
//! provisional tasks, the event ledger, the offline queue, the compaction
//! archive and key-value metadata. All mutation goes through
//! [`PersistentStore::transaction`].

use std::path::PathBuf;
use tasks::ValidationError;
use thiserror::Error;

mod db;
mod orphans;
mod records;
mod schema;
mod store;

pub use db::{ConfirmedTask, StoreTx};
pub use orphans::*;
pub use records::*;
pub use schema::SCHEMA_VERSION;
pub use store::*;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record for space {record} cannot be written to space {space}")]
    SpaceMismatch { space: Space, record: Space },

    #[error("key {key} is not valid for space {space}")]
    KeyMismatch { space: Space, key: RecordKey },

    #[error("ledger event {0} is immutable")]
    LedgerImmutable(i64),

    #[error("compaction summary {0} is write-once")]
    ArchiveImmutable(i64),

    #[error("corrupt {space} row: {detail}")]
    Corrupt { space: Space, detail: String },

    #[error("store initialization failed: {0}")]
    Init(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

pub fn app_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    base.join("tasksync")
}

pub fn default_db_path() -> PathBuf {
    app_data_dir().join("tasks.db")
}
