//! Task model and the leaf primitives shared by the store and sync engine:
//! identifiers, vector clocks, and content checksums.
use thiserror::Error;

mod id;
pub use id::*;
mod task;
pub use task::*;
mod vector_clock;
pub use vector_clock::*;
pub mod checksum;
pub use checksum::{hash_collection, hash_entity, hash_value, Checksum};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("confirmed id must be a positive integer, got {0}")]
    NonNumericId(String),
    #[error("payload carries an error marker: {0}")]
    ErrorMarker(String),
    #[error("title must not be empty")]
    EmptyTitle,
    #[error("malformed field {field}: {reason}")]
    Malformed { field: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, ValidationError>;
