//! Error types for the pool ledger.

use crate::models::Address;
use crate::storage::ConsistencyFault;
use tanda_schedule::ScheduleError;
use thiserror::Error;

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A participant that failed a credit requirement, with the score they had.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Disqualified {
    pub participant: Address,
    pub score: f64,
}

/// Errors that can occur in ledger operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Pool id or index entry absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate pool id on create
    #[error("Pool already exists: {0}")]
    AlreadyExists(String),

    /// Participant already holds membership
    #[error("{participant} is already a participant in pool {pool}")]
    AlreadyMember { pool: String, participant: String },

    /// Malformed or out-of-range input
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Membership index disagrees with the pool table
    #[error("Consistency fault: {0}")]
    ConsistencyFault(ConsistencyFault),

    /// Scoring service or chain reader failed
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Joining a pool that is not open to the public
    #[error("Pool {0} is private")]
    PrivatePool(String),

    /// One or more participants below the credit requirement
    #[error("{} participant(s) below credit requirement {threshold}", failures.len())]
    Ineligible {
        threshold: f64,
        failures: Vec<Disqualified>,
    },

    /// Scheduling inputs were unusable
    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::UpstreamUnavailable(e.to_string())
    }
}
