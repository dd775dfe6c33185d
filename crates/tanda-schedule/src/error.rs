//! Error types for tanda-schedule.

use thiserror::Error;

/// Result type for scheduling operations.
pub type Result<T> = std::result::Result<T, ScheduleError>;

/// Inputs that cannot produce a meaningful schedule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// The rotation has no participants.
    #[error("rotation has no participants")]
    EmptyRotation,

    /// Cycle length of zero seconds.
    #[error("payment frequency must be positive")]
    ZeroFrequency,

    /// The current recipient index points outside the participant list.
    #[error("current recipient index {index} out of range for {count} participants")]
    RecipientOutOfRange { index: usize, count: usize },

    /// A derived instant does not fit in 64 bits.
    #[error("schedule arithmetic overflowed")]
    Overflow,
}
