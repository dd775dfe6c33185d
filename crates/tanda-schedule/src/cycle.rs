//! Cycle boundaries and payment due dates.

use crate::error::{Result, ScheduleError};

/// A payment cycle as observed on-chain: when it started and how long it lasts.
///
/// Instants are Unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cycle {
    start: u64,
    frequency: u64,
}

impl Cycle {
    /// Create a cycle. A zero frequency is rejected rather than guessed.
    pub fn new(start: u64, frequency: u64) -> Result<Self> {
        if frequency == 0 {
            return Err(ScheduleError::ZeroFrequency);
        }
        Ok(Self { start, frequency })
    }

    /// When the cycle started.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Cycle length in seconds.
    pub fn frequency(&self) -> u64 {
        self.frequency
    }

    /// The instant `n` whole cycles after the start.
    pub fn boundary(&self, n: u64) -> Result<u64> {
        self.frequency
            .checked_mul(n)
            .and_then(|offset| self.start.checked_add(offset))
            .ok_or(ScheduleError::Overflow)
    }

    /// End of the current cycle.
    pub fn end(&self) -> Result<u64> {
        self.boundary(1)
    }

    /// Number of whole cycles between the start and `now` (zero before the start).
    pub fn elapsed(&self, now: u64) -> u64 {
        now.saturating_sub(self.start) / self.frequency
    }

    /// When the next payment falls due.
    ///
    /// While the cycle is still running this is its end. Once the cycle has
    /// elapsed without being rolled over on-chain, the answer is two boundaries
    /// past the last elapsed one: one to reach the boundary at or after `now`,
    /// one more for the cycle being paid into. The result is never before `now`.
    pub fn next_payment_due(&self, now: u64) -> Result<u64> {
        let end = self.end()?;
        if end >= now {
            return Ok(end);
        }
        let elapsed = self.elapsed(now);
        self.boundary(elapsed.checked_add(2).ok_or(ScheduleError::Overflow)?)
    }
}
