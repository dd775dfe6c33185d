//! Cycle Scheduling for Rotating Savings Pools
//!
//! A pool collects one payment from every participant per cycle and hands
//! the vault to one participant per cycle, in rotation order. This crate
//! derives the timing facts a participant cares about from the cycle state
//! observed on-chain:
//!
//! - when the next payment falls due
//! - when a given participant becomes entitled to claim
//!
//! Everything here is pure computation over the inputs it is handed. There
//! is no clock, no storage and no I/O; callers pass `now` explicitly.
//!
//! # Rotation
//!
//! The current recipient claims at the next cycle boundary. Everyone else
//! claims on successive boundaries in rotation order, wrapping around:
//!
//! ```text
//! k     = (position - current_recipient) mod participant_count
//! claim = cycle_start + frequency × (k + 1)
//! ```
//!
//! A claim instant in the past means "eligible now". It is never clamped.

mod cycle;
mod error;
mod rotation;

pub use cycle::Cycle;
pub use error::{Result, ScheduleError};
pub use rotation::{positions_ahead, Rotation, Schedule};
