//! Ledger models.
//!
//! - [`Address`] - participant or pool identifier (`0x` + 40 hex digits)
//! - [`Pool`] - a rotating savings group and its fixed terms

mod address;
mod pool;

pub use address::Address;
pub use pool::Pool;

pub(crate) use pool::decimal;
