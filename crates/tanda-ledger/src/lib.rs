//! Tanda Ledger - Rotating Savings Pool Ledger
//!
//! Records rotating savings pools ("tandas") deployed on-chain, who belongs
//! to which pool, and whether prospective participants meet a pool's credit
//! requirement. Cycle timing is derived from on-chain state with
//! [`tanda_schedule`].
//!
//! # Architecture
//!
//! - **Models**: [`Pool`] and [`Address`]
//! - **Storage**: a JSON-backed store holding pools plus a participant index
//! - **Eligibility**: credit gating over an external scoring service
//! - **Chain**: read-only access to observed cycle state
//! - **Service**: the operations the API exposes
//! - **API**: HTTP endpoints
//! - **Admin Socket**: Unix socket for local admin commands (tanda-admin CLI)
//!
//! # Example
//!
//! ```no_run
//! use tanda_ledger::{LedgerConfig, LedgerNode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = LedgerConfig::from_env()?;
//!     let node = LedgerNode::new(config).await?;
//!     node.run().await?;
//!     Ok(())
//! }
//! ```

pub mod admin_socket;
pub mod api;
pub mod chain;
pub mod eligibility;
pub mod error;
pub mod models;
pub mod node;
pub mod service;
pub mod storage;

pub use chain::{ChainReader, ObservedCycle};
pub use eligibility::{EligibilityGate, ScoreLookup, ScoreSource};
pub use error::{Error, Result};
pub use models::{Address, Pool};
pub use node::{LedgerConfig, LedgerNode};
pub use service::{CreatePoolRequest, PoolService, PoolStatus};
pub use storage::{MembershipChange, PoolStore};
