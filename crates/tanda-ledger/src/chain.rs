//! On-chain cycle state.
//!
//! The contract holds the authoritative cycle state; the ledger only reads
//! it. Unlike scoring, a failed read is never papered over: timing answers
//! cannot be computed without real cycle state.

use crate::error::{Error, Result};
use crate::models::{decimal, Address};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

/// Cycle state of a pool as observed on-chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedCycle {
    /// Tokens currently held by the vault
    #[serde(with = "decimal")]
    pub vault_balance: u128,

    /// Unix seconds at which the current cycle started
    pub cycle_start: u64,

    /// Cycle length in seconds
    pub payment_frequency: u64,

    /// Participants in rotation order
    pub participants: Vec<Address>,

    /// Rotation index of this cycle's recipient
    pub current_recipient_index: usize,

    /// Whether each participant has paid this cycle, parallel to `participants`
    pub paid: Vec<bool>,
}

impl ObservedCycle {
    /// True once every participant has paid into the current cycle.
    pub fn all_have_paid(&self) -> bool {
        !self.participants.is_empty()
            && self.paid.len() == self.participants.len()
            && self.paid.iter().all(|paid| *paid)
    }

    /// Whether `participant` has paid this cycle; `None` if they are not in
    /// the rotation.
    pub fn has_paid(&self, participant: &Address) -> Option<bool> {
        let position = self.participants.iter().position(|p| p == participant)?;
        Some(self.paid.get(position).copied().unwrap_or(false))
    }
}

/// Reads cycle state for a pool.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Current cycle state of the pool deployed at `pool`.
    async fn observe(&self, pool: &Address) -> Result<ObservedCycle>;
}

/// Reads cycle state from an HTTP gateway (`GET {gateway}/tanda/{address}`).
pub struct HttpChainReader {
    gateway: String,
    client: reqwest::Client,
}

impl HttpChainReader {
    pub fn new(gateway: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            gateway: gateway.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl ChainReader for HttpChainReader {
    async fn observe(&self, pool: &Address) -> Result<ObservedCycle> {
        let url = format!("{}/tanda/{}", self.gateway, pool);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::UpstreamUnavailable(format!(
                "chain gateway returned {} for pool {}",
                status, pool
            )));
        }

        Ok(response.json().await?)
    }
}

/// Cycle state held in memory. Used in tests and when no gateway is
/// configured.
#[derive(Debug, Default)]
pub struct InMemoryChainReader {
    cycles: RwLock<HashMap<Address, ObservedCycle>>,
}

impl InMemoryChainReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or replace) the observed state of `pool`.
    pub fn insert(&self, pool: Address, cycle: ObservedCycle) {
        self.cycles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pool, cycle);
    }
}

#[async_trait]
impl ChainReader for InMemoryChainReader {
    async fn observe(&self, pool: &Address) -> Result<ObservedCycle> {
        self.cycles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pool)
            .cloned()
            .ok_or_else(|| {
                Error::UpstreamUnavailable(format!("no on-chain state for pool {}", pool))
            })
    }
}
