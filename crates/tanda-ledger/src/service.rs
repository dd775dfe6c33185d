//! Pool operations that span the store, the eligibility gate and the chain.

use crate::chain::{ChainReader, ObservedCycle};
use crate::eligibility::{self, Eligibility, EligibilityGate, GroupEligibility};
use crate::error::{Disqualified, Error, Result};
use crate::models::{decimal, Address, Pool};
use crate::storage::{MembershipChange, PoolStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tanda_schedule::{Cycle, Rotation, Schedule, ScheduleError};

/// Rescoring rounds before a join gives up refreshing the pool's average.
const AVERAGE_REFRESH_ATTEMPTS: usize = 3;

fn default_public() -> bool {
    true
}

/// Request to record a newly deployed pool.
///
/// Addresses arrive as raw strings so every malformed one can be reported
/// at once.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePoolRequest {
    /// Contract address of the deployed pool
    pub id: String,
    pub name: String,
    pub participants: Vec<String>,
    #[serde(with = "decimal")]
    pub payment_amount: u128,
    pub payment_frequency_secs: u64,
    #[serde(default = "default_public")]
    pub is_public: bool,
    #[serde(default)]
    pub credit_requirement: f64,
    /// Account that deployed the pool
    pub creator: String,
    #[serde(default)]
    pub creation_tx: Option<String>,
    #[serde(default)]
    pub creation_block: Option<String>,
}

/// One participant's claim slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimSlot {
    pub participant: Address,
    pub claim_at: DateTime<Utc>,
}

/// Timing facts for a pool at a given instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub pool_id: Address,
    #[serde(with = "decimal")]
    pub vault_balance: u128,
    pub cycle_start: DateTime<Utc>,
    pub payment_frequency_secs: u64,
    pub current_recipient: Address,
    pub next_payment_due: DateTime<Utc>,
    /// Whose claim instant `claim_eligible_at` describes
    pub claim_subject: Address,
    /// May be in the past, meaning the subject can claim now
    pub claim_eligible_at: DateTime<Utc>,
    pub claim_schedule: Vec<ClaimSlot>,
    pub all_have_paid: bool,
    /// Set only when a participant was queried and is in the rotation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_paid: Option<bool>,
}

/// A participant's score in a credit report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantScore {
    pub participant: Address,
    pub score: f64,
}

/// Scores for a set of participants plus their rounded mean.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditReport {
    pub scores: Vec<ParticipantScore>,
    pub average: f64,
}

/// Entry point for everything the API and admin surfaces do.
#[derive(Clone)]
pub struct PoolService {
    store: Arc<PoolStore>,
    gate: EligibilityGate,
    chain: Arc<dyn ChainReader>,
}

impl PoolService {
    pub fn new(store: Arc<PoolStore>, gate: EligibilityGate, chain: Arc<dyn ChainReader>) -> Self {
        Self { store, gate, chain }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<PoolStore> {
        &self.store
    }

    /// Validate, gate on credit and record a new pool.
    ///
    /// Every participant below the requirement is reported, not just the
    /// first. Nothing is written unless all checks pass.
    pub async fn create_pool(&self, request: CreatePoolRequest) -> Result<Pool> {
        let id = Address::parse(&request.id)?;
        let creator = Address::parse(&request.creator)?;
        let participants = parse_addresses(&request.participants)?;

        let mut pool = Pool::new(
            id,
            request.name,
            participants,
            request.payment_amount,
            request.payment_frequency_secs,
        );
        pool.is_public = request.is_public;
        pool.credit_requirement = request.credit_requirement;
        pool.creation_tx = request.creation_tx;
        pool.creation_block = request.creation_block;
        pool.validate()?;

        if self.store.get_pool(&pool.id).is_ok() {
            return Err(Error::AlreadyExists(pool.id.to_string()));
        }

        let scores = self.gate.scores(&pool.participants).await;
        let verdict = eligibility::judge(&scores, pool.credit_requirement);
        if let GroupEligibility::Fail(failures) = verdict {
            tracing::info!(
                "Refusing pool {}: {} participant(s) below {}",
                pool.id,
                failures.len(),
                pool.credit_requirement
            );
            return Err(Error::Ineligible {
                threshold: pool.credit_requirement,
                failures,
            });
        }
        let values: Vec<f64> = scores.iter().map(|(_, score)| *score).collect();
        pool.average_credit = eligibility::mean_score(&values);

        self.store.create_pool(pool.clone(), &creator)?;
        self.store.get_pool(&pool.id)
    }

    /// Add `participant` to a public pool they qualify for, then refresh the
    /// pool's average score.
    pub async fn join_pool(&self, pool_id: &Address, participant: &Address) -> Result<Pool> {
        let pool = self.store.get_pool(pool_id)?;
        if !pool.is_public {
            return Err(Error::PrivatePool(pool.id.to_string()));
        }
        if pool.has_participant(participant) {
            return Err(already_member(&pool, participant));
        }

        if let Eligibility::Fail { score } = self
            .gate
            .check_threshold(participant, pool.credit_requirement)
            .await
        {
            return Err(Error::Ineligible {
                threshold: pool.credit_requirement,
                failures: vec![Disqualified {
                    participant: participant.clone(),
                    score,
                }],
            });
        }

        if self.store.add_participant(pool_id, participant)? == MembershipChange::AlreadyMember {
            return Err(already_member(&pool, participant));
        }

        if let Err(e) = self.refresh_average(pool_id).await {
            tracing::warn!("Joined pool {} but could not refresh its average: {}", pool_id, e);
        }
        self.store.get_pool(pool_id)
    }

    /// Recompute the cached average for the current roster. A concurrent
    /// join changes the roster mid-lookup; the stale result is discarded and
    /// the lookup repeated.
    async fn refresh_average(&self, pool_id: &Address) -> Result<()> {
        for _ in 0..AVERAGE_REFRESH_ATTEMPTS {
            let roster = self.store.get_pool(pool_id)?.participants;
            let average = self.gate.average_score(&roster).await;
            if self.store.update_average_credit_if(pool_id, &roster, average)? {
                return Ok(());
            }
            tracing::debug!("Roster of pool {} changed while scoring; retrying", pool_id);
        }
        Err(Error::Storage(format!(
            "roster kept changing after {} attempts",
            AVERAGE_REFRESH_ATTEMPTS
        )))
    }

    /// Timing facts for a pool at `now`, optionally from one participant's
    /// point of view. Without a participant the claim subject is the current
    /// recipient.
    pub async fn pool_status(
        &self,
        pool_id: &Address,
        participant: Option<&Address>,
        now: DateTime<Utc>,
    ) -> Result<PoolStatus> {
        let pool = self.store.get_pool(pool_id)?;
        let observed = self.chain.observe(&pool.id).await.map_err(|e| {
            tracing::warn!("Chain read for pool {} failed: {}", pool.id, e);
            e
        })?;
        if observed.participants.len() != pool.participants.len() {
            tracing::debug!(
                "Pool {} has {} stored participants but {} on-chain",
                pool.id,
                pool.participants.len(),
                observed.participants.len()
            );
        }
        status_of(&pool, &observed, participant, now)
    }

    /// Scores for `participants` plus their rounded mean.
    pub async fn credit_report(&self, participants: &[Address]) -> CreditReport {
        let scores = self.gate.scores(participants).await;
        let values: Vec<f64> = scores.iter().map(|(_, score)| *score).collect();
        CreditReport {
            average: eligibility::mean_score(&values),
            scores: scores
                .into_iter()
                .map(|(participant, score)| ParticipantScore { participant, score })
                .collect(),
        }
    }

    pub fn get_pool(&self, pool_id: &Address) -> Result<Pool> {
        self.store.get_pool(pool_id)
    }

    pub fn list_pools(&self) -> Vec<Pool> {
        self.store.list_pools()
    }

    pub fn list_public_pools(&self) -> Vec<Pool> {
        self.store.list_public_pools()
    }

    pub fn pools_for(&self, participant: &Address) -> Vec<Pool> {
        self.store.list_pools_for(participant)
    }
}

fn already_member(pool: &Pool, participant: &Address) -> Error {
    Error::AlreadyMember {
        pool: pool.id.to_string(),
        participant: participant.to_string(),
    }
}

/// Parse every address, reporting all malformed ones together.
pub fn parse_addresses(raw: &[String]) -> Result<Vec<Address>> {
    let mut parsed = Vec::with_capacity(raw.len());
    let mut invalid = Vec::new();
    for s in raw {
        match Address::parse(s) {
            Ok(addr) => parsed.push(addr),
            Err(_) => invalid.push(s.as_str()),
        }
    }
    if invalid.is_empty() {
        Ok(parsed)
    } else {
        Err(Error::Validation(format!(
            "invalid participant addresses: {}",
            invalid.join(", ")
        )))
    }
}

fn status_of(
    pool: &Pool,
    observed: &ObservedCycle,
    participant: Option<&Address>,
    now: DateTime<Utc>,
) -> Result<PoolStatus> {
    let now_secs = u64::try_from(now.timestamp()).unwrap_or(0);
    let cycle = Cycle::new(observed.cycle_start, observed.payment_frequency)?;
    let rotation = Rotation::new(&observed.participants, observed.current_recipient_index)?;
    let current_recipient = rotation.current_recipient().clone();
    let schedule = Schedule::new(cycle, rotation, observed.all_have_paid());

    let claim_subject = participant.cloned().unwrap_or_else(|| current_recipient.clone());

    let claim_schedule = schedule
        .claim_schedule()?
        .into_iter()
        .map(|(participant, at)| {
            Ok(ClaimSlot {
                participant: participant.clone(),
                claim_at: instant(at)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(PoolStatus {
        pool_id: pool.id.clone(),
        vault_balance: observed.vault_balance,
        cycle_start: instant(cycle.start())?,
        payment_frequency_secs: cycle.frequency(),
        current_recipient,
        next_payment_due: instant(schedule.next_payment_due(now_secs)?)?,
        claim_eligible_at: instant(schedule.claim_eligible_at(claim_subject.as_str(), now_secs)?)?,
        claim_subject,
        claim_schedule,
        all_have_paid: observed.all_have_paid(),
        has_paid: participant.and_then(|p| observed.has_paid(p)),
    })
}

fn instant(secs: u64) -> Result<DateTime<Utc>> {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .ok_or(Error::Schedule(ScheduleError::Overflow))
}
