//! Pool model - a rotating savings group.

use crate::error::{Error, Result};
use crate::models::Address;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A rotating savings group.
///
/// Participant order is the rotation order. Terms (amount, frequency and
/// credit requirement) are fixed at creation; only `participants` and the
/// cached `average_credit` change afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Pool {
    /// Contract address of the pool
    pub id: Address,

    /// Display label
    pub name: String,

    /// Participants in rotation order
    pub participants: Vec<Address>,

    /// Amount due per participant per cycle, in the token's smallest unit
    #[serde(with = "decimal")]
    pub payment_amount: u128,

    /// Cycle length in seconds
    pub payment_frequency_secs: u64,

    /// Whether any eligible participant may join
    pub is_public: bool,

    /// Minimum eligibility score to join (0 disables gating)
    pub credit_requirement: f64,

    /// Mean eligibility score of the current participants
    #[serde(default, deserialize_with = "cached_average")]
    pub average_credit: f64,

    /// When the pool was recorded
    pub created_at: DateTime<Utc>,

    /// Who created the pool; indexed alongside the participants
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<Address>,

    /// Creation transaction hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_tx: Option<String>,

    /// Block the creation transaction landed in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_block: Option<String>,
}

impl Pool {
    /// Create a public, ungated pool with the required fields.
    pub fn new(
        id: Address,
        name: String,
        participants: Vec<Address>,
        payment_amount: u128,
        payment_frequency_secs: u64,
    ) -> Self {
        Self {
            id,
            name,
            participants,
            payment_amount,
            payment_frequency_secs,
            is_public: true,
            credit_requirement: 0.0,
            average_credit: 0.0,
            created_at: Utc::now(),
            creator: None,
            creation_tx: None,
            creation_block: None,
        }
    }

    /// Whether `participant` is in the rotation.
    pub fn has_participant(&self, participant: &Address) -> bool {
        self.participants.contains(participant)
    }

    /// Everyone whose membership index should reference this pool.
    pub fn index_holders(&self) -> impl Iterator<Item = &Address> {
        self.participants.iter().chain(
            self.creator
                .iter()
                .filter(move |c| !self.participants.contains(*c)),
        )
    }

    /// Check the invariants a stored pool must satisfy.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("pool name must not be empty".into()));
        }
        if self.participants.is_empty() {
            return Err(Error::Validation(format!(
                "pool {} must have at least one participant",
                self.id
            )));
        }
        let mut seen = HashSet::with_capacity(self.participants.len());
        for participant in &self.participants {
            if !seen.insert(participant) {
                return Err(Error::Validation(format!(
                    "duplicate participant {} in pool {}",
                    participant, self.id
                )));
            }
        }
        if self.payment_amount == 0 {
            return Err(Error::Validation("payment amount must be positive".into()));
        }
        if self.payment_frequency_secs == 0 {
            return Err(Error::Validation("payment frequency must be positive".into()));
        }
        if !self.credit_requirement.is_finite() || self.credit_requirement < 0.0 {
            return Err(Error::Validation(format!(
                "credit requirement must be a non-negative number, got {}",
                self.credit_requirement
            )));
        }
        if !self.average_credit.is_finite() || self.average_credit < 0.0 {
            return Err(Error::Validation(format!(
                "average credit must be a non-negative number, got {}",
                self.average_credit
            )));
        }
        Ok(())
    }
}

/// The cached average is recomputed on the next join; `null` reads as 0.
fn cached_average<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(0.0))
}

/// Large integers travel as decimal strings; numbers are accepted on input.
pub(crate) mod decimal {
    use serde::de::{self, Deserializer, Visitor};
    use serde::Serializer;
    use std::fmt;

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        struct DecimalVisitor;

        impl Visitor<'_> for DecimalVisitor {
            type Value = u128;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a non-negative integer or decimal string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<u128, E> {
                Ok(v as u128)
            }

            fn visit_u128<E: de::Error>(self, v: u128) -> Result<u128, E> {
                Ok(v)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<u128, E> {
                u128::try_from(v).map_err(|_| E::custom(format!("negative amount {}", v)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<u128, E> {
                v.trim()
                    .parse()
                    .map_err(|_| E::custom(format!("invalid amount {:?}", v)))
            }
        }

        deserializer.deserialize_any(DecimalVisitor)
    }
}
