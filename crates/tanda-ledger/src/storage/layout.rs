//! On-disk shapes of the ledger and migration of legacy shapes.
//!
//! Three shapes have existed:
//!
//! - **Flat**: a JSON array of pool records.
//! - **By-participant**: an object mapping each participant to a full copy of
//!   every pool record they belong to.
//! - **Versioned**: `{"version": 2, "pools": {..}, "memberships": {..}}`, the
//!   current dual-index layout.
//!
//! Legacy records use string-typed numbers and `tandaAddress` for the id.

use super::tables::LedgerTables;
use crate::error::{Error, Result};
use crate::models::{Address, Pool};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// Version written by this build.
pub(crate) const LEDGER_VERSION: u64 = 2;

/// A ledger document as recognised by shape.
#[derive(Debug)]
pub(crate) enum StoredLayout {
    Empty,
    Versioned(VersionedDocument),
    ByParticipant(BTreeMap<String, Vec<Value>>),
    Flat(Vec<Value>),
}

impl StoredLayout {
    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::ByParticipant(_) | Self::Flat(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Versioned(_) => "versioned",
            Self::ByParticipant(_) => "by-participant",
            Self::Flat(_) => "flat",
        }
    }
}

/// Why a document could not be recognised.
#[derive(Debug, Error)]
pub(crate) enum LayoutError {
    #[error("malformed ledger document: {0}")]
    Malformed(String),

    #[error("unsupported ledger version {0}")]
    UnsupportedVersion(u64),
}

/// The canonical document as written.
#[derive(Serialize)]
struct PersistedLedger<'a> {
    version: u64,
    #[serde(flatten)]
    tables: &'a LedgerTables,
}

/// A versioned document read record by record, so one bad pool does not
/// take the rest with it.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct VersionedDocument {
    #[serde(default)]
    pools: BTreeMap<String, Value>,
    #[serde(default)]
    memberships: Value,
}

/// Serialize tables in the current layout.
pub(crate) fn encode(tables: &LedgerTables) -> Result<Vec<u8>> {
    let doc = PersistedLedger {
        version: LEDGER_VERSION,
        tables,
    };
    Ok(serde_json::to_vec_pretty(&doc)?)
}

/// Recognise a document by inspecting its shape.
pub(crate) fn detect(raw: &str) -> std::result::Result<StoredLayout, LayoutError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(StoredLayout::Empty);
    }

    let value: Value =
        serde_json::from_str(raw).map_err(|e| LayoutError::Malformed(e.to_string()))?;

    match value {
        Value::Array(records) => Ok(StoredLayout::Flat(records)),
        Value::Object(map) if map.contains_key("version") => {
            let version = map
                .get("version")
                .and_then(Value::as_u64)
                .ok_or_else(|| LayoutError::Malformed("version is not an integer".into()))?;
            if version != LEDGER_VERSION {
                return Err(LayoutError::UnsupportedVersion(version));
            }
            let doc: VersionedDocument = serde_json::from_value(Value::Object(map))
                .map_err(|e| LayoutError::Malformed(e.to_string()))?;
            Ok(StoredLayout::Versioned(doc))
        }
        Value::Object(map) => {
            let mut by_participant = BTreeMap::new();
            for (participant, records) in map {
                match records {
                    Value::Array(records) => {
                        by_participant.insert(participant, records);
                    }
                    other => {
                        return Err(LayoutError::Malformed(format!(
                            "entry for {} is {}, expected an array",
                            participant,
                            kind_of(&other)
                        )))
                    }
                }
            }
            Ok(StoredLayout::ByParticipant(by_participant))
        }
        other => Err(LayoutError::Malformed(format!(
            "top level is {}",
            kind_of(&other)
        ))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Outcome of migrating a legacy document.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct MigrationReport {
    pub pools: usize,
    pub skipped: usize,
}

/// Convert any recognised layout into tables.
pub(crate) fn into_tables(layout: StoredLayout) -> (LedgerTables, MigrationReport) {
    match layout {
        StoredLayout::Empty => (LedgerTables::default(), MigrationReport::default()),
        StoredLayout::Versioned(doc) => from_versioned(doc),
        StoredLayout::Flat(records) => {
            let mut migration = Migration::default();
            for record in records {
                migration.absorb(None, record);
            }
            migration.finish()
        }
        StoredLayout::ByParticipant(by_participant) => {
            let mut migration = Migration::default();
            for (holder, records) in by_participant {
                for record in records {
                    migration.absorb(Some(&holder), record);
                }
            }
            migration.finish()
        }
    }
}

/// Decode each stored pool on its own. Bad records are skipped; the index
/// is kept as found and left for the caller's repair pass.
fn from_versioned(doc: VersionedDocument) -> (LedgerTables, MigrationReport) {
    let mut tables = LedgerTables::default();
    let mut skipped = 0;

    for (key, record) in doc.pools {
        let pool = serde_json::from_value::<Pool>(record)
            .map_err(Error::from)
            .and_then(|pool| pool.validate().map(|()| pool));
        match pool {
            Ok(pool) => {
                if pool.id.key() != key {
                    tracing::warn!("Pool stored under {} has id {}; re-keying", key, pool.id);
                }
                tables.pools.insert(pool.id.key(), pool);
            }
            Err(e) => {
                tracing::warn!("Skipping stored pool {}: {}", key, e);
                skipped += 1;
            }
        }
    }

    match doc.memberships {
        Value::Null => {}
        raw => match serde_json::from_value(raw) {
            Ok(memberships) => tables.memberships = memberships,
            Err(e) => tracing::warn!("Discarding unreadable membership index: {}", e),
        },
    }

    let report = MigrationReport {
        pools: tables.pools.len(),
        skipped,
    };
    (tables, report)
}

#[derive(Default)]
struct Migration {
    tables: LedgerTables,
    holders: Vec<(String, String)>,
    skipped: usize,
}

impl Migration {
    fn absorb(&mut self, holder: Option<&str>, record: Value) {
        let pool = match LegacyPoolRecord::from_value(record) {
            Ok(pool) => pool,
            Err(e) => {
                tracing::warn!("Skipping legacy pool record: {}", e);
                self.skipped += 1;
                return;
            }
        };

        let key = pool.id.key();
        if let Some(holder) = holder {
            self.holders.push((holder.to_ascii_lowercase(), key.clone()));
        }

        match self.tables.pools.get_mut(&key) {
            // Copies of the same pool can disagree on participants; keep everyone.
            Some(existing) => {
                for participant in pool.participants {
                    if !existing.has_participant(&participant) {
                        existing.participants.push(participant);
                    }
                }
            }
            None => {
                self.tables.pools.insert(key, pool);
            }
        }
    }

    fn finish(mut self) -> (LedgerTables, MigrationReport) {
        // Holders that are not participants can only be the creator.
        for (holder, pool_key) in &self.holders {
            let Some(pool) = self.tables.pools.get_mut(pool_key) else {
                continue;
            };
            if pool.index_holders().any(|h| h.matches(holder)) {
                continue;
            }
            if pool.creator.is_none() {
                if let Ok(creator) = Address::parse(holder) {
                    pool.creator = Some(creator);
                    continue;
                }
            }
            tracing::warn!(
                "Dropping index entry {} -> {}: not a participant",
                holder,
                pool_key
            );
        }

        self.tables.rebuild_index();
        let report = MigrationReport {
            pools: self.tables.pools.len(),
            skipped: self.skipped,
        };
        (self.tables, report)
    }
}

/// A pool record as the legacy layouts stored it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyPoolRecord {
    name: String,
    tanda_address: String,
    #[serde(default)]
    transaction_hash: Option<String>,
    #[serde(default)]
    block_number: Option<Value>,
    #[serde(default)]
    participants: Vec<String>,
    payment_amount: Value,
    payment_frequency: Value,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    is_public: Option<bool>,
    #[serde(default)]
    credit_requirement: Option<Value>,
    #[serde(default)]
    average_credit: Option<Value>,
}

impl LegacyPoolRecord {
    fn from_value(value: Value) -> Result<Pool> {
        let record: LegacyPoolRecord = serde_json::from_value(value)?;
        record.into_pool()
    }

    fn into_pool(self) -> Result<Pool> {
        let id = Address::parse(&self.tanda_address)?;

        let mut seen = HashSet::new();
        let mut participants = Vec::with_capacity(self.participants.len());
        for raw in &self.participants {
            let participant = Address::parse(raw)?;
            if seen.insert(participant.clone()) {
                participants.push(participant);
            }
        }

        let payment_amount = loose_integer(&self.payment_amount).ok_or_else(|| {
            Error::Validation(format!("pool {}: bad paymentAmount {}", id, self.payment_amount))
        })?;
        let payment_frequency_secs = loose_integer(&self.payment_frequency)
            .and_then(|f| u64::try_from(f).ok())
            .ok_or_else(|| {
                Error::Validation(format!(
                    "pool {}: bad paymentFrequency {}",
                    id, self.payment_frequency
                ))
            })?;

        let created_at = self
            .created_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_default();

        let mut pool = Pool::new(
            id,
            self.name.trim().to_string(),
            participants,
            payment_amount,
            payment_frequency_secs,
        );
        pool.created_at = created_at;
        pool.is_public = self.is_public.unwrap_or(true);
        pool.credit_requirement = self
            .credit_requirement
            .as_ref()
            .and_then(loose_float)
            .unwrap_or(0.0);
        pool.average_credit = self
            .average_credit
            .as_ref()
            .and_then(loose_float)
            .unwrap_or(0.0);
        pool.creation_tx = self.transaction_hash;
        pool.creation_block = self.block_number.map(|b| match b {
            Value::String(s) => s,
            other => other.to_string(),
        });

        pool.validate()?;
        Ok(pool)
    }
}

fn loose_integer(value: &Value) -> Option<u128> {
    match value {
        Value::Number(n) => n.as_u64().map(u128::from),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn loose_float(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.filter(|v: &f64| v.is_finite() && *v >= 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const POOL: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const OTHER_POOL: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const ALICE: &str = "0x1111111111111111111111111111111111111111";
    const BOB: &str = "0x2222222222222222222222222222222222222222";
    const CAROL: &str = "0x3333333333333333333333333333333333333333";

    fn record(id: &str, participants: &[&str]) -> Value {
        json!({
            "name": "Family",
            "tandaAddress": id,
            "transactionHash": "0xfeed",
            "blockNumber": "12345",
            "participants": participants,
            "paymentAmount": "1000000",
            "paymentFrequency": "604800",
            "createdAt": "2024-05-01T12:00:00.000Z",
            "isPublic": false,
            "creditRequirement": "50",
            "averageCredit": "72.50"
        })
    }

    #[test]
    fn detect_shapes() {
        assert!(matches!(detect("  \n"), Ok(StoredLayout::Empty)));
        assert!(matches!(detect("[]"), Ok(StoredLayout::Flat(_))));
        assert!(matches!(detect("{}"), Ok(StoredLayout::ByParticipant(_))));
        assert!(matches!(
            detect(r#"{"version": 2, "pools": {}, "memberships": {}}"#),
            Ok(StoredLayout::Versioned(_))
        ));
    }

    #[test]
    fn detect_rejects_garbage() {
        assert!(matches!(detect("{not json"), Err(LayoutError::Malformed(_))));
        assert!(matches!(detect("42"), Err(LayoutError::Malformed(_))));
        assert!(matches!(detect(r#"{"0xabc": 7}"#), Err(LayoutError::Malformed(_))));
        assert!(matches!(
            detect(r#"{"version": 9, "pools": {}}"#),
            Err(LayoutError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn legacy_record_fields_convert() {
        let pool = LegacyPoolRecord::from_value(record(POOL, &[ALICE, BOB])).unwrap();
        assert_eq!(pool.id.as_str(), POOL);
        assert_eq!(pool.payment_amount, 1_000_000);
        assert_eq!(pool.payment_frequency_secs, 604_800);
        assert!(!pool.is_public);
        assert_eq!(pool.credit_requirement, 50.0);
        assert_eq!(pool.average_credit, 72.5);
        assert_eq!(pool.creation_block.as_deref(), Some("12345"));
        assert_eq!(pool.created_at.to_rfc3339(), "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn legacy_defaults_apply() {
        let pool = LegacyPoolRecord::from_value(json!({
            "name": "Minimal",
            "tandaAddress": POOL,
            "participants": [ALICE],
            "paymentAmount": 5,
            "paymentFrequency": "60",
            "creditRequirement": "N/A"
        }))
        .unwrap();
        assert!(pool.is_public);
        assert_eq!(pool.credit_requirement, 0.0);
        assert_eq!(pool.created_at, DateTime::<Utc>::default());
    }

    #[test]
    fn flat_layout_migrates() {
        let layout = StoredLayout::Flat(vec![
            record(POOL, &[ALICE, BOB]),
            record(OTHER_POOL, &[BOB, CAROL]),
            json!({"garbage": true}),
        ]);
        let (tables, report) = into_tables(layout);
        assert_eq!(report, MigrationReport { pools: 2, skipped: 1 });
        assert!(tables.verify().is_empty());
        assert_eq!(tables.memberships[BOB].len(), 2);
        assert_eq!(tables.memberships[ALICE], vec![POOL.to_string()]);
    }

    #[test]
    fn by_participant_copies_merge() {
        // Bob's copy is stale and misses Carol.
        let mut by_participant = BTreeMap::new();
        by_participant.insert(ALICE.to_string(), vec![record(POOL, &[ALICE, BOB, CAROL])]);
        by_participant.insert(BOB.to_string(), vec![record(POOL, &[ALICE, BOB])]);
        by_participant.insert(CAROL.to_string(), vec![record(POOL, &[ALICE, BOB, CAROL])]);

        let (tables, report) = into_tables(StoredLayout::ByParticipant(by_participant));
        assert_eq!(report.pools, 1);
        let pool = &tables.pools[POOL];
        let participants: Vec<&str> = pool.participants.iter().map(Address::as_str).collect();
        assert_eq!(participants, vec![ALICE, BOB, CAROL]);
        assert!(tables.verify().is_empty());
    }

    #[test]
    fn non_participant_holder_becomes_creator() {
        let mut by_participant = BTreeMap::new();
        by_participant.insert(CAROL.to_string(), vec![record(POOL, &[ALICE, BOB])]);

        let (tables, _) = into_tables(StoredLayout::ByParticipant(by_participant));
        let pool = &tables.pools[POOL];
        assert_eq!(pool.creator.as_ref().map(Address::as_str), Some(CAROL));
        assert_eq!(tables.memberships[CAROL], vec![POOL.to_string()]);
        assert!(tables.verify().is_empty());
    }

    #[test]
    fn versioned_round_trip() {
        let (tables, _) = into_tables(StoredLayout::Flat(vec![record(POOL, &[ALICE])]));
        let bytes = encode(&tables).unwrap();
        let raw = String::from_utf8(bytes).unwrap();
        let layout = detect(&raw).unwrap();
        assert_eq!(layout.name(), "versioned");
        let (decoded, report) = into_tables(layout);
        assert_eq!(decoded, tables);
        assert_eq!(report, MigrationReport { pools: 1, skipped: 0 });
    }

    #[test]
    fn bad_versioned_records_are_skipped_alone() {
        let (good, _) = into_tables(StoredLayout::Flat(vec![record(POOL, &[ALICE, BOB])]));
        let mut doc = serde_json::to_value(PersistedLedger {
            version: LEDGER_VERSION,
            tables: &good,
        })
        .unwrap();
        let mut broken = doc["pools"][POOL].clone();
        broken["id"] = json!(OTHER_POOL);
        broken["participants"] = json!([]);
        doc["pools"][OTHER_POOL] = broken;
        doc["pools"]["0xcccccccccccccccccccccccccccccccccccccccc"] =
            json!({"id": "0xnot-an-address", "name": "Broken"});

        let (tables, report) = into_tables(detect(&doc.to_string()).unwrap());
        assert_eq!(report, MigrationReport { pools: 1, skipped: 2 });
        assert_eq!(tables.pools.keys().map(String::as_str).collect::<Vec<_>>(), vec![POOL]);
        assert_eq!(tables.memberships, good.memberships);
    }

    #[test]
    fn unreadable_index_is_dropped_not_fatal() {
        let (good, _) = into_tables(StoredLayout::Flat(vec![record(POOL, &[ALICE])]));
        let mut doc = serde_json::to_value(PersistedLedger {
            version: LEDGER_VERSION,
            tables: &good,
        })
        .unwrap();
        doc["memberships"] = json!("garbage");

        let (mut tables, _) = into_tables(detect(&doc.to_string()).unwrap());
        assert_eq!(tables.pools.len(), 1);
        assert!(tables.memberships.is_empty());
        assert!(!tables.repair().is_empty());
        assert!(tables.verify().is_empty());
    }
}
