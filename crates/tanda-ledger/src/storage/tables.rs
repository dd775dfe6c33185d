//! The two logical tables of the ledger and the rule that ties them together.

use crate::models::{Address, Pool};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// A disagreement between the membership index and the pool table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsistencyFault {
    /// Index references a pool that is not in the pool table
    StaleReference { participant: String, pool: String },
    /// Index holder of a pool has no index entry for it
    MissingReference { participant: String, pool: String },
    /// Same pool listed more than once for a participant
    DuplicateReference { participant: String, pool: String },
    /// Index lists a pool the participant does not belong to
    UnexpectedReference { participant: String, pool: String },
}

impl fmt::Display for ConsistencyFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StaleReference { participant, pool } => {
                write!(f, "{} references missing pool {}", participant, pool)
            }
            Self::MissingReference { participant, pool } => {
                write!(f, "{} belongs to pool {} but is not indexed", participant, pool)
            }
            Self::DuplicateReference { participant, pool } => {
                write!(f, "{} lists pool {} more than once", participant, pool)
            }
            Self::UnexpectedReference { participant, pool } => {
                write!(f, "{} is indexed under pool {} without membership", participant, pool)
            }
        }
    }
}

/// Pool table keyed by lowercase pool id, and membership index keyed by
/// lowercase participant address holding lowercase pool ids in join order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct LedgerTables {
    pub pools: BTreeMap<String, Pool>,
    pub memberships: BTreeMap<String, Vec<String>>,
}

impl LedgerTables {
    /// Append `pool_key` to `holder`'s index entry unless already present.
    pub fn index(&mut self, holder: &Address, pool_key: &str) -> bool {
        let entry = self.memberships.entry(holder.key()).or_default();
        if entry.iter().any(|k| k == pool_key) {
            return false;
        }
        entry.push(pool_key.to_string());
        true
    }

    /// Drop `pool_key` from `participant_key`'s index entry.
    pub fn unindex(&mut self, participant_key: &str, pool_key: &str) {
        if let Some(entry) = self.memberships.get_mut(participant_key) {
            entry.retain(|k| k != pool_key);
            if entry.is_empty() {
                self.memberships.remove(participant_key);
            }
        }
    }

    /// Rebuild the membership index from the pool table, oldest pools first.
    pub fn rebuild_index(&mut self) {
        let mut pools: Vec<&Pool> = self.pools.values().collect();
        pools.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.key().cmp(&b.id.key()))
        });

        let mut memberships: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for pool in pools {
            let pool_key = pool.id.key();
            for holder in pool.index_holders() {
                let entry = memberships.entry(holder.key()).or_default();
                if !entry.contains(&pool_key) {
                    entry.push(pool_key.clone());
                }
            }
        }
        self.memberships = memberships;
    }

    /// Every disagreement between the two tables.
    pub fn verify(&self) -> Vec<ConsistencyFault> {
        let mut faults = Vec::new();

        for (participant, pool_keys) in &self.memberships {
            let mut seen = HashSet::new();
            for pool_key in pool_keys {
                let fault_ids = || (participant.clone(), pool_key.clone());
                if !seen.insert(pool_key) {
                    let (participant, pool) = fault_ids();
                    faults.push(ConsistencyFault::DuplicateReference { participant, pool });
                    continue;
                }
                match self.pools.get(pool_key) {
                    None => {
                        let (participant, pool) = fault_ids();
                        faults.push(ConsistencyFault::StaleReference { participant, pool });
                    }
                    Some(pool) if !pool.index_holders().any(|h| h.matches(participant)) => {
                        let (participant, pool) = fault_ids();
                        faults.push(ConsistencyFault::UnexpectedReference { participant, pool });
                    }
                    Some(_) => {}
                }
            }
        }

        for (pool_key, pool) in &self.pools {
            for holder in pool.index_holders() {
                let indexed = self
                    .memberships
                    .get(&holder.key())
                    .is_some_and(|keys| keys.contains(pool_key));
                if !indexed {
                    faults.push(ConsistencyFault::MissingReference {
                        participant: holder.key(),
                        pool: pool_key.clone(),
                    });
                }
            }
        }

        faults
    }

    /// Bring the index back in line with the pool table. Returns what was fixed.
    pub fn repair(&mut self) -> Vec<ConsistencyFault> {
        let faults = self.verify();
        if faults.is_empty() {
            return faults;
        }

        for fault in &faults {
            match fault {
                ConsistencyFault::StaleReference { participant, pool }
                | ConsistencyFault::UnexpectedReference { participant, pool } => {
                    self.unindex(participant, pool);
                }
                ConsistencyFault::DuplicateReference { participant, pool } => {
                    if let Some(entry) = self.memberships.get_mut(participant) {
                        let mut kept = false;
                        entry.retain(|k| {
                            if k != pool {
                                return true;
                            }
                            !std::mem::replace(&mut kept, true)
                        });
                    }
                }
                ConsistencyFault::MissingReference { participant, pool } => {
                    let entry = self.memberships.entry(participant.clone()).or_default();
                    if !entry.contains(pool) {
                        entry.push(pool.clone());
                    }
                }
            }
        }

        faults
    }

    /// Participants recoverable from the index for one pool.
    #[cfg(test)]
    pub fn indexed_holders(&self, pool_key: &str) -> Vec<String> {
        self.memberships
            .iter()
            .filter(|(_, keys)| keys.iter().any(|k| k == pool_key))
            .map(|(participant, _)| participant.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        Address::parse(&format!("0x{}", hex::encode([n; 20]))).unwrap()
    }

    fn tables_with_pool() -> (LedgerTables, String) {
        let pool = Pool::new(addr(0xaa), "P".into(), vec![addr(1), addr(2)], 10, 60);
        let key = pool.id.key();
        let mut tables = LedgerTables::default();
        tables.pools.insert(key.clone(), pool);
        tables.rebuild_index();
        (tables, key)
    }

    #[test]
    fn rebuilt_index_is_consistent() {
        let (tables, key) = tables_with_pool();
        assert!(tables.verify().is_empty());

        let mut holders = tables.indexed_holders(&key);
        holders.sort();
        assert_eq!(holders, vec![addr(1).key(), addr(2).key()]);
    }

    #[test]
    fn index_is_idempotent() {
        let (mut tables, key) = tables_with_pool();
        assert!(!tables.index(&addr(1), &key));
        assert_eq!(tables.memberships[&addr(1).key()], vec![key]);
    }

    #[test]
    fn detects_and_repairs_every_fault_kind() {
        let (mut tables, key) = tables_with_pool();
        // stale
        tables.memberships.entry(addr(1).key()).or_default().push("0xgone".into());
        // duplicate
        tables.memberships.entry(addr(2).key()).or_default().push(key.clone());
        // unexpected
        tables.memberships.insert(addr(7).key(), vec![key.clone()]);
        // missing
        tables.pools.get_mut(&key).unwrap().participants.push(addr(3));

        let faults = tables.verify();
        assert_eq!(faults.len(), 4);
        assert!(faults.iter().any(|f| matches!(f, ConsistencyFault::StaleReference { .. })));
        assert!(faults.iter().any(|f| matches!(f, ConsistencyFault::DuplicateReference { .. })));
        assert!(faults.iter().any(|f| matches!(f, ConsistencyFault::UnexpectedReference { .. })));
        assert!(faults.iter().any(|f| matches!(f, ConsistencyFault::MissingReference { .. })));

        let fixed = tables.repair();
        assert_eq!(fixed, faults);
        assert!(tables.verify().is_empty());
        assert_eq!(tables.memberships[&addr(2).key()], vec![key.clone()]);
        assert!(!tables.memberships.contains_key(&addr(7).key()));
    }
}
