//! Durable pool ledger.
//!
//! Two views of the same data live side by side: the pool table (id → pool)
//! and the membership index (participant → pool ids). Only [`PoolStore`]
//! touches either, and every write updates both in one step.
//!
//! # Concurrency
//!
//! Readers clone an `Arc` of the current tables and work on that immutable
//! snapshot. Writers serialize on a mutex, apply their change to a private
//! copy, persist it, then swap the snapshot. A reader therefore sees either
//! the state before a write or after it, never half of one.
//!
//! # Persistence
//!
//! One JSON document, replaced atomically (temp file, fsync, rename). Legacy
//! layouts are migrated on open and the original kept beside it with a
//! `.legacy` suffix. An unreadable document is moved aside with a `.corrupt`
//! suffix and the store starts empty.

mod layout;
mod tables;

pub use tables::ConsistencyFault;

use crate::error::{Error, Result};
use crate::models::{Address, Pool};
use layout::LayoutError;
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tables::LedgerTables;

/// File name of the ledger document inside a data directory.
pub const LEDGER_FILE: &str = "pools.json";

/// What `add_participant` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    /// Appended at the end of the rotation
    Added,
    /// Already a participant; nothing changed
    AlreadyMember,
}

/// Whether a write produced something worth persisting.
enum Outcome<T> {
    Changed(T),
    Unchanged(T),
}

/// Storage backend for pool records and the participant index.
pub struct PoolStore {
    path: Option<PathBuf>,
    snapshot: RwLock<Arc<LedgerTables>>,
    writer: Mutex<()>,
}

impl PoolStore {
    /// Open or create the ledger document at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tables = load(&path)?;
        tracing::info!(
            "Opened pool ledger at {:?} ({} pools, {} indexed participants)",
            path,
            tables.pools.len(),
            tables.memberships.len()
        );
        Ok(Self::with_tables(Some(path), tables))
    }

    /// A store that keeps nothing on disk.
    pub fn in_memory() -> Self {
        Self::with_tables(None, LedgerTables::default())
    }

    fn with_tables(path: Option<PathBuf>, tables: LedgerTables) -> Self {
        Self {
            path,
            snapshot: RwLock::new(Arc::new(tables)),
            writer: Mutex::new(()),
        }
    }

    /// Location of the ledger document, if persistent.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // The guarded value is only ever replaced whole, so a poisoned lock
    // still holds a complete snapshot.
    fn snapshot(&self) -> Arc<LedgerTables> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write<T>(&self, f: impl FnOnce(&mut LedgerTables) -> Result<Outcome<T>>) -> Result<T> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let mut tables = LedgerTables::clone(&self.snapshot());
        match f(&mut tables)? {
            Outcome::Unchanged(out) => Ok(out),
            Outcome::Changed(out) => {
                self.persist(&tables)?;
                *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(tables);
                Ok(out)
            }
        }
    }

    fn persist(&self, tables: &LedgerTables) -> Result<()> {
        match &self.path {
            Some(path) => atomic_write(path, &layout::encode(tables)?),
            None => Ok(()),
        }
    }

    // --- Pools ---

    /// Record a new pool and index every participant plus the creator.
    ///
    /// The creator is stored on the pool only when they are not a participant.
    pub fn create_pool(&self, mut pool: Pool, creator: &Address) -> Result<()> {
        pool.validate()?;
        if pool.creator.is_none() && !pool.has_participant(creator) {
            pool.creator = Some(creator.clone());
        }

        self.write(|tables| {
            let key = pool.id.key();
            if tables.pools.contains_key(&key) {
                return Err(Error::AlreadyExists(pool.id.to_string()));
            }
            for holder in pool.index_holders() {
                tables.index(holder, &key);
            }
            tracing::info!(
                "Created pool {} ({}) with {} participants",
                pool.id,
                pool.name,
                pool.participants.len()
            );
            tables.pools.insert(key, pool);
            Ok(Outcome::Changed(()))
        })
    }

    /// Get a pool by id.
    pub fn get_pool(&self, id: &Address) -> Result<Pool> {
        self.snapshot()
            .pools
            .get(&id.key())
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("pool {}", id)))
    }

    /// All pools, in id order.
    pub fn list_pools(&self) -> Vec<Pool> {
        self.snapshot().pools.values().cloned().collect()
    }

    /// Pools open to the public.
    pub fn list_public_pools(&self) -> Vec<Pool> {
        self.snapshot()
            .pools
            .values()
            .filter(|p| p.is_public)
            .cloned()
            .collect()
    }

    /// Pools `participant` belongs to, in the order they joined.
    ///
    /// Index entries pointing at missing pools are logged, left out of the
    /// result and removed from the index.
    pub fn list_pools_for(&self, participant: &Address) -> Vec<Pool> {
        let snapshot = self.snapshot();
        let Some(keys) = snapshot.memberships.get(&participant.key()) else {
            return Vec::new();
        };

        let mut pools = Vec::with_capacity(keys.len());
        let mut stale = Vec::new();
        for key in keys {
            match snapshot.pools.get(key) {
                Some(pool) => pools.push(pool.clone()),
                None => stale.push(key.clone()),
            }
        }

        if !stale.is_empty() {
            for pool in &stale {
                let fault = ConsistencyFault::StaleReference {
                    participant: participant.key(),
                    pool: pool.clone(),
                };
                tracing::warn!("{}; repairing", Error::ConsistencyFault(fault));
            }
            if let Err(e) = self.drop_stale(participant, &stale) {
                tracing::error!("Failed to repair index for {}: {}", participant, e);
            }
        }

        pools
    }

    fn drop_stale(&self, participant: &Address, stale: &[String]) -> Result<()> {
        self.write(|tables| {
            let participant_key = participant.key();
            let mut changed = false;
            for pool_key in stale {
                if !tables.pools.contains_key(pool_key) {
                    tables.unindex(&participant_key, pool_key);
                    changed = true;
                }
            }
            Ok(if changed {
                Outcome::Changed(())
            } else {
                Outcome::Unchanged(())
            })
        })
    }

    // --- Membership ---

    /// Append `participant` to the end of the pool's rotation.
    pub fn add_participant(
        &self,
        pool_id: &Address,
        participant: &Address,
    ) -> Result<MembershipChange> {
        self.write(|tables| {
            let key = pool_id.key();
            let pool = tables
                .pools
                .get_mut(&key)
                .ok_or_else(|| Error::NotFound(format!("pool {}", pool_id)))?;

            if pool.has_participant(participant) {
                return Ok(Outcome::Unchanged(MembershipChange::AlreadyMember));
            }
            pool.participants.push(participant.clone());
            let position = pool.participants.len() - 1;
            tables.index(participant, &key);

            tracing::info!(
                "Added {} to pool {} at rotation position {}",
                participant,
                pool_id,
                position
            );
            Ok(Outcome::Changed(MembershipChange::Added))
        })
    }

    /// Overwrite the cached average eligibility score.
    pub fn update_average_credit(&self, pool_id: &Address, value: f64) -> Result<()> {
        self.set_average_credit(pool_id, None, value).map(|_| ())
    }

    /// Overwrite the cached average only if the pool still has exactly
    /// `expected` as its participants. Returns whether the roster matched.
    pub fn update_average_credit_if(
        &self,
        pool_id: &Address,
        expected: &[Address],
        value: f64,
    ) -> Result<bool> {
        self.set_average_credit(pool_id, Some(expected), value)
    }

    fn set_average_credit(
        &self,
        pool_id: &Address,
        expected: Option<&[Address]>,
        value: f64,
    ) -> Result<bool> {
        if !value.is_finite() || value < 0.0 {
            return Err(Error::Validation(format!(
                "average credit must be a non-negative number, got {}",
                value
            )));
        }

        self.write(|tables| {
            let pool = tables
                .pools
                .get_mut(&pool_id.key())
                .ok_or_else(|| Error::NotFound(format!("pool {}", pool_id)))?;
            if expected.is_some_and(|roster| roster != pool.participants.as_slice()) {
                return Ok(Outcome::Unchanged(false));
            }
            if pool.average_credit == value {
                return Ok(Outcome::Unchanged(true));
            }
            pool.average_credit = value;
            Ok(Outcome::Changed(true))
        })
    }

    // --- Diagnostics ---

    /// Every disagreement between the index and the pool table.
    pub fn verify(&self) -> Vec<ConsistencyFault> {
        self.snapshot().verify()
    }

    /// Fix and persist index faults. Returns what was fixed.
    pub fn repair(&self) -> Result<Vec<ConsistencyFault>> {
        self.write(|tables| {
            let fixed = tables.repair();
            for fault in &fixed {
                tracing::warn!("Repaired: {}", fault);
            }
            Ok(if fixed.is_empty() {
                Outcome::Unchanged(fixed)
            } else {
                Outcome::Changed(fixed)
            })
        })
    }

    /// Number of pools.
    pub fn len(&self) -> usize {
        self.snapshot().pools.len()
    }

    /// Whether the ledger holds no pools.
    pub fn is_empty(&self) -> bool {
        self.snapshot().pools.is_empty()
    }
}

/// Read, recognise, migrate and repair the document at `path`.
fn load(path: &Path) -> Result<LedgerTables> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("No ledger at {:?}, starting empty", path);
            return Ok(LedgerTables::default());
        }
        Err(e) => return Err(e.into()),
    };

    let detected = String::from_utf8(raw)
        .map_err(|e| LayoutError::Malformed(e.to_string()))
        .and_then(|text| layout::detect(&text));

    let layout = match detected {
        Ok(layout) => layout,
        Err(LayoutError::UnsupportedVersion(v)) => {
            tracing::error!("Ledger at {:?} uses unknown layout version {}", path, v);
            return start_over(path, &format!(".v{}", v));
        }
        Err(LayoutError::Malformed(reason)) => {
            tracing::error!("Ledger at {:?} is unreadable: {}", path, reason);
            return start_over(path, ".corrupt");
        }
    };

    let legacy = layout.is_legacy();
    let shape = layout.name();
    let (mut tables, report) = layout::into_tables(layout);

    let mut dirty = false;
    if legacy {
        let backup = with_suffix(path, ".legacy");
        std::fs::copy(path, &backup)?;
        tracing::info!(
            "Migrated {} ledger: {} pools, {} records skipped (original kept at {:?})",
            shape,
            report.pools,
            report.skipped,
            backup
        );
        dirty = true;
    } else if report.skipped > 0 {
        let backup = with_suffix(path, ".corrupt");
        std::fs::copy(path, &backup)?;
        tracing::error!(
            "Skipped {} unreadable pool record(s); {} loaded (original kept at {:?})",
            report.skipped,
            report.pools,
            backup
        );
        dirty = true;
    }

    for fault in tables.repair() {
        tracing::warn!("Repaired on load: {}", fault);
        dirty = true;
    }

    if dirty {
        atomic_write(path, &layout::encode(&tables)?)?;
    }
    Ok(tables)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Move an unusable document aside under `suffix` and start empty.
fn start_over(path: &Path, suffix: &str) -> Result<LedgerTables> {
    let target = with_suffix(path, suffix);
    match std::fs::rename(path, &target) {
        Ok(()) => tracing::warn!("Ledger moved to {:?}; starting empty", target),
        Err(e) => tracing::warn!("Could not move ledger aside: {}", e),
    }
    let tables = LedgerTables::default();
    atomic_write(path, &layout::encode(&tables)?)?;
    Ok(tables)
}

/// Write to a temp file, fsync, then rename over the target.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = with_suffix(path, ".tmp");
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if let Ok(d) = std::fs::File::open(dir) {
            let _ = d.sync_all();
        }
    }
    Ok(())
}
