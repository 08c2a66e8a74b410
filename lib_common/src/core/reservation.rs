//! # Reservation Ledger
//!
//! A global, deduplicated record of every candidate the engines have claimed.
//! A candidate goes through at most one of two paths:
//!
//! - **reserve → confirm**: the accept call succeeded; the owner joins the
//!   record's owner set and the in-flight flag is cleared.
//! - **reserve → release**: the accept call failed; the provisional record is
//!   deleted so the candidate can be claimed again.
//!
//! Reservation atomicity is the only cross-engine invariant that needs real
//! mutual exclusion. Backends provide it with a uniqueness guarantee on the
//! candidate id (a primary key in PostgreSQL, a single map entry in memory).

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use crate::core::error::StoreError;

/// One ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservationRecord {
    /// The feed's candidate id, unique across the whole ledger.
    pub external_id: String,
    /// When the record was first created.
    pub first_seen_at: DateTime<Utc>,
    /// Owners that have confirmed this candidate.
    pub owners: BTreeSet<String>,
    /// True while an accept call for the candidate is in flight.
    pub reserved: bool,
}

/// Backing store for the ledger.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Creates a reserved record if none exists. Returns whether this call
    /// created it; of any number of concurrent callers exactly one wins.
    async fn reserve(&self, candidate_id: &str, owner: &str) -> Result<bool, StoreError>;

    /// Marks the candidate as processed for `owner`, creating the record when
    /// it does not exist yet.
    async fn confirm(&self, candidate_id: &str, owner: &str) -> Result<(), StoreError>;

    /// Deletes the record only while it is still reserved. Returns whether a
    /// record was deleted.
    async fn release(&self, candidate_id: &str) -> Result<bool, StoreError>;

    /// Number of records confirmed by `owner`.
    async fn count_for_owner(&self, owner: &str) -> Result<u64, StoreError>;

    /// The `limit` most recently created records confirmed by `owner`.
    async fn recent_for_owner(&self, owner: &str, limit: usize) -> Result<Vec<ReservationRecord>, StoreError>;

    /// Removes `owner` from every record; records left without owners are
    /// deleted. Returns the number of records touched.
    async fn clear_owner(&self, owner: &str) -> Result<u64, StoreError>;

    /// Deletes everything. Returns the number of records removed.
    async fn wipe(&self) -> Result<u64, StoreError>;

    /// Deletes reserved, unconfirmed records created more than `older_than`
    /// ago. Returns the number of records removed.
    async fn sweep_stale(&self, older_than: Duration) -> Result<u64, StoreError>;
}

#[derive(Debug)]
struct Entry {
    record: ReservationRecord,
    // Insertion order breaks timestamp ties in `recent_for_owner`.
    seq: u64,
}

#[derive(Debug, Default)]
struct Ledger {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

impl Ledger {
    fn insert(&mut self, candidate_id: &str, owners: BTreeSet<String>, reserved: bool) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            candidate_id.to_string(),
            Entry {
                record: ReservationRecord {
                    external_id: candidate_id.to_string(),
                    first_seen_at: Utc::now(),
                    owners,
                    reserved,
                },
                seq,
            },
        );
    }
}

/// Process-local ledger. Every operation runs under one lock, which gives the
/// same create-if-absent guarantee a unique index gives in a database.
#[derive(Debug, Default)]
pub struct MemoryReservationStore {
    ledger: Mutex<Ledger>,
}

impl MemoryReservationStore {
    fn with_ledger<T>(&self, f: impl FnOnce(&mut Ledger) -> T) -> Result<T, StoreError> {
        let mut ledger = self.ledger.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&mut ledger))
    }

    /// Looks up a single record.
    pub fn get(&self, candidate_id: &str) -> Result<Option<ReservationRecord>, StoreError> {
        self.with_ledger(|l| l.entries.get(candidate_id).map(|e| e.record.clone()))
    }

    /// Total number of records.
    pub fn len(&self) -> Result<usize, StoreError> {
        self.with_ledger(|l| l.entries.len())
    }

    /// Whether the ledger holds no records.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        self.len().map(|n| n == 0)
    }

    #[cfg(test)]
    pub(crate) fn poison_for_tests(&self) {
        let _guard = self.ledger.lock();
        panic!("poisoning the ledger");
    }
}

#[async_trait]
impl ReservationStore for MemoryReservationStore {
    async fn reserve(&self, candidate_id: &str, _owner: &str) -> Result<bool, StoreError> {
        self.with_ledger(|l| {
            if l.entries.contains_key(candidate_id) {
                false
            } else {
                l.insert(candidate_id, BTreeSet::new(), true);
                true
            }
        })
    }

    async fn confirm(&self, candidate_id: &str, owner: &str) -> Result<(), StoreError> {
        self.with_ledger(|l| match l.entries.get_mut(candidate_id) {
            Some(entry) => {
                entry.record.owners.insert(owner.to_string());
                entry.record.reserved = false;
            }
            None => {
                let owners = BTreeSet::from([owner.to_string()]);
                l.insert(candidate_id, owners, false);
            }
        })
    }

    async fn release(&self, candidate_id: &str) -> Result<bool, StoreError> {
        self.with_ledger(|l| {
            let still_reserved = l
                .entries
                .get(candidate_id)
                .is_some_and(|e| e.record.reserved);
            if still_reserved {
                l.entries.remove(candidate_id);
            }
            still_reserved
        })
    }

    async fn count_for_owner(&self, owner: &str) -> Result<u64, StoreError> {
        self.with_ledger(|l| {
            l.entries
                .values()
                .filter(|e| e.record.owners.contains(owner))
                .count() as u64
        })
    }

    async fn recent_for_owner(&self, owner: &str, limit: usize) -> Result<Vec<ReservationRecord>, StoreError> {
        self.with_ledger(|l| {
            let mut mine: Vec<&Entry> = l
                .entries
                .values()
                .filter(|e| e.record.owners.contains(owner))
                .collect();
            mine.sort_by(|a, b| {
                b.record
                    .first_seen_at
                    .cmp(&a.record.first_seen_at)
                    .then(b.seq.cmp(&a.seq))
            });
            mine.into_iter().take(limit).map(|e| e.record.clone()).collect()
        })
    }

    async fn clear_owner(&self, owner: &str) -> Result<u64, StoreError> {
        self.with_ledger(|l| {
            let mut touched = 0;
            l.entries.retain(|_, e| {
                if !e.record.owners.remove(owner) {
                    return true;
                }
                touched += 1;
                !e.record.owners.is_empty() || e.record.reserved
            });
            touched
        })
    }

    async fn wipe(&self) -> Result<u64, StoreError> {
        self.with_ledger(|l| {
            let removed = l.entries.len() as u64;
            l.entries.clear();
            removed
        })
    }

    async fn sweep_stale(&self, older_than: Duration) -> Result<u64, StoreError> {
        let max_age = ChronoDuration::from_std(older_than).unwrap_or(ChronoDuration::MAX);
        let cutoff = Utc::now().checked_sub_signed(max_age).unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.with_ledger(|l| {
            let before = l.entries.len();
            l.entries.retain(|_, e| {
                !(e.record.reserved && e.record.owners.is_empty() && e.record.first_seen_at <= cutoff)
            });
            (before - l.entries.len()) as u64
        })
    }
}
