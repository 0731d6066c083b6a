//! Persistence boundary.
//!
//! Uniqueness of `identity_id`, `contact_address` and the attendance dedup
//! key is enforced here, by conditional inserts, not by callers.

use crate::matcher::GalleryEntry;
use crate::types::{AttendanceEvent, DedupKey, Identity, ReportRow};
use chrono::{Duration, NaiveDate};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Which unique key an insert collided with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    IdentityId,
    ContactAddress,
    DedupKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Exists(Conflict),
}

/// Filter for the attendance report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportQuery {
    pub from: NaiveDate,
    pub to: NaiveDate,
    /// `None` reports every group.
    pub group_tag: Option<String>,
}

impl ReportQuery {
    /// Build a query; an empty group or the literal `"all"` disables the filter.
    pub fn new(from: NaiveDate, to: NaiveDate, group_tag: Option<&str>) -> Self {
        let group_tag = group_tag
            .map(str::trim)
            .filter(|g| !g.is_empty() && !g.eq_ignore_ascii_case("all"))
            .map(str::to_string);
        Self { from, to, group_tag }
    }

    /// The `days`-long window ending on `today`.
    pub fn last_days(today: NaiveDate, days: u32, group_tag: Option<&str>) -> Self {
        Self::new(today - Duration::days(i64::from(days)), today, group_tag)
    }

    pub fn matches(&self, event: &AttendanceEvent) -> bool {
        event.date >= self.from
            && event.date <= self.to
            && self.group_tag.as_deref().map_or(true, |g| g == event.group_tag)
    }
}

/// Key-value persistence collaborator.
pub trait Store: Send + Sync {
    fn identity(&self, identity_id: &str) -> Result<Option<Identity>, StoreError>;

    fn identity_by_contact(&self, contact_address: &str) -> Result<Option<Identity>, StoreError>;

    /// Every enrolled identity, in enrollment order.
    fn identities(&self) -> Result<Vec<Identity>, StoreError>;

    fn identity_count(&self) -> Result<usize, StoreError> {
        self.identities().map(|all| all.len())
    }

    /// Insert unless `identity_id` or `contact_address` is already taken.
    fn insert_identity(&self, identity: &Identity) -> Result<InsertOutcome, StoreError>;

    fn attendance(&self, key: &DedupKey) -> Result<Option<AttendanceEvent>, StoreError>;

    /// Insert unless an event with the same dedup key exists.
    fn insert_attendance(&self, event: &AttendanceEvent) -> Result<InsertOutcome, StoreError>;

    /// Rows ordered by date, identity id, then session.
    fn attendance_report(&self, query: &ReportQuery) -> Result<Vec<ReportRow>, StoreError>;
}

#[derive(Default)]
struct Tables {
    identities: Vec<Identity>,
    by_id: HashMap<String, usize>,
    by_contact: HashMap<String, usize>,
    attendance: BTreeMap<DedupKey, AttendanceEvent>,
}

/// In-process store. Conditional inserts run under the write lock.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every operation fails with `Unavailable` while false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn attendance_count(&self) -> usize {
        self.read().attendance.len()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".into()))
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Store for MemoryStore {
    fn identity(&self, identity_id: &str) -> Result<Option<Identity>, StoreError> {
        self.check()?;
        let t = self.read();
        Ok(t.by_id.get(identity_id).map(|&i| t.identities[i].clone()))
    }

    fn identity_by_contact(&self, contact_address: &str) -> Result<Option<Identity>, StoreError> {
        self.check()?;
        let t = self.read();
        Ok(t.by_contact.get(contact_address).map(|&i| t.identities[i].clone()))
    }

    fn identities(&self) -> Result<Vec<Identity>, StoreError> {
        self.check()?;
        Ok(self.read().identities.clone())
    }

    fn identity_count(&self) -> Result<usize, StoreError> {
        self.check()?;
        Ok(self.read().identities.len())
    }

    fn insert_identity(&self, identity: &Identity) -> Result<InsertOutcome, StoreError> {
        self.check()?;
        let mut t = self.write();
        if t.by_id.contains_key(&identity.identity_id) {
            return Ok(InsertOutcome::Exists(Conflict::IdentityId));
        }
        if t.by_contact.contains_key(&identity.contact_address) {
            return Ok(InsertOutcome::Exists(Conflict::ContactAddress));
        }
        let idx = t.identities.len();
        t.by_id.insert(identity.identity_id.clone(), idx);
        t.by_contact.insert(identity.contact_address.clone(), idx);
        t.identities.push(identity.clone());
        Ok(InsertOutcome::Inserted)
    }

    fn attendance(&self, key: &DedupKey) -> Result<Option<AttendanceEvent>, StoreError> {
        self.check()?;
        Ok(self.read().attendance.get(key).cloned())
    }

    fn insert_attendance(&self, event: &AttendanceEvent) -> Result<InsertOutcome, StoreError> {
        self.check()?;
        let mut t = self.write();
        let key = event.dedup_key();
        if t.attendance.contains_key(&key) {
            return Ok(InsertOutcome::Exists(Conflict::DedupKey));
        }
        t.attendance.insert(key, event.clone());
        Ok(InsertOutcome::Inserted)
    }

    fn attendance_report(&self, query: &ReportQuery) -> Result<Vec<ReportRow>, StoreError> {
        self.check()?;
        let t = self.read();
        let mut rows: Vec<ReportRow> = t
            .attendance
            .values()
            .filter(|e| query.matches(e))
            .filter_map(|e| {
                // Events whose identity was removed administratively drop out.
                let identity = &t.identities[*t.by_id.get(&e.identity_id)?];
                Some(ReportRow {
                    date: e.date,
                    identity_id: e.identity_id.clone(),
                    display_name: identity.display_name.clone(),
                    group_tag: e.group_tag.clone(),
                    session_tag: e.session_tag.clone(),
                })
            })
            .collect();
        rows.sort_by(|a, b| {
            (a.date, &a.identity_id, &a.session_tag).cmp(&(b.date, &b.identity_id, &b.session_tag))
        });
        Ok(rows)
    }
}

/// Read-only view of the gallery for the matcher.
#[derive(Clone)]
pub struct EmbeddingStore {
    store: Arc<dyn Store>,
    expected_dim: usize,
}

impl EmbeddingStore {
    pub fn new(store: Arc<dyn Store>, expected_dim: usize) -> Self {
        Self { store, expected_dim }
    }

    pub fn expected_dim(&self) -> usize {
        self.expected_dim
    }

    /// Load every `(identity_id, embedding)` pair, in enrollment order.
    ///
    /// A persisted embedding of the wrong shape is corrupt data, not a
    /// non-match.
    pub fn gallery(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        self.store
            .identities()?
            .into_iter()
            .map(|identity| {
                identity.embedding.validate(self.expected_dim).map_err(|e| {
                    StoreError::Corrupt(format!("identity {}: {e}", identity.identity_id))
                })?;
                Ok(GalleryEntry {
                    identity_id: identity.identity_id,
                    embedding: identity.embedding,
                })
            })
            .collect()
    }
}
