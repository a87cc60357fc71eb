//! History-tracked entity store (effective-dated versions per business key).
//!
//! Every mutation of a key is one [`KeyCommit`]: optionally close the current
//! row, optionally insert its replacement. A commit is validated against the
//! key's history, written to the log as a single frame, and only then applied
//! in memory, so a key is either fully updated or untouched.
//!
//! Writers must hold a [`KeyClaim`] for the key they commit to. Claims are
//! exclusive: the "current row" of a key has exactly one writer at a time.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::log::FramedLog;
use crate::{EntityKey, Result, StoreError, SurrogateId, Timestamp, VersionRow};

/// Close the key's current row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseRow {
    pub version: u32,
    pub valid_to: Timestamp,
    /// Landing sequence of the record causing the close.
    pub sequence: u64,
    /// The close comes from a delete; no replacement row follows.
    pub retired: bool,
    pub updated_by: String,
    pub updated_at: Timestamp,
}

/// Atomic close-and-insert for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyCommit {
    pub key: EntityKey,
    pub close: Option<CloseRow>,
    pub insert: Option<VersionRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantBreach {
    pub key: EntityKey,
    pub detail: String,
}

impl fmt::Display for InvariantBreach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.detail)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryStats {
    pub keys: usize,
    pub rows: usize,
    pub current: usize,
    pub retired_keys: usize,
    /// Current rows per entity type.
    pub current_by_entity: BTreeMap<String, usize>,
}

/// Deterministic view of the whole store: rows ordered by key, then version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistorySnapshot {
    pub rows: Vec<VersionRow>,
}

impl HistorySnapshot {
    pub fn rows_for<'a>(&'a self, key: &'a EntityKey) -> impl Iterator<Item = &'a VersionRow> + 'a {
        self.rows.iter().filter(move |r| &r.entity_key == key)
    }
}

/// Exclusive write guard for one key; released on drop.
pub struct KeyClaim<'a> {
    store: &'a HistoryStore,
    key: EntityKey,
}

impl KeyClaim<'_> {
    pub fn key(&self) -> &EntityKey {
        &self.key
    }
}

impl Drop for KeyClaim<'_> {
    fn drop(&mut self) {
        self.store.claims.remove(&self.key);
    }
}

pub struct HistoryStore {
    log: FramedLog,
    rows: DashMap<EntityKey, Vec<VersionRow>>,
    claims: DashMap<EntityKey, ()>,
}

impl HistoryStore {
    /// Open (or create) a durable history store, replaying its log.
    pub fn open(path: &Path, sync_writes: bool) -> Result<Self> {
        let (log, commits) = FramedLog::open::<KeyCommit>(path, sync_writes)?;
        let store = Self {
            log,
            rows: DashMap::new(),
            claims: DashMap::new(),
        };
        let replayed = commits.len();
        for (idx, commit) in commits.into_iter().enumerate() {
            let mut rows = store.rows.entry(commit.key.clone()).or_default();
            if let Err(detail) = check_commit(rows.value(), &commit) {
                return Err(StoreError::Corrupt {
                    path: path.display().to_string(),
                    offset: idx as u64,
                    message: format!("commit for {} does not replay: {detail}", commit.key),
                });
            }
            apply_commit(rows.value_mut(), commit);
        }
        tracing::debug!(path = %path.display(), commits = replayed, "opened history store");
        Ok(store)
    }

    /// A store that keeps nothing on disk.
    pub fn in_memory() -> Self {
        Self {
            log: FramedLog::memory(),
            rows: DashMap::new(),
            claims: DashMap::new(),
        }
    }

    /// Take the exclusive write claim for `key`.
    pub fn claim(&self, key: &EntityKey) -> Result<KeyClaim<'_>> {
        match self.claims.entry(key.clone()) {
            Entry::Occupied(_) => Err(StoreError::KeyBusy(key.clone())),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(KeyClaim {
                    store: self,
                    key: key.clone(),
                })
            }
        }
    }

    /// Validate, persist, and apply one close-and-insert.
    pub fn commit(&self, claim: &KeyClaim<'_>, commit: KeyCommit) -> Result<()> {
        if claim.key != commit.key {
            return Err(StoreError::ClaimMismatch {
                claimed: claim.key.clone(),
                requested: commit.key,
            });
        }

        {
            let existing = self.rows.get(&commit.key);
            let rows = existing.as_deref().map(Vec::as_slice).unwrap_or(&[]);
            check_commit(rows, &commit).map_err(|detail| {
                StoreError::Invariant(InvariantBreach {
                    key: commit.key.clone(),
                    detail,
                })
            })?;
        }

        self.log.append(&commit)?;
        let mut rows = self.rows.entry(commit.key.clone()).or_default();
        apply_commit(rows.value_mut(), commit);
        Ok(())
    }

    // ========================================================================
    // Read Operations
    // ========================================================================

    pub fn current(&self, key: &EntityKey) -> Option<VersionRow> {
        self.rows
            .get(key)
            .and_then(|rows| rows.last().filter(|r| r.is_current).cloned())
    }

    /// Most recent row of `key`, current or not.
    pub fn last_row(&self, key: &EntityKey) -> Option<VersionRow> {
        self.rows.get(key).and_then(|rows| rows.last().cloned())
    }

    pub fn history(&self, key: &EntityKey) -> Vec<VersionRow> {
        self.rows.get(key).map(|rows| rows.clone()).unwrap_or_default()
    }

    /// Row of `key` valid at `at`.
    pub fn as_of(&self, key: &EntityKey, at: Timestamp) -> Option<VersionRow> {
        self.rows
            .get(key)
            .and_then(|rows| rows.iter().find(|r| r.covers(at)).cloned())
    }

    /// Current rows of one entity type, ordered by key.
    pub fn current_rows(&self, entity: &str) -> Vec<VersionRow> {
        let mut rows: Vec<VersionRow> = self
            .rows
            .iter()
            .filter(|e| e.key().entity == entity)
            .filter_map(|e| e.value().last().filter(|r| r.is_current).cloned())
            .collect();
        rows.sort_by(|a, b| a.entity_key.cmp(&b.entity_key));
        rows
    }

    /// Rows of one entity type valid at `at`, ordered by key.
    pub fn rows_as_of(&self, entity: &str, at: Timestamp) -> Vec<VersionRow> {
        let mut rows: Vec<VersionRow> = self
            .rows
            .iter()
            .filter(|e| e.key().entity == entity)
            .filter_map(|e| e.value().iter().find(|r| r.covers(at)).cloned())
            .collect();
        rows.sort_by(|a, b| a.entity_key.cmp(&b.entity_key));
        rows
    }

    pub fn keys(&self) -> Vec<EntityKey> {
        let mut keys: Vec<EntityKey> = self
            .rows
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> HistoryStats {
        let mut stats = HistoryStats::default();
        for entry in self.rows.iter() {
            let rows = entry.value();
            let Some(last) = rows.last() else {
                continue;
            };
            stats.keys += 1;
            stats.rows += rows.len();
            if last.is_current {
                stats.current += 1;
                *stats
                    .current_by_entity
                    .entry(entry.key().entity.clone())
                    .or_default() += 1;
            } else if last.retired {
                stats.retired_keys += 1;
            }
        }
        stats
    }

    pub fn snapshot(&self) -> HistorySnapshot {
        let mut rows: Vec<VersionRow> = self
            .rows
            .iter()
            .flat_map(|e| e.value().clone())
            .collect();
        rows.sort_by(|a, b| {
            a.entity_key
                .cmp(&b.entity_key)
                .then_with(|| a.version.cmp(&b.version))
        });
        HistorySnapshot { rows }
    }

    // ========================================================================
    // Verification
    // ========================================================================

    pub fn verify_key(&self, key: &EntityKey) -> std::result::Result<(), InvariantBreach> {
        match self.rows.get(key) {
            Some(rows) => verify_rows(key, rows.value()),
            None => Ok(()),
        }
    }

    /// Check every key; returns all breaches found.
    pub fn verify_all(&self) -> std::result::Result<(), Vec<InvariantBreach>> {
        let mut breaches: Vec<InvariantBreach> = self
            .rows
            .iter()
            .filter_map(|e| verify_rows(e.key(), e.value()).err())
            .collect();
        if breaches.is_empty() {
            Ok(())
        } else {
            breaches.sort_by(|a, b| a.key.cmp(&b.key));
            Err(breaches)
        }
    }
}

/// Check that applying `commit` to `rows` keeps the history well formed.
fn check_commit(rows: &[VersionRow], commit: &KeyCommit) -> std::result::Result<(), String> {
    let last = rows.last();
    let current = last.filter(|r| r.is_current);

    if let Some(close) = &commit.close {
        let Some(cur) = current else {
            return Err("close requested but the key has no current row".to_string());
        };
        if cur.version != close.version {
            return Err(format!(
                "close targets version {} but the current version is {}",
                close.version, cur.version
            ));
        }
        if close.valid_to < cur.valid_from {
            return Err(format!(
                "valid_to {} precedes valid_from {}",
                close.valid_to, cur.valid_from
            ));
        }
    }

    match &commit.insert {
        Some(row) => {
            if row.entity_key != commit.key {
                return Err(format!("inserted row belongs to {}", row.entity_key));
            }
            if row.surrogate_id != SurrogateId::for_key(&commit.key) {
                return Err(format!("unstable surrogate id {}", row.surrogate_id));
            }
            if !row.is_current
                || row.valid_to.is_some()
                || row.retired
                || row.closed_sequence.is_some()
            {
                return Err("inserted row must be open and current".to_string());
            }
            if current.is_some() && commit.close.is_none() {
                return Err("insert would leave two current rows".to_string());
            }
            let expected = last.map_or(1, |r| r.version + 1);
            if row.version != expected {
                return Err(format!(
                    "inserted version {} but expected {expected}",
                    row.version
                ));
            }
            match (&commit.close, last) {
                (Some(close), _) => {
                    if row.valid_from != close.valid_to {
                        return Err(format!(
                            "new row starts at {} but the closed row ends at {}",
                            row.valid_from, close.valid_to
                        ));
                    }
                }
                (None, Some(prev)) => {
                    let Some(prev_to) = prev.valid_to else {
                        return Err("previous row is open but not current".to_string());
                    };
                    if row.valid_from < prev_to {
                        return Err(format!(
                            "new row starts at {} inside the retired range ending {prev_to}",
                            row.valid_from
                        ));
                    }
                }
                (None, None) => {}
            }
            Ok(())
        }
        None => match &commit.close {
            Some(close) if close.retired => Ok(()),
            Some(_) => Err("close without replacement must retire the key".to_string()),
            None => Err("empty commit".to_string()),
        },
    }
}

fn apply_commit(rows: &mut Vec<VersionRow>, commit: KeyCommit) {
    if let Some(close) = commit.close {
        if let Some(row) = rows.last_mut() {
            row.valid_to = Some(close.valid_to);
            row.is_current = false;
            row.retired = close.retired;
            row.closed_sequence = Some(close.sequence);
            row.audit.updated_by = close.updated_by;
            row.audit.updated_at = close.updated_at;
        }
    }
    if let Some(row) = commit.insert {
        rows.push(row);
    }
}

/// History contiguity for one key: dense versions, no gaps except after a
/// retirement, no overlaps, and at most one (final, open) current row.
pub fn verify_rows(key: &EntityKey, rows: &[VersionRow]) -> std::result::Result<(), InvariantBreach> {
    let breach = |detail: String| InvariantBreach {
        key: key.clone(),
        detail,
    };

    for (idx, row) in rows.iter().enumerate() {
        if &row.entity_key != key {
            return Err(breach(format!("row {} belongs to {}", idx, row.entity_key)));
        }
        if row.version as usize != idx + 1 {
            return Err(breach(format!(
                "version {} at position {}",
                row.version,
                idx + 1
            )));
        }
        match row.valid_to {
            Some(to) if to < row.valid_from => {
                return Err(breach(format!("version {} ends before it starts", row.version)));
            }
            Some(_) if row.is_current => {
                return Err(breach(format!("version {} is current but closed", row.version)));
            }
            None if !row.is_current => {
                return Err(breach(format!("version {} is open but not current", row.version)));
            }
            _ => {}
        }
    }

    for pair in rows.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        let Some(prev_to) = prev.valid_to else {
            return Err(breach(format!(
                "version {} is followed by {} while still open",
                prev.version, next.version
            )));
        };
        if prev.retired {
            if next.valid_from < prev_to {
                return Err(breach(format!(
                    "version {} overlaps retired version {}",
                    next.version, prev.version
                )));
            }
        } else if next.valid_from != prev_to {
            return Err(breach(format!(
                "gap or overlap between versions {} and {}",
                prev.version, next.version
            )));
        }
    }

    if let Some(last) = rows.last() {
        if !last.is_current && !last.retired {
            return Err(breach(format!(
                "latest version {} was closed without a replacement",
                last.version
            )));
        }
    }

    Ok(())
}
