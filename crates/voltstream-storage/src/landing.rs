//! Landing Store: raw, source-shaped change records.
//!
//! Records are immutable once written and never deleted; a newer record with a
//! higher sequence supersedes an older one for the same natural key. The store
//! grows monotonically and absorbs at-least-once re-delivery.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::BufRead;
use std::ops::Bound;
use std::path::Path;

use crate::log::FramedLog;
use crate::{EntityKey, LandingRecord, Result, StoreError};

/// Position in the `(entity, natural_key, sequence)` scan order.
///
/// Doubles as the duplicate identity of a record: `source` is the final
/// component so two sources may share a sequence for the same key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LandingCursor {
    pub entity: String,
    pub natural_key: String,
    pub sequence: u64,
    pub source: String,
}

impl LandingCursor {
    pub fn of(record: &LandingRecord) -> Self {
        Self {
            entity: record.entity.clone(),
            natural_key: record.natural_key.clone(),
            sequence: record.sequence,
            source: record.source.clone(),
        }
    }

    fn key_start(key: &EntityKey) -> Self {
        Self {
            entity: key.entity.clone(),
            natural_key: key.key.clone(),
            sequence: 0,
            source: String::new(),
        }
    }

    fn belongs_to(&self, key: &EntityKey) -> bool {
        self.entity == key.entity && self.natural_key == key.key
    }
}

/// A landing record together with its append offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub offset: u64,
    pub record: LandingRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Accepted { offset: u64 },
    /// Same `(source, entity, natural_key, sequence)` was already landed.
    Duplicate { offset: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendSummary {
    pub accepted: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LandingStats {
    pub records: usize,
    pub keys: usize,
    pub high_water: u64,
    pub by_entity: BTreeMap<String, usize>,
}

#[derive(Default)]
struct LandingState {
    records: BTreeMap<LandingCursor, StoredRecord>,
    /// Key of the record at offset `i + 1`.
    appended: Vec<EntityKey>,
}

impl LandingState {
    fn insert(&mut self, stored: StoredRecord) {
        self.appended.push(stored.record.entity_key());
        self.records.insert(LandingCursor::of(&stored.record), stored);
    }

    fn high_water(&self) -> u64 {
        self.appended.len() as u64
    }

    fn key_range<'a>(
        &'a self,
        key: &'a EntityKey,
    ) -> impl Iterator<Item = &'a StoredRecord> + 'a {
        self.records
            .range(LandingCursor::key_start(key)..)
            .take_while(move |(cursor, _)| cursor.belongs_to(key))
            .map(|(_, stored)| stored)
    }
}

/// Append-only store of landing records.
pub struct LandingStore {
    log: FramedLog,
    state: RwLock<LandingState>,
}

impl LandingStore {
    /// Open (or create) a durable landing store.
    pub fn open(path: &Path, sync_writes: bool) -> Result<Self> {
        let (log, entries) = FramedLog::open::<StoredRecord>(path, sync_writes)?;
        let mut state = LandingState::default();
        for stored in entries {
            let expected = state.high_water() + 1;
            if stored.offset != expected {
                return Err(StoreError::Corrupt {
                    path: path.display().to_string(),
                    offset: stored.offset,
                    message: format!("expected landing offset {expected}"),
                });
            }
            state.insert(stored);
        }
        tracing::debug!(
            path = %path.display(),
            records = state.records.len(),
            "opened landing store"
        );
        Ok(Self {
            log,
            state: RwLock::new(state),
        })
    }

    /// A store that keeps nothing on disk.
    pub fn in_memory() -> Self {
        Self {
            log: FramedLog::memory(),
            state: RwLock::new(LandingState::default()),
        }
    }

    /// Land one record. Re-delivery of an already landed record is absorbed.
    pub fn append(&self, record: LandingRecord) -> Result<AppendOutcome> {
        let cursor = LandingCursor::of(&record);
        let mut state = self.state.write();
        if let Some(existing) = state.records.get(&cursor) {
            tracing::debug!(key = %record.entity_key(), sequence = record.sequence, "duplicate landing record absorbed");
            return Ok(AppendOutcome::Duplicate {
                offset: existing.offset,
            });
        }

        let stored = StoredRecord {
            offset: state.high_water() + 1,
            record,
        };
        self.log.append(&stored)?;
        let offset = stored.offset;
        state.insert(stored);
        Ok(AppendOutcome::Accepted { offset })
    }

    pub fn append_batch(
        &self,
        records: impl IntoIterator<Item = LandingRecord>,
    ) -> Result<AppendSummary> {
        let mut summary = AppendSummary::default();
        for record in records {
            match self.append(record)? {
                AppendOutcome::Accepted { .. } => summary.accepted += 1,
                AppendOutcome::Duplicate { .. } => summary.duplicates += 1,
            }
        }
        Ok(summary)
    }

    /// Land every record of a JSON Lines feed (blank lines are skipped).
    pub fn load_jsonl(&self, path: &Path) -> Result<AppendSummary> {
        let file = std::fs::File::open(path)?;
        let mut records = Vec::new();
        for (idx, line) in std::io::BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: LandingRecord =
                serde_json::from_str(&line).map_err(|e| StoreError::Corrupt {
                    path: path.display().to_string(),
                    offset: idx as u64 + 1,
                    message: format!("line {}: {e}", idx + 1),
                })?;
            records.push(record);
        }
        let summary = self.append_batch(records)?;
        tracing::info!(
            path = %path.display(),
            accepted = summary.accepted,
            duplicates = summary.duplicates,
            "loaded landing feed"
        );
        Ok(summary)
    }

    /// Lazy scan ordered by `(entity, natural_key, sequence)`, resuming strictly
    /// after `cursor` when given. Records landed after the scan started are not
    /// yielded.
    pub fn read_since(&self, cursor: Option<&LandingCursor>) -> LandingScan<'_> {
        LandingScan {
            store: self,
            after: cursor.cloned(),
            bound: self.high_water(),
        }
    }

    /// Keys that received records after `watermark`, plus the current
    /// high-water offset.
    pub fn touched_since(&self, watermark: u64) -> (BTreeSet<EntityKey>, u64) {
        let state = self.state.read();
        let start = usize::try_from(watermark)
            .unwrap_or(usize::MAX)
            .min(state.appended.len());
        let keys = state.appended[start..].iter().cloned().collect();
        (keys, state.high_water())
    }

    /// Every record of `key` with its offset, in `(load_time, sequence)`
    /// apply order.
    pub fn records_for(&self, key: &EntityKey) -> Vec<StoredRecord> {
        let state = self.state.read();
        let mut records: Vec<StoredRecord> = state.key_range(key).cloned().collect();
        records.sort_by(|a, b| {
            a.record
                .apply_order()
                .cmp(&b.record.apply_order())
                .then_with(|| a.record.source.cmp(&b.record.source))
        });
        records
    }

    /// Highest-sequence record of `key`.
    pub fn latest(&self, key: &EntityKey) -> Option<LandingRecord> {
        let state = self.state.read();
        state.key_range(key).last().map(|s| s.record.clone())
    }

    /// Latest record per key for one entity type, ordered by key.
    pub fn latest_by_entity(&self, entity: &str) -> Vec<LandingRecord> {
        let state = self.state.read();
        let mut latest: BTreeMap<&str, &LandingRecord> = BTreeMap::new();
        let start = LandingCursor {
            entity: entity.to_string(),
            natural_key: String::new(),
            sequence: 0,
            source: String::new(),
        };
        for (cursor, stored) in state.records.range(start..) {
            if cursor.entity != entity {
                break;
            }
            // Scan order is ascending by sequence, so the last one wins.
            latest.insert(cursor.natural_key.as_str(), &stored.record);
        }
        latest.into_values().cloned().collect()
    }

    pub fn high_water(&self) -> u64 {
        self.state.read().high_water()
    }

    pub fn stats(&self) -> LandingStats {
        let state = self.state.read();
        let mut by_entity: BTreeMap<String, usize> = BTreeMap::new();
        let mut keys: BTreeSet<(&str, &str)> = BTreeSet::new();
        for cursor in state.records.keys() {
            *by_entity.entry(cursor.entity.clone()).or_default() += 1;
            keys.insert((cursor.entity.as_str(), cursor.natural_key.as_str()));
        }
        LandingStats {
            records: state.records.len(),
            keys: keys.len(),
            high_water: state.high_water(),
            by_entity,
        }
    }
}

/// Lazy, restartable landing scan (see [`LandingStore::read_since`]).
pub struct LandingScan<'a> {
    store: &'a LandingStore,
    after: Option<LandingCursor>,
    bound: u64,
}

impl LandingScan<'_> {
    /// Cursor of the last yielded record; pass it back to resume.
    pub fn cursor(&self) -> Option<&LandingCursor> {
        self.after.as_ref()
    }
}

impl Iterator for LandingScan<'_> {
    type Item = (LandingCursor, LandingRecord);

    fn next(&mut self) -> Option<Self::Item> {
        let state = self.store.state.read();
        let lower = match &self.after {
            Some(cursor) => Bound::Excluded(cursor.clone()),
            None => Bound::Unbounded,
        };
        let (cursor, stored) = state
            .records
            .range((lower, Bound::Unbounded))
            .find(|(_, stored)| stored.offset <= self.bound)?;
        let item = (cursor.clone(), stored.record.clone());
        drop(state);
        self.after = Some(item.0.clone());
        Some(item)
    }
}
