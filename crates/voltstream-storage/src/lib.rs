//! VoltStream storage layer
//!
//! Two stores sit under the transformation pipeline:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         STORAGE                                     │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │  source feeds ──► ┌──────────────┐          ┌──────────────────┐    │
//! │  (at-least-once)  │   Landing    │  read    │  History-tracked │    │
//! │                   │   Store      │────────► │  Entity Store    │    │
//! │                   │ (landing.log)│ (pipeline│  (history.log)   │    │
//! │                   └──────────────┘  crate)  └──────────────────┘    │
//! │                      append-only               close + insert       │
//! │                      never deleted             per key, atomic      │
//! │                                                                     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Features
//!
//! - **Framed logs**: both stores persist through a length-prefixed CBOR log
//!   (see [`log`]); a torn trailing frame is dropped on open.
//! - **Idempotent landing**: re-delivered records are absorbed, not duplicated.
//! - **Effective-dated history**: one current row per business key, closed rows
//!   form a contiguous `[valid_from, valid_to)` chain.
//! - **Key claims**: exclusive per-key write guards for parallel workers.

pub mod history;
pub mod landing;
pub mod log;


use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

pub use history::{
    CloseRow, HistorySnapshot, HistoryStats, HistoryStore, InvariantBreach, KeyClaim, KeyCommit,
};
pub use landing::{
    AppendOutcome, AppendSummary, LandingCursor, LandingScan, LandingStats, LandingStore,
    StoredRecord,
};
pub use log::FramedLog;

// ============================================================================
// Core Types
// ============================================================================

/// Attribute set carried by landing payloads and version rows.
///
/// `BTreeMap` keeps field order stable, which keeps diffs and projections
/// deterministic.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Timestamps are always UTC.
pub type Timestamp = DateTime<Utc>;

/// Field names owned by the history store. Payload fields with these names are
/// never diffed or merged.
pub const BOOKKEEPING_FIELDS: &[&str] = &[
    "valid_from",
    "valid_to",
    "is_current",
    "retired",
    "version",
    "source_sequence",
    "created_by",
    "created_at",
    "updated_by",
    "updated_at",
];

/// Returns true when `field` is reserved for history bookkeeping.
pub fn is_bookkeeping_field(field: &str) -> bool {
    BOOKKEEPING_FIELDS.contains(&field)
}

/// Natural/business key, scoped by entity type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity: String,
    pub key: String,
}

impl EntityKey {
    pub fn new(entity: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity, self.key)
    }
}

/// Stable surrogate identifier for a business key.
///
/// Derived from a digest of the key instead of allocated, so independent
/// workers agree on it without coordination and it survives rebuilds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SurrogateId(pub u64);

impl SurrogateId {
    pub fn for_key(key: &EntityKey) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(key.entity.as_bytes());
        hasher.update([0u8]);
        hasher.update(key.key.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        Self(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for SurrogateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Change-data-capture operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// A raw, source-shaped record as delivered by a source feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandingRecord {
    pub source: String,
    pub entity: String,
    pub natural_key: String,
    pub operation: Operation,
    pub sequence: u64,
    #[serde(default)]
    pub payload: Attributes,
    pub load_time: Timestamp,
}

impl LandingRecord {
    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(self.entity.clone(), self.natural_key.clone())
    }

    /// Position used when applying records of one key: `(load_time, sequence)`.
    pub fn apply_order(&self) -> (Timestamp, u64) {
        (self.load_time, self.sequence)
    }
}

/// Audit columns on every version row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Audit {
    pub created_by: String,
    pub created_at: Timestamp,
    pub updated_by: String,
    pub updated_at: Timestamp,
}

/// One effective-dated version of a business entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRow {
    pub surrogate_id: SurrogateId,
    pub entity_key: EntityKey,
    /// Dense, 1-based version number within the key.
    pub version: u32,
    pub attributes: Attributes,
    pub valid_from: Timestamp,
    pub valid_to: Option<Timestamp>,
    pub is_current: bool,
    /// Set when the row was closed by a delete.
    pub retired: bool,
    /// Landing sequence of the record that produced this row.
    pub source_sequence: u64,
    /// Landing sequence of the record that closed this row.
    #[serde(default)]
    pub closed_sequence: Option<u64>,
    pub audit: Audit,
}

impl VersionRow {
    /// Whether the row's validity interval contains `at`.
    pub fn covers(&self, at: Timestamp) -> bool {
        self.valid_from <= at && self.valid_to.map_or(true, |to| at < to)
    }

    /// `(load_time, sequence)` of the last landing record reflected in this
    /// row: the one that closed it, or the one that opened it.
    pub fn applied_through(&self) -> (Timestamp, u64) {
        match (self.valid_to, self.closed_sequence) {
            (Some(to), Some(seq)) => (to, seq),
            _ => (self.valid_from, self.source_sequence),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode log frame: {0}")]
    Encode(String),
    #[error("corrupt log {path} at byte {offset}: {message}")]
    Corrupt {
        path: String,
        offset: u64,
        message: String,
    },
    #[error("key {0} is already claimed by another worker")]
    KeyBusy(EntityKey),
    #[error("claim for {claimed} cannot commit to {requested}")]
    ClaimMismatch {
        claimed: EntityKey,
        requested: EntityKey,
    },
    #[error("history invariant violated: {0}")]
    Invariant(InvariantBreach),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ============================================================================
// Storage Configuration
// ============================================================================

/// Locations and durability settings for both stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the landing store log
    pub landing_log: PathBuf,
    /// Path to the history store log
    pub history_log: PathBuf,
    /// `sync_data` after every frame
    pub sync_writes: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            landing_log: PathBuf::from("./landing/landing.log"),
            history_log: PathBuf::from("./history/history.log"),
            sync_writes: true,
        }
    }
}

impl StorageConfig {
    /// Standard layout under one environment directory.
    pub fn under(dir: &Path) -> Self {
        Self {
            landing_log: dir.join("landing").join("landing.log"),
            history_log: dir.join("history").join("history.log"),
            ..Default::default()
        }
    }
}

/// Open (or create) both stores described by `config`.
pub fn open_stores(config: &StorageConfig) -> Result<(LandingStore, HistoryStore)> {
    let landing = LandingStore::open(&config.landing_log, config.sync_writes)?;
    let history = HistoryStore::open(&config.history_log, config.sync_writes)?;
    Ok((landing, history))
}
