//! VoltStream pipeline: landing records in, versioned entities and projections out.
//!
//! ```text
//! ┌──────────────┐  touched keys   ┌─────────────┐  close+insert  ┌──────────────┐
//! │ LandingStore │ ──────────────► │ Transformer │ ─────────────► │ HistoryStore │
//! └──────────────┘  since offset   │ (rayon, per │  per key       └──────┬───────┘
//!        │                         │  key claim) │                       │
//!        │ fact records            └─────────────┘                       │ current /
//!        ▼                                                               │ as-of rows
//! ┌──────────────────────────────────────────────────────────────────────▼───────┐
//! │ projection: pure functions over both stores ──► QueryRegistry ──► *.json     │
//! └──────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The transformer only touches entity types listed in [`PipelineConfig`];
//! everything else that lands (for example the `shift_metrics` fact stream)
//! stays landing-only and is read directly by the projections.

pub mod checkpoint;
pub mod projection;
pub mod registry;
pub mod transform;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use voltstream_storage::{InvariantBreach, StoreError, Timestamp};

pub use checkpoint::{StagedPass, TransformState};
pub use projection::{Projection, ProjectionError, ProjectionInput};
pub use registry::{QueryCheck, QueryDefinition, QueryRegistry};
pub use transform::{
    diff_attributes, CancelFlag, FieldChange, RunOptions, TransformReport, Transformer,
};

// ============================================================================
// Configuration
// ============================================================================

/// A managed (history-tracked) entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySpec {
    pub name: String,
    /// Payload field -> referenced entity type. Resolved to `<field>_sk`.
    #[serde(default)]
    pub references: BTreeMap<String, String>,
}

impl EntitySpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            references: BTreeMap::new(),
        }
    }

    pub fn referencing(mut self, field: &str, target: &str) -> Self {
        self.references.insert(field.to_string(), target.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Entity types the transformer versions.
    pub entities: Vec<EntitySpec>,
    /// Worker threads; each key is owned by exactly one worker per run.
    pub workers: usize,
    /// Written into the audit columns.
    pub actor: String,
    /// Landing entity holding per-shift production facts.
    pub metrics_entity: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            entities: vec![
                EntitySpec::new("site"),
                EntitySpec::new("production_line").referencing("site_code", "site"),
                EntitySpec::new("asset")
                    .referencing("site_code", "site")
                    .referencing("production_line_id", "production_line"),
                EntitySpec::new("product"),
                EntitySpec::new("work_order")
                    .referencing("product_sku", "product")
                    .referencing("production_line_id", "production_line"),
            ],
            workers: 4,
            actor: "voltstream-transform".to_string(),
            metrics_entity: "shift_metrics".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn entity(&self, name: &str) -> Option<&EntitySpec> {
        self.entities.iter().find(|e| e.name == name)
    }

    pub fn is_managed(&self, name: &str) -> bool {
        self.entity(name).is_some()
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Source of audit timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        chrono::Utc::now()
    }
}

/// Always returns the same instant, so two runs produce identical rows.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub Timestamp);

impl Clock for FixedClock {
    fn now(&self) -> Timestamp {
        self.0
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("entity type `{0}` is not managed by the pipeline")]
    UnknownEntity(String),
    #[error("fatal history invariant breach, manual repair required: {0}")]
    Invariant(InvariantBreach),
    #[error("failed to start worker pool: {0}")]
    Pool(String),
    #[error("checkpoint {path}: {message}")]
    Checkpoint { path: String, message: String },
}

impl TransformError {
    /// Breaches are never retried; they stop the run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransformError::Invariant(_) | TransformError::Store(StoreError::Invariant(_))
        )
    }

    pub(crate) fn into_fatal(self) -> Self {
        match self {
            TransformError::Store(StoreError::Invariant(breach)) => {
                TransformError::Invariant(breach)
            }
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransformError>;
