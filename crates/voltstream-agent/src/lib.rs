//! Orchestration agent for VoltStream questions
//!
//! The agent owns no analytics of its own. It decides which capability a
//! question needs and records every call it makes:
//!
//! ```text
//!                 ┌──────────────┐
//!   question ───▶ │  AgentSpec   │ ── route ──┐
//!                 │  (keywords)  │            │
//!                 └──────────────┘            ▼
//!        Metrics ──▶ MetricQueryService ──────────────┐
//!        Knowledge ─▶ SemanticSearchService ──────────┤──▶ AgentReply
//!        Diagnose ──▶ metrics, then search + codes ───┘    (answer + sub_queries)
//! ```
//!
//! Both capabilities are async traits so hosted services (`http` feature)
//! and the in-process stores are interchangeable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod agent;
pub mod providers;
pub mod spec;

pub use agent::{Agent, AgentReply, SubQuery};
pub use providers::{LocalMetricService, LocalSearchService, MockMetricService, MockSearchService};
#[cfg(feature = "http")]
pub use providers::{HttpMetricService, HttpSearchService};
pub use spec::{AgentSpec, Route, RoutingKeywords, ToolSpec};

// ============================================================================
// Service contracts
// ============================================================================

/// Request shared by both collaborators: text plus optional filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub text: String,
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ServiceRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Structured result set from the metric collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricResult {
    /// Which projection (or hosted query) produced the rows.
    pub source: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    pub message: Option<String>,
}

impl MetricResult {
    pub fn value(&self, row: usize, column: &str) -> Option<&serde_json::Value> {
        let col = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(col)
    }
}

/// One ranked passage from the search collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub chunk_id: String,
    pub document_name: String,
    pub text: String,
    pub score: f64,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[async_trait]
pub trait MetricQueryService: Send + Sync {
    /// Answer a numeric question with a result set.
    async fn query(&self, request: &ServiceRequest) -> Result<MetricResult>;
}

#[async_trait]
pub trait SemanticSearchService: Send + Sync {
    /// Rank passages for a procedural question.
    async fn search(&self, request: &ServiceRequest) -> Result<Vec<Passage>>;
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("question is empty")]
    EmptyQuestion,
    #[error("{tool} failed: {message}")]
    Service { tool: String, message: String },
    #[error("invalid agent spec: {0}")]
    Spec(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "http")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl AgentError {
    pub fn service(tool: &str, message: impl Into<String>) -> Self {
        Self::Service {
            tool: tool.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
