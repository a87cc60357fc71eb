//! Service providers
//!
//! In-process services over the projection registry and knowledge index,
//! canned mocks for tests, and hosted JSON services behind `http`.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;

use voltstream_ingest_docs::{KnowledgeIndex, SearchQuery};
use voltstream_pipeline::{Projection, ProjectionInput, QueryRegistry};

use crate::spec::normalize;
use crate::{
    AgentError, MetricQueryService, MetricResult, Passage, Result, SemanticSearchService,
    ServiceRequest,
};

// ============================================================================
// Local metrics
// ============================================================================

/// Answers metric questions from precomputed projections, picking the
/// projection whose topic words best match the question.
pub struct LocalMetricService {
    projections: BTreeMap<String, Projection>,
    /// Projection name -> topic words, in tie-break order.
    topics: Vec<(String, Vec<String>)>,
    fallback: String,
}

fn default_topics() -> Vec<(String, Vec<String>)> {
    let topic = |name: &str, words: &[&str]| {
        (
            name.to_string(),
            words.iter().map(|w| w.to_string()).collect::<Vec<_>>(),
        )
    };
    vec![
        topic("throughput_by_line", &["throughput", "loss", "cost", "dollar", "units", "revenue"]),
        topic("env_trend", &["humidity", "dust", "environment", "environmental", "sensor", "err 99"]),
        topic("asset_status_summary", &["asset", "assets", "status", "fleet"]),
        topic("quick_stats", &["week", "last 7", "summary", "overview", "kpi"]),
        topic("daily_trend", &["trend", "daily", "day", "over time", "yesterday"]),
        topic("line_daily_efficiency", &["efficiency", "planned", "actual"]),
        topic("ope_by_line", &["ope", "oee", "line", "lines", "starvation", "failures", "downtime"]),
        topic("line_flow_health", &["blocked", "constrained", "bottleneck", "health", "flow"]),
        topic("littles_law_metrics", &["wip", "work in progress", "cycle time", "work orders"]),
    ]
}

impl LocalMetricService {
    pub fn new(projections: Vec<Projection>) -> Self {
        Self {
            projections: projections.into_iter().map(|p| (p.name.clone(), p)).collect(),
            topics: default_topics(),
            fallback: "ope_by_line".to_string(),
        }
    }

    /// Evaluate every registered query once.
    pub fn compute(registry: &QueryRegistry, input: &ProjectionInput<'_>) -> Self {
        Self::new(registry.iter().map(|q| (q.run)(input)).collect())
    }

    /// Best-matching available projection for `question`.
    pub fn select(&self, question: &str) -> Option<&Projection> {
        let q = normalize(question);
        let mut best: Option<(usize, &str)> = None;
        for (name, words) in &self.topics {
            if !self.projections.contains_key(name) {
                continue;
            }
            let hits = words
                .iter()
                .filter(|w| q.contains(normalize(w).as_str()))
                .count();
            if hits > 0 && best.map_or(true, |(b, _)| hits > b) {
                best = Some((hits, name));
            }
        }
        match best {
            Some((_, name)) => self.projections.get(name),
            None => self.projections.get(&self.fallback),
        }
    }
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl MetricQueryService for LocalMetricService {
    async fn query(&self, request: &ServiceRequest) -> Result<MetricResult> {
        let projection = self
            .select(&request.text)
            .ok_or_else(|| AgentError::service("local metrics", "no projection matches the question"))?;

        let mut columns_for_filters = Vec::with_capacity(request.filters.len());
        for (column, value) in &request.filters {
            let idx = projection
                .columns
                .iter()
                .position(|c| c == column)
                .ok_or_else(|| {
                    AgentError::service(
                        "local metrics",
                        format!("{} has no column `{column}`", projection.name),
                    )
                })?;
            columns_for_filters.push((idx, value));
        }

        let mut rows: Vec<Vec<Value>> = projection
            .rows
            .iter()
            .filter(|row| {
                columns_for_filters
                    .iter()
                    .all(|(idx, value)| row.get(*idx).map(cell_text).as_deref() == Some(value.as_str()))
            })
            .cloned()
            .collect();

        let total = rows.len();
        let mut message = None;
        if let Some(limit) = request.limit {
            if total > limit {
                rows.truncate(limit);
                message = Some(format!("showing {limit} of {total} rows"));
            }
        }
        tracing::debug!(projection = %projection.name, rows = rows.len(), "local metric query");

        Ok(MetricResult {
            source: projection.name.clone(),
            columns: projection.columns.clone(),
            rows,
            message,
        })
    }
}

// ============================================================================
// Local search
// ============================================================================

pub struct LocalSearchService {
    index: KnowledgeIndex,
}

impl LocalSearchService {
    pub fn new(index: KnowledgeIndex) -> Self {
        Self { index }
    }

    pub fn index(&self) -> &KnowledgeIndex {
        &self.index
    }
}

#[async_trait]
impl SemanticSearchService for LocalSearchService {
    async fn search(&self, request: &ServiceRequest) -> Result<Vec<Passage>> {
        let query = SearchQuery {
            text: request.text.clone(),
            filters: request.filters.clone(),
            limit: request.limit,
        };
        Ok(self
            .index
            .search(&query)
            .into_iter()
            .map(|hit| Passage {
                chunk_id: hit.chunk_id,
                document_name: hit.document_name,
                text: hit.text,
                score: hit.score,
                attributes: hit.attributes,
            })
            .collect())
    }
}

// ============================================================================
// Mocks
// ============================================================================

/// Returns a canned result and remembers every request.
pub struct MockMetricService {
    response: std::result::Result<MetricResult, String>,
    requests: Mutex<Vec<ServiceRequest>>,
}

impl MockMetricService {
    pub fn returning(result: MetricResult) -> Self {
        Self {
            response: Ok(result),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            response: Err(message.to_string()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ServiceRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl MetricQueryService for MockMetricService {
    async fn query(&self, request: &ServiceRequest) -> Result<MetricResult> {
        self.requests.lock().push(request.clone());
        self.response
            .clone()
            .map_err(|message| AgentError::service("mock metrics", message))
    }
}

pub struct MockSearchService {
    response: std::result::Result<Vec<Passage>, String>,
    requests: Mutex<Vec<ServiceRequest>>,
}

impl MockSearchService {
    pub fn returning(passages: Vec<Passage>) -> Self {
        Self {
            response: Ok(passages),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            response: Err(message.to_string()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ServiceRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl SemanticSearchService for MockSearchService {
    async fn search(&self, request: &ServiceRequest) -> Result<Vec<Passage>> {
        self.requests.lock().push(request.clone());
        let mut passages = self
            .response
            .clone()
            .map_err(|message| AgentError::service("mock search", message))?;
        if let Some(limit) = request.limit {
            passages.truncate(limit);
        }
        Ok(passages)
    }
}

// ============================================================================
// Hosted services (JSON over HTTP)
// ============================================================================

#[cfg(feature = "http")]
mod http {
    use super::*;
    use reqwest::Client;
    use serde::Deserialize;
    use std::time::Duration;

    fn client(timeout: Duration) -> Result<Client> {
        Ok(Client::builder().timeout(timeout).build()?)
    }

    async fn post<T: serde::de::DeserializeOwned>(
        client: &Client,
        endpoint: &str,
        token: Option<&str>,
        request: &ServiceRequest,
    ) -> Result<T> {
        let mut call = client.post(endpoint).json(request);
        if let Some(token) = token {
            call = call.bearer_auth(token);
        }
        let response = call.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::service(endpoint, format!("{status}: {body}")));
        }
        Ok(response.json::<T>().await?)
    }

    /// POSTs the request as JSON; expects a `MetricResult` body.
    pub struct HttpMetricService {
        client: Client,
        endpoint: String,
        token: Option<String>,
    }

    impl HttpMetricService {
        pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
            Ok(Self {
                client: client(timeout)?,
                endpoint: endpoint.to_string(),
                token: None,
            })
        }

        pub fn with_bearer_token(mut self, token: &str) -> Self {
            self.token = Some(token.to_string());
            self
        }
    }

    #[async_trait]
    impl MetricQueryService for HttpMetricService {
        async fn query(&self, request: &ServiceRequest) -> Result<MetricResult> {
            post(&self.client, &self.endpoint, self.token.as_deref(), request).await
        }
    }

    /// Accepts either `{"results": [...]}` or a bare passage list.
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SearchResponse {
        Wrapped { results: Vec<Passage> },
        Bare(Vec<Passage>),
    }

    pub struct HttpSearchService {
        client: Client,
        endpoint: String,
        token: Option<String>,
    }

    impl HttpSearchService {
        pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
            Ok(Self {
                client: client(timeout)?,
                endpoint: endpoint.to_string(),
                token: None,
            })
        }

        pub fn with_bearer_token(mut self, token: &str) -> Self {
            self.token = Some(token.to_string());
            self
        }
    }

    #[async_trait]
    impl SemanticSearchService for HttpSearchService {
        async fn search(&self, request: &ServiceRequest) -> Result<Vec<Passage>> {
            let response: SearchResponse =
                post(&self.client, &self.endpoint, self.token.as_deref(), request).await?;
            Ok(match response {
                SearchResponse::Wrapped { results } => results,
                SearchResponse::Bare(results) => results,
            })
        }
    }
}

#[cfg(feature = "http")]
pub use http::{HttpMetricService, HttpSearchService};
