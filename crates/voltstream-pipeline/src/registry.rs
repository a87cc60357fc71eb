//! Named projections, each runnable on its own and checkable against a
//! minimum row count.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::projection::{self, Projection, ProjectionError, ProjectionInput};

pub type ProjectionFn = fn(&ProjectionInput<'_>) -> Projection;

#[derive(Clone)]
pub struct QueryDefinition {
    pub name: &'static str,
    pub description: &'static str,
    /// Rows the query must return to pass (0 = only has to run).
    pub min_rows: usize,
    pub run: ProjectionFn,
}

impl std::fmt::Debug for QueryDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryDefinition")
            .field("name", &self.name)
            .field("min_rows", &self.min_rows)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCheck {
    pub name: String,
    pub rows: usize,
    pub min_rows: usize,
    pub passed: bool,
}

#[derive(Debug, Clone)]
pub struct QueryRegistry {
    queries: Vec<QueryDefinition>,
}

impl Default for QueryRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl QueryRegistry {
    pub fn empty() -> Self {
        Self {
            queries: Vec::new(),
        }
    }

    /// The dashboard's projections.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(
            "line_daily_efficiency",
            "Efficiency and OEE/OPE gap per production line per day",
            1,
            projection::line_daily_efficiency,
        );
        registry.register(
            "ope_by_line",
            "OPE metrics aggregated by production line",
            1,
            projection::ope_by_line,
        );
        registry.register(
            "ope_latest_metrics",
            "Latest day OPE metrics",
            1,
            projection::ope_latest_metrics,
        );
        registry.register(
            "daily_trend",
            "Daily trend data for time series charts",
            1,
            projection::daily_trend,
        );
        registry.register(
            "env_trend",
            "Environmental trend data",
            1,
            projection::env_trend,
        );
        registry.register(
            "quick_stats",
            "Quick stats for the last 7 days relative to the data",
            1,
            projection::quick_stats,
        );
        registry.register(
            "throughput_by_line",
            "Throughput loss aggregated by production line",
            1,
            projection::throughput_by_line,
        );
        registry.register(
            "throughput_economics",
            "Throughput economics with financial impact of the OPE gap",
            1,
            projection::throughput_economics,
        );
        registry.register(
            "line_flow_health",
            "Flow volume and health status per line over the last 7 days",
            1,
            projection::line_flow_health,
        );
        registry.register(
            "littles_law_metrics",
            "WIP and throughput divergence per line and day",
            0,
            projection::littles_law_metrics,
        );
        registry.register(
            "asset_current",
            "Current-state asset dimension",
            0,
            projection::asset_current,
        );
        registry.register(
            "asset_status_summary",
            "Current assets grouped by type and status",
            0,
            projection::asset_status_summary,
        );
        registry
    }

    /// Add a query; a query with the same name is replaced.
    pub fn register(
        &mut self,
        name: &'static str,
        description: &'static str,
        min_rows: usize,
        run: ProjectionFn,
    ) {
        let definition = QueryDefinition {
            name,
            description,
            min_rows,
            run,
        };
        match self.queries.iter_mut().find(|q| q.name == name) {
            Some(existing) => *existing = definition,
            None => self.queries.push(definition),
        }
    }

    pub fn get(&self, name: &str) -> Option<&QueryDefinition> {
        self.queries.iter().find(|q| q.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueryDefinition> {
        self.queries.iter()
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn run(&self, name: &str, input: &ProjectionInput<'_>) -> Result<Projection, ProjectionError> {
        let query = self
            .get(name)
            .ok_or_else(|| ProjectionError::UnknownProjection(name.to_string()))?;
        Ok((query.run)(input))
    }

    /// Run every query and compare its row count with `min_rows`.
    pub fn check_all(&self, input: &ProjectionInput<'_>) -> Vec<QueryCheck> {
        self.queries
            .iter()
            .map(|query| {
                let rows = (query.run)(input).len();
                let passed = rows >= query.min_rows;
                if !passed {
                    tracing::warn!(query = query.name, rows, min_rows = query.min_rows, "query check failed");
                }
                QueryCheck {
                    name: query.name.to_string(),
                    rows,
                    min_rows: query.min_rows,
                    passed,
                }
            })
            .collect()
    }

    /// Recompute every projection and write it under `dir`.
    pub fn refresh(
        &self,
        input: &ProjectionInput<'_>,
        dir: &Path,
    ) -> Result<Vec<PathBuf>, ProjectionError> {
        let mut written = Vec::with_capacity(self.queries.len());
        for query in &self.queries {
            let projection = (query.run)(input);
            let path = projection.write_json(dir)?;
            tracing::debug!(query = query.name, rows = projection.len(), path = %path.display(), "projection written");
            written.push(path);
        }
        tracing::info!(projections = written.len(), dir = %dir.display(), "projections refreshed");
        Ok(written)
    }
}
