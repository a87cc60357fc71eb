//! Declarative agent configuration (`agent_spec.json`).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::{AgentError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Metrics,
    Knowledge,
    DiagnoseThenRecommend,
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Metrics => write!(f, "metrics"),
            Route::Knowledge => write!(f, "knowledge"),
            Route::DiagnoseThenRecommend => write!(f, "diagnose_then_recommend"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
}

/// Phrases matched on word boundaries, case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingKeywords {
    pub metrics: Vec<String>,
    pub knowledge: Vec<String>,
    pub diagnose: Vec<String>,
}

fn owned(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

impl Default for RoutingKeywords {
    fn default() -> Self {
        Self {
            metrics: owned(&[
                "oee", "ope", "efficiency", "average", "avg", "how many", "total", "trend",
                "throughput", "loss", "starvation", "downtime", "failures", "count", "rate",
                "humidity", "dust", "last week", "by line", "which line",
            ]),
            knowledge: owned(&[
                "how do i", "how to", "procedure", "manual", "sop", "steps", "clean",
                "calibrate", "replace", "maintenance", "troubleshoot", "fix", "what does",
                "meaning", "instructions",
            ]),
            diagnose: owned(&[
                "why", "root cause", "diagnose", "what should", "recommend", "what caused",
            ]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSpec {
    pub name: String,
    pub metric_tool: ToolSpec,
    pub search_tool: ToolSpec,
    pub routing: RoutingKeywords,
    /// Route for a question no keyword matches.
    pub default_route: Route,
    pub search_limit: usize,
    pub metric_row_limit: usize,
    /// Rows / passages quoted in the composed answer.
    pub answer_preview: usize,
    /// Error codes recognized in question text and metric cells.
    pub error_code_pattern: String,
    /// Count columns that imply a code when positive.
    pub error_code_columns: BTreeMap<String, String>,
}

impl Default for AgentSpec {
    fn default() -> Self {
        let mut error_code_columns = BTreeMap::new();
        error_code_columns.insert("total_err_99".to_string(), "AGV-ERR-99".to_string());
        error_code_columns.insert("agv_err_99_count".to_string(), "AGV-ERR-99".to_string());

        Self {
            name: "voltstream_ope_agent".to_string(),
            metric_tool: ToolSpec {
                name: "ope_analyst".to_string(),
                description: "Production metrics: OEE/OPE, starvation, AGV failures, \
                              throughput loss, environment readings"
                    .to_string(),
            },
            search_tool: ToolSpec {
                name: "knowledge_search".to_string(),
                description: "Maintenance manuals, SOPs and troubleshooting guides".to_string(),
            },
            routing: RoutingKeywords::default(),
            default_route: Route::Knowledge,
            search_limit: 5,
            metric_row_limit: 20,
            answer_preview: 3,
            error_code_pattern: r"(?i)\b[A-Z]{2,5}-ERR-\d{2,3}\b".to_string(),
            error_code_columns,
        }
    }
}

impl AgentSpec {
    pub fn load(path: &Path) -> Result<Self> {
        let spec: Self = serde_json::from_slice(&fs::read(path)?)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.metric_tool.name.is_empty() || self.search_tool.name.is_empty() {
            return Err(AgentError::Spec("tool names must not be empty".to_string()));
        }
        if self.metric_tool.name == self.search_tool.name {
            return Err(AgentError::Spec(format!(
                "metric and search tools share the name `{}`",
                self.metric_tool.name
            )));
        }
        if self.search_limit == 0 {
            return Err(AgentError::Spec("search_limit must be positive".to_string()));
        }
        self.error_code_regex()?;
        Ok(())
    }

    pub(crate) fn error_code_regex(&self) -> Result<Regex> {
        Regex::new(&self.error_code_pattern)
            .map_err(|e| AgentError::Spec(format!("error_code_pattern: {e}")))
    }

    /// Pick a route from keyword hits. A diagnose phrase, or both metric
    /// and knowledge phrases, means diagnose-then-recommend.
    pub fn route(&self, question: &str) -> Route {
        let q = normalize(question);
        let hits = |words: &[String]| {
            words
                .iter()
                .map(|w| normalize(w))
                .filter(|w| !w.trim().is_empty() && q.contains(w.as_str()))
                .count()
        };

        let metrics = hits(&self.routing.metrics);
        let knowledge = hits(&self.routing.knowledge);
        let diagnose = hits(&self.routing.diagnose);
        tracing::debug!(metrics, knowledge, diagnose, "routing keyword hits");

        match (metrics > 0, knowledge > 0) {
            _ if diagnose > 0 => Route::DiagnoseThenRecommend,
            (true, true) => Route::DiagnoseThenRecommend,
            (true, false) => Route::Metrics,
            (false, true) => Route::Knowledge,
            (false, false) => self.default_route,
        }
    }
}

/// `"Why is OPE low?"` -> `" why is ope low "`.
pub(crate) fn normalize(text: &str) -> String {
    let words: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    format!(" {} ", words.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_by_keywords() {
        let spec = AgentSpec::default();
        assert_eq!(spec.route("What is the average OPE by line?"), Route::Metrics);
        assert_eq!(spec.route("How do I clean the LiDAR lens?"), Route::Knowledge);
        assert_eq!(
            spec.route("Why did line 2 lose output yesterday?"),
            Route::DiagnoseThenRecommend
        );
        assert_eq!(
            spec.route("AGV failures are up, which maintenance procedure applies?"),
            Route::DiagnoseThenRecommend
        );
        assert_eq!(spec.route("hello"), Route::Knowledge);
        // "ope" must not fire inside "open".
        assert_eq!(spec.route("Is the gate open?"), Route::Knowledge);
    }

    #[test]
    fn default_pattern_matches_codes() {
        let re = AgentSpec::default().error_code_regex().unwrap();
        let found: Vec<&str> = re.find_iter("saw AGV-ERR-99 and agv-err-42").map(|m| m.as_str()).collect();
        assert_eq!(found, vec!["AGV-ERR-99", "agv-err-42"]);
    }

    #[test]
    fn rejects_clashing_tool_names() {
        let mut spec = AgentSpec::default();
        spec.search_tool.name = spec.metric_tool.name.clone();
        assert!(matches!(spec.validate(), Err(AgentError::Spec(_))));
    }

    #[test]
    fn spec_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent").join("agent_spec.json");
        let mut spec = AgentSpec::default();
        spec.default_route = Route::Metrics;
        spec.save(&path).unwrap();
        assert_eq!(AgentSpec::load(&path).unwrap(), spec);
    }
}
