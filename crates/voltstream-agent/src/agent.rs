//! Question answering over the two collaborators, with an audit trail.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::spec::{AgentSpec, Route};
use crate::{
    AgentError, MetricQueryService, MetricResult, Passage, Result, SemanticSearchService,
    ServiceRequest,
};

const EXCERPT_CHARS: usize = 240;

/// One collaborator call as issued, with its raw result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubQuery {
    pub tool: String,
    pub request: ServiceRequest,
    pub ok: bool,
    /// The service's response, or `{"error": ...}`.
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    pub question: String,
    pub answer: String,
    pub route: Route,
    /// In issue order.
    pub sub_queries: Vec<SubQuery>,
}

pub struct Agent {
    spec: AgentSpec,
    error_codes: Regex,
    metrics: Box<dyn MetricQueryService>,
    search: Box<dyn SemanticSearchService>,
}

impl Agent {
    pub fn new(
        spec: AgentSpec,
        metrics: Box<dyn MetricQueryService>,
        search: Box<dyn SemanticSearchService>,
    ) -> Result<Self> {
        spec.validate()?;
        let error_codes = spec.error_code_regex()?;
        Ok(Self {
            spec,
            error_codes,
            metrics,
            search,
        })
    }

    pub fn spec(&self) -> &AgentSpec {
        &self.spec
    }

    pub async fn ask(&self, question: &str) -> Result<AgentReply> {
        let question = question.trim();
        if question.is_empty() {
            return Err(AgentError::EmptyQuestion);
        }

        let route = self.spec.route(question);
        tracing::info!(%route, question, "routing question");

        let mut sub_queries = Vec::new();
        let answer = match route {
            Route::Metrics => {
                let metrics = self.call_metrics(question, &mut sub_queries).await;
                self.metric_section(&metrics)
            }
            Route::Knowledge => {
                let passages = self.call_search(question.to_string(), &mut sub_queries).await;
                self.passage_section(&passages)
            }
            Route::DiagnoseThenRecommend => {
                let metrics = self.call_metrics(question, &mut sub_queries).await;

                let mut codes = self.codes_in_text(question);
                if let Ok(result) = &metrics {
                    for code in self.codes_in_result(result) {
                        if !codes.contains(&code) {
                            codes.push(code);
                        }
                    }
                }
                let search_text = if codes.is_empty() {
                    question.to_string()
                } else {
                    format!("{question} {}", codes.join(" "))
                };
                let passages = self.call_search(search_text, &mut sub_queries).await;

                let mut answer = format!("Diagnosis\n{}", self.metric_section(&metrics));
                if !codes.is_empty() {
                    answer.push_str(&format!("\nError codes involved: {}", codes.join(", ")));
                }
                answer.push_str(&format!("\n\nRecommendation\n{}", self.passage_section(&passages)));
                answer
            }
        };

        Ok(AgentReply {
            question: question.to_string(),
            answer,
            route,
            sub_queries,
        })
    }

    // ========================================================================
    // Collaborator calls
    // ========================================================================

    async fn call_metrics(
        &self,
        question: &str,
        audit: &mut Vec<SubQuery>,
    ) -> std::result::Result<MetricResult, String> {
        let tool = &self.spec.metric_tool.name;
        let request = ServiceRequest::new(question).with_limit(self.spec.metric_row_limit);
        let outcome = self.metrics.query(&request).await;
        record(tool, request, &outcome, audit)
    }

    async fn call_search(
        &self,
        text: String,
        audit: &mut Vec<SubQuery>,
    ) -> std::result::Result<Vec<Passage>, String> {
        let tool = &self.spec.search_tool.name;
        let request = ServiceRequest::new(text).with_limit(self.spec.search_limit);
        let outcome = self.search.search(&request).await;
        record(tool, request, &outcome, audit)
    }

    // ========================================================================
    // Error codes
    // ========================================================================

    fn codes_in_text(&self, text: &str) -> Vec<String> {
        let mut codes: Vec<String> = Vec::new();
        for m in self.error_codes.find_iter(text) {
            let code = m.as_str().to_uppercase();
            if !codes.contains(&code) {
                codes.push(code);
            }
        }
        codes
    }

    /// Codes named in string cells, plus codes implied by positive
    /// count columns.
    fn codes_in_result(&self, result: &MetricResult) -> Vec<String> {
        let mut codes: Vec<String> = Vec::new();
        for row in &result.rows {
            for cell in row {
                if let Value::String(s) = cell {
                    for code in self.codes_in_text(s) {
                        if !codes.contains(&code) {
                            codes.push(code);
                        }
                    }
                }
            }
        }
        for (column, code) in &self.spec.error_code_columns {
            let Some(col) = result.columns.iter().position(|c| c == column) else {
                continue;
            };
            let positive = result
                .rows
                .iter()
                .any(|row| row.get(col).and_then(Value::as_f64).is_some_and(|v| v > 0.0));
            if positive && !codes.contains(code) {
                codes.push(code.clone());
            }
        }
        codes
    }

    // ========================================================================
    // Answer composition
    // ========================================================================

    fn metric_section(&self, metrics: &std::result::Result<MetricResult, String>) -> String {
        let tool = &self.spec.metric_tool.name;
        match metrics {
            Err(message) => format!("{tool} failed: {message}"),
            Ok(result) if result.rows.is_empty() => {
                format!("{tool}: no rows from {}.", result.source)
            }
            Ok(result) => {
                let mut out = format!("{tool} ({}, {} rows):", result.source, result.rows.len());
                for row in result.rows.iter().take(self.spec.answer_preview) {
                    let cells: Vec<String> = result
                        .columns
                        .iter()
                        .zip(row)
                        .map(|(c, v)| format!("{c}: {}", display(v)))
                        .collect();
                    out.push_str(&format!("\n- {}", cells.join(", ")));
                }
                out
            }
        }
    }

    fn passage_section(&self, passages: &std::result::Result<Vec<Passage>, String>) -> String {
        let tool = &self.spec.search_tool.name;
        match passages {
            Err(message) => format!("{tool} failed: {message}"),
            Ok(passages) if passages.is_empty() => format!("{tool}: no matching passages."),
            Ok(passages) => {
                let mut out = format!("{tool}:");
                for passage in passages.iter().take(self.spec.answer_preview) {
                    out.push_str(&format!("\n- [{}] {}", passage.document_name, excerpt(&passage.text)));
                }
                out
            }
        }
    }
}

fn record<T: Serialize + Clone>(
    tool: &str,
    request: ServiceRequest,
    outcome: &Result<T>,
    audit: &mut Vec<SubQuery>,
) -> std::result::Result<T, String> {
    let (ok, result, returned) = match outcome {
        Ok(value) => (
            true,
            serde_json::to_value(value).unwrap_or_else(|e| json!({ "error": e.to_string() })),
            Ok(value.clone()),
        ),
        Err(e) => {
            tracing::warn!(tool, error = %e, "tool call failed");
            (false, json!({ "error": e.to_string() }), Err(e.to_string()))
        }
    };
    audit.push(SubQuery {
        tool: tool.to_string(),
        request,
        ok,
        result,
    });
    returned
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "n/a".to_string(),
        other => other.to_string(),
    }
}

fn excerpt(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= EXCERPT_CHARS {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(EXCERPT_CHARS).collect();
    format!("{cut}...")
}
