//! Analytics projections.
//!
//! Every projection is a pure function of the two stores: facts come from the
//! latest non-deleted landing record per `shift_metrics` key, dimensions from
//! current (or time-sliced) history rows. Inputs are visited in key order and
//! aggregated in that order, so the same stores always yield bit-identical
//! output.
//!
//! Numbers are rounded like the dashboard queries round them: `ROUND(x, n)`,
//! half away from zero.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use voltstream_storage::{
    HistoryStore, LandingRecord, LandingStore, Operation, Timestamp, VersionRow,
};

use crate::PipelineConfig;

/// Contribution margin per unit when the pricing product has no standard cost.
pub const DEFAULT_CONTRIBUTION_MARGIN: f64 = 875.0;
/// Unit price over standard cost.
pub const MARGIN_MARKUP: f64 = 0.35;
const SHIFT_HOURS: f64 = 8.0;
const SHIFT_MINUTES: f64 = 480.0;
const BLOCKED_OPE_PCT: f64 = 70.0;
const CONSTRAINED_OPE_PCT: f64 = 80.0;
const BLOCKED_AGV_FAILURES: f64 = 5.0;

#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown projection `{0}`")]
    UnknownProjection(String),
}

/// What projections read from.
#[derive(Clone, Copy)]
pub struct ProjectionInput<'a> {
    pub landing: &'a LandingStore,
    pub history: &'a HistoryStore,
    pub metrics_entity: &'a str,
}

impl<'a> ProjectionInput<'a> {
    pub fn new(
        landing: &'a LandingStore,
        history: &'a HistoryStore,
        config: &'a PipelineConfig,
    ) -> Self {
        Self {
            landing,
            history,
            metrics_entity: &config.metrics_entity,
        }
    }
}

// ============================================================================
// Projection Table
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Projection {
    fn new(name: &str, columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cell at `row` in the named column.
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(idx)
    }

    /// Rows as column-name maps.
    pub fn records(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }

    /// Write `<dir>/<name>.json` (temp file + rename).
    pub fn write_json(&self, dir: &Path) -> Result<PathBuf, ProjectionError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.json", self.name));
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, &path)?;
        Ok(path)
    }
}

/// `ROUND(x, places)`, half away from zero.
pub fn round_to(x: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (x * factor).round() / factor
}

fn rounded(x: Option<f64>, places: i32) -> Value {
    match x {
        Some(x) if x.is_finite() => Value::from(round_to(x, places)),
        _ => Value::Null,
    }
}

fn number(x: f64) -> Value {
    if x.fract() == 0.0 && x.abs() < 9.0e15 {
        Value::from(x as i64)
    } else {
        Value::from(x)
    }
}

// ============================================================================
// Facts
// ============================================================================

/// One production-line shift, as landed by the metrics feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ShiftFact {
    pub metric_date: NaiveDate,
    pub production_line_id: String,
    pub shift_id: Option<String>,
    pub oee_pct: Option<f64>,
    pub ope_pct: Option<f64>,
    pub starvation_downtime_min: Option<f64>,
    pub agv_failure_count: Option<f64>,
    pub agv_err_99_count: Option<f64>,
    pub avg_humidity: Option<f64>,
    pub avg_dust_pm25: Option<f64>,
    pub planned_quantity: Option<f64>,
    pub actual_quantity: Option<f64>,
}

impl ShiftFact {
    /// `None` when the record lacks a parseable date or a line id.
    pub fn from_record(record: &LandingRecord) -> Option<Self> {
        let payload = &record.payload;
        let metric_date = payload.get("metric_date").and_then(parse_date)?;
        let production_line_id = payload.get("production_line_id").and_then(text)?;
        let num = |field: &str| payload.get(field).and_then(parse_number);
        Some(Self {
            metric_date,
            production_line_id,
            shift_id: payload.get("shift_id").and_then(text),
            oee_pct: num("oee_pct"),
            ope_pct: num("ope_pct"),
            starvation_downtime_min: num("starvation_downtime_min"),
            agv_failure_count: num("agv_failure_count"),
            agv_err_99_count: num("agv_err_99_count"),
            avg_humidity: num("avg_humidity"),
            avg_dust_pm25: num("avg_dust_pm25"),
            planned_quantity: num("planned_quantity"),
            actual_quantity: num("actual_quantity"),
        })
    }

    fn gap(&self) -> Option<f64> {
        Some(self.oee_pct? - self.ope_pct?)
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_date(value: &Value) -> Option<NaiveDate> {
    let s = value.as_str()?;
    let day = s.get(..10).unwrap_or(s);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

/// Latest non-deleted fact per key, in key order.
pub fn shift_facts(input: &ProjectionInput<'_>) -> Vec<ShiftFact> {
    let mut skipped = 0usize;
    let facts: Vec<ShiftFact> = input
        .landing
        .latest_by_entity(input.metrics_entity)
        .iter()
        .filter(|r| r.operation != Operation::Delete)
        .filter_map(|r| {
            let fact = ShiftFact::from_record(r);
            if fact.is_none() {
                skipped += 1;
            }
            fact
        })
        .collect();
    if skipped > 0 {
        tracing::warn!(skipped, entity = input.metrics_entity, "fact records without date or line");
    }
    facts
}

#[derive(Debug, Clone, Copy, Default)]
struct Agg {
    sum: f64,
    count: usize,
}

impl Agg {
    fn add(&mut self, value: Option<f64>) {
        if let Some(v) = value {
            self.sum += v;
            self.count += 1;
        }
    }

    fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    fn total(&self) -> Option<f64> {
        (self.count > 0).then_some(self.sum)
    }
}

#[derive(Debug, Clone, Default)]
struct FactAgg {
    oee: Agg,
    ope: Agg,
    starvation: Agg,
    failures: Agg,
    err_99: Agg,
    humidity: Agg,
    dust: Agg,
    planned: Agg,
    actual: Agg,
}

impl FactAgg {
    fn add(&mut self, fact: &ShiftFact) {
        self.oee.add(fact.oee_pct);
        self.ope.add(fact.ope_pct);
        self.starvation.add(fact.starvation_downtime_min);
        self.failures.add(fact.agv_failure_count);
        self.err_99.add(fact.agv_err_99_count);
        self.humidity.add(fact.avg_humidity);
        self.dust.add(fact.avg_dust_pm25);
        self.planned.add(fact.planned_quantity);
        self.actual.add(fact.actual_quantity);
    }

    fn gap(&self) -> Option<f64> {
        Some(self.oee.mean()? - self.ope.mean()?)
    }

    fn total(agg: &Agg) -> Value {
        agg.total().map_or(Value::Null, number)
    }
}

fn group_by<K: Ord>(facts: &[ShiftFact], key: impl Fn(&ShiftFact) -> K) -> BTreeMap<K, FactAgg> {
    let mut groups: BTreeMap<K, FactAgg> = BTreeMap::new();
    for fact in facts {
        groups.entry(key(fact)).or_default().add(fact);
    }
    groups
}

fn date_value(date: NaiveDate) -> Value {
    Value::from(date.format("%Y-%m-%d").to_string())
}

// ============================================================================
// Metric Projections
// ============================================================================

/// Per line and day: efficiency and the OEE/OPE gap.
pub fn line_daily_efficiency(input: &ProjectionInput<'_>) -> Projection {
    let mut out = Projection::new(
        "line_daily_efficiency",
        &[
            "metric_date",
            "production_line_id",
            "avg_oee_pct",
            "avg_ope_pct",
            "efficiency_gap",
            "starvation_downtime_min",
            "agv_failure_count",
            "planned_quantity",
            "actual_quantity",
            "efficiency_pct",
        ],
    );
    let facts = shift_facts(input);
    let groups = group_by(&facts, |f| (f.metric_date, f.production_line_id.clone()));
    for ((date, line), agg) in groups {
        let efficiency = match (agg.actual.total(), agg.planned.total()) {
            (Some(actual), Some(planned)) if planned > 0.0 => Some(actual / planned * 100.0),
            _ => None,
        };
        out.rows.push(vec![
            date_value(date),
            Value::from(line),
            rounded(agg.oee.mean(), 2),
            rounded(agg.ope.mean(), 2),
            rounded(agg.gap(), 2),
            FactAgg::total(&agg.starvation),
            FactAgg::total(&agg.failures),
            FactAgg::total(&agg.planned),
            FactAgg::total(&agg.actual),
            rounded(efficiency, 2),
        ]);
    }
    out
}

/// Per line over all days, with the line name from the current dimension.
pub fn ope_by_line(input: &ProjectionInput<'_>) -> Projection {
    let mut out = Projection::new(
        "ope_by_line",
        &[
            "production_line_id",
            "line_name",
            "avg_oee",
            "avg_ope",
            "efficiency_gap",
            "total_starvation_min",
            "total_agv_failures",
        ],
    );
    let names: BTreeMap<String, Value> = input
        .history
        .current_rows("production_line")
        .into_iter()
        .filter_map(|row| {
            let name = row
                .attributes
                .get("line_name")
                .or_else(|| row.attributes.get("name"))
                .cloned()?;
            Some((row.entity_key.key, name))
        })
        .collect();

    let facts = shift_facts(input);
    for (line, agg) in group_by(&facts, |f| f.production_line_id.clone()) {
        let name = names.get(&line).cloned().unwrap_or(Value::Null);
        out.rows.push(vec![
            Value::from(line),
            name,
            rounded(agg.oee.mean(), 2),
            rounded(agg.ope.mean(), 2),
            rounded(agg.gap(), 2),
            FactAgg::total(&agg.starvation),
            FactAgg::total(&agg.failures),
        ]);
    }
    out
}

pub fn daily_trend(input: &ProjectionInput<'_>) -> Projection {
    let mut out = Projection::new(
        "daily_trend",
        &["metric_date", "avg_oee", "avg_ope", "total_starvation", "total_failures"],
    );
    let facts = shift_facts(input);
    for (date, agg) in group_by(&facts, |f| f.metric_date) {
        out.rows.push(vec![
            date_value(date),
            rounded(agg.oee.mean(), 2),
            rounded(agg.ope.mean(), 2),
            FactAgg::total(&agg.starvation),
            FactAgg::total(&agg.failures),
        ]);
    }
    out
}

pub fn env_trend(input: &ProjectionInput<'_>) -> Projection {
    let mut out = Projection::new(
        "env_trend",
        &["metric_date", "avg_humidity", "avg_dust", "total_err_99"],
    );
    let facts = shift_facts(input);
    for (date, agg) in group_by(&facts, |f| f.metric_date) {
        out.rows.push(vec![
            date_value(date),
            rounded(agg.humidity.mean(), 2),
            rounded(agg.dust.mean(), 2),
            FactAgg::total(&agg.err_99),
        ]);
    }
    out
}

/// Sidebar numbers for the last 7 days before the newest metric date.
///
/// Always one row; with no facts the averages are null.
pub fn quick_stats(input: &ProjectionInput<'_>) -> Projection {
    let mut out = Projection::new(
        "quick_stats",
        &["active_lines", "avg_ope", "avg_oee", "total_agv_failures"],
    );
    let facts = shift_facts(input);
    let window: Vec<&ShiftFact> = match facts.iter().map(|f| f.metric_date).max() {
        Some(max_date) => {
            let start = max_date - Duration::days(7);
            facts.iter().filter(|f| f.metric_date >= start).collect()
        }
        None => Vec::new(),
    };

    let lines: BTreeSet<&str> = window.iter().map(|f| f.production_line_id.as_str()).collect();
    let mut agg = FactAgg::default();
    for fact in &window {
        agg.add(fact);
    }
    out.rows.push(vec![
        Value::from(lines.len()),
        rounded(agg.ope.mean(), 1),
        rounded(agg.oee.mean(), 1),
        FactAgg::total(&agg.failures),
    ]);
    out
}

/// Economics of the first current product by key.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductEconomics {
    pub sku: Option<String>,
    pub contribution_margin: f64,
}

/// The first current product prices every unit. Its margin falls back to
/// [`DEFAULT_CONTRIBUTION_MARGIN`] when it carries no standard cost, or when
/// no product is current at all.
pub fn product_economics(history: &HistoryStore) -> ProductEconomics {
    let products = history.current_rows("product");
    let first = products.first();
    let cost = first.and_then(|row| row.attributes.get("standard_cost").and_then(parse_number));
    ProductEconomics {
        sku: first.map(|row| row.entity_key.key.clone()),
        contribution_margin: cost.map_or(DEFAULT_CONTRIBUTION_MARGIN, |c| c * MARGIN_MARKUP),
    }
}

/// Facts with planned output, the only ones the economics price.
fn planned_facts(input: &ProjectionInput<'_>) -> Vec<(ShiftFact, f64)> {
    shift_facts(input)
        .into_iter()
        .filter_map(|fact| {
            let planned = fact.planned_quantity.filter(|p| *p > 0.0)?;
            Some((fact, planned))
        })
        .collect()
}

/// Per shift with planned output: the gap and what it cost.
pub fn throughput_economics(input: &ProjectionInput<'_>) -> Projection {
    let mut out = Projection::new(
        "throughput_economics",
        &[
            "metric_date",
            "production_line_id",
            "shift_id",
            "oee_pct",
            "ope_pct",
            "efficiency_gap_pct",
            "actual_quantity",
            "planned_quantity",
            "starvation_downtime_min",
            "agv_failure_count",
            "sku",
            "contribution_margin",
            "throughput_loss_dollars",
            "throughput_loss_per_hour",
            "contribution_margin_per_min",
        ],
    );
    let economics = product_economics(input.history);
    let margin = economics.contribution_margin;
    let sku = economics.sku.map_or(Value::Null, Value::from);
    let opt = |x: Option<f64>| x.map_or(Value::Null, number);

    let mut facts = planned_facts(input);
    // Newest day first, then line; the stable sort keeps key order within.
    facts.sort_by(|(a, _), (b, _)| {
        b.metric_date
            .cmp(&a.metric_date)
            .then_with(|| a.production_line_id.cmp(&b.production_line_id))
    });
    for (fact, planned) in facts {
        let loss = fact.gap().map(|g| g / 100.0 * planned * margin);
        out.rows.push(vec![
            date_value(fact.metric_date),
            Value::from(fact.production_line_id.clone()),
            fact.shift_id.clone().map_or(Value::Null, Value::from),
            rounded(fact.oee_pct, 2),
            rounded(fact.ope_pct, 2),
            rounded(fact.gap(), 2),
            opt(fact.actual_quantity),
            number(planned),
            opt(fact.starvation_downtime_min),
            opt(fact.agv_failure_count),
            sku.clone(),
            number(margin),
            rounded(loss, 2),
            rounded(loss.map(|l| l / SHIFT_HOURS), 2),
            rounded(fact.actual_quantity.map(|q| q * margin / SHIFT_MINUTES), 2),
        ]);
    }
    out
}

/// Dollar cost of the OEE/OPE gap per line, over shifts with planned output.
///
/// The gap is `AVG(oee) - AVG(ope)`: each side averages the shifts that
/// report it. Losses only count shifts reporting both.
pub fn throughput_by_line(input: &ProjectionInput<'_>) -> Projection {
    let mut out = Projection::new(
        "throughput_by_line",
        &[
            "production_line_id",
            "avg_oee",
            "avg_ope",
            "avg_gap_pct",
            "total_units",
            "total_starvation_min",
            "total_throughput_loss",
            "avg_loss_per_hour",
        ],
    );
    let margin = product_economics(input.history).contribution_margin;

    #[derive(Default)]
    struct LineLoss {
        facts: FactAgg,
        loss: Agg,
    }

    let mut lines: BTreeMap<String, LineLoss> = BTreeMap::new();
    for (fact, planned) in planned_facts(input) {
        let entry = lines.entry(fact.production_line_id.clone()).or_default();
        entry.facts.add(&fact);
        entry.loss.add(fact.gap().map(|g| g / 100.0 * planned * margin));
    }

    let mut rows: Vec<(f64, Vec<Value>)> = lines
        .into_iter()
        .map(|(line, loss)| {
            let total = loss.loss.total().unwrap_or(0.0);
            let row = vec![
                Value::from(line),
                rounded(loss.facts.oee.mean(), 2),
                rounded(loss.facts.ope.mean(), 2),
                rounded(loss.facts.gap(), 2),
                FactAgg::total(&loss.facts.actual),
                FactAgg::total(&loss.facts.starvation),
                rounded(loss.loss.total(), 2),
                rounded(loss.loss.mean().map(|m| m / SHIFT_HOURS), 2),
            ];
            (total, row)
        })
        .collect();
    // Largest loss first; line id (already sorted) breaks ties.
    rows.sort_by(|a, b| b.0.total_cmp(&a.0));
    out.rows = rows.into_iter().map(|(_, row)| row).collect();
    out
}

/// Every shift of the newest metric date.
pub fn ope_latest_metrics(input: &ProjectionInput<'_>) -> Projection {
    let mut out = Projection::new(
        "ope_latest_metrics",
        &[
            "metric_date",
            "production_line_id",
            "shift_id",
            "oee_pct",
            "ope_pct",
            "starvation_downtime_min",
            "agv_failure_count",
            "agv_err_99_count",
            "avg_humidity",
            "avg_dust_pm25",
            "actual_quantity",
        ],
    );
    let facts = shift_facts(input);
    let Some(latest) = facts.iter().map(|f| f.metric_date).max() else {
        return out;
    };
    let opt = |x: Option<f64>| x.map_or(Value::Null, number);
    for fact in facts.iter().filter(|f| f.metric_date == latest) {
        out.rows.push(vec![
            date_value(fact.metric_date),
            Value::from(fact.production_line_id.clone()),
            fact.shift_id.clone().map_or(Value::Null, Value::from),
            opt(fact.oee_pct),
            opt(fact.ope_pct),
            opt(fact.starvation_downtime_min),
            opt(fact.agv_failure_count),
            opt(fact.agv_err_99_count),
            opt(fact.avg_humidity),
            opt(fact.avg_dust_pm25),
            opt(fact.actual_quantity),
        ]);
    }
    out
}

/// Health of a line over a window of shifts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineHealth {
    Healthy,
    Constrained,
    Blocked,
}

impl LineHealth {
    /// Blocked below 70% OPE or past 5 AGV failures, constrained below 80%.
    pub fn classify(avg_ope: Option<f64>, agv_failures: f64) -> Self {
        match avg_ope {
            Some(ope) if ope < BLOCKED_OPE_PCT => Self::Blocked,
            _ if agv_failures > BLOCKED_AGV_FAILURES => Self::Blocked,
            Some(ope) if ope < CONSTRAINED_OPE_PCT => Self::Constrained,
            _ => Self::Healthy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "HEALTHY",
            Self::Constrained => "CONSTRAINED",
            Self::Blocked => "BLOCKED",
        }
    }
}

/// Per line over the last 7 days before the newest metric date: flow volume
/// and health status.
pub fn line_flow_health(input: &ProjectionInput<'_>) -> Projection {
    let mut out = Projection::new(
        "line_flow_health",
        &[
            "production_line_id",
            "total_planned",
            "total_output",
            "avg_ope",
            "total_starvation_min",
            "total_agv_failures",
            "line_health",
        ],
    );
    let facts = shift_facts(input);
    let Some(max_date) = facts.iter().map(|f| f.metric_date).max() else {
        return out;
    };
    let start = max_date - Duration::days(7);
    let window: Vec<ShiftFact> = facts.into_iter().filter(|f| f.metric_date >= start).collect();

    for (line, agg) in group_by(&window, |f| f.production_line_id.clone()) {
        let failures = agg.failures.total().unwrap_or(0.0);
        let health = LineHealth::classify(agg.ope.mean(), failures);
        out.rows.push(vec![
            Value::from(line),
            FactAgg::total(&agg.planned),
            FactAgg::total(&agg.actual),
            rounded(agg.ope.mean(), 2),
            number(agg.starvation.total().unwrap_or(0.0)),
            number(failures),
            Value::from(health.as_str()),
        ]);
    }
    out
}

// ============================================================================
// Flow Projections
// ============================================================================

const WIP_STATUSES: [&str; 3] = ["RELEASED", "STARTED", "IN_PROGRESS"];
const COMPLETED_STATUS: &str = "COMPLETED";
/// Cycle time reported for a day with no completed output.
pub const NO_THROUGHPUT_CYCLE_TIME: f64 = 999.0;

#[derive(Debug, Default)]
struct DailyFlow {
    wip: usize,
    throughput: f64,
    orders: usize,
    completed: usize,
}

/// Little's law per line and planned start date, over current work orders.
///
/// Cycle time is `wip * 480 / throughput` minutes. Rolling averages cover the
/// line's current day and up to two earlier days; a day whose WIP runs 20%
/// over its average while throughput does not rise is a violation, and
/// `CRITICAL` when WIP runs 50% over and throughput sits 20% under.
pub fn littles_law_metrics(input: &ProjectionInput<'_>) -> Projection {
    let mut out = Projection::new(
        "littles_law_metrics",
        &[
            "metric_date",
            "production_line_id",
            "wip_count",
            "throughput_units",
            "total_orders",
            "completed_orders",
            "calculated_cycle_time_min",
            "wip_3day_avg",
            "throughput_3day_avg",
            "littles_law_violation",
            "divergence_severity",
        ],
    );

    let mut flows: BTreeMap<(String, NaiveDate), DailyFlow> = BTreeMap::new();
    for row in input.history.current_rows("work_order") {
        let attrs = &row.attributes;
        let Some(date) = attrs.get("planned_start_date").and_then(parse_date) else {
            continue;
        };
        let Some(line) = attrs.get("production_line_id").and_then(text) else {
            continue;
        };
        let status = attrs
            .get("work_order_status")
            .or_else(|| attrs.get("status"))
            .and_then(text)
            .unwrap_or_default();

        let flow = flows.entry((line, date)).or_default();
        flow.orders += 1;
        if WIP_STATUSES.contains(&status.as_str()) {
            flow.wip += 1;
        }
        if status == COMPLETED_STATUS {
            flow.completed += 1;
            flow.throughput += attrs
                .get("completed_quantity")
                .and_then(parse_number)
                .unwrap_or(0.0);
        }
    }

    // (date, line, cells) so the newest day sorts first afterwards.
    let mut rows: Vec<(NaiveDate, String, Vec<Value>)> = Vec::new();
    let mut window: Vec<(f64, f64)> = Vec::new();
    let mut current_line: Option<String> = None;
    for ((line, date), flow) in flows {
        if current_line.as_ref() != Some(&line) {
            window.clear();
            current_line = Some(line.clone());
        }
        let wip = flow.wip as f64;
        window.push((wip, flow.throughput));
        if window.len() > 3 {
            window.remove(0);
        }
        let span = window.len() as f64;
        let wip_avg = window.iter().map(|(w, _)| w).sum::<f64>() / span;
        let throughput_avg = window.iter().map(|(_, t)| t).sum::<f64>() / span;

        let cycle_time = if flow.throughput > 0.0 {
            round_to(wip * SHIFT_MINUTES / flow.throughput, 2)
        } else {
            NO_THROUGHPUT_CYCLE_TIME
        };
        let violation = wip > wip_avg * 1.2 && flow.throughput <= throughput_avg;
        let severity = if wip > wip_avg * 1.5 && flow.throughput < throughput_avg * 0.8 {
            "CRITICAL"
        } else if violation {
            "WARNING"
        } else {
            "NORMAL"
        };

        rows.push((
            date,
            line.clone(),
            vec![
                date_value(date),
                Value::from(line),
                Value::from(flow.wip),
                number(flow.throughput),
                Value::from(flow.orders),
                Value::from(flow.completed),
                number(cycle_time),
                rounded(Some(wip_avg), 2),
                rounded(Some(throughput_avg), 2),
                Value::from(violation),
                Value::from(severity),
            ],
        ));
    }
    rows.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    out.rows = rows.into_iter().map(|(_, _, row)| row).collect();
    out
}

// ============================================================================
// Dimension Projections
// ============================================================================

fn dimension(name: &str, key_column: &str, rows: Vec<VersionRow>) -> Projection {
    let fields: BTreeSet<String> = rows
        .iter()
        .flat_map(|row| row.attributes.keys().cloned())
        .collect();

    let mut columns = vec![key_column, "surrogate_id", "version", "valid_from", "valid_to"];
    columns.extend(fields.iter().map(String::as_str));
    let mut out = Projection::new(name, &columns);

    for row in rows {
        let mut cells = vec![
            Value::from(row.entity_key.key.clone()),
            Value::from(row.surrogate_id.to_string()),
            Value::from(row.version),
            Value::from(row.valid_from.to_rfc3339()),
            row.valid_to
                .map_or(Value::Null, |t| Value::from(t.to_rfc3339())),
        ];
        cells.extend(
            fields
                .iter()
                .map(|f| row.attributes.get(f).cloned().unwrap_or(Value::Null)),
        );
        out.rows.push(cells);
    }
    out
}

/// Current-state asset dimension.
pub fn asset_current(input: &ProjectionInput<'_>) -> Projection {
    dimension("asset_current", "asset_code", input.history.current_rows("asset"))
}

pub fn asset_status_summary(input: &ProjectionInput<'_>) -> Projection {
    let mut out = Projection::new(
        "asset_status_summary",
        &["asset_type", "asset_status", "asset_count"],
    );
    let mut counts: BTreeMap<(String, String), usize> = BTreeMap::new();
    for row in input.history.current_rows("asset") {
        let field = |name: &str| {
            row.attributes
                .get(name)
                .and_then(text)
                .unwrap_or_else(|| "UNKNOWN".to_string())
        };
        *counts
            .entry((field("asset_type"), field("asset_status")))
            .or_default() += 1;
    }
    for ((asset_type, status), count) in counts {
        out.rows
            .push(vec![Value::from(asset_type), Value::from(status), Value::from(count)]);
    }
    out
}

/// Rows of `entity` valid at `at`.
pub fn dimension_as_of(input: &ProjectionInput<'_>, entity: &str, at: Timestamp) -> Projection {
    dimension(
        &format!("{entity}_as_of"),
        "natural_key",
        input.history.rows_as_of(entity, at),
    )
}
