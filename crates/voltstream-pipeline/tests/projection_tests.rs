//! Projections over a small plant: two lines, three assets, four shifts,
//! plus focused fixtures for economics and work-order flow.

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

use voltstream_pipeline::projection::{
    asset_current, asset_status_summary, daily_trend, dimension_as_of, env_trend,
    line_daily_efficiency, line_flow_health, littles_law_metrics, ope_by_line,
    ope_latest_metrics, product_economics, quick_stats, throughput_by_line,
    throughput_economics, LineHealth, DEFAULT_CONTRIBUTION_MARGIN,
};
use voltstream_pipeline::{
    FixedClock, PipelineConfig, ProjectionInput, QueryRegistry, RunOptions, TransformState,
    Transformer,
};
use voltstream_storage::{
    Attributes, HistoryStore, LandingRecord, LandingStore, Operation, Timestamp,
};

fn t(day: u32) -> Timestamp {
    Utc.with_ymd_and_hms(2024, 12, day, 6, 0, 0).unwrap()
}

fn record(entity: &str, key: &str, sequence: u64, day: u32, payload: Value) -> LandingRecord {
    let payload: Attributes = serde_json::from_value(payload).unwrap();
    LandingRecord {
        source: "mes".to_string(),
        entity: entity.to_string(),
        natural_key: key.to_string(),
        operation: Operation::Insert,
        sequence,
        payload,
        load_time: t(day),
    }
}

#[allow(clippy::too_many_arguments)]
fn shift(
    date: &str,
    line: &str,
    shift_id: &str,
    oee: f64,
    ope: f64,
    starvation: u32,
    failures: u32,
    err_99: u32,
    humidity: f64,
    dust: f64,
    planned: u32,
    actual: u32,
) -> LandingRecord {
    record(
        "shift_metrics",
        &format!("{date}|{line}|{shift_id}"),
        1,
        1,
        json!({
            "metric_date": date,
            "production_line_id": line,
            "shift_id": shift_id,
            "oee_pct": oee,
            "ope_pct": ope,
            "starvation_downtime_min": starvation,
            "agv_failure_count": failures,
            "agv_err_99_count": err_99,
            "avg_humidity": humidity,
            "avg_dust_pm25": dust,
            "planned_quantity": planned,
            "actual_quantity": actual,
        }),
    )
}

struct Plant {
    landing: LandingStore,
    history: HistoryStore,
    config: PipelineConfig,
}

impl Plant {
    fn build() -> Self {
        let mut deleted = record(
            "shift_metrics",
            "2024-12-10|LINE_2|A",
            2,
            10,
            json!({}),
        );
        deleted.operation = Operation::Delete;

        Self::load([
            record("production_line", "LINE_1", 1, 1, json!({"line_name": "Battery Assembly 1"})),
            record("product", "PROD_EV_PACK", 1, 1, json!({"standard_cost": 2000})),
            record("asset", "AGV_001", 1, 1, json!({"asset_type": "AGV", "asset_status": "ACTIVE"})),
            record("asset", "AGV_001", 2, 5, json!({"asset_type": "AGV", "asset_status": "MAINTENANCE"})),
            record("asset", "AGV_002", 1, 1, json!({"asset_type": "AGV", "asset_status": "ACTIVE"})),
            record("asset", "ROBOT_001", 1, 1, json!({"asset_type": "ROBOT", "asset_status": "ACTIVE"})),
            shift("2024-12-01", "LINE_1", "A", 80.0, 70.0, 30, 2, 1, 40.0, 10.0, 100, 90),
            shift("2024-12-01", "LINE_1", "B", 90.0, 75.0, 10, 1, 0, 50.0, 20.0, 100, 80),
            shift("2024-12-01", "LINE_2", "A", 85.0, 80.0, 0, 0, 0, 45.0, 15.0, 200, 190),
            shift("2024-12-10", "LINE_1", "A", 70.0, 60.0, 20, 4, 3, 70.0, 30.0, 100, 50),
            shift("2024-12-10", "LINE_2", "A", 10.0, 5.0, 0, 9, 9, 99.0, 99.0, 100, 1),
            deleted,
        ])
    }

    /// Land `records` and run one full transform.
    fn load(records: impl IntoIterator<Item = LandingRecord>) -> Self {
        let plant = Self {
            landing: LandingStore::in_memory(),
            history: HistoryStore::in_memory(),
            config: PipelineConfig::default(),
        };
        plant.landing.append_batch(records).unwrap();

        let clock = FixedClock(t(28));
        let mut state = TransformState::default();
        Transformer::new(&plant.landing, &plant.history, &plant.config, &clock)
            .run(&mut state, &RunOptions::default())
            .unwrap();
        plant
    }

    fn input(&self) -> ProjectionInput<'_> {
        ProjectionInput::new(&self.landing, &self.history, &self.config)
    }
}

#[test]
fn test_line_daily_efficiency() {
    let plant = Plant::build();
    let p = line_daily_efficiency(&plant.input());

    assert_eq!(p.len(), 3);
    assert_eq!(p.value(0, "metric_date"), Some(&json!("2024-12-01")));
    assert_eq!(p.value(0, "production_line_id"), Some(&json!("LINE_1")));
    assert_eq!(p.value(0, "avg_oee_pct"), Some(&json!(85.0)));
    assert_eq!(p.value(0, "avg_ope_pct"), Some(&json!(72.5)));
    assert_eq!(p.value(0, "efficiency_gap"), Some(&json!(12.5)));
    assert_eq!(p.value(0, "starvation_downtime_min"), Some(&json!(40)));
    assert_eq!(p.value(0, "agv_failure_count"), Some(&json!(3)));
    assert_eq!(p.value(0, "planned_quantity"), Some(&json!(200)));
    assert_eq!(p.value(0, "efficiency_pct"), Some(&json!(85.0)));
    assert_eq!(p.value(1, "production_line_id"), Some(&json!("LINE_2")));
    assert_eq!(p.value(2, "metric_date"), Some(&json!("2024-12-10")));
}

#[test]
fn test_deleted_facts_are_excluded() {
    let plant = Plant::build();
    let trend = daily_trend(&plant.input());
    assert_eq!(trend.len(), 2);
    assert_eq!(trend.value(1, "total_failures"), Some(&json!(4)));
}

#[test]
fn test_ope_by_line_joins_line_names() {
    let plant = Plant::build();
    let p = ope_by_line(&plant.input());

    assert_eq!(p.len(), 2);
    assert_eq!(p.value(0, "line_name"), Some(&json!("Battery Assembly 1")));
    assert_eq!(p.value(0, "avg_oee"), Some(&json!(80.0)));
    assert_eq!(p.value(0, "avg_ope"), Some(&json!(68.33)));
    assert_eq!(p.value(0, "efficiency_gap"), Some(&json!(11.67)));
    assert_eq!(p.value(0, "total_starvation_min"), Some(&json!(60)));
    assert_eq!(p.value(0, "total_agv_failures"), Some(&json!(7)));
    assert_eq!(p.value(1, "line_name"), Some(&Value::Null));
}

#[test]
fn test_env_trend() {
    let plant = Plant::build();
    let p = env_trend(&plant.input());
    assert_eq!(p.value(0, "avg_humidity"), Some(&json!(45.0)));
    assert_eq!(p.value(0, "avg_dust"), Some(&json!(15.0)));
    assert_eq!(p.value(0, "total_err_99"), Some(&json!(1)));
}

#[test]
fn test_quick_stats_uses_the_last_week_of_data() {
    let plant = Plant::build();
    let p = quick_stats(&plant.input());

    assert_eq!(p.len(), 1);
    assert_eq!(p.value(0, "active_lines"), Some(&json!(1)));
    assert_eq!(p.value(0, "avg_ope"), Some(&json!(60.0)));
    assert_eq!(p.value(0, "avg_oee"), Some(&json!(70.0)));
    assert_eq!(p.value(0, "total_agv_failures"), Some(&json!(4)));
}

#[test]
fn test_throughput_by_line_prices_the_gap() {
    let plant = Plant::build();
    let p = throughput_by_line(&plant.input());

    assert_eq!(p.len(), 2);
    assert_eq!(p.value(0, "production_line_id"), Some(&json!("LINE_1")));
    assert_eq!(p.value(0, "total_throughput_loss"), Some(&json!(24500.0)));
    assert_eq!(p.value(0, "avg_loss_per_hour"), Some(&json!(1020.83)));
    assert_eq!(p.value(0, "total_units"), Some(&json!(220)));
    assert_eq!(p.value(1, "total_throughput_loss"), Some(&json!(7000.0)));
}

#[test]
fn test_throughput_gap_averages_each_side_separately() {
    let no_ope = record(
        "shift_metrics",
        "2024-12-02|LINE_1|B",
        1,
        2,
        json!({
            "metric_date": "2024-12-02",
            "production_line_id": "LINE_1",
            "shift_id": "B",
            "oee_pct": 90.0,
            "planned_quantity": 100,
            "actual_quantity": 70,
        }),
    );
    let plant = Plant::load([
        shift("2024-12-02", "LINE_1", "A", 80.0, 70.0, 0, 0, 0, 40.0, 10.0, 100, 90),
        no_ope,
    ]);
    let p = throughput_by_line(&plant.input());

    assert_eq!(p.len(), 1);
    assert_eq!(p.value(0, "avg_oee"), Some(&json!(85.0)));
    assert_eq!(p.value(0, "avg_ope"), Some(&json!(70.0)));
    assert_eq!(p.value(0, "avg_gap_pct"), Some(&json!(15.0)));
    assert_eq!(p.value(0, "total_units"), Some(&json!(160)));
    // Only the shift reporting both sides is priced.
    assert_eq!(p.value(0, "total_throughput_loss"), Some(&json!(8750.0)));
    assert_eq!(p.value(0, "avg_loss_per_hour"), Some(&json!(1093.75)));
}

#[test]
fn test_first_product_prices_units_even_without_a_cost() {
    let plant = Plant::load([
        record("product", "SKU_A", 1, 1, json!({"product_name": "Cell"})),
        record("product", "SKU_B", 1, 1, json!({"product_name": "Pack", "standard_cost": 2000})),
        shift("2024-12-02", "LINE_1", "A", 80.0, 70.0, 0, 0, 0, 40.0, 10.0, 100, 90),
    ]);

    let economics = product_economics(&plant.history);
    assert_eq!(economics.sku.as_deref(), Some("SKU_A"));
    assert_eq!(economics.contribution_margin, DEFAULT_CONTRIBUTION_MARGIN);

    let p = throughput_by_line(&plant.input());
    assert_eq!(p.value(0, "total_throughput_loss"), Some(&json!(8750.0)));

    let priced = Plant::load([record("product", "SKU_A", 1, 1, json!({"standard_cost": 1000}))]);
    let economics = product_economics(&priced.history);
    assert_eq!(economics.contribution_margin, 350.0);
}

#[test]
fn test_throughput_economics_prices_each_shift() {
    let plant = Plant::build();
    let p = throughput_economics(&plant.input());

    assert_eq!(p.len(), 4);
    assert_eq!(p.value(0, "metric_date"), Some(&json!("2024-12-10")));
    assert_eq!(p.value(0, "production_line_id"), Some(&json!("LINE_1")));
    assert_eq!(p.value(0, "efficiency_gap_pct"), Some(&json!(10.0)));
    assert_eq!(p.value(0, "sku"), Some(&json!("PROD_EV_PACK")));
    assert_eq!(p.value(0, "contribution_margin"), Some(&json!(700)));
    assert_eq!(p.value(0, "throughput_loss_dollars"), Some(&json!(7000.0)));
    assert_eq!(p.value(0, "throughput_loss_per_hour"), Some(&json!(875.0)));
    assert_eq!(p.value(0, "contribution_margin_per_min"), Some(&json!(72.92)));

    let order: Vec<(Value, Value)> = p
        .records()
        .iter()
        .skip(1)
        .map(|r| (r["production_line_id"].clone(), r["shift_id"].clone()))
        .collect();
    assert_eq!(
        order,
        vec![
            (json!("LINE_1"), json!("A")),
            (json!("LINE_1"), json!("B")),
            (json!("LINE_2"), json!("A")),
        ]
    );
}

#[test]
fn test_ope_latest_metrics_keeps_the_newest_day() {
    let plant = Plant::build();
    let p = ope_latest_metrics(&plant.input());

    // The deleted LINE_2 shift does not count.
    assert_eq!(p.len(), 1);
    assert_eq!(p.value(0, "metric_date"), Some(&json!("2024-12-10")));
    assert_eq!(p.value(0, "ope_pct"), Some(&json!(60)));
    assert_eq!(p.value(0, "agv_err_99_count"), Some(&json!(3)));
    assert_eq!(p.value(0, "actual_quantity"), Some(&json!(50)));

    let empty = Plant::load([record("asset", "AGV_001", 1, 1, json!({"asset_type": "AGV"}))]);
    assert!(ope_latest_metrics(&empty.input()).is_empty());
}

#[test]
fn test_line_health_thresholds() {
    assert_eq!(LineHealth::classify(Some(65.0), 0.0), LineHealth::Blocked);
    assert_eq!(LineHealth::classify(Some(85.0), 6.0), LineHealth::Blocked);
    assert_eq!(LineHealth::classify(Some(75.0), 5.0), LineHealth::Constrained);
    assert_eq!(LineHealth::classify(Some(80.0), 2.0), LineHealth::Healthy);
    assert_eq!(LineHealth::classify(None, 0.0), LineHealth::Healthy);
}

#[test]
fn test_line_flow_health_over_the_last_week() {
    let plant = Plant::load([
        shift("2024-12-01", "LINE_3", "A", 60.0, 50.0, 0, 0, 0, 40.0, 10.0, 100, 40),
        shift("2024-12-08", "LINE_1", "A", 90.0, 85.0, 5, 3, 0, 40.0, 10.0, 100, 95),
        shift("2024-12-09", "LINE_1", "A", 90.0, 85.0, 5, 3, 0, 40.0, 10.0, 100, 95),
        shift("2024-12-08", "LINE_2", "A", 80.0, 75.0, 0, 0, 0, 40.0, 10.0, 100, 80),
        shift("2024-12-09", "LINE_2", "A", 80.0, 78.0, 0, 0, 0, 40.0, 10.0, 100, 82),
    ]);
    let p = line_flow_health(&plant.input());

    assert_eq!(p.len(), 2);
    assert_eq!(p.value(0, "production_line_id"), Some(&json!("LINE_1")));
    assert_eq!(p.value(0, "total_agv_failures"), Some(&json!(6)));
    assert_eq!(p.value(0, "line_health"), Some(&json!("BLOCKED")));
    assert_eq!(p.value(1, "avg_ope"), Some(&json!(76.5)));
    assert_eq!(p.value(1, "total_output"), Some(&json!(162)));
    assert_eq!(p.value(1, "line_health"), Some(&json!("CONSTRAINED")));
}

fn work_order(
    key: &str,
    line: &str,
    status: &str,
    start: Option<&str>,
    completed: u32,
) -> LandingRecord {
    let mut payload = json!({
        "production_line_id": line,
        "work_order_status": status,
        "completed_quantity": completed,
    });
    if let Some(start) = start {
        payload["planned_start_date"] = json!(start);
    }
    record("work_order", key, 1, 1, payload)
}

#[test]
fn test_littles_law_flags_wip_piling_up() {
    let mut cancelled = work_order("WO_9", "LINE_2", "RELEASED", Some("2024-12-03"), 0);
    cancelled.sequence = 2;
    cancelled.operation = Operation::Delete;
    cancelled.payload = Attributes::new();

    let plant = Plant::load([
        work_order("WO_1", "LINE_1", "COMPLETED", Some("2024-12-01"), 100),
        work_order("WO_2", "LINE_1", "RELEASED", Some("2024-12-01"), 0),
        work_order("WO_3", "LINE_1", "COMPLETED", Some("2024-12-02"), 120),
        work_order("WO_4", "LINE_1", "STARTED", Some("2024-12-03"), 0),
        work_order("WO_5", "LINE_1", "IN_PROGRESS", Some("2024-12-03"), 0),
        work_order("WO_6", "LINE_1", "RELEASED", Some("2024-12-03"), 0),
        work_order("WO_7", "LINE_2", "RELEASED", Some("2024-12-03"), 0),
        work_order("WO_8", "LINE_2", "RELEASED", None, 0),
        work_order("WO_9", "LINE_2", "RELEASED", Some("2024-12-03"), 0),
        cancelled,
    ]);
    let p = littles_law_metrics(&plant.input());

    assert_eq!(p.len(), 4);
    let keys: Vec<(Value, Value)> = p
        .records()
        .iter()
        .map(|r| (r["metric_date"].clone(), r["production_line_id"].clone()))
        .collect();
    assert_eq!(
        keys,
        vec![
            (json!("2024-12-03"), json!("LINE_1")),
            (json!("2024-12-03"), json!("LINE_2")),
            (json!("2024-12-02"), json!("LINE_1")),
            (json!("2024-12-01"), json!("LINE_1")),
        ]
    );

    assert_eq!(p.value(0, "wip_count"), Some(&json!(3)));
    assert_eq!(p.value(0, "throughput_units"), Some(&json!(0)));
    assert_eq!(p.value(0, "calculated_cycle_time_min"), Some(&json!(999)));
    assert_eq!(p.value(0, "wip_3day_avg"), Some(&json!(1.33)));
    assert_eq!(p.value(0, "throughput_3day_avg"), Some(&json!(73.33)));
    assert_eq!(p.value(0, "littles_law_violation"), Some(&json!(true)));
    assert_eq!(p.value(0, "divergence_severity"), Some(&json!("CRITICAL")));

    // The deleted order and the one without a start date are left out.
    assert_eq!(p.value(1, "total_orders"), Some(&json!(1)));
    assert_eq!(p.value(1, "divergence_severity"), Some(&json!("NORMAL")));

    assert_eq!(p.value(3, "completed_orders"), Some(&json!(1)));
    assert_eq!(p.value(3, "calculated_cycle_time_min"), Some(&json!(4.8)));
    assert_eq!(p.value(3, "littles_law_violation"), Some(&json!(false)));
}

#[test]
fn test_asset_dimensions() {
    let plant = Plant::build();
    let current = asset_current(&plant.input());
    assert_eq!(current.len(), 3);
    assert_eq!(current.value(0, "asset_code"), Some(&json!("AGV_001")));
    assert_eq!(current.value(0, "asset_status"), Some(&json!("MAINTENANCE")));
    assert_eq!(current.value(0, "version"), Some(&json!(2)));

    let summary = asset_status_summary(&plant.input());
    let rows: Vec<(Value, Value, Value)> = summary
        .rows
        .iter()
        .map(|r| (r[0].clone(), r[1].clone(), r[2].clone()))
        .collect();
    assert_eq!(
        rows,
        vec![
            (json!("AGV"), json!("ACTIVE"), json!(1)),
            (json!("AGV"), json!("MAINTENANCE"), json!(1)),
            (json!("ROBOT"), json!("ACTIVE"), json!(1)),
        ]
    );
}

#[test]
fn test_dimension_as_of_slices_history() {
    let plant = Plant::build();
    let before = dimension_as_of(&plant.input(), "asset", t(3));
    assert_eq!(before.value(0, "asset_status"), Some(&json!("ACTIVE")));
    let after = dimension_as_of(&plant.input(), "asset", t(6));
    assert_eq!(after.value(0, "asset_status"), Some(&json!("MAINTENANCE")));
}

#[test]
fn test_projections_are_bit_identical_across_rebuilds() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let registry = QueryRegistry::standard();

    let a = Plant::build();
    let b = Plant::build();
    let written_a = registry.refresh(&a.input(), dir_a.path()).unwrap();
    let written_b = registry.refresh(&b.input(), dir_b.path()).unwrap();
    assert_eq!(written_a.len(), registry.len());

    for (pa, pb) in written_a.iter().zip(&written_b) {
        assert_eq!(std::fs::read(pa).unwrap(), std::fs::read(pb).unwrap());
    }
}

#[test]
fn test_registry_checks_pass_on_loaded_plant() {
    let plant = Plant::build();
    let checks = QueryRegistry::standard().check_all(&plant.input());
    assert!(checks.iter().all(|c| c.passed), "{checks:?}");
}
