//! Transformer behaviour over the landing and history stores.

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

use voltstream_pipeline::{
    FixedClock, PipelineConfig, RunOptions, TransformError, TransformReport, TransformState,
    Transformer,
};
use voltstream_storage::{
    Attributes, EntityKey, HistoryStore, InvariantBreach, LandingRecord, LandingStore, Operation,
    StoreError, SurrogateId, Timestamp,
};

fn t(day: u32) -> Timestamp {
    Utc.with_ymd_and_hms(2024, 12, day, 6, 0, 0).unwrap()
}

fn record(
    entity: &str,
    key: &str,
    sequence: u64,
    operation: Operation,
    load_time: Timestamp,
    payload: Value,
) -> LandingRecord {
    let payload: Attributes = serde_json::from_value(payload).unwrap();
    LandingRecord {
        source: "mes".to_string(),
        entity: entity.to_string(),
        natural_key: key.to_string(),
        operation,
        sequence,
        payload,
        load_time,
    }
}

fn asset(key: &str, sequence: u64, load_time: Timestamp, status: &str) -> LandingRecord {
    record(
        "asset",
        key,
        sequence,
        Operation::Update,
        load_time,
        json!({
            "asset_type": "AGV",
            "asset_status": status,
            "zone_id": "ZONE_A",
            "production_line_id": "LINE_1",
        }),
    )
}

struct Pipeline {
    landing: LandingStore,
    history: HistoryStore,
    config: PipelineConfig,
    clock: FixedClock,
    state: TransformState,
}

impl Pipeline {
    fn new() -> Self {
        Self {
            landing: LandingStore::in_memory(),
            history: HistoryStore::in_memory(),
            config: PipelineConfig::default(),
            clock: FixedClock(t(28)),
            state: TransformState::default(),
        }
    }

    fn land(&self, records: impl IntoIterator<Item = LandingRecord>) {
        self.landing.append_batch(records).unwrap();
    }

    fn run_with(&mut self, options: &RunOptions) -> Result<TransformReport, TransformError> {
        let transformer = Transformer::new(&self.landing, &self.history, &self.config, &self.clock);
        transformer.run(&mut self.state, options)
    }

    fn run(&mut self) -> TransformReport {
        self.run_with(&RunOptions::default()).unwrap()
    }
}

fn asset_099() -> EntityKey {
    EntityKey::new("asset", "ASSET_099")
}

// ============================================================================
// ASSET_099 lifecycle
// ============================================================================

#[test]
fn test_new_entity_gets_one_current_row() {
    let mut p = Pipeline::new();
    p.land([asset("ASSET_099", 1, t(1), "ACTIVE")]);

    let report = p.run();
    assert_eq!(report.inserted, 1);

    let rows = p.history.history(&asset_099());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].valid_from, t(1));
    assert_eq!(rows[0].valid_to, None);
    assert!(rows[0].is_current);
    assert_eq!(rows[0].version, 1);
    assert_eq!(rows[0].surrogate_id, SurrogateId::for_key(&asset_099()));
}

#[test]
fn test_attribute_change_closes_and_inserts() {
    let mut p = Pipeline::new();
    p.land([asset("ASSET_099", 1, t(1), "ACTIVE")]);
    p.run();
    p.land([asset("ASSET_099", 2, t(2), "MAINTENANCE")]);
    let report = p.run();
    assert_eq!(report.updated, 1);

    let rows = p.history.history(&asset_099());
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].valid_to, Some(t(2)));
    assert!(!rows[0].is_current);
    assert_eq!(rows[1].valid_from, t(2));
    assert_eq!(rows[1].valid_to, None);
    assert!(rows[1].is_current);
    assert_eq!(rows[1].attributes["asset_status"], json!("MAINTENANCE"));
    assert_eq!(rows[1].attributes["zone_id"], json!("ZONE_A"));
}

#[test]
fn test_identical_record_is_a_no_op() {
    let mut p = Pipeline::new();
    p.land([asset("ASSET_099", 1, t(1), "ACTIVE")]);
    p.run();
    p.land([asset("ASSET_099", 2, t(2), "MAINTENANCE")]);
    p.run();
    p.land([asset("ASSET_099", 3, t(3), "MAINTENANCE")]);
    let report = p.run();

    assert_eq!(report.unchanged, 1);
    assert_eq!(report.rows_written(), 0);
    assert_eq!(p.history.history(&asset_099()).len(), 2);
}

#[test]
fn test_delete_retires_without_replacement() {
    let mut p = Pipeline::new();
    p.land([
        asset("ASSET_099", 1, t(1), "ACTIVE"),
        asset("ASSET_099", 2, t(2), "MAINTENANCE"),
        asset("ASSET_099", 3, t(3), "MAINTENANCE"),
    ]);
    p.run();
    p.land([record("asset", "ASSET_099", 4, Operation::Delete, t(4), json!({}))]);
    let report = p.run();
    assert_eq!(report.retired, 1);

    let rows = p.history.history(&asset_099());
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].valid_to, Some(t(4)));
    assert!(!rows[1].is_current);
    assert!(rows[1].retired);
    assert!(p.history.current(&asset_099()).is_none());
    assert!(p.history.verify_all().is_ok());
}

#[test]
fn test_retired_key_can_return() {
    let mut p = Pipeline::new();
    p.land([
        asset("ASSET_099", 1, t(1), "ACTIVE"),
        record("asset", "ASSET_099", 2, Operation::Delete, t(2), json!({})),
    ]);
    p.run();
    p.land([asset("ASSET_099", 3, t(5), "ACTIVE")]);
    p.run();

    let rows = p.history.history(&asset_099());
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].version, 2);
    assert_eq!(rows[1].valid_from, t(5));
    assert!(p.history.as_of(&asset_099(), t(3)).is_none());
    assert!(p.history.verify_key(&asset_099()).is_ok());
}

#[test]
fn test_delete_of_unknown_key_is_ignored() {
    let mut p = Pipeline::new();
    p.land([record("asset", "ASSET_404", 1, Operation::Delete, t(1), json!({}))]);
    let report = p.run();
    assert_eq!(report.unchanged, 1);
    assert!(p.history.history(&EntityKey::new("asset", "ASSET_404")).is_empty());
    assert!(report.watermark_advanced);
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn test_same_load_time_applies_higher_sequence_last() {
    let mut p = Pipeline::new();
    p.land([
        asset("ASSET_099", 8, t(1), "MAINTENANCE"),
        asset("ASSET_099", 7, t(1), "ACTIVE"),
    ]);
    p.run();

    let current = p.history.current(&asset_099()).unwrap();
    assert_eq!(current.attributes["asset_status"], json!("MAINTENANCE"));
    assert_eq!(current.source_sequence, 8);
    assert!(p.history.verify_key(&asset_099()).is_ok());
}

#[test]
fn test_late_record_is_skipped_as_stale() {
    let mut p = Pipeline::new();
    p.land([asset("ASSET_099", 1, t(1), "ACTIVE"), asset("ASSET_099", 3, t(3), "IDLE")]);
    p.run();

    // Arrives after the t(3) change was applied but describes t(2).
    p.land([asset("ASSET_099", 2, t(2), "MAINTENANCE")]);
    let report = p.run();

    assert_eq!(report.stale_skipped, 1);
    assert_eq!(report.rows_written(), 0);
    let current = p.history.current(&asset_099()).unwrap();
    assert_eq!(current.attributes["asset_status"], json!("IDLE"));
}

#[test]
fn test_redelivery_is_absorbed_end_to_end() {
    let mut p = Pipeline::new();
    p.land([asset("ASSET_099", 1, t(1), "ACTIVE")]);
    p.run();
    p.land([asset("ASSET_099", 1, t(1), "ACTIVE")]);
    let report = p.run();

    assert_eq!(report.keys_seen, 0);
    assert_eq!(p.history.history(&asset_099()).len(), 1);
}

// ============================================================================
// Catalog and references
// ============================================================================

#[test]
fn test_references_resolve_to_surrogate_ids() {
    let mut p = Pipeline::new();
    p.land([asset("ASSET_099", 1, t(1), "ACTIVE")]);
    p.run();

    let current = p.history.current(&asset_099()).unwrap();
    let line_sk = SurrogateId::for_key(&EntityKey::new("production_line", "LINE_1"));
    assert_eq!(current.attributes["production_line_id_sk"], json!(line_sk.0));
    assert!(!current.attributes.contains_key("site_code_sk"));
}

#[test]
fn test_fact_streams_are_not_versioned() {
    let mut p = Pipeline::new();
    p.land([record(
        "shift_metrics",
        "2024-12-01|LINE_1|A",
        1,
        Operation::Insert,
        t(1),
        json!({"metric_date": "2024-12-01", "production_line_id": "LINE_1", "oee_pct": 80.0}),
    )]);
    let report = p.run();

    assert_eq!(report.keys_seen, 1);
    assert_eq!(report.unmanaged, 1);
    assert!(p.history.keys().is_empty());
    assert!(report.watermark_advanced);
}

#[test]
fn test_reserved_payload_fields_are_dropped() {
    let mut p = Pipeline::new();
    p.land([record(
        "site",
        "SITE_BER",
        1,
        Operation::Insert,
        t(1),
        json!({"site_name": "Berlin", "is_current": false, "valid_to": "2020-01-01T00:00:00Z"}),
    )]);
    p.run();

    let current = p.history.current(&EntityKey::new("site", "SITE_BER")).unwrap();
    assert!(current.is_current);
    assert_eq!(current.valid_to, None);
    assert!(!current.attributes.contains_key("is_current"));
    assert_eq!(current.attributes["site_name"], json!("Berlin"));
}

// ============================================================================
// Idempotence and re-run safety
// ============================================================================

fn fleet() -> Vec<LandingRecord> {
    let mut records = Vec::new();
    for n in 0..12u64 {
        let key = format!("AGV_{n:03}");
        records.push(asset(&key, 1, t(1), "ACTIVE"));
        if n % 2 == 0 {
            records.push(asset(&key, 2, t(2), "MAINTENANCE"));
        }
        if n % 3 == 0 {
            records.push(asset(&key, 3, t(3), "MAINTENANCE"));
        }
        if n % 5 == 0 {
            records.push(record("asset", &key, 4, Operation::Delete, t(4), json!({})));
        }
    }
    records
}

#[test]
fn test_second_run_writes_nothing() {
    let mut p = Pipeline::new();
    p.land(fleet());
    let first = p.run();
    assert!(first.rows_written() > 0);
    let before = p.history.snapshot();

    let second = p.run();
    assert_eq!(second.keys_seen, 0);
    assert_eq!(second.rows_written(), 0);

    // Replaying every landed record from scratch changes nothing either.
    p.state = TransformState::default();
    let replay = p.run();
    assert_eq!(replay.keys_seen, 12);
    assert_eq!(replay.rows_written(), 0);
    assert_eq!(replay.retired, 0);
    assert_eq!(p.history.snapshot(), before);
}

#[test]
fn test_interrupted_run_converges_to_full_run() {
    let mut full = Pipeline::new();
    full.land(fleet());
    full.run();

    let mut staged = Pipeline::new();
    staged.land(fleet());
    let partial = staged
        .run_with(&RunOptions {
            max_keys: Some(5),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(partial.keys_processed, 5);
    assert_eq!(partial.deferred, 7);
    assert!(!partial.watermark_advanced);
    assert_eq!(staged.state.watermark, 0);

    let rest = staged.run();
    assert!(rest.watermark_advanced);
    assert_eq!(staged.history.snapshot(), full.history.snapshot());
}

#[test]
fn test_bounded_runs_walk_every_key_then_advance() {
    let mut full = Pipeline::new();
    full.land(fleet());
    full.run();

    let mut staged = Pipeline::new();
    staged.land(fleet());
    let bounded = RunOptions {
        max_keys: Some(5),
        ..Default::default()
    };

    let mut processed = Vec::new();
    loop {
        let report = staged.run_with(&bounded).unwrap();
        processed.push(report.keys_processed);
        if report.watermark_advanced {
            break;
        }
        assert!(processed.len() < 10, "bounded runs stopped making progress");
        assert_eq!(staged.state.watermark, 0);
    }

    assert_eq!(processed, vec![5, 5, 2]);
    assert_eq!(staged.state.watermark, staged.landing.high_water());
    assert!(staged.state.staged.is_none());
    assert_eq!(staged.history.snapshot(), full.history.snapshot());
    assert_eq!(staged.run_with(&bounded).unwrap().keys_seen, 0);
}

#[test]
fn test_bounded_run_resumes_after_the_last_key() {
    let mut p = Pipeline::new();
    p.land(fleet());
    let bounded = RunOptions {
        max_keys: Some(4),
        ..Default::default()
    };

    p.run_with(&bounded).unwrap();
    let pass = p.state.staged.clone().expect("pass in progress");
    assert_eq!(pass.after, EntityKey::new("asset", "AGV_003"));
    assert_eq!(pass.through, p.landing.high_water());

    let second = p.run_with(&bounded).unwrap();
    assert_eq!(second.resumed_after, Some(EntityKey::new("asset", "AGV_003")));
    assert!(p.history.current(&EntityKey::new("asset", "AGV_004")).is_some());
    assert!(p.history.keys().len() >= 8);
}

#[test]
fn test_failure_in_an_early_stage_holds_the_watermark() {
    let mut p = Pipeline::new();
    p.land(fleet());
    let bounded = RunOptions {
        max_keys: Some(5),
        ..Default::default()
    };

    let busy = EntityKey::new("asset", "AGV_001");
    let first = {
        let _claim = p.history.claim(&busy).unwrap();
        let transformer = Transformer::new(&p.landing, &p.history, &p.config, &p.clock);
        transformer.run(&mut p.state, &bounded).unwrap()
    };
    assert_eq!(first.failed.len(), 1);
    assert!(p.state.staged.as_ref().is_some_and(|pass| pass.failed));

    p.run_with(&bounded).unwrap();
    let last = p.run_with(&bounded).unwrap();
    assert!(last.failed.is_empty());
    assert!(!last.watermark_advanced);
    assert_eq!(p.state.watermark, 0);
    assert!(p.state.staged.is_none());

    // The next pass starts over and retries the failed key.
    let retry = p.run();
    assert!(retry.watermark_advanced);
    assert!(p.history.current(&busy).is_some());
}

#[test]
fn test_cancelled_run_keeps_the_watermark() {
    let mut p = Pipeline::new();
    p.land(fleet());
    let options = RunOptions::default();
    options.cancel.cancel();

    let report = p.run_with(&options).unwrap();
    assert!(report.cancelled);
    assert_eq!(report.keys_processed, 0);
    assert_eq!(report.deferred, 12);
    assert!(!report.watermark_advanced);
    assert!(p.history.keys().is_empty());
}

#[test]
fn test_parallel_and_sequential_runs_agree() {
    let mut sequential = Pipeline::new();
    sequential.config.workers = 1;
    sequential.land(fleet());
    sequential.run();

    let mut parallel = Pipeline::new();
    parallel.config.workers = 4;
    parallel.land(fleet());
    parallel.run();

    assert_eq!(parallel.history.snapshot(), sequential.history.snapshot());
    assert!(parallel.history.verify_all().is_ok());
}

#[test]
fn test_busy_key_fails_alone_and_retries() {
    let mut p = Pipeline::new();
    p.land([
        asset("AGV_001", 1, t(1), "ACTIVE"),
        asset("AGV_002", 1, t(1), "ACTIVE"),
    ]);

    let busy = EntityKey::new("asset", "AGV_001");
    let report = {
        let _claim = p.history.claim(&busy).unwrap();
        let transformer = Transformer::new(&p.landing, &p.history, &p.config, &p.clock);
        transformer.run(&mut p.state, &RunOptions::default()).unwrap()
    };
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, busy);
    assert_eq!(report.inserted, 1);
    assert!(!report.watermark_advanced);

    let retry = p.run();
    assert!(retry.failed.is_empty());
    assert_eq!(retry.inserted, 1);
    assert!(retry.watermark_advanced);
    assert!(p.history.current(&busy).is_some());
}

#[test]
fn test_invariant_errors_are_fatal() {
    let breach = InvariantBreach {
        key: asset_099(),
        detail: "two current rows".to_string(),
    };
    let err = TransformError::Store(StoreError::Invariant(breach));
    assert!(err.is_fatal());
    assert!(!TransformError::Store(StoreError::KeyBusy(asset_099())).is_fatal());
}

#[test]
fn test_checkpoint_round_trip_between_runs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("transform_state.json");

    let mut p = Pipeline::new();
    p.land(fleet());
    let report = p.run();
    p.state.save(&path).unwrap();

    let restored = TransformState::load(&path).unwrap();
    assert_eq!(restored.watermark, p.landing.high_water());
    assert_eq!(restored.last_run, Some(report.run_id));

    p.state = restored;
    assert_eq!(p.run().keys_seen, 0);
}
