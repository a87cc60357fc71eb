//! Incremental transformer: landing records -> history-tracked entities.
//!
//! A run picks up every key that received landing records since the
//! checkpoint watermark and replays that key's not-yet-applied records in
//! `(load_time, sequence)` order:
//!
//! - no current row: insert version 1 (or the next version after a retirement)
//! - current row, empty field diff: no-op
//! - current row, non-empty diff: close it at the record's load time and
//!   insert the merged attributes as the next version
//! - delete: close the current row as retired, insert nothing
//!
//! Each mutation is one atomic [`KeyCommit`] made under the key's
//! [`KeyClaim`], so keys can be spread over a rayon pool without two workers
//! ever writing the same current row.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use voltstream_storage::{
    is_bookkeeping_field, Attributes, Audit, CloseRow, EntityKey, HistoryStore, KeyClaim,
    KeyCommit, LandingRecord, LandingStore, Operation, SurrogateId, Timestamp, VersionRow,
};

use crate::checkpoint::{StagedPass, TransformState};
use crate::{Clock, EntitySpec, PipelineConfig, Result, TransformError};

// ============================================================================
// Run Control
// ============================================================================

/// Shared flag checked between keys; setting it stops the run early.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Process at most this many keys (staged runs).
    pub max_keys: Option<usize>,
    pub cancel: CancelFlag,
}

// ============================================================================
// Diff
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub before: Option<Value>,
    pub after: Value,
}

/// Fields of `incoming` whose value differs from `current`.
///
/// Fields absent from `incoming` are not changes: payloads may be partial.
pub fn diff_attributes(current: &Attributes, incoming: &Attributes) -> Vec<FieldChange> {
    incoming
        .iter()
        .filter(|(field, _)| !is_bookkeeping_field(field))
        .filter_map(|(field, after)| {
            let before = current.get(field);
            (before != Some(after)).then(|| FieldChange {
                field: field.clone(),
                before: before.cloned(),
                after: after.clone(),
            })
        })
        .collect()
}

// ============================================================================
// Report
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub retired: usize,
    pub unchanged: usize,
    pub stale: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformReport {
    pub run_id: Uuid,
    /// Keys touched since the watermark, managed or not.
    pub keys_seen: usize,
    pub keys_processed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub retired: usize,
    pub unchanged: usize,
    /// Newly landed records older than what the key already reflects.
    pub stale_skipped: usize,
    /// Touched keys of entity types the pipeline does not version.
    pub unmanaged: usize,
    /// Keys left for a later run (`max_keys` or cancellation).
    pub deferred: usize,
    /// The staged pass this run continued, if any.
    #[serde(default)]
    pub resumed_after: Option<EntityKey>,
    pub failed: Vec<(EntityKey, String)>,
    pub cancelled: bool,
    pub watermark: u64,
    pub watermark_advanced: bool,
}

impl TransformReport {
    fn new(run_id: Uuid, watermark: u64) -> Self {
        Self {
            run_id,
            keys_seen: 0,
            keys_processed: 0,
            inserted: 0,
            updated: 0,
            retired: 0,
            unchanged: 0,
            stale_skipped: 0,
            unmanaged: 0,
            deferred: 0,
            resumed_after: None,
            failed: Vec::new(),
            cancelled: false,
            watermark,
            watermark_advanced: false,
        }
    }

    fn absorb(&mut self, outcome: KeyOutcome) {
        self.keys_processed += 1;
        self.inserted += outcome.inserted;
        self.updated += outcome.updated;
        self.retired += outcome.retired;
        self.unchanged += outcome.unchanged;
        self.stale_skipped += outcome.stale;
    }

    /// Version rows added by the run (closes are not counted).
    pub fn rows_written(&self) -> usize {
        self.inserted + self.updated
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && !self.cancelled && self.deferred == 0
    }
}

enum Applied {
    Inserted,
    Updated,
    Retired,
    Unchanged,
}

// ============================================================================
// Transformer
// ============================================================================

pub struct Transformer<'a> {
    landing: &'a LandingStore,
    history: &'a HistoryStore,
    config: &'a PipelineConfig,
    clock: &'a dyn Clock,
}

impl<'a> Transformer<'a> {
    pub fn new(
        landing: &'a LandingStore,
        history: &'a HistoryStore,
        config: &'a PipelineConfig,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            landing,
            history,
            config,
            clock,
        }
    }

    /// One incremental run from `state.watermark`.
    ///
    /// The watermark only advances when every touched key was applied. A
    /// `max_keys` bound splits the pass over several runs: each stops after
    /// `max_keys` keys, records the last one in `state.staged`, and the next
    /// run resumes after it. The watermark moves once the final stage ends
    /// with no key failed in any stage.
    ///
    /// A fatal invariant breach stops the run and is returned as the error;
    /// commits already made for other keys stand.
    pub fn run(&self, state: &mut TransformState, options: &RunOptions) -> Result<TransformReport> {
        let run_id = Uuid::new_v4();
        let since = state.watermark;
        let (touched, high_water) = self.landing.touched_since(since);
        let pass = state.staged.take().filter(|pass| pass.from == since);
        let through = pass.as_ref().map_or(high_water, |pass| pass.through);

        let mut report = TransformReport::new(run_id, since);
        report.keys_seen = touched.len();

        let (mut keys, unmanaged): (Vec<EntityKey>, Vec<EntityKey>) = touched
            .into_iter()
            .partition(|key| self.config.is_managed(&key.entity));
        report.unmanaged = unmanaged.len();
        if let Some(pass) = &pass {
            keys.retain(|key| key > &pass.after);
            report.resumed_after = Some(pass.after.clone());
        }
        let mut bounded = false;
        if let Some(max) = options.max_keys {
            if keys.len() > max {
                report.deferred = keys.len() - max;
                keys.truncate(max);
                bounded = true;
            }
        }

        tracing::info!(
            %run_id,
            keys = keys.len(),
            unmanaged = report.unmanaged,
            resumed_after = ?report.resumed_after,
            from = since,
            to = through,
            "transform run started"
        );

        let results = self.apply_keys(&keys, since, &options.cancel)?;
        for (key, result) in keys.iter().zip(results) {
            match result {
                None => {
                    report.cancelled = true;
                    report.deferred += 1;
                }
                Some(Ok(outcome)) => report.absorb(outcome),
                Some(Err(err)) if err.is_fatal() => {
                    tracing::error!(%run_id, key = %key, error = %err, "transform run aborted");
                    return Err(err.into_fatal());
                }
                Some(Err(err)) => {
                    tracing::warn!(key = %key, error = %err, "key failed, will retry next run");
                    report.failed.push((key.clone(), err.to_string()));
                }
            }
        }

        let earlier_failed = pass.as_ref().is_some_and(|pass| pass.failed);
        if report.cancelled {
            // Redo this stage.
            state.staged = pass;
        } else if bounded {
            state.staged = match keys.last() {
                Some(last) => Some(StagedPass {
                    from: since,
                    through,
                    after: last.clone(),
                    failed: earlier_failed || !report.failed.is_empty(),
                }),
                None => pass,
            };
        } else if report.is_complete() && !earlier_failed {
            state.watermark = through;
            state.last_run = Some(run_id);
            state.last_run_at = Some(self.clock.now());
            report.watermark = through;
            report.watermark_advanced = true;
        }

        tracing::info!(
            %run_id,
            inserted = report.inserted,
            updated = report.updated,
            retired = report.retired,
            unchanged = report.unchanged,
            stale = report.stale_skipped,
            failed = report.failed.len(),
            deferred = report.deferred,
            watermark = report.watermark,
            "transform run finished"
        );
        Ok(report)
    }

    /// Apply `keys` on the worker pool. `None` marks a key skipped because the
    /// run was cancelled or aborted before it started.
    fn apply_keys(
        &self,
        keys: &[EntityKey],
        since: u64,
        cancel: &CancelFlag,
    ) -> Result<Vec<Option<Result<KeyOutcome>>>> {
        let abort = CancelFlag::new();
        let work = |key: &EntityKey| {
            if cancel.is_cancelled() || abort.is_cancelled() {
                return None;
            }
            let result = self.apply_key(key, since);
            if matches!(&result, Err(err) if err.is_fatal()) {
                abort.cancel();
            }
            Some(result)
        };

        if self.config.workers <= 1 || keys.len() <= 1 {
            return Ok(keys.iter().map(work).collect());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .thread_name(|i| format!("voltstream-transform-{i}"))
            .build()
            .map_err(|e| TransformError::Pool(e.to_string()))?;
        Ok(pool.install(|| keys.par_iter().map(work).collect()))
    }

    /// Bring one key up to date with everything landed for it.
    ///
    /// Records landed at or below `since` were seen by an earlier complete
    /// run; they are replayed (harmlessly) but never counted as stale.
    pub fn apply_key(&self, key: &EntityKey, since: u64) -> Result<KeyOutcome> {
        let spec = self
            .config
            .entity(&key.entity)
            .ok_or_else(|| TransformError::UnknownEntity(key.entity.clone()))?;
        let claim = self.history.claim(key)?;

        let mut outcome = KeyOutcome::default();
        for stored in self.landing.records_for(key) {
            let record = &stored.record;
            let last = self.history.last_row(key);
            if let Some(last) = &last {
                if record.apply_order() <= last.applied_through() {
                    if stored.offset > since {
                        tracing::warn!(
                            key = %key,
                            sequence = record.sequence,
                            load_time = %record.load_time,
                            "skipping stale landing record"
                        );
                        outcome.stale += 1;
                    }
                    continue;
                }
            }

            match self.apply_record(&claim, spec, record, last)? {
                Applied::Inserted => outcome.inserted += 1,
                Applied::Updated => outcome.updated += 1,
                Applied::Retired => outcome.retired += 1,
                Applied::Unchanged => outcome.unchanged += 1,
            }
        }

        self.history
            .verify_key(key)
            .map_err(TransformError::Invariant)?;
        tracing::debug!(key = %key, ?outcome, "key applied");
        Ok(outcome)
    }

    fn apply_record(
        &self,
        claim: &KeyClaim<'_>,
        spec: &EntitySpec,
        record: &LandingRecord,
        last: Option<VersionRow>,
    ) -> Result<Applied> {
        let key = claim.key();
        let now = self.clock.now();
        let current = last.as_ref().filter(|row| row.is_current);

        let commit = match (record.operation, current) {
            (Operation::Delete, None) => {
                tracing::debug!(key = %key, sequence = record.sequence, "delete for key with no current row");
                return Ok(Applied::Unchanged);
            }
            (Operation::Delete, Some(cur)) => KeyCommit {
                key: key.clone(),
                close: Some(self.close_row(cur, record, true, now)),
                insert: None,
            },
            (_, None) => {
                let version = last.as_ref().map_or(1, |row| row.version + 1);
                let attributes = self.incoming_attributes(spec, record);
                KeyCommit {
                    key: key.clone(),
                    close: None,
                    insert: Some(self.new_row(key, version, attributes, record, now)),
                }
            }
            (_, Some(cur)) => {
                let incoming = self.incoming_attributes(spec, record);
                let changes = diff_attributes(&cur.attributes, &incoming);
                if changes.is_empty() {
                    return Ok(Applied::Unchanged);
                }
                tracing::debug!(
                    key = %key,
                    fields = ?changes.iter().map(|c| c.field.as_str()).collect::<Vec<_>>(),
                    "attribute change"
                );
                let mut merged = cur.attributes.clone();
                merged.extend(incoming);
                KeyCommit {
                    key: key.clone(),
                    close: Some(self.close_row(cur, record, false, now)),
                    insert: Some(self.new_row(key, cur.version + 1, merged, record, now)),
                }
            }
        };

        let applied = match (&commit.close, &commit.insert) {
            (Some(_), None) => Applied::Retired,
            (Some(_), Some(_)) => Applied::Updated,
            _ => Applied::Inserted,
        };
        self.history.commit(claim, commit)?;
        Ok(applied)
    }

    /// Payload minus reserved fields, plus resolved `<field>_sk` references.
    fn incoming_attributes(&self, spec: &EntitySpec, record: &LandingRecord) -> Attributes {
        let mut attributes = Attributes::new();
        for (field, value) in &record.payload {
            if is_bookkeeping_field(field) {
                tracing::warn!(
                    key = %record.entity_key(),
                    field = %field,
                    "dropping reserved field from payload"
                );
                continue;
            }
            attributes.insert(field.clone(), value.clone());
        }

        for (field, target) in &spec.references {
            let natural_key = match attributes.get(field) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => continue,
            };
            let sk = SurrogateId::for_key(&EntityKey::new(target.clone(), natural_key));
            attributes.insert(format!("{field}_sk"), Value::from(sk.0));
        }
        attributes
    }

    fn new_row(
        &self,
        key: &EntityKey,
        version: u32,
        attributes: Attributes,
        record: &LandingRecord,
        now: Timestamp,
    ) -> VersionRow {
        VersionRow {
            surrogate_id: SurrogateId::for_key(key),
            entity_key: key.clone(),
            version,
            attributes,
            valid_from: record.load_time,
            valid_to: None,
            is_current: true,
            retired: false,
            source_sequence: record.sequence,
            closed_sequence: None,
            audit: Audit {
                created_by: self.config.actor.clone(),
                created_at: now,
                updated_by: self.config.actor.clone(),
                updated_at: now,
            },
        }
    }

    fn close_row(
        &self,
        current: &VersionRow,
        record: &LandingRecord,
        retired: bool,
        now: Timestamp,
    ) -> CloseRow {
        CloseRow {
            version: current.version,
            valid_to: record.load_time,
            sequence: record.sequence,
            retired,
            updated_by: self.config.actor.clone(),
            updated_at: now,
        }
    }
}
