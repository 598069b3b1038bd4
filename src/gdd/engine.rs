//! Mutation engine for GDD models: creation, forward accumulation,
//! parameter edits (forward-only and retroactive), manual resets, and the
//! background recalculation task.
//!
//! Every mutating operation holds the model's exclusive lock for its whole
//! duration; contention is rejected as retryable, never queued. Compound
//! rewrites run under one store transaction so a partial failure leaves the
//! prior timeline intact.

use anyhow::{Context, Result};
use chrono::{Days, NaiveDate, Utc};
use rusqlite::Connection;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::gdd::accumulator::{accumulate, GapPolicy, Segment};
use crate::gdd::error::GddError;
use crate::gdd::ledger;
use crate::models::{
    GddModel, ModelMetadataEdit, NewGddModel, NewObservation, ParameterEdit, ParameterSet,
    ResetKind, Run,
};
use crate::store::{self, GddStore};
use crate::tasks::{ModelGuard, ModelLocks, TaskHandle, TaskMonitor};
use serde::Serialize;

pub const RECALC_TASK_NAME: &str = "gdd_recalculation";

/// Outcome of a parameter edit.
#[derive(Debug)]
pub enum EditOutcome {
    /// Forward-only: the new set is in effect, history untouched.
    Forward { effective: ParameterSet },
    /// Retroactive: a recalculation task was launched.
    Recalculating { task_id: Uuid },
}

/// Current-run summary for the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_number: i64,
    pub start_date: NaiveDate,
    pub cumulative: f64,
    pub days_elapsed: i64,
    pub last_value_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub model: GddModel,
    /// The parameter set effective today.
    pub parameters: Option<ParameterSet>,
    pub current_run: Option<RunSummary>,
}

/// Result of an observation ingest for one location.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub stored: usize,
    pub models_extended: usize,
    /// Models skipped because another mutation held their lock.
    pub models_busy: Vec<i64>,
}

#[derive(Clone)]
pub struct GddEngine {
    store: Arc<GddStore>,
    locks: Arc<ModelLocks>,
    tasks: Arc<TaskMonitor>,
}

impl GddEngine {
    pub fn new(store: Arc<GddStore>, tasks: Arc<TaskMonitor>) -> Self {
        Self {
            store,
            locks: ModelLocks::new(),
            tasks,
        }
    }

    pub fn store(&self) -> &Arc<GddStore> {
        &self.store
    }

    pub fn tasks(&self) -> &Arc<TaskMonitor> {
        &self.tasks
    }

    // ===== Model lifecycle =====

    /// Create a model, seed its first parameter set and initial run, and
    /// accumulate any observations already on file.
    pub fn create_model(&self, new: NewGddModel) -> Result<GddModel> {
        validate_parameters(new.base_temp, new.threshold)?;
        if new.name.trim().is_empty() {
            return Err(GddError::Validation("model name must not be empty".into()).into());
        }

        let model = self.store.with_tx(|conn| {
            let model = store::insert_model(conn, &new)?;
            store::insert_parameter_set(
                conn,
                model.id,
                new.base_temp,
                new.threshold,
                new.reset_on_threshold,
                new.start_date,
            )?;
            ledger::open_run(conn, model.id, new.start_date, ResetKind::Initial)?;
            extend_in_tx(conn, &model)?;
            Ok(model)
        })?;
        info!("🌱 created GDD model {} ({})", model.id, model.name);
        Ok(model)
    }

    /// Update identity fields. Parameter changes go through
    /// `apply_parameter_edit`; nothing here touches runs or values.
    pub fn update_model(&self, model_id: i64, edit: ModelMetadataEdit) -> Result<GddModel> {
        let _guard = self.locks.try_acquire(model_id)?;
        self.require_model(model_id)?;
        let name = edit
            .name
            .ok_or_else(|| GddError::Validation("no metadata fields to change".into()))?;
        if name.trim().is_empty() {
            return Err(GddError::Validation("model name must not be empty".into()).into());
        }
        let model = self.store.with_tx(|conn| {
            store::update_model_name(conn, model_id, &name)?;
            store::get_model(conn, model_id)?
                .ok_or_else(|| GddError::ModelNotFound(model_id).into())
        })?;
        info!("🔧 model {} renamed to {}", model_id, model.name);
        Ok(model)
    }

    pub fn delete_model(&self, model_id: i64) -> Result<()> {
        let _guard = self.locks.try_acquire(model_id)?;
        if !self.store.delete_model(model_id)? {
            return Err(GddError::ModelNotFound(model_id).into());
        }
        info!("🗑️ deleted GDD model {}", model_id);
        Ok(())
    }

    // ===== Forward accumulation =====

    /// Extend the open run through the latest observation, closing and
    /// opening runs on threshold crossings. Restartable: recomputes the
    /// open run from its start. Returns the number of values written.
    pub fn extend_model(&self, model_id: i64) -> Result<usize> {
        let _guard = self.locks.try_acquire(model_id)?;
        let model = self.require_model(model_id)?;
        self.store.with_tx(|conn| extend_in_tx(conn, &model))
    }

    /// Observation ingest boundary: store the readings, then bring every
    /// model at the location up to date.
    pub fn ingest_observations(
        &self,
        location_id: i64,
        observations: &[NewObservation],
    ) -> Result<IngestReport> {
        let stored = self.store.upsert_observations(location_id, observations)?;
        let mut report = IngestReport {
            stored,
            models_extended: 0,
            models_busy: Vec::new(),
        };
        for model in self.store.list_models_by_location(location_id)? {
            match self.extend_model(model.id) {
                Ok(_) => report.models_extended += 1,
                Err(err) => match err.downcast_ref::<GddError>() {
                    Some(GddError::ConcurrentModification { .. }) => {
                        warn!("model {} busy during ingest, skipping", model.id);
                        report.models_busy.push(model.id);
                    }
                    _ => return Err(err),
                },
            }
        }
        Ok(report)
    }

    // ===== Parameter change processor =====

    /// Apply a partial parameter edit. Forward-only edits patch future
    /// behavior inline; retroactive edits launch a recalculation task and
    /// return its handle.
    pub fn apply_parameter_edit(&self, model_id: i64, edit: ParameterEdit) -> Result<EditOutcome> {
        if edit.is_noop() {
            return Err(GddError::Validation("no parameter fields to change".into()).into());
        }
        let guard = self.locks.try_acquire(model_id)?;
        let model = self.require_model(model_id)?;

        let effective_from = edit.effective_from.unwrap_or_else(today);
        if effective_from < model.start_date {
            return Err(GddError::Validation(format!(
                "effective date {} precedes model start {}",
                effective_from, model.start_date
            ))
            .into());
        }

        // Merge omitted fields from the set effective at the edit date.
        let history = self.store.parameter_history(model_id)?;
        let current = history.resolve(effective_from).cloned().ok_or_else(|| {
            GddError::Consistency(format!("no parameter set effective on {}", effective_from))
        })?;
        let base_temp = edit.base_temp.unwrap_or(current.base_temp);
        let threshold = edit.threshold.unwrap_or(current.threshold);
        let reset_on_threshold = edit.reset_on_threshold.unwrap_or(current.reset_on_threshold);
        validate_parameters(base_temp, threshold)?;

        if edit.recalculate_history {
            // Recalculation is bounded to history the edit can affect.
            let runs = self.store.runs(model_id)?;
            if let Some(first) = runs.first() {
                if effective_from < first.start_date {
                    return Err(GddError::Validation(format!(
                        "cannot recalculate from {} before the earliest run start {}",
                        effective_from, first.start_date
                    ))
                    .into());
                }
            }
            let task_id = self.spawn_recalculation(
                guard,
                model,
                base_temp,
                threshold,
                reset_on_threshold,
                effective_from,
            )?;
            return Ok(EditOutcome::Recalculating { task_id });
        }

        // Forward-only: parameter surgery plus a recompute of the open run
        // under per-date resolution. Closed runs are never revisited.
        let effective = self.store.with_tx(|conn| {
            store::supersede_parameters_from(conn, model_id, effective_from)?;
            store::insert_parameter_set(
                conn,
                model_id,
                base_temp,
                threshold,
                reset_on_threshold,
                effective_from,
            )?;
            store::touch_model(conn, model_id)?;
            extend_in_tx(conn, &model)?;
            let history = store::parameter_history(conn, model_id)?;
            history
                .resolve(effective_from)
                .cloned()
                .context("freshly inserted parameter set missing")
        })?;
        info!(
            "🔧 model {} parameters updated forward-only from {}",
            model_id, effective_from
        );
        Ok(EditOutcome::Forward { effective })
    }

    // ===== Manual reset processor =====

    /// Close the open run the day before `reset_date` and start a fresh run
    /// on it. Repeating an already-applied reset date is a no-op.
    pub fn manual_reset(&self, model_id: i64, reset_date: NaiveDate) -> Result<()> {
        let _guard = self.locks.try_acquire(model_id)?;
        let model = self.require_model(model_id)?;

        self.store.with_tx(|conn| {
            let open = ledger::current_run(conn, model_id)?
                .ok_or_else(|| GddError::Consistency(format!("model {} has no open run", model_id)))?;

            if reset_date == open.start_date {
                debug!("model {} already resets on {}, no-op", model_id, reset_date);
                return Ok(());
            }
            if reset_date < open.start_date {
                return Err(GddError::Validation(format!(
                    "reset date {} falls inside a closed run (open run starts {})",
                    reset_date, open.start_date
                ))
                .into());
            }

            let close_at = reset_date
                .checked_sub_days(Days::new(1))
                .ok_or_else(|| GddError::Validation("reset date underflow".into()))?;
            store::delete_values_from(conn, model_id, reset_date)?;
            let new_open = ledger::close_and_open(conn, model_id, close_at, ResetKind::Manual)?;
            fill_open_run(conn, &model, &new_open)?;
            store::touch_model(conn, model_id)?;
            Ok(())
        })?;
        info!("🔄 model {} manually reset at {}", model_id, reset_date);
        Ok(())
    }

    /// Undo a manual reset: merge the manually opened run back into its
    /// predecessor and re-derive the merged span from observations. Only
    /// the most recent reset boundary can be undone; earlier ones are
    /// pinned by the manual or recalculation boundaries that follow them.
    pub fn undo_manual_reset(&self, model_id: i64, run_number: i64) -> Result<()> {
        let _guard = self.locks.try_acquire(model_id)?;
        let model = self.require_model(model_id)?;

        self.store.with_tx(|conn| {
            let runs = ledger::runs(conn, model_id)?;
            let target = runs
                .iter()
                .find(|r| r.run_number == run_number)
                .ok_or_else(|| {
                    GddError::Validation(format!("model {} has no run {}", model_id, run_number))
                })?;
            if target.opened_by != ResetKind::Manual {
                return Err(GddError::Validation(format!(
                    "run {} was opened by {}, not a manual reset",
                    run_number,
                    target.opened_by.as_str()
                ))
                .into());
            }
            // Threshold boundaries are re-derived by the rebuild; manual and
            // recalculation boundaries after the target would be lost by it.
            if runs.iter().any(|r| {
                r.run_number > run_number
                    && matches!(r.opened_by, ResetKind::Manual | ResetKind::Recalc)
            }) {
                return Err(GddError::Validation(format!(
                    "run {} is pinned by a later reset boundary, undo that one first",
                    run_number
                ))
                .into());
            }
            let prev = runs
                .iter()
                .find(|r| r.run_number == run_number - 1)
                .ok_or_else(|| {
                    GddError::Consistency(format!(
                        "run {} has no predecessor to merge into",
                        run_number
                    ))
                })?
                .clone();

            ledger::truncate_from(conn, model_id, prev.start_date)?;
            store::delete_values_from(conn, model_id, prev.start_date)?;
            let merged = ledger::insert_run(
                conn,
                model_id,
                prev.run_number,
                prev.start_date,
                None,
                prev.opened_by,
            )?;
            fill_open_run(conn, &model, &merged)?;
            store::touch_model(conn, model_id)?;
            Ok(())
        })?;
        info!("↩️ model {} manual reset (run {}) undone", model_id, run_number);
        Ok(())
    }

    // ===== Recalculation =====

    fn spawn_recalculation(
        &self,
        guard: ModelGuard,
        model: GddModel,
        base_temp: f64,
        threshold: f64,
        reset_on_threshold: bool,
        effective_from: NaiveDate,
    ) -> Result<Uuid> {
        let handle = self.tasks.enqueue(RECALC_TASK_NAME, Some(model.id))?;
        let task_id = handle.task_id;
        let engine = self.clone();

        tokio::task::spawn_blocking(move || {
            engine.tasks.mark_running(task_id);
            info!(
                "♻️ recalculating model {} from {} (task {})",
                model.id, effective_from, task_id
            );
            let result = engine.recalc_transaction(
                &model,
                base_temp,
                threshold,
                reset_on_threshold,
                effective_from,
                &handle,
            );
            // Release the model before the terminal transition so a caller
            // polling the task can immediately mutate again.
            drop(guard);
            match result {
                Ok(written) => {
                    engine.tasks.mark_succeeded(task_id);
                    info!(
                        "♻️ model {} recalculated: {} values from {}",
                        model.id, written, effective_from
                    );
                }
                Err(err) => {
                    error!("recalculation of model {} failed: {:#}", model.id, err);
                    engine.tasks.mark_failed(task_id, &format!("{:#}", err));
                }
            }
        });
        Ok(task_id)
    }

    /// The whole rewrite is one transaction: parameter surgery, suffix
    /// invalidation, and the rebuilt runs and values commit together or not
    /// at all. Cancellation between run batches rolls everything back.
    fn recalc_transaction(
        &self,
        model: &GddModel,
        base_temp: f64,
        threshold: f64,
        reset_on_threshold: bool,
        effective_from: NaiveDate,
        handle: &TaskHandle,
    ) -> Result<usize> {
        self.store.with_tx(|conn| {
            store::supersede_parameters_from(conn, model.id, effective_from)?;
            store::insert_parameter_set(
                conn,
                model.id,
                base_temp,
                threshold,
                reset_on_threshold,
                effective_from,
            )?;

            let next_run = ledger::truncate_from(conn, model.id, effective_from)?;
            store::delete_values_from(conn, model.id, effective_from)?;

            let latest = store::latest_observation_date(conn, model.location_id)?;
            let through = match latest {
                Some(latest) if latest >= effective_from => latest,
                _ => {
                    // No observations to replay; just re-establish the run.
                    ledger::insert_run(
                        conn,
                        model.id,
                        next_run,
                        effective_from,
                        None,
                        ResetKind::Recalc,
                    )?;
                    store::touch_model(conn, model.id)?;
                    return Ok(0);
                }
            };

            let params = store::parameter_history(conn, model.id)?;
            let readings =
                store::readings_for(conn, model.location_id, effective_from, through, model.unit)?;
            // A gap here is a hard failure: recalculation never commits a
            // half-rewritten history.
            let segments = accumulate(
                effective_from,
                through,
                &readings,
                &params,
                model.unit,
                GapPolicy::Fail,
            )?;

            let total = (through - effective_from).num_days() as u64 + 1;
            self.tasks.set_progress(handle.task_id, 0, total);

            let mut written = 0usize;
            for (i, segment) in segments.iter().enumerate() {
                if handle.is_cancelled() {
                    anyhow::bail!("cancelled by operator");
                }
                let run_number = next_run + i as i64;
                let opened_by = if i == 0 {
                    ResetKind::Recalc
                } else {
                    ResetKind::Threshold
                };
                ledger::insert_run(
                    conn,
                    model.id,
                    run_number,
                    segment.start,
                    segment.end,
                    opened_by,
                )?;
                written += store::insert_values(conn, model.id, run_number, &segment.values)?;
                self.tasks
                    .set_progress(handle.task_id, written as u64, total);
            }

            store::touch_model(conn, model.id)?;
            Ok(written)
        })
    }

    // ===== Reads for the presentation layer =====

    pub fn summary(&self, model_id: i64) -> Result<ModelSummary> {
        let model = self.require_model(model_id)?;
        let history = self.store.parameter_history(model_id)?;
        let parameters = history.resolve(today()).cloned();
        let current_run = match self.store.current_run(model_id)? {
            Some(run) => Some(self.run_summary(&model, &run)?),
            None => None,
        };
        Ok(ModelSummary {
            model,
            parameters,
            current_run,
        })
    }

    fn run_summary(&self, model: &GddModel, run: &Run) -> Result<RunSummary> {
        let latest = self.store.latest_value(model.id, run.run_number)?;
        let (cumulative, last_value_date, days_elapsed) = match &latest {
            Some(value) => (
                value.cumulative,
                Some(value.date),
                (value.date - run.start_date).num_days() + 1,
            ),
            None => (0.0, None, 0),
        };
        Ok(RunSummary {
            run_number: run.run_number,
            start_date: run.start_date,
            cumulative,
            days_elapsed,
            last_value_date,
        })
    }

    pub fn dashboard(&self, location_id: i64) -> Result<Vec<ModelSummary>> {
        self.store
            .list_models_by_location(location_id)?
            .into_iter()
            .map(|model| self.summary(model.id))
            .collect()
    }

    fn require_model(&self, model_id: i64) -> Result<GddModel> {
        self.store
            .get_model(model_id)?
            .ok_or_else(|| GddError::ModelNotFound(model_id).into())
    }

    #[cfg(test)]
    pub(crate) fn locks(&self) -> &Arc<ModelLocks> {
        &self.locks
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn validate_parameters(base_temp: f64, threshold: f64) -> Result<()> {
    if !base_temp.is_finite() {
        return Err(GddError::Validation("base temperature must be finite".into()).into());
    }
    if !threshold.is_finite() || threshold <= 0.0 {
        return Err(GddError::Validation("threshold must be positive".into()).into());
    }
    Ok(())
}

/// Recompute the open run from its start through the latest observation,
/// persisting threshold boundaries as they fall. Gap days are carried at
/// zero with their `missing` flag set.
fn extend_in_tx(conn: &Connection, model: &GddModel) -> Result<usize> {
    let open = ledger::current_run(conn, model.id)?
        .ok_or_else(|| GddError::Consistency(format!("model {} has no open run", model.id)))?;
    fill_open_run(conn, model, &open)
}

fn fill_open_run(conn: &Connection, model: &GddModel, open: &Run) -> Result<usize> {
    let latest = match store::latest_observation_date(conn, model.location_id)? {
        Some(latest) if latest >= open.start_date => latest,
        _ => return Ok(0),
    };

    let params = store::parameter_history(conn, model.id)?;
    let readings =
        store::readings_for(conn, model.location_id, open.start_date, latest, model.unit)?;
    let segments = accumulate(
        open.start_date,
        latest,
        &readings,
        &params,
        model.unit,
        GapPolicy::SkipAndFlag,
    )?;

    store::delete_values_from(conn, model.id, open.start_date)?;
    persist_from_open(conn, model.id, open, &segments)
}

/// Persist accumulator output where the first segment belongs to the
/// already-open run and later segments are threshold-opened successors.
fn persist_from_open(
    conn: &Connection,
    model_id: i64,
    open: &Run,
    segments: &[Segment],
) -> Result<usize> {
    let mut written = 0usize;
    for (i, segment) in segments.iter().enumerate() {
        let run_number = if i == 0 {
            open.run_number
        } else {
            ledger::open_run(conn, model_id, segment.start, ResetKind::Threshold)?.run_number
        };
        if let Some(end) = segment.end {
            ledger::close_run(conn, model_id, run_number, end)?;
        }
        written += store::insert_values(conn, model_id, run_number, &segment.values)?;
    }
    Ok(written)
}

/// Check the partition property: runs ordered, gapless, non-overlapping,
/// exactly one open. Used by tests.
#[cfg(test)]
pub(crate) fn assert_valid_partition(runs: &[Run]) {
    assert!(!runs.is_empty(), "model must always have runs");
    for pair in runs.windows(2) {
        let end = pair[0].end_date.expect("only the last run may be open");
        assert_eq!(
            pair[1].start_date,
            end.checked_add_days(Days::new(1)).unwrap(),
            "runs must be adjacent"
        );
        assert_eq!(pair[1].run_number, pair[0].run_number + 1);
    }
    assert!(runs.last().unwrap().is_open(), "last run must be open");
}
