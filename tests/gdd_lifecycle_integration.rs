//! Integration tests for the GDD engine lifecycle.
//!
//! Each test drives the full stack (engine, ledger, store) against a
//! temporary SQLite database: ingest weather, create models, edit
//! parameters, reset, and recalculate, then check the run partition and
//! value series that come back.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate};
use tempfile::TempDir;
use uuid::Uuid;

use turftrack_backend::gdd::{EditOutcome, GddEngine};
use turftrack_backend::models::{
    NewGddModel, NewObservation, ParameterEdit, ResetKind, Run, TempUnit, WeatherKind,
};
use turftrack_backend::store::GddStore;
use turftrack_backend::tasks::{TaskMonitor, TaskState};

fn d(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

fn setup() -> (TempDir, Arc<GddEngine>) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(GddStore::open(dir.path().join("turftrack.db")).unwrap());
    let tasks = Arc::new(TaskMonitor::new(store.clone()));
    (dir, Arc::new(GddEngine::new(store, tasks)))
}

fn constant_weather(start: NaiveDate, days: u64, temp_f: f64) -> Vec<NewObservation> {
    (0..days)
        .map(|i| NewObservation {
            date: start.checked_add_days(Days::new(i)).unwrap(),
            tmin: temp_f,
            tmax: temp_f,
            unit: TempUnit::F,
            kind: WeatherKind::Historical,
        })
        .collect()
}

fn new_model(name: &str, threshold: f64, reset_on_threshold: bool) -> NewGddModel {
    NewGddModel {
        location_id: 1,
        name: name.into(),
        base_temp: 50.0,
        unit: TempUnit::F,
        start_date: d("2024-03-01"),
        threshold,
        reset_on_threshold,
    }
}

/// Runs must be ordered, gapless, non-overlapping, with exactly the last
/// one open and dense run numbering.
fn assert_valid_partition(runs: &[Run]) {
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
    assert!(runs.last().unwrap().end_date.is_none(), "last run must be open");
}

async fn wait_for_terminal(engine: &GddEngine, task_id: Uuid) -> TaskState {
    for _ in 0..200 {
        let record = engine.tasks().get(task_id).unwrap().unwrap();
        if record.state.is_terminal() {
            return record.state;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} never reached a terminal state", task_id);
}

#[test]
fn sixty_days_at_sixty_degrees_splits_on_day_fifty() {
    let (_dir, engine) = setup();
    engine
        .ingest_observations(1, &constant_weather(d("2024-03-01"), 60, 60.0))
        .unwrap();
    let model = engine.create_model(new_model("poa annua", 500.0, true)).unwrap();

    let runs = engine.store().runs(model.id).unwrap();
    assert_valid_partition(&runs);
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].end_date, Some(d("2024-04-19")));
    assert_eq!(runs[0].opened_by, ResetKind::Initial);
    assert_eq!(runs[1].start_date, d("2024-04-20"));
    assert_eq!(runs[1].opened_by, ResetKind::Threshold);

    // Cumulative on the crossing day equals the threshold exactly; every
    // earlier day stays below it; the new run restarts from its own
    // contribution.
    let first = engine.store().values_for_run(model.id, 1).unwrap();
    assert_eq!(first.len(), 50);
    assert_eq!(first.last().unwrap().cumulative, 500.0);
    assert!(first[..49].iter().all(|v| v.cumulative < 500.0));

    let second = engine.store().values_for_run(model.id, 2).unwrap();
    assert_eq!(second[0].cumulative, 10.0);
    assert_eq!(second.last().unwrap().cumulative, 100.0);

    // Cumulative is nondecreasing within each run.
    for run in &runs {
        let values = engine.store().values_for_run(model.id, run.run_number).unwrap();
        for pair in values.windows(2) {
            assert!(pair[1].cumulative >= pair[0].cumulative);
        }
    }
}

#[test]
fn later_observations_extend_without_rewriting_the_past() {
    let (_dir, engine) = setup();
    engine
        .ingest_observations(1, &constant_weather(d("2024-03-01"), 20, 60.0))
        .unwrap();
    let model = engine.create_model(new_model("bentgrass", 5_000.0, true)).unwrap();
    let before = engine.store().values(model.id).unwrap();

    let report = engine
        .ingest_observations(1, &constant_weather(d("2024-03-21"), 10, 70.0))
        .unwrap();
    assert_eq!(report.stored, 10);
    assert_eq!(report.models_extended, 1);

    let after = engine.store().values(model.id).unwrap();
    assert_eq!(after.len(), 30);
    assert_eq!(after[..20], before[..]);
    assert_eq!(after[20].daily, 20.0);
}

#[test]
fn forward_only_edit_changes_the_future_and_only_the_future() {
    let (_dir, engine) = setup();
    engine
        .ingest_observations(1, &constant_weather(d("2024-03-01"), 40, 60.0))
        .unwrap();
    let model = engine.create_model(new_model("fescue", 5_000.0, true)).unwrap();
    let before = engine.store().values(model.id).unwrap();

    let outcome = engine
        .apply_parameter_edit(
            model.id,
            ParameterEdit {
                base_temp: Some(40.0),
                effective_from: Some(d("2024-03-21")),
                recalculate_history: false,
                ..Default::default()
            },
        )
        .unwrap();
    let effective = match outcome {
        EditOutcome::Forward { effective } => effective,
        other => panic!("expected forward outcome, got {:?}", other),
    };
    assert_eq!(effective.base_temp, 40.0);
    assert_eq!(effective.effective_from, d("2024-03-21"));

    let after = engine.store().values(model.id).unwrap();
    assert_eq!(after[..20], before[..20], "history before the edit must not move");
    assert_eq!(after[20].date, d("2024-03-21"));
    assert_eq!(after[20].daily, 20.0);

    // History intervals stay contiguous and non-overlapping.
    let history = engine.store().parameter_history(model.id).unwrap();
    let sets = history.sets();
    assert_eq!(sets.len(), 2);
    assert_eq!(sets[0].effective_to, Some(d("2024-03-21")));
    assert_eq!(sets[1].effective_from, d("2024-03-21"));
    assert!(sets[1].effective_to.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn retroactive_edit_recalculates_in_the_background() {
    let (_dir, engine) = setup();
    engine
        .ingest_observations(1, &constant_weather(d("2024-03-01"), 60, 60.0))
        .unwrap();
    let model = engine.create_model(new_model("ryegrass", 5_000.0, true)).unwrap();

    // Lower the base temperature retroactively from day 30.
    let outcome = engine
        .apply_parameter_edit(
            model.id,
            ParameterEdit {
                base_temp: Some(40.0),
                effective_from: Some(d("2024-03-30")),
                recalculate_history: true,
                ..Default::default()
            },
        )
        .unwrap();
    let task_id = match outcome {
        EditOutcome::Recalculating { task_id } => task_id,
        other => panic!("expected recalculation, got {:?}", other),
    };
    assert_eq!(wait_for_terminal(&engine, task_id).await, TaskState::Succeeded);

    let runs = engine.store().runs(model.id).unwrap();
    assert_valid_partition(&runs);
    assert_eq!(runs[0].end_date, Some(d("2024-03-29")));
    assert_eq!(runs[1].start_date, d("2024-03-30"));
    assert_eq!(runs[1].opened_by, ResetKind::Recalc);

    let values = engine.store().values(model.id).unwrap();
    let day29 = values.iter().find(|v| v.date == d("2024-03-29")).unwrap();
    assert_eq!(day29.daily, 10.0);
    assert_eq!(day29.cumulative, 290.0);
    let day30 = values.iter().find(|v| v.date == d("2024-03-30")).unwrap();
    assert_eq!(day30.daily, 20.0);
    assert_eq!(day30.cumulative, 20.0);

    let record = engine.tasks().get(task_id).unwrap().unwrap();
    assert_eq!(record.model_id, Some(model.id));
    assert!(record.finished_at.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn repeating_a_recalculation_is_idempotent() {
    let (_dir, engine) = setup();
    engine
        .ingest_observations(1, &constant_weather(d("2024-03-01"), 60, 60.0))
        .unwrap();
    let model = engine.create_model(new_model("zoysia", 300.0, true)).unwrap();

    let edit = ParameterEdit {
        base_temp: Some(45.0),
        effective_from: Some(d("2024-03-15")),
        recalculate_history: true,
        ..Default::default()
    };

    let task_id = match engine.apply_parameter_edit(model.id, edit.clone()).unwrap() {
        EditOutcome::Recalculating { task_id } => task_id,
        other => panic!("expected recalculation, got {:?}", other),
    };
    assert_eq!(wait_for_terminal(&engine, task_id).await, TaskState::Succeeded);
    let runs_first = engine.store().runs(model.id).unwrap();
    let values_first = engine.store().values(model.id).unwrap();

    let task_id = match engine.apply_parameter_edit(model.id, edit).unwrap() {
        EditOutcome::Recalculating { task_id } => task_id,
        other => panic!("expected recalculation, got {:?}", other),
    };
    assert_eq!(wait_for_terminal(&engine, task_id).await, TaskState::Succeeded);

    assert_eq!(engine.store().runs(model.id).unwrap().len(), runs_first.len());
    assert_eq!(engine.store().values(model.id).unwrap(), values_first);
    assert_valid_partition(&engine.store().runs(model.id).unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn recalculation_over_a_gap_fails_and_preserves_state() {
    let (_dir, engine) = setup();
    let mut weather = constant_weather(d("2024-03-01"), 30, 60.0);
    weather.remove(20); // no observation on 2024-03-21
    engine.ingest_observations(1, &weather).unwrap();
    let model = engine.create_model(new_model("gappy", 5_000.0, true)).unwrap();

    let runs_before = engine.store().runs(model.id).unwrap();
    let values_before = engine.store().values(model.id).unwrap();

    let task_id = match engine
        .apply_parameter_edit(
            model.id,
            ParameterEdit {
                base_temp: Some(40.0),
                effective_from: Some(d("2024-03-10")),
                recalculate_history: true,
                ..Default::default()
            },
        )
        .unwrap()
    {
        EditOutcome::Recalculating { task_id } => task_id,
        other => panic!("expected recalculation, got {:?}", other),
    };
    assert_eq!(wait_for_terminal(&engine, task_id).await, TaskState::Failed);

    let record = engine.tasks().get(task_id).unwrap().unwrap();
    assert!(record.error.unwrap().contains("2024-03-21"));

    // Nothing moved: runs, values, and parameter history all intact.
    assert_eq!(engine.store().runs(model.id).unwrap().len(), runs_before.len());
    assert_eq!(engine.store().values(model.id).unwrap(), values_before);
    assert_eq!(
        engine.store().parameter_history(model.id).unwrap().sets().len(),
        1
    );

    // The model is usable again once the task is done.
    engine.extend_model(model.id).unwrap();
}

#[test]
fn manual_reset_splits_the_open_run() {
    let (_dir, engine) = setup();
    engine
        .ingest_observations(1, &constant_weather(d("2024-03-01"), 20, 60.0))
        .unwrap();
    let model = engine.create_model(new_model("reset me", 5_000.0, false)).unwrap();

    engine.manual_reset(model.id, d("2024-03-11")).unwrap();

    let runs = engine.store().runs(model.id).unwrap();
    assert_valid_partition(&runs);
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[1].opened_by, ResetKind::Manual);

    let second = engine.store().values_for_run(model.id, 2).unwrap();
    assert_eq!(second[0].date, d("2024-03-11"));
    assert_eq!(second[0].cumulative, 10.0);

    // Same date again: no-op. Earlier date: rejected.
    engine.manual_reset(model.id, d("2024-03-11")).unwrap();
    assert_eq!(engine.store().runs(model.id).unwrap().len(), 2);
    assert!(engine.manual_reset(model.id, d("2024-03-05")).is_err());
}

#[test]
fn undoing_a_manual_reset_merges_the_runs_back() {
    let (_dir, engine) = setup();
    engine
        .ingest_observations(1, &constant_weather(d("2024-03-01"), 20, 60.0))
        .unwrap();
    let model = engine.create_model(new_model("undo me", 5_000.0, false)).unwrap();
    let baseline = engine.store().values(model.id).unwrap();

    engine.manual_reset(model.id, d("2024-03-11")).unwrap();
    assert_eq!(engine.store().runs(model.id).unwrap().len(), 2);

    engine.undo_manual_reset(model.id, 2).unwrap();
    let runs = engine.store().runs(model.id).unwrap();
    assert_valid_partition(&runs);
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].opened_by, ResetKind::Initial);
    assert_eq!(engine.store().values(model.id).unwrap(), baseline);

    // Only manually opened runs can be undone.
    assert!(engine.undo_manual_reset(model.id, 1).is_err());
}

#[test]
fn models_at_one_location_accumulate_independently() {
    let (_dir, engine) = setup();
    engine
        .ingest_observations(1, &constant_weather(d("2024-03-01"), 30, 60.0))
        .unwrap();
    let low = engine.create_model(new_model("low threshold", 100.0, true)).unwrap();
    let high = engine.create_model(new_model("high threshold", 5_000.0, true)).unwrap();

    // 10/day: the low model crosses every 10 days, the high one never.
    let low_runs = engine.store().runs(low.id).unwrap();
    assert_eq!(low_runs.len(), 4);
    assert_valid_partition(&low_runs);
    let high_runs = engine.store().runs(high.id).unwrap();
    assert_eq!(high_runs.len(), 1);

    let summaries = engine.dashboard(1).unwrap();
    assert_eq!(summaries.len(), 2);
}

#[test]
fn celsius_models_read_the_same_weather_in_celsius() {
    let (_dir, engine) = setup();
    // 60F == 15.555..C; base 10C gives 5.555../day.
    engine
        .ingest_observations(1, &constant_weather(d("2024-03-01"), 9, 60.0))
        .unwrap();
    let model = engine
        .create_model(NewGddModel {
            location_id: 1,
            name: "metric".into(),
            base_temp: 10.0,
            unit: TempUnit::C,
            start_date: d("2024-03-01"),
            threshold: 40.0,
            reset_on_threshold: true,
        })
        .unwrap();

    let values = engine.store().values(model.id).unwrap();
    let expected_daily = (60.0 - 32.0) * 5.0 / 9.0 - 10.0;
    assert!((values[0].daily - expected_daily).abs() < 1e-9);
    // 5.555../day crosses 40 on day 8.
    let runs = engine.store().runs(model.id).unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].end_date, Some(d("2024-03-08")));
}

#[test]
fn forecast_rows_refine_but_history_is_immutable() {
    let (_dir, engine) = setup();
    let forecast: Vec<NewObservation> = constant_weather(d("2024-03-01"), 5, 60.0)
        .into_iter()
        .map(|mut o| {
            o.kind = WeatherKind::Forecast;
            o
        })
        .collect();
    engine.ingest_observations(1, &forecast).unwrap();
    let model = engine.create_model(new_model("forecasted", 5_000.0, true)).unwrap();
    assert_eq!(engine.store().values(model.id).unwrap()[0].daily, 10.0);

    // Actuals arrive warmer; extend picks them up.
    engine
        .ingest_observations(1, &constant_weather(d("2024-03-01"), 5, 70.0))
        .unwrap();
    let values = engine.store().values(model.id).unwrap();
    assert_eq!(values[0].daily, 20.0);

    // A second "correction" to historical rows is ignored.
    engine
        .ingest_observations(1, &constant_weather(d("2024-03-01"), 5, 90.0))
        .unwrap();
    let values = engine.store().values(model.id).unwrap();
    assert_eq!(values[0].daily, 20.0);
}
