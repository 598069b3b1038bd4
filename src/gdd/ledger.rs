//! Run ledger: owns the ordered, gapless, non-overlapping partition of a
//! model's timeline into runs.
//!
//! Every function here takes a `&Connection` so callers can compose ledger
//! mutations with value writes inside one transaction. Invariant breaks are
//! surfaced as `GddError::Consistency` and never silently patched.

use anyhow::Result;
use chrono::{Days, NaiveDate};
use rusqlite::{params, Connection};

use crate::gdd::error::GddError;
use crate::models::{ResetKind, Run};
use crate::store::map_run;

const RUN_COLUMNS: &str = "id, model_id, run_number, start_date, end_date, opened_by";

/// All runs for a model, in start-date order.
pub fn runs(conn: &Connection, model_id: i64) -> Result<Vec<Run>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM gdd_runs WHERE model_id = ?1 ORDER BY start_date",
        RUN_COLUMNS
    ))?;
    let rows = stmt.query_map(params![model_id], map_run)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// The open run, or none if the model has no runs yet.
pub fn current_run(conn: &Connection, model_id: i64) -> Result<Option<Run>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM gdd_runs WHERE model_id = ?1 AND end_date IS NULL",
        RUN_COLUMNS
    ))?;
    let mut rows = stmt.query_map(params![model_id], map_run)?;
    let open = rows.next().transpose()?;
    if rows.next().is_some() {
        return Err(GddError::Consistency(format!(
            "model {} has more than one open run",
            model_id
        ))
        .into());
    }
    Ok(open)
}

/// All runs covering `date` or later, in start-date order. The unit of
/// invalidation during recalculation.
pub fn runs_from(conn: &Connection, model_id: i64, date: NaiveDate) -> Result<Vec<Run>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM gdd_runs
         WHERE model_id = ?1 AND (end_date IS NULL OR end_date >= ?2)
         ORDER BY start_date",
        RUN_COLUMNS
    ))?;
    let rows = stmt.query_map(params![model_id, date.to_string()], map_run)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Open a new run. Rejects a start date that is not immediately adjacent to
/// the previous run's end (no gaps, no overlaps) and rejects opening while
/// another run is still open.
pub fn open_run(
    conn: &Connection,
    model_id: i64,
    start_date: NaiveDate,
    opened_by: ResetKind,
) -> Result<Run> {
    if current_run(conn, model_id)?.is_some() {
        return Err(GddError::Consistency(format!(
            "model {} already has an open run",
            model_id
        ))
        .into());
    }

    let all = runs(conn, model_id)?;
    let run_number = all.len() as i64 + 1;
    if let Some(last) = all.last() {
        // last is closed here, current_run returned none
        let expected = last
            .end_date
            .and_then(|end| end.checked_add_days(Days::new(1)))
            .ok_or_else(|| GddError::Consistency("prior run end date overflow".into()))?;
        if start_date != expected {
            return Err(GddError::Consistency(format!(
                "run for model {} must start {} (day after prior run end), got {}",
                model_id, expected, start_date
            ))
            .into());
        }
    }

    conn.execute(
        "INSERT INTO gdd_runs (model_id, run_number, start_date, end_date, opened_by)
         VALUES (?1, ?2, ?3, NULL, ?4)",
        params![
            model_id,
            run_number,
            start_date.to_string(),
            opened_by.as_str()
        ],
    )?;
    Ok(Run {
        id: conn.last_insert_rowid(),
        model_id,
        run_number,
        start_date,
        end_date: None,
        opened_by,
    })
}

/// Close an open run. Rejects closing an already-closed run and an end date
/// before the run's start.
pub fn close_run(
    conn: &Connection,
    model_id: i64,
    run_number: i64,
    end_date: NaiveDate,
) -> Result<()> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM gdd_runs WHERE model_id = ?1 AND run_number = ?2",
        RUN_COLUMNS
    ))?;
    let mut rows = stmt.query_map(params![model_id, run_number], map_run)?;
    let run = rows
        .next()
        .transpose()?
        .ok_or_else(|| GddError::Consistency(format!("run {} not found", run_number)))?;

    if !run.is_open() {
        return Err(GddError::Consistency(format!(
            "run {} of model {} is already closed",
            run_number, model_id
        ))
        .into());
    }
    if end_date < run.start_date {
        return Err(GddError::Consistency(format!(
            "cannot close run {} at {} before its start {}",
            run_number, end_date, run.start_date
        ))
        .into());
    }

    conn.execute(
        "UPDATE gdd_runs SET end_date = ?3 WHERE model_id = ?1 AND run_number = ?2",
        params![model_id, run_number, end_date.to_string()],
    )?;
    Ok(())
}

/// Atomic boundary: close the open run at `end_date` and open the next run
/// the following day. Caller must hold the enclosing transaction.
pub fn close_and_open(
    conn: &Connection,
    model_id: i64,
    end_date: NaiveDate,
    opened_by: ResetKind,
) -> Result<Run> {
    let open = current_run(conn, model_id)?
        .ok_or_else(|| GddError::Consistency(format!("model {} has no open run", model_id)))?;
    close_run(conn, model_id, open.run_number, end_date)?;
    let next_start = end_date
        .checked_add_days(Days::new(1))
        .ok_or_else(|| GddError::Consistency("run boundary date overflow".into()))?;
    open_run(conn, model_id, next_start, opened_by)
}

/// Invalidate the suffix of the partition from `date` onward: delete runs
/// starting on/after `date` and pull back the straddling run's end to the
/// day before. Returns the run number the rebuilt suffix starts at.
pub fn truncate_from(conn: &Connection, model_id: i64, date: NaiveDate) -> Result<i64> {
    conn.execute(
        "DELETE FROM gdd_runs WHERE model_id = ?1 AND start_date >= ?2",
        params![model_id, date.to_string()],
    )?;

    let remaining = runs(conn, model_id)?;
    if let Some(last) = remaining.last() {
        // last.start_date < date by the delete above
        if last.end_date.map_or(true, |end| end >= date) {
            let new_end = date
                .checked_sub_days(Days::new(1))
                .ok_or_else(|| GddError::Consistency("truncation date underflow".into()))?;
            conn.execute(
                "UPDATE gdd_runs SET end_date = ?3 WHERE model_id = ?1 AND run_number = ?2",
                params![model_id, last.run_number, new_end.to_string()],
            )?;
        }
    }
    Ok(remaining.len() as i64 + 1)
}

/// Open a run with an explicit run number, used while rebuilding a suffix
/// whose numbering continues from the surviving prefix.
pub fn insert_run(
    conn: &Connection,
    model_id: i64,
    run_number: i64,
    start_date: NaiveDate,
    end_date: Option<NaiveDate>,
    opened_by: ResetKind,
) -> Result<Run> {
    conn.execute(
        "INSERT INTO gdd_runs (model_id, run_number, start_date, end_date, opened_by)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            model_id,
            run_number,
            start_date.to_string(),
            end_date.map(|d| d.to_string()),
            opened_by.as_str()
        ],
    )?;
    Ok(Run {
        id: conn.last_insert_rowid(),
        model_id,
        run_number,
        start_date,
        end_date,
        opened_by,
    })
}
