//! Accumulator: walks calendar dates in order, applies the daily
//! contribution calculator, and decides run boundaries.
//!
//! Stateless between invocations: each call recomputes from the given start
//! date. Parameters are resolved per date from the model's history, so a
//! forward-only edit changes contributions mid-run without forcing a run
//! boundary. Threshold comparison uses `>=`; the first day crossing the
//! threshold closes its run and the next run starts the next calendar day
//! at zero (no remainder carry).

use std::collections::BTreeMap;

use chrono::{Days, NaiveDate};

use crate::gdd::calc::{daily_contribution, Reading};
use crate::gdd::error::GddError;
use crate::models::{ParameterHistory, TempUnit};

/// How to treat a date with no observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapPolicy {
    /// Carry the day at zero contribution with its `missing` flag set.
    /// Used by forward accumulation.
    SkipAndFlag,
    /// Abort with `MissingObservation`. Used by recalculation, where a
    /// half-rewritten history must never be committed.
    Fail,
}

/// One emitted day.
#[derive(Debug, Clone, PartialEq)]
pub struct DayRecord {
    pub date: NaiveDate,
    pub daily: f64,
    pub cumulative: f64,
    pub missing: bool,
}

/// One run-shaped slice of the walked range. `end = Some(date)` means the
/// threshold closed the run on that date; the final segment is always open.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub start: NaiveDate,
    pub end: Option<NaiveDate>,
    pub values: Vec<DayRecord>,
}

impl Segment {
    fn open(start: NaiveDate) -> Self {
        Self {
            start,
            end: None,
            values: Vec::new(),
        }
    }
}

/// Walk `[start, through]` and produce the ordered run segmentation.
///
/// Always returns at least one segment; exactly the last one is open. If a
/// threshold closes a run on `through` itself, a trailing empty open
/// segment starting the next day is appended, since the ledger must always
/// have an open run to extend.
pub fn accumulate(
    start: NaiveDate,
    through: NaiveDate,
    readings: &BTreeMap<NaiveDate, Reading>,
    params: &ParameterHistory,
    model_unit: TempUnit,
    policy: GapPolicy,
) -> Result<Vec<Segment>, GddError> {
    let mut segments = Vec::new();
    let mut current = Segment::open(start);
    let mut cumulative = 0.0;

    let mut date = start;
    while date <= through {
        let set = params.resolve(date).ok_or_else(|| {
            GddError::Consistency(format!("no parameter set effective on {}", date))
        })?;

        let (daily, missing) = match readings.get(&date) {
            Some(reading) => (daily_contribution(*reading, set.base_temp, model_unit), false),
            None => match policy {
                GapPolicy::SkipAndFlag => (0.0, true),
                GapPolicy::Fail => return Err(GddError::MissingObservation { date }),
            },
        };

        cumulative += daily;
        current.values.push(DayRecord {
            date,
            daily,
            cumulative,
            missing,
        });

        let next = date
            .checked_add_days(Days::new(1))
            .ok_or_else(|| GddError::Validation(format!("date overflow past {}", date)))?;

        if set.reset_on_threshold && cumulative >= set.threshold {
            current.end = Some(date);
            segments.push(current);
            current = Segment::open(next);
            cumulative = 0.0;
        }

        date = next;
    }

    segments.push(current);
    Ok(segments)
}
