use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Temperature unit for a model. Never mixed within one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TempUnit {
    C,
    F,
}

impl TempUnit {
    pub fn as_str(&self) -> &str {
        match self {
            TempUnit::C => "C",
            TempUnit::F => "F",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "C" => Some(TempUnit::C),
            "F" => Some(TempUnit::F),
            _ => None,
        }
    }
}

/// What opened a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetKind {
    /// First run of a model, opened at the model's start date.
    Initial,
    /// Opened because the previous run crossed its accumulation threshold.
    Threshold,
    /// Opened by an operator-issued reset.
    Manual,
    /// Opened by historical recalculation at its effective date.
    Recalc,
}

impl ResetKind {
    pub fn as_str(&self) -> &str {
        match self {
            ResetKind::Initial => "initial",
            ResetKind::Threshold => "threshold",
            ResetKind::Manual => "manual",
            ResetKind::Recalc => "recalc",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initial" => Some(ResetKind::Initial),
            "threshold" => Some(ResetKind::Threshold),
            "manual" => Some(ResetKind::Manual),
            "recalc" => Some(ResetKind::Recalc),
            _ => None,
        }
    }
}

/// A tracked GDD model: identity for one location's heat accumulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GddModel {
    pub id: i64,
    pub location_id: i64,
    pub name: String,
    /// Base temperature at creation. The currently effective value lives in
    /// the parameter history; this is the creation-time identity.
    pub base_temp: f64,
    pub unit: TempUnit,
    pub start_date: NaiveDate,
    pub threshold: f64,
    pub reset_on_threshold: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request payload for creating a model.
#[derive(Debug, Clone, Deserialize)]
pub struct NewGddModel {
    pub location_id: i64,
    pub name: String,
    pub base_temp: f64,
    pub unit: TempUnit,
    pub start_date: NaiveDate,
    pub threshold: f64,
    #[serde(default)]
    pub reset_on_threshold: bool,
}

/// One row of a model's parameter history, valid over the half-open
/// interval `[effective_from, effective_to)`. `effective_to = None` means
/// open-ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSet {
    pub id: i64,
    pub model_id: i64,
    pub base_temp: f64,
    pub threshold: f64,
    pub reset_on_threshold: bool,
    pub effective_from: NaiveDate,
    pub effective_to: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

impl ParameterSet {
    pub fn covers(&self, date: NaiveDate) -> bool {
        date >= self.effective_from && self.effective_to.map_or(true, |to| date < to)
    }
}

/// Ordered, non-overlapping parameter history with per-date resolution.
#[derive(Debug, Clone)]
pub struct ParameterHistory {
    sets: Vec<ParameterSet>,
}

impl ParameterHistory {
    /// `sets` must already be ordered by `effective_from` (the store reads
    /// them that way).
    pub fn new(sets: Vec<ParameterSet>) -> Self {
        Self { sets }
    }

    pub fn resolve(&self, date: NaiveDate) -> Option<&ParameterSet> {
        self.sets.iter().find(|p| p.covers(date))
    }

    pub fn sets(&self) -> &[ParameterSet] {
        &self.sets
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

/// A maximal accumulation period. `end_date = None` while open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub model_id: i64,
    pub run_number: i64,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub opened_by: ResetKind,
}

impl Run {
    pub fn is_open(&self) -> bool {
        self.end_date.is_none()
    }
}

/// One (model, date) value. Immutable once committed for a given run and
/// parameter state; superseded wholesale by recalculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyValue {
    pub model_id: i64,
    pub date: NaiveDate,
    pub run_number: i64,
    pub daily: f64,
    pub cumulative: f64,
    /// True when no observation existed and the day was carried at zero
    /// contribution.
    pub missing: bool,
}

/// Kind of weather observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeatherKind {
    Historical,
    Forecast,
}

impl WeatherKind {
    pub fn as_str(&self) -> &str {
        match self {
            WeatherKind::Historical => "historical",
            WeatherKind::Forecast => "forecast",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "historical" => Some(WeatherKind::Historical),
            "forecast" => Some(WeatherKind::Forecast),
            _ => None,
        }
    }
}

/// One day of weather at a location, stored in both units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherDay {
    pub location_id: i64,
    pub date: NaiveDate,
    pub tmin_c: f64,
    pub tmax_c: f64,
    pub tmin_f: f64,
    pub tmax_f: f64,
    pub kind: WeatherKind,
}

/// Incoming observation, single-unit. The store derives the other unit.
#[derive(Debug, Clone, Deserialize)]
pub struct NewObservation {
    pub date: NaiveDate,
    pub tmin: f64,
    pub tmax: f64,
    pub unit: TempUnit,
    #[serde(default = "default_weather_kind")]
    pub kind: WeatherKind,
}

fn default_weather_kind() -> WeatherKind {
    WeatherKind::Historical
}

/// Partial model-metadata edit. Parameter fields go through the parameter
/// history instead.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelMetadataEdit {
    pub name: Option<String>,
}

/// Partial parameter edit. Omitted fields keep their current values.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParameterEdit {
    pub base_temp: Option<f64>,
    pub threshold: Option<f64>,
    pub reset_on_threshold: Option<bool>,
    pub effective_from: Option<NaiveDate>,
    #[serde(default)]
    pub recalculate_history: bool,
}

impl ParameterEdit {
    pub fn is_noop(&self) -> bool {
        self.base_temp.is_none() && self.threshold.is_none() && self.reset_on_threshold.is_none()
    }
}
