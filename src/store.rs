//! SQLite-backed persistence for models, parameter history, runs, daily
//! values, weather observations, and task status.
//!
//! Key choices:
//! - WAL mode for concurrent reads during writes
//! - Single connection behind a parking_lot mutex
//! - Multi-row mutations run under BEGIN IMMEDIATE so a compound rewrite is
//!   all-or-nothing
//! - Calendar dates stored as ISO-8601 TEXT (lexicographic order == date
//!   order), timestamps as RFC 3339 TEXT

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::gdd::calc::{convert, Reading};
use crate::models::{
    DailyValue, GddModel, NewGddModel, NewObservation, ParameterHistory, ParameterSet, ResetKind,
    Run, TempUnit, WeatherDay, WeatherKind,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS gdd_models (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    location_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    base_temp REAL NOT NULL,
    unit TEXT NOT NULL,
    start_date TEXT NOT NULL,
    threshold REAL NOT NULL,
    reset_on_threshold INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (location_id, name)
);

CREATE TABLE IF NOT EXISTS gdd_parameters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    model_id INTEGER NOT NULL REFERENCES gdd_models(id) ON DELETE CASCADE,
    base_temp REAL NOT NULL,
    threshold REAL NOT NULL,
    reset_on_threshold INTEGER NOT NULL,
    effective_from TEXT NOT NULL,
    effective_to TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (model_id, effective_from)
);

CREATE TABLE IF NOT EXISTS gdd_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    model_id INTEGER NOT NULL REFERENCES gdd_models(id) ON DELETE CASCADE,
    run_number INTEGER NOT NULL,
    start_date TEXT NOT NULL,
    end_date TEXT,
    opened_by TEXT NOT NULL,
    UNIQUE (model_id, run_number)
);

CREATE INDEX IF NOT EXISTS idx_runs_model_start
    ON gdd_runs(model_id, start_date);

CREATE TABLE IF NOT EXISTS gdd_values (
    model_id INTEGER NOT NULL REFERENCES gdd_models(id) ON DELETE CASCADE,
    date TEXT NOT NULL,
    run_number INTEGER NOT NULL,
    daily REAL NOT NULL,
    cumulative REAL NOT NULL,
    missing INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (model_id, date)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_values_model_run
    ON gdd_values(model_id, run_number, date);

CREATE TABLE IF NOT EXISTS daily_weather (
    location_id INTEGER NOT NULL,
    date TEXT NOT NULL,
    tmin_c REAL NOT NULL,
    tmax_c REAL NOT NULL,
    tmin_f REAL NOT NULL,
    tmax_f REAL NOT NULL,
    kind TEXT NOT NULL,
    PRIMARY KEY (location_id, date)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS task_status (
    task_id TEXT PRIMARY KEY,
    task_name TEXT NOT NULL,
    model_id INTEGER,
    status TEXT NOT NULL,
    dates_done INTEGER NOT NULL DEFAULT 0,
    dates_total INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    error TEXT
) WITHOUT ROWID;
"#;

/// Durable store for one deployment, shared across handlers and tasks.
pub struct GddStore {
    conn: Arc<Mutex<Connection>>,
}

impl GddStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // we handle our own locking

        let conn = Connection::open_with_flags(&db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path.as_ref().display()))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let model_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM gdd_models", [], |row| row.get(0))
            .unwrap_or(0);
        info!(
            "📊 GDD store initialized at {} ({} models)",
            db_path.as_ref().display(),
            model_count
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection without a transaction (reads, single
    /// statements).
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` under BEGIN IMMEDIATE; commit on success, roll back on any
    /// error so partial rewrites are never visible.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        match f(&conn) {
            Ok(value) => {
                conn.execute("COMMIT", [])?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rb) = conn.execute("ROLLBACK", []) {
                    warn!("rollback failed after {:#}: {}", err, rb);
                }
                Err(err)
            }
        }
    }

    // ===== Models =====

    pub fn get_model(&self, id: i64) -> Result<Option<GddModel>> {
        self.with_conn(|conn| get_model(conn, id))
    }

    pub fn list_models(&self) -> Result<Vec<GddModel>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, location_id, name, base_temp, unit, start_date, threshold,
                        reset_on_threshold, created_at, updated_at
                 FROM gdd_models ORDER BY id",
            )?;
            let rows = stmt.query_map([], map_model)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to list models")
        })
    }

    pub fn list_models_by_location(&self, location_id: i64) -> Result<Vec<GddModel>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, location_id, name, base_temp, unit, start_date, threshold,
                        reset_on_threshold, created_at, updated_at
                 FROM gdd_models WHERE location_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![location_id], map_model)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to list models by location")
        })
    }

    pub fn delete_model(&self, id: i64) -> Result<bool> {
        self.with_tx(|conn| {
            let changes = conn.execute("DELETE FROM gdd_models WHERE id = ?1", params![id])?;
            Ok(changes > 0)
        })
    }

    // ===== Parameter history =====

    pub fn parameter_history(&self, model_id: i64) -> Result<ParameterHistory> {
        self.with_conn(|conn| parameter_history(conn, model_id))
    }

    // ===== Runs =====

    pub fn runs(&self, model_id: i64) -> Result<Vec<Run>> {
        self.with_conn(|conn| crate::gdd::ledger::runs(conn, model_id))
    }

    pub fn current_run(&self, model_id: i64) -> Result<Option<Run>> {
        self.with_conn(|conn| crate::gdd::ledger::current_run(conn, model_id))
    }

    // ===== Daily values =====

    pub fn values(&self, model_id: i64) -> Result<Vec<DailyValue>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT model_id, date, run_number, daily, cumulative, missing
                 FROM gdd_values WHERE model_id = ?1 ORDER BY date",
            )?;
            let rows = stmt.query_map(params![model_id], map_value)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to read daily values")
        })
    }

    /// Daily values within an optional date range, bounded in SQL.
    pub fn values_in_range(
        &self,
        model_id: i64,
        from: Option<NaiveDate>,
        through: Option<NaiveDate>,
    ) -> Result<Vec<DailyValue>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT model_id, date, run_number, daily, cumulative, missing
                 FROM gdd_values
                 WHERE model_id = ?1
                   AND (?2 IS NULL OR date >= ?2)
                   AND (?3 IS NULL OR date <= ?3)
                 ORDER BY date",
            )?;
            let rows = stmt.query_map(
                params![
                    model_id,
                    from.map(|d| d.to_string()),
                    through.map(|d| d.to_string())
                ],
                map_value,
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to read daily values")
        })
    }

    pub fn values_for_run(&self, model_id: i64, run_number: i64) -> Result<Vec<DailyValue>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT model_id, date, run_number, daily, cumulative, missing
                 FROM gdd_values WHERE model_id = ?1 AND run_number = ?2 ORDER BY date",
            )?;
            let rows = stmt.query_map(params![model_id, run_number], map_value)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to read run values")
        })
    }

    pub fn latest_value(&self, model_id: i64, run_number: i64) -> Result<Option<DailyValue>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT model_id, date, run_number, daily, cumulative, missing
                 FROM gdd_values WHERE model_id = ?1 AND run_number = ?2
                 ORDER BY date DESC LIMIT 1",
            )?;
            let mut rows = stmt.query_map(params![model_id, run_number], map_value)?;
            Ok(rows.next().transpose()?)
        })
    }

    // ===== Weather =====

    /// Insert observations for a location, converting into both units at
    /// the boundary. Historical rows are immutable; a conflicting insert
    /// only lands when it refines a forecast row.
    pub fn upsert_observations(
        &self,
        location_id: i64,
        observations: &[NewObservation],
    ) -> Result<usize> {
        self.with_tx(|conn| {
            let mut stored = 0usize;
            for obs in observations {
                if obs.tmin > obs.tmax {
                    anyhow::bail!("tmin {} above tmax {} on {}", obs.tmin, obs.tmax, obs.date);
                }
                let tmin_c = convert(obs.tmin, obs.unit, TempUnit::C);
                let tmax_c = convert(obs.tmax, obs.unit, TempUnit::C);
                let tmin_f = convert(obs.tmin, obs.unit, TempUnit::F);
                let tmax_f = convert(obs.tmax, obs.unit, TempUnit::F);
                stored += conn.execute(
                    "INSERT INTO daily_weather
                         (location_id, date, tmin_c, tmax_c, tmin_f, tmax_f, kind)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(location_id, date) DO UPDATE SET
                         tmin_c = excluded.tmin_c, tmax_c = excluded.tmax_c,
                         tmin_f = excluded.tmin_f, tmax_f = excluded.tmax_f,
                         kind = excluded.kind
                     WHERE daily_weather.kind = 'forecast'",
                    params![
                        location_id,
                        obs.date.to_string(),
                        tmin_c,
                        tmax_c,
                        tmin_f,
                        tmax_f,
                        obs.kind.as_str(),
                    ],
                )?;
            }
            Ok(stored)
        })
    }

    pub fn weather_for(
        &self,
        location_id: i64,
        from: NaiveDate,
        through: NaiveDate,
    ) -> Result<Vec<WeatherDay>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT location_id, date, tmin_c, tmax_c, tmin_f, tmax_f, kind
                 FROM daily_weather
                 WHERE location_id = ?1 AND date >= ?2 AND date <= ?3
                 ORDER BY date",
            )?;
            let rows = stmt.query_map(
                params![location_id, from.to_string(), through.to_string()],
                map_weather,
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to read weather")
        })
    }

    pub fn latest_observation_date(&self, location_id: i64) -> Result<Option<NaiveDate>> {
        self.with_conn(|conn| latest_observation_date(conn, location_id))
    }

    /// Weather source interface: ordered readings in the requested unit.
    pub fn readings_for(
        &self,
        location_id: i64,
        from: NaiveDate,
        through: NaiveDate,
        unit: TempUnit,
    ) -> Result<BTreeMap<NaiveDate, Reading>> {
        self.with_conn(|conn| readings_for(conn, location_id, from, through, unit))
    }
}

// ===== Row-level helpers, composable inside a caller-held transaction =====

pub(crate) fn get_model(conn: &Connection, id: i64) -> Result<Option<GddModel>> {
    let mut stmt = conn.prepare(
        "SELECT id, location_id, name, base_temp, unit, start_date, threshold,
                reset_on_threshold, created_at, updated_at
         FROM gdd_models WHERE id = ?1",
    )?;
    let mut rows = stmt.query_map(params![id], map_model)?;
    Ok(rows.next().transpose()?)
}

pub(crate) fn insert_model(conn: &Connection, new: &NewGddModel) -> Result<GddModel> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO gdd_models
             (location_id, name, base_temp, unit, start_date, threshold,
              reset_on_threshold, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            new.location_id,
            &new.name,
            new.base_temp,
            new.unit.as_str(),
            new.start_date.to_string(),
            new.threshold,
            new.reset_on_threshold as i64,
            now.to_rfc3339(),
            now.to_rfc3339(),
        ],
    )
    .context("Failed to insert model (name must be unique per location)")?;
    let id = conn.last_insert_rowid();
    Ok(GddModel {
        id,
        location_id: new.location_id,
        name: new.name.clone(),
        base_temp: new.base_temp,
        unit: new.unit,
        start_date: new.start_date,
        threshold: new.threshold,
        reset_on_threshold: new.reset_on_threshold,
        created_at: now,
        updated_at: now,
    })
}

pub(crate) fn update_model_name(conn: &Connection, model_id: i64, name: &str) -> Result<()> {
    conn.execute(
        "UPDATE gdd_models SET name = ?2, updated_at = ?3 WHERE id = ?1",
        params![model_id, name, Utc::now().to_rfc3339()],
    )
    .context("Failed to rename model (name must be unique per location)")?;
    Ok(())
}

pub(crate) fn touch_model(conn: &Connection, model_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE gdd_models SET updated_at = ?1 WHERE id = ?2",
        params![Utc::now().to_rfc3339(), model_id],
    )?;
    Ok(())
}

pub(crate) fn parameter_history(conn: &Connection, model_id: i64) -> Result<ParameterHistory> {
    let mut stmt = conn.prepare(
        "SELECT id, model_id, base_temp, threshold, reset_on_threshold,
                effective_from, effective_to, created_at
         FROM gdd_parameters WHERE model_id = ?1 ORDER BY effective_from",
    )?;
    let rows = stmt.query_map(params![model_id], map_parameter_set)?;
    let sets = rows
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to read parameter history")?;
    Ok(ParameterHistory::new(sets))
}

pub(crate) fn insert_parameter_set(
    conn: &Connection,
    model_id: i64,
    base_temp: f64,
    threshold: f64,
    reset_on_threshold: bool,
    effective_from: NaiveDate,
) -> Result<()> {
    conn.execute(
        "INSERT INTO gdd_parameters
             (model_id, base_temp, threshold, reset_on_threshold,
              effective_from, effective_to, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6)",
        params![
            model_id,
            base_temp,
            threshold,
            reset_on_threshold as i64,
            effective_from.to_string(),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Keep the parameter interval sequence gapless and non-overlapping around
/// a new effective date: drop any row starting on/after it and truncate the
/// straddling open interval.
pub(crate) fn supersede_parameters_from(
    conn: &Connection,
    model_id: i64,
    effective_from: NaiveDate,
) -> Result<()> {
    conn.execute(
        "DELETE FROM gdd_parameters WHERE model_id = ?1 AND effective_from >= ?2",
        params![model_id, effective_from.to_string()],
    )?;
    conn.execute(
        "UPDATE gdd_parameters SET effective_to = ?2
         WHERE model_id = ?1
           AND effective_from < ?2
           AND (effective_to IS NULL OR effective_to > ?2)",
        params![model_id, effective_from.to_string()],
    )?;
    Ok(())
}

pub(crate) fn insert_values(
    conn: &Connection,
    model_id: i64,
    run_number: i64,
    values: &[crate::gdd::accumulator::DayRecord],
) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR REPLACE INTO gdd_values
             (model_id, date, run_number, daily, cumulative, missing)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for v in values {
        stmt.execute(params![
            model_id,
            v.date.to_string(),
            run_number,
            v.daily,
            v.cumulative,
            v.missing as i64,
        ])?;
    }
    Ok(values.len())
}

pub(crate) fn delete_values_from(conn: &Connection, model_id: i64, date: NaiveDate) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM gdd_values WHERE model_id = ?1 AND date >= ?2",
        params![model_id, date.to_string()],
    )?;
    Ok(deleted)
}

pub(crate) fn latest_observation_date(
    conn: &Connection,
    location_id: i64,
) -> Result<Option<NaiveDate>> {
    let date: Option<String> = conn.query_row(
        "SELECT MAX(date) FROM daily_weather WHERE location_id = ?1",
        params![location_id],
        |row| row.get(0),
    )?;
    date.map(|s| s.parse().context("bad date in daily_weather"))
        .transpose()
}

pub(crate) fn readings_for(
    conn: &Connection,
    location_id: i64,
    from: NaiveDate,
    through: NaiveDate,
    unit: TempUnit,
) -> Result<BTreeMap<NaiveDate, Reading>> {
    let (min_col, max_col) = match unit {
        TempUnit::C => ("tmin_c", "tmax_c"),
        TempUnit::F => ("tmin_f", "tmax_f"),
    };
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT date, {}, {} FROM daily_weather
         WHERE location_id = ?1 AND date >= ?2 AND date <= ?3
         ORDER BY date",
        min_col, max_col
    ))?;
    let rows = stmt.query_map(
        params![location_id, from.to_string(), through.to_string()],
        |row| {
            let date: String = row.get(0)?;
            let tmin: f64 = row.get(1)?;
            let tmax: f64 = row.get(2)?;
            Ok((date, tmin, tmax))
        },
    )?;
    let mut readings = BTreeMap::new();
    for row in rows {
        let (date, tmin, tmax) = row?;
        let date: NaiveDate = date.parse().context("bad date in daily_weather")?;
        readings.insert(date, Reading::new(tmin, tmax, unit));
    }
    Ok(readings)
}

// ===== Row mappers =====

fn conversion_err(msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, msg.into())
}

fn parse_date(s: String) -> rusqlite::Result<NaiveDate> {
    s.parse()
        .map_err(|e| conversion_err(format!("bad date {:?}: {}", s, e)))
}

fn parse_timestamp(s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_err(format!("bad timestamp {:?}: {}", s, e)))
}

fn map_model(row: &Row<'_>) -> rusqlite::Result<GddModel> {
    let unit: String = row.get(4)?;
    Ok(GddModel {
        id: row.get(0)?,
        location_id: row.get(1)?,
        name: row.get(2)?,
        base_temp: row.get(3)?,
        unit: TempUnit::parse(&unit).ok_or_else(|| conversion_err(format!("bad unit {:?}", unit)))?,
        start_date: parse_date(row.get(5)?)?,
        threshold: row.get(6)?,
        reset_on_threshold: row.get::<_, i64>(7)? != 0,
        created_at: parse_timestamp(row.get(8)?)?,
        updated_at: parse_timestamp(row.get(9)?)?,
    })
}

fn map_parameter_set(row: &Row<'_>) -> rusqlite::Result<ParameterSet> {
    Ok(ParameterSet {
        id: row.get(0)?,
        model_id: row.get(1)?,
        base_temp: row.get(2)?,
        threshold: row.get(3)?,
        reset_on_threshold: row.get::<_, i64>(4)? != 0,
        effective_from: parse_date(row.get(5)?)?,
        effective_to: row.get::<_, Option<String>>(6)?.map(parse_date).transpose()?,
        created_at: parse_timestamp(row.get(7)?)?,
    })
}

pub(crate) fn map_run(row: &Row<'_>) -> rusqlite::Result<Run> {
    let kind: String = row.get(5)?;
    Ok(Run {
        id: row.get(0)?,
        model_id: row.get(1)?,
        run_number: row.get(2)?,
        start_date: parse_date(row.get(3)?)?,
        end_date: row.get::<_, Option<String>>(4)?.map(parse_date).transpose()?,
        opened_by: ResetKind::parse(&kind)
            .ok_or_else(|| conversion_err(format!("bad reset kind {:?}", kind)))?,
    })
}

fn map_value(row: &Row<'_>) -> rusqlite::Result<DailyValue> {
    Ok(DailyValue {
        model_id: row.get(0)?,
        date: parse_date(row.get(1)?)?,
        run_number: row.get(2)?,
        daily: row.get(3)?,
        cumulative: row.get(4)?,
        missing: row.get::<_, i64>(5)? != 0,
    })
}

fn map_weather(row: &Row<'_>) -> rusqlite::Result<WeatherDay> {
    let kind: String = row.get(6)?;
    Ok(WeatherDay {
        location_id: row.get(0)?,
        date: parse_date(row.get(1)?)?,
        tmin_c: row.get(2)?,
        tmax_c: row.get(3)?,
        tmin_f: row.get(4)?,
        tmax_f: row.get(5)?,
        kind: WeatherKind::parse(&kind)
            .ok_or_else(|| conversion_err(format!("bad weather kind {:?}", kind)))?,
    })
}
