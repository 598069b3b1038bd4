//! Task monitoring and per-model write serialization.
//!
//! Recalculation runs as a background task; callers get a uuid handle and
//! poll `GET /api/tasks/:id`. Lifecycle transitions (queued, running,
//! succeeded, failed) are persisted to `task_status`; progress counters live
//! in the in-memory registry so they stay visible while the rewrite
//! transaction is still open.

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::params;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::gdd::error::GddError;
use crate::store::GddStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub task_name: String,
    pub model_id: Option<i64>,
    pub state: TaskState,
    /// Dates processed so far.
    pub dates_done: u64,
    /// Total dates the task will process.
    pub dates_total: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

struct TaskEntry {
    record: TaskRecord,
    cancel: Arc<AtomicBool>,
}

/// Handle passed into the running task body.
#[derive(Clone)]
pub struct TaskHandle {
    pub task_id: Uuid,
    cancel: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

pub struct TaskMonitor {
    store: Arc<GddStore>,
    registry: RwLock<HashMap<Uuid, TaskEntry>>,
}

impl TaskMonitor {
    pub fn new(store: Arc<GddStore>) -> Self {
        Self {
            store,
            registry: RwLock::new(HashMap::new()),
        }
    }

    pub fn enqueue(&self, task_name: &str, model_id: Option<i64>) -> Result<TaskHandle> {
        let record = TaskRecord {
            task_id: Uuid::new_v4(),
            task_name: task_name.to_string(),
            model_id,
            state: TaskState::Queued,
            dates_done: 0,
            dates_total: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        };
        self.persist(&record)?;
        let cancel = Arc::new(AtomicBool::new(false));
        let handle = TaskHandle {
            task_id: record.task_id,
            cancel: cancel.clone(),
        };
        self.registry
            .write()
            .insert(record.task_id, TaskEntry { record, cancel });
        debug!("task {} queued ({})", handle.task_id, task_name);
        Ok(handle)
    }

    pub fn mark_running(&self, task_id: Uuid) {
        self.transition(task_id, |record| {
            record.state = TaskState::Running;
            record.started_at = Some(Utc::now());
        });
    }

    pub fn mark_succeeded(&self, task_id: Uuid) {
        self.transition(task_id, |record| {
            record.state = TaskState::Succeeded;
            record.finished_at = Some(Utc::now());
        });
        info!("✅ task {} succeeded", task_id);
    }

    pub fn mark_failed(&self, task_id: Uuid, reason: &str) {
        let reason = reason.to_string();
        self.transition(task_id, move |record| {
            record.state = TaskState::Failed;
            record.finished_at = Some(Utc::now());
            record.error = Some(reason.clone());
        });
        warn!("❌ task {} failed", task_id);
    }

    /// Memory-only update; not persisted until a terminal transition.
    pub fn set_progress(&self, task_id: Uuid, dates_done: u64, dates_total: u64) {
        if let Some(entry) = self.registry.write().get_mut(&task_id) {
            entry.record.dates_done = dates_done;
            entry.record.dates_total = dates_total;
        }
    }

    /// Request cancellation. Returns false for unknown or finished tasks.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        {
            let registry = self.registry.read();
            if let Some(entry) = registry.get(&task_id) {
                if entry.record.state.is_terminal() {
                    return false;
                }
                entry.cancel.store(true, Ordering::Relaxed);
                info!("🛑 task {} cancellation requested", task_id);
                return true;
            }
        }

        // No live handle means the row is from a previous process lifetime.
        // A non-terminal row there has no worker left to finish it, so fail
        // it durably instead of leaving it stuck in queued/running.
        match self.load(task_id) {
            Ok(Some(mut record)) if !record.state.is_terminal() => {
                record.state = TaskState::Failed;
                record.finished_at = Some(Utc::now());
                record.error = Some("cancelled; no live worker for this task".to_string());
                if let Err(err) = self.persist(&record) {
                    warn!("failed to persist stale task {} cancellation: {:#}", task_id, err);
                    return false;
                }
                info!("🛑 stale task {} marked failed on cancellation", task_id);
                true
            }
            _ => false,
        }
    }

    /// In-memory record first (live progress), falling back to the durable
    /// row for tasks from previous process lifetimes.
    pub fn get(&self, task_id: Uuid) -> Result<Option<TaskRecord>> {
        if let Some(entry) = self.registry.read().get(&task_id) {
            return Ok(Some(entry.record.clone()));
        }
        self.load(task_id)
    }

    fn transition(&self, task_id: Uuid, apply: impl FnOnce(&mut TaskRecord)) {
        let record = {
            let mut registry = self.registry.write();
            match registry.get_mut(&task_id) {
                Some(entry) => {
                    apply(&mut entry.record);
                    entry.record.clone()
                }
                None => return,
            }
        };
        if let Err(err) = self.persist(&record) {
            warn!("failed to persist task {} transition: {:#}", task_id, err);
        }
    }

    fn persist(&self, record: &TaskRecord) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO task_status
                     (task_id, task_name, model_id, status, dates_done, dates_total,
                      created_at, started_at, finished_at, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.task_id.to_string(),
                    &record.task_name,
                    record.model_id,
                    record.state.as_str(),
                    record.dates_done as i64,
                    record.dates_total as i64,
                    record.created_at.to_rfc3339(),
                    record.started_at.map(|t| t.to_rfc3339()),
                    record.finished_at.map(|t| t.to_rfc3339()),
                    record.error.as_deref(),
                ],
            )?;
            Ok(())
        })
    }

    fn load(&self, task_id: Uuid) -> Result<Option<TaskRecord>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT task_id, task_name, model_id, status, dates_done, dates_total,
                        created_at, started_at, finished_at, error
                 FROM task_status WHERE task_id = ?1",
            )?;
            let mut rows = stmt.query(params![task_id.to_string()])?;
            let row = match rows.next()? {
                Some(row) => row,
                None => return Ok(None),
            };

            let status: String = row.get(3)?;
            let state = match status.as_str() {
                "queued" => TaskState::Queued,
                "running" => TaskState::Running,
                "succeeded" => TaskState::Succeeded,
                "failed" => TaskState::Failed,
                other => anyhow::bail!("unknown task status {:?}", other),
            };
            let parse_ts = |s: Option<String>| -> Result<Option<DateTime<Utc>>> {
                s.map(|s| {
                    DateTime::parse_from_rfc3339(&s)
                        .map(|t| t.with_timezone(&Utc))
                        .map_err(Into::into)
                })
                .transpose()
            };

            Ok(Some(TaskRecord {
                task_id,
                task_name: row.get(1)?,
                model_id: row.get(2)?,
                state,
                dates_done: row.get::<_, i64>(4)? as u64,
                dates_total: row.get::<_, i64>(5)? as u64,
                created_at: parse_ts(Some(row.get(6)?))?.unwrap_or_else(Utc::now),
                started_at: parse_ts(row.get(7)?)?,
                finished_at: parse_ts(row.get(8)?)?,
                error: row.get(9)?,
            }))
        })
    }
}

/// Per-model exclusive write locks with try-semantics: at most one mutating
/// operation in flight per model, contention rejected (never queued).
#[derive(Default)]
pub struct ModelLocks {
    held: Mutex<HashSet<i64>>,
}

impl ModelLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn try_acquire(self: &Arc<Self>, model_id: i64) -> Result<ModelGuard, GddError> {
        let mut held = self.held.lock();
        if !held.insert(model_id) {
            return Err(GddError::ConcurrentModification { model_id });
        }
        Ok(ModelGuard {
            locks: Arc::clone(self),
            model_id,
        })
    }
}

/// RAII guard; releasing is dropping.
pub struct ModelGuard {
    locks: Arc<ModelLocks>,
    model_id: i64,
}

impl Drop for ModelGuard {
    fn drop(&mut self) {
        self.locks.held.lock().remove(&self.model_id);
    }
}
