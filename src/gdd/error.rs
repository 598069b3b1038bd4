//! Domain error taxonomy for the GDD engine.
//!
//! Validation and consistency errors reject synchronously with nothing
//! persisted. Missing observations are policy-dependent: forward
//! accumulation skips and flags, recalculation aborts and rolls back.

use chrono::NaiveDate;

#[derive(Debug, Clone, PartialEq)]
pub enum GddError {
    /// Malformed or out-of-range input. Nothing persisted.
    Validation(String),
    /// No weather observation exists for a date that a computation needed.
    MissingObservation { date: NaiveDate },
    /// A run ledger invariant (gapless, non-overlapping) would break.
    /// Always fatal to the operation, never silently patched.
    Consistency(String),
    /// A second mutating operation hit a model that is already locked.
    /// Retryable, never queued.
    ConcurrentModification { model_id: i64 },
    /// Referenced model does not exist.
    ModelNotFound(i64),
}

impl std::fmt::Display for GddError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "validation error: {}", msg),
            Self::MissingObservation { date } => {
                write!(f, "missing weather observation for {}", date)
            }
            Self::Consistency(msg) => write!(f, "run ledger consistency violation: {}", msg),
            Self::ConcurrentModification { model_id } => {
                write!(f, "model {} is locked by another mutating operation", model_id)
            }
            Self::ModelNotFound(id) => write!(f, "GDD model {} not found", id),
        }
    }
}

impl std::error::Error for GddError {}
