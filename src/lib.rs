//! TurfTrack Backend Library
//!
//! Growing degree day (GDD) tracking: weather ingestion, accumulation runs,
//! parameter history, manual resets, and historical recalculation over a
//! SQLite store, exposed through an axum HTTP API.

pub mod api;
pub mod gdd;
pub mod models;
pub mod store;
pub mod tasks;
