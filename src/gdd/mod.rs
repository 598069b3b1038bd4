//! Growing degree day accumulation: the daily contribution calculator, the
//! run-segmenting accumulator, the run ledger, and the mutation engine that
//! ties them to the store.

pub mod accumulator;
pub mod calc;
pub mod engine;
pub mod error;
pub mod ledger;

pub use engine::{EditOutcome, GddEngine, IngestReport, ModelSummary, RunSummary};
pub use error::GddError;
