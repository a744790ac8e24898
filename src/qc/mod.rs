//! QC rule engine.
//!
//! Rules are named predicates over a [`RegularTimeSeries`](crate::timeseries::RegularTimeSeries).
//! The engine evaluates them in registration order and labels every row with
//! the first rule that rejects it, or `Valid`.

mod engine;
mod rule;

pub use engine::QcFlagBuilder;
pub use rule::{Predicate, QcRule};
