//! AeroQC Library
//!
//! Ingestion, quality control and completeness reporting for time series
//! produced by environmental-sensor instruments (aethalometers,
//! nephelometers and generic table loggers).
//!
//! This library provides tools for:
//! - Parsing raw instrument exports and regularizing them onto a fixed time grid
//! - Statistical outlier filters (n-sigma, IQR, rolling and time-aware IQR, MAD hybrid)
//! - An ordered, first-match QC rule engine with per-label summaries
//! - Raw and QC snapshot caching with read-through, append and reset modes
//! - Acquisition, yield and total rates plus an operational/down timeline

pub mod config;
pub mod constants;
pub mod error;
pub mod filters;
pub mod instruments;
pub mod models;
pub mod processor;
pub mod qc;
pub mod report;
pub mod timeseries;

// CLI modules
pub mod cli {
    pub mod args;
    pub mod commands;
}

// Re-export commonly used types
pub use config::{CacheMode, InstrumentConfig, PipelineConfig, RunParams};
pub use error::{QcError, Result};
pub use instruments::{InstrumentReader, QcOutcome};
pub use models::{CacheState, ProcessingStats, QcSummary, RatesReport, TimelineEntry};
pub use processor::context::RunContext;
pub use processor::{InstrumentProcessor, RunOutput};
pub use qc::{QcFlagBuilder, QcRule};
pub use timeseries::{Frequency, RegularTimeSeries};
