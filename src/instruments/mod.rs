//! Instrument readers.
//!
//! Each supported instrument type pairs a raw-file parser with a QC rule set
//! and an optional post-QC processing step. Readers are stateless; everything
//! that varies between deployments lives in [`InstrumentConfig`].

mod aethalometer;
mod nephelometer;
pub mod rules;
mod table;

pub use aethalometer::{AethalometerReader, absorption_angstrom_exponent};
pub use nephelometer::NephelometerReader;
pub use table::{TableReader, normalize_header, read_delimited_table};

use crate::config::InstrumentConfig;
use crate::error::Result;
use crate::qc::QcFlagBuilder;
use crate::timeseries::RegularTimeSeries;
use polars::prelude::DataFrame;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, LazyLock};

/// Instrument names accepted on the command line
pub const SUPPORTED_INSTRUMENTS: &[&str] = &["Table", "AE33", "BC1054", "NEPH"];

/// Flagged data together with the engine that produced the flags
#[derive(Debug, Clone)]
pub struct QcOutcome {
    pub data: RegularTimeSeries,
    pub engine: QcFlagBuilder,
}

/// Capabilities an instrument type provides to the orchestrator
pub trait InstrumentReader: Send + Sync {
    fn name(&self) -> &str;

    /// Parse one raw file into a timestamped frame.
    ///
    /// `Ok(None)` means the file held no usable rows.
    fn parse(&self, path: &Path, config: &InstrumentConfig) -> Result<Option<DataFrame>>;

    /// Build this instrument's rule set and flag `raw`
    fn qc(&self, raw: &RegularTimeSeries, config: &InstrumentConfig) -> Result<QcOutcome>;

    /// Derive extra quantities after QC; may only relabel rows that are still Valid
    fn process(&self, outcome: QcOutcome, _config: &InstrumentConfig) -> Result<QcOutcome> {
        Ok(outcome)
    }
}

static REGISTRY: LazyLock<BTreeMap<&'static str, Arc<dyn InstrumentReader>>> =
    LazyLock::new(|| {
        let aethalometer: Arc<dyn InstrumentReader> = Arc::new(AethalometerReader);
        let mut registry: BTreeMap<&'static str, Arc<dyn InstrumentReader>> = BTreeMap::new();
        registry.insert("TABLE", Arc::new(TableReader));
        registry.insert("AE33", Arc::clone(&aethalometer));
        registry.insert("BC1054", aethalometer);
        registry.insert("NEPH", Arc::new(NephelometerReader));
        registry
    });

/// Case-insensitive reader lookup
pub fn lookup(name: &str) -> Option<Arc<dyn InstrumentReader>> {
    REGISTRY.get(name.to_ascii_uppercase().as_str()).cloned()
}
