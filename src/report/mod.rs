//! Rate and timeline reporting.
//!
//! Consumes the raw and QC snapshots of one run and assembles the
//! `report.json` document: weekly/monthly (and optionally custom) rates, the
//! operational timeline and the QC summary.

pub mod rates;
pub mod timeline;

pub use rates::{calculate_rates, instrument_rates, process_rates_report};
pub use timeline::{format_duration, process_timeline_report};

use crate::models::{QcSummary, RatesReport, TimelineEntry, report_time};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentInfo {
    pub station: String,
    pub instrument: String,
}

impl InstrumentInfo {
    /// Station code is the first two characters of the source directory name
    pub fn from_source(source_dir: &Path, instrument: &str) -> Self {
        let station = source_dir
            .file_name()
            .map(|name| name.to_string_lossy().chars().take(2).collect())
            .unwrap_or_default();
        Self {
            station,
            instrument: instrument.to_string(),
        }
    }
}

/// Contents of `report.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentReport {
    #[serde(with = "report_time")]
    pub report_time: NaiveDateTime,
    pub instrument_info: InstrumentInfo,
    pub rates: RatesReport,
    pub timeline: Vec<TimelineEntry>,
    pub qc_summary: QcSummary,
}

impl InstrumentReport {
    pub fn new(
        instrument_info: InstrumentInfo,
        rates: RatesReport,
        timeline: Vec<TimelineEntry>,
        qc_summary: QcSummary,
    ) -> Self {
        Self {
            report_time: chrono::Local::now().naive_local(),
            instrument_info,
            rates,
            timeline,
            qc_summary,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }
}
