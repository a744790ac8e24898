//! Core data structures shared by the processor and the reporter.
//!
//! Defines the QC summary table, rate records, timeline entries, override
//! records and processing statistics. Everything here is serializable so it
//! can be written into `report.json`.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// `YYYY-mm-dd HH:MM:SS` serialization for report timestamps
pub mod report_time {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S: Serializer>(ts: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        crate::timeseries::parse_timestamp(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{raw}'")))
    }
}

/// One row of the QC summary table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcSummaryRow {
    pub rule: String,
    pub count: usize,
    pub percentage: f64,
    pub description: String,
}

/// Tally of QC flag values, ending with a Valid row
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QcSummary {
    pub rows: Vec<QcSummaryRow>,
}

impl QcSummary {
    /// Total number of rows tallied
    pub fn total(&self) -> usize {
        self.rows.iter().map(|r| r.count).sum()
    }

    pub fn get(&self, rule: &str) -> Option<&QcSummaryRow> {
        self.rows.iter().find(|r| r.rule == rule)
    }

    pub fn count(&self, rule: &str) -> usize {
        self.get(rule).map_or(0, |r| r.count)
    }
}

/// Acquisition, yield and total rates in percent, rounded to one decimal
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rates {
    pub acquisition_rate: f64,
    pub yield_rate: f64,
    pub total_rate: f64,
}

impl Rates {
    /// Field-wise minimum of two rate sets
    pub fn min(self, other: Rates) -> Rates {
        Rates {
            acquisition_rate: self.acquisition_rate.min(other.acquisition_rate),
            yield_rate: self.yield_rate.min(other.yield_rate),
            total_rate: self.total_rate.min(other.total_rate),
        }
    }
}

/// Rates for one aggregation bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateRecord {
    #[serde(with = "report_time")]
    pub period_start: NaiveDateTime,
    #[serde(with = "report_time")]
    pub period_end: NaiveDateTime,
    pub acquisition_rate: f64,
    pub yield_rate: f64,
    pub total_rate: f64,
}

impl RateRecord {
    pub fn new(period_start: NaiveDateTime, period_end: NaiveDateTime, rates: Rates) -> Self {
        Self {
            period_start,
            period_end,
            acquisition_rate: rates.acquisition_rate,
            yield_rate: rates.yield_rate,
            total_rate: rates.total_rate,
        }
    }

    pub fn rates(&self) -> Rates {
        Rates {
            acquisition_rate: self.acquisition_rate,
            yield_rate: self.yield_rate,
            total_rate: self.total_rate,
        }
    }
}

/// Rate records keyed by bucket start
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RatesReport {
    pub weekly: BTreeMap<String, RateRecord>,
    pub monthly: BTreeMap<String, RateRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<BTreeMap<String, RateRecord>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimelineStatus {
    Operational,
    Down,
}

/// A contiguous operational or down interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    #[serde(with = "report_time")]
    pub start: NaiveDateTime,
    #[serde(with = "report_time")]
    pub end: NaiveDateTime,
    pub status: TimelineStatus,
    pub reason: Option<String>,
    pub duration: Option<String>,
}

/// A documented downtime window for one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownIssue {
    #[serde(with = "report_time")]
    pub start: NaiveDateTime,
    #[serde(with = "report_time")]
    pub end: NaiveDateTime,
    pub reason: String,
}

impl KnownIssue {
    /// Whether `(start, end)` intersects this issue; touching endpoints do not count
    pub fn overlaps(&self, start: NaiveDateTime, end: NaiveDateTime) -> bool {
        self.start < end && start < self.end
    }
}

/// A manually excluded time range
#[derive(Debug, Clone, PartialEq)]
pub struct OutlierWindow {
    pub label: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

/// How the orchestrator treated the on-disk snapshots for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    /// No usable snapshot pair existed; built from raw files
    NoCache,
    /// Snapshots were read through without touching raw files
    Fresh,
    /// New raw files were merged into existing snapshots
    Append,
    /// Snapshots were discarded and rebuilt
    Reset,
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CacheState::NoCache => "no cache",
            CacheState::Fresh => "fresh",
            CacheState::Append => "append",
            CacheState::Reset => "reset",
        };
        f.write_str(label)
    }
}

/// Processing statistics
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingStats {
    pub cache_state: CacheState,
    pub files_discovered: usize,
    pub files_parsed: usize,
    pub files_empty: usize,
    pub files_failed: usize,
    pub raw_rows: usize,
    pub output_rows: usize,
    pub processing_time_ms: u128,
}

impl ProcessingStats {
    pub fn new(cache_state: CacheState) -> Self {
        Self {
            cache_state,
            files_discovered: 0,
            files_parsed: 0,
            files_empty: 0,
            files_failed: 0,
            raw_rows: 0,
            output_rows: 0,
            processing_time_ms: 0,
        }
    }
}
