//! Station directories and configurations shared by the processor tests

use crate::config::{InstrumentConfig, PipelineConfig, RetryPolicy};
use crate::timeseries::Frequency;
use chrono::{Duration, NaiveDateTime};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const LOGGER: &str = "Logger";

pub fn ts(value: &str) -> NaiveDateTime {
    crate::timeseries::parse_timestamp(value).unwrap()
}

/// Minute-resolution table instrument with no QC rules of its own
pub fn logger_config() -> InstrumentConfig {
    InstrumentConfig::new(LOGGER, Frequency::MINUTE)
        .with_reader("Table")
        .with_file_patterns(["logger_*.csv"])
}

/// Pipeline with the test logger registered and the known-issue table pinned
/// inside the temporary directory
pub fn pipeline(temp_dir: &TempDir) -> PipelineConfig {
    PipelineConfig::default()
        .with_parse_workers(2)
        .with_known_issues_path(temp_dir.path().join("known_issues.json"))
        .with_retry(RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        })
        .with_instrument(logger_config())
}

pub fn station_dir(temp_dir: &TempDir) -> PathBuf {
    let source = temp_dir.path().join("NZ_station");
    fs::create_dir_all(&source).unwrap();
    source
}

/// Write `minutes` rows starting at `start` with `x = value` and `y = 2 * value`
pub fn write_logger_file(dir: &Path, name: &str, start: &str, minutes: i64, value: f64) {
    let start = ts(start);
    let mut text = String::from("time,x,y\n");
    for i in 0..minutes {
        let t = start + Duration::minutes(i);
        text.push_str(&format!(
            "{},{},{}\n",
            t.format("%Y-%m-%d %H:%M:%S"),
            value,
            value * 2.0
        ));
    }
    fs::write(dir.join(name), text).unwrap();
}
