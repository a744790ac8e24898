//! Configuration management and validation.
//!
//! Provides the per-instrument configuration (file patterns, native
//! frequency, QC thresholds), the pipeline-wide settings, and the parameters
//! of a single run. Instrument configurations are immutable once built and are
//! passed by reference into the processor.

use crate::constants::{
    DEFAULT_COMPLETENESS_THRESHOLD, DEFAULT_INITIAL_BACKOFF_MS, DEFAULT_MAX_BACKOFF_MS,
    DEFAULT_MAX_GAP_HOURS, DEFAULT_OUTLIER_FILE, DEFAULT_SAVE_ATTEMPTS, MAX_GRID_ROWS,
    OUTPUT_FOLDER_SUFFIX, TIME_COLUMN,
};
use crate::error::{QcError, Result};
use crate::filters::StatusCodes;
use crate::timeseries::Frequency;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Statistical outlier check applied as the instrument's `Outlier` rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum OutlierMethod {
    None,
    NSigma { std_range: f64 },
    Iqr { log_dist: bool },
    RollingIqr { window: usize, log_dist: bool },
    TimeAwareIqr { window: Frequency, log_dist: bool },
    MadIqrHybrid { mad_threshold: f64, log_dist: bool },
}

/// Thresholds used by an instrument's QC rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QcThresholds {
    /// Smallest physically valid measurement
    pub min_value: f64,
    /// Largest physically valid measurement
    pub max_value: f64,
    /// Relative step change treated as a spike
    pub max_change_rate: f64,
    /// Fraction of expected hourly samples that must be present
    pub completeness_threshold: f64,
    pub outlier: OutlierMethod,
    /// Accepted range of the absorption Ångström exponent
    pub aae_range: Option<(f64, f64)>,
}

impl Default for QcThresholds {
    fn default() -> Self {
        Self {
            min_value: f64::MIN,
            max_value: f64::MAX,
            max_change_rate: 3.0,
            completeness_threshold: DEFAULT_COMPLETENESS_THRESHOLD,
            outlier: OutlierMethod::None,
            aae_range: None,
        }
    }
}

/// Layout of an instrument's delimited export files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableLayout {
    pub time_column: String,
    /// chrono format for the time column; the common layouts are tried when absent
    pub time_format: Option<String>,
    pub delimiter: char,
    /// Lines to skip before the header row
    pub skip_rows: usize,
}

impl Default for TableLayout {
    fn default() -> Self {
        Self {
            time_column: TIME_COLUMN.to_string(),
            time_format: None,
            delimiter: ',',
            skip_rows: 0,
        }
    }
}

/// An optical channel of an absorption photometer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbsorptionBand {
    pub channel: String,
    pub wavelength_nm: f64,
    /// Mass absorption cross-section in m²/g
    pub mac: f64,
}

/// Immutable description of one instrument type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    pub name: String,
    /// Registered reader handling this instrument; defaults to `name`
    #[serde(default)]
    pub reader: Option<String>,
    pub file_patterns: Vec<String>,
    pub freq: Frequency,
    /// Measurement channels checked by QC; empty means every channel
    #[serde(default)]
    pub channels: Vec<String>,
    /// Rate groups: label to the columns that determine data availability
    #[serde(default)]
    pub rate_keys: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub status_column: Option<String>,
    #[serde(default)]
    pub status_codes: StatusCodes,
    #[serde(default)]
    pub bands: Vec<AbsorptionBand>,
    #[serde(default)]
    pub table: TableLayout,
    #[serde(default)]
    pub thresholds: QcThresholds,
}

impl InstrumentConfig {
    /// Minimal configuration for a generic table instrument
    pub fn new(name: impl Into<String>, freq: Frequency) -> Self {
        Self {
            name: name.into(),
            reader: None,
            file_patterns: vec!["*.csv".to_string()],
            freq,
            channels: Vec::new(),
            rate_keys: BTreeMap::new(),
            status_column: None,
            status_codes: StatusCodes::default(),
            bands: Vec::new(),
            table: TableLayout::default(),
            thresholds: QcThresholds::default(),
        }
    }

    /// Built-in configuration for a supported instrument name
    pub fn builtin(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "TABLE" => Some(Self::table()),
            "AE33" => Some(Self::ae33()),
            "BC1054" => Some(Self::bc1054()),
            "NEPH" => Some(Self::nephelometer()),
            _ => None,
        }
    }

    /// Generic hourly table with no QC rules
    pub fn table() -> Self {
        Self::new("Table", Frequency::HOUR)
    }

    /// Magee AE33 seven-wavelength aethalometer
    pub fn ae33() -> Self {
        let wavelengths = [370.0, 470.0, 520.0, 590.0, 660.0, 880.0, 950.0];
        let macs = [18.47, 14.54, 13.14, 11.58, 10.35, 7.77, 7.19];
        Self::aethalometer("AE33", &wavelengths, &macs)
            .with_file_patterns(["*AE33*.dat", "*AE33*.csv"])
            .with_rate_key("BC Mass Conc. (880 nm)", ["BC6"])
            .with_status_codes(StatusCodes::bitmask([
                1, 2, 4, 8, 16, 32, 64, 1024, 2048, 4096, 8192, 16384,
            ]))
            .with_table_layout(TableLayout {
                time_column: "Time".to_string(),
                ..TableLayout::default()
            })
    }

    /// Met One BC1054 ten-wavelength black carbon monitor
    pub fn bc1054() -> Self {
        let wavelengths = [
            370.0, 430.0, 470.0, 525.0, 565.0, 590.0, 660.0, 700.0, 880.0, 950.0,
        ];
        let macs = [
            18.47, 15.90, 14.54, 13.02, 12.10, 11.58, 10.35, 9.75, 7.77, 7.19,
        ];
        Self::aethalometer("BC1054", &wavelengths, &macs)
            .with_rate_key("BC Mass Conc. (880 nm)", ["BC9"])
            .with_status_codes(StatusCodes::bitmask([1, 2, 4, 8, 16, 32, 65536]))
            .with_table_layout(TableLayout {
                time_column: "Time".to_string(),
                ..TableLayout::default()
            })
    }

    /// Integrating nephelometer (blue, green, red scattering and backscattering)
    pub fn nephelometer() -> Self {
        Self::new("NEPH", Frequency::FIVE_MINUTES)
            .with_file_patterns(["*.dat", "*.csv"])
            .with_channels(["B", "G", "R", "BB", "BG", "BR"])
            .with_rate_key("Scatter Coe. (550 nm)", ["G"])
            .with_thresholds(QcThresholds {
                min_value: 0.0,
                max_value: 2000.0,
                max_change_rate: 3.0,
                outlier: OutlierMethod::TimeAwareIqr {
                    window: Frequency::DAY,
                    log_dist: true,
                },
                ..QcThresholds::default()
            })
    }

    fn aethalometer(name: &str, wavelengths: &[f64], macs: &[f64]) -> Self {
        let bands: Vec<AbsorptionBand> = wavelengths
            .iter()
            .zip(macs)
            .enumerate()
            .map(|(i, (wavelength_nm, mac))| AbsorptionBand {
                channel: format!("BC{}", i + 1),
                wavelength_nm: *wavelength_nm,
                mac: *mac,
            })
            .collect();
        let channels: Vec<String> = bands.iter().map(|b| b.channel.clone()).collect();

        Self {
            channels,
            bands,
            status_column: Some("Status".to_string()),
            thresholds: QcThresholds {
                min_value: 0.0,
                max_value: 20_000.0,
                max_change_rate: 3.0,
                outlier: OutlierMethod::MadIqrHybrid {
                    mad_threshold: 5.0,
                    log_dist: true,
                },
                aae_range: Some((0.7, 3.0)),
                ..QcThresholds::default()
            },
            ..Self::new(name, Frequency::MINUTE)
        }
    }

    pub fn with_file_patterns<S: Into<String>>(mut self, patterns: impl IntoIterator<Item = S>) -> Self {
        self.file_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_reader(mut self, reader: impl Into<String>) -> Self {
        self.reader = Some(reader.into());
        self
    }

    /// Registry key of the reader for this instrument
    pub fn reader_name(&self) -> &str {
        self.reader.as_deref().unwrap_or(&self.name)
    }

    pub fn with_freq(mut self, freq: Frequency) -> Self {
        self.freq = freq;
        self
    }

    pub fn with_channels<S: Into<String>>(mut self, channels: impl IntoIterator<Item = S>) -> Self {
        self.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_rate_key<S: Into<String>>(
        mut self,
        label: impl Into<String>,
        columns: impl IntoIterator<Item = S>,
    ) -> Self {
        self.rate_keys
            .insert(label.into(), columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_status(mut self, column: impl Into<String>, codes: StatusCodes) -> Self {
        self.status_column = Some(column.into());
        self.status_codes = codes;
        self
    }

    pub fn with_status_codes(mut self, codes: StatusCodes) -> Self {
        self.status_codes = codes;
        self
    }

    pub fn with_table_layout(mut self, table: TableLayout) -> Self {
        self.table = table;
        self
    }

    pub fn with_thresholds(mut self, thresholds: QcThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_outlier(mut self, outlier: OutlierMethod) -> Self {
        self.thresholds.outlier = outlier;
        self
    }

    /// Name of the output folder inside the source directory
    pub fn output_folder_name(&self) -> String {
        format!("{}{}", self.name.to_lowercase(), OUTPUT_FOLDER_SUFFIX)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(QcError::configuration("instrument name must not be empty"));
        }
        if self.file_patterns.is_empty() {
            return Err(QcError::configuration(format!(
                "{}: at least one file pattern is required",
                self.name
            )));
        }
        if let Some((label, _)) = self.rate_keys.iter().find(|(_, cols)| cols.is_empty()) {
            return Err(QcError::configuration(format!(
                "{}: rate key '{label}' lists no columns",
                self.name
            )));
        }
        let t = &self.thresholds;
        if t.min_value >= t.max_value {
            return Err(QcError::configuration(format!(
                "{}: min_value {} must be below max_value {}",
                self.name, t.min_value, t.max_value
            )));
        }
        if !(t.completeness_threshold > 0.0 && t.completeness_threshold <= 1.0) {
            return Err(QcError::configuration(format!(
                "{}: completeness_threshold must be in (0, 1]",
                self.name
            )));
        }
        if t.max_change_rate <= 0.0 {
            return Err(QcError::configuration(format!(
                "{}: max_change_rate must be positive",
                self.name
            )));
        }
        if let OutlierMethod::RollingIqr { window: 0, .. } = t.outlier {
            return Err(QcError::configuration(format!(
                "{}: rolling IQR window must be at least one row",
                self.name
            )));
        }
        Ok(())
    }
}

/// Bounded exponential backoff for locked cache saves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_SAVE_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

/// Pipeline-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Raw files parsed concurrently
    pub parse_workers: usize,
    /// Gaps up to this many hours are reported as brief downtime
    pub max_gap_hours: f64,
    /// Bin size for acquisition/yield rates
    pub rate_freq: Frequency,
    pub retry: RetryPolicy,
    /// Known-issue table; falls back to the environment and the user config dir
    pub known_issues_path: Option<PathBuf>,
    /// Manual outlier list, looked up inside the source directory
    pub outlier_file_name: String,
    pub write_csv_mirror: bool,
    pub write_report: bool,
    pub write_output: bool,
    pub instruments: BTreeMap<String, InstrumentConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let instruments = [
            InstrumentConfig::table(),
            InstrumentConfig::ae33(),
            InstrumentConfig::bc1054(),
            InstrumentConfig::nephelometer(),
        ]
        .into_iter()
        .map(|cfg| (cfg.name.clone(), cfg))
        .collect();

        Self {
            parse_workers: num_cpus::get(),
            max_gap_hours: DEFAULT_MAX_GAP_HOURS,
            rate_freq: Frequency::HOUR,
            retry: RetryPolicy::default(),
            known_issues_path: None,
            outlier_file_name: DEFAULT_OUTLIER_FILE.to_string(),
            write_csv_mirror: true,
            write_report: true,
            write_output: true,
            instruments,
        }
    }
}

impl PipelineConfig {
    /// Load settings from a JSON file.
    ///
    /// Missing fields keep their defaults and listed instruments replace or
    /// extend the built-in ones.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let parsed: PipelineConfig = serde_json::from_str(&text)?;
        let mut instruments = PipelineConfig::default().instruments;
        instruments.extend(parsed.instruments);
        let config = Self {
            instruments,
            ..parsed
        };
        config.validate()?;
        debug!("Loaded pipeline configuration from {}", path.display());
        Ok(config)
    }

    pub fn with_parse_workers(mut self, workers: usize) -> Self {
        self.parse_workers = workers;
        self
    }

    pub fn with_max_gap_hours(mut self, hours: f64) -> Self {
        self.max_gap_hours = hours;
        self
    }

    pub fn with_rate_freq(mut self, freq: Frequency) -> Self {
        self.rate_freq = freq;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_known_issues_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_issues_path = Some(path.into());
        self
    }

    pub fn with_csv_mirror(mut self, enabled: bool) -> Self {
        self.write_csv_mirror = enabled;
        self
    }

    pub fn with_report(mut self, enabled: bool) -> Self {
        self.write_report = enabled;
        self
    }

    pub fn with_output(mut self, enabled: bool) -> Self {
        self.write_output = enabled;
        self
    }

    pub fn with_instrument(mut self, instrument: InstrumentConfig) -> Self {
        self.instruments.insert(instrument.name.clone(), instrument);
        self
    }

    /// Case-insensitive lookup of an instrument configuration
    pub fn instrument(&self, name: &str) -> Result<&InstrumentConfig> {
        self.instruments
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, cfg)| cfg)
            .ok_or_else(|| QcError::UnknownInstrument {
                name: name.to_string(),
            })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.parse_workers == 0 {
            return Err(QcError::configuration("parse_workers must be at least 1"));
        }
        if self.max_gap_hours < 0.0 {
            return Err(QcError::configuration("max_gap_hours must not be negative"));
        }
        if self.retry.max_attempts == 0 {
            return Err(QcError::configuration("retry.max_attempts must be at least 1"));
        }
        if self.outlier_file_name.trim().is_empty() {
            return Err(QcError::configuration("outlier_file_name must not be empty"));
        }
        for instrument in self.instruments.values() {
            instrument.validate()?;
        }
        Ok(())
    }
}

/// What to do with existing snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CacheMode {
    /// Use existing snapshots as-is, building them only when absent
    #[default]
    ReadThrough,
    /// Merge newly seen raw files into existing snapshots
    Append,
    /// Discard existing snapshots and rebuild from every raw file
    Reset,
}

impl CacheMode {
    pub fn from_flags(reset: bool, append: bool) -> Result<Self> {
        match (reset, append) {
            (true, true) => Err(QcError::configuration(
                "reset and append cannot be combined",
            )),
            (true, false) => Ok(CacheMode::Reset),
            (false, true) => Ok(CacheMode::Append),
            (false, false) => Ok(CacheMode::ReadThrough),
        }
    }
}

/// Parameters of one processing run
#[derive(Debug, Clone)]
pub struct RunParams {
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
    pub output_freq: Frequency,
    pub mode: CacheMode,
    /// Return QC-masked output instead of raw values
    pub qc: bool,
    /// Extra rate aggregation granularity for the report
    pub report_freq: Option<Frequency>,
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            output_freq: Frequency::HOUR,
            mode: CacheMode::ReadThrough,
            qc: true,
            report_freq: None,
        }
    }
}

impl RunParams {
    pub fn with_window(mut self, start: Option<NaiveDateTime>, end: Option<NaiveDateTime>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub fn with_output_freq(mut self, freq: Frequency) -> Self {
        self.output_freq = freq;
        self
    }

    pub fn with_mode(mut self, mode: CacheMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_qc(mut self, qc: bool) -> Self {
        self.qc = qc;
        self
    }

    pub fn with_report_freq(mut self, freq: Frequency) -> Self {
        self.report_freq = Some(freq);
        self
    }

    /// Reject bad parameters before any I/O
    pub fn validate(&self, instrument: &InstrumentConfig) -> Result<()> {
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start > end {
                return Err(QcError::InvalidTimeRange { start, end });
            }
            let rows = instrument.freq.steps_between(start, end);
            if rows >= MAX_GRID_ROWS as i64 {
                return Err(QcError::configuration(format!(
                    "window {start} to {end} spans {rows} steps of {}, more than {MAX_GRID_ROWS}",
                    instrument.freq
                )));
            }
        }
        if self.output_freq < instrument.freq {
            return Err(QcError::configuration(format!(
                "output frequency {} is finer than the {} native frequency {}",
                self.output_freq, instrument.name, instrument.freq
            )));
        }
        if let Some(report_freq) = self.report_freq {
            if report_freq < instrument.freq {
                return Err(QcError::configuration(format!(
                    "report frequency {report_freq} is finer than the native frequency {}",
                    instrument.freq
                )));
            }
        }
        Ok(())
    }
}
