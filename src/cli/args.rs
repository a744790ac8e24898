//! Command-line argument definitions
//!
//! Defines the CLI interface using the clap derive API and converts it into
//! the library's [`PipelineConfig`] and [`RunParams`].

use crate::config::{CacheMode, PipelineConfig, RunParams};
use crate::constants::DEFAULT_OUTPUT_FREQ;
use crate::error::{QcError, Result};
use crate::timeseries::{Frequency, parse_timestamp};
use chrono::NaiveDateTime;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments for the instrument QC pipeline
///
/// Ingests raw instrument exports from a station directory, applies
/// instrument-specific quality control, caches both snapshots and reports
/// data completeness.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "aeroqc",
    version,
    about = "Ingest, quality-control and report on environmental-sensor time series",
    long_about = "Reads raw instrument exports from a station directory, regularizes them onto a \
                  fixed time grid, flags suspect rows with instrument-specific QC rules and keeps \
                  raw and QC snapshots cached next to the data. Each run writes the requested \
                  window as CSV together with a completeness and downtime report."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Process one instrument's raw files in a station directory
    Run(RunArgs),
    /// List the supported instruments and their settings
    Instruments(InstrumentsArgs),
}

/// Summary output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Coloured human-readable summary
    Human,
    /// Machine-readable JSON
    Json,
}

/// Arguments for the run command
#[derive(Debug, Clone, Parser)]
pub struct RunArgs {
    /// Station directory holding the raw files
    #[arg(value_name = "SOURCE_DIR")]
    pub source_dir: PathBuf,

    /// Instrument name, e.g. AE33, BC1054, NEPH or Table
    #[arg(short = 'n', long = "instrument", value_name = "NAME")]
    pub instrument: String,

    /// Start of the output window (inclusive)
    #[arg(short = 's', long, value_name = "TIME", value_parser = parse_time_arg)]
    pub start: Option<NaiveDateTime>,

    /// End of the output window (inclusive)
    #[arg(short = 'e', long, value_name = "TIME", value_parser = parse_time_arg)]
    pub end: Option<NaiveDateTime>,

    /// Output frequency, e.g. 1min, 30min, 1h, 1d
    #[arg(short = 'f', long = "freq", value_name = "FREQ", default_value = DEFAULT_OUTPUT_FREQ)]
    pub output_freq: Frequency,

    /// Discard cached snapshots and rebuild from every raw file
    #[arg(long, conflicts_with = "append")]
    pub reset: bool,

    /// Merge new or changed raw files into the cached snapshots
    #[arg(long)]
    pub append: bool,

    /// Output raw values instead of QC-masked ones
    #[arg(long)]
    pub raw: bool,

    /// Granularity for rate records in the report [default: 1h]
    #[arg(long = "rate-freq", value_name = "FREQ")]
    pub rate_freq: Option<Frequency>,

    /// Extra rate aggregation period, e.g. 1d
    #[arg(long = "report-freq", value_name = "FREQ")]
    pub report_freq: Option<Frequency>,

    /// Pipeline configuration file (JSON)
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config_path: Option<PathBuf>,

    /// Known-issue table (JSON)
    #[arg(long = "known-issues", value_name = "PATH")]
    pub known_issues: Option<PathBuf>,

    /// Number of files parsed concurrently
    #[arg(short = 'w', long = "workers", value_name = "N")]
    pub workers: Option<usize>,

    /// Gap length in hours still reported as brief downtime
    #[arg(long = "max-gap-hours", value_name = "HOURS")]
    pub max_gap_hours: Option<f64>,

    /// Abort the run after this many seconds
    #[arg(long = "timeout", value_name = "SECONDS")]
    pub timeout_secs: Option<u64>,

    /// Skip writing report.json
    #[arg(long = "no-report")]
    pub no_report: bool,

    /// Skip writing the output CSV
    #[arg(long = "no-output")]
    pub no_output: bool,

    /// Skip the CSV mirrors of the cached snapshots
    #[arg(long = "no-csv-mirror")]
    pub no_csv_mirror: bool,

    /// Summary format
    #[arg(long, value_enum, default_value_t = OutputFormat::Human)]
    pub format: OutputFormat,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short = 'q', long = "quiet", conflicts_with = "verbose")]
    pub quiet: bool,
}

/// Arguments for the instruments command
#[derive(Debug, Clone, Parser)]
pub struct InstrumentsArgs {
    /// Pipeline configuration file (JSON) with additional instruments
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config_path: Option<PathBuf>,

    /// Print the full configuration of each instrument as JSON
    #[arg(long)]
    pub detailed: bool,
}

fn parse_time_arg(value: &str) -> std::result::Result<NaiveDateTime, String> {
    parse_timestamp(value).ok_or_else(|| format!("unrecognised timestamp '{value}'"))
}

impl RunArgs {
    /// Validate flag combinations before any work starts
    pub fn validate(&self) -> Result<()> {
        if !self.source_dir.is_dir() {
            return Err(QcError::SourceNotFound {
                path: self.source_dir.clone(),
            });
        }
        if self.workers == Some(0) {
            return Err(QcError::configuration("--workers must be at least 1"));
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start > end {
                return Err(QcError::InvalidTimeRange { start, end });
            }
        }
        CacheMode::from_flags(self.reset, self.append)?;
        Ok(())
    }

    /// Layer CLI overrides on top of the configuration file or defaults
    pub fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config_path {
            Some(path) => PipelineConfig::from_json_file(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(workers) = self.workers {
            config = config.with_parse_workers(workers);
        }
        if let Some(hours) = self.max_gap_hours {
            config = config.with_max_gap_hours(hours);
        }
        if let Some(path) = &self.known_issues {
            config = config.with_known_issues_path(path.clone());
        }
        if let Some(freq) = self.rate_freq {
            config = config.with_rate_freq(freq);
        }
        let csv_mirror = config.write_csv_mirror && !self.no_csv_mirror;
        config = config
            .with_report(!self.no_report)
            .with_output(!self.no_output)
            .with_csv_mirror(csv_mirror);
        config.validate()?;
        Ok(config)
    }

    pub fn run_params(&self) -> Result<RunParams> {
        let mut params = RunParams::default()
            .with_window(self.start, self.end)
            .with_output_freq(self.output_freq)
            .with_mode(CacheMode::from_flags(self.reset, self.append)?)
            .with_qc(!self.raw);
        if let Some(freq) = self.report_freq {
            params = params.with_report_freq(freq);
        }
        Ok(params)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Determine the appropriate log level based on verbosity flags
    pub fn get_log_level(&self) -> &'static str {
        if self.quiet {
            "warn"
        } else {
            match self.verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            }
        }
    }

    /// Progress bars and the coloured summary are for interactive runs
    pub fn show_progress(&self) -> bool {
        !self.quiet && self.format == OutputFormat::Human
    }
}
