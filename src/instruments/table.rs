//! Delimited table parsing shared by every reader.

use super::{InstrumentReader, QcOutcome};
use crate::config::{InstrumentConfig, TableLayout};
use crate::constants::TABLE_INFER_ROWS;
use crate::error::{QcError, Result};
use crate::qc::QcFlagBuilder;
use crate::timeseries::{RegularTimeSeries, observations_frame, parse_timestamp_with};
use polars::prelude::*;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, warn};

/// Trailing unit annotation such as `BC1(ng/m3)` or `Flow [LPM]`
static UNIT_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+?)\s*[\(\[][^\)\]]*[\)\]]$").expect("unit suffix pattern is valid")
});

/// Generic timestamped table with no QC rules
#[derive(Debug, Clone, Copy, Default)]
pub struct TableReader;

impl InstrumentReader for TableReader {
    fn name(&self) -> &str {
        "Table"
    }

    fn parse(&self, path: &Path, config: &InstrumentConfig) -> Result<Option<DataFrame>> {
        read_delimited_table(path, &config.table)
    }

    fn qc(&self, raw: &RegularTimeSeries, _config: &InstrumentConfig) -> Result<QcOutcome> {
        let engine = QcFlagBuilder::new();
        let data = engine.apply(raw)?;
        Ok(QcOutcome { data, engine })
    }
}

/// Column name with surrounding whitespace, stray delimiters and any
/// trailing unit annotation removed
pub fn normalize_header(name: &str) -> String {
    let trimmed = name.trim().trim_matches(|c| c == ';' || c == '"').trim();
    match UNIT_SUFFIX.captures(trimmed) {
        Some(caps) => caps[1].to_string(),
        None => trimmed.to_string(),
    }
}

/// Read a delimited export into a frame with a `time` column and one
/// numeric column per remaining field.
///
/// Every field is read as text first; rows whose timestamp does not parse
/// are dropped and cells that do not parse as numbers become missing.
/// Returns `Ok(None)` when no row carries a usable timestamp.
pub fn read_delimited_table(path: &Path, layout: &TableLayout) -> Result<Option<DataFrame>> {
    if !layout.delimiter.is_ascii() {
        return Err(QcError::configuration(format!(
            "Delimiter '{}' must be a single ASCII character",
            layout.delimiter
        )));
    }

    let frame = CsvReadOptions::default()
        .with_has_header(true)
        .with_skip_rows(layout.skip_rows)
        .with_infer_schema_length(Some(TABLE_INFER_ROWS))
        .with_ignore_errors(true)
        .with_parse_options(
            CsvParseOptions::default()
                .with_separator(layout.delimiter as u8)
                .with_truncate_ragged_lines(true),
        )
        .try_into_reader_with_file_path(Some(path.to_path_buf()))
        .and_then(|reader| reader.finish())
        .map_err(|e| QcError::parse(path, e.to_string()))?;

    if frame.height() == 0 {
        debug!("{} has no data rows", path.display());
        return Ok(None);
    }

    let wanted = normalize_header(&layout.time_column);
    let time_column = frame
        .get_columns()
        .iter()
        .find(|c| normalize_header(c.name()) == wanted)
        .ok_or_else(|| {
            QcError::parse(
                path,
                format!("time column '{}' not found", layout.time_column),
            )
        })?;

    let text = time_column.cast(&DataType::String)?;
    let mut timestamps = Vec::with_capacity(frame.height());
    let mut kept_rows = Vec::with_capacity(frame.height());
    for (row, value) in text.str()?.into_iter().enumerate() {
        if let Some(ts) = value.and_then(|v| parse_timestamp_with(v, layout.time_format.as_deref())) {
            timestamps.push(ts);
            kept_rows.push(row);
        }
    }

    let dropped = frame.height() - kept_rows.len();
    if dropped > 0 {
        warn!(
            "{}: dropped {} rows with unparseable timestamps",
            path.display(),
            dropped
        );
    }
    if timestamps.is_empty() {
        return Ok(None);
    }

    let mut columns: Vec<(String, Vec<Option<f64>>)> = Vec::new();
    for column in frame.get_columns() {
        let name = normalize_header(column.name());
        if name == wanted || name.is_empty() || columns.iter().any(|(n, _)| *n == name) {
            continue;
        }
        let numeric = column.cast(&DataType::Float64)?;
        let values = numeric.f64()?;
        columns.push((name, kept_rows.iter().map(|row| values.get(*row)).collect()));
    }

    observations_frame(&timestamps, columns).map(Some)
}
