//! Operator-maintained override files: manual exclusions and known issues.

use crate::constants::{
    KNOWN_ISSUES_ENV, KNOWN_ISSUES_FILE, MANUAL_EXCLUSION, MANUAL_EXCLUSION_DESCRIPTION,
};
use crate::error::Result;
use crate::instruments::QcOutcome;
use crate::models::{KnownIssue, OutlierWindow};
use crate::timeseries::parse_timestamp;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Read a manual exclusion list of `{"label": ["start", "end"]}` entries.
///
/// A missing file means no exclusions. Entries that are not a pair of
/// timestamps, or whose start is after their end, are skipped with a warning.
pub fn load_outlier_windows(path: &Path) -> Result<Vec<OutlierWindow>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let document: Value = serde_json::from_slice(&fs::read(path)?)?;
    let Some(entries) = document.as_object() else {
        warn!("{} is not a JSON object; ignoring it", path.display());
        return Ok(Vec::new());
    };

    let mut windows = Vec::new();
    for (label, range) in entries {
        let bounds = range
            .as_array()
            .filter(|pair| pair.len() == 2)
            .and_then(|pair| {
                let start = pair[0].as_str().and_then(parse_timestamp)?;
                let end = pair[1].as_str().and_then(parse_timestamp)?;
                (start <= end).then_some((start, end))
            });
        match bounds {
            Some((start, end)) => windows.push(OutlierWindow {
                label: label.clone(),
                start,
                end,
            }),
            None => warn!(
                "Skipping malformed exclusion '{}' in {}: expected [start, end]",
                label,
                path.display()
            ),
        }
    }
    debug!("Loaded {} manual exclusions from {}", windows.len(), path.display());
    Ok(windows)
}

/// Mask every channel inside the exclusion windows and relabel rows that
/// were still Valid. Returns the number of rows inside any window.
pub fn apply_outlier_windows(outcome: &mut QcOutcome, windows: &[OutlierWindow]) -> Result<usize> {
    let QcOutcome { data, engine } = outcome;
    let mask: Vec<bool> = data
        .timestamps()
        .map(|ts| windows.iter().any(|w| w.start <= ts && ts <= w.end))
        .collect();
    let hits = mask.iter().filter(|hit| **hit).count();
    if hits == 0 {
        return Ok(0);
    }
    engine.update_qc_flag(data, &mask, MANUAL_EXCLUSION, MANUAL_EXCLUSION_DESCRIPTION)?;
    data.mask_rows(&mask)?;
    Ok(hits)
}

/// Where to look for the known-issue table: the configured path, then the
/// environment variable, then the user config directory
pub fn resolve_known_issues_path(configured: Option<&Path>) -> Option<PathBuf> {
    configured
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(KNOWN_ISSUES_ENV).map(PathBuf::from))
        .or_else(|| dirs::config_dir().map(|dir| dir.join("aeroqc").join(KNOWN_ISSUES_FILE)))
}

/// Known issues for one instrument from a `{instrument: [{start, end, reason}]}` table.
///
/// Absence of the file, or of the instrument in it, gives an empty set. An
/// unreadable file and malformed entries are logged and skipped.
pub fn load_known_issues(path: Option<&Path>, instrument: &str) -> Vec<KnownIssue> {
    let Some(path) = path else {
        return Vec::new();
    };
    if !path.exists() {
        debug!("No known-issue table at {}", path.display());
        return Vec::new();
    }

    let document: Value = match fs::read(path)
        .map_err(|e| e.to_string())
        .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|e| e.to_string()))
    {
        Ok(document) => document,
        Err(e) => {
            warn!("Ignoring unreadable known-issue table {}: {}", path.display(), e);
            return Vec::new();
        }
    };

    let entries = document
        .as_object()
        .and_then(|map| {
            map.iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(instrument))
                .map(|(_, entries)| entries)
        })
        .and_then(Value::as_array);
    let Some(entries) = entries else {
        return Vec::new();
    };

    entries
        .iter()
        .enumerate()
        .filter_map(|(i, entry)| match serde_json::from_value::<KnownIssue>(entry.clone()) {
            Ok(issue) if issue.start <= issue.end => Some(issue),
            Ok(_) => {
                warn!("Skipping known issue #{} for {}: start is after end", i, instrument);
                None
            }
            Err(e) => {
                warn!("Skipping malformed known issue #{} for {}: {}", i, instrument, e);
                None
            }
        })
        .collect()
}
