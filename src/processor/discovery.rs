//! Raw file discovery for one instrument
//!
//! Matches the instrument's glob patterns against the top level of the
//! source directory. Matching ignores case so `*.csv` also finds `DATA.CSV`.

use crate::error::{QcError, Result};
use glob::{MatchOptions, Pattern};
use std::path::{Path, PathBuf};
use tokio::task;
use tracing::{debug, warn};

/// File discovery component for an instrument's source directory
#[derive(Debug, Clone)]
pub struct FileDiscovery {
    source_dir: PathBuf,
    patterns: Vec<String>,
}

impl FileDiscovery {
    /// Create a new file discovery instance
    pub fn new(source_dir: PathBuf, patterns: Vec<String>) -> Self {
        Self {
            source_dir,
            patterns,
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Discover raw files matching any pattern, sorted and without duplicates
    pub async fn discover(&self) -> Result<Vec<PathBuf>> {
        let source_dir = self.source_dir.clone();
        let patterns = self.patterns.clone();
        task::spawn_blocking(move || discover_blocking(&source_dir, &patterns)).await?
    }
}

fn discover_blocking(source_dir: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
    let dir = source_dir.to_str().ok_or_else(|| {
        QcError::configuration(format!(
            "source directory {} is not valid UTF-8",
            source_dir.display()
        ))
    })?;
    let options = MatchOptions {
        case_sensitive: false,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };

    let mut files = Vec::new();
    for pattern in patterns {
        let full = format!("{}/{}", Pattern::escape(dir), pattern);
        let entries = glob::glob_with(&full, options).map_err(|e| {
            QcError::configuration(format!("invalid file pattern '{pattern}': {e}"))
        })?;
        for entry in entries {
            match entry {
                Ok(path) if path.is_file() => files.push(path),
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable path: {}", e),
            }
        }
    }

    files.sort();
    files.dedup();
    debug!(
        "Found {} raw files in {} matching {:?}",
        files.len(),
        source_dir.display(),
        patterns
    );
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// Source directory with raw files, a stray note and a generated output folder
    fn create_source_dir(temp_dir: &TempDir) -> PathBuf {
        let source = temp_dir.path().join("NZ_station");
        fs::create_dir_all(source.join("ae33_outputs")).unwrap();
        fs::write(source.join("AE33_2024-01.dat"), "data").unwrap();
        fs::write(source.join("ae33_2024-02.DAT"), "data").unwrap();
        fs::write(source.join("AE33_2024-03.csv"), "data").unwrap();
        fs::write(source.join("notes.txt"), "ignored").unwrap();
        fs::write(source.join("ae33_outputs").join("output_AE33.csv"), "generated").unwrap();
        source
    }

    #[tokio::test]
    async fn test_discovery_is_case_insensitive_and_sorted() {
        let temp_dir = TempDir::new().unwrap();
        let source = create_source_dir(&temp_dir);

        let discovery = FileDiscovery::new(source, vec!["*AE33*.dat".to_string()]);
        let files = discovery.discover().await.unwrap();

        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["AE33_2024-01.dat", "ae33_2024-02.DAT"]);
    }

    #[tokio::test]
    async fn test_overlapping_patterns_are_deduplicated() {
        let temp_dir = TempDir::new().unwrap();
        let source = create_source_dir(&temp_dir);

        let discovery = FileDiscovery::new(
            source,
            vec!["*.csv".to_string(), "AE33*".to_string()],
        );
        let files = discovery.discover().await.unwrap();

        // Three AE33 files; the generated CSV in the output folder is not visited
        assert_eq!(files.len(), 3);
        assert!(files.iter().all(|p| !p.to_string_lossy().contains("_outputs")));
    }

    #[tokio::test]
    async fn test_no_matches_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let discovery = FileDiscovery::new(temp_dir.path().to_path_buf(), vec!["*.nc".to_string()]);
        assert!(discovery.discover().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_pattern_is_a_configuration_error() {
        let temp_dir = TempDir::new().unwrap();
        let discovery = FileDiscovery::new(temp_dir.path().to_path_buf(), vec!["[".to_string()]);
        match discovery.discover().await.unwrap_err() {
            QcError::Configuration { message } => assert!(message.contains("pattern")),
            other => panic!("Expected Configuration error, got {other:?}"),
        }
    }
}
