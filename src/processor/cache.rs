//! On-disk raw and QC snapshots.
//!
//! Each instrument keeps a pair of parquet snapshots, optional CSV mirrors
//! and a JSON manifest in its output folder. The manifest is written last and
//! removed first, so a snapshot pair is only trusted when a compatible
//! manifest vouches for it. Every file is written to a temporary file in the
//! same directory and renamed into place.

use crate::config::RetryPolicy;
use crate::constants::{CACHE_FORMAT_VERSION, CACHE_PREFIX};
use crate::error::{QcError, Result};
use crate::timeseries::{Frequency, RegularTimeSeries};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tempfile::NamedTempFile;
use tokio::task;
use tracing::{debug, info, warn};

/// Identity of a raw file at the time it was ingested
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub name: String,
    pub len: u64,
    pub modified_ms: i64,
}

impl SourceFile {
    pub fn from_path(path: &Path) -> Result<Self> {
        let metadata = fs::metadata(path)?;
        let modified_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_millis() as i64);
        Ok(Self {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            len: metadata.len(),
            modified_ms,
        })
    }
}

/// Commit marker describing a snapshot pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheManifest {
    pub format_version: u32,
    pub instrument: String,
    pub freq: Frequency,
    pub raw_rows: usize,
    pub qc_rows: usize,
    pub channels: Vec<String>,
    pub sources: Vec<SourceFile>,
}

impl CacheManifest {
    pub fn new(
        instrument: &str,
        raw: &RegularTimeSeries,
        qc: &RegularTimeSeries,
        mut sources: Vec<SourceFile>,
    ) -> Self {
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            format_version: CACHE_FORMAT_VERSION,
            instrument: instrument.to_string(),
            freq: raw.freq(),
            raw_rows: raw.len(),
            qc_rows: qc.len(),
            channels: raw.channel_names().into_iter().map(str::to_string).collect(),
            sources,
        }
    }

    pub fn is_compatible(&self, instrument: &str, freq: Frequency) -> bool {
        self.format_version == CACHE_FORMAT_VERSION
            && self.instrument.eq_ignore_ascii_case(instrument)
            && self.freq == freq
    }

    /// Whether `file` was already ingested unchanged
    pub fn contains(&self, file: &SourceFile) -> bool {
        self.sources.contains(file)
    }
}

/// Merge newly ingested files into a source list; a re-ingested name replaces its old entry
pub fn merge_sources(existing: &[SourceFile], ingested: &[SourceFile]) -> Vec<SourceFile> {
    let mut merged: Vec<SourceFile> = existing
        .iter()
        .filter(|old| !ingested.iter().any(|new| new.name == old.name))
        .cloned()
        .collect();
    merged.extend(ingested.iter().cloned());
    merged
}

/// A loaded snapshot pair
#[derive(Debug, Clone)]
pub struct CachedSnapshots {
    pub raw: RegularTimeSeries,
    pub qc: RegularTimeSeries,
    pub manifest: CacheManifest,
}

/// Snapshot store for one instrument's output folder
#[derive(Debug, Clone)]
pub struct SnapshotCache {
    dir: PathBuf,
    instrument: String,
    freq: Frequency,
    write_csv_mirror: bool,
    retry: RetryPolicy,
}

impl SnapshotCache {
    pub fn new(dir: PathBuf, instrument: &str, freq: Frequency) -> Self {
        Self {
            dir,
            instrument: instrument.to_string(),
            freq,
            write_csv_mirror: true,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_csv_mirror(mut self, enabled: bool) -> Self {
        self.write_csv_mirror = enabled;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn file(&self, suffix: &str) -> PathBuf {
        self.dir
            .join(format!("{CACHE_PREFIX}{}_{suffix}", self.instrument.to_lowercase()))
    }

    pub fn raw_path(&self) -> PathBuf {
        self.file("raw.parquet")
    }

    pub fn qc_path(&self) -> PathBuf {
        self.file("qc.parquet")
    }

    pub fn raw_csv_path(&self) -> PathBuf {
        self.file("raw.csv")
    }

    pub fn qc_csv_path(&self) -> PathBuf {
        self.file("qc.csv")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.file("manifest.json")
    }

    /// Load the snapshot pair, or `None` when it is missing, incomplete or
    /// written by an incompatible version
    pub async fn load(&self) -> Result<Option<CachedSnapshots>> {
        let cache = self.clone();
        task::spawn_blocking(move || cache.load_blocking()).await?
    }

    fn load_blocking(&self) -> Result<Option<CachedSnapshots>> {
        let manifest_path = self.manifest_path();
        if !manifest_path.exists() {
            debug!("No cache manifest at {}", manifest_path.display());
            return Ok(None);
        }

        let manifest: CacheManifest = match fs::read(&manifest_path)
            .map_err(QcError::from)
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(QcError::from))
        {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("Ignoring unreadable cache manifest {}: {}", manifest_path.display(), e);
                return Ok(None);
            }
        };
        if !manifest.is_compatible(&self.instrument, self.freq) {
            warn!(
                "Cache manifest {} (format {}, {} at {}) does not match {} at {}; rebuilding",
                manifest_path.display(),
                manifest.format_version,
                manifest.instrument,
                manifest.freq,
                self.instrument,
                self.freq
            );
            return Ok(None);
        }

        let snapshots = read_snapshot(&self.raw_path(), self.freq)
            .and_then(|raw| Ok((raw, read_snapshot(&self.qc_path(), self.freq)?)));
        match snapshots {
            Ok((raw, qc)) if raw.len() == manifest.raw_rows && qc.len() == manifest.qc_rows => {
                debug!("Loaded cached snapshots: {} raw rows, {} QC rows", raw.len(), qc.len());
                Ok(Some(CachedSnapshots { raw, qc, manifest }))
            }
            Ok(_) => {
                warn!("Cached snapshots disagree with their manifest; rebuilding");
                Ok(None)
            }
            Err(e) => {
                warn!("Ignoring unreadable cached snapshots: {}", e);
                Ok(None)
            }
        }
    }

    /// Persist a snapshot pair, retrying while the destination is locked
    pub async fn save(
        &self,
        raw: &RegularTimeSeries,
        qc: &RegularTimeSeries,
        sources: Vec<SourceFile>,
    ) -> Result<CacheManifest> {
        let manifest = CacheManifest::new(&self.instrument, raw, qc, sources);
        let raw_frame = raw.to_frame()?;
        let qc_frame = qc.to_frame()?;

        retry_locked(&self.retry, || {
            let cache = self.clone();
            let (raw_frame, qc_frame, to_write) =
                (raw_frame.clone(), qc_frame.clone(), manifest.clone());
            async move {
                task::spawn_blocking(move || cache.save_blocking(raw_frame, qc_frame, &to_write))
                    .await?
            }
        })
        .await?;

        info!(
            "Saved {} snapshots ({} rows) to {}",
            self.instrument,
            manifest.raw_rows,
            self.dir.display()
        );
        Ok(manifest)
    }

    fn save_blocking(
        &self,
        mut raw: DataFrame,
        mut qc: DataFrame,
        manifest: &CacheManifest,
    ) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| QcError::cache_write(&self.dir, e))?;

        let manifest_path = self.manifest_path();
        match fs::remove_file(&manifest_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(QcError::cache_write(&manifest_path, e)),
        }

        write_atomic(&self.raw_path(), |file| {
            ParquetWriter::new(file).finish(&mut raw)?;
            Ok(())
        })?;
        write_atomic(&self.qc_path(), |file| {
            ParquetWriter::new(file).finish(&mut qc)?;
            Ok(())
        })?;
        if self.write_csv_mirror {
            write_atomic(&self.raw_csv_path(), |file| write_csv(file, &mut raw))?;
            write_atomic(&self.qc_csv_path(), |file| write_csv(file, &mut qc))?;
        }

        let bytes = serde_json::to_vec_pretty(manifest)?;
        write_atomic(&manifest_path, |file| {
            file.write_all(&bytes)?;
            Ok(())
        })
    }
}

/// Run a write, retrying while its destination is locked.
///
/// Each retry asks the operator to release the file and waits with
/// exponential backoff. Other errors, and the last locked error once
/// attempts run out, are returned as is.
pub async fn retry_locked<T, F, Fut>(retry: &RetryPolicy, mut write: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match write().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retriable() && attempt < retry.max_attempts => {
                let wait = retry.backoff(attempt);
                warn!(
                    "{}. Close any program holding the file; retrying in {:?} (attempt {}/{})",
                    e, wait, attempt, retry.max_attempts
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn read_snapshot(path: &Path, freq: Frequency) -> Result<RegularTimeSeries> {
    let frame = ParquetReader::new(File::open(path)?).finish()?;
    RegularTimeSeries::from_frame(&frame, freq)
}

/// Write through a temporary file in the destination directory and rename it into place
pub fn write_atomic(path: &Path, write: impl FnOnce(&mut File) -> Result<()>) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| QcError::cache_write(path, e))?;
    write(tmp.as_file_mut())?;
    tmp.as_file_mut()
        .flush()
        .map_err(|e| QcError::cache_write(path, e))?;
    tmp.persist(path)
        .map_err(|e| QcError::cache_write(path, e.error))?;
    Ok(())
}

/// Write a frame as CSV with a header row
pub fn write_csv(file: &mut File, frame: &mut DataFrame) -> Result<()> {
    CsvWriter::new(file).include_header(true).finish(frame)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::VALID;
    use crate::timeseries::parse_timestamp;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn snapshots() -> (RegularTimeSeries, RegularTimeSeries) {
        let raw = RegularTimeSeries::new(parse_timestamp("2024-01-01").unwrap(), Frequency::HOUR, 3)
            .with_channel("x", vec![1.0, f64::NAN, 3.0])
            .unwrap();
        let mut qc = raw.clone();
        qc.set_flags(vec![VALID.to_string(), VALID.to_string(), "Spike".to_string()])
            .unwrap();
        (raw, qc)
    }

    fn source(name: &str, len: u64) -> SourceFile {
        SourceFile {
            name: name.to_string(),
            len,
            modified_ms: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn test_save_then_load_round_trips() {
        let temp_dir = TempDir::new().unwrap();
        let cache = SnapshotCache::new(temp_dir.path().join("table_outputs"), "Table", Frequency::HOUR);
        let (raw, qc) = snapshots();

        let manifest = cache.save(&raw, &qc, vec![source("a.csv", 10)]).await.unwrap();
        assert_eq!(manifest.raw_rows, 3);
        let loaded = cache.load().await.unwrap().unwrap();
        assert_eq!(loaded.manifest, manifest);

        assert!(loaded.raw.content_eq(&raw));
        assert!(loaded.qc.content_eq(&qc));
        assert_eq!(loaded.manifest.sources, vec![source("a.csv", 10)]);
        assert!(cache.raw_csv_path().exists());
        assert!(cache.manifest_path().exists());
    }

    #[tokio::test]
    async fn test_missing_manifest_means_no_cache() {
        let temp_dir = TempDir::new().unwrap();
        let cache = SnapshotCache::new(temp_dir.path().to_path_buf(), "Table", Frequency::HOUR);
        let (raw, qc) = snapshots();
        cache.save(&raw, &qc, Vec::new()).await.unwrap();

        fs::remove_file(cache.manifest_path()).unwrap();

        assert!(cache.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_incompatible_manifest_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let cache = SnapshotCache::new(temp_dir.path().to_path_buf(), "Table", Frequency::HOUR);
        let (raw, qc) = snapshots();
        cache.save(&raw, &qc, Vec::new()).await.unwrap();

        let mut manifest: CacheManifest =
            serde_json::from_slice(&fs::read(cache.manifest_path()).unwrap()).unwrap();
        manifest.format_version += 1;
        fs::write(cache.manifest_path(), serde_json::to_vec(&manifest).unwrap()).unwrap();

        assert!(cache.load().await.unwrap().is_none());
    }

    #[test]
    fn test_merge_sources_replaces_changed_files() {
        let merged = merge_sources(
            &[source("a.csv", 10), source("b.csv", 20)],
            &[source("b.csv", 25), source("c.csv", 5)],
        );
        assert_eq!(
            merged,
            vec![source("a.csv", 10), source("b.csv", 25), source("c.csv", 5)]
        );
    }

    fn quick_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    fn locked(path: &Path) -> QcError {
        QcError::cache_write(path, std::io::Error::from(std::io::ErrorKind::PermissionDenied))
    }

    #[tokio::test]
    async fn test_locked_write_is_retried_until_released() {
        let path = PathBuf::from("output_Table.csv");
        let attempts = AtomicU32::new(0);

        let result = retry_locked(&quick_retry(4), || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let outcome = if attempt < 3 { Err(locked(&path)) } else { Ok(attempt) };
            async move { outcome }
        })
        .await
        .unwrap();

        assert_eq!(result, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_locked_write_gives_up_after_max_attempts() {
        let path = PathBuf::from("report.json");
        let attempts = AtomicU32::new(0);

        let result: Result<()> = retry_locked(&quick_retry(3), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            let outcome = Err(locked(&path));
            async move { outcome }
        })
        .await;

        match result.unwrap_err() {
            QcError::CacheLocked { path: locked_path, .. } => assert_eq!(locked_path, path),
            other => panic!("Expected CacheLocked error, got {other:?}"),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_write_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);

        let result: Result<()> = retry_locked(&quick_retry(5), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            let outcome = Err(QcError::cache_write(
                Path::new("missing/report.json"),
                std::io::Error::from(std::io::ErrorKind::NotFound),
            ));
            async move { outcome }
        })
        .await;

        assert!(matches!(result, Err(QcError::Io(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_write_atomic_replaces_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("report.json");
        fs::write(&path, "old").unwrap();

        write_atomic(&path, |file| {
            file.write_all(b"new")?;
            Ok(())
        })
        .unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }
}
