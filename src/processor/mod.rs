//! Ingestion orchestrator.
//!
//! Drives one instrument's data through discovery, parsing, time-axis
//! regularization, QC, manual exclusions, snapshot caching, windowing and
//! resampling, then hands both snapshots to the reporter.

pub mod cache;
pub mod context;
pub mod discovery;
pub mod event_log;
pub mod overrides;

#[cfg(test)]
pub mod tests;

use self::{
    cache::{SnapshotCache, SourceFile, merge_sources, retry_locked, write_atomic, write_csv},
    context::RunContext,
    discovery::FileDiscovery,
    event_log::EventLog,
};

use crate::config::{CacheMode, InstrumentConfig, PipelineConfig, RunParams};
use crate::constants::REPORT_FILE_NAME;
use crate::error::{QcError, Result};
use crate::instruments::{self, InstrumentReader, QcOutcome, rules::qc_channels};
use crate::models::{CacheState, ProcessingStats, QcSummary, RatesReport, TimelineEntry};
use crate::report::{self, InstrumentInfo, InstrumentReport};
use crate::timeseries::RegularTimeSeries;

use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use polars::prelude::DataFrame;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;
use tokio::task;
use tracing::{debug, error, info, warn};

/// Everything one run produces
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Windowed and resampled data; QC-masked with an aggregated flag unless raw output was requested
    pub data: RegularTimeSeries,
    /// QC summary over the requested window
    pub summary: QcSummary,
    pub rates: RatesReport,
    pub timeline: Vec<TimelineEntry>,
    pub stats: ProcessingStats,
}

/// Result of parsing a batch of raw files
struct ParsedBatch {
    raw: Option<RegularTimeSeries>,
    /// Files that parsed, including those holding no rows
    ingested: Vec<SourceFile>,
}

impl ParsedBatch {
    fn into_parts(self) -> Option<(RegularTimeSeries, Vec<SourceFile>)> {
        let ParsedBatch { raw, ingested } = self;
        raw.map(|raw| (raw, ingested))
    }
}

/// Orchestrator for one instrument in one source directory
///
/// Assumes a single writer per output folder. Snapshot files are replaced by
/// atomic rename, so concurrent writers race with the last rename winning.
pub struct InstrumentProcessor {
    config: Arc<InstrumentConfig>,
    pipeline: PipelineConfig,
    reader: Arc<dyn InstrumentReader>,
    source_dir: PathBuf,
    output_dir: PathBuf,
    discovery: FileDiscovery,
    cache: SnapshotCache,
    event_log: EventLog,
}

impl std::fmt::Debug for InstrumentProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentProcessor")
            .field("instrument", &self.config.name)
            .field("reader", &self.reader.name())
            .field("source_dir", &self.source_dir)
            .field("output_dir", &self.output_dir)
            .finish_non_exhaustive()
    }
}

impl InstrumentProcessor {
    /// Resolve the instrument's configuration and registered reader
    pub fn new(
        pipeline: &PipelineConfig,
        instrument: &str,
        source_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        pipeline.validate()?;
        let config = pipeline.instrument(instrument)?.clone();
        let reader =
            instruments::lookup(config.reader_name()).ok_or_else(|| QcError::UnknownInstrument {
                name: config.reader_name().to_string(),
            })?;
        Self::with_reader(pipeline, config, reader, source_dir)
    }

    /// Build a processor around an explicit reader
    pub fn with_reader(
        pipeline: &PipelineConfig,
        config: InstrumentConfig,
        reader: Arc<dyn InstrumentReader>,
        source_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        config.validate()?;
        let source_dir = source_dir.into();
        if !source_dir.is_dir() {
            return Err(QcError::SourceNotFound { path: source_dir });
        }

        let output_dir = source_dir.join(config.output_folder_name());
        let discovery = FileDiscovery::new(source_dir.clone(), config.file_patterns.clone());
        let cache = SnapshotCache::new(output_dir.clone(), &config.name, config.freq)
            .with_csv_mirror(pipeline.write_csv_mirror)
            .with_retry(pipeline.retry.clone());
        let event_log = EventLog::new(output_dir.join(format!("{}.log", config.name)));

        Ok(Self {
            config: Arc::new(config),
            pipeline: pipeline.clone(),
            reader,
            source_dir,
            output_dir,
            discovery,
            cache,
            event_log,
        })
    }

    pub fn config(&self) -> &InstrumentConfig {
        &self.config
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(format!("output_{}.csv", self.config.name))
    }

    pub fn report_path(&self) -> PathBuf {
        self.output_dir.join(REPORT_FILE_NAME)
    }

    /// Main processing entry point
    pub async fn run(&self, params: &RunParams, ctx: &RunContext) -> Result<RunOutput> {
        let start_time = Instant::now();
        params.validate(&self.config)?;
        ctx.check()?;

        let name = self.config.name.as_str();
        info!(
            "Processing {} in {} ({:?} mode)",
            name,
            self.source_dir.display(),
            params.mode
        );
        fs::create_dir_all(&self.output_dir).await?;

        // Step 1: resolve cache state and build the raw snapshot
        let cached = match params.mode {
            CacheMode::Reset => None,
            CacheMode::ReadThrough | CacheMode::Append => self.cache.load().await?,
        };

        let mut stats;
        let raw;
        let mut cached_qc = None;
        let mut to_persist: Option<Vec<SourceFile>> = None;

        match cached {
            Some(cached) if params.mode == CacheMode::ReadThrough => {
                stats = ProcessingStats::new(CacheState::Fresh);
                self.report_unseen_files(&cached.manifest.sources).await;
                self.event_log.record(format!(
                    "Read cached snapshots ({} rows)",
                    cached.raw.len()
                ));
                raw = cached.raw;
                cached_qc = Some(cached.qc);
            }
            Some(cached) => {
                let files = self.discovery.discover().await?;
                let mut fresh = Vec::new();
                for path in &files {
                    if !cached.manifest.contains(&SourceFile::from_path(path)?) {
                        fresh.push(path.clone());
                    }
                }
                info!(
                    "Append: {} of {} raw files are new or changed",
                    fresh.len(),
                    files.len()
                );

                stats = ProcessingStats::new(CacheState::Append);
                stats.files_discovered = files.len();
                let batch = if fresh.is_empty() {
                    None
                } else {
                    self.parse_files(&fresh, ctx, &mut stats).await?.into_parts()
                };

                match batch {
                    Some((new_raw, ingested)) => {
                        raw = cached.raw.merge_append(&new_raw)?;
                        to_persist = Some(merge_sources(&cached.manifest.sources, &ingested));
                        self.event_log.record(format!(
                            "Appended {} files; snapshot now spans {} rows",
                            ingested.len(),
                            raw.len()
                        ));
                    }
                    None => {
                        if fresh.is_empty() {
                            info!("No new raw files; cache left unchanged");
                        } else {
                            warn!("No usable rows in the new raw files; cache left unchanged");
                        }
                        stats.cache_state = CacheState::Fresh;
                        raw = cached.raw;
                        cached_qc = Some(cached.qc);
                    }
                }
            }
            None => {
                let state = if params.mode == CacheMode::Reset {
                    CacheState::Reset
                } else {
                    CacheState::NoCache
                };
                stats = ProcessingStats::new(state);

                let files = self.discovery.discover().await?;
                if files.is_empty() {
                    return Err(QcError::NoFilesFound {
                        path: self.source_dir.clone(),
                        patterns: self.discovery.patterns().join(", "),
                    });
                }
                stats.files_discovered = files.len();
                info!("Found {} raw files for {}", files.len(), name);

                let batch = self.parse_files(&files, ctx, &mut stats).await?;
                raw = batch.raw.ok_or_else(|| QcError::NoUsableData {
                    path: self.source_dir.clone(),
                    count: files.len(),
                })?;
                to_persist = Some(batch.ingested);
                self.event_log.record(format!(
                    "Built raw snapshot from {} files ({} rows, {})",
                    stats.files_parsed, raw.len(), state
                ));
            }
        }
        stats.raw_rows = raw.len();

        // Step 2: QC, derived quantities and manual exclusions
        let qc = self.quality_control(&raw)?;
        if let Some(cached_qc) = &cached_qc {
            if !cached_qc.content_eq(&qc.data) {
                warn!(
                    "Cached QC snapshot differs from a fresh QC pass; run with --reset to refresh it"
                );
            }
        }

        // Step 3: persist both snapshots
        if let Some(sources) = to_persist {
            ctx.check()?;
            self.cache.save(&raw, &qc.data, sources).await?;
            self.event_log
                .record(format!("Saved raw and QC snapshots ({} rows)", raw.len()));
        }

        // Step 4: window, summarize and resample
        let raw_window = raw.window(params.start, params.end)?;
        let qc_window = qc.data.window(params.start, params.end)?;
        let summary = qc.engine.get_summary(&qc_window)?;
        for row in &summary.rows {
            self.event_log.record(format!(
                "QC {}: {} rows ({:.1}%)",
                row.rule, row.count, row.percentage
            ));
        }

        let data = if params.qc {
            qc_window.masked_invalid().resample(params.output_freq)?
        } else {
            raw_window.resample(params.output_freq)?
        };
        stats.output_rows = data.len();

        // Step 5: rates and timeline
        let rates = report::process_rates_report(
            &raw_window,
            &qc_window,
            &self.config,
            self.pipeline.rate_freq,
            params.report_freq,
        )?;
        let known_issues_path =
            overrides::resolve_known_issues_path(self.pipeline.known_issues_path.as_deref());
        let known_issues = overrides::load_known_issues(known_issues_path.as_deref(), name);
        let channels = qc_channels(&self.config, &raw_window);
        let timeline = report::process_timeline_report(
            &raw_window.select(&channels, "timeline")?,
            &known_issues,
            self.pipeline.max_gap_hours,
        );

        self.write_outputs(&data, &rates, &timeline, &summary).await?;

        stats.processing_time_ms = start_time.elapsed().as_millis();
        info!(
            "{} done in {}ms: {} raw rows, {} output rows ({})",
            name, stats.processing_time_ms, stats.raw_rows, stats.output_rows, stats.cache_state
        );

        Ok(RunOutput {
            data,
            summary,
            rates,
            timeline,
            stats,
        })
    }

    /// Parse files with bounded, order-preserving concurrency.
    ///
    /// A failure in one file is logged and counted; only cancellation and
    /// configuration errors stop the batch.
    async fn parse_files(
        &self,
        files: &[PathBuf],
        ctx: &RunContext,
        stats: &mut ProcessingStats,
    ) -> Result<ParsedBatch> {
        let pb = if ctx.show_progress() {
            ProgressBar::new(files.len() as u64)
        } else {
            ProgressBar::hidden()
        };
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb.set_message(format!("Parsing {} files", self.config.name));

        let workers = self.pipeline.parse_workers.clamp(1, files.len().max(1));
        let results: Vec<(PathBuf, Result<Option<DataFrame>>)> = stream::iter(files.iter().cloned())
            .map(|path| {
                let reader = Arc::clone(&self.reader);
                let config = Arc::clone(&self.config);
                let pb = pb.clone();
                let ctx = ctx.clone();
                async move {
                    if let Err(e) = ctx.check() {
                        return (path, Err(e));
                    }
                    if let Some(file_name) = path.file_name() {
                        pb.set_message(format!("Parsing: {}", file_name.to_string_lossy()));
                    }
                    let task_path = path.clone();
                    let result = task::spawn_blocking(move || reader.parse(&task_path, &config))
                        .await
                        .map_err(QcError::from)
                        .and_then(|parsed| parsed);
                    pb.inc(1);
                    (path, result)
                }
            })
            .buffered(workers)
            .collect()
            .await;
        pb.finish_and_clear();

        let mut frames = Vec::new();
        let mut ingested = Vec::new();
        for (path, result) in results {
            match result {
                Ok(Some(frame)) if frame.height() > 0 => {
                    debug!("Parsed {} rows from {}", frame.height(), path.display());
                    stats.files_parsed += 1;
                    frames.push(frame);
                    ingested.push(SourceFile::from_path(&path)?);
                }
                Ok(_) => {
                    warn!("Skipped file (no data): {}", path.display());
                    self.event_log
                        .record(format!("Skipped {} (no data)", path.display()));
                    stats.files_empty += 1;
                    ingested.push(SourceFile::from_path(&path)?);
                }
                Err(e @ QcError::Cancelled { .. }) => return Err(e),
                Err(e) if e.is_configuration() => return Err(e),
                Err(e) => {
                    error!("Failed to parse {}: {}", path.display(), e);
                    self.event_log
                        .record(format!("Failed to parse {}: {}", path.display(), e));
                    stats.files_failed += 1;
                }
            }
        }
        info!(
            "Parsed {} files ({} empty, {} failed)",
            stats.files_parsed, stats.files_empty, stats.files_failed
        );

        if frames.is_empty() {
            return Ok(ParsedBatch {
                raw: None,
                ingested,
            });
        }
        let freq = self.config.freq;
        let raw =
            task::spawn_blocking(move || RegularTimeSeries::regularize_frames(&frames, freq))
                .await??;
        Ok(ParsedBatch {
            raw: Some(raw),
            ingested,
        })
    }

    /// Instrument QC, its derived-quantity pass, then manual exclusions last
    fn quality_control(&self, raw: &RegularTimeSeries) -> Result<QcOutcome> {
        let outcome = self.reader.qc(raw, &self.config)?;
        let mut outcome = self.reader.process(outcome, &self.config)?;

        let outlier_path = self.source_dir.join(&self.pipeline.outlier_file_name);
        let windows = overrides::load_outlier_windows(&outlier_path)?;
        if !windows.is_empty() {
            let excluded = overrides::apply_outlier_windows(&mut outcome, &windows)?;
            info!(
                "Manual exclusions: {} windows covering {} rows",
                windows.len(),
                excluded
            );
            self.event_log.record(format!(
                "Applied {} manual exclusions ({} rows)",
                windows.len(),
                excluded
            ));
        }
        Ok(outcome)
    }

    /// Log raw files a read-through run does not pick up
    async fn report_unseen_files(&self, ingested: &[SourceFile]) {
        let Ok(files) = self.discovery.discover().await else {
            return;
        };
        let unseen = files
            .iter()
            .filter_map(|path| SourceFile::from_path(path).ok())
            .filter(|file| !ingested.contains(file))
            .count();
        if unseen > 0 {
            info!(
                "{} raw files are not in the cache; run with --append to ingest them",
                unseen
            );
        }
    }

    async fn write_outputs(
        &self,
        data: &RegularTimeSeries,
        rates: &RatesReport,
        timeline: &[TimelineEntry],
        summary: &QcSummary,
    ) -> Result<()> {
        if self.pipeline.write_output {
            let frame = data.to_frame()?;
            retry_locked(&self.pipeline.retry, || {
                let (path, mut frame) = (self.output_path(), frame.clone());
                async move {
                    task::spawn_blocking(move || write_atomic(&path, |file| write_csv(file, &mut frame)))
                        .await?
                }
            })
            .await?;
        }

        if self.pipeline.write_report {
            let report = InstrumentReport::new(
                InstrumentInfo::from_source(&self.source_dir, &self.config.name),
                rates.clone(),
                timeline.to_vec(),
                summary.clone(),
            );
            let bytes = report.to_json()?;
            retry_locked(&self.pipeline.retry, || {
                let (path, bytes) = (self.report_path(), bytes.clone());
                async move {
                    task::spawn_blocking(move || {
                        write_atomic(&path, |file| {
                            file.write_all(&bytes)?;
                            Ok(())
                        })
                    })
                    .await?
                }
            })
            .await?;
            debug!("Wrote {}", self.report_path().display());
        }
        Ok(())
    }
}
