//! Application constants for aeroqc
//!
//! Flag labels, cache file naming, and the default values shared between the
//! configuration layer, the orchestrator and the reporter.

// =============================================================================
// QC Flag Labels
// =============================================================================

/// Name of the per-row categorical flag column
pub const QC_FLAG_COLUMN: &str = "QC_Flag";

/// Label for rows that no QC rule rejected
pub const VALID: &str = "Valid";

/// Label applied by the manual outlier override
pub const MANUAL_EXCLUSION: &str = "Manual Exclusion";

/// Description reported for the manual outlier override label
pub const MANUAL_EXCLUSION_DESCRIPTION: &str = "Time range excluded by the manual outlier list";

/// Description reported for the trailing Valid summary row
pub const VALID_DESCRIPTION: &str = "Data passed all QC checks";

// =============================================================================
// Table Layout
// =============================================================================

/// Name of the timestamp column in every DataFrame the crate produces
pub const TIME_COLUMN: &str = "time";

/// Schema inference depth for raw tables; zero reads every column as text
pub const TABLE_INFER_ROWS: usize = 0;

// =============================================================================
// Cache Layout
// =============================================================================

/// Version of the on-disk snapshot layout; bumped on incompatible changes
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// Suffix of the per-instrument output folder inside the source directory
pub const OUTPUT_FOLDER_SUFFIX: &str = "_outputs";

/// Prefix shared by every cache artefact
pub const CACHE_PREFIX: &str = "_read_";

/// Report file written next to the caches
pub const REPORT_FILE_NAME: &str = "report.json";

/// Default name of the manual outlier list inside the source directory
pub const DEFAULT_OUTLIER_FILE: &str = "outlier.json";

/// Environment variable pointing at the known-issue table
pub const KNOWN_ISSUES_ENV: &str = "AEROQC_KNOWN_ISSUES";

/// File name of the known-issue table inside the user config directory
pub const KNOWN_ISSUES_FILE: &str = "known_issues.json";

// =============================================================================
// Processing Defaults
// =============================================================================

/// Default output resample frequency
pub const DEFAULT_OUTPUT_FREQ: &str = "1h";

/// Gaps at or below this many hours are reported as brief downtime
pub const DEFAULT_MAX_GAP_HOURS: f64 = 2.0;

/// A rate bin counts as valid when more than this fraction of rows is Valid
pub const VALID_FRACTION_THRESHOLD: f64 = 0.5;

/// Default fraction of expected hourly samples required by completeness QC
pub const DEFAULT_COMPLETENESS_THRESHOLD: f64 = 0.5;

/// Default number of attempts for a locked cache save
pub const DEFAULT_SAVE_ATTEMPTS: u32 = 5;

/// Initial backoff between locked-save attempts in milliseconds
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;

/// Ceiling for the locked-save backoff in milliseconds
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;

/// Accepted timestamp layouts for raw tables, override files and CLI bounds
pub const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];

/// Date-only layouts, interpreted as midnight
pub const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d"];

/// Upper bound on rows of a regularized grid or requested window
pub const MAX_GRID_ROWS: usize = 50_000_000;
