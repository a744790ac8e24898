//! Operational/down timeline reconstruction.

use crate::models::{KnownIssue, TimelineEntry, TimelineStatus};
use crate::timeseries::RegularTimeSeries;
use chrono::{Duration, NaiveDateTime};

pub const BRIEF_DOWNTIME: &str = "Brief Downtime";
pub const DATA_GAP: &str = "Data Gap";

/// Walk the series row by row and emit one entry per run of rows that are
/// operational (any channel present) or down (every channel missing).
///
/// An interval ends at the timestamp of the row that changes status; the
/// last interval ends at the final row. Down intervals are explained by the
/// first overlapping known issue, else by their length against
/// `max_gap_hours`.
pub fn process_timeline_report(
    ts: &RegularTimeSeries,
    known_issues: &[KnownIssue],
    max_gap_hours: f64,
) -> Vec<TimelineEntry> {
    let mut timeline = Vec::new();
    let Some(last) = ts.end() else {
        return timeline;
    };

    let mut current_start = ts.start();
    let mut operational = ts.row_has_data(0);
    for row in 1..ts.len() {
        let status = ts.row_has_data(row);
        if status != operational {
            let at = ts.timestamp(row);
            timeline.push(entry(
                current_start,
                at,
                operational,
                known_issues,
                max_gap_hours,
            ));
            current_start = at;
            operational = status;
        }
    }
    timeline.push(entry(
        current_start,
        last,
        operational,
        known_issues,
        max_gap_hours,
    ));
    timeline
}

fn entry(
    start: NaiveDateTime,
    end: NaiveDateTime,
    operational: bool,
    known_issues: &[KnownIssue],
    max_gap_hours: f64,
) -> TimelineEntry {
    if operational {
        return TimelineEntry {
            start,
            end,
            status: TimelineStatus::Operational,
            reason: None,
            duration: None,
        };
    }

    let duration = end - start;
    let max_gap = Duration::milliseconds((max_gap_hours * 3_600_000.0) as i64);
    let reason = known_issues
        .iter()
        .find(|issue| issue.overlaps(start, end))
        .map(|issue| issue.reason.clone())
        .unwrap_or_else(|| {
            if duration <= max_gap {
                BRIEF_DOWNTIME.to_string()
            } else {
                DATA_GAP.to_string()
            }
        });

    TimelineEntry {
        start,
        end,
        status: TimelineStatus::Down,
        reason: Some(reason),
        duration: Some(format_duration(duration)),
    }
}

/// Human-readable length: `N minutes` under an hour, `N hours` under a day,
/// otherwise `N days` with any remaining whole hours
pub fn format_duration(duration: Duration) -> String {
    let minutes = duration.num_minutes();
    if minutes < 60 {
        return format!("{minutes} minutes");
    }
    let hours = duration.num_hours();
    if hours < 24 {
        return format!("{hours} hours");
    }
    match (hours / 24, hours % 24) {
        (days, 0) => format!("{days} days"),
        (days, rest) => format!("{days} days {rest} hours"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeseries::{Frequency, parse_timestamp};

    /// One-minute series with data everywhere except rows `gap`
    fn with_gap(len: usize, gap: std::ops::Range<usize>) -> RegularTimeSeries {
        let values = (0..len)
            .map(|row| if gap.contains(&row) { f64::NAN } else { 1.0 })
            .collect();
        RegularTimeSeries::new(parse_timestamp("2024-03-10").unwrap(), Frequency::MINUTE, len)
            .with_channel("x", values)
            .unwrap()
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::minutes(30)), "30 minutes");
        assert_eq!(format_duration(Duration::hours(5)), "5 hours");
        assert_eq!(format_duration(Duration::hours(48)), "2 days");
        assert_eq!(format_duration(Duration::hours(50)), "2 days 2 hours");
    }

    #[test]
    fn test_short_gap_is_brief_downtime() {
        let timeline = process_timeline_report(&with_gap(120, 60..90), &[], 2.0);

        assert_eq!(timeline.len(), 3);
        assert_eq!(timeline[0].status, TimelineStatus::Operational);
        assert_eq!(timeline[0].end, parse_timestamp("2024-03-10 01:00").unwrap());
        let down = &timeline[1];
        assert_eq!(down.status, TimelineStatus::Down);
        assert_eq!(down.reason.as_deref(), Some(BRIEF_DOWNTIME));
        assert_eq!(down.duration.as_deref(), Some("30 minutes"));
        assert_eq!(timeline[2].end, parse_timestamp("2024-03-10 01:59").unwrap());
    }

    #[test]
    fn test_long_gap_is_a_data_gap() {
        let timeline = process_timeline_report(&with_gap(600, 60..360), &[], 2.0);
        assert_eq!(timeline[1].reason.as_deref(), Some(DATA_GAP));
        assert_eq!(timeline[1].duration.as_deref(), Some("5 hours"));
    }

    #[test]
    fn test_known_issue_explains_gap_regardless_of_length() {
        let issue = KnownIssue {
            start: parse_timestamp("2024-03-10 00:30").unwrap(),
            end: parse_timestamp("2024-03-10 08:00").unwrap(),
            reason: "Inlet maintenance".to_string(),
        };
        let timeline = process_timeline_report(&with_gap(600, 60..360), &[issue.clone()], 2.0);
        assert_eq!(timeline[1].reason.as_deref(), Some("Inlet maintenance"));

        let brief = process_timeline_report(&with_gap(120, 60..90), &[issue], 2.0);
        assert_eq!(brief[1].reason.as_deref(), Some("Inlet maintenance"));
    }

    #[test]
    fn test_trailing_down_interval_is_closed_at_last_row() {
        let timeline = process_timeline_report(&with_gap(10, 5..10), &[], 2.0);
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[1].status, TimelineStatus::Down);
        assert_eq!(timeline[1].end, parse_timestamp("2024-03-10 00:09").unwrap());
        assert_eq!(timeline[1].duration.as_deref(), Some("4 minutes"));
    }

    #[test]
    fn test_empty_series_has_no_timeline() {
        assert!(process_timeline_report(&RegularTimeSeries::empty(Frequency::HOUR), &[], 2.0).is_empty());
    }
}
