//! Statistical filter library.
//!
//! Every filter works channel by channel and returns a series with the same
//! shape and index as its input, with violating cells set to NaN. NaN is
//! treated as absent everywhere. Filters whose bounds are computed from the
//! data repeat until a pass masks nothing new, so reapplying a filter to its
//! own output changes nothing.

use crate::error::Result;
use crate::timeseries::{BoolMask, Frequency, RegularTimeSeries};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Scale factor that makes the MAD a consistent estimator of the std
const MAD_SCALE: f64 = 1.4826;

/// Fence multiplier for the interquartile range
const IQR_FENCE: f64 = 1.5;

/// Instrument status codes that mark a row as bad
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusCodes {
    /// Codes tested with a bitwise AND against the status value
    #[serde(default)]
    pub bitmask: Vec<i64>,
    /// Codes that must match the status value exactly
    #[serde(default)]
    pub exact: Vec<i64>,
}

impl StatusCodes {
    pub fn bitmask(codes: impl Into<Vec<i64>>) -> Self {
        Self {
            bitmask: codes.into(),
            exact: Vec::new(),
        }
    }

    pub fn exact(codes: impl Into<Vec<i64>>) -> Self {
        Self {
            bitmask: Vec::new(),
            exact: codes.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bitmask.is_empty() && self.exact.is_empty()
    }

    pub fn matches(&self, status: i64) -> bool {
        self.bitmask.iter().any(|code| status & code != 0) || self.exact.contains(&status)
    }
}

/// Mask cells more than `std_range` sample standard deviations from the mean.
///
/// Clipping repeats on the surviving values until nothing more is masked, so
/// reapplying the filter is a no-op. Each pass shrinks the standard
/// deviation, which on heavy-tailed channels masks considerably more than a
/// single pass would; prefer the IQR family there.
pub fn n_sigma(ts: &RegularTimeSeries, std_range: f64) -> RegularTimeSeries {
    map_channels(ts, |values| {
        mask_until_stable(values, |v| match mean_std(v) {
            Some((mean, std)) if std > 0.0 => {
                v.iter().map(|x| (x - mean).abs() > std_range * std).collect()
            }
            _ => vec![false; v.len()],
        })
    })
}

/// Mask cells outside `[Q1 - 1.5 IQR, Q3 + 1.5 IQR]`, optionally in log10 space
pub fn iqr(ts: &RegularTimeSeries, log_dist: bool) -> RegularTimeSeries {
    map_channels(ts, |values| {
        mask_until_stable(values, |v| {
            let bounds = iqr_bounds(v, log_dist);
            v.iter().map(|x| violates(*x, log_dist, bounds)).collect()
        })
    })
}

/// IQR fence recomputed over a centred window of `window_size` rows
pub fn rolling_iqr(ts: &RegularTimeSeries, window_size: usize, log_dist: bool) -> RegularTimeSeries {
    let window = window_size.max(1);
    map_channels(ts, |values| {
        mask_until_stable(values, |v| {
            (0..v.len())
                .map(|row| {
                    let lo = row.saturating_sub(window / 2);
                    let hi = (row + (window - 1) / 2 + 1).min(v.len());
                    violates(v[row], log_dist, iqr_bounds(&v[lo..hi], log_dist))
                })
                .collect()
        })
    })
}

/// IQR fence recomputed per calendar bucket of `time_window`
pub fn time_aware_iqr(
    ts: &RegularTimeSeries,
    time_window: Frequency,
    log_dist: bool,
) -> RegularTimeSeries {
    let buckets = buckets(ts, time_window);
    map_channels(ts, |values| {
        mask_until_stable(values, |v| {
            let mut hits = vec![false; v.len()];
            for bucket in &buckets {
                let bounds = iqr_bounds(&v[bucket.clone()], log_dist);
                for row in bucket.clone() {
                    hits[row] = violates(v[row], log_dist, bounds);
                }
            }
            hits
        })
    })
}

/// Intersection of the IQR fence and a `median ± mad_threshold · MAD` band.
///
/// The tighter bound wins on each side. A zero MAD leaves only the IQR fence.
pub fn mad_iqr_hybrid(ts: &RegularTimeSeries, mad_threshold: f64, log_dist: bool) -> RegularTimeSeries {
    map_channels(ts, |values| {
        mask_until_stable(values, |v| {
            let bounds = match (iqr_bounds(v, log_dist), mad_bounds(v, mad_threshold, log_dist)) {
                (Some((ilo, ihi)), Some((mlo, mhi))) => Some((ilo.max(mlo), ihi.min(mhi))),
                (iqr, _) => iqr,
            };
            v.iter().map(|x| violates(*x, log_dist, bounds)).collect()
        })
    })
}

/// Rows whose status value matches a known-bad code; a NaN status reads as 0
pub fn error_status_mask(
    ts: &RegularTimeSeries,
    status_column: &str,
    codes: &StatusCodes,
) -> Result<BoolMask> {
    let status = ts.require_channel(status_column, "status filtering")?;
    Ok(status
        .iter()
        .map(|v| {
            let code = if v.is_nan() { 0 } else { *v as i64 };
            codes.matches(code)
        })
        .collect())
}

/// Mask every measurement channel in rows with a bad status code.
///
/// The status channel itself is kept so the filter can be reapplied.
pub fn filter_error_status(
    ts: &RegularTimeSeries,
    status_column: &str,
    codes: &StatusCodes,
) -> Result<RegularTimeSeries> {
    let mask = error_status_mask(ts, status_column, codes)?;
    let mut out = ts.clone();
    for channel in out.channels_mut().filter(|c| c.name() != status_column) {
        mask_cells(channel.values_mut(), &mask);
    }
    Ok(out)
}

/// Mask each channel's cells in clock hours holding fewer than
/// `threshold` of the samples expected at the series frequency
pub fn hourly_completeness(ts: &RegularTimeSeries, threshold: f64) -> RegularTimeSeries {
    let hours = buckets(ts, Frequency::HOUR);
    let min_points = ts.freq().per_hour() * threshold;
    map_channels(ts, |values| {
        for hour in &hours {
            let present = values[hour.clone()].iter().filter(|v| !v.is_nan()).count();
            if (present as f64) < min_points {
                values[hour.clone()].fill(f64::NAN);
            }
        }
    })
}

/// Rows inside an hour where any channel is below the completeness threshold
pub fn hourly_completeness_mask(ts: &RegularTimeSeries, threshold: f64) -> BoolMask {
    let hours = buckets(ts, Frequency::HOUR);
    let min_points = ts.freq().per_hour() * threshold;
    let mut mask = vec![false; ts.len()];
    for hour in &hours {
        let deficient = ts.channels().iter().any(|c| {
            let present = c.values()[hour.clone()].iter().filter(|v| !v.is_nan()).count();
            (present as f64) < min_points
        });
        if deficient {
            mask[hour.clone()].fill(true);
        }
    }
    mask
}

/// Mask values whose relative step from the previous sample exceeds `max_change_rate`
pub fn spike_detection(ts: &RegularTimeSeries, max_change_rate: f64) -> RegularTimeSeries {
    map_channels(ts, |values| {
        mask_until_stable(values, |v| {
            let mut hits = vec![false; v.len()];
            for row in 1..v.len() {
                let (prev, cur) = (v[row - 1], v[row]);
                if prev.is_nan() || cur.is_nan() || prev == 0.0 {
                    continue;
                }
                hits[row] = (cur - prev).abs() / prev.abs() > max_change_rate;
            }
            hits
        })
    })
}

/// Rows where `filtered` masked a value that was present in `original`.
///
/// Turns any filter above into a QC rule predicate.
pub fn violation_mask(original: &RegularTimeSeries, filtered: &RegularTimeSeries) -> BoolMask {
    let mut mask = vec![false; original.len()];
    for channel in original.channels() {
        let Some(after) = filtered.channel(channel.name()) else {
            continue;
        };
        for (row, (before, after)) in channel.values().iter().zip(after).enumerate() {
            if !before.is_nan() && after.is_nan() {
                mask[row] = true;
            }
        }
    }
    mask
}

fn map_channels(ts: &RegularTimeSeries, f: impl Fn(&mut [f64])) -> RegularTimeSeries {
    let mut out = ts.clone();
    for channel in out.channels_mut() {
        f(channel.values_mut());
    }
    out
}

fn mask_cells(values: &mut [f64], mask: &[bool]) {
    for (value, hit) in values.iter_mut().zip(mask) {
        if *hit {
            *value = f64::NAN;
        }
    }
}

/// Apply `pass` repeatedly until it flags no present value.
///
/// Passes only ever mask, so this terminates after at most `len + 1` passes.
fn mask_until_stable(values: &mut [f64], pass: impl Fn(&[f64]) -> Vec<bool>) {
    loop {
        let hits = pass(values);
        let mut changed = false;
        for (value, hit) in values.iter_mut().zip(hits) {
            if hit && !value.is_nan() {
                *value = f64::NAN;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

/// Contiguous row ranges sharing the same `floor(ts)` at `window`
fn buckets(ts: &RegularTimeSeries, window: Frequency) -> Vec<Range<usize>> {
    let mut ranges: Vec<Range<usize>> = Vec::new();
    let mut current = None;
    for (row, stamp) in ts.timestamps().enumerate() {
        let key = window.floor(stamp);
        if current != Some(key) {
            ranges.push(row..row + 1);
            current = Some(key);
        } else if let Some(last) = ranges.last_mut() {
            last.end = row + 1;
        }
    }
    ranges
}

fn transform(value: f64, log_dist: bool) -> f64 {
    if log_dist { value.log10() } else { value }
}

fn violates(value: f64, log_dist: bool, bounds: Option<(f64, f64)>) -> bool {
    if value.is_nan() {
        return false;
    }
    if log_dist && value <= 0.0 {
        return true;
    }
    let x = transform(value, log_dist);
    bounds.is_some_and(|(lo, hi)| x < lo || x > hi)
}

/// Present values in the working space, sorted ascending
fn sorted_present(values: &[f64], log_dist: bool) -> Vec<f64> {
    let mut present: Vec<f64> = values
        .iter()
        .filter(|v| !v.is_nan() && (!log_dist || **v > 0.0))
        .map(|v| transform(*v, log_dist))
        .collect();
    present.sort_by(f64::total_cmp);
    present
}

/// Linear-interpolated quantile of sorted data
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

fn iqr_bounds(values: &[f64], log_dist: bool) -> Option<(f64, f64)> {
    let sorted = sorted_present(values, log_dist);
    if sorted.is_empty() {
        return None;
    }
    let q1 = quantile(&sorted, 0.25);
    let q3 = quantile(&sorted, 0.75);
    let spread = q3 - q1;
    Some((q1 - IQR_FENCE * spread, q3 + IQR_FENCE * spread))
}

fn mad_bounds(values: &[f64], threshold: f64, log_dist: bool) -> Option<(f64, f64)> {
    let sorted = sorted_present(values, log_dist);
    if sorted.is_empty() {
        return None;
    }
    let median = quantile(&sorted, 0.5);
    let mut deviations: Vec<f64> = sorted.iter().map(|x| (x - median).abs()).collect();
    deviations.sort_by(f64::total_cmp);
    let mad = quantile(&deviations, 0.5) * MAD_SCALE;
    (mad > 0.0).then(|| (median - threshold * mad, median + threshold * mad))
}

fn mean_std(values: &[f64]) -> Option<(f64, f64)> {
    let present: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if present.len() < 2 {
        return None;
    }
    let n = present.len() as f64;
    let mean = present.iter().sum::<f64>() / n;
    let var = present.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some((mean, var.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeseries::parse_timestamp;

    fn series(freq: Frequency, columns: Vec<(&str, Vec<f64>)>) -> RegularTimeSeries {
        let len = columns.first().map_or(0, |(_, v)| v.len());
        let start = parse_timestamp("2024-05-01 00:00:00").unwrap();
        columns
            .into_iter()
            .fold(RegularTimeSeries::new(start, freq, len), |ts, (name, values)| {
                ts.with_channel(name, values).unwrap()
            })
    }

    fn nan_positions(values: &[f64]) -> Vec<usize> {
        values
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_nan())
            .map(|(i, _)| i)
            .collect()
    }

    fn steady_with_outlier() -> RegularTimeSeries {
        let mut values: Vec<f64> = (0..40).map(|i| 10.0 + (i % 5) as f64 * 0.1).collect();
        values[17] = 500.0;
        series(Frequency::MINUTE, vec![("a", values)])
    }

    fn all_filters(ts: &RegularTimeSeries) -> Vec<(&'static str, RegularTimeSeries)> {
        vec![
            ("n_sigma", n_sigma(ts, 3.0)),
            ("iqr", iqr(ts, false)),
            ("iqr_log", iqr(ts, true)),
            ("rolling_iqr", rolling_iqr(ts, 9, false)),
            ("time_aware_iqr", time_aware_iqr(ts, Frequency::HOUR, false)),
            ("mad_iqr_hybrid", mad_iqr_hybrid(ts, 3.0, false)),
            ("hourly_completeness", hourly_completeness(ts, 0.5)),
            ("spike_detection", spike_detection(ts, 3.0)),
        ]
    }

    #[test]
    fn test_filters_preserve_shape_and_index() {
        let ts = steady_with_outlier();
        for (name, filtered) in all_filters(&ts) {
            assert_eq!(filtered.len(), ts.len(), "{name} changed the length");
            assert_eq!(filtered.start(), ts.start(), "{name} moved the index");
            assert_eq!(filtered.channel_names(), ts.channel_names());
        }
    }

    #[test]
    fn test_filters_are_idempotent() {
        let ts = steady_with_outlier();
        for (name, once) in all_filters(&ts) {
            let twice = all_filters(&once)
                .into_iter()
                .find(|(other, _)| *other == name)
                .map(|(_, filtered)| filtered)
                .unwrap();
            assert!(once.content_eq(&twice), "{name} is not idempotent");
        }
    }

    #[test]
    fn test_filters_are_total_on_empty_and_nan_input() {
        let empty = series(Frequency::MINUTE, vec![("a", vec![])]);
        let blank = series(Frequency::MINUTE, vec![("a", vec![f64::NAN; 12])]);
        for ts in [empty, blank] {
            for (name, filtered) in all_filters(&ts) {
                assert!(filtered.content_eq(&ts), "{name} altered NaN-only input");
            }
        }
    }

    #[test]
    fn test_outlier_filters_mask_the_outlier() {
        let ts = steady_with_outlier();
        for filtered in [
            n_sigma(&ts, 3.0),
            iqr(&ts, false),
            rolling_iqr(&ts, 9, false),
            mad_iqr_hybrid(&ts, 3.0, false),
        ] {
            assert!(filtered.channel("a").unwrap()[17].is_nan());
            assert!(!filtered.channel("a").unwrap()[16].is_nan());
        }
    }

    #[test]
    fn test_n_sigma_clips_until_stable() {
        let mut values = vec![0.0; 10];
        values.extend([10.0, 1000.0]);
        let ts = series(Frequency::MINUTE, vec![("a", values)]);

        let filtered = n_sigma(&ts, 2.0);

        // 1000 hides 10 on the first pass; the second pass catches it
        assert_eq!(nan_positions(filtered.channel("a").unwrap()), vec![10, 11]);
    }

    #[test]
    fn test_iqr_log_space_masks_non_positive_values() {
        let ts = series(
            Frequency::MINUTE,
            vec![("a", vec![10.0, 12.0, 11.0, -1.0, 0.0, 13.0])],
        );
        let filtered = iqr(&ts, true);
        assert_eq!(nan_positions(filtered.channel("a").unwrap()), vec![3, 4]);
    }

    #[test]
    fn test_time_aware_iqr_uses_per_bucket_bounds() {
        // Second hour sits at a much higher level; a global fence would reject it
        let mut values = vec![1.0; 60];
        values.extend(vec![100.0; 60]);
        values[90] = 1000.0;
        let ts = series(Frequency::MINUTE, vec![("a", values)]);

        let filtered = time_aware_iqr(&ts, Frequency::HOUR, false);

        assert_eq!(nan_positions(filtered.channel("a").unwrap()), vec![90]);
    }

    #[test]
    fn test_mad_bound_is_tighter_than_iqr() {
        let values = vec![10.0, 10.1, 9.9, 10.0, 10.2, 9.8, 10.0, 11.0, 10.1, 9.9];
        let ts = series(Frequency::MINUTE, vec![("a", values)]);
        let plain = iqr(&ts, false);
        let hybrid = mad_iqr_hybrid(&ts, 2.0, false);
        let plain_masked = nan_positions(plain.channel("a").unwrap()).len();
        let hybrid_masked = nan_positions(hybrid.channel("a").unwrap()).len();
        assert!(hybrid_masked >= plain_masked);
        assert!(hybrid.channel("a").unwrap()[7].is_nan());
    }

    #[test]
    fn test_error_status_bitmask_and_exact() {
        let ts = series(
            Frequency::MINUTE,
            vec![
                ("BC", vec![1.0, 2.0, 3.0, 4.0, 5.0]),
                ("Status", vec![0.0, 4.0, 65536.0, 128.0, f64::NAN]),
            ],
        );
        let codes = StatusCodes {
            bitmask: vec![1, 2, 4, 65536],
            exact: vec![128],
        };

        let mask = error_status_mask(&ts, "Status", &codes).unwrap();
        assert_eq!(mask, vec![false, true, true, true, false]);

        let filtered = filter_error_status(&ts, "Status", &codes).unwrap();
        assert_eq!(nan_positions(filtered.channel("BC").unwrap()), vec![1, 2, 3]);
        assert_eq!(nan_positions(filtered.channel("Status").unwrap()), vec![4]);
    }

    #[test]
    fn test_error_status_requires_status_column() {
        let ts = series(Frequency::MINUTE, vec![("BC", vec![1.0])]);
        match error_status_mask(&ts, "Status", &StatusCodes::bitmask([1])) {
            Err(crate::error::QcError::MissingColumn { column, .. }) => {
                assert_eq!(column, "Status")
            }
            other => panic!("Expected MissingColumn error, got {other:?}"),
        }
    }

    #[test]
    fn test_hourly_completeness_masks_sparse_hours() {
        // 6-minute data: 10 expected per hour, 5 needed
        let mut values = vec![1.0; 20];
        for v in values.iter_mut().skip(10).take(6) {
            *v = f64::NAN;
        }
        let ts = series(Frequency::minutes(6).unwrap(), vec![("a", values)]);

        let filtered = hourly_completeness(&ts, 0.5);
        let mask = hourly_completeness_mask(&ts, 0.5);

        assert!(filtered.channel("a").unwrap()[..10].iter().all(|v| !v.is_nan()));
        assert!(filtered.channel("a").unwrap()[10..].iter().all(|v| v.is_nan()));
        assert!(mask[..10].iter().all(|m| !m));
        assert!(mask[10..].iter().all(|m| *m));
    }

    #[test]
    fn test_spike_detection_flags_relative_jumps() {
        let ts = series(
            Frequency::MINUTE,
            vec![("a", vec![10.0, 11.0, 60.0, 10.5, 10.0, f64::NAN, 80.0])],
        );
        let filtered = spike_detection(&ts, 3.0);
        assert_eq!(nan_positions(filtered.channel("a").unwrap()), vec![2, 5]);
        assert_eq!(
            violation_mask(&ts, &filtered),
            vec![false, false, true, false, false, false, false]
        );
    }
}
