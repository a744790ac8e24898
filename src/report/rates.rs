//! Acquisition, yield and total rates.
//!
//! Rates count resample periods rather than rows: a period is acquired when
//! any raw value falls in it, and passes QC when it is acquired and more than
//! half of its rows are flagged Valid.

use crate::config::InstrumentConfig;
use crate::constants::{VALID, VALID_FRACTION_THRESHOLD};
use crate::error::{QcError, Result};
use crate::instruments::rules::qc_channels;
use crate::models::{RateRecord, Rates, RatesReport};
use crate::timeseries::{Frequency, RegularTimeSeries};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use std::collections::BTreeMap;
use std::ops::Range;
use tracing::debug;

/// Rates of one channel group over its own time range.
///
/// `flags` must hold one QC label per row of `raw`.
pub fn calculate_rates(raw: &RegularTimeSeries, flags: &[String], freq: Frequency) -> Result<Rates> {
    if flags.len() != raw.len() {
        return Err(QcError::MaskLength {
            expected: raw.len(),
            found: flags.len(),
        });
    }
    let Some(end) = raw.end() else {
        return Ok(Rates::default());
    };

    let first = freq.floor(raw.start());
    let period_size = freq.steps_between(first, freq.floor(end)) as usize + 1;
    let mut has_data = vec![false; period_size];
    let mut rows = vec![0usize; period_size];
    let mut valid = vec![0usize; period_size];

    for (row, ts) in raw.timestamps().enumerate() {
        let bin = freq.steps_between(first, freq.floor(ts)) as usize;
        rows[bin] += 1;
        has_data[bin] |= raw.row_has_data(row);
        if flags[row] == VALID {
            valid[bin] += 1;
        }
    }

    let sample_size = has_data.iter().filter(|h| **h).count();
    let qc_size = (0..period_size)
        .filter(|bin| {
            has_data[*bin] && valid[*bin] as f64 / rows[*bin] as f64 > VALID_FRACTION_THRESHOLD
        })
        .count();

    debug!(
        "Rates over {} periods: {} with data, {} passed QC",
        period_size, sample_size, qc_size
    );

    Ok(Rates {
        acquisition_rate: percent(sample_size, period_size),
        yield_rate: percent(qc_size, sample_size),
        total_rate: percent(qc_size, period_size),
    })
}

/// Instrument rates: the field-wise minimum over every declared rate key,
/// or the rates of the QC channels when the instrument declares none
pub fn instrument_rates(
    raw: &RegularTimeSeries,
    flags: &[String],
    config: &InstrumentConfig,
    freq: Frequency,
) -> Result<Rates> {
    if config.rate_keys.is_empty() {
        let channels = qc_channels(config, raw);
        return calculate_rates(&raw.select(&channels, "rate calculation")?, flags, freq);
    }

    let mut combined: Option<Rates> = None;
    for (label, columns) in &config.rate_keys {
        let group = raw.select(columns, &format!("rate key '{label}'"))?;
        let rates = calculate_rates(&group, flags, freq)?;
        debug!("Rate key '{}': {:?}", label, rates);
        combined = Some(combined.map_or(rates, |c| c.min(rates)));
    }
    Ok(combined.unwrap_or_default())
}

/// Weekly, monthly and optional custom-period rate records.
///
/// Weeks start on Monday and months on the first; custom periods are aligned
/// to the epoch. Each record carries the full bucket span, while rates are
/// computed over the part of the bucket covered by data.
pub fn process_rates_report(
    raw: &RegularTimeSeries,
    qc: &RegularTimeSeries,
    config: &InstrumentConfig,
    rate_freq: Frequency,
    custom: Option<Frequency>,
) -> Result<RatesReport> {
    let flags = qc.require_flags()?;
    if qc.len() != raw.len() || qc.start() != raw.start() {
        return Err(QcError::schema(
            "raw and QC snapshots do not share the same index",
        ));
    }

    let weekly = bucket_rates(raw, flags, config, rate_freq, |ts| {
        let start = week_start(ts);
        let end = start + Duration::days(7) - Duration::seconds(1);
        (start.format("%Y-%m-%d").to_string(), start, end)
    })?;
    let monthly = bucket_rates(raw, flags, config, rate_freq, |ts| {
        let start = month_start(ts);
        let end = next_month_start(start) - Duration::seconds(1);
        (start.format("%Y-%m").to_string(), start, end)
    })?;
    let custom = custom
        .map(|period| {
            bucket_rates(raw, flags, config, rate_freq, |ts| {
                let start = period.floor(ts);
                let end = start + period.duration() - Duration::seconds(1);
                (start.format("%Y-%m-%d %H:%M:%S").to_string(), start, end)
            })
        })
        .transpose()?;

    Ok(RatesReport {
        weekly,
        monthly,
        custom,
    })
}

/// Group consecutive rows by bucket key and compute rates per bucket
fn bucket_rates(
    raw: &RegularTimeSeries,
    flags: &[String],
    config: &InstrumentConfig,
    rate_freq: Frequency,
    bucket: impl Fn(NaiveDateTime) -> (String, NaiveDateTime, NaiveDateTime),
) -> Result<BTreeMap<String, RateRecord>> {
    let mut groups: Vec<(String, NaiveDateTime, NaiveDateTime, Range<usize>)> = Vec::new();
    for (row, ts) in raw.timestamps().enumerate() {
        let (key, start, end) = bucket(ts);
        match groups.last_mut() {
            Some((last, _, _, rows)) if *last == key => rows.end = row + 1,
            _ => groups.push((key, start, end, row..row + 1)),
        }
    }

    let mut records = BTreeMap::new();
    for (key, start, end, rows) in groups {
        let rates = instrument_rates(
            &raw.slice_rows(rows.clone()),
            &flags[rows],
            config,
            rate_freq,
        )?;
        records.insert(key, RateRecord::new(start, end, rates));
    }
    Ok(records)
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 1000.0).round() / 10.0
}

fn week_start(ts: NaiveDateTime) -> NaiveDateTime {
    let date = ts.date() - Duration::days(ts.weekday().num_days_from_monday() as i64);
    date.and_time(chrono::NaiveTime::MIN)
}

fn month_start(ts: NaiveDateTime) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(ts.year(), ts.month(), 1)
        .unwrap_or(ts.date())
        .and_time(chrono::NaiveTime::MIN)
}

fn next_month_start(start: NaiveDateTime) -> NaiveDateTime {
    let (year, month) = if start.month() == 12 {
        (start.year() + 1, 1)
    } else {
        (start.year(), start.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .unwrap_or(start.date())
        .and_time(chrono::NaiveTime::MIN)
}
