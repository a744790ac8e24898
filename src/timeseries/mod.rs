//! Regular time series: a gap-filled table keyed by a fixed-step time index.
//!
//! The index is never stored. Row `i` sits at `start + i * freq`, with `start`
//! aligned to the frequency grid, so the series is strictly increasing and
//! contiguous by construction. Missing samples are rows of NaN.

mod frequency;

pub use frequency::Frequency;

use crate::constants::{
    DATE_FORMATS, MAX_GRID_ROWS, QC_FLAG_COLUMN, TIME_COLUMN, TIMESTAMP_FORMATS, VALID,
};
use crate::error::{QcError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use polars::prelude::*;
use std::collections::HashMap;
use std::ops::Range;
use tracing::debug;

/// One boolean per row, `true` meaning the row violates a check
pub type BoolMask = Vec<bool>;

/// Milliseconds since the Unix epoch
pub fn to_millis(ts: NaiveDateTime) -> i64 {
    ts.and_utc().timestamp_millis()
}

pub fn from_millis(ms: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.naive_utc())
}

/// Parse a timestamp in any of the accepted layouts
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

/// Parse with an explicit chrono format, falling back to the accepted layouts
pub fn parse_timestamp_with(value: &str, format: Option<&str>) -> Option<NaiveDateTime> {
    match format {
        Some(fmt) => NaiveDateTime::parse_from_str(value.trim(), fmt).ok(),
        None => parse_timestamp(value),
    }
}

/// Build an irregular observation frame with a `time` column and numeric channels
pub fn observations_frame(
    timestamps: &[NaiveDateTime],
    columns: Vec<(String, Vec<Option<f64>>)>,
) -> Result<DataFrame> {
    let millis: Vec<i64> = timestamps.iter().map(|ts| to_millis(*ts)).collect();
    let mut frame_columns = Vec::with_capacity(columns.len() + 1);
    frame_columns.push(
        Column::new(TIME_COLUMN.into(), millis)
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?,
    );
    for (name, values) in columns {
        frame_columns.push(Column::new(name.as_str().into(), values));
    }
    Ok(DataFrame::new(frame_columns)?)
}

/// A named measurement channel
#[derive(Debug, Clone)]
pub struct Channel {
    name: String,
    values: Vec<f64>,
}

impl Channel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }
}

/// Gap-filled table at a fixed sampling frequency
#[derive(Debug, Clone)]
pub struct RegularTimeSeries {
    start: NaiveDateTime,
    freq: Frequency,
    len: usize,
    channels: Vec<Channel>,
    flags: Option<Vec<String>>,
}

impl RegularTimeSeries {
    /// Create a series of `len` rows without channels; `start` is floored onto the grid
    pub fn new(start: NaiveDateTime, freq: Frequency, len: usize) -> Self {
        Self {
            start: freq.floor(start),
            freq,
            len,
            channels: Vec::new(),
            flags: None,
        }
    }

    pub fn empty(freq: Frequency) -> Self {
        Self::new(NaiveDateTime::default(), freq, 0)
    }

    /// Builder variant of [`insert_channel`](Self::insert_channel)
    pub fn with_channel(mut self, name: impl Into<String>, values: Vec<f64>) -> Result<Self> {
        self.insert_channel(name, values)?;
        Ok(self)
    }

    /// Add a channel, replacing any existing channel of the same name
    pub fn insert_channel(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<()> {
        if values.len() != self.len {
            return Err(QcError::MaskLength {
                expected: self.len,
                found: values.len(),
            });
        }
        let name = name.into();
        match self.channels.iter_mut().find(|c| c.name == name) {
            Some(channel) => channel.values = values,
            None => self.channels.push(Channel { name, values }),
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn freq(&self) -> Frequency {
        self.freq
    }

    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    /// Timestamp of the last row
    pub fn end(&self) -> Option<NaiveDateTime> {
        self.len.checked_sub(1).map(|last| self.timestamp(last))
    }

    pub fn timestamp(&self, row: usize) -> NaiveDateTime {
        self.start + chrono::Duration::milliseconds(self.freq.millis() * row as i64)
    }

    pub fn timestamps(&self) -> impl Iterator<Item = NaiveDateTime> + '_ {
        (0..self.len).map(|row| self.timestamp(row))
    }

    /// Row index of a grid timestamp, if it lies inside the series
    pub fn position(&self, ts: NaiveDateTime) -> Option<usize> {
        if ts < self.start || self.freq.floor(ts) != ts {
            return None;
        }
        let row = self.freq.steps_between(self.start, ts) as usize;
        (row < self.len).then_some(row)
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut Channel> {
        self.channels.iter_mut()
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn channel(&self, name: &str) -> Option<&[f64]> {
        self.channels
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.values.as_slice())
    }

    pub fn channel_mut(&mut self, name: &str) -> Option<&mut [f64]> {
        self.channels
            .iter_mut()
            .find(|c| c.name == name)
            .map(|c| c.values.as_mut_slice())
    }

    /// Look up a channel that a QC rule or rate computation cannot do without
    pub fn require_channel(&self, name: &str, context: &str) -> Result<&[f64]> {
        self.channel(name).ok_or_else(|| QcError::MissingColumn {
            column: name.to_string(),
            context: context.to_string(),
        })
    }

    /// Copy of the series restricted to the named channels, in the given order
    pub fn select(&self, names: &[String], context: &str) -> Result<Self> {
        let mut selected = Self {
            channels: Vec::with_capacity(names.len()),
            ..self.without_channels()
        };
        for name in names {
            let values = self.require_channel(name, context)?;
            selected.channels.push(Channel {
                name: name.clone(),
                values: values.to_vec(),
            });
        }
        Ok(selected)
    }

    fn without_channels(&self) -> Self {
        Self {
            start: self.start,
            freq: self.freq,
            len: self.len,
            channels: Vec::new(),
            flags: self.flags.clone(),
        }
    }

    pub fn flags(&self) -> Option<&[String]> {
        self.flags.as_deref()
    }

    pub fn flags_mut(&mut self) -> Option<&mut [String]> {
        self.flags.as_deref_mut()
    }

    /// Flag column, or a schema error if QC has not been applied
    pub fn require_flags(&self) -> Result<&[String]> {
        self.flags().ok_or_else(|| QcError::MissingColumn {
            column: QC_FLAG_COLUMN.to_string(),
            context: "QC summary".to_string(),
        })
    }

    pub fn set_flags(&mut self, flags: Vec<String>) -> Result<()> {
        if flags.len() != self.len {
            return Err(QcError::MaskLength {
                expected: self.len,
                found: flags.len(),
            });
        }
        self.flags = Some(flags);
        Ok(())
    }

    pub fn clear_flags(&mut self) {
        self.flags = None;
    }

    /// Whether any channel holds a value in this row
    pub fn row_has_data(&self, row: usize) -> bool {
        self.channels.iter().any(|c| !c.values[row].is_nan())
    }

    /// Set every channel to NaN in rows where `mask` is true
    pub fn mask_rows(&mut self, mask: &[bool]) -> Result<()> {
        if mask.len() != self.len {
            return Err(QcError::MaskLength {
                expected: self.len,
                found: mask.len(),
            });
        }
        for channel in &mut self.channels {
            for (value, hit) in channel.values.iter_mut().zip(mask) {
                if *hit {
                    *value = f64::NAN;
                }
            }
        }
        Ok(())
    }

    /// Copy with every row not flagged Valid masked to NaN
    pub fn masked_invalid(&self) -> Self {
        let mut masked = self.clone();
        if let Some(flags) = &self.flags {
            let mask: BoolMask = flags.iter().map(|f| f != VALID).collect();
            for channel in &mut masked.channels {
                for (value, hit) in channel.values.iter_mut().zip(&mask) {
                    if *hit {
                        *value = f64::NAN;
                    }
                }
            }
        }
        masked
    }

    /// Contiguous block of rows
    pub fn slice_rows(&self, rows: Range<usize>) -> Self {
        let rows = rows.start.min(self.len)..rows.end.min(self.len);
        Self {
            start: self.timestamp(rows.start),
            freq: self.freq,
            len: rows.len(),
            channels: self
                .channels
                .iter()
                .map(|c| Channel {
                    name: c.name.clone(),
                    values: c.values[rows.clone()].to_vec(),
                })
                .collect(),
            flags: self.flags.as_ref().map(|f| f[rows.clone()].to_vec()),
        }
    }

    /// Regularize parsed observation frames onto the native grid.
    ///
    /// Each observation lands in the slot `floor(ts)`; duplicates within a
    /// slot are averaged per channel. Non-numeric cells become NaN and rows
    /// with a null timestamp are dropped.
    pub fn regularize_frames(frames: &[DataFrame], freq: Frequency) -> Result<Self> {
        let mut names: Vec<String> = Vec::new();
        let mut parsed = Vec::with_capacity(frames.len());

        for frame in frames {
            let times = time_millis(frame)?;
            let mut columns = Vec::new();
            for column in frame.get_columns() {
                let name = column.name().as_str();
                if name == TIME_COLUMN || name == QC_FLAG_COLUMN {
                    continue;
                }
                let values = match numeric_values(column) {
                    Ok(values) => values,
                    Err(e) => {
                        debug!("Skipping non-numeric column '{}': {}", name, e);
                        continue;
                    }
                };
                let index = match names.iter().position(|n| n == name) {
                    Some(index) => index,
                    None => {
                        names.push(name.to_string());
                        names.len() - 1
                    }
                };
                columns.push((index, values));
            }
            parsed.push((times, columns));
        }

        let step = freq.millis();
        let slots = parsed
            .iter()
            .flat_map(|(times, _)| times.iter().flatten())
            .map(|ms| ms.div_euclid(step));
        let (first, last) = slots.fold((i64::MAX, i64::MIN), |(lo, hi), slot| {
            (lo.min(slot), hi.max(slot))
        });

        let start = if first == i64::MAX {
            None
        } else {
            from_millis(first * step)
        };
        let Some(start) = start else {
            let mut empty = Self::empty(freq);
            empty.channels = names
                .into_iter()
                .map(|name| Channel {
                    name,
                    values: Vec::new(),
                })
                .collect();
            return Ok(empty);
        };

        let len = (last - first + 1) as usize;
        if len > MAX_GRID_ROWS {
            return Err(QcError::schema(format!(
                "time axis spans {len} rows at {freq}; timestamps look corrupt"
            )));
        }

        let mut sums = vec![vec![0.0; len]; names.len()];
        let mut counts = vec![vec![0u32; len]; names.len()];
        for (times, columns) in &parsed {
            for (index, values) in columns {
                for (ms, value) in times.iter().zip(values) {
                    let Some(ms) = ms else { continue };
                    if value.is_nan() {
                        continue;
                    }
                    let slot = (ms.div_euclid(step) - first) as usize;
                    sums[*index][slot] += value;
                    counts[*index][slot] += 1;
                }
            }
        }

        let channels = names
            .into_iter()
            .zip(sums.into_iter().zip(counts))
            .map(|(name, (sum, count))| Channel {
                name,
                values: sum
                    .into_iter()
                    .zip(count)
                    .map(|(s, n)| if n == 0 { f64::NAN } else { s / n as f64 })
                    .collect(),
            })
            .collect();

        Ok(Self {
            start,
            freq,
            len,
            channels,
            flags: None,
        })
    }

    /// Load a series that was written by [`to_frame`](Self::to_frame).
    ///
    /// Unlike [`regularize_frames`](Self::regularize_frames) this insists on
    /// an index that is already contiguous at `freq`.
    pub fn from_frame(frame: &DataFrame, freq: Frequency) -> Result<Self> {
        let times = time_millis(frame)?
            .into_iter()
            .map(|ms| ms.ok_or_else(|| QcError::schema("snapshot contains a null timestamp")))
            .collect::<Result<Vec<i64>>>()?;

        let start = match times.first() {
            Some(&ms) => {
                if ms.rem_euclid(freq.millis()) != 0 {
                    return Err(QcError::schema(format!(
                        "snapshot start is not aligned to {freq}"
                    )));
                }
                from_millis(ms)
                    .ok_or_else(|| QcError::schema("snapshot start is out of range"))?
            }
            None => NaiveDateTime::default(),
        };
        if times.windows(2).any(|pair| pair[1] - pair[0] != freq.millis()) {
            return Err(QcError::schema(format!(
                "snapshot index is not contiguous at {freq}"
            )));
        }

        let mut series = Self::new(start, freq, times.len());
        for column in frame.get_columns() {
            let name = column.name().as_str();
            if name == TIME_COLUMN {
                continue;
            }
            if name == QC_FLAG_COLUMN {
                let flags = column
                    .str()?
                    .into_iter()
                    .map(|flag| {
                        flag.map(str::to_string)
                            .ok_or_else(|| QcError::schema("snapshot contains a null QC flag"))
                    })
                    .collect::<Result<Vec<String>>>()?;
                series.set_flags(flags)?;
                continue;
            }
            series.insert_channel(name, numeric_values(column)?)?;
        }
        Ok(series)
    }

    /// Convert to a DataFrame with a `time` column, one Float64 column per
    /// channel (NaN as null) and the flag column when present
    pub fn to_frame(&self) -> Result<DataFrame> {
        let millis: Vec<i64> = self.timestamps().map(to_millis).collect();
        let mut columns = Vec::with_capacity(self.channels.len() + 2);
        columns.push(
            Column::new(TIME_COLUMN.into(), millis)
                .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?,
        );
        for channel in &self.channels {
            let values: Vec<Option<f64>> = channel
                .values
                .iter()
                .map(|v| (!v.is_nan()).then_some(*v))
                .collect();
            columns.push(Column::new(channel.name.as_str().into(), values));
        }
        if let Some(flags) = &self.flags {
            columns.push(Column::new(QC_FLAG_COLUMN.into(), flags.clone()));
        }
        Ok(DataFrame::new(columns)?)
    }

    /// Slice to `[start, end]` on the grid, padding rows outside the data with
    /// NaN (and the Valid flag, when flags are present).
    ///
    /// A window wider than the grid limit is a configuration error.
    pub fn window(&self, start: Option<NaiveDateTime>, end: Option<NaiveDateTime>) -> Result<Self> {
        let first = start.map(|s| self.freq.ceil(s)).unwrap_or(self.start);
        let last = match end.map(|e| self.freq.floor(e)).or_else(|| self.end()) {
            Some(last) if last >= first => last,
            _ => {
                let mut empty = self.slice_rows(0..0);
                empty.start = first;
                return Ok(empty);
            }
        };

        let len = self.freq.steps_between(first, last) as usize + 1;
        if len > MAX_GRID_ROWS {
            return Err(QcError::configuration(format!(
                "window {first} to {last} spans {len} rows at {}; narrow --start/--end",
                self.freq
            )));
        }
        let offset = self.freq.steps_between(self.start, first);
        let source_row = |row: usize| {
            let src = offset + row as i64;
            (src >= 0 && (src as usize) < self.len).then_some(src as usize)
        };

        let channels = self
            .channels
            .iter()
            .map(|c| Channel {
                name: c.name.clone(),
                values: (0..len)
                    .map(|row| source_row(row).map_or(f64::NAN, |src| c.values[src]))
                    .collect(),
            })
            .collect();
        let flags = self.flags.as_ref().map(|flags| {
            (0..len)
                .map(|row| source_row(row).map_or_else(|| VALID.to_string(), |src| flags[src].clone()))
                .collect()
        });

        Ok(Self {
            start: first,
            freq: self.freq,
            len,
            channels,
            flags,
        })
    }

    /// Average onto a coarser grid.
    ///
    /// Only rows flagged Valid contribute to channel means when flags are
    /// present. A bin's flag is Valid when more than half its rows are Valid,
    /// otherwise the most frequent other label in the bin.
    pub fn resample(&self, out: Frequency) -> Result<Self> {
        if out < self.freq {
            return Err(QcError::configuration(format!(
                "output frequency {out} is finer than the native frequency {}",
                self.freq
            )));
        }

        let Some(end) = self.end() else {
            let mut empty = self.slice_rows(0..0);
            empty.start = out.floor(self.start);
            empty.freq = out;
            return Ok(empty);
        };

        let first = out.floor(self.start);
        let bins = out.steps_between(first, out.floor(end)) as usize + 1;
        let bin_of: Vec<usize> = self
            .timestamps()
            .map(|ts| out.steps_between(first, out.floor(ts)) as usize)
            .collect();
        let counts_row = |row: usize| {
            self.flags
                .as_ref()
                .is_none_or(|flags| flags[row] == VALID)
        };

        let channels = self
            .channels
            .iter()
            .map(|c| {
                let mut sums = vec![0.0; bins];
                let mut counts = vec![0u32; bins];
                for (row, value) in c.values.iter().enumerate() {
                    if !value.is_nan() && counts_row(row) {
                        sums[bin_of[row]] += value;
                        counts[bin_of[row]] += 1;
                    }
                }
                Channel {
                    name: c.name.clone(),
                    values: sums
                        .into_iter()
                        .zip(counts)
                        .map(|(s, n)| if n == 0 { f64::NAN } else { s / n as f64 })
                        .collect(),
                }
            })
            .collect();

        let flags = self.flags.as_ref().map(|flags| {
            let mut tallies: Vec<Vec<(&str, usize)>> = vec![Vec::new(); bins];
            for (row, flag) in flags.iter().enumerate() {
                let tally = &mut tallies[bin_of[row]];
                match tally.iter_mut().find(|(label, _)| *label == flag.as_str()) {
                    Some((_, n)) => *n += 1,
                    None => tally.push((flag.as_str(), 1)),
                }
            }
            tallies
                .into_iter()
                .map(|tally| aggregate_flag(&tally))
                .collect()
        });

        Ok(Self {
            start: first,
            freq: out,
            len: bins,
            channels,
            flags,
        })
    }

    /// Merge a newer series into this one.
    ///
    /// The result spans both ranges and is deduplicated by timestamp. A row
    /// of the newer series that carries any data replaces the older row
    /// whole, channels and flag alike; all-NaN newer rows keep the older row.
    pub fn merge_append(&self, newer: &Self) -> Result<Self> {
        if self.freq != newer.freq {
            return Err(QcError::configuration(format!(
                "cannot merge series at {} into a cache at {}",
                newer.freq, self.freq
            )));
        }
        if self.is_empty() {
            return Ok(newer.clone());
        }
        if newer.is_empty() {
            return Ok(self.clone());
        }

        let first = self.start.min(newer.start);
        let last = self.end().max(newer.end()).unwrap_or(first);
        let len = self.freq.steps_between(first, last) as usize + 1;
        let old_offset = self.freq.steps_between(first, self.start) as usize;
        let new_offset = self.freq.steps_between(first, newer.start) as usize;

        let mut names: Vec<&str> = self.channel_names();
        for name in newer.channel_names() {
            if !names.contains(&name) {
                names.push(name);
            }
        }

        // Which series each merged row is taken from
        let sources: Vec<(Option<usize>, Option<usize>)> = (0..len)
            .map(|row| {
                let in_new = row
                    .checked_sub(new_offset)
                    .filter(|r| *r < newer.len && newer.row_has_data(*r));
                let in_old = row.checked_sub(old_offset).filter(|r| *r < self.len);
                (in_new, in_old)
            })
            .collect();

        let channels = names
            .iter()
            .map(|name| {
                let (old, new) = (self.channel(name), newer.channel(name));
                Channel {
                    name: name.to_string(),
                    values: sources
                        .iter()
                        .map(|source| match *source {
                            (Some(r), _) => new.map_or(f64::NAN, |v| v[r]),
                            (None, Some(r)) => old.map_or(f64::NAN, |v| v[r]),
                            (None, None) => f64::NAN,
                        })
                        .collect(),
                }
            })
            .collect();

        let flags = match (&self.flags, &newer.flags) {
            (Some(old), Some(new)) => Some(
                sources
                    .iter()
                    .map(|source| match *source {
                        (Some(r), _) => new[r].clone(),
                        (None, Some(r)) => old[r].clone(),
                        (None, None) => VALID.to_string(),
                    })
                    .collect(),
            ),
            _ => None,
        };

        Ok(Self {
            start: first,
            freq: self.freq,
            len,
            channels,
            flags,
        })
    }

    /// Value equality treating NaN as equal to NaN and ignoring channel order
    pub fn content_eq(&self, other: &Self) -> bool {
        if self.start != other.start
            || self.freq != other.freq
            || self.len != other.len
            || self.channels.len() != other.channels.len()
            || self.flags != other.flags
        {
            return false;
        }
        self.channels.iter().all(|c| {
            other.channel(&c.name).is_some_and(|values| {
                c.values
                    .iter()
                    .zip(values)
                    .all(|(a, b)| a == b || (a.is_nan() && b.is_nan()))
            })
        })
    }
}

fn aggregate_flag(tally: &[(&str, usize)]) -> String {
    let total: usize = tally.iter().map(|(_, n)| n).sum();
    let valid = tally
        .iter()
        .find(|(label, _)| *label == VALID)
        .map_or(0, |(_, n)| *n);
    if total == 0 || valid as f64 / total as f64 > 0.5 {
        return VALID.to_string();
    }

    let mut worst: Option<(&str, usize)> = None;
    for &(label, n) in tally.iter().filter(|(label, _)| *label != VALID) {
        if worst.is_none_or(|(_, best)| n > best) {
            worst = Some((label, n));
        }
    }
    worst.map_or_else(|| VALID.to_string(), |(label, _)| label.to_string())
}

fn time_millis(frame: &DataFrame) -> Result<Vec<Option<i64>>> {
    let column = frame
        .column(TIME_COLUMN)
        .map_err(|_| QcError::MissingColumn {
            column: TIME_COLUMN.to_string(),
            context: "time axis".to_string(),
        })?;
    if !matches!(column.dtype(), DataType::Datetime(_, _)) {
        return Err(QcError::schema(format!(
            "column '{TIME_COLUMN}' has type {} instead of datetime",
            column.dtype()
        )));
    }
    let millis = column
        .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?
        .cast(&DataType::Int64)?;
    Ok(millis.i64()?.into_iter().collect())
}

fn numeric_values(column: &Column) -> Result<Vec<f64>> {
    let cast = column.cast(&DataType::Float64)?;
    Ok(cast
        .f64()?
        .into_iter()
        .map(|v| v.unwrap_or(f64::NAN))
        .collect())
}

/// Per-channel lookup used when several channels must be read row-wise
pub(crate) fn channel_map(ts: &RegularTimeSeries) -> HashMap<&str, &[f64]> {
    ts.channels()
        .iter()
        .map(|c| (c.name(), c.values()))
        .collect()
}
