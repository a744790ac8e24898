//! Rule builders shared by the instrument readers.
//!
//! Every builder captures its parameters by value so the resulting predicate
//! is a pure function of the table it is evaluated on.

use crate::config::{InstrumentConfig, OutlierMethod};
use crate::filters::{self, StatusCodes};
use crate::qc::QcRule;
use crate::timeseries::RegularTimeSeries;

pub const STATUS_ERROR: &str = "Status Error";
pub const OUTLIER: &str = "Outlier";
pub const SPIKE: &str = "Spike";
pub const INSUFFICIENT_DATA: &str = "Insufficient Data";

/// Channels the QC rules look at: the configured ones, or every channel
/// except the status column
pub fn qc_channels(config: &InstrumentConfig, ts: &RegularTimeSeries) -> Vec<String> {
    if !config.channels.is_empty() {
        return config.channels.clone();
    }
    ts.channel_names()
        .into_iter()
        .filter(|name| Some(*name) != config.status_column.as_deref())
        .map(str::to_string)
        .collect()
}

/// Rows whose status value matches a known-bad code
pub fn status_rule(status_column: &str, codes: &StatusCodes) -> QcRule {
    let column = status_column.to_string();
    let codes = codes.clone();
    QcRule::new(
        STATUS_ERROR,
        format!("Instrument reported an error code in '{column}'"),
        move |ts| filters::error_status_mask(ts, &column, &codes),
    )
}

/// Rows where any channel holds a value outside `[min, max]`
pub fn range_rule(name: &str, channels: &[String], min: f64, max: f64, unit: &str) -> QcRule {
    let channels = channels.to_vec();
    QcRule::new(
        name,
        format!("Value outside the valid range {min} to {max} {unit}")
            .trim_end()
            .to_string(),
        move |ts| {
            let sub = ts.select(&channels, "range check")?;
            Ok((0..sub.len())
                .map(|row| {
                    sub.channels().iter().any(|c| {
                        let v = c.values()[row];
                        !v.is_nan() && (v < min || v > max)
                    })
                })
                .collect())
        },
    )
}

/// Rows the configured statistical filter would mask, or `None` when
/// outlier checking is disabled
pub fn outlier_rule(method: &OutlierMethod, channels: &[String]) -> Option<QcRule> {
    let description = match method {
        OutlierMethod::None => return None,
        OutlierMethod::NSigma { std_range } => {
            format!("Beyond {std_range} standard deviations of the mean")
        }
        OutlierMethod::Iqr { .. } => "Outside the interquartile range fence".to_string(),
        OutlierMethod::RollingIqr { window, .. } => {
            format!("Outside the interquartile range fence of a {window}-row window")
        }
        OutlierMethod::TimeAwareIqr { window, .. } => {
            format!("Outside the interquartile range fence of its {window} window")
        }
        OutlierMethod::MadIqrHybrid { mad_threshold, .. } => {
            format!("Outside the IQR fence or {mad_threshold} scaled MADs of the median")
        }
    };
    let method = method.clone();
    let channels = channels.to_vec();
    Some(QcRule::new(OUTLIER, description, move |ts| {
        let sub = ts.select(&channels, "outlier detection")?;
        let filtered = match &method {
            OutlierMethod::None => sub.clone(),
            OutlierMethod::NSigma { std_range } => filters::n_sigma(&sub, *std_range),
            OutlierMethod::Iqr { log_dist } => filters::iqr(&sub, *log_dist),
            OutlierMethod::RollingIqr { window, log_dist } => {
                filters::rolling_iqr(&sub, *window, *log_dist)
            }
            OutlierMethod::TimeAwareIqr { window, log_dist } => {
                filters::time_aware_iqr(&sub, *window, *log_dist)
            }
            OutlierMethod::MadIqrHybrid {
                mad_threshold,
                log_dist,
            } => filters::mad_iqr_hybrid(&sub, *mad_threshold, *log_dist),
        };
        Ok(filters::violation_mask(&sub, &filtered))
    }))
}

/// Rows where any channel jumps by more than `max_change_rate` relative to the previous sample
pub fn spike_rule(channels: &[String], max_change_rate: f64) -> QcRule {
    let channels = channels.to_vec();
    QcRule::new(
        SPIKE,
        format!("Relative change above {max_change_rate} between consecutive samples"),
        move |ts| {
            let sub = ts.select(&channels, "spike detection")?;
            Ok(filters::violation_mask(
                &sub,
                &filters::spike_detection(&sub, max_change_rate),
            ))
        },
    )
}

/// Rows in clock hours with too few samples on any channel
pub fn completeness_rule(channels: &[String], threshold: f64) -> QcRule {
    let channels = channels.to_vec();
    QcRule::new(
        INSUFFICIENT_DATA,
        format!(
            "Fewer than {:.0}% of the expected samples in the hour",
            threshold * 100.0
        ),
        move |ts| {
            let sub = ts.select(&channels, "completeness check")?;
            Ok(filters::hourly_completeness_mask(&sub, threshold))
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeseries::{Frequency, parse_timestamp};

    fn series(values: Vec<f64>) -> RegularTimeSeries {
        let len = values.len();
        RegularTimeSeries::new(
            parse_timestamp("2024-03-01").unwrap(),
            Frequency::MINUTE,
            len,
        )
        .with_channel("a", values)
        .unwrap()
    }

    #[test]
    fn test_range_rule_ignores_missing_values() {
        let rule = range_rule("Invalid", &["a".to_string()], 0.0, 10.0, "");
        let mask = rule.evaluate(&series(vec![-1.0, 5.0, f64::NAN, 11.0])).unwrap();
        assert_eq!(mask, vec![true, false, false, true]);
        assert_eq!(rule.description(), "Value outside the valid range 0 to 10");
    }

    #[test]
    fn test_outlier_rule_disabled() {
        assert!(outlier_rule(&OutlierMethod::None, &["a".to_string()]).is_none());
    }

    #[test]
    fn test_spike_rule_flags_jump() {
        let rule = spike_rule(&["a".to_string()], 3.0);
        let mask = rule
            .evaluate(&series(vec![10.0, 11.0, 100.0, 12.0]))
            .unwrap();
        assert!(mask[2]);
        assert!(!mask[0] && !mask[1]);
    }

    #[test]
    fn test_qc_channels_skip_status() {
        let config = InstrumentConfig::new("X", Frequency::MINUTE)
            .with_status("Status", StatusCodes::exact([1]));
        let ts = series(vec![1.0]).with_channel("Status", vec![0.0]).unwrap();
        assert_eq!(qc_channels(&config, &ts), vec!["a".to_string()]);
    }
}
