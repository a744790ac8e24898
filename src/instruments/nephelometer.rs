//! Three-wavelength integrating nephelometer.
//!
//! Besides the shared range, outlier, spike and completeness checks, rows
//! where scattering does not decrease with wavelength (blue ≥ green ≥ red)
//! are rejected.

use super::rules::{completeness_rule, outlier_rule, qc_channels, range_rule, spike_rule};
use super::{InstrumentReader, QcOutcome, read_delimited_table};
use crate::config::InstrumentConfig;
use crate::error::Result;
use crate::qc::{QcFlagBuilder, QcRule};
use crate::timeseries::RegularTimeSeries;
use polars::prelude::DataFrame;
use std::path::Path;

pub const INVALID_SCAT_VALUE: &str = "Invalid Scat Value";
pub const INVALID_SCAT_REL: &str = "Invalid Scat Rel";

/// Total scattering channels ordered by increasing wavelength
const SCATTERING_ORDER: [&str; 3] = ["B", "G", "R"];

#[derive(Debug, Clone, Copy, Default)]
pub struct NephelometerReader;

impl InstrumentReader for NephelometerReader {
    fn name(&self) -> &str {
        "Nephelometer"
    }

    fn parse(&self, path: &Path, config: &InstrumentConfig) -> Result<Option<DataFrame>> {
        read_delimited_table(path, &config.table)
    }

    fn qc(&self, raw: &RegularTimeSeries, config: &InstrumentConfig) -> Result<QcOutcome> {
        let thresholds = &config.thresholds;
        let channels = qc_channels(config, raw);
        let mut engine = QcFlagBuilder::new();

        engine
            .add_rule(range_rule(
                INVALID_SCAT_VALUE,
                &channels,
                thresholds.min_value,
                thresholds.max_value,
                "Mm⁻¹",
            ))
            .add_rule(wavelength_order_rule());
        if let Some(rule) = outlier_rule(&thresholds.outlier, &channels) {
            engine.add_rule(rule);
        }
        engine
            .add_rule(spike_rule(&channels, thresholds.max_change_rate))
            .add_rule(completeness_rule(
                &channels,
                thresholds.completeness_threshold,
            ));

        let data = engine.apply(raw)?;
        Ok(QcOutcome { data, engine })
    }
}

fn wavelength_order_rule() -> QcRule {
    QcRule::new(
        INVALID_SCAT_REL,
        "Scattering does not decrease from blue to green to red",
        |ts| {
            let order: Vec<String> = SCATTERING_ORDER.iter().map(|c| c.to_string()).collect();
            let sub = ts.select(&order, "wavelength ordering")?;
            let (b, g, r) = (
                sub.channels()[0].values(),
                sub.channels()[1].values(),
                sub.channels()[2].values(),
            );
            // NaN comparisons are false, so rows with a missing band pass
            Ok((0..sub.len())
                .map(|row| b[row] < g[row] || g[row] < r[row])
                .collect())
        },
    )
}
