//! Multi-wavelength black carbon monitors (AE33, BC1054).
//!
//! QC checks, in priority order: instrument status codes, physical range,
//! statistical outliers, spikes and hourly completeness. After QC the reader
//! converts each band to an absorption coefficient and fits the absorption
//! Ångström exponent (AAE) across bands; Valid rows with an implausible AAE
//! are relabelled.

use super::rules::{
    completeness_rule, outlier_rule, qc_channels, range_rule, spike_rule, status_rule,
};
use super::{InstrumentReader, QcOutcome, read_delimited_table};
use crate::config::{AbsorptionBand, InstrumentConfig};
use crate::error::Result;
use crate::qc::QcFlagBuilder;
use crate::timeseries::RegularTimeSeries;
use polars::prelude::DataFrame;
use std::path::Path;
use tracing::info;

pub const INVALID_BC: &str = "Invalid BC";
pub const INVALID_AAE: &str = "Invalid AAE";
pub const AAE_CHANNEL: &str = "AAE";

#[derive(Debug, Clone, Copy, Default)]
pub struct AethalometerReader;

impl InstrumentReader for AethalometerReader {
    fn name(&self) -> &str {
        "Aethalometer"
    }

    fn parse(&self, path: &Path, config: &InstrumentConfig) -> Result<Option<DataFrame>> {
        read_delimited_table(path, &config.table)
    }

    fn qc(&self, raw: &RegularTimeSeries, config: &InstrumentConfig) -> Result<QcOutcome> {
        let thresholds = &config.thresholds;
        let channels = qc_channels(config, raw);
        let mut engine = QcFlagBuilder::new();

        if let Some(status) = &config.status_column {
            if !config.status_codes.is_empty() {
                engine.add_rule(status_rule(status, &config.status_codes));
            }
        }
        engine.add_rule(range_rule(
            INVALID_BC,
            &channels,
            thresholds.min_value,
            thresholds.max_value,
            "ng/m³",
        ));
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

    fn process(&self, outcome: QcOutcome, config: &InstrumentConfig) -> Result<QcOutcome> {
        let QcOutcome {
            mut data,
            mut engine,
        } = outcome;

        let bands: Vec<&AbsorptionBand> = config
            .bands
            .iter()
            .filter(|band| data.channel(&band.channel).is_some())
            .collect();
        if bands.len() < 2 {
            return Ok(QcOutcome { data, engine });
        }

        let mut absorption: Vec<(f64, Vec<f64>)> = Vec::with_capacity(bands.len());
        for band in &bands {
            let bc = data.require_channel(&band.channel, "absorption conversion")?;
            // ng/m³ × m²/g → Mm⁻¹
            let abs: Vec<f64> = bc.iter().map(|v| v * band.mac / 1000.0).collect();
            data.insert_channel(format!("abs_{}", band.wavelength_nm), abs.clone())?;
            absorption.push((band.wavelength_nm, abs));
        }

        let aae: Vec<f64> = (0..data.len())
            .map(|row| {
                let points: Vec<(f64, f64)> = absorption
                    .iter()
                    .map(|(wavelength, abs)| (*wavelength, abs[row]))
                    .collect();
                absorption_angstrom_exponent(&points)
            })
            .collect();

        if let Some((lo, hi)) = config.thresholds.aae_range {
            let mask: Vec<bool> = aae.iter().map(|v| !v.is_nan() && (*v < lo || *v > hi)).collect();
            let relabelled = engine.update_qc_flag(
                &mut data,
                &mask,
                INVALID_AAE,
                &format!("Absorption Ångström exponent outside {lo} to {hi}"),
            )?;
            info!("{} rows relabelled as '{}'", relabelled, INVALID_AAE);
        }
        data.insert_channel(AAE_CHANNEL, aae)?;

        Ok(QcOutcome { data, engine })
    }
}

/// Negative slope of the least-squares fit of `ln(abs)` against `ln(wavelength)`.
///
/// Points with a missing or non-positive absorption are skipped; fewer than
/// two usable points give NaN.
pub fn absorption_angstrom_exponent(points: &[(f64, f64)]) -> f64 {
    let logs: Vec<(f64, f64)> = points
        .iter()
        .filter(|(wavelength, abs)| *wavelength > 0.0 && *abs > 0.0)
        .map(|(wavelength, abs)| (wavelength.ln(), abs.ln()))
        .collect();
    if logs.len() < 2 {
        return f64::NAN;
    }

    let n = logs.len() as f64;
    let mean_x = logs.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = logs.iter().map(|(_, y)| y).sum::<f64>() / n;
    let sxx: f64 = logs.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
    if sxx == 0.0 {
        return f64::NAN;
    }
    let sxy: f64 = logs.iter().map(|(x, y)| (x - mean_x) * (y - mean_y)).sum();
    -sxy / sxx
}
