//! End-to-end tests for the ingestion pipeline
//!
//! Drives the built-in AE33 and nephelometer configurations through the
//! public API with realistic raw exports: QC flags, derived quantities,
//! snapshot caching, rates and the downtime timeline.

use aeroqc::models::TimelineStatus;
use aeroqc::report::InstrumentReport;
use aeroqc::timeseries::parse_timestamp;
use aeroqc::{
    CacheMode, CacheState, Frequency, InstrumentConfig, InstrumentProcessor, PipelineConfig,
    RunContext, RunParams,
};
use chrono::{Duration, NaiveDateTime};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn ts(value: &str) -> NaiveDateTime {
    parse_timestamp(value).unwrap()
}

fn pipeline(temp_dir: &TempDir) -> PipelineConfig {
    PipelineConfig::default()
        .with_parse_workers(2)
        .with_known_issues_path(temp_dir.path().join("known_issues.json"))
}

fn station(temp_dir: &TempDir) -> PathBuf {
    let dir = temp_dir.path().join("NZ_Rotorua");
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// AE33 export with absorption following a λ⁻¹ power law; `status` gives
/// the instrument status for each minute
fn write_ae33_file(dir: &Path, name: &str, start: &str, status: &[i64]) {
    let config = InstrumentConfig::ae33();
    let start = ts(start);

    let mut header = vec!["Time".to_string()];
    header.extend(
        config
            .bands
            .iter()
            .map(|band| format!("{}(ng/m3)", band.channel)),
    );
    header.push("Status".to_string());

    let mut text = header.join(",");
    text.push('\n');
    for (i, code) in status.iter().enumerate() {
        let time = start + Duration::minutes(i as i64);
        let mut row = vec![time.format("%Y/%m/%d %H:%M:%S").to_string()];
        for band in &config.bands {
            let absorption = 10.0 * 880.0 / band.wavelength_nm;
            row.push(format!("{:.3}", absorption * 1000.0 / band.mac));
        }
        row.push(code.to_string());
        text.push_str(&row.join(","));
        text.push('\n');
    }
    fs::write(dir.join(name), text).unwrap();
}

/// Nephelometer export at five-minute resolution over `[start, start + hours)`
fn write_neph_file(dir: &Path, name: &str, start: &str, hours: i64) {
    let start = ts(start);
    let mut text = String::from("time,B,G,R,BB,BG,BR\n");
    for i in 0..hours * 12 {
        let time = start + Duration::minutes(5 * i);
        text.push_str(&format!(
            "{},30.0,20.0,10.0,3.0,2.0,1.0\n",
            time.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    fs::write(dir.join(name), text).unwrap();
}

#[tokio::test]
async fn test_ae33_pipeline() {
    let temp_dir = TempDir::new().unwrap();
    let source = station(&temp_dir);
    let mut status = vec![0; 180];
    status[70] = 4;
    write_ae33_file(&source, "AE33_20240101.csv", "2024-01-01 00:00:00", &status);

    let processor = InstrumentProcessor::new(&pipeline(&temp_dir), "AE33", &source).unwrap();
    let output = processor
        .run(&RunParams::default(), &RunContext::new())
        .await
        .unwrap();

    assert_eq!(output.stats.cache_state, CacheState::NoCache);
    assert_eq!(output.stats.raw_rows, 180);

    // Only the status error is flagged; the AAE of a λ⁻¹ law is valid
    assert_eq!(output.summary.count("Status Error"), 1);
    assert_eq!(output.summary.count("Valid"), 179);
    assert_eq!(output.summary.rows.len(), 2);
    assert_eq!(output.summary.rows[0].rule, "Status Error");

    // Hourly output carries the derived absorption and AAE channels
    assert_eq!(output.data.len(), 3);
    let aae = output.data.channel("AAE").unwrap();
    assert!(aae.iter().all(|v| (v - 1.0).abs() < 1e-3));
    let abs_880 = output.data.channel("abs_880").unwrap();
    assert!((abs_880[0] - 10.0).abs() < 1e-2);

    // One BC6 bin per hour, all with a valid majority
    let week = &output.rates.weekly["2024-01-01"];
    assert_eq!(week.acquisition_rate, 100.0);
    assert_eq!(week.yield_rate, 100.0);
    assert_eq!(week.total_rate, 100.0);

    assert_eq!(output.timeline.len(), 1);
    assert_eq!(output.timeline[0].status, TimelineStatus::Operational);

    let report: InstrumentReport =
        serde_json::from_slice(&fs::read(processor.report_path()).unwrap()).unwrap();
    assert_eq!(report.instrument_info.station, "NZ");
    assert_eq!(report.qc_summary.count("Status Error"), 1);
    assert_eq!(report.rates.weekly.len(), 1);
}

#[tokio::test]
async fn test_ae33_append_and_raw_output() {
    let temp_dir = TempDir::new().unwrap();
    let source = station(&temp_dir);
    write_ae33_file(&source, "AE33_20240101.csv", "2024-01-01 00:00:00", &[0; 60]);

    let processor = InstrumentProcessor::new(&pipeline(&temp_dir), "ae33", &source).unwrap();
    processor
        .run(&RunParams::default(), &RunContext::new())
        .await
        .unwrap();

    write_ae33_file(&source, "AE33_20240102.csv", "2024-01-01 01:00:00", &[0; 60]);
    let params = RunParams::default()
        .with_mode(CacheMode::Append)
        .with_output_freq(Frequency::MINUTE)
        .with_qc(false);
    let output = processor.run(&params, &RunContext::new()).await.unwrap();

    assert_eq!(output.stats.cache_state, CacheState::Append);
    assert_eq!(output.stats.files_parsed, 1);
    assert_eq!(output.stats.raw_rows, 120);
    // Raw output has the measured channels only
    assert!(output.data.channel("AAE").is_none());
    assert_eq!(output.data.len(), 120);

    let cached = processor.cache().load().await.unwrap().unwrap();
    assert_eq!(cached.manifest.sources.len(), 2);
    assert!(cached.qc.channel("AAE").is_some());
    assert!(processor.cache().qc_csv_path().exists());
}

#[tokio::test]
async fn test_nephelometer_gap_with_known_issue() {
    let temp_dir = TempDir::new().unwrap();
    let source = station(&temp_dir);
    write_neph_file(&source, "neph_morning.csv", "2024-03-04 00:00:00", 2);
    write_neph_file(&source, "neph_later.csv", "2024-03-04 04:00:00", 2);
    fs::write(
        temp_dir.path().join("known_issues.json"),
        r#"{"NEPH": [{"start": "2024-03-04 02:30:00", "end": "2024-03-04 03:00:00", "reason": "Lamp replacement"}]}"#,
    )
    .unwrap();

    let processor = InstrumentProcessor::new(&pipeline(&temp_dir), "NEPH", &source).unwrap();
    let output = processor
        .run(&RunParams::default(), &RunContext::new())
        .await
        .unwrap();

    assert_eq!(output.stats.raw_rows, 72);
    assert_eq!(output.summary.count("Valid"), 48);
    // The empty hours fail the completeness check
    assert_eq!(output.summary.count("Insufficient Data"), 24);

    assert_eq!(output.timeline.len(), 3);
    let gap = &output.timeline[1];
    assert_eq!(gap.status, TimelineStatus::Down);
    assert_eq!(gap.start, ts("2024-03-04 02:00:00"));
    assert_eq!(gap.end, ts("2024-03-04 04:00:00"));
    assert_eq!(gap.reason.as_deref(), Some("Lamp replacement"));
    assert_eq!(gap.duration.as_deref(), Some("2 hours"));

    // Four of six hourly bins have data
    let week = &output.rates.weekly["2024-03-04"];
    assert_eq!(week.acquisition_rate, 66.7);
    assert_eq!(week.yield_rate, 100.0);
    assert_eq!(week.total_rate, 66.7);
}

#[tokio::test]
async fn test_scattering_order_violation_is_flagged() {
    let temp_dir = TempDir::new().unwrap();
    let source = station(&temp_dir);
    let mut text = String::from("time,B,G,R,BB,BG,BR\n");
    for i in 0..24 {
        let time = ts("2024-03-04 00:00:00") + Duration::minutes(5 * i);
        // Blue below green for the second hour
        let blue = if i >= 12 { 15.0 } else { 30.0 };
        text.push_str(&format!(
            "{},{blue},20.0,10.0,3.0,2.0,1.0\n",
            time.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    fs::write(source.join("neph.csv"), text).unwrap();

    let processor = InstrumentProcessor::new(&pipeline(&temp_dir), "NEPH", &source).unwrap();
    let output = processor
        .run(&RunParams::default(), &RunContext::new())
        .await
        .unwrap();

    assert_eq!(output.summary.count("Invalid Scat Rel"), 12);
    assert_eq!(output.data.len(), 2);
    assert!(output.data.channel("B").unwrap()[1].is_nan());
    assert_eq!(output.data.flags().unwrap()[1], "Invalid Scat Rel");
}
