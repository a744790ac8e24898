use aeroqc::filters;
use aeroqc::timeseries::{Frequency, RegularTimeSeries, parse_timestamp};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

/// One channel of minute data with a diurnal cycle and a spike every 997 rows
fn minute_series(rows: usize) -> RegularTimeSeries {
    let start = parse_timestamp("2024-01-01 00:00:00").unwrap();
    let values = (0..rows)
        .map(|i| {
            let diurnal = (i as f64 / 1440.0 * std::f64::consts::TAU).sin();
            let spike = if i % 997 == 0 { 40.0 } else { 0.0 };
            10.0 + 3.0 * diurnal + spike
        })
        .collect();
    RegularTimeSeries::new(start, Frequency::MINUTE, rows)
        .with_channel("BC6", values)
        .unwrap()
}

fn benchmark_outlier_filters(c: &mut Criterion) {
    let mut group = c.benchmark_group("outlier_filters");

    for days in [1usize, 7, 30] {
        let rows = days * 1440;
        let ts = minute_series(rows);
        group.throughput(Throughput::Elements(rows as u64));

        group.bench_with_input(BenchmarkId::new("n_sigma", days), &ts, |b, ts| {
            b.iter(|| filters::n_sigma(std::hint::black_box(ts), 3.0))
        });
        group.bench_with_input(BenchmarkId::new("iqr_log", days), &ts, |b, ts| {
            b.iter(|| filters::iqr(std::hint::black_box(ts), true))
        });
        group.bench_with_input(BenchmarkId::new("time_aware_iqr", days), &ts, |b, ts| {
            b.iter(|| filters::time_aware_iqr(std::hint::black_box(ts), Frequency::DAY, true))
        });
        group.bench_with_input(BenchmarkId::new("mad_iqr_hybrid", days), &ts, |b, ts| {
            b.iter(|| filters::mad_iqr_hybrid(std::hint::black_box(ts), 5.0, true))
        });
    }

    group.finish();
}

fn benchmark_rolling_iqr(c: &mut Criterion) {
    let mut group = c.benchmark_group("rolling_iqr");
    let ts = minute_series(7 * 1440);

    for window in [15usize, 60, 240] {
        group.bench_with_input(BenchmarkId::from_parameter(window), &window, |b, &window| {
            b.iter(|| filters::rolling_iqr(std::hint::black_box(&ts), window, false))
        });
    }

    group.finish();
}

fn benchmark_row_checks(c: &mut Criterion) {
    let ts = minute_series(30 * 1440);

    c.bench_function("spike_detection_30d", |b| {
        b.iter(|| filters::spike_detection(std::hint::black_box(&ts), 3.0))
    });
    c.bench_function("hourly_completeness_30d", |b| {
        b.iter(|| filters::hourly_completeness_mask(std::hint::black_box(&ts), 0.5))
    });
    c.bench_function("resample_hourly_30d", |b| {
        b.iter(|| std::hint::black_box(&ts).resample(Frequency::HOUR).unwrap())
    });
}

criterion_group!(
    benches,
    benchmark_outlier_filters,
    benchmark_rolling_iqr,
    benchmark_row_checks
);
criterion_main!(benches);
