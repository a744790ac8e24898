//! Command implementations for the CLI
//!
//! Sets up logging, builds the pipeline configuration from the arguments,
//! runs the orchestrator and prints a summary.

use crate::cli::args::{Args, Commands, InstrumentsArgs, OutputFormat, RunArgs};
use crate::config::PipelineConfig;
use crate::instruments;
use crate::models::{QcSummary, RatesReport, TimelineStatus};
use crate::processor::context::RunContext;
use crate::processor::{InstrumentProcessor, RunOutput};
use anyhow::{Context, Result};
use colored::*;
use indicatif::HumanDuration;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Main command runner
///
/// Dispatches the subcommand; the token cancels an in-flight run between
/// files and before any cache write.
pub async fn run(args: Args, token: CancellationToken) -> Result<()> {
    match args.command {
        Some(Commands::Run(run_args)) => run_instrument(run_args, token).await,
        Some(Commands::Instruments(list_args)) => list_instruments(&list_args),
        None => Ok(()),
    }
}

async fn run_instrument(args: RunArgs, token: CancellationToken) -> Result<()> {
    setup_logging(args.get_log_level());
    debug!("Command line arguments: {:?}", args);

    args.validate()?;
    let pipeline = args.pipeline_config()?;
    let params = args.run_params()?;

    let processor = InstrumentProcessor::new(&pipeline, &args.instrument, &args.source_dir)
        .with_context(|| {
            format!(
                "Cannot process {} in {}",
                args.instrument,
                args.source_dir.display()
            )
        })?;

    let mut ctx = RunContext::new()
        .with_token(token)
        .with_progress(args.show_progress());
    if let Some(timeout) = args.timeout() {
        ctx = ctx.with_timeout(timeout);
    }

    info!("Starting {} run", processor.config().name);
    let output = processor.run(&params, &ctx).await?;

    match args.format {
        OutputFormat::Human => print_human_summary(&processor, &output),
        OutputFormat::Json => print_json_summary(&processor, &output)?,
    }
    Ok(())
}

/// Set up structured logging on stderr
fn setup_logging(log_level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("aeroqc={}", log_level)));

    // A second init in the same process (tests) is not an error worth reporting
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_timer(fmt::time::uptime())
                .with_writer(std::io::stderr),
        )
        .try_init();
}

fn print_human_summary(processor: &InstrumentProcessor, output: &RunOutput) {
    let stats = &output.stats;
    let duration = HumanDuration(Duration::from_millis(stats.processing_time_ms as u64));

    println!();
    println!(
        "{} {}",
        processor.config().name.bright_cyan().bold(),
        "processing complete".bright_green().bold()
    );
    println!("  Cache: {}", stats.cache_state.to_string().bright_white());
    println!(
        "  Files: {} discovered, {} parsed, {} empty, {}",
        stats.files_discovered,
        stats.files_parsed,
        stats.files_empty,
        failed_label(stats.files_failed)
    );
    println!(
        "  Rows: {} raw, {} output",
        stats.raw_rows, stats.output_rows
    );
    println!("  Time: {}", duration);

    print_qc_summary(&output.summary);
    print_rates(&output.rates);

    let down = output
        .timeline
        .iter()
        .filter(|entry| entry.status == TimelineStatus::Down)
        .count();
    if down > 0 {
        println!("  Downtime intervals: {}", down.to_string().bright_yellow());
    }
    println!("  Outputs: {}", processor.output_dir().display());
    println!();
}

fn failed_label(failed: usize) -> ColoredString {
    let label = format!("{} failed", failed);
    if failed > 0 {
        label.bright_red()
    } else {
        label.normal()
    }
}

fn print_qc_summary(summary: &QcSummary) {
    println!("\n{}", "QC summary:".bright_green().bold());
    for row in &summary.rows {
        println!(
            "  {:<24} {:>8} {:>6.1}%",
            row.rule, row.count, row.percentage
        );
    }
}

fn print_rates(rates: &RatesReport) {
    if rates.monthly.is_empty() {
        return;
    }
    println!("\n{}", "Monthly rates (acquisition / yield / total):".bright_green().bold());
    for (month, record) in &rates.monthly {
        println!(
            "  {}  {:>5.1}% / {:>5.1}% / {:>5.1}%",
            month.bright_cyan(),
            record.acquisition_rate,
            record.yield_rate,
            record.total_rate
        );
    }
}

fn print_json_summary(processor: &InstrumentProcessor, output: &RunOutput) -> Result<()> {
    let summary = serde_json::json!({
        "instrument": processor.config().name,
        "output_dir": processor.output_dir(),
        "stats": output.stats,
        "qc_summary": output.summary,
        "rates": output.rates,
        "timeline": output.timeline,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn list_instruments(args: &InstrumentsArgs) -> Result<()> {
    let pipeline = match &args.config_path {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    if args.detailed {
        println!("{}", serde_json::to_string_pretty(&pipeline.instruments)?);
        return Ok(());
    }

    println!("{}", "Configured instruments:".bright_green().bold());
    for (name, config) in &pipeline.instruments {
        let reader = if instruments::lookup(config.reader_name()).is_some() {
            config.reader_name().normal()
        } else {
            format!("{} (no reader)", config.reader_name()).bright_red()
        };
        println!(
            "  {:<10} {:<8} reader {}  files {}",
            name.bright_cyan(),
            config.freq.to_string(),
            reader,
            config.file_patterns.join(", ").bright_black()
        );
    }
    Ok(())
}
