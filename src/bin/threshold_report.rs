// src/bin/threshold_report.rs
//
// Replays stored decisions against a range of auto_accept_high values and
// reports how many would auto-accept at each one. Other tiers come from the
// current matching config.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::path::PathBuf;
use uprn_match_lib::matching::db::fetch_stored_decisions;
use uprn_match_lib::matching::threshold_sweep::{is_monotonic, sweep, threshold_range, ReplayRow};
use uprn_match_lib::models::config::MatchingConfig;
use uprn_match_lib::utils::db_connect;

#[derive(Parser)]
#[command(author, version, about = "Auto-accept counts across auto_accept_high values", long_about = None)]
struct ReportArgs {
    /// Replay one run's history instead of the current decisions
    #[arg(long)]
    run_id: Option<String>,

    #[arg(long, default_value_t = 0.80)]
    start: f64,

    #[arg(long, default_value_t = 1.0)]
    end: f64,

    #[arg(long, default_value_t = 0.01)]
    step: f64,

    /// JSON matching config; MATCH_* environment variables are used otherwise
    #[arg(long)]
    config: Option<PathBuf>,

    /// Emit the sweep as JSON instead of a table
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = ReportArgs::parse();
    uprn_match_lib::utils::env::load_env(None)?;

    let base = match &args.config {
        Some(path) => MatchingConfig::from_json_file(path)?,
        None => MatchingConfig::from_env(),
    };
    let thresholds = threshold_range(args.start, args.end, args.step)?;

    let pool = db_connect::connect()
        .await
        .context("Failed to connect to PostgreSQL")?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message("Loading stored decisions...");

    let stored = fetch_stored_decisions(&pool, args.run_id.as_deref()).await?;
    let rows: Vec<ReplayRow> = stored
        .iter()
        .filter_map(|(score, explanation)| ReplayRow::from_stored(*score, explanation))
        .collect();
    spinner.finish_with_message(format!(
        "Loaded {} decisions ({} replayable)",
        stored.len(),
        rows.len()
    ));

    let traced = rows.iter().filter(|r| r.medium_signals.is_some()).count();
    if traced < rows.len() {
        warn!(
            "{} decisions lack a debug trace; the medium auto-accept tier is not replayed for them",
            rows.len() - traced
        );
    }

    let points = sweep(&rows, &base, &thresholds);
    if !is_monotonic(&points) {
        warn!("Auto-accept counts are not monotonic across thresholds");
    }

    if args.json {
        let output = serde_json::to_string_pretty(&points).context("Failed to serialize sweep")?;
        println!("{}", output);
        return Ok(());
    }

    let current = base.tiers.auto_accept_high;
    println!("{:>8} {:>10} {:>8} {:>10} {:>8} {:>9}", "high", "auto", "rate", "review", "low", "no_match");
    for point in &points {
        let marker = if (point.auto_accept_high - current).abs() < args.step / 2.0 {
            " <- current"
        } else {
            ""
        };
        println!(
            "{:>8.3} {:>10} {:>7.1}% {:>10} {:>8} {:>9}{}",
            point.auto_accept_high,
            point.auto_accepted,
            point.auto_accept_rate(rows.len()) * 100.0,
            point.needs_review,
            point.low_confidence,
            point.no_match,
            marker
        );
    }

    info!("Threshold report complete over {} decisions", rows.len());
    Ok(())
}
