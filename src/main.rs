use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use log::{error, info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uprn_match_lib::matching::batch::{BatchOptions, BatchProcessor};
use uprn_match_lib::matching::db::{PostgresGazetteer, PostgresResultStore};
use uprn_match_lib::matching::orchestrator::MatchEngine;
use uprn_match_lib::models::config::MatchingConfig;
use uprn_match_lib::models::stats_models::RunScope;
use uprn_match_lib::utils::db_connect::{connect, get_pool_status};
use uprn_match_lib::utils::env::load_env;
use uprn_match_lib::utils::get_memory_usage;
use uprn_match_lib::utils::instantiate_run::{complete_match_run, create_match_run, RunStatus};
use uprn_match_lib::utils::progress_bars::logging::{
    log_pipeline_completion, log_pipeline_phase, log_pipeline_start,
};
use uprn_match_lib::utils::progress_bars::progress_callback::create_run_callback;
use uprn_match_lib::utils::progress_bars::progress_config::ProgressConfig;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ScopeArg {
    All,
    DocType,
    Single,
}

#[derive(Parser)]
#[command(author, version, about = "Resolve unmatched document addresses to UPRNs", long_about = None)]
struct MatchArgs {
    /// Which documents to process
    #[arg(long, value_enum, default_value_t = ScopeArg::All)]
    scope: ScopeArg,

    /// Document type for --scope doc-type
    #[arg(long)]
    doc_type: Option<String>,

    /// Document id for --scope single
    #[arg(long)]
    document_id: Option<i64>,

    /// Page size, overrides MATCH_BATCH_SIZE
    #[arg(long)]
    batch_size: Option<usize>,

    /// Concurrent documents, overrides MATCH_MAX_CONCURRENCY
    #[arg(long)]
    concurrency: Option<usize>,

    /// Store the full decision trace with every explanation
    #[arg(long)]
    debug: bool,

    /// JSON matching config; MATCH_* environment variables are used otherwise
    #[arg(long)]
    config: Option<PathBuf>,

    /// Free-text label recorded on the run
    #[arg(long)]
    label: Option<String>,

    /// Env file to load instead of .env
    #[arg(long)]
    env_file: Option<String>,
}

impl MatchArgs {
    fn run_scope(&self) -> Result<RunScope> {
        match self.scope {
            ScopeArg::All => Ok(RunScope::All),
            ScopeArg::DocType => match &self.doc_type {
                Some(doc_type) => Ok(RunScope::DocumentType(doc_type.clone())),
                None => bail!("--scope doc-type requires --doc-type"),
            },
            ScopeArg::Single => match self.document_id {
                Some(id) => Ok(RunScope::SingleDocument(id)),
                None => bail!("--scope single requires --document-id"),
            },
        }
    }

    fn batch_options(&self) -> BatchOptions {
        let mut options = BatchOptions::from_env();
        if let Some(batch_size) = self.batch_size.filter(|b| *b > 0) {
            options.batch_size = batch_size;
        }
        if let Some(concurrency) = self.concurrency.filter(|c| *c > 0) {
            options.max_concurrency = concurrency;
        }
        options.debug |= self.debug;
        options
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = MatchArgs::parse();
    load_env(args.env_file.as_deref())?;
    info!("Starting UPRN matching run");

    let scope = args.run_scope()?;
    let options = args.batch_options();
    let progress_config = ProgressConfig::from_env();

    let mut phase_times = HashMap::new();
    let setup_start = Instant::now();

    let config = match &args.config {
        Some(path) => MatchingConfig::from_json_file(path)?,
        None => {
            let config = MatchingConfig::from_env();
            config.check().context("Invalid matching configuration from environment")?;
            config
        }
    };
    config.log_config();
    let config = Arc::new(config);

    let pool = connect().await.context("Failed to connect to database")?;
    info!("Successfully connected to the database");

    let run_id = Uuid::new_v4().to_string();
    let run_timestamp = Utc::now().naive_utc();
    let initial_stats = create_match_run(
        &pool,
        &run_id,
        run_timestamp,
        args.label.as_deref(),
        &config,
        &scope,
    )
    .await
    .context("Failed to create match run")?;

    let engine = Arc::new(MatchEngine::new(
        config.clone(),
        Arc::new(PostgresGazetteer::new(pool.clone())),
        None,
    ));
    let store = Arc::new(PostgresResultStore::new(pool.clone()));

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight documents before stopping");
            signal_token.cancel();
        }
    });

    let callback = create_run_callback(&run_id, Some(pool.clone()), &progress_config);
    let processor = BatchProcessor::new(engine, store, options.clone())
        .with_cancellation(cancel)
        .with_progress(progress_config.clone(), Some(callback));

    phase_times.insert("setup", setup_start.elapsed());

    log_pipeline_start(
        &run_id,
        &scope.as_str(),
        options.max_concurrency,
        &config.strategies.enabled_names(),
    );
    log_pipeline_phase("Matching", Some(&format!("page size {}", options.batch_size)));

    let matching_start = Instant::now();
    let outcome = processor.run(&run_id, &scope).await;
    phase_times.insert("matching", matching_start.elapsed());

    let stats = match outcome {
        Ok(stats) => stats,
        Err(e) => {
            error!("Matching run {} failed: {:#}", run_id, e);
            let mut failed = initial_stats;
            failed.set_elapsed(matching_start.elapsed());
            if let Err(record_err) =
                complete_match_run(&pool, &run_id, &failed, RunStatus::Failed).await
            {
                warn!("Could not mark run {} as failed: {:#}", run_id, record_err);
            }
            return Err(e);
        }
    };

    let finalize_start = Instant::now();
    complete_match_run(&pool, &run_id, &stats, RunStatus::from_stats(&stats, true))
        .await
        .context("Failed to record run completion")?;
    phase_times.insert("finalize", finalize_start.elapsed());

    let total_time = setup_start.elapsed();
    log_pipeline_completion(&run_id, total_time, &stats);

    info!("=== Timing Breakdown ===");
    for phase in ["setup", "matching", "finalize"] {
        if let Some(duration) = phase_times.get(phase) {
            info!("{}: {:.2?}", phase, duration);
        }
    }

    if progress_config.should_show_memory() {
        let final_memory_mb = get_memory_usage().await;
        info!("Final memory usage: {} MB", final_memory_mb);
    }

    let (in_use, idle) = get_pool_status(&pool);
    info!("Final DB Connection Pool Status: In Use: {}, Idle: {}", in_use, idle);

    info!("Matching run completed");
    Ok(())
}
