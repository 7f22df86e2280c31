// src/bin/explain_match.rs
//
// Runs one raw address through the matching engine with the full decision
// trace and prints the decision as JSON. Looks candidates up in Postgres, or
// in a JSON gazetteer file when --gazetteer-file is given.

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uprn_match_lib::matching::candidates::{Gazetteer, SemanticIndex};
use uprn_match_lib::matching::db::PostgresGazetteer;
use uprn_match_lib::matching::memory::{InMemoryGazetteer, InMemorySemanticIndex};
use uprn_match_lib::matching::orchestrator::MatchEngine;
use uprn_match_lib::models::address::{GazetteerEntry, SourceDocument};
use uprn_match_lib::models::config::MatchingConfig;
use uprn_match_lib::utils::db_connect;

#[derive(Parser)]
#[command(author, version, about = "Explain how one address would be matched", long_about = None)]
struct ExplainArgs {
    /// Raw address text
    address: String,

    /// Legacy UPRN recorded on the document
    #[arg(long)]
    uprn: Option<String>,

    #[arg(long, requires = "northing")]
    easting: Option<f64>,

    #[arg(long, requires = "easting")]
    northing: Option<f64>,

    /// JSON array of {uprn, full_address, easting?, northing?, is_live?}
    #[arg(long)]
    gazetteer_file: Option<PathBuf>,

    /// JSON matching config; MATCH_* environment variables are used otherwise
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print only the summary explanation
    #[arg(long)]
    summary_only: bool,
}

#[derive(Debug, Deserialize)]
struct GazetteerRecord {
    uprn: String,
    full_address: String,
    easting: Option<f64>,
    northing: Option<f64>,
    #[serde(default = "default_live")]
    is_live: bool,
    usrn: Option<String>,
}

fn default_live() -> bool {
    true
}

fn load_gazetteer_file(path: &Path) -> Result<Vec<GazetteerEntry>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read gazetteer file {}", path.display()))?;
    let records: Vec<GazetteerRecord> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse gazetteer file {}", path.display()))?;

    Ok(records
        .into_iter()
        .map(|r| {
            let mut entry = GazetteerEntry::new(&r.uprn, &r.full_address);
            entry.easting = r.easting;
            entry.northing = r.northing;
            entry.is_live = r.is_live;
            entry.usrn = r.usrn;
            entry
        })
        .collect())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = ExplainArgs::parse();
    uprn_match_lib::utils::env::load_env(None)?;

    let config = match &args.config {
        Some(path) => MatchingConfig::from_json_file(path)?,
        None => MatchingConfig::from_env(),
    };
    let config = Arc::new(config);

    let (gazetteer, semantic): (Arc<dyn Gazetteer>, Option<Arc<dyn SemanticIndex>>) =
        match &args.gazetteer_file {
            Some(path) => {
                let entries = load_gazetteer_file(path)?;
                info!("Loaded {} gazetteer entries from {}", entries.len(), path.display());
                let gazetteer: Arc<dyn Gazetteer> = Arc::new(InMemoryGazetteer::new(entries.clone()));
                let semantic: Arc<dyn SemanticIndex> = Arc::new(InMemorySemanticIndex::new(entries));
                (gazetteer, Some(semantic))
            }
            None => {
                let pool = db_connect::connect()
                    .await
                    .context("Failed to connect to PostgreSQL")?;
                let gazetteer: Arc<dyn Gazetteer> = Arc::new(PostgresGazetteer::new(pool));
                (gazetteer, None)
            }
        };

    let mut doc = SourceDocument::new(0, &args.address);
    if let Some(uprn) = &args.uprn {
        doc = doc.with_uprn(uprn);
    }
    if let (Some(easting), Some(northing)) = (args.easting, args.northing) {
        doc = doc.with_coordinates(easting, northing);
    }

    let engine = MatchEngine::new(config, gazetteer, semantic);
    let decision = engine
        .match_document(&doc, !args.summary_only)
        .await
        .context("Matching failed: every attempted strategy errored")?;

    info!(
        "{} {} -> {:?} (score {:.3}, method {})",
        decision.tag.emoji(),
        decision.tag,
        decision.uprn,
        decision.score,
        decision.method
    );
    let output = serde_json::to_string_pretty(&decision).context("Failed to serialize decision")?;
    println!("{}", output);
    Ok(())
}
