use crate::{
    models::{
        config::MatchingConfig,
        stats_models::{RunScope, RunStats},
    },
    utils::db_connect::PgPool,
};
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use log::info;

/// Final state recorded on a `match_run` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn from_stats(stats: &RunStats, succeeded: bool) -> Self {
        if !succeeded {
            Self::Failed
        } else if stats.cancelled {
            Self::Cancelled
        } else {
            Self::Completed
        }
    }
}

pub async fn create_match_run(
    pool: &PgPool,
    run_id: &str,
    run_timestamp: NaiveDateTime,
    label: Option<&str>,
    config: &MatchingConfig,
    scope: &RunScope,
) -> Result<RunStats> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for create_match_run")?;

    const INSERT_SQL: &str = "
        INSERT INTO match_run (
            run_id, started_at, label, scope, config_version, config_fingerprint, config,
            status, documents_processed, auto_accepted, needs_review, no_match,
            low_confidence, errors, elapsed_secs
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, 'running', 0, 0, 0, 0, 0, 0, 0.0)
    ";

    let scope_label = scope.as_str();
    let fingerprint = config.fingerprint();
    let config_json = serde_json::to_value(config).context("Failed to serialize matching config")?;

    conn.execute(
        INSERT_SQL,
        &[
            &run_id,
            &run_timestamp,
            &label,
            &scope_label,
            &config.version,
            &fingerprint,
            &config_json,
        ],
    )
    .await
    .context("Failed to insert initial match_run record")?;

    info!("Created match_run record with ID: {} (scope {})", run_id, scope_label);

    Ok(RunStats::new(run_id))
}

pub async fn complete_match_run(
    pool: &PgPool,
    run_id: &str,
    stats: &RunStats,
    status: RunStatus,
) -> Result<()> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for complete_match_run")?;

    const UPDATE_SQL: &str = "
        UPDATE match_run SET
            finished_at = NOW(),
            status = $2,
            documents_processed = $3,
            auto_accepted = $4,
            needs_review = $5,
            no_match = $6,
            low_confidence = $7,
            errors = $8,
            elapsed_secs = $9,
            stats = $10
        WHERE run_id = $1
    ";

    let stats_json = serde_json::to_value(stats).context("Failed to serialize run stats")?;

    let updated = conn
        .execute(
            UPDATE_SQL,
            &[
                &run_id,
                &status.as_str(),
                &(stats.documents_processed as i64),
                &(stats.auto_accepted as i64),
                &(stats.needs_review as i64),
                &(stats.no_match as i64),
                &(stats.low_confidence as i64),
                &(stats.errors as i64),
                &stats.elapsed_secs,
                &stats_json,
            ],
        )
        .await
        .context("Failed to update match_run record")?;

    if updated == 0 {
        anyhow::bail!("No match_run record found for ID {}", run_id);
    }

    info!("Marked match_run {} as {}", run_id, status.as_str());
    Ok(())
}
