// src/matching/db.rs - Postgres-backed gazetteer lookups and result persistence
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;

use crate::matching::batch::{DocumentError, ResultStore};
use crate::matching::candidates::{ComponentQuery, Gazetteer};
use crate::models::address::{GazetteerEntry, SourceDocument};
use crate::models::matching::MatchDecision;
use crate::models::stats_models::RunScope;
use crate::utils::constants::UPSERT_CHUNK_ROWS;
use crate::utils::db_connect::PgPool;

const ENTRY_COLUMNS: &str =
    "uprn, full_address, address_canonical, easting, northing, is_live, usrn";

const MATCH_PARAMS_PER_ROW: usize = 10;

fn row_to_entry(row: &Row) -> GazetteerEntry {
    GazetteerEntry {
        uprn: row.get("uprn"),
        full_address: row.get("full_address"),
        canonical_address: row.get("address_canonical"),
        easting: row.get("easting"),
        northing: row.get("northing"),
        is_live: row.get("is_live"),
        usrn: row.get("usrn"),
    }
}

fn row_to_document(row: &Row) -> SourceDocument {
    SourceDocument {
        document_id: row.get("document_id"),
        doc_type: row.get("doc_type"),
        raw_address: row.get("raw_address"),
        raw_uprn: row.get("raw_uprn"),
        easting: row.get("easting"),
        northing: row.get("northing"),
    }
}

fn as_params(params: &[Box<dyn ToSql + Sync + Send>]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

/// `dim_address` lookups. Similarity relies on the pg_trgm extension.
pub struct PostgresGazetteer {
    pool: PgPool,
}

impl PostgresGazetteer {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Gazetteer for PostgresGazetteer {
    async fn lookup_by_identifier(&self, uprn: &str) -> Result<Option<GazetteerEntry>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for lookup_by_identifier")?;

        let sql = format!("SELECT {} FROM dim_address WHERE uprn = $1", ENTRY_COLUMNS);
        let row = conn
            .query_opt(sql.as_str(), &[&uprn])
            .await
            .context("Failed to look up gazetteer entry by UPRN")?;

        Ok(row.as_ref().map(row_to_entry))
    }

    async fn lookup_by_exact_canonical_text(
        &self,
        canonical: &str,
        limit: usize,
    ) -> Result<Vec<GazetteerEntry>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for lookup_by_exact_canonical_text")?;

        let sql = format!(
            "SELECT {} FROM dim_address WHERE address_canonical = $1 ORDER BY uprn LIMIT $2",
            ENTRY_COLUMNS
        );
        let rows = conn
            .query(sql.as_str(), &[&canonical, &(limit as i64)])
            .await
            .context("Failed to look up gazetteer entries by canonical text")?;

        Ok(rows.iter().map(row_to_entry).collect())
    }

    async fn lookup_by_similarity(
        &self,
        canonical: &str,
        min_score: f64,
        limit: usize,
    ) -> Result<Vec<(GazetteerEntry, f64)>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for lookup_by_similarity")?;

        let sql = format!(
            "SELECT {}, similarity(address_canonical, $1)::float8 AS sim
             FROM dim_address
             WHERE address_canonical % $1
               AND similarity(address_canonical, $1)::float8 >= $2::float8
             ORDER BY sim DESC, uprn
             LIMIT $3",
            ENTRY_COLUMNS
        );
        let rows = conn
            .query(sql.as_str(), &[&canonical, &min_score, &(limit as i64)])
            .await
            .context("Failed to run trigram similarity lookup")?;

        Ok(rows
            .iter()
            .map(|row| (row_to_entry(row), row.get::<_, f64>("sim")))
            .collect())
    }

    async fn lookup_by_components(
        &self,
        query: &ComponentQuery,
        limit: usize,
    ) -> Result<Vec<GazetteerEntry>> {
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::new();
        let mut param_idx = 1;

        if let Some(postcode) = &query.postcode {
            conditions.push(format!("replace(postcode, ' ', '') = ${}", param_idx));
            params.push(Box::new(postcode.clone()));
            param_idx += 1;
        }
        if let Some(house_number) = &query.house_number {
            conditions.push(format!(
                "address_canonical ~ ('(^| )' || ${} || '( |$)')",
                param_idx
            ));
            params.push(Box::new(regex::escape(house_number)));
            param_idx += 1;
        }
        if let Some(street) = &query.street {
            conditions.push(format!(
                "(' ' || address_canonical || ' ') LIKE ('% ' || ${} || ' %')",
                param_idx
            ));
            params.push(Box::new(street.clone()));
            param_idx += 1;
        }
        if let Some(locality) = &query.locality {
            conditions.push(format!(
                "(' ' || address_canonical || ' ') LIKE ('% ' || ${} || ' %')",
                param_idx
            ));
            params.push(Box::new(locality.clone()));
            param_idx += 1;
        }
        params.push(Box::new(limit as i64));

        let sql = format!(
            "SELECT {} FROM dim_address WHERE {} ORDER BY uprn LIMIT ${}",
            ENTRY_COLUMNS,
            conditions.join(" AND "),
            param_idx
        );

        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for lookup_by_components")?;

        let params_slice = as_params(&params);
        let rows = conn
            .query(sql.as_str(), params_slice.as_slice())
            .await
            .context("Failed to look up gazetteer entries by components")?;

        Ok(rows.iter().map(row_to_entry).collect())
    }
}

/// Persists decisions into `address_match` (one row per document) with an
/// append-only `match_decision_history`, and reads unresolved `src_document`s.
pub struct PostgresResultStore {
    pool: PgPool,
}

impl PostgresResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Keeps the last decision per document, preserving first-seen order.
fn dedupe_last_write(decisions: &[MatchDecision]) -> Vec<&MatchDecision> {
    let mut position: HashMap<i64, usize> = HashMap::new();
    let mut unique: Vec<&MatchDecision> = Vec::new();
    for decision in decisions {
        match position.get(&decision.document_id) {
            Some(&i) => unique[i] = decision,
            None => {
                position.insert(decision.document_id, unique.len());
                unique.push(decision);
            }
        }
    }
    unique
}

fn decision_params(run_id: &str, decision: &MatchDecision) -> Vec<Box<dyn ToSql + Sync + Send>> {
    vec![
        Box::new(decision.document_id),
        Box::new(run_id.to_string()),
        Box::new(decision.uprn.clone()),
        Box::new(decision.matched_address.clone()),
        Box::new(decision.score),
        Box::new(decision.tag.as_str().to_string()),
        Box::new(decision.method.clone()),
        Box::new(decision.requires_review),
        Box::new(decision.explanation_json()),
        Box::new(decision.explanation.config_version.clone()),
    ]
}

fn values_placeholders(rows: usize, per_row: usize, suffix: &str) -> String {
    (0..rows)
        .map(|row| {
            let start = row * per_row + 1;
            let slots: Vec<String> = (start..start + per_row).map(|i| format!("${}", i)).collect();
            format!("({}{})", slots.join(", "), suffix)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn scope_filter(scope: &RunScope, params: &mut Vec<Box<dyn ToSql + Sync + Send>>) -> String {
    match scope {
        RunScope::All => String::new(),
        RunScope::DocumentType(doc_type) => {
            params.push(Box::new(doc_type.clone()));
            format!(" AND d.doc_type = ${}", params.len())
        }
        RunScope::SingleDocument(id) => {
            params.push(Box::new(*id));
            format!(" AND d.document_id = ${}", params.len())
        }
    }
}

#[async_trait]
impl ResultStore for PostgresResultStore {
    async fn upsert_match(&self, run_id: &str, decision: &MatchDecision) -> Result<()> {
        self.upsert_matches(run_id, std::slice::from_ref(decision))
            .await
            .map(|_| ())
    }

    async fn upsert_matches(&self, run_id: &str, decisions: &[MatchDecision]) -> Result<usize> {
        if decisions.is_empty() {
            return Ok(0);
        }
        let unique = dedupe_last_write(decisions);

        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for upsert_matches")?;

        let transaction = conn
            .transaction()
            .await
            .context("Failed to start transaction for decision upsert")?;

        let mut insert_count = 0;
        let mut update_count = 0;

        for chunk in unique.chunks(UPSERT_CHUNK_ROWS) {
            let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::new();
            for decision in chunk {
                params.extend(decision_params(run_id, decision));
            }
            let values_clause = values_placeholders(chunk.len(), MATCH_PARAMS_PER_ROW, ", NOW()");

            let upsert_sql = format!(
                "INSERT INTO address_match (
                    document_id, run_id, uprn, matched_address, confidence_score,
                    decision_tag, method, requires_review, explanation, config_version, matched_at
                 ) VALUES {}
                 ON CONFLICT (document_id) DO UPDATE SET
                    run_id = EXCLUDED.run_id,
                    uprn = EXCLUDED.uprn,
                    matched_address = EXCLUDED.matched_address,
                    confidence_score = EXCLUDED.confidence_score,
                    decision_tag = EXCLUDED.decision_tag,
                    method = EXCLUDED.method,
                    requires_review = EXCLUDED.requires_review,
                    explanation = EXCLUDED.explanation,
                    config_version = EXCLUDED.config_version,
                    matched_at = EXCLUDED.matched_at
                 RETURNING document_id, (xmax = 0) AS was_inserted",
                values_clause
            );
            let history_sql = format!(
                "INSERT INTO match_decision_history (
                    document_id, run_id, uprn, matched_address, confidence_score,
                    decision_tag, method, requires_review, explanation, config_version, decided_at
                 ) VALUES {}",
                values_clause
            );

            let params_slice = as_params(&params);
            debug!("Executing decision upsert with {} parameters", params_slice.len());

            let rows = transaction
                .query(upsert_sql.as_str(), params_slice.as_slice())
                .await
                .map_err(|e| {
                    error!("Decision upsert SQL error: {}", e);
                    e
                })
                .context("Failed to execute batch upsert for address_match")?;

            for row in &rows {
                if row.get::<_, bool>("was_inserted") {
                    insert_count += 1;
                } else {
                    update_count += 1;
                }
            }
            if rows.len() != chunk.len() {
                warn!(
                    "Decision upsert result count mismatch: expected {}, got {}",
                    chunk.len(),
                    rows.len()
                );
            }

            transaction
                .execute(history_sql.as_str(), params_slice.as_slice())
                .await
                .context("Failed to append match_decision_history rows")?;
        }

        transaction
            .commit()
            .await
            .context("Failed to commit decision upsert transaction")?;

        info!(
            "Decision upsert completed: {} inserts, {} updates (total: {})",
            insert_count,
            update_count,
            unique.len()
        );
        Ok(unique.len())
    }

    async fn record_errors(&self, run_id: &str, errors: &[DocumentError]) -> Result<()> {
        if errors.is_empty() {
            return Ok(());
        }
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for record_errors")?;

        for chunk in errors.chunks(UPSERT_CHUNK_ROWS) {
            let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::new();
            for err in chunk {
                params.push(Box::new(run_id.to_string()));
                params.push(Box::new(err.document_id));
                params.push(Box::new(err.message.clone()));
                params.push(Box::new(err.timed_out));
            }
            let sql = format!(
                "INSERT INTO match_error (run_id, document_id, message, timed_out, created_at) VALUES {}",
                values_placeholders(chunk.len(), 4, ", NOW()")
            );
            let params_slice = as_params(&params);
            conn.execute(sql.as_str(), params_slice.as_slice())
                .await
                .context("Failed to insert match_error rows")?;
        }

        debug!("Recorded {} document errors for run {}", errors.len(), run_id);
        Ok(())
    }

    async fn fetch_unresolved_documents(
        &self,
        scope: &RunScope,
        page_size: usize,
        offset: usize,
    ) -> Result<Vec<SourceDocument>> {
        let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::new();
        let filter = scope_filter(scope, &mut params);
        params.push(Box::new(page_size as i64));
        let limit_idx = params.len();
        params.push(Box::new(offset as i64));
        let offset_idx = params.len();

        let sql = format!(
            "SELECT d.document_id, d.doc_type, d.raw_address, d.raw_uprn, d.easting, d.northing
             FROM src_document d
             LEFT JOIN address_match m ON m.document_id = d.document_id
             WHERE m.document_id IS NULL{}
             ORDER BY d.document_id
             LIMIT ${} OFFSET ${}",
            filter, limit_idx, offset_idx
        );

        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for fetch_unresolved_documents")?;

        let params_slice = as_params(&params);
        let rows = conn
            .query(sql.as_str(), params_slice.as_slice())
            .await
            .context("Failed to fetch unresolved documents")?;

        Ok(rows.iter().map(row_to_document).collect())
    }
}

/// Stored (score, explanation) pairs for replaying decisions, optionally for one run.
pub async fn fetch_stored_decisions(
    pool: &PgPool,
    run_id: Option<&str>,
) -> Result<Vec<(f64, serde_json::Value)>> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for fetch_stored_decisions")?;

    let rows = match run_id {
        Some(run_id) => conn
            .query(
                "SELECT confidence_score, explanation FROM match_decision_history
                 WHERE run_id = $1 ORDER BY document_id",
                &[&run_id],
            )
            .await
            .context("Failed to fetch decision history for run")?,
        None => conn
            .query(
                "SELECT confidence_score, explanation FROM address_match ORDER BY document_id",
                &[],
            )
            .await
            .context("Failed to fetch current decisions")?,
    };

    Ok(rows
        .iter()
        .map(|row| (row.get("confidence_score"), row.get("explanation")))
        .collect())
}
