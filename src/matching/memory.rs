// src/matching/memory.rs - In-process gazetteer, semantic index and result store
//
// Used by the explain tool for ad-hoc gazetteers and by the orchestrator and
// batch tests, which run without a database.
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use crate::matching::batch::{DocumentError, ResultStore};
use crate::matching::candidates::{ComponentQuery, Gazetteer, SemanticIndex};
use crate::matching::features::{token_cosine, trigram_similarity};
use crate::models::address::{GazetteerEntry, SourceDocument};
use crate::models::matching::MatchDecision;
use crate::models::stats_models::RunScope;
use crate::normalize::address::{extract_house_numbers, extract_locality_tokens, normalize_address};

fn sort_scored(hits: &mut Vec<(GazetteerEntry, f64)>) {
    hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.uprn.cmp(&b.0.uprn)));
}

pub struct InMemoryGazetteer {
    entries: Vec<GazetteerEntry>,
    by_uprn: HashMap<String, usize>,
}

impl InMemoryGazetteer {
    pub fn new(entries: Vec<GazetteerEntry>) -> Self {
        let by_uprn = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.uprn.clone(), i))
            .collect();
        Self { entries, by_uprn }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn matches_components(entry: &GazetteerEntry, query: &ComponentQuery) -> bool {
        if let Some(postcode) = &query.postcode {
            if normalize_address(&entry.full_address).postcode.as_deref() != Some(postcode.as_str()) {
                return false;
            }
        }
        if let Some(house) = &query.house_number {
            if !extract_house_numbers(&entry.full_address).contains(house) {
                return false;
            }
        }
        if let Some(street) = &query.street {
            let padded = format!(" {} ", entry.canonical_address);
            if !padded.contains(&format!(" {} ", street)) {
                return false;
            }
        }
        if let Some(locality) = &query.locality {
            if !extract_locality_tokens(&entry.full_address).contains(locality) {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl Gazetteer for InMemoryGazetteer {
    async fn lookup_by_identifier(&self, uprn: &str) -> Result<Option<GazetteerEntry>> {
        Ok(self.by_uprn.get(uprn).map(|&i| self.entries[i].clone()))
    }

    async fn lookup_by_exact_canonical_text(
        &self,
        canonical: &str,
        limit: usize,
    ) -> Result<Vec<GazetteerEntry>> {
        let mut hits: Vec<GazetteerEntry> = self
            .entries
            .iter()
            .filter(|e| e.canonical_address == canonical)
            .cloned()
            .collect();
        hits.sort_by(|a, b| a.uprn.cmp(&b.uprn));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn lookup_by_similarity(
        &self,
        canonical: &str,
        min_score: f64,
        limit: usize,
    ) -> Result<Vec<(GazetteerEntry, f64)>> {
        let mut hits: Vec<(GazetteerEntry, f64)> = self
            .entries
            .iter()
            .map(|e| (e, trigram_similarity(canonical, &e.canonical_address)))
            .filter(|(_, sim)| *sim >= min_score)
            .map(|(e, sim)| (e.clone(), sim))
            .collect();
        sort_scored(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    async fn lookup_by_components(
        &self,
        query: &ComponentQuery,
        limit: usize,
    ) -> Result<Vec<GazetteerEntry>> {
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let mut hits: Vec<GazetteerEntry> = self
            .entries
            .iter()
            .filter(|e| Self::matches_components(e, query))
            .cloned()
            .collect();
        hits.sort_by(|a, b| a.uprn.cmp(&b.uprn));
        hits.truncate(limit);
        Ok(hits)
    }
}

/// Token-cosine nearest neighbours. Stands in for a vector index.
pub struct InMemorySemanticIndex {
    entries: Vec<(GazetteerEntry, Vec<String>)>,
}

impl InMemorySemanticIndex {
    pub fn new(entries: Vec<GazetteerEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|e| {
                    let tokens = normalize_address(&e.full_address).tokens;
                    (e, tokens)
                })
                .collect(),
        }
    }
}

#[async_trait]
impl SemanticIndex for InMemorySemanticIndex {
    async fn nearest(&self, text: &str, limit: usize) -> Result<Vec<(GazetteerEntry, f64)>> {
        let query = normalize_address(text).tokens;
        let mut hits: Vec<(GazetteerEntry, f64)> = self
            .entries
            .iter()
            .map(|(e, tokens)| (e.clone(), token_cosine(&query, tokens)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        sort_scored(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }
}

/// Decisions keyed by document id, plus the append-only history and error log.
#[derive(Default)]
struct StoreState {
    documents: Vec<SourceDocument>,
    decisions: HashMap<i64, (String, MatchDecision)>,
    history: Vec<(String, MatchDecision)>,
    errors: Vec<(String, DocumentError)>,
}

#[derive(Default)]
pub struct InMemoryResultStore {
    state: RwLock<StoreState>,
    fail_writes: AtomicBool,
}

impl InMemoryResultStore {
    pub fn new(documents: Vec<SourceDocument>) -> Self {
        Self {
            state: RwLock::new(StoreState {
                documents,
                ..Default::default()
            }),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent write fail, simulating a database outage.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn decision(&self, document_id: i64) -> Option<MatchDecision> {
        self.state
            .read()
            .await
            .decisions
            .get(&document_id)
            .map(|(_, d)| d.clone())
    }

    pub async fn decision_count(&self) -> usize {
        self.state.read().await.decisions.len()
    }

    pub async fn history_len(&self) -> usize {
        self.state.read().await.history.len()
    }

    pub async fn errors(&self) -> Vec<DocumentError> {
        self.state
            .read()
            .await
            .errors
            .iter()
            .map(|(_, e)| e.clone())
            .collect()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(anyhow!("result store unavailable"))
        } else {
            Ok(())
        }
    }
}

fn in_scope(doc: &SourceDocument, scope: &RunScope) -> bool {
    match scope {
        RunScope::All => true,
        RunScope::DocumentType(t) => doc.doc_type.as_deref() == Some(t.as_str()),
        RunScope::SingleDocument(id) => doc.document_id == *id,
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn upsert_match(&self, run_id: &str, decision: &MatchDecision) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        state
            .decisions
            .insert(decision.document_id, (run_id.to_string(), decision.clone()));
        state.history.push((run_id.to_string(), decision.clone()));
        Ok(())
    }

    async fn record_errors(&self, run_id: &str, errors: &[DocumentError]) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        state
            .errors
            .extend(errors.iter().map(|e| (run_id.to_string(), e.clone())));
        Ok(())
    }

    async fn fetch_unresolved_documents(
        &self,
        scope: &RunScope,
        page_size: usize,
        offset: usize,
    ) -> Result<Vec<SourceDocument>> {
        let state = self.state.read().await;
        let mut unresolved: Vec<&SourceDocument> = state
            .documents
            .iter()
            .filter(|d| in_scope(d, scope) && !state.decisions.contains_key(&d.document_id))
            .collect();
        unresolved.sort_by_key(|d| d.document_id);
        Ok(unresolved
            .into_iter()
            .skip(offset)
            .take(page_size)
            .cloned()
            .collect())
    }
}

/// Gazetteer whose every lookup fails.
#[cfg(test)]
pub struct FailingGazetteer;

#[cfg(test)]
#[async_trait]
impl Gazetteer for FailingGazetteer {
    async fn lookup_by_identifier(&self, _uprn: &str) -> Result<Option<GazetteerEntry>> {
        Err(anyhow!("connection refused"))
    }

    async fn lookup_by_exact_canonical_text(&self, _c: &str, _l: usize) -> Result<Vec<GazetteerEntry>> {
        Err(anyhow!("connection refused"))
    }

    async fn lookup_by_similarity(
        &self,
        _c: &str,
        _m: f64,
        _l: usize,
    ) -> Result<Vec<(GazetteerEntry, f64)>> {
        Err(anyhow!("connection refused"))
    }

    async fn lookup_by_components(&self, _q: &ComponentQuery, _l: usize) -> Result<Vec<GazetteerEntry>> {
        Err(anyhow!("connection refused"))
    }
}
