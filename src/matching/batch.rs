// src/matching/batch.rs - Paged, bounded-concurrency matching over unresolved documents
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use log::warn;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::matching::orchestrator::MatchEngine;
use crate::models::address::SourceDocument;
use crate::models::matching::MatchDecision;
use crate::models::stats_models::{RunScope, RunStats};
use crate::update_progress;
use crate::utils::constants::DEFAULT_BATCH_SIZE;
use crate::utils::get_memory_usage;
use crate::utils::progress_bars::logging::{LogStage, MatchingLogger};
use crate::utils::progress_bars::progress_callback::ProgressCallback;
use crate::utils::progress_bars::progress_config::ProgressConfig;

/// A document that could not be decided in this run. It stays unresolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentError {
    pub document_id: i64,
    pub message: String,
    pub timed_out: bool,
}

/// Context attached to a failed page write: decisions stored before the
/// failure. Stores that write a page atomically never attach it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialWrite {
    pub written: usize,
}

impl fmt::Display for PartialWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} decisions written before the failure", self.written)
    }
}

/// Decisions a failed `upsert_matches` still managed to store.
pub fn written_before_failure(error: &anyhow::Error) -> usize {
    error.downcast_ref::<PartialWrite>().map_or(0, |p| p.written)
}

/// Where decisions go and unresolved documents come from.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Last write wins on `document_id`.
    async fn upsert_match(&self, run_id: &str, decision: &MatchDecision) -> Result<()>;

    /// Writes in order and stops at the first failure, which carries a
    /// [`PartialWrite`] count.
    async fn upsert_matches(&self, run_id: &str, decisions: &[MatchDecision]) -> Result<usize> {
        let mut written = 0;
        for decision in decisions {
            if let Err(e) = self.upsert_match(run_id, decision).await {
                return Err(e.context(PartialWrite { written }));
            }
            written += 1;
        }
        Ok(written)
    }

    async fn record_errors(&self, run_id: &str, errors: &[DocumentError]) -> Result<()>;

    /// Documents in scope without a decision, ordered by `document_id`.
    async fn fetch_unresolved_documents(
        &self,
        scope: &RunScope,
        page_size: usize,
        offset: usize,
    ) -> Result<Vec<SourceDocument>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub document_timeout: Duration,
    pub circuit_breaker_threshold: usize,
    /// Attach the full trace to every explanation
    pub debug: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_concurrency: num_cpus::get() * 2,
            document_timeout: Duration::from_secs(30),
            circuit_breaker_threshold: 5,
            debug: false,
        }
    }
}

impl BatchOptions {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: env::var("MATCH_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.batch_size),
            max_concurrency: env::var("MATCH_MAX_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.max_concurrency),
            document_timeout: env::var("MATCH_DOCUMENT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.document_timeout),
            circuit_breaker_threshold: env::var("MATCH_CIRCUIT_BREAKER_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.circuit_breaker_threshold),
            debug: env::var("MATCH_DEBUG")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }
}

/// Counts consecutive collaborator failures and cancels the run at the threshold.
pub struct CircuitBreaker {
    threshold: usize,
    consecutive: AtomicUsize,
    tripped: AtomicBool,
    token: CancellationToken,
}

impl CircuitBreaker {
    pub fn new(threshold: usize, token: CancellationToken) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: AtomicUsize::new(0),
            tripped: AtomicBool::new(false),
            token,
        }
    }

    pub fn record_success(&self) {
        self.consecutive.store(0, Ordering::SeqCst);
    }

    /// Returns true when this failure tripped the breaker.
    pub fn record_failure(&self) -> bool {
        let count = self.consecutive.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.threshold && !self.tripped.swap(true, Ordering::SeqCst) {
            self.token.cancel();
            return true;
        }
        false
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }
}

enum DocumentOutcome {
    Decided(MatchDecision),
    Failed(DocumentError),
}

pub struct BatchProcessor {
    engine: Arc<MatchEngine>,
    store: Arc<dyn ResultStore>,
    options: BatchOptions,
    cancel: CancellationToken,
    progress_config: ProgressConfig,
    progress_callback: Option<ProgressCallback>,
}

impl BatchProcessor {
    pub fn new(engine: Arc<MatchEngine>, store: Arc<dyn ResultStore>, options: BatchOptions) -> Self {
        Self {
            engine,
            store,
            options,
            cancel: CancellationToken::new(),
            progress_config: ProgressConfig::from_env(),
            progress_callback: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_progress(mut self, config: ProgressConfig, callback: Option<ProgressCallback>) -> Self {
        self.progress_config = config;
        self.progress_callback = callback;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Processes every unresolved document in scope, one page at a time.
    /// Per-document failures are counted; a tripped circuit breaker ends the
    /// run with an error after the current page is persisted.
    pub async fn run(&self, run_id: &str, scope: &RunScope) -> Result<RunStats> {
        let logger = MatchingLogger::new(LogStage::Batch);
        logger.log_start(
            run_id,
            &format!(
                "batch matching for scope {} (page size {}, concurrency {})",
                scope, self.options.batch_size, self.options.max_concurrency
            ),
        );

        let start = Instant::now();
        let breaker = Arc::new(CircuitBreaker::new(
            self.options.circuit_breaker_threshold,
            self.cancel.clone(),
        ));
        // store writes keep their own consecutive count
        let write_breaker =
            CircuitBreaker::new(self.options.circuit_breaker_threshold, self.cancel.clone());
        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrency.max(1)));
        let pb = self.progress_bar()?;

        let mut stats = RunStats::new(run_id);
        // Decided pages drop out of the unresolved set; only documents left
        // unresolved in this run shift the window.
        let mut offset = 0usize;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let documents = self
                .store
                .fetch_unresolved_documents(scope, self.options.batch_size, offset)
                .await
                .with_context(|| format!("Failed to fetch unresolved documents at offset {}", offset))?;
            if documents.is_empty() {
                break;
            }
            stats.pages += 1;
            logger.log_documents_loaded(documents.len(), stats.pages);
            let blank = documents
                .iter()
                .filter(|d| d.raw_address.trim().is_empty())
                .count();
            logger.log_data_quality_issue("blank addresses", blank);

            let outcomes = self
                .evaluate_page(documents, &semaphore, &breaker, pb.as_ref())
                .await;

            let mut page_stats = RunStats::new(run_id);
            let mut decisions = Vec::new();
            let mut errors = Vec::new();
            for outcome in outcomes {
                match outcome {
                    DocumentOutcome::Decided(decision) => {
                        page_stats.record_decision(&decision);
                        decisions.push(decision);
                    }
                    DocumentOutcome::Failed(error) => {
                        page_stats.record_error(error.timed_out);
                        errors.push(error);
                    }
                }
            }

            let persist_logger = MatchingLogger::new(LogStage::Persist);
            persist_logger.log_phase(
                "Persisting page",
                Some(&format!("{} decisions, {} errors", decisions.len(), errors.len())),
            );
            if !decisions.is_empty() {
                match self.store.upsert_matches(run_id, &decisions).await {
                    Ok(written) => {
                        page_stats.persisted += written;
                        write_breaker.record_success();
                    }
                    Err(e) => {
                        let written = written_before_failure(&e);
                        persist_logger.log_error(&format!(
                            "Failed to persist {} of {} decisions on page {}: {:#}",
                            decisions.len() - written,
                            decisions.len(),
                            stats.pages,
                            e
                        ));
                        page_stats.persisted += written;
                        // stored decisions leave the unresolved set, the rest stay in the window
                        offset += decisions.len() - written;
                        write_breaker.record_failure();
                    }
                }
            }
            if !errors.is_empty() {
                if let Err(e) = self.store.record_errors(run_id, &errors).await {
                    persist_logger.log_warning(&format!(
                        "Failed to record {} document errors: {:#}",
                        errors.len(),
                        e
                    ));
                }
                offset += errors.len();
            }

            stats.merge(&page_stats);
            logger.log_batch_progress(stats.pages, page_stats.documents_processed, stats.documents_processed);
            let memory = if self.progress_config.should_show_memory() {
                format!("{} MB", get_memory_usage().await)
            } else {
                String::new()
            };
            update_progress!(
                self.progress_callback,
                "Matching",
                format!(
                    "page {}: {} processed, {} persisted, {} errors {}",
                    stats.pages, stats.documents_processed, stats.persisted, stats.errors, memory
                )
            );
        }

        if let Some(pb) = &pb {
            pb.finish_with_message(format!("{} documents", stats.documents_processed));
        }
        stats.set_elapsed(start.elapsed());
        stats.cancelled = self.cancel.is_cancelled();
        logger.log_completion(&stats);

        if breaker.is_tripped() || write_breaker.is_tripped() {
            return Err(anyhow!(
                "Circuit breaker tripped after {} consecutive failures; run {} stopped with {} documents processed",
                self.options.circuit_breaker_threshold,
                run_id,
                stats.documents_processed
            ));
        }
        Ok(stats)
    }

    async fn evaluate_page(
        &self,
        documents: Vec<SourceDocument>,
        semaphore: &Arc<Semaphore>,
        breaker: &Arc<CircuitBreaker>,
        pb: Option<&ProgressBar>,
    ) -> Vec<DocumentOutcome> {
        let mut ids = Vec::with_capacity(documents.len());
        let mut tasks = Vec::with_capacity(documents.len());

        for doc in documents {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let engine = self.engine.clone();
            let breaker = breaker.clone();
            let pb = pb.cloned();
            let limit = self.options.document_timeout;
            let debug = self.options.debug;
            ids.push(doc.document_id);
            tasks.push(tokio::spawn(async move {
                let _permit_guard = permit;
                let outcome = match timeout(limit, engine.match_document(&doc, debug)).await {
                    Ok(Ok(decision)) => {
                        breaker.record_success();
                        DocumentOutcome::Decided(decision)
                    }
                    Ok(Err(e)) => {
                        breaker.record_failure();
                        DocumentOutcome::Failed(DocumentError {
                            document_id: doc.document_id,
                            message: format!("{:#}", e),
                            timed_out: false,
                        })
                    }
                    Err(_) => {
                        breaker.record_failure();
                        DocumentOutcome::Failed(DocumentError {
                            document_id: doc.document_id,
                            message: format!("Timed out after {:?}", limit),
                            timed_out: true,
                        })
                    }
                };
                if let Some(pb) = pb {
                    pb.inc(1);
                }
                outcome
            }));
        }

        join_all(tasks)
            .await
            .into_iter()
            .zip(ids)
            .map(|(joined, document_id)| match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Matching task for document {} failed to join: {:?}", document_id, e);
                    DocumentOutcome::Failed(DocumentError {
                        document_id,
                        message: format!("task failed: {}", e),
                        timed_out: false,
                    })
                }
            })
            .collect()
    }

    fn progress_bar(&self) -> Result<Option<ProgressBar>> {
        if !self.progress_config.enabled {
            return Ok(None);
        }
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {pos} documents matched {msg}")
                .context("Failed to set progress bar style")?,
        );
        pb.enable_steady_tick(Duration::from_millis(self.progress_config.refresh_rate_ms));
        Ok(Some(pb))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::candidates::{ComponentQuery, Gazetteer};
    use crate::matching::memory::{FailingGazetteer, InMemoryGazetteer, InMemoryResultStore};
    use crate::models::address::GazetteerEntry;
    use crate::models::config::MatchingConfig;

    struct SlowGazetteer;

    #[async_trait]
    impl Gazetteer for SlowGazetteer {
        async fn lookup_by_identifier(&self, _uprn: &str) -> Result<Option<GazetteerEntry>> {
            Ok(None)
        }

        async fn lookup_by_exact_canonical_text(&self, _c: &str, _l: usize) -> Result<Vec<GazetteerEntry>> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(Vec::new())
        }

        async fn lookup_by_similarity(
            &self,
            _c: &str,
            _m: f64,
            _l: usize,
        ) -> Result<Vec<(GazetteerEntry, f64)>> {
            Ok(Vec::new())
        }

        async fn lookup_by_components(&self, _q: &ComponentQuery, _l: usize) -> Result<Vec<GazetteerEntry>> {
            Ok(Vec::new())
        }
    }

    fn options(batch_size: usize, threshold: usize) -> BatchOptions {
        BatchOptions {
            batch_size,
            max_concurrency: 1,
            document_timeout: Duration::from_secs(5),
            circuit_breaker_threshold: threshold,
            debug: false,
        }
    }

    fn documents(n: i64) -> Vec<SourceDocument> {
        (1..=n)
            .map(|i| SourceDocument::new(i, &format!("{} MILL LANE, ALTON", i)))
            .collect()
    }

    /// Fails the `fail_on`-th single upsert, counting from one.
    struct FlakyStore {
        inner: InMemoryResultStore,
        calls: AtomicUsize,
        fail_on: usize,
    }

    #[async_trait]
    impl ResultStore for FlakyStore {
        async fn upsert_match(&self, run_id: &str, decision: &MatchDecision) -> Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
                return Err(anyhow!("connection reset"));
            }
            self.inner.upsert_match(run_id, decision).await
        }

        async fn record_errors(&self, run_id: &str, errors: &[DocumentError]) -> Result<()> {
            self.inner.record_errors(run_id, errors).await
        }

        async fn fetch_unresolved_documents(
            &self,
            scope: &RunScope,
            page_size: usize,
            offset: usize,
        ) -> Result<Vec<SourceDocument>> {
            self.inner.fetch_unresolved_documents(scope, page_size, offset).await
        }
    }

    fn processor(gazetteer: Arc<dyn Gazetteer>, store: Arc<dyn ResultStore>, opts: BatchOptions) -> BatchProcessor {
        let engine = Arc::new(MatchEngine::new(Arc::new(MatchingConfig::default()), gazetteer, None));
        BatchProcessor::new(engine, store, opts).with_progress(ProgressConfig::quiet(), None)
    }

    fn mill_lane() -> Arc<dyn Gazetteer> {
        Arc::new(InMemoryGazetteer::new(
            (1..=5)
                .map(|i| GazetteerEntry::new(&format!("{}", 1000 + i), &format!("{} MILL LANE, ALTON", i)))
                .collect(),
        ))
    }

    #[tokio::test]
    async fn test_run_pages_through_all_documents() {
        let store = Arc::new(InMemoryResultStore::new(documents(5)));
        let stats = processor(mill_lane(), store.clone(), options(2, 5))
            .run("run-1", &RunScope::All)
            .await
            .unwrap();

        assert_eq!(stats.documents_processed, 5);
        assert_eq!(stats.pages, 3);
        assert_eq!(stats.persisted, 5);
        assert_eq!(stats.errors, 0);
        assert_eq!(store.decision_count().await, 5);
        assert_eq!(store.decision(3).await.and_then(|d| d.uprn), Some("1003".to_string()));

        // Nothing left to resolve on a second pass
        let again = processor(mill_lane(), store.clone(), options(2, 5))
            .run("run-2", &RunScope::All)
            .await
            .unwrap();
        assert_eq!(again.documents_processed, 0);
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = Arc::new(InMemoryResultStore::new(documents(2)));
        processor(mill_lane(), store.clone(), options(10, 5))
            .run("run-1", &RunScope::All)
            .await
            .unwrap();
        let first = store.decision(1).await.unwrap();
        store.upsert_matches("run-1", &[first.clone()]).await.unwrap();
        assert_eq!(store.decision_count().await, 2);
        assert_eq!(store.decision(1).await, Some(first));
    }

    #[tokio::test]
    async fn test_errored_documents_stay_unresolved() {
        let store = Arc::new(InMemoryResultStore::new(documents(5)));
        let stats = processor(Arc::new(FailingGazetteer), store.clone(), options(2, 100))
            .run("run-1", &RunScope::All)
            .await
            .unwrap();
        assert_eq!(stats.errors, 5);
        assert_eq!(stats.decided(), 0);
        assert_eq!(store.errors().await.len(), 5);
        assert_eq!(store.decision_count().await, 0);
    }

    #[tokio::test]
    async fn test_circuit_breaker_cancels_run() {
        let store = Arc::new(InMemoryResultStore::new(documents(10)));
        let batch = processor(Arc::new(FailingGazetteer), store.clone(), options(10, 3));
        let token = batch.cancellation_token();
        let result = batch.run("run-1", &RunScope::All).await;

        assert!(result.is_err());
        assert!(token.is_cancelled());
        let errors = store.errors().await.len();
        assert!(errors >= 3 && errors < 10);
    }

    #[tokio::test]
    async fn test_persist_failures_trip_breaker() {
        let store = Arc::new(InMemoryResultStore::new(documents(4)));
        store.set_fail_writes(true);
        let result = processor(mill_lane(), store.clone(), options(1, 2))
            .run("run-1", &RunScope::All)
            .await;
        assert!(result.is_err());
        assert_eq!(store.decision_count().await, 0);
    }

    #[tokio::test]
    async fn test_partial_page_write_skips_no_documents() {
        let gazetteer: Arc<dyn Gazetteer> = Arc::new(InMemoryGazetteer::new(
            (1..=8)
                .map(|i| GazetteerEntry::new(&format!("{}", 1000 + i), &format!("{} MILL LANE, ALTON", i)))
                .collect(),
        ));
        let store = Arc::new(FlakyStore {
            inner: InMemoryResultStore::new(documents(8)),
            calls: AtomicUsize::new(0),
            fail_on: 3,
        });
        let stats = processor(gazetteer, store.clone(), options(4, 5))
            .run("run-1", &RunScope::All)
            .await
            .unwrap();

        assert_eq!(stats.persisted, 6);
        assert_eq!(store.inner.decision_count().await, 6);
        // the failed write and the one after it on the same page stay unresolved
        assert!(store.inner.decision(3).await.is_none());
        assert!(store.inner.decision(4).await.is_none());
        for id in [1, 2, 5, 6, 7, 8] {
            assert!(store.inner.decision(id).await.is_some(), "document {} skipped", id);
        }
    }

    #[tokio::test]
    async fn test_default_upsert_reports_partial_count() {
        let store = FlakyStore {
            inner: InMemoryResultStore::new(documents(4)),
            calls: AtomicUsize::new(0),
            fail_on: 3,
        };
        let decisions: Vec<MatchDecision> = (1..=4)
            .map(|id| MatchDecision::no_match(id, Default::default()))
            .collect();
        let err = store.upsert_matches("run-1", &decisions).await.unwrap_err();
        assert_eq!(written_before_failure(&err), 2);
        assert_eq!(store.inner.decision_count().await, 2);

        let other = anyhow!("pool timed out");
        assert_eq!(written_before_failure(&other), 0);
    }

    #[tokio::test]
    async fn test_document_timeout() {
        let store = Arc::new(InMemoryResultStore::new(documents(2)));
        let mut opts = options(10, 100);
        opts.document_timeout = Duration::from_millis(50);
        let stats = processor(Arc::new(SlowGazetteer), store.clone(), opts)
            .run("run-1", &RunScope::All)
            .await
            .unwrap();
        assert_eq!(stats.timeouts, 2);
        assert!(store.errors().await.iter().all(|e| e.timed_out));
    }

    #[tokio::test]
    async fn test_cancelled_run_starts_nothing() {
        let store = Arc::new(InMemoryResultStore::new(documents(3)));
        let token = CancellationToken::new();
        token.cancel();
        let stats = processor(mill_lane(), store.clone(), options(10, 5))
            .with_cancellation(token)
            .run("run-1", &RunScope::All)
            .await
            .unwrap();
        assert!(stats.cancelled);
        assert_eq!(stats.documents_processed, 0);
        assert_eq!(store.decision_count().await, 0);
    }

    #[test]
    fn test_breaker_resets_on_success() {
        let breaker = CircuitBreaker::new(2, CancellationToken::new());
        assert!(!breaker.record_failure());
        breaker.record_success();
        assert!(!breaker.record_failure());
        assert!(breaker.record_failure());
        assert!(breaker.is_tripped());
    }

    #[test]
    fn test_batch_options_from_env() {
        env::set_var("MATCH_BATCH_SIZE", "250");
        env::set_var("MATCH_DOCUMENT_TIMEOUT_SECS", "12");
        env::set_var("MATCH_CIRCUIT_BREAKER_THRESHOLD", "0");
        let opts = BatchOptions::from_env();
        assert_eq!(opts.batch_size, 250);
        assert_eq!(opts.document_timeout, Duration::from_secs(12));
        assert_eq!(opts.circuit_breaker_threshold, 5);
        env::remove_var("MATCH_BATCH_SIZE");
        env::remove_var("MATCH_DOCUMENT_TIMEOUT_SECS");
        env::remove_var("MATCH_CIRCUIT_BREAKER_THRESHOLD");
    }
}
