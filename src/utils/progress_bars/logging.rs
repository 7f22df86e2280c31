// src/utils/progress_bars/logging.rs - Stage-prefixed logging helpers for the matching engine
use log::{debug, error, info, warn};
use std::time::{Duration, Instant};

use crate::models::matching::CandidateMethod;
use crate::models::stats_models::RunStats;

/// Engine stage a logger reports for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStage {
    Deterministic,
    Fuzzy,
    Semantic,
    Validation,
    Batch,
    Persist,
}

impl LogStage {
    pub fn label(&self) -> (&'static str, &'static str) {
        match self {
            Self::Deterministic => ("DETERMINISTIC", "🎯"),
            Self::Fuzzy => ("FUZZY", "🔍"),
            Self::Semantic => ("SEMANTIC", "🧭"),
            Self::Validation => ("VALIDATION", "🛡️"),
            Self::Batch => ("BATCH", "📦"),
            Self::Persist => ("PERSIST", "💾"),
        }
    }

    pub fn for_method(method: CandidateMethod) -> Self {
        match method {
            CandidateMethod::LegacyUprn | CandidateMethod::ExactCanonical => Self::Deterministic,
            CandidateMethod::Semantic => Self::Semantic,
            _ => Self::Fuzzy,
        }
    }
}

#[derive(Clone)]
pub struct MatchingLogger {
    stage_name: &'static str,
    stage_emoji: &'static str,
    start_time: Instant,
}

impl MatchingLogger {
    pub fn new(stage: LogStage) -> Self {
        let (stage_name, stage_emoji) = stage.label();
        Self {
            stage_name,
            stage_emoji,
            start_time: Instant::now(),
        }
    }

    pub fn log_start(&self, run_id: &str, details: &str) {
        info!(
            "[{}] {} 🚀 Starting {} (run ID: {})",
            self.stage_name, self.stage_emoji, details, run_id
        );
    }

    pub fn log_phase(&self, phase: &str, details: Option<&str>) {
        let elapsed = self.start_time.elapsed();
        let msg = if let Some(details) = details {
            format!(
                "[{}] {} 🔄 Phase: {} - {} [+{:.1}s]",
                self.stage_name, self.stage_emoji, phase, details, elapsed.as_secs_f32()
            )
        } else {
            format!(
                "[{}] {} 🔄 Phase: {} [+{:.1}s]",
                self.stage_name, self.stage_emoji, phase, elapsed.as_secs_f32()
            )
        };
        info!("{}", msg);
    }

    pub fn log_documents_loaded(&self, count: usize, page: usize) {
        info!(
            "[{}] {} 📊 Page {}: fetched {} unresolved documents",
            self.stage_name, self.stage_emoji, page, count
        );
    }

    pub fn log_batch_progress(&self, page: usize, documents_in_page: usize, processed_so_far: usize) {
        if page % 5 == 0 || page == 1 {
            info!(
                "[{}] {} 📦 Page {} done ({} documents, {} processed so far)",
                self.stage_name, self.stage_emoji, page, documents_in_page, processed_so_far
            );
        }
    }

    pub fn log_strategy_failure(&self, method: CandidateMethod, document_id: i64, error: &str) {
        warn!(
            "[{}] {} ⚠️  {} lookup failed for document {}: {}",
            self.stage_name, self.stage_emoji, method, document_id, error
        );
    }

    pub fn log_spatial_filter(&self, document_id: i64, before: usize, removed: usize, radius_m: f64) {
        if removed > 0 {
            debug!(
                "[{}] {} 🌍 Document {}: spatial filter removed {}/{} candidates beyond {:.0}m",
                self.stage_name, self.stage_emoji, document_id, removed, before, radius_m
            );
        }
    }

    pub fn log_completion(&self, stats: &RunStats) {
        let duration = self.start_time.elapsed();
        info!(
            "[{}] {} 🎉 COMPLETED: {} documents in {:.2?}",
            self.stage_name, self.stage_emoji, stats.documents_processed, duration
        );
        info!(
            "[{}] {} 📊 Results: {} auto-accepted, {} for review, {} low confidence, {} no match, {} errors (mean score {:.3})",
            self.stage_name,
            self.stage_emoji,
            stats.auto_accepted,
            stats.needs_review,
            stats.low_confidence,
            stats.no_match,
            stats.errors,
            stats.mean_score()
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!("[{}] {} ⚠️  {}", self.stage_name, self.stage_emoji, message);
    }

    pub fn log_error(&self, message: &str) {
        error!("[{}] {} ❌ {}", self.stage_name, self.stage_emoji, message);
    }

    pub fn log_debug(&self, message: &str) {
        debug!("[{}] {} {}", self.stage_name, self.stage_emoji, message);
    }

    pub fn log_data_quality_issue(&self, issue_type: &str, count: usize) {
        if count > 0 {
            warn!(
                "[{}] {} ⚠️  Data quality: {} instances of {}",
                self.stage_name, self.stage_emoji, count, issue_type
            );
        }
    }
}

// Run-level logging functions
pub fn log_pipeline_start(run_id: &str, scope: &str, concurrency_limit: usize, strategies: &[&str]) {
    info!("🚀 ===== UPRN MATCHING RUN STARTING =====");
    info!("📅 Run ID: {}", run_id);
    info!("⚙️  Configuration:");
    info!("   • Scope: {}", scope);
    info!("   • Concurrency limit: {} simultaneous documents", concurrency_limit);
    info!("   • Strategies: {}", strategies.join(", "));
    info!("🎯 Tiers: Deterministic 🎯, Fuzzy 🔍, Semantic 🧭, Validation 🛡️");
    info!("==========================================");
}

pub fn log_pipeline_phase(phase: &str, details: Option<&str>) {
    let msg = if let Some(details) = details {
        format!("🔄 Run Phase: {} - {}", phase, details)
    } else {
        format!("🔄 Run Phase: {}", phase)
    };
    info!("{}", msg);
}

pub fn log_pipeline_completion(run_id: &str, duration: Duration, stats: &RunStats) {
    info!("🎉 ===== UPRN MATCHING RUN COMPLETED =====");
    info!("📅 Run ID: {}", run_id);
    info!("⏱️  Total Duration: {:.2?}", duration);
    info!("📄 Documents processed: {}", stats.documents_processed);
    info!("");
    info!("📈 Decision Breakdown:");
    info!("  ✅ auto_accept: {}", stats.auto_accepted);
    info!("  👀 needs_review: {}", stats.needs_review);
    info!("  🌫️ low_confidence: {}", stats.low_confidence);
    info!("  ❌ no_match: {} ({} validator vetoes)", stats.no_match, stats.vetoed);
    info!("");
    info!("📊 Summary:");
    info!("  • Errors: {} ({} timeouts)", stats.errors, stats.timeouts);
    info!("  • Mean score: {:.3}", stats.mean_score());
    info!("  • Throughput: {:.1} documents/s", stats.throughput_per_sec());

    let mut methods: Vec<_> = stats.decisions_by_method.iter().collect();
    methods.sort();
    for (method, count) in methods {
        info!("  • {}: {}", method, count);
    }
    for line in stats.histogram.describe() {
        info!("  • score {}", line);
    }
    if stats.cancelled {
        warn!("  • Run was cancelled before all documents were processed");
    }
    info!("==========================================");
}
