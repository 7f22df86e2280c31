// src/models/stats_models.rs
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::models::matching::{DecisionTag, MatchDecision};

/// Which documents a run targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunScope {
    All,
    DocumentType(String),
    SingleDocument(i64),
}

impl RunScope {
    pub fn as_str(&self) -> String {
        match self {
            Self::All => "all".to_string(),
            Self::DocumentType(t) => format!("doc_type:{}", t),
            Self::SingleDocument(id) => format!("document:{}", id),
        }
    }
}

impl fmt::Display for RunScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

/// Ten equal-width bins over [0,1]; a score of exactly 1.0 lands in the last bin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceHistogram {
    pub bins: [usize; 10],
}

impl ConfidenceHistogram {
    pub fn record(&mut self, score: f64) {
        let idx = ((score.clamp(0.0, 1.0) * 10.0) as usize).min(9);
        self.bins[idx] += 1;
    }

    pub fn total(&self) -> usize {
        self.bins.iter().sum()
    }

    pub fn merge(&mut self, other: &ConfidenceHistogram) {
        for (a, b) in self.bins.iter_mut().zip(other.bins.iter()) {
            *a += b;
        }
    }

    /// "0.9-1.0: 12" style lines, skipping empty bins.
    pub fn describe(&self) -> Vec<String> {
        self.bins
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(i, count)| format!("{:.1}-{:.1}: {}", i as f64 / 10.0, (i + 1) as f64 / 10.0, count))
            .collect()
    }
}

/// Aggregate statistics for one matching run (or one page of it).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub run_id: String,
    pub documents_processed: usize,
    pub auto_accepted: usize,
    pub needs_review: usize,
    pub no_match: usize,
    pub low_confidence: usize,
    pub errors: usize,
    pub timeouts: usize,
    pub vetoed: usize,
    pub persisted: usize,
    pub pages: usize,
    pub score_sum: f64,
    pub histogram: ConfidenceHistogram,
    pub decisions_by_method: HashMap<String, usize>,
    pub elapsed_secs: f64,
    pub cancelled: bool,
}

impl RunStats {
    pub fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            ..Default::default()
        }
    }

    pub fn record_decision(&mut self, decision: &MatchDecision) {
        self.documents_processed += 1;
        match decision.tag {
            DecisionTag::AutoAccept => self.auto_accepted += 1,
            DecisionTag::NeedsReview => self.needs_review += 1,
            DecisionTag::NoMatch => self.no_match += 1,
            DecisionTag::LowConfidence => self.low_confidence += 1,
        }
        if decision.explanation.vetoed {
            self.vetoed += 1;
        }
        self.score_sum += decision.score;
        self.histogram.record(decision.score);
        *self
            .decisions_by_method
            .entry(decision.method.clone())
            .or_insert(0) += 1;
    }

    pub fn record_error(&mut self, timed_out: bool) {
        self.documents_processed += 1;
        self.errors += 1;
        if timed_out {
            self.timeouts += 1;
        }
    }

    pub fn decided(&self) -> usize {
        self.auto_accepted + self.needs_review + self.no_match + self.low_confidence
    }

    pub fn mean_score(&self) -> f64 {
        let decided = self.decided();
        if decided > 0 {
            self.score_sum / decided as f64
        } else {
            0.0
        }
    }

    pub fn throughput_per_sec(&self) -> f64 {
        if self.elapsed_secs > 0.0 {
            self.documents_processed as f64 / self.elapsed_secs
        } else {
            0.0
        }
    }

    pub fn set_elapsed(&mut self, elapsed: Duration) {
        self.elapsed_secs = elapsed.as_secs_f64();
    }

    pub fn merge(&mut self, other: &RunStats) {
        self.documents_processed += other.documents_processed;
        self.auto_accepted += other.auto_accepted;
        self.needs_review += other.needs_review;
        self.no_match += other.no_match;
        self.low_confidence += other.low_confidence;
        self.errors += other.errors;
        self.timeouts += other.timeouts;
        self.vetoed += other.vetoed;
        self.persisted += other.persisted;
        self.score_sum += other.score_sum;
        self.histogram.merge(&other.histogram);
        for (method, count) in &other.decisions_by_method {
            *self.decisions_by_method.entry(method.clone()).or_insert(0) += count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::matching::DecisionExplanation;

    fn decision(tag: DecisionTag, score: f64) -> MatchDecision {
        MatchDecision {
            document_id: 1,
            uprn: None,
            matched_address: None,
            score,
            tag,
            method: "trigram".to_string(),
            requires_review: false,
            explanation: DecisionExplanation::default(),
        }
    }

    #[test]
    fn test_histogram_edges() {
        let mut histogram = ConfidenceHistogram::default();
        histogram.record(0.0);
        histogram.record(0.95);
        histogram.record(1.0);
        histogram.record(1.7);
        assert_eq!(histogram.bins[0], 1);
        assert_eq!(histogram.bins[9], 3);
        assert_eq!(histogram.total(), 4);
    }

    #[test]
    fn test_run_stats_counts() {
        let mut stats = RunStats::new("run-1");
        stats.record_decision(&decision(DecisionTag::AutoAccept, 1.0));
        stats.record_decision(&decision(DecisionTag::NeedsReview, 0.8));
        stats.record_error(true);

        assert_eq!(stats.documents_processed, 3);
        assert_eq!(stats.decided(), 2);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.timeouts, 1);
        assert!((stats.mean_score() - 0.9).abs() < 1e-9);
        assert_eq!(stats.decisions_by_method.get("trigram"), Some(&2));
    }

    #[test]
    fn test_run_scope_labels() {
        assert_eq!(RunScope::All.as_str(), "all");
        assert_eq!(RunScope::DocumentType("planning".into()).as_str(), "doc_type:planning");
        assert_eq!(RunScope::SingleDocument(42).to_string(), "document:42");
    }
}
