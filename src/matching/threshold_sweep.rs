// src/matching/threshold_sweep.rs - Replays stored decisions against alternative auto-accept cut-offs
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::matching::scorer::Scorer;
use crate::models::config::MatchingConfig;
use crate::models::matching::{DecisionExplanation, DecisionTag};

/// The inputs of one past decision that the tiering depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayRow {
    pub score: f64,
    pub margin: f64,
    /// Winner's (same_house_number, locality_overlap), present for debug-traced decisions
    pub medium_signals: Option<(bool, f64)>,
    /// Validator gate recorded at decision time
    pub validator_tag: Option<DecisionTag>,
    pub vetoed: bool,
}

impl ReplayRow {
    /// Rebuilds a row from a persisted score and explanation. Rows without a
    /// scorer verdict (no candidates) are skipped.
    pub fn from_stored(score: f64, explanation: &serde_json::Value) -> Option<Self> {
        let explanation: DecisionExplanation = serde_json::from_value(explanation.clone()).ok()?;
        explanation.scorer_tag?;
        let medium_signals = explanation
            .detail
            .as_ref()
            .and_then(|d| d.winner_features.as_ref())
            .map(|f| (f.same_house_number, f.locality_overlap));
        Some(Self {
            score,
            margin: explanation.margin.unwrap_or(0.0),
            medium_signals,
            validator_tag: explanation.validator_tag,
            vetoed: explanation.vetoed,
        })
    }

    fn final_tag(&self, scorer: &Scorer) -> DecisionTag {
        if self.vetoed {
            return DecisionTag::NoMatch;
        }
        let tag = scorer.tag_for(self.score, self.margin, self.medium_signals);
        match self.validator_tag {
            Some(gate) => tag.min(gate),
            None => tag,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepPoint {
    pub auto_accept_high: f64,
    pub auto_accepted: usize,
    pub needs_review: usize,
    pub low_confidence: usize,
    pub no_match: usize,
}

impl SweepPoint {
    pub fn auto_accept_rate(&self, total: usize) -> f64 {
        if total == 0 {
            0.0
        } else {
            self.auto_accepted as f64 / total as f64
        }
    }
}

/// Evenly spaced `auto_accept_high` values from `start` to `end` inclusive.
pub fn threshold_range(start: f64, end: f64, step: f64) -> Result<Vec<f64>> {
    if step <= 0.0 || start > end {
        bail!("Invalid sweep range: start {} end {} step {}", start, end, step);
    }
    let steps = ((end - start) / step + 1e-9).floor() as usize;
    Ok((0..=steps).map(|i| start + i as f64 * step).collect())
}

/// Retiers every row at each threshold, all other tiers held at `base`.
pub fn sweep(rows: &[ReplayRow], base: &MatchingConfig, thresholds: &[f64]) -> Vec<SweepPoint> {
    thresholds
        .iter()
        .map(|&threshold| {
            let mut config = base.clone();
            config.tiers.auto_accept_high = threshold;
            let scorer = Scorer::new(Arc::new(config));

            let mut point = SweepPoint {
                auto_accept_high: threshold,
                auto_accepted: 0,
                needs_review: 0,
                low_confidence: 0,
                no_match: 0,
            };
            for row in rows {
                match row.final_tag(&scorer) {
                    DecisionTag::AutoAccept => point.auto_accepted += 1,
                    DecisionTag::NeedsReview => point.needs_review += 1,
                    DecisionTag::LowConfidence => point.low_confidence += 1,
                    DecisionTag::NoMatch => point.no_match += 1,
                }
            }
            point
        })
        .collect()
}

/// Auto-accept counts never increase as the threshold rises.
pub fn is_monotonic(points: &[SweepPoint]) -> bool {
    points
        .windows(2)
        .all(|w| w[0].auto_accept_high > w[1].auto_accept_high || w[0].auto_accepted >= w[1].auto_accepted)
}
