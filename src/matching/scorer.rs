// src/matching/scorer.rs - Weighted score, deterministic ranking and decision tiers
use std::cmp::Ordering;
use std::sync::Arc;

use crate::models::config::MatchingConfig;
use crate::models::matching::{
    Candidate, CandidateFeatures, DecisionTag, RankedCandidateSummary, ScoreBreakdown,
};

/// A candidate with its features and score, ready for ranking.
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub candidate: Candidate,
    pub features: CandidateFeatures,
    pub breakdown: ScoreBreakdown,
}

impl RankedCandidate {
    pub fn score(&self) -> f64 {
        self.breakdown.final_score
    }

    pub fn summary(&self, rank: usize, with_detail: bool) -> RankedCandidateSummary {
        RankedCandidateSummary {
            rank,
            uprn: self.candidate.entry.uprn.clone(),
            address: self.candidate.entry.full_address.clone(),
            score: self.score(),
            methods: self.candidate.methods.clone(),
            features: with_detail.then(|| self.features.clone()),
            breakdown: with_detail.then(|| self.breakdown.clone()),
        }
    }
}

/// Scorer verdict for a ranked pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierVerdict {
    pub tag: DecisionTag,
    pub top_score: f64,
    pub margin: f64,
}

#[derive(Debug, Clone)]
pub struct Scorer {
    config: Arc<MatchingConfig>,
}

impl Scorer {
    pub fn new(config: Arc<MatchingConfig>) -> Self {
        Self { config }
    }

    pub fn score(&self, f: &CandidateFeatures) -> ScoreBreakdown {
        let w = &self.config.weights;

        let mut boosts = 0.0;
        if f.same_house_number {
            boosts += w.same_house_number;
        }
        if f.same_house_alpha {
            boosts += w.same_house_alpha;
        }
        if f.legacy_uprn_valid {
            boosts += w.legacy_uprn_valid;
        }
        if f.gazetteer_live {
            boosts += w.gazetteer_live;
        }

        let mut penalties = 0.0;
        if f.descriptor_mismatch {
            penalties += w.descriptor_penalty;
        }
        if f.phonetic_applicable && f.phonetic_hits == 0 {
            penalties += w.phonetic_miss_penalty;
        }

        let mut breakdown = ScoreBreakdown {
            trigram_contribution: f.trigram * w.trigram,
            edit_contribution: f.edit_similarity * w.edit_similarity,
            embedding_contribution: f.embedding_cosine * w.embedding_cosine,
            cosine_contribution: f.token_cosine * w.token_cosine,
            locality_contribution: f.locality_overlap * w.locality_overlap,
            street_contribution: f.street_overlap * w.street_overlap,
            boosts_total: boosts,
            spatial_contribution: f.spatial_boost,
            penalties_total: penalties,
            ..Default::default()
        };
        breakdown.raw_total = breakdown.trigram_contribution
            + breakdown.edit_contribution
            + breakdown.embedding_contribution
            + breakdown.cosine_contribution
            + breakdown.locality_contribution
            + breakdown.street_contribution
            + breakdown.boosts_total
            + breakdown.spatial_contribution
            + breakdown.penalties_total;
        breakdown.final_score = breakdown.raw_total.clamp(0.0, 1.0);
        breakdown
    }

    /// Scores each (candidate, features) pair and sorts by score desc, UPRN asc.
    pub fn rank(&self, scored: Vec<(Candidate, CandidateFeatures)>) -> Vec<RankedCandidate> {
        let mut ranked: Vec<RankedCandidate> = scored
            .into_iter()
            .map(|(mut candidate, features)| {
                let breakdown = self.score(&features);
                candidate.features = Some(features.clone());
                RankedCandidate {
                    candidate,
                    features,
                    breakdown,
                }
            })
            .collect();
        ranked.sort_by(compare_ranked);
        ranked
    }

    /// Gap between the top two scores; 1.0 when there is a single candidate.
    pub fn margin(ranked: &[RankedCandidate]) -> f64 {
        match ranked {
            [] => 0.0,
            [_] => 1.0,
            [first, second, ..] => first.score() - second.score(),
        }
    }

    pub fn tier(&self, ranked: &[RankedCandidate]) -> TierVerdict {
        let top = match ranked.first() {
            Some(top) => top,
            None => {
                return TierVerdict {
                    tag: DecisionTag::NoMatch,
                    top_score: 0.0,
                    margin: 0.0,
                }
            }
        };
        let score = top.score();
        let margin = Self::margin(ranked);
        let tag = self.tag_for(
            score,
            margin,
            Some((top.features.same_house_number, top.features.locality_overlap)),
        );

        TierVerdict {
            tag,
            top_score: score,
            margin,
        }
    }

    /// Tier for a top score and margin. `medium_signals` carries the winner's
    /// (same_house_number, locality_overlap); without it the medium tier is skipped.
    pub fn tag_for(&self, score: f64, margin: f64, medium_signals: Option<(bool, f64)>) -> DecisionTag {
        let tiers = &self.config.tiers;
        let high = score >= tiers.auto_accept_high && margin >= tiers.winner_margin;
        let medium = match medium_signals {
            Some((same_house_number, locality_overlap)) => {
                score >= tiers.auto_accept_medium
                    && margin >= tiers.winner_margin + tiers.medium_extra_margin
                    && same_house_number
                    && locality_overlap >= tiers.medium_min_locality_overlap
            }
            None => false,
        };

        if high || medium {
            DecisionTag::AutoAccept
        } else if score >= tiers.review_threshold {
            DecisionTag::NeedsReview
        } else if score >= tiers.min_threshold {
            DecisionTag::LowConfidence
        } else {
            DecisionTag::NoMatch
        }
    }
}

fn compare_ranked(a: &RankedCandidate, b: &RankedCandidate) -> Ordering {
    b.score()
        .total_cmp(&a.score())
        .then_with(|| a.candidate.entry.uprn.cmp(&b.candidate.entry.uprn))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::address::GazetteerEntry;
    use crate::models::matching::CandidateMethod;

    fn scorer() -> Scorer {
        Scorer::new(Arc::new(MatchingConfig::default()))
    }

    fn features(trigram: f64, edit: f64) -> CandidateFeatures {
        CandidateFeatures {
            trigram,
            edit_similarity: edit,
            locality_overlap: 1.0,
            street_overlap: 1.0,
            same_house_number: true,
            gazetteer_live: true,
            ..Default::default()
        }
    }

    fn candidate(uprn: &str) -> Candidate {
        Candidate::new(
            GazetteerEntry::new(uprn, &format!("{} MILL LANE, ALTON", uprn)),
            0.8,
            CandidateMethod::Similarity,
        )
    }

    #[test]
    fn test_score_terms_and_clamp() {
        let breakdown = scorer().score(&features(1.0, 1.0));
        assert!((breakdown.raw_total - 1.11).abs() < 1e-9);
        assert_eq!(breakdown.final_score, 1.0);

        let mut weak = CandidateFeatures {
            descriptor_mismatch: true,
            phonetic_applicable: true,
            ..Default::default()
        };
        let breakdown = scorer().score(&weak);
        assert!((breakdown.penalties_total + 0.08).abs() < 1e-9);
        assert_eq!(breakdown.final_score, 0.0);

        weak.phonetic_hits = 1;
        assert!((scorer().score(&weak).penalties_total + 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_phonetic_penalty_needs_source_tokens() {
        let f = CandidateFeatures {
            phonetic_applicable: false,
            ..Default::default()
        };
        assert_eq!(scorer().score(&f).penalties_total, 0.0);
    }

    #[test]
    fn test_rank_breaks_ties_by_uprn() {
        let ranked = scorer().rank(vec![
            (candidate("300"), features(0.8, 0.8)),
            (candidate("100"), features(0.8, 0.8)),
            (candidate("200"), features(0.9, 0.9)),
        ]);
        let order: Vec<&str> = ranked.iter().map(|r| r.candidate.uprn()).collect();
        assert_eq!(order, vec!["200", "100", "300"]);
        assert!(ranked[0].candidate.features.is_some());
    }

    #[test]
    fn test_tiers() {
        let s = scorer();
        let single = s.rank(vec![(candidate("1"), features(0.9, 0.95))]);
        let verdict = s.tier(&single);
        assert_eq!(verdict.tag, DecisionTag::AutoAccept);
        assert_eq!(verdict.margin, 1.0);

        let tied = s.rank(vec![
            (candidate("1"), features(0.9, 0.95)),
            (candidate("2"), features(0.9, 0.95)),
        ]);
        let verdict = s.tier(&tied);
        assert_eq!(verdict.margin, 0.0);
        assert_eq!(verdict.tag, DecisionTag::NeedsReview);

        let weak = s.rank(vec![(
            candidate("1"),
            CandidateFeatures {
                trigram: 0.8,
                edit_similarity: 0.8,
                ..Default::default()
            },
        )]);
        assert_eq!(s.tier(&weak).tag, DecisionTag::LowConfidence);
        assert_eq!(s.tier(&[]).tag, DecisionTag::NoMatch);
    }

    #[test]
    fn test_medium_tier_requires_house_and_locality() {
        let s = scorer();
        // 0.45 * 1.6 + 0.05 + 0.05 + 0.08 = 0.90, between the medium and high tiers
        let mut f = features(0.8, 0.8);
        f.gazetteer_live = false;
        let medium = s.rank(vec![(candidate("1"), f.clone())]);
        assert!(medium[0].score() >= 0.88 && medium[0].score() < 0.92);
        assert_eq!(s.tier(&medium).tag, DecisionTag::AutoAccept);

        f.locality_overlap = 0.0;
        let no_locality = s.rank(vec![(candidate("1"), f)]);
        assert_eq!(s.tier(&no_locality).tag, DecisionTag::NeedsReview);
    }

    #[test]
    fn test_raising_high_threshold_never_adds_auto_accepts() {
        let pools: Vec<Vec<RankedCandidate>> = [0.70, 0.80, 0.85, 0.90, 0.95, 1.0]
            .iter()
            .map(|sim| scorer().rank(vec![(candidate("1"), features(*sim, *sim))]))
            .collect();

        let mut previous = usize::MAX;
        for high in [0.88, 0.90, 0.92, 0.95, 0.98, 1.0] {
            let mut config = MatchingConfig::default();
            config.tiers.auto_accept_high = high;
            let s = Scorer::new(Arc::new(config));
            let accepted = pools
                .iter()
                .filter(|pool| s.tier(pool).tag == DecisionTag::AutoAccept)
                .count();
            assert!(accepted <= previous);
            previous = accepted;
        }
    }
}
