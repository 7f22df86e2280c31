// src/matching/orchestrator.rs - Per-document tier state machine
use anyhow::{bail, Result};
use std::sync::Arc;

use crate::matching::candidates::{
    cap_pool, CandidateGenerator, Gazetteer, GenerationReport, SemanticIndex,
};
use crate::matching::features::{compute_features, AddressProfile};
use crate::matching::parser::parse_address;
use crate::matching::scorer::{RankedCandidate, Scorer};
use crate::matching::validator::Validator;
use crate::models::address::{AddressComponents, SourceDocument};
use crate::models::config::MatchingConfig;
use crate::models::matching::{
    Candidate, CandidateMethod, DecisionExplanation, DecisionTag, ExplanationDetail, MatchDecision,
    MatchStage, ValidationOutcome, ValidationVerdict,
};
use crate::normalize::address::grid_distance;
use crate::utils::progress_bars::logging::{LogStage, MatchingLogger};

/// How many ranked candidates a debug explanation lists.
const EXPLAIN_TOP_N: usize = 5;

/// One engine for every strategy mix; `MatchingConfig::strategies` decides
/// which tiers run.
pub struct MatchEngine {
    config: Arc<MatchingConfig>,
    generator: CandidateGenerator,
    scorer: Scorer,
    validator: Validator,
}

struct Trace {
    debug: bool,
    stages: Vec<MatchStage>,
}

impl Trace {
    fn enter(&mut self, stage: MatchStage) {
        self.stages.push(stage);
    }

    fn finish(mut self) -> Vec<MatchStage> {
        self.stages.push(MatchStage::Terminal);
        self.stages
    }
}

impl MatchEngine {
    pub fn new(
        config: Arc<MatchingConfig>,
        gazetteer: Arc<dyn Gazetteer>,
        semantic: Option<Arc<dyn SemanticIndex>>,
    ) -> Self {
        Self {
            generator: CandidateGenerator::new(gazetteer, semantic, config.clone()),
            scorer: Scorer::new(config.clone()),
            validator: Validator::new(config.validation.clone(), &config.version),
            config,
        }
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    /// Runs one document through the tiers. Errors only when every strategy
    /// that was attempted failed; anything else ends in a decision.
    pub async fn match_document(&self, doc: &SourceDocument, debug: bool) -> Result<MatchDecision> {
        let mut trace = Trace {
            debug,
            stages: vec![MatchStage::Start],
        };
        let components = parse_address(&doc.raw_address);
        let profile = AddressProfile::from_document(doc);
        let mut report = GenerationReport::default();

        trace.enter(MatchStage::DeterministicTier);
        let legacy = self.generator.legacy_identifier(doc).await;
        if let Some(found) = legacy.candidates.first().cloned() {
            return Ok(self.identifier_decision(doc, found, trace));
        }
        report.absorb(legacy);

        let exact = self.generator.exact_canonical(doc, &profile.canonical).await;
        if let Some(decision) = self.try_exact_short_circuit(doc, &components, &exact, &mut trace) {
            return Ok(decision);
        }
        report.absorb(exact);

        trace.enter(MatchStage::FuzzyTier);
        let pool_size = report.candidates.len();
        report.absorb(
            self.generator
                .fuzzy_tier(doc, &profile.canonical, &components, pool_size)
                .await,
        );

        if self.config.strategies.semantic && self.generator.has_semantic_index() {
            trace.enter(MatchStage::SemanticTier);
            report.absorb(self.generator.semantic_tier(doc, &profile.canonical).await);
        }

        if report.all_failed() {
            bail!(
                "All {} attempted strategies failed for document {}: {}",
                report.attempted.len(),
                doc.document_id,
                report.failure_messages().join("; ")
            );
        }

        let failures = report.failure_messages();
        let mut pool = report.candidates;
        let mut spatially_filtered = 0;
        if let (true, Some(origin)) = (self.config.strategies.spatial_filter, doc.coordinates()) {
            trace.enter(MatchStage::SpatialFilter);
            let before = pool.len();
            let radius = self.config.spatial.filter_radius_meters;
            pool.retain(|c| {
                c.entry
                    .coordinates()
                    .map_or(true, |point| grid_distance(origin, point) <= radius)
            });
            spatially_filtered = before - pool.len();
            MatchingLogger::new(LogStage::Fuzzy).log_spatial_filter(
                doc.document_id,
                before,
                spatially_filtered,
                radius,
            );
        }

        let pool = cap_pool(pool, self.config.generation.max_candidates);
        if pool.is_empty() {
            trace.enter(MatchStage::Decide);
            let explanation = DecisionExplanation {
                summary: "No gazetteer candidates found".to_string(),
                strategy_failures: failures,
                config_version: self.config.version.clone(),
                detail: trace.debug.then(|| ExplanationDetail {
                    spatially_filtered,
                    ..Default::default()
                }),
                ..Default::default()
            };
            let mut decision = MatchDecision::no_match(doc.document_id, explanation);
            if let Some(detail) = decision.explanation.detail.as_mut() {
                detail.stages = trace.finish();
            }
            return Ok(decision);
        }

        trace.enter(MatchStage::Rank);
        let scored = pool
            .into_iter()
            .map(|candidate| {
                let features = compute_features(doc, &profile, &candidate, &self.config.spatial);
                (candidate, features)
            })
            .collect();
        let ranked = self.scorer.rank(scored);
        let verdict = self.scorer.tier(&ranked);

        trace.enter(MatchStage::Validate);
        let top = &ranked[0];
        let outcome = self
            .validator
            .validate(&components, &parse_address(&top.candidate.entry.full_address));

        trace.enter(MatchStage::Decide);
        let gate = outcome.gate();
        let tag = verdict.tag.min(gate);
        let vetoed = outcome.is_hard_veto();
        if vetoed && verdict.tag > DecisionTag::NoMatch {
            MatchingLogger::new(LogStage::Validation).log_debug(&format!(
                "Document {}: validator vetoed {} for UPRN {}",
                doc.document_id,
                verdict.tag,
                top.candidate.uprn()
            ));
        }

        let matched = tag != DecisionTag::NoMatch;
        let explanation = DecisionExplanation {
            summary: summarize(tag, top, &outcome, vetoed),
            scorer_tag: Some(verdict.tag),
            validator_tag: Some(gate),
            margin: Some(verdict.margin),
            candidates_considered: ranked.len(),
            vetoed,
            veto_reason: vetoed.then(|| veto_reason(&outcome)),
            strategy_failures: failures,
            config_version: self.config.version.clone(),
            detail: None,
        };

        let mut decision = MatchDecision {
            document_id: doc.document_id,
            uprn: matched.then(|| top.candidate.entry.uprn.clone()),
            matched_address: matched.then(|| top.candidate.entry.full_address.clone()),
            score: verdict.top_score,
            tag,
            method: if matched {
                top.candidate.primary_method().as_str().to_string()
            } else {
                "none".to_string()
            },
            requires_review: outcome.requires_review || tag == DecisionTag::NeedsReview,
            explanation,
        };

        if trace.debug {
            let top_candidates = ranked
                .iter()
                .take(EXPLAIN_TOP_N)
                .enumerate()
                .map(|(i, r)| r.summary(i + 1, true))
                .collect();
            decision.explanation.detail = Some(ExplanationDetail {
                top_candidates,
                winner_breakdown: Some(top.breakdown.clone()),
                winner_features: Some(top.features.clone()),
                validation: Some(outcome),
                spatially_filtered,
                stages: trace.finish(),
            });
        }
        Ok(decision)
    }

    fn identifier_decision(&self, doc: &SourceDocument, found: Candidate, mut trace: Trace) -> MatchDecision {
        trace.enter(MatchStage::Decide);
        let explanation = DecisionExplanation {
            summary: format!("Legacy UPRN {} confirmed in gazetteer", found.entry.uprn),
            scorer_tag: Some(DecisionTag::AutoAccept),
            validator_tag: None,
            margin: Some(1.0),
            candidates_considered: 1,
            config_version: self.config.version.clone(),
            detail: trace.debug.then(|| ExplanationDetail {
                stages: trace.finish(),
                ..Default::default()
            }),
            ..Default::default()
        };
        MatchDecision {
            document_id: doc.document_id,
            uprn: Some(found.entry.uprn),
            matched_address: Some(found.entry.full_address),
            score: 1.0,
            tag: DecisionTag::AutoAccept,
            method: CandidateMethod::LegacyUprn.as_str().to_string(),
            requires_review: false,
            explanation,
        }
    }

    /// A single exact canonical hit above the deterministic threshold, on a
    /// suitable input, that the validator accepts.
    fn try_exact_short_circuit(
        &self,
        doc: &SourceDocument,
        components: &AddressComponents,
        exact: &GenerationReport,
        trace: &mut Trace,
    ) -> Option<MatchDecision> {
        let hit = match exact.candidates.as_slice() {
            [only] if only.score > self.config.tiers.deterministic_threshold => only,
            _ => return None,
        };
        if !components.is_suitable_for_matching {
            return None;
        }
        let outcome = self
            .validator
            .validate(components, &parse_address(&hit.entry.full_address));
        if outcome.verdict != ValidationVerdict::Accept {
            return None;
        }

        trace.enter(MatchStage::Validate);
        trace.enter(MatchStage::Decide);
        let explanation = DecisionExplanation {
            summary: format!("Exact canonical match to UPRN {}", hit.entry.uprn),
            scorer_tag: Some(DecisionTag::AutoAccept),
            validator_tag: Some(outcome.gate()),
            margin: Some(1.0),
            candidates_considered: 1,
            config_version: self.config.version.clone(),
            detail: trace.debug.then(|| ExplanationDetail {
                stages: std::mem::take(&mut trace.stages)
                    .into_iter()
                    .chain(std::iter::once(MatchStage::Terminal))
                    .collect(),
                validation: Some(outcome),
                ..Default::default()
            }),
            ..Default::default()
        };
        Some(MatchDecision {
            document_id: doc.document_id,
            uprn: Some(hit.entry.uprn.clone()),
            matched_address: Some(hit.entry.full_address.clone()),
            score: hit.score,
            tag: DecisionTag::AutoAccept,
            method: CandidateMethod::ExactCanonical.as_str().to_string(),
            requires_review: false,
            explanation,
        })
    }
}

fn veto_reason(outcome: &ValidationOutcome) -> String {
    [&outcome.house_number, &outcome.street, &outcome.postcode]
        .into_iter()
        .flatten()
        .find(|check| !check.is_valid)
        .map(|check| check.reason.clone())
        .unwrap_or_else(|| outcome.reasons.join("; "))
}

fn summarize(tag: DecisionTag, top: &RankedCandidate, outcome: &ValidationOutcome, vetoed: bool) -> String {
    if vetoed {
        return format!(
            "Best candidate UPRN {} ({:.3}) rejected by validation",
            top.candidate.uprn(),
            top.score()
        );
    }
    match tag {
        DecisionTag::AutoAccept => format!(
            "Auto-accepted UPRN {} at {:.3} (validator {:.2})",
            top.candidate.uprn(),
            top.score(),
            outcome.overall_confidence
        ),
        DecisionTag::NeedsReview => format!(
            "UPRN {} at {:.3} needs review: {}",
            top.candidate.uprn(),
            top.score(),
            outcome.reasons.first().map(String::as_str).unwrap_or("score below auto-accept")
        ),
        DecisionTag::LowConfidence => format!(
            "Low-confidence candidate UPRN {} at {:.3}",
            top.candidate.uprn(),
            top.score()
        ),
        DecisionTag::NoMatch => format!("Best candidate scored {:.3}, below every tier", top.score()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::memory::{FailingGazetteer, InMemoryGazetteer};
    use crate::models::address::GazetteerEntry;

    fn engine_with(config: MatchingConfig, entries: Vec<GazetteerEntry>) -> MatchEngine {
        MatchEngine::new(
            Arc::new(config),
            Arc::new(InMemoryGazetteer::new(entries)),
            None,
        )
    }

    fn engine(entries: Vec<GazetteerEntry>) -> MatchEngine {
        engine_with(MatchingConfig::default(), entries)
    }

    #[tokio::test]
    async fn test_house_number_mismatch_is_vetoed() {
        let e = engine(vec![GazetteerEntry::new("147", "147 STATION ROAD, LISS")]);
        let d = e
            .match_document(&SourceDocument::new(1, "168 STATION ROAD, LISS"), false)
            .await
            .unwrap();
        assert_eq!(d.tag, DecisionTag::NoMatch);
        assert!(d.uprn.is_none());
        assert!(d.explanation.vetoed);
        assert!(!d.requires_review);
        assert!(d.explanation.veto_reason.is_some());
    }

    #[tokio::test]
    async fn test_abbreviated_exact_match_auto_accepts() {
        let e = engine(vec![
            GazetteerEntry::new("168", "168 STATION ROAD, LISS, GU33 7AA"),
            GazetteerEntry::new("169", "169 STATION ROAD, LISS, GU33 7AA"),
        ]);
        let d = e
            .match_document(&SourceDocument::new(2, "168 STATION RD, LISS, GU33 7AA"), true)
            .await
            .unwrap();
        assert_eq!(d.tag, DecisionTag::AutoAccept);
        assert_eq!(d.uprn.as_deref(), Some("168"));
        assert_eq!(d.method, "addr_exact");
        assert!(!d.requires_review);
        let detail = d.explanation.detail.unwrap();
        assert_eq!(detail.stages.last(), Some(&MatchStage::Terminal));
        assert!(!detail.stages.contains(&MatchStage::FuzzyTier));
    }

    #[tokio::test]
    async fn test_unit_mismatch_is_rejected() {
        let e = engine(vec![GazetteerEntry::new("7", "UNIT 7, 4 MILL LANE, ALTON")]);
        let d = e
            .match_document(&SourceDocument::new(3, "UNIT 10, MILL LANE, ALTON"), false)
            .await
            .unwrap();
        assert_eq!(d.tag, DecisionTag::NoMatch);
        assert!(d.uprn.is_none());
    }

    #[tokio::test]
    async fn test_adjacent_house_number_routes_to_review() {
        let e = engine(vec![GazetteerEntry::new("169", "169 STATION ROAD, LISS")]);
        let d = e
            .match_document(&SourceDocument::new(4, "168 STATION ROAD, LISS"), false)
            .await
            .unwrap();
        assert_eq!(d.tag, DecisionTag::NeedsReview);
        assert!(d.requires_review);
        assert!(!d.explanation.vetoed);
        assert_eq!(d.uprn.as_deref(), Some("169"));
    }

    #[tokio::test]
    async fn test_vague_reference_never_auto_accepts() {
        let e = engine(vec![GazetteerEntry::new(
            "5",
            "UNIT 5, AMEY INDUSTRIAL ESTATE, FRENCHMANS ROAD, PETERSFIELD",
        )]);
        let d = e
            .match_document(&SourceDocument::new(5, "LAND AT AMEY INDUSTRIAL ESTATE"), false)
            .await
            .unwrap();
        assert!(d.tag <= DecisionTag::NeedsReview);
        assert_eq!(d.explanation.validator_tag, Some(DecisionTag::NeedsReview));
    }

    #[tokio::test]
    async fn test_legacy_identifier_short_circuit() {
        let e = engine(vec![GazetteerEntry::new("100200", "THE OLD BARN, SELBORNE")]);
        let doc = SourceDocument::new(6, "somewhere near the church").with_uprn("100200");
        let d = e.match_document(&doc, false).await.unwrap();
        assert_eq!(d.tag, DecisionTag::AutoAccept);
        assert_eq!(d.score, 1.0);
        assert_eq!(d.method, "legacy_uprn_valid");
        assert_eq!(d.uprn.as_deref(), Some("100200"));
    }

    #[tokio::test]
    async fn test_legacy_identifier_with_decimal_suffix() {
        let e = engine(vec![GazetteerEntry::new("1710022145", "THE OLD BARN, SELBORNE")]);
        let doc = SourceDocument::new(6, "somewhere near the church").with_uprn("1710022145.00");
        let d = e.match_document(&doc, false).await.unwrap();
        assert_eq!(d.tag, DecisionTag::AutoAccept);
        assert_eq!(d.method, "legacy_uprn_valid");
        assert_eq!(d.uprn.as_deref(), Some("1710022145"));
    }

    #[tokio::test]
    async fn test_hill_street_exact_match_auto_accepts() {
        let e = engine(vec![GazetteerEntry::new("12", "12 CHURCH HILL, ALTON, GU34 2QG")]);
        let d = e
            .match_document(&SourceDocument::new(8, "12 Church Hill, Alton, GU34 2QG"), false)
            .await
            .unwrap();
        assert_eq!(d.tag, DecisionTag::AutoAccept);
        assert_eq!(d.method, "addr_exact");
        assert_eq!(d.uprn.as_deref(), Some("12"));
    }

    #[tokio::test]
    async fn test_vague_input_with_wrong_house_number_is_vetoed() {
        let e = engine(vec![GazetteerEntry::new("147", "147 STATION ROAD")]);
        let d = e
            .match_document(&SourceDocument::new(9, "REAR OF 168 STATION ROAD"), false)
            .await
            .unwrap();
        assert_eq!(d.tag, DecisionTag::NoMatch);
        assert!(d.uprn.is_none());
        assert!(d.explanation.vetoed);
        assert!(!d.requires_review);
    }

    #[tokio::test]
    async fn test_loosest_validator_config_keeps_house_veto() {
        let mut config = MatchingConfig::default();
        config.validation.street_similarity = 0.0;
        config.validation.auto_accept = 0.0;
        config.validation.review = 0.0;
        config.validation.house_proximity_window = 0;
        assert!(config.check().is_ok());

        let e = engine_with(config, vec![GazetteerEntry::new("147", "147 STATION ROAD, LISS")]);
        let d = e
            .match_document(&SourceDocument::new(10, "168 STATION ROAD, LISS"), false)
            .await
            .unwrap();
        assert_eq!(d.tag, DecisionTag::NoMatch);
        assert!(d.uprn.is_none());
        assert!(d.explanation.vetoed);
    }

    #[tokio::test]
    async fn test_ambiguous_exact_matches_do_not_short_circuit() {
        let e = engine(vec![
            GazetteerEntry::new("1", "12 MILL LANE, ALTON"),
            GazetteerEntry::new("2", "12 MILL LANE, ALTON"),
        ]);
        let d = e
            .match_document(&SourceDocument::new(7, "12 MILL LANE, ALTON"), false)
            .await
            .unwrap();
        assert_eq!(d.tag, DecisionTag::NeedsReview);
        assert_eq!(d.explanation.margin, Some(0.0));
        assert_eq!(d.uprn.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_veto_beats_scorer() {
        let mut config = MatchingConfig::default();
        config.tiers.auto_accept_high = 0.80;
        config.tiers.auto_accept_medium = 0.80;
        config.tiers.review_threshold = 0.75;
        let e = engine_with(config, vec![GazetteerEntry::new("147", "147 STATION ROAD, LISS")]);
        let d = e
            .match_document(&SourceDocument::new(8, "168 STATION ROAD, LISS"), false)
            .await
            .unwrap();
        assert_eq!(d.explanation.scorer_tag, Some(DecisionTag::AutoAccept));
        assert_eq!(d.tag, DecisionTag::NoMatch);
        assert!(d.explanation.vetoed);
    }

    #[tokio::test]
    async fn test_decisions_are_deterministic() {
        let entries = vec![
            GazetteerEntry::new("1", "168 STATION ROAD, LISS"),
            GazetteerEntry::new("2", "169 STATION ROAD, LISS"),
            GazetteerEntry::new("3", "16 STATION ROAD, LISS"),
        ];
        let e = engine(entries);
        let doc = SourceDocument::new(9, "168 STATON RD LISS");
        let first = e.match_document(&doc, true).await.unwrap();
        let second = e.match_document(&doc, true).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_spatial_filter_drops_distant_candidates() {
        let e = engine(vec![
            GazetteerEntry::new("far", "168 STATION ROAD, LISS").with_coordinates(480000.0, 130000.0),
        ]);
        let doc = SourceDocument::new(10, "168 STATION ROAD, LISS, HAMPSHIRE")
            .with_coordinates(477000.0, 127000.0);
        let d = e.match_document(&doc, true).await.unwrap();
        assert_eq!(d.tag, DecisionTag::NoMatch);
        assert_eq!(d.explanation.detail.map(|x| x.spatially_filtered), Some(1));
    }

    #[tokio::test]
    async fn test_outage_errors_but_empty_input_decides() {
        let e = MatchEngine::new(
            Arc::new(MatchingConfig::default()),
            Arc::new(FailingGazetteer),
            None,
        );
        let err = e
            .match_document(&SourceDocument::new(11, "168 STATION ROAD, LISS"), false)
            .await;
        assert!(err.is_err());

        let d = e.match_document(&SourceDocument::new(12, "   "), false).await.unwrap();
        assert_eq!(d.tag, DecisionTag::NoMatch);
    }
}
