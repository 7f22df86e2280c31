// src/models/matching.rs
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::address::GazetteerEntry;

/// Strategy that produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateMethod {
    /// Legacy UPRN on the document exists in the gazetteer
    LegacyUprn,
    /// Canonical text equality
    ExactCanonical,
    /// Similarity-ranked text lookup
    Similarity,
    /// Postcode + house number equality
    Components,
    /// Street-only relaxed lookup, used when earlier strategies are starved
    StreetFallback,
    /// Nearest neighbours from the semantic index
    Semantic,
}

impl CandidateMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LegacyUprn => "legacy_uprn_valid",
            Self::ExactCanonical => "addr_exact",
            Self::Similarity => "trigram",
            Self::Components => "component_match",
            Self::StreetFallback => "street_fallback",
            Self::Semantic => "vector_ann",
        }
    }

    /// All strategies in generation priority order.
    pub fn all() -> [CandidateMethod; 6] {
        [
            Self::LegacyUprn,
            Self::ExactCanonical,
            Self::Similarity,
            Self::Components,
            Self::StreetFallback,
            Self::Semantic,
        ]
    }
}

impl fmt::Display for CandidateMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse distance bands reported alongside the raw distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceBand {
    #[serde(rename = "0-100m")]
    Within100m,
    #[serde(rename = "100-250m")]
    Within250m,
    #[serde(rename = "250-500m")]
    Within500m,
    #[serde(rename = "500m-1km")]
    Within1km,
    #[serde(rename = "1-2km")]
    Within2km,
    #[serde(rename = "2km+")]
    Beyond2km,
}

impl DistanceBand {
    pub fn from_meters(distance: f64) -> Self {
        if distance <= 100.0 {
            Self::Within100m
        } else if distance <= 250.0 {
            Self::Within250m
        } else if distance <= 500.0 {
            Self::Within500m
        } else if distance <= 1000.0 {
            Self::Within1km
        } else if distance <= 2000.0 {
            Self::Within2km
        } else {
            Self::Beyond2km
        }
    }
}

/// Every signal the scorer and explanation consume. Each field is a pure
/// function of the (input, candidate) pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateFeatures {
    /// pg_trgm-style trigram similarity of canonical texts
    pub trigram: f64,
    pub jaro: f64,
    /// 1 - levenshtein / max_len on canonical texts
    pub edit_similarity: f64,
    /// Cosine similarity over token multisets
    pub token_cosine: f64,
    /// Semantic index score, 0 when the candidate did not come from it
    pub embedding_cosine: f64,
    pub same_house_number: bool,
    /// Both sides carry the same alpha suffix ("12A" / "12A")
    pub same_house_alpha: bool,
    pub locality_overlap: f64,
    pub street_overlap: f64,
    /// Street/locality tokens on the input with a phonetic twin on the candidate
    pub phonetic_hits: usize,
    /// The input had phonetic tokens to compare at all
    pub phonetic_applicable: bool,
    /// Vague descriptor ("LAND AT", "REAR OF") on exactly one side
    pub descriptor_mismatch: bool,
    pub distance_meters: Option<f64>,
    pub distance_band: Option<DistanceBand>,
    pub spatial_boost: f64,
    pub legacy_uprn_valid: bool,
    pub gazetteer_live: bool,
}

/// A gazetteer entry proposed for a document by one or more strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub entry: GazetteerEntry,
    /// Raw strategy score (max over merged strategies)
    pub score: f64,
    /// Strategies that proposed this entry, in discovery order
    pub methods: Vec<CandidateMethod>,
    /// Score from the semantic index, when it proposed this entry
    pub semantic_score: Option<f64>,
    pub features: Option<CandidateFeatures>,
}

impl Candidate {
    pub fn new(entry: GazetteerEntry, score: f64, method: CandidateMethod) -> Self {
        Self {
            entry,
            score,
            methods: vec![method],
            semantic_score: None,
            features: None,
        }
    }

    pub fn uprn(&self) -> &str {
        &self.entry.uprn
    }

    /// Primary method: the highest-priority strategy that found this entry.
    pub fn primary_method(&self) -> CandidateMethod {
        self.methods
            .iter()
            .copied()
            .min()
            .unwrap_or(CandidateMethod::Similarity)
    }

    /// Folds another sighting of the same UPRN into this candidate.
    pub fn merge(&mut self, other: Candidate) {
        if other.score > self.score {
            self.score = other.score;
        }
        for method in other.methods {
            if !self.methods.contains(&method) {
                self.methods.push(method);
            }
        }
        self.semantic_score = match (self.semantic_score, other.semantic_score) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

/// Terminal decision outcomes, ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionTag {
    NoMatch,
    LowConfidence,
    NeedsReview,
    AutoAccept,
}

impl DecisionTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoMatch => "no_match",
            Self::LowConfidence => "low_confidence",
            Self::NeedsReview => "needs_review",
            Self::AutoAccept => "auto_accept",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "no_match" => Some(Self::NoMatch),
            "low_confidence" => Some(Self::LowConfidence),
            "needs_review" => Some(Self::NeedsReview),
            "auto_accept" => Some(Self::AutoAccept),
            _ => None,
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Self::NoMatch => "❌",
            Self::LowConfidence => "🌫️",
            Self::NeedsReview => "👀",
            Self::AutoAccept => "✅",
        }
    }
}

impl fmt::Display for DecisionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stages of the per-document decision state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStage {
    Start,
    DeterministicTier,
    FuzzyTier,
    SemanticTier,
    SpatialFilter,
    Rank,
    Validate,
    Decide,
    Terminal,
}

/// Per-term contributions of one candidate's score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub trigram_contribution: f64,
    pub edit_contribution: f64,
    pub embedding_contribution: f64,
    pub cosine_contribution: f64,
    pub locality_contribution: f64,
    pub street_contribution: f64,
    pub boosts_total: f64,
    pub spatial_contribution: f64,
    pub penalties_total: f64,
    /// Unclamped sum of all terms
    pub raw_total: f64,
    /// Clamped to [0,1]
    pub final_score: f64,
}

/// Outcome of one component rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentCheck {
    pub is_valid: bool,
    pub confidence: f64,
    pub requires_review: bool,
    pub reason: String,
}

impl ComponentCheck {
    pub fn valid(confidence: f64, reason: String) -> Self {
        Self { is_valid: true, confidence, requires_review: false, reason }
    }

    pub fn invalid(confidence: f64, reason: String) -> Self {
        Self { is_valid: false, confidence, requires_review: false, reason }
    }

    pub fn flagged(reason: String) -> Self {
        Self { is_valid: false, confidence: 0.0, requires_review: true, reason }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationVerdict {
    Accept,
    Review,
    Reject,
}

/// Result of running the mandatory component rules on one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub verdict: ValidationVerdict,
    pub overall_confidence: f64,
    pub requires_review: bool,
    pub house_number: Option<ComponentCheck>,
    pub street: Option<ComponentCheck>,
    pub postcode: Option<ComponentCheck>,
    pub reasons: Vec<String>,
    pub version: String,
}

impl ValidationOutcome {
    /// The decision tag the validator allows at most.
    pub fn gate(&self) -> DecisionTag {
        match self.verdict {
            ValidationVerdict::Accept => DecisionTag::AutoAccept,
            ValidationVerdict::Review => DecisionTag::NeedsReview,
            ValidationVerdict::Reject if self.requires_review => DecisionTag::NeedsReview,
            ValidationVerdict::Reject => DecisionTag::NoMatch,
        }
    }

    pub fn is_hard_veto(&self) -> bool {
        self.verdict == ValidationVerdict::Reject && !self.requires_review
    }
}

/// Short per-candidate line in a debug explanation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidateSummary {
    pub rank: usize,
    pub uprn: String,
    pub address: String,
    pub score: f64,
    pub methods: Vec<CandidateMethod>,
    pub features: Option<CandidateFeatures>,
    pub breakdown: Option<ScoreBreakdown>,
}

/// Full audit detail, attached only in debug runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExplanationDetail {
    pub stages: Vec<MatchStage>,
    pub top_candidates: Vec<RankedCandidateSummary>,
    pub winner_breakdown: Option<ScoreBreakdown>,
    pub winner_features: Option<CandidateFeatures>,
    pub validation: Option<ValidationOutcome>,
    pub spatially_filtered: usize,
}

/// Why a decision was made. Always carries the summary fields; `detail` is
/// populated only when the run asked for a full trace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionExplanation {
    pub summary: String,
    pub scorer_tag: Option<DecisionTag>,
    pub validator_tag: Option<DecisionTag>,
    pub margin: Option<f64>,
    pub candidates_considered: usize,
    /// A validation veto: a correct rejection, not a system error
    pub vetoed: bool,
    pub veto_reason: Option<String>,
    pub strategy_failures: Vec<String>,
    pub config_version: String,
    pub detail: Option<ExplanationDetail>,
}

/// The single output of a document's run through the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchDecision {
    pub document_id: i64,
    pub uprn: Option<String>,
    pub matched_address: Option<String>,
    pub score: f64,
    pub tag: DecisionTag,
    /// Strategy credited with the match ("none" when nothing was chosen)
    pub method: String,
    pub requires_review: bool,
    pub explanation: DecisionExplanation,
}

impl MatchDecision {
    pub fn no_match(document_id: i64, explanation: DecisionExplanation) -> Self {
        Self {
            document_id,
            uprn: None,
            matched_address: None,
            score: 0.0,
            tag: DecisionTag::NoMatch,
            method: "none".to_string(),
            requires_review: false,
            explanation,
        }
    }

    pub fn explanation_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.explanation).unwrap_or(serde_json::Value::Null)
    }
}
