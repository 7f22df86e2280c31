// src/models/config.rs - Versioned thresholds and weights for a matching run
use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::env;
use std::path::Path;

use crate::models::matching::CandidateMethod;

pub const DEFAULT_CONFIG_VERSION: &str = "tiered-v1";

/// Score cut-offs for the scorer's decision tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionTiers {
    pub auto_accept_high: f64,
    pub auto_accept_medium: f64,
    pub review_threshold: f64,
    pub min_threshold: f64,
    /// Minimum gap between the top two candidates for any auto-accept
    pub winner_margin: f64,
    /// Additional margin the medium tier requires on top of `winner_margin`
    pub medium_extra_margin: f64,
    pub medium_min_locality_overlap: f64,
    /// Deterministic strategies short-circuit above this raw score
    pub deterministic_threshold: f64,
}

impl Default for DecisionTiers {
    fn default() -> Self {
        Self {
            auto_accept_high: 0.92,
            auto_accept_medium: 0.88,
            review_threshold: 0.80,
            min_threshold: 0.70,
            winner_margin: 0.03,
            medium_extra_margin: 0.02,
            medium_min_locality_overlap: 0.5,
            deterministic_threshold: 0.95,
        }
    }
}

/// Per-feature weights. Penalties are negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureWeights {
    pub trigram: f64,
    pub edit_similarity: f64,
    pub embedding_cosine: f64,
    pub token_cosine: f64,
    pub locality_overlap: f64,
    pub street_overlap: f64,
    pub same_house_number: f64,
    pub same_house_alpha: f64,
    pub legacy_uprn_valid: f64,
    pub gazetteer_live: f64,
    pub descriptor_penalty: f64,
    pub phonetic_miss_penalty: f64,
}

impl Default for FeatureWeights {
    fn default() -> Self {
        Self {
            trigram: 0.45,
            edit_similarity: 0.45,
            embedding_cosine: 0.0,
            token_cosine: 0.0,
            locality_overlap: 0.05,
            street_overlap: 0.05,
            same_house_number: 0.08,
            same_house_alpha: 0.02,
            legacy_uprn_valid: 0.20,
            gazetteer_live: 0.03,
            descriptor_penalty: -0.05,
            phonetic_miss_penalty: -0.03,
        }
    }
}

/// Thresholds for the conservative component validator. The house number
/// and street gates and the component weights are not configurable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidationThresholds {
    pub street_similarity: f64,
    pub auto_accept: f64,
    pub review: f64,
    /// House numbers this close (but not equal) are flagged for review
    pub house_proximity_window: u32,
    pub allow_postcode_district: bool,
}

impl Default for ValidationThresholds {
    fn default() -> Self {
        Self {
            street_similarity: 0.90,
            auto_accept: 0.95,
            review: 0.70,
            house_proximity_window: 2,
            allow_postcode_district: true,
        }
    }
}

/// Caps for the candidate generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationLimits {
    pub max_candidates: usize,
    pub similarity_floor: f64,
    pub similarity_limit: usize,
    pub exact_limit: usize,
    pub component_limit: usize,
    pub street_fallback_limit: usize,
    pub semantic_limit: usize,
    /// Street fallback runs only when earlier strategies found fewer candidates
    pub starvation_threshold: usize,
}

impl Default for GenerationLimits {
    fn default() -> Self {
        Self {
            max_candidates: 100,
            similarity_floor: 0.50,
            similarity_limit: 50,
            exact_limit: 20,
            component_limit: 25,
            street_fallback_limit: 25,
            semantic_limit: 20,
            starvation_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialSettings {
    pub max_boost: f64,
    pub boost_cutoff_meters: f64,
    pub filter_radius_meters: f64,
}

impl Default for SpatialSettings {
    fn default() -> Self {
        Self {
            max_boost: 0.10,
            boost_cutoff_meters: 2000.0,
            filter_radius_meters: 2000.0,
        }
    }
}

/// Which tiers/strategies the orchestrator runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategySet {
    pub legacy_identifier: bool,
    pub exact_canonical: bool,
    pub similarity: bool,
    pub components: bool,
    pub street_fallback: bool,
    pub semantic: bool,
    pub spatial_filter: bool,
}

impl Default for StrategySet {
    fn default() -> Self {
        Self {
            legacy_identifier: true,
            exact_canonical: true,
            similarity: true,
            components: true,
            street_fallback: true,
            semantic: false,
            spatial_filter: true,
        }
    }
}

impl StrategySet {
    pub fn is_enabled(&self, method: CandidateMethod) -> bool {
        match method {
            CandidateMethod::LegacyUprn => self.legacy_identifier,
            CandidateMethod::ExactCanonical => self.exact_canonical,
            CandidateMethod::Similarity => self.similarity,
            CandidateMethod::Components => self.components,
            CandidateMethod::StreetFallback => self.street_fallback,
            CandidateMethod::Semantic => self.semantic,
        }
    }

    /// Parses a comma separated list of method names ("addr_exact,trigram").
    /// Unknown names are ignored; the spatial filter stays on.
    pub fn from_list(list: &str) -> Self {
        let mut set = Self {
            legacy_identifier: false,
            exact_canonical: false,
            similarity: false,
            components: false,
            street_fallback: false,
            semantic: false,
            spatial_filter: true,
        };
        for name in list.split(',').map(|s| s.trim().to_lowercase()) {
            match name.as_str() {
                "legacy_uprn_valid" | "legacy" => set.legacy_identifier = true,
                "addr_exact" | "exact" => set.exact_canonical = true,
                "trigram" | "similarity" => set.similarity = true,
                "component_match" | "components" => set.components = true,
                "street_fallback" | "street" => set.street_fallback = true,
                "vector_ann" | "semantic" => set.semantic = true,
                _ => {}
            }
        }
        set
    }

    pub fn enabled_names(&self) -> Vec<&'static str> {
        CandidateMethod::all()
            .iter()
            .filter(|m| self.is_enabled(**m))
            .map(|m| m.as_str())
            .collect()
    }
}

/// Everything that shapes a run's decisions. Loaded once at startup and shared
/// read-only (`Arc<MatchingConfig>`) for the whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub version: String,
    pub tiers: DecisionTiers,
    pub weights: FeatureWeights,
    pub validation: ValidationThresholds,
    pub generation: GenerationLimits,
    pub spatial: SpatialSettings,
    pub strategies: StrategySet,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_CONFIG_VERSION.to_string(),
            tiers: DecisionTiers::default(),
            weights: FeatureWeights::default(),
            validation: ValidationThresholds::default(),
            generation: GenerationLimits::default(),
            spatial: SpatialSettings::default(),
            strategies: StrategySet::default(),
        }
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .unwrap_or(default)
}

impl MatchingConfig {
    /// Defaults overridden by `MATCH_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let tiers = DecisionTiers {
            auto_accept_high: env_f64("MATCH_AUTO_ACCEPT_HIGH", defaults.tiers.auto_accept_high),
            auto_accept_medium: env_f64("MATCH_AUTO_ACCEPT_MEDIUM", defaults.tiers.auto_accept_medium),
            review_threshold: env_f64("MATCH_REVIEW_THRESHOLD", defaults.tiers.review_threshold),
            min_threshold: env_f64("MATCH_MIN_THRESHOLD", defaults.tiers.min_threshold),
            winner_margin: env_f64("MATCH_WINNER_MARGIN", defaults.tiers.winner_margin),
            ..defaults.tiers.clone()
        };
        let weights = FeatureWeights {
            descriptor_penalty: env_f64("MATCH_DESCRIPTOR_PENALTY", defaults.weights.descriptor_penalty),
            phonetic_miss_penalty: env_f64(
                "MATCH_PHONETIC_MISS_PENALTY",
                defaults.weights.phonetic_miss_penalty,
            ),
            ..defaults.weights.clone()
        };
        let validation = ValidationThresholds {
            house_proximity_window: env::var("MATCH_HOUSE_PROXIMITY_WINDOW")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .unwrap_or(2),
            allow_postcode_district: env::var("MATCH_ALLOW_POSTCODE_DISTRICT")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            ..defaults.validation.clone()
        };
        let generation = GenerationLimits {
            max_candidates: env_usize("MATCH_MAX_CANDIDATES", defaults.generation.max_candidates),
            similarity_floor: env_f64("MATCH_SIMILARITY_FLOOR", defaults.generation.similarity_floor),
            similarity_limit: env_usize("MATCH_SIMILARITY_LIMIT", defaults.generation.similarity_limit),
            ..defaults.generation.clone()
        };
        let strategies = env::var("MATCH_STRATEGIES")
            .map(|list| StrategySet::from_list(&list))
            .unwrap_or_default();

        Self {
            version: env::var("MATCH_CONFIG_VERSION").unwrap_or(defaults.version),
            tiers,
            weights,
            validation,
            generation,
            spatial: defaults.spatial,
            strategies,
        }
    }

    /// Loads a JSON thresholds/weights document. Missing keys take defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read matching config {}", path.display()))?;
        let config: MatchingConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse matching config {}", path.display()))?;
        config.check()?;
        Ok(config)
    }

    /// Rejects overlapping decision tiers and validator thresholds outside [0, 1].
    pub fn check(&self) -> Result<()> {
        let t = &self.tiers;
        if !(t.min_threshold <= t.review_threshold
            && t.review_threshold <= t.auto_accept_medium
            && t.auto_accept_medium <= t.auto_accept_high)
        {
            anyhow::bail!(
                "Inconsistent decision tiers: min {} <= review {} <= medium {} <= high {} must hold",
                t.min_threshold,
                t.review_threshold,
                t.auto_accept_medium,
                t.auto_accept_high
            );
        }
        let v = &self.validation;
        for (name, value) in [
            ("street_similarity", v.street_similarity),
            ("auto_accept", v.auto_accept),
            ("review", v.review),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("Validator {} must lie in [0, 1], got {}", name, value);
            }
        }
        if self.validation.review > self.validation.auto_accept {
            anyhow::bail!(
                "Validator review threshold {} exceeds auto-accept threshold {}",
                self.validation.review,
                self.validation.auto_accept
            );
        }
        Ok(())
    }

    /// SHA-256 of the serialized config, stored with each run for audit.
    pub fn fingerprint(&self) -> String {
        let serialized = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(serialized.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn log_config(&self) {
        info!("⚙️  Matching configuration (version {}):", self.version);
        info!(
            "   • Tiers: high={:.2}, medium={:.2}, review={:.2}, min={:.2}, margin={:.2}",
            self.tiers.auto_accept_high,
            self.tiers.auto_accept_medium,
            self.tiers.review_threshold,
            self.tiers.min_threshold,
            self.tiers.winner_margin
        );
        info!(
            "   • Penalties: descriptor={:.2}, phonetic miss={:.2}",
            self.weights.descriptor_penalty, self.weights.phonetic_miss_penalty
        );
        info!(
            "   • Validator: street>={:.2}, accept>={:.2}, review>={:.2}, proximity window={}",
            self.validation.street_similarity,
            self.validation.auto_accept,
            self.validation.review,
            self.validation.house_proximity_window
        );
        info!(
            "   • Candidates: max {}, similarity floor {:.2}",
            self.generation.max_candidates, self.generation.similarity_floor
        );
        info!("   • Strategies: {:?}", self.strategies.enabled_names());
        info!("   • Fingerprint: {}", &self.fingerprint()[..12]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = MatchingConfig::default();
        assert_eq!(config.version, DEFAULT_CONFIG_VERSION);
        assert_eq!(config.tiers.auto_accept_high, 0.92);
        assert_eq!(config.tiers.auto_accept_medium, 0.88);
        assert_eq!(config.tiers.review_threshold, 0.80);
        assert_eq!(config.tiers.min_threshold, 0.70);
        assert_eq!(config.tiers.winner_margin, 0.03);
        assert_eq!(config.validation.house_proximity_window, 2);
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_env_config() {
        env::set_var("MATCH_AUTO_ACCEPT_HIGH", "0.97");
        env::set_var("MATCH_PHONETIC_MISS_PENALTY", "-0.01");
        env::set_var("MATCH_STRATEGIES", "addr_exact,trigram");

        let config = MatchingConfig::from_env();
        assert_eq!(config.tiers.auto_accept_high, 0.97);
        assert_eq!(config.weights.phonetic_miss_penalty, -0.01);
        assert!(config.strategies.exact_canonical);
        assert!(config.strategies.similarity);
        assert!(!config.strategies.legacy_identifier);
        assert!(config.strategies.spatial_filter);

        env::remove_var("MATCH_AUTO_ACCEPT_HIGH");
        env::remove_var("MATCH_PHONETIC_MISS_PENALTY");
        env::remove_var("MATCH_STRATEGIES");
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: MatchingConfig =
            serde_json::from_str(r#"{"version": "pilot", "tiers": {"auto_accept_high": 0.95}}"#)
                .unwrap();
        assert_eq!(config.version, "pilot");
        assert_eq!(config.tiers.auto_accept_high, 0.95);
        assert_eq!(config.tiers.review_threshold, 0.80);
        assert_eq!(config.weights.trigram, 0.45);
    }

    #[test]
    fn test_check_rejects_inverted_tiers() {
        let mut config = MatchingConfig::default();
        config.tiers.review_threshold = 0.99;
        assert!(config.check().is_err());
    }

    #[test]
    fn test_validator_gates_not_configurable() {
        let gates_off = r#"{"validation": {"require_house_number_match": false, "require_street_validation": false}}"#;
        assert!(serde_json::from_str::<MatchingConfig>(gates_off).is_err());

        let reweighted = r#"{"validation": {"house_weight": 0.0, "street_weight": 0.0, "postcode_weight": 1.0}}"#;
        assert!(serde_json::from_str::<MatchingConfig>(reweighted).is_err());

        let tuned: MatchingConfig =
            serde_json::from_str(r#"{"validation": {"house_proximity_window": 3}}"#).unwrap();
        assert_eq!(tuned.validation.house_proximity_window, 3);
        assert_eq!(tuned.validation.auto_accept, 0.95);
    }

    #[test]
    fn test_check_rejects_out_of_range_validator_thresholds() {
        let mut config = MatchingConfig::default();
        config.validation.street_similarity = 1.5;
        assert!(config.check().is_err());
    }

    #[test]
    fn test_fingerprint_tracks_changes() {
        let a = MatchingConfig::default();
        let mut b = MatchingConfig::default();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.tiers.auto_accept_high = 0.93;
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }
}
