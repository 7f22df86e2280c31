// src/matching/features.rs - Typed similarity features for a (document, candidate) pair
use std::collections::{HashMap, HashSet};

use crate::models::address::{GazetteerEntry, SourceDocument};
use crate::models::config::SpatialSettings;
use crate::models::matching::{Candidate, CandidateFeatures, DistanceBand};
use crate::normalize::address::{
    canonical_address, extract_house_numbers, extract_locality_tokens, grid_distance,
    has_descriptor, tokenize_street,
};
use crate::normalize::phonetics::{phonetic_overlap, phonetic_tokens, PhoneticCode};

/// Everything about one address that the features need, computed once.
#[derive(Debug, Clone, Default)]
pub struct AddressProfile {
    pub canonical: String,
    pub house_numbers: Vec<String>,
    pub localities: Vec<String>,
    pub street_tokens: Vec<String>,
    pub phonetic: Vec<PhoneticCode>,
    pub has_descriptor: bool,
    pub coordinates: Option<(f64, f64)>,
}

impl AddressProfile {
    pub fn from_text(raw: &str, coordinates: Option<(f64, f64)>) -> Self {
        let canonical = canonical_address(raw);
        let localities = extract_locality_tokens(raw);
        let street_tokens = tokenize_street(raw);

        let mut phonetic_source = street_tokens.join(" ");
        for locality in &localities {
            phonetic_source.push(' ');
            phonetic_source.push_str(locality);
        }

        Self {
            has_descriptor: has_descriptor(&canonical),
            house_numbers: extract_house_numbers(raw),
            phonetic: phonetic_tokens(&phonetic_source),
            canonical,
            localities,
            street_tokens,
            coordinates,
        }
    }

    pub fn from_document(doc: &SourceDocument) -> Self {
        Self::from_text(&doc.raw_address, doc.coordinates())
    }

    pub fn from_entry(entry: &GazetteerEntry) -> Self {
        let mut profile = Self::from_text(&entry.full_address, entry.coordinates());
        profile.canonical = entry.canonical_address.clone();
        profile
    }

    fn primary_house_number(&self) -> Option<&str> {
        self.house_numbers.first().map(String::as_str)
    }
}

fn padded_trigrams(text: &str) -> HashSet<String> {
    let mut grams = HashSet::new();
    let lowered = text.to_lowercase();
    for word in lowered.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
        let padded: Vec<char> = format!("  {} ", word).chars().collect();
        for window in padded.windows(3) {
            grams.insert(window.iter().collect());
        }
    }
    grams
}

/// Trigram similarity in the pg_trgm sense: each word is padded with two
/// leading blanks and one trailing blank, then |A∩B| / |A∪B|.
pub fn trigram_similarity(a: &str, b: &str) -> f64 {
    let left = padded_trigrams(a);
    let right = padded_trigrams(b);
    if left.is_empty() && right.is_empty() {
        return 0.0;
    }
    let shared = left.intersection(&right).count();
    let union = left.len() + right.len() - shared;
    shared as f64 / union as f64
}

pub fn edit_similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(a, b)
}

/// Cosine over token multisets; both empty is a perfect match, one empty is none.
pub fn token_cosine(a: &[String], b: &[String]) -> f64 {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return 1.0,
        (true, false) | (false, true) => return 0.0,
        _ => {}
    }
    fn count(tokens: &[String]) -> HashMap<&str, f64> {
        let mut counts: HashMap<&str, f64> = HashMap::new();
        for token in tokens {
            *counts.entry(token.as_str()).or_insert(0.0) += 1.0;
        }
        counts
    }
    let left = count(a);
    let right = count(b);

    let dot: f64 = left
        .iter()
        .filter_map(|(token, x)| right.get(token).map(|y| x * y))
        .sum();
    let norm_left: f64 = left.values().map(|x| x * x).sum::<f64>().sqrt();
    let norm_right: f64 = right.values().map(|y| y * y).sum::<f64>().sqrt();
    dot / (norm_left * norm_right)
}

/// Overlap divided by the smaller set.
pub fn overlap_coefficient(a: &[String], b: &[String]) -> f64 {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return 1.0,
        (true, false) | (false, true) => return 0.0,
        _ => {}
    }
    let left: HashSet<&String> = a.iter().collect();
    let right: HashSet<&String> = b.iter().collect();
    let shared = left.intersection(&right).count();
    shared as f64 / left.len().min(right.len()) as f64
}

/// Share of the document's localities found on the candidate; 0 when the
/// document names none.
fn locality_overlap(source: &[String], candidate: &[String]) -> f64 {
    if source.is_empty() {
        return 0.0;
    }
    let hits = source.iter().filter(|l| candidate.contains(l)).count();
    hits as f64 / source.len() as f64
}

pub fn spatial_boost(distance: f64, settings: &SpatialSettings) -> f64 {
    if distance >= settings.boost_cutoff_meters || settings.boost_cutoff_meters <= 0.0 {
        0.0
    } else {
        settings.max_boost * (1.0 - distance / settings.boost_cutoff_meters)
    }
}

/// Computes the full feature record. Pure: the same inputs always give the same record.
pub fn compute_features(
    doc: &SourceDocument,
    source: &AddressProfile,
    candidate: &Candidate,
    spatial: &SpatialSettings,
) -> CandidateFeatures {
    let target = AddressProfile::from_entry(&candidate.entry);

    let (same_house_number, same_house_alpha) =
        match (source.primary_house_number(), target.primary_house_number()) {
            (Some(a), Some(b)) if a == b => {
                (true, a.chars().last().map_or(false, |c| c.is_ascii_alphabetic()))
            }
            _ => (false, false),
        };

    let distance_meters = match (source.coordinates, target.coordinates) {
        (Some(a), Some(b)) => Some(grid_distance(a, b)),
        _ => None,
    };

    CandidateFeatures {
        trigram: trigram_similarity(&source.canonical, &target.canonical),
        jaro: strsim::jaro(&source.canonical, &target.canonical),
        edit_similarity: edit_similarity(&source.canonical, &target.canonical),
        token_cosine: token_cosine(
            &tokens_of(&source.canonical),
            &tokens_of(&target.canonical),
        ),
        embedding_cosine: candidate.semantic_score.unwrap_or(0.0),
        same_house_number,
        same_house_alpha,
        locality_overlap: locality_overlap(&source.localities, &target.localities),
        street_overlap: overlap_coefficient(&source.street_tokens, &target.street_tokens),
        phonetic_hits: phonetic_overlap(&source.phonetic, &target.phonetic),
        phonetic_applicable: !source.phonetic.is_empty(),
        descriptor_mismatch: source.has_descriptor != target.has_descriptor,
        distance_meters,
        distance_band: distance_meters.map(DistanceBand::from_meters),
        spatial_boost: distance_meters.map_or(0.0, |d| spatial_boost(d, spatial)),
        legacy_uprn_valid: doc
            .legacy_uprn()
            .map_or(false, |uprn| uprn == candidate.entry.uprn),
        gazetteer_live: candidate.entry.is_live,
    }
}

fn tokens_of(canonical: &str) -> Vec<String> {
    canonical.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::matching::CandidateMethod;

    fn candidate(uprn: &str, address: &str) -> Candidate {
        Candidate::new(GazetteerEntry::new(uprn, address), 0.8, CandidateMethod::Similarity)
    }

    #[test]
    fn test_trigram_similarity_bounds() {
        assert_eq!(trigram_similarity("STATION ROAD", "STATION ROAD"), 1.0);
        assert_eq!(trigram_similarity("", ""), 0.0);
        assert_eq!(trigram_similarity("ABC", "XYZ"), 0.0);
        let partial = trigram_similarity("STATION ROAD", "STATON ROAD");
        assert!(partial > 0.4 && partial < 1.0);
    }

    #[test]
    fn test_token_measures() {
        let a: Vec<String> = vec!["MILL".into(), "LANE".into()];
        let b: Vec<String> = vec!["MILL".into(), "LANE".into(), "ALTON".into()];
        assert_eq!(overlap_coefficient(&a, &b), 1.0);
        assert_eq!(overlap_coefficient(&a, &[]), 0.0);
        assert_eq!(overlap_coefficient(&[], &[]), 1.0);
        assert!((token_cosine(&a, &b) - 2.0 / 6f64.sqrt()).abs() < 1e-9);
        assert_eq!(token_cosine(&[], &[]), 1.0);
        assert_eq!(token_cosine(&a, &[]), 0.0);
        let repeated: Vec<String> = vec!["MILL".into(), "MILL".into(), "LANE".into()];
        assert!((token_cosine(&repeated, &a) - 3.0 / (5f64.sqrt() * 2f64.sqrt())).abs() < 1e-9);
    }

    #[test]
    fn test_spatial_boost_decays_to_zero() {
        let settings = SpatialSettings::default();
        assert!((spatial_boost(0.0, &settings) - 0.10).abs() < 1e-12);
        assert!((spatial_boost(1000.0, &settings) - 0.05).abs() < 1e-12);
        assert_eq!(spatial_boost(2000.0, &settings), 0.0);
        assert_eq!(spatial_boost(5000.0, &settings), 0.0);
    }

    #[test]
    fn test_house_number_features() {
        let doc = SourceDocument::new(1, "12A MILL LANE, ALTON");
        let source = AddressProfile::from_document(&doc);
        let settings = SpatialSettings::default();

        let same = compute_features(&doc, &source, &candidate("1", "12A MILL LANE, ALTON"), &settings);
        assert!(same.same_house_number);
        assert!(same.same_house_alpha);
        assert_eq!(same.locality_overlap, 1.0);
        assert_eq!(same.street_overlap, 1.0);
        assert!(same.phonetic_hits >= 2);

        let other = compute_features(&doc, &source, &candidate("2", "14 MILL LANE, ALTON"), &settings);
        assert!(!other.same_house_number);
        assert!(other.trigram < same.trigram);
    }

    #[test]
    fn test_descriptor_and_legacy_flags() {
        let doc = SourceDocument::new(1, "LAND AT MILL LANE, ALTON").with_uprn("100");
        let source = AddressProfile::from_document(&doc);
        let features = compute_features(
            &doc,
            &source,
            &candidate("100", "5 MILL LANE, ALTON"),
            &SpatialSettings::default(),
        );
        assert!(features.descriptor_mismatch);
        assert!(features.legacy_uprn_valid);
        assert!(features.distance_meters.is_none());
    }

    #[test]
    fn test_distance_features() {
        let doc = SourceDocument::new(1, "5 MILL LANE, ALTON").with_coordinates(471000.0, 139000.0);
        let source = AddressProfile::from_document(&doc);
        let mut near = candidate("1", "5 MILL LANE, ALTON");
        near.entry = near.entry.with_coordinates(471300.0, 139400.0);
        let features = compute_features(&doc, &source, &near, &SpatialSettings::default());
        assert_eq!(features.distance_meters, Some(500.0));
        assert_eq!(features.distance_band, Some(DistanceBand::Within500m));
        assert!((features.spatial_boost - 0.075).abs() < 1e-9);
    }
}
