// src/matching/validator.rs - Conservative component rules that can veto a match
use once_cell::sync::Lazy;
use regex::Regex;

use crate::matching::features::edit_similarity;
use crate::matching::parser::{format_postcode, parse_address, preprocess};
use crate::models::address::AddressComponents;
use crate::models::config::ValidationThresholds;
use crate::models::matching::{ComponentCheck, ValidationOutcome, ValidationVerdict};

pub const VALIDATOR_VERSION: &str = "conservative-v1";

// Fixed component weights for the overall confidence.
const HOUSE_WEIGHT: f64 = 0.5;
const STREET_WEIGHT: f64 = 0.4;
const POSTCODE_WEIGHT: f64 = 0.1;

static DESIGNATOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(UNIT|FLAT|SUITE)[,\s]+[A-Z0-9]+\b[,\s]*").unwrap());
static SPACES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Uppercase, commas to spaces, single spaces, APT/APARTMENT as FLAT and STE as SUITE.
pub fn normalize_house_number(house: &str) -> String {
    house
        .to_uppercase()
        .replace(',', " ")
        .split_whitespace()
        .map(|token| match token {
            "APT" | "APARTMENT" => "FLAT",
            "STE" => "SUITE",
            other => other,
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Street text with unit designators removed and abbreviations expanded.
pub fn normalize_street(street: &str) -> String {
    let expanded = preprocess(street);
    let stripped = DESIGNATOR_RE.replace_all(&expanded, " ");
    SPACES_RE
        .replace_all(&stripped.replace(',', " "), " ")
        .trim()
        .to_string()
}

fn numeric_part(house: &str) -> Option<u64> {
    let digits: String = house.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

pub fn validate_house_numbers(
    source: &AddressComponents,
    target: &AddressComponents,
    thresholds: &ValidationThresholds,
) -> ComponentCheck {
    let (source_num, target_num) = match (present(&source.house_number), present(&target.house_number)) {
        (Some(s), Some(t)) => (s, t),
        (None, None) => {
            return ComponentCheck::flagged("Missing house number on both addresses".to_string())
        }
        (s, t) => {
            return ComponentCheck::invalid(
                0.0,
                format!(
                    "Missing house number: source='{}', target='{}'",
                    s.unwrap_or_default(),
                    t.unwrap_or_default()
                ),
            )
        }
    };

    if source_num.eq_ignore_ascii_case(target_num) {
        return ComponentCheck::valid(1.0, format!("Exact house number match: '{}'", source_num));
    }

    let source_norm = normalize_house_number(source_num);
    let target_norm = normalize_house_number(target_num);
    if source_norm == target_norm || source_norm.replace(' ', "") == target_norm.replace(' ', "") {
        return ComponentCheck::valid(
            0.95,
            format!("House number variation match: '{}' ≈ '{}'", source_num, target_num),
        );
    }

    if let (Some(a), Some(b)) = (numeric_part(&source_norm), numeric_part(&target_norm)) {
        let diff = a.abs_diff(b);
        if diff > 0 && diff <= thresholds.house_proximity_window as u64 {
            return ComponentCheck::flagged(format!(
                "House number mismatch with proximity concern: {} vs {} (diff: {})",
                source_num, target_num, diff
            ));
        }
    }

    ComponentCheck::invalid(
        0.0,
        format!("House number mismatch: '{}' ≠ '{}'", source_num, target_num),
    )
}

pub fn validate_street_names(
    source: &AddressComponents,
    target: &AddressComponents,
    thresholds: &ValidationThresholds,
) -> ComponentCheck {
    let source_street = source.street.as_deref().map(normalize_street).unwrap_or_default();
    let target_street = target.street.as_deref().map(normalize_street).unwrap_or_default();

    if source_street.is_empty() || target_street.is_empty() {
        return ComponentCheck::invalid(0.0, "Missing street name".to_string());
    }
    if source_street == target_street {
        return ComponentCheck::valid(1.0, format!("Exact street match: '{}'", source_street));
    }

    let similarity = edit_similarity(&source_street, &target_street);
    if similarity >= thresholds.street_similarity {
        return ComponentCheck::valid(
            similarity,
            format!(
                "High street similarity: '{}' ≈ '{}' ({:.2})",
                source_street, target_street, similarity
            ),
        );
    }

    let (shorter, longer) = if source_street.len() <= target_street.len() {
        (&source_street, &target_street)
    } else {
        (&target_street, &source_street)
    };
    if (shorter.len() as f64) < longer.len() as f64 * 0.7 && longer.contains(shorter.as_str()) {
        return ComponentCheck::valid(
            0.9,
            format!("Street abbreviation match: '{}' ≈ '{}'", source_street, target_street),
        );
    }

    ComponentCheck::invalid(
        similarity,
        format!(
            "Insufficient street similarity: '{}' vs '{}' ({:.2} < {:.2})",
            source_street, target_street, similarity, thresholds.street_similarity
        ),
    )
}

pub fn validate_postcodes(
    source: &AddressComponents,
    target: &AddressComponents,
    thresholds: &ValidationThresholds,
) -> ComponentCheck {
    let (source_pc, target_pc) = match (present(&source.postcode), present(&target.postcode)) {
        (Some(s), Some(t)) => (format_postcode(s), format_postcode(t)),
        _ => return ComponentCheck::valid(0.8, "Missing postcode - acceptable for matching".to_string()),
    };

    if source_pc == target_pc {
        return ComponentCheck::valid(1.0, format!("Exact postcode match: '{}'", source_pc));
    }

    let source_district = source_pc.split_whitespace().next().unwrap_or_default();
    let target_district = target_pc.split_whitespace().next().unwrap_or_default();
    if thresholds.allow_postcode_district && source_district == target_district {
        return ComponentCheck::valid(
            0.9,
            format!("Same postcode district: '{}' ≈ '{}'", source_pc, target_pc),
        );
    }

    let similarity = edit_similarity(&source_pc, &target_pc);
    ComponentCheck::invalid(
        similarity,
        format!("Postcode mismatch: '{}' vs '{}' ({:.2})", source_pc, target_pc, similarity),
    )
}

/// Applies the mandatory component rules to one (document, candidate) pair.
#[derive(Debug, Clone)]
pub struct Validator {
    thresholds: ValidationThresholds,
    version: String,
}

impl Validator {
    pub fn new(thresholds: ValidationThresholds, config_version: &str) -> Self {
        Self {
            thresholds,
            version: format!("{}/{}", VALIDATOR_VERSION, config_version),
        }
    }

    pub fn validate(&self, source: &AddressComponents, target: &AddressComponents) -> ValidationOutcome {
        let t = &self.thresholds;
        let house = validate_house_numbers(source, target, t);
        let street = validate_street_names(source, target, t);
        let postcode = validate_postcodes(source, target, t);
        let mut reasons = vec![house.reason.clone(), street.reason.clone(), postcode.reason.clone()];

        let overall = HOUSE_WEIGHT * house.confidence
            + STREET_WEIGHT * street.confidence
            + POSTCODE_WEIGHT * postcode.confidence;

        let suitable = source.is_suitable_for_matching && target.is_suitable_for_matching;
        // Two different house numbers veto even an unsuitable input
        let definite_house_mismatch = present(&source.house_number).is_some()
            && present(&target.house_number).is_some()
            && !house.requires_review;

        let (verdict, confidence, requires_review) =
            if !house.is_valid && (suitable || definite_house_mismatch) {
                (ValidationVerdict::Reject, 0.0, house.requires_review)
            } else if !suitable {
                reasons.insert(0, "Address components could not be reliably extracted".to_string());
                (ValidationVerdict::Reject, 0.0, true)
            } else if !street.is_valid {
                (
                    ValidationVerdict::Reject,
                    street.confidence,
                    street.confidence >= t.review,
                )
            } else if overall >= t.auto_accept {
                (ValidationVerdict::Accept, overall, false)
            } else if overall >= t.review {
                (ValidationVerdict::Review, overall, true)
            } else {
                (ValidationVerdict::Reject, overall, false)
            };

        ValidationOutcome {
            verdict,
            overall_confidence: confidence,
            requires_review,
            house_number: Some(house),
            street: Some(street),
            postcode: Some(postcode),
            reasons,
            version: self.version.clone(),
        }
    }

    /// Parses both addresses and validates the pair.
    pub fn validate_addresses(&self, source: &str, target: &str) -> ValidationOutcome {
        self.validate(&parse_address(source), &parse_address(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> Validator {
        Validator::new(ValidationThresholds::default(), "test")
    }

    fn house(value: &str) -> AddressComponents {
        AddressComponents {
            house_number: Some(value.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_house_number_mismatch_is_hard_veto() {
        let outcome = validator().validate_addresses("168 STATION ROAD, LISS", "147 STATION ROAD, LISS");
        assert_eq!(outcome.verdict, ValidationVerdict::Reject);
        assert!(!outcome.requires_review);
        assert!(outcome.is_hard_veto());
    }

    #[test]
    fn test_house_number_veto_precedes_unsuitable_input() {
        let outcome = validator().validate_addresses("REAR OF 168 STATION ROAD", "147 STATION ROAD");
        assert_eq!(outcome.verdict, ValidationVerdict::Reject);
        assert!(!outcome.requires_review);
        assert!(outcome.is_hard_veto());

        let nearby = validator().validate_addresses("REAR OF 168 STATION ROAD", "169 STATION ROAD");
        assert!(nearby.requires_review);
        assert!(!nearby.is_hard_veto());
    }

    #[test]
    fn test_loosest_thresholds_keep_house_veto() {
        let loose = ValidationThresholds {
            street_similarity: 0.0,
            auto_accept: 0.0,
            review: 0.0,
            house_proximity_window: 0,
            allow_postcode_district: true,
        };
        let outcome = Validator::new(loose, "loose")
            .validate_addresses("168 STATION ROAD, LISS", "147 STATION ROAD, LISS");
        assert_eq!(outcome.verdict, ValidationVerdict::Reject);
        assert!(outcome.is_hard_veto());
    }

    #[test]
    fn test_house_number_proximity_flags_review() {
        let outcome = validator().validate_addresses("168 STATION ROAD, LISS", "169 STATION ROAD, LISS");
        assert_eq!(outcome.verdict, ValidationVerdict::Reject);
        assert!(outcome.requires_review);
        assert!(outcome.house_number.as_ref().map_or(false, |h| h.requires_review));
    }

    #[test]
    fn test_abbreviation_normalized_exact_accepts() {
        let outcome = validator()
            .validate_addresses("168 STATION RD, LISS, GU33 7AA", "168 STATION ROAD, LISS, GU33 7AA");
        assert_eq!(outcome.verdict, ValidationVerdict::Accept);
        assert!((outcome.overall_confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_unit_mismatch_rejects() {
        let outcome = validator().validate_addresses("UNIT 10, MILL LANE, ALTON", "UNIT 7, 4 MILL LANE, ALTON");
        assert_eq!(outcome.verdict, ValidationVerdict::Reject);
        assert!(outcome.is_hard_veto());
    }

    #[test]
    fn test_vague_source_goes_to_review() {
        let outcome = validator().validate_addresses(
            "LAND AT AMEY INDUSTRIAL ESTATE",
            "UNIT 5, AMEY INDUSTRIAL ESTATE, FRENCHMANS ROAD, PETERSFIELD",
        );
        assert_eq!(outcome.verdict, ValidationVerdict::Reject);
        assert!(outcome.requires_review);
    }

    #[test]
    fn test_unit_punctuation_variants_accept() {
        let outcome = validator().validate_addresses(
            "UNIT 2, AMEY INDUSTRIAL EST FRENCHMANS ROAD, PETERSFIELD, HANTS",
            "UNIT, 2 AMEY INDUSTRIAL ESTATE, FRENCHMANS ROAD, PETERSFIELD",
        );
        assert_eq!(outcome.verdict, ValidationVerdict::Accept);
        assert_eq!(outcome.street.as_ref().map(|s| s.confidence), Some(1.0));
    }

    #[test]
    fn test_house_number_levels() {
        let t = ValidationThresholds::default();
        assert_eq!(validate_house_numbers(&house("unit 2"), &house("UNIT 2"), &t).confidence, 1.0);

        let variant = validate_house_numbers(&house("UNIT 2"), &house("UNIT, 2"), &t);
        assert!(variant.is_valid);
        assert_eq!(variant.confidence, 0.95);

        let flat = validate_house_numbers(&house("APT 3"), &house("FLAT 3"), &t);
        assert!(flat.is_valid);

        let both_missing =
            validate_house_numbers(&AddressComponents::default(), &AddressComponents::default(), &t);
        assert!(!both_missing.is_valid && both_missing.requires_review);

        let one_missing = validate_house_numbers(&house("4"), &AddressComponents::default(), &t);
        assert!(!one_missing.is_valid && !one_missing.requires_review);
    }

    #[test]
    fn test_proximity_window_is_tunable() {
        let mut t = ValidationThresholds::default();
        assert!(!validate_house_numbers(&house("10"), &house("13"), &t).requires_review);
        t.house_proximity_window = 3;
        assert!(validate_house_numbers(&house("10"), &house("13"), &t).requires_review);
    }

    #[test]
    fn test_street_and_postcode_rules() {
        let t = ValidationThresholds::default();
        let street = |s: &str| AddressComponents {
            street: Some(s.to_string()),
            ..Default::default()
        };
        let contained = validate_street_names(&street("MILL LANE"), &street("MILL LANE INDUSTRIAL ESTATE"), &t);
        assert!(contained.is_valid);
        assert_eq!(contained.confidence, 0.9);
        assert!(!validate_street_names(&street("MILL LANE"), &street("STATION ROAD"), &t).is_valid);

        let postcode = |p: &str| AddressComponents {
            postcode: Some(p.to_string()),
            ..Default::default()
        };
        assert_eq!(validate_postcodes(&postcode("GU34 2QG"), &postcode("gu342qg"), &t).confidence, 1.0);
        assert_eq!(validate_postcodes(&postcode("GU34 2QG"), &postcode("GU34 2QF"), &t).confidence, 0.9);
        assert_eq!(validate_postcodes(&postcode("GU34 2QG"), &AddressComponents::default(), &t).confidence, 0.8);
        assert!(!validate_postcodes(&postcode("GU34 2QG"), &postcode("PO8 9AB"), &t).is_valid);
    }
}
