// src/normalize/address.rs - Canonical text, postcode and token extraction
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

static POSTCODE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b([A-Z]{1,2}\d[\dA-Z]?\s*\d[ABD-HJLNP-UW-Z]{2})\b").unwrap()
});
static HOUSE_NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d+[A-Z]?)\b").unwrap());
static SUB_UNIT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(FLAT|APT|APARTMENT|UNIT|STUDIO)\s+(\d+[A-Z]?)\b").unwrap()
});

/// Abbreviations expanded by both the canonicalizer and the component parser.
pub const ABBREVIATIONS: &[(&str, &str)] = &[
    ("RD", "ROAD"),
    ("AVE", "AVENUE"),
    ("GDNS", "GARDENS"),
    ("GDN", "GARDEN"),
    ("CT", "COURT"),
    ("DR", "DRIVE"),
    ("LN", "LANE"),
    ("PL", "PLACE"),
    ("SQ", "SQUARE"),
    ("CRES", "CRESCENT"),
    ("CRESC", "CRESCENT"),
    ("TER", "TERRACE"),
    ("CL", "CLOSE"),
    ("CLS", "CLOSE"),
    ("PK", "PARK"),
    ("GRN", "GREEN"),
    ("WY", "WAY"),
    ("WLK", "WALK"),
    ("APT", "APARTMENT"),
    ("FLT", "FLAT"),
    ("BLDG", "BUILDING"),
    ("HSE", "HOUSE"),
    ("CTG", "COTTAGE"),
    ("FM", "FARM"),
    ("MNR", "MANOR"),
    ("VIL", "VILLAS"),
    ("EST", "ESTATE"),
    ("IND", "INDUSTRIAL"),
    ("INDL", "INDUSTRIAL"),
    ("INDUSTR", "INDUSTRIAL"),
    ("CTR", "CENTRE"),
    ("NTH", "NORTH"),
    ("STH", "SOUTH"),
    ("WST", "WEST"),
    ("HANTS", "HAMPSHIRE"),
];

/// Street-type words. They mark the street part of an address, and a
/// following "ST" after one of these is never SAINT.
pub const STREET_TYPES: &[&str] = &[
    "ROAD", "STREET", "LANE", "AVENUE", "DRIVE", "CLOSE", "COURT", "PLACE", "WAY", "SQUARE",
    "CRESCENT", "TERRACE", "GARDENS", "PARK", "GREEN", "HILL", "ROW", "WALK", "ESTATE",
    "INDUSTRIAL", "MEWS", "GROVE",
];

/// East Hampshire settlements and immediate neighbours.
pub const LOCALITIES: &[&str] = &[
    "ALTON", "PETERSFIELD", "LIPHOOK", "WATERLOOVILLE", "HORNDEAN", "BORDON", "WHITEHILL",
    "GRAYSHOTT", "HEADLEY", "BRAMSHOTT", "LINDFORD", "HOLLYWATER", "PASSFIELD", "CONFORD",
    "FOUR MARKS", "MEDSTEAD", "CHAWTON", "SELBORNE", "EMPSHOTT", "HAWKLEY", "LISS", "STEEP",
    "STROUD", "BURITON", "LANGRISH", "EAST MEON", "WEST MEON", "FROXFIELD", "PRIVETT",
    "ROPLEY", "WEST TISTED", "EAST TISTED", "BINSTED", "HOLT POUND", "BENTLEY", "FARNHAM",
    "HASLEMERE", "CLANFIELD", "ROWLANDS CASTLE", "HAMPSHIRE",
];

const STREET_SKIP_WORDS: &[&str] = &[
    "THE", "OF", "AND", "AT", "TO", "FLAT", "UNIT", "APARTMENT", "STUDIO", "LAND", "ADJACENT",
    "REAR", "SITE", "PLOT",
];

const DESCRIPTORS: &[&str] = &["LAND AT", "LAND ADJACENT TO", "REAR OF", "ADJACENT TO", "PLOT", "SITE"];

/// Output of [`normalize_address`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedAddress {
    /// Uppercased, punctuation-free, abbreviation-expanded text without the postcode
    pub canonical: String,
    /// UK postcode with internal whitespace removed
    pub postcode: Option<String>,
    pub tokens: Vec<String>,
}

/// Canonicalizes a raw address. Pure; empty input gives empty output.
pub fn normalize_address(raw: &str) -> NormalizedAddress {
    let upper = raw.to_uppercase();
    if upper.trim().is_empty() {
        return NormalizedAddress::default();
    }

    let (postcode, without_postcode) = match POSTCODE_RE.find_iter(&upper).last() {
        Some(m) => {
            let postcode: String = m.as_str().chars().filter(|c| !c.is_whitespace()).collect();
            let mut rest = String::with_capacity(upper.len());
            rest.push_str(&upper[..m.start()]);
            rest.push(' ');
            rest.push_str(&upper[m.end()..]);
            (Some(postcode), rest)
        }
        None => (None, upper),
    };

    let cleaned: String = without_postcode
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let raw_tokens: Vec<&str> = cleaned.split_whitespace().collect();

    let tokens = expand_tokens(&rewrite_descriptors(&raw_tokens));
    NormalizedAddress {
        canonical: tokens.join(" "),
        postcode,
        tokens,
    }
}

/// Shorthand for `normalize_address(raw).canonical`.
pub fn canonical_address(raw: &str) -> String {
    normalize_address(raw).canonical
}

fn rewrite_descriptors(tokens: &[&str]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tokens.len() + 1);
    let mut i = 0;
    while i < tokens.len() {
        match tokens[i] {
            "PROPOSED" | "FORMER" => {
                i += 1;
            }
            "LAND" if matches!(tokens.get(i + 1), Some(&"ADJ") | Some(&"ADJACENT")) => {
                out.push("LAND".to_string());
                out.push("ADJACENT".to_string());
                out.push("TO".to_string());
                i += 2;
                if tokens.get(i) == Some(&"TO") {
                    i += 1;
                }
            }
            token => {
                out.push(token.to_string());
                i += 1;
            }
        }
    }
    out
}

fn expand_tokens(tokens: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(tokens.len());
    for (i, token) in tokens.iter().enumerate() {
        if token == "ST" {
            let next = tokens.get(i + 1).map(String::as_str);
            out.push(expand_st(out.last().map(String::as_str), next).to_string());
            continue;
        }
        match expand_abbreviation(token) {
            Some(full) => out.push(full.to_string()),
            None => out.push(token.clone()),
        }
    }
    out
}

pub fn expand_abbreviation(token: &str) -> Option<&'static str> {
    ABBREVIATIONS
        .iter()
        .find(|(abbr, _)| *abbr == token)
        .map(|(_, full)| *full)
}

/// "ST" reads as SAINT when it opens a name ("12 ST MARYS ROAD") and as
/// STREET everywhere else ("HIGH ST").
pub(crate) fn expand_st(previous: Option<&str>, next: Option<&str>) -> &'static str {
    let opens_name = match previous {
        None => true,
        Some(prev) => prev.chars().next().map_or(false, |c| c.is_ascii_digit()),
    };
    let followed_by_name = next.map_or(false, |n| {
        n.chars().all(|c| c.is_alphabetic())
            && !is_locality_word(n)
            && !is_street_type(n)
    });
    if opens_name && followed_by_name {
        "SAINT"
    } else {
        "STREET"
    }
}

pub(crate) fn is_locality_word(word: &str) -> bool {
    LOCALITIES.iter().any(|loc| *loc == word)
}

pub(crate) fn is_street_type(word: &str) -> bool {
    STREET_TYPES.contains(&word)
}

/// House number and sub-unit tokens ("12A", "UNIT 3") in order of appearance.
/// The postcode is excluded.
pub fn extract_house_numbers(text: &str) -> Vec<String> {
    let canonical = canonical_address(text);
    let mut seen = BTreeSet::new();
    let mut numbers = Vec::new();

    for caps in SUB_UNIT_RE.captures_iter(&canonical) {
        let kind = match &caps[1] {
            "APT" | "APARTMENT" => "FLAT",
            other => other,
        };
        let unit = format!("{} {}", kind, &caps[2]);
        if seen.insert(unit.clone()) {
            numbers.push(unit);
        }
    }
    for caps in HOUSE_NUMBER_RE.captures_iter(&canonical) {
        let number = caps[1].to_string();
        if seen.insert(number.clone()) {
            numbers.push(number);
        }
    }
    numbers
}

/// Known localities present in the text, sorted.
pub fn extract_locality_tokens(text: &str) -> Vec<String> {
    let padded = format!(" {} ", canonical_address(text));
    LOCALITIES
        .iter()
        .filter(|loc| padded.contains(&format!(" {} ", loc)))
        .map(|loc| loc.to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Street-bearing tokens: numbers, localities, filler words and one-letter
/// tokens are dropped.
pub fn tokenize_street(text: &str) -> Vec<String> {
    let canonical = canonical_address(text);
    let locality_words: BTreeSet<&str> = LOCALITIES
        .iter()
        .filter(|loc| format!(" {} ", canonical).contains(&format!(" {} ", loc)))
        .flat_map(|loc| loc.split_whitespace())
        .collect();

    canonical
        .split_whitespace()
        .filter(|t| t.len() >= 2)
        .filter(|t| !t.chars().next().map_or(false, |c| c.is_ascii_digit()))
        .filter(|t| !locality_words.contains(t))
        .filter(|t| !STREET_SKIP_WORDS.contains(t))
        .map(str::to_string)
        .collect()
}

/// True when the canonical text carries a vague locational descriptor.
pub fn has_descriptor(canonical: &str) -> bool {
    let padded = format!(" {} ", canonical);
    DESCRIPTORS
        .iter()
        .any(|d| padded.contains(&format!(" {} ", d)))
}

/// Straight-line distance in metres between two British National Grid points.
pub fn grid_distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    let de = a.0 - b.0;
    let dn = a.1 - b.1;
    (de * de + dn * dn).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postcode_extracted_and_removed() {
        let n = normalize_address("168 Station Rd, Liss, GU33 7AA");
        assert_eq!(n.postcode.as_deref(), Some("GU337AA"));
        assert_eq!(n.canonical, "168 STATION ROAD LISS");
        assert_eq!(n.tokens, vec!["168", "STATION", "ROAD", "LISS"]);
    }

    #[test]
    fn test_empty_input() {
        let n = normalize_address("   ");
        assert!(n.canonical.is_empty());
        assert!(n.postcode.is_none());
        assert!(n.tokens.is_empty());
    }

    #[test]
    fn test_st_is_context_sensitive() {
        assert_eq!(canonical_address("12 High St, Alton"), "12 HIGH STREET ALTON");
        assert_eq!(canonical_address("12 St Marys Road, Liss"), "12 SAINT MARYS ROAD LISS");
        assert_eq!(canonical_address("St Johns Close"), "SAINT JOHNS CLOSE");
        assert_eq!(canonical_address("4 High St Alton"), "4 HIGH STREET ALTON");
    }

    #[test]
    fn test_house_suffix_and_units_kept_distinct() {
        let n = normalize_address("Flat 2, 12A Mill Lane");
        assert!(n.tokens.contains(&"12A".to_string()));
        assert!(n.tokens.contains(&"FLAT".to_string()));
        assert_eq!(extract_house_numbers("Flat 2, 12A Mill Lane"), vec!["FLAT 2", "2", "12A"]);
    }

    #[test]
    fn test_descriptor_rewrites() {
        assert_eq!(canonical_address("Land adj to 5 Mill Lane"), "LAND ADJACENT TO 5 MILL LANE");
        assert_eq!(canonical_address("Proposed dwelling, former Mill"), "DWELLING MILL");
        assert!(has_descriptor("LAND AT AMEY INDUSTRIAL ESTATE"));
        assert!(!has_descriptor("5 STATION ROAD LISS"));
    }

    #[test]
    fn test_localities_and_street_tokens() {
        assert_eq!(
            extract_locality_tokens("Mill Cottage, Four Marks, Alton"),
            vec!["ALTON".to_string(), "FOUR MARKS".to_string()]
        );
        assert_eq!(
            tokenize_street("168 Station Road, Liss, GU33 7AA"),
            vec!["STATION".to_string(), "ROAD".to_string()]
        );
    }

    #[test]
    fn test_postcode_digits_not_house_numbers() {
        assert_eq!(extract_house_numbers("3 The Square, Liss GU33 7AA"), vec!["3"]);
    }

    #[test]
    fn test_grid_distance() {
        assert_eq!(grid_distance((0.0, 0.0), (300.0, 400.0)), 500.0);
    }
}
