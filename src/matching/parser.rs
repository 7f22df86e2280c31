// src/matching/parser.rs - Structured component extraction for UK addresses
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::models::address::AddressComponents;
use crate::normalize::address::{
    expand_abbreviation, expand_st, is_street_type, ABBREVIATIONS, LOCALITIES,
};

static ABBREVIATION_RE: Lazy<Regex> = Lazy::new(|| {
    let alternatives: Vec<&str> = ABBREVIATIONS.iter().map(|(abbr, _)| *abbr).collect();
    Regex::new(&format!(r"\b({})\b", alternatives.join("|"))).unwrap()
});
static SAINT_OR_STREET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bST\b(\s+([A-Z]+))?").unwrap());
static SPACES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static UNIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(UNIT|SUITE)[,\s]+(\d+[A-Z]?)\b").unwrap());
static FLAT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(FLAT|APARTMENT|APT)[,\s]+([A-Z0-9]+)\b").unwrap());
static LEADING_NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+[A-Z]?(?:[-/]\d+[A-Z]?)?)\b").unwrap());
static POSTCODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Z]{1,2}\d{1,2}[A-Z]?\s*\d[A-Z]{2})\b").unwrap());
static VALID_POSTCODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{1,2}\d{1,2}[A-Z]?\s*\d[A-Z]{2}$").unwrap());
static VALID_HOUSE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:\d+[A-Z]?(?:[-/]\d+[A-Z]?)?|(?:UNIT|SUITE)\s+\d+[A-Z]?|(?:FLAT|APT|APARTMENT)\s+[A-Z0-9]+)$",
    )
    .unwrap()
});

/// Phrases that describe a location relative to a property rather than the property itself.
pub const VAGUE_PHRASES: &[&str] = &[
    "LAND AT",
    "SITE OF",
    "REAR OF",
    "ADJACENT TO",
    "ADJOINING",
    "NORTH OF",
    "SOUTH OF",
    "EAST OF",
    "WEST OF",
];

const LOCALITY_SUFFIXES: &[&str] = &["FIELD", "FORD", "TON", "HAM", "BURY", "WORTH", "STEAD"];

const MIN_SUITABLE_CONFIDENCE: f64 = 0.6;

/// Uppercases, expands street-type and county abbreviations and collapses
/// spaces. Commas are kept since they drive the street/locality split.
pub fn preprocess(raw: &str) -> String {
    let upper = raw.trim().to_uppercase();
    let expanded = ABBREVIATION_RE.replace_all(&upper, |caps: &Captures| {
        expand_abbreviation(&caps[1]).unwrap_or(&caps[1]).to_string()
    });
    let expanded = expanded.into_owned();
    let with_st = SAINT_OR_STREET_RE.replace_all(&expanded, |caps: &Captures| {
        let start = caps.get(0).map_or(0, |m| m.start());
        let prefix = expanded[..start].trim_end();
        let previous = if prefix.is_empty() || prefix.ends_with(',') {
            None
        } else {
            prefix.split_whitespace().last()
        };
        let next = caps.get(2).map(|m| m.as_str());
        let trailing = caps.get(1).map_or("", |m| m.as_str());
        format!("{}{}", expand_st(previous, next), trailing)
    });
    SPACES_RE.replace_all(&with_st, " ").trim().to_string()
}

/// "GU337AA" / "gu33 7aa" -> "GU33 7AA".
pub fn format_postcode(postcode: &str) -> String {
    let compact: String = postcode
        .to_uppercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if compact.len() >= 5 {
        let split = compact.len() - 3;
        format!("{} {}", &compact[..split], &compact[split..])
    } else {
        compact
    }
}

fn contains_phrase(text: &str, phrase: &str) -> bool {
    let padded = format!(" {} ", text.replace(',', " "));
    padded.contains(&format!(" {} ", phrase))
}

fn strip_leading_vague(text: &str) -> String {
    let mut current = text.trim_start_matches(|c: char| c == ',' || c == ' ').to_string();
    loop {
        let next = VAGUE_PHRASES.iter().find_map(|phrase| {
            current
                .strip_prefix(*phrase)
                .filter(|tail| tail.is_empty() || tail.starts_with(' ') || tail.starts_with(','))
                .map(|tail| tail.trim_start_matches(|c: char| c == ',' || c == ' ').to_string())
        });
        match next {
            Some(stripped) => current = stripped,
            None => return current,
        }
    }
}

struct HouseExtraction {
    house_number: Option<String>,
    sub_building: Option<String>,
    street_number: Option<String>,
    remainder: String,
}

fn extract_house(text: &str) -> HouseExtraction {
    let unit = UNIT_RE.captures(text).or_else(|| FLAT_RE.captures(text));
    if let Some(caps) = unit {
        let (start, end) = caps.get(0).map_or((0, 0), |m| (m.start(), m.end()));
        let designator = format!("{} {}", &caps[1], &caps[2]);
        let before = &text[..start];
        let after = text[end..].trim_start_matches(|c: char| c == ',' || c == ' ');

        let (street_number, after) = match LEADING_NUMBER_RE.find(after) {
            Some(m) => (Some(m.as_str().to_string()), &after[m.end()..]),
            None => (None, after),
        };
        return HouseExtraction {
            house_number: Some(designator.clone()),
            sub_building: Some(designator),
            street_number,
            remainder: format!("{}, {}", before, after),
        };
    }

    let trimmed = text.trim_start();
    match LEADING_NUMBER_RE.find(trimmed) {
        Some(m) => HouseExtraction {
            house_number: Some(m.as_str().to_string()),
            sub_building: None,
            street_number: None,
            remainder: trimmed[m.end()..].to_string(),
        },
        None => HouseExtraction {
            house_number: None,
            sub_building: None,
            street_number: None,
            remainder: text.to_string(),
        },
    }
}

fn has_street_indicator(part: &str) -> bool {
    part.split_whitespace().any(is_street_type)
}

fn looks_like_locality(part: &str) -> bool {
    if LOCALITIES.iter().any(|loc| part.contains(*loc))
        || LOCALITY_SUFFIXES.iter().any(|suffix| part.contains(*suffix))
    {
        return true;
    }
    !part.contains(' ') && part.len() <= 12
}

/// Splits the comma-separated remainder into street and locality.
fn split_street_and_locality(remainder: &str) -> (Option<String>, Option<String>) {
    let parts: Vec<&str> = remainder
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();

    let n = parts.len();
    let mut street_parts: Vec<String> = Vec::new();
    let mut locality_parts: Vec<String> = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        if has_street_indicator(part) {
            street_parts.push(part.to_string());
        } else if i + 2 >= n && (part.len() <= 15 || looks_like_locality(part)) {
            locality_parts.push(part.to_string());
        } else {
            street_parts.push(part.to_string());
        }
    }

    // "STATION ROAD LISS": trailing words after the last street type are the locality
    if street_parts.len() == 1 && locality_parts.is_empty() {
        let words: Vec<&str> = street_parts[0].split_whitespace().collect();
        if let Some(idx) = words.iter().rposition(|w| is_street_type(w)) {
            if idx + 1 < words.len() {
                locality_parts.push(words[idx + 1..].join(" "));
                street_parts[0] = words[..=idx].join(" ");
            }
        }
    }

    let street = (!street_parts.is_empty()).then(|| street_parts.join(", "));
    let locality = (!locality_parts.is_empty()).then(|| locality_parts.join(", "));
    (street, locality)
}

/// Parses a raw address into components. Never fails: unparseable input
/// yields partial components with a low confidence and recorded issues.
pub fn parse_address(raw: &str) -> AddressComponents {
    let cleaned = preprocess(raw);
    if cleaned.is_empty() {
        return AddressComponents {
            issues: vec!["Empty address".to_string()],
            ..Default::default()
        };
    }

    let mut rest = cleaned.clone();
    let postcode = match POSTCODE_RE.find_iter(&cleaned).last() {
        Some(m) => {
            rest.replace_range(m.range(), " ");
            Some(format_postcode(m.as_str()))
        }
        None => None,
    };

    let vague_phrase = VAGUE_PHRASES
        .iter()
        .find(|phrase| contains_phrase(&cleaned, phrase))
        .copied();
    let rest = strip_leading_vague(&rest);

    let house = extract_house(&rest);
    let (street, locality) = split_street_and_locality(&house.remainder);

    let mut components = AddressComponents {
        house_number: house.house_number,
        street,
        locality,
        postcode,
        sub_building: house.sub_building,
        street_number: house.street_number,
        ..Default::default()
    };
    assess(&mut components, vague_phrase);
    components
}

fn assess(components: &mut AddressComponents, vague_phrase: Option<&str>) {
    let mut issues = Vec::new();
    let mut factors = Vec::with_capacity(4);

    match components.house_number.as_deref() {
        None => {
            issues.push("No house number identified".to_string());
            factors.push(0.0);
        }
        Some(h) if VALID_HOUSE_RE.is_match(h) => factors.push(1.0),
        Some(h) => {
            issues.push(format!("Questionable house number: {}", h));
            factors.push(0.5);
        }
    }

    match components.street.as_deref() {
        None => {
            issues.push("No street name identified".to_string());
            factors.push(0.0);
        }
        Some(s) if s.len() < 3 => {
            issues.push("Street name too short".to_string());
            factors.push(0.3);
        }
        Some(_) => factors.push(1.0),
    }

    match components.postcode.as_deref() {
        None => {
            issues.push("No postcode identified".to_string());
            factors.push(0.0);
        }
        Some(p) if VALID_POSTCODE_RE.is_match(p) => factors.push(1.0),
        Some(p) => {
            issues.push(format!("Invalid UK postcode format: {}", p));
            factors.push(0.2);
        }
    }

    if components.locality.is_some() {
        factors.push(1.0);
    } else {
        issues.push("No locality identified".to_string());
        factors.push(0.5);
    }

    let mut confidence = factors.iter().sum::<f64>() / factors.len() as f64;
    let has_house = components.house_number.is_some();
    let has_street = components.street.as_deref().map_or(false, |s| s.len() >= 3);
    let mut suitable = confidence >= MIN_SUITABLE_CONFIDENCE && has_house && has_street;

    if !has_house {
        issues.push("Missing house number - required for precise matching".to_string());
    }
    if let Some(phrase) = vague_phrase {
        issues.push(format!("Vague address contains '{}'", phrase));
        confidence *= 0.5;
        suitable = false;
    }

    components.extraction_confidence = confidence;
    components.issues = issues;
    components.is_suitable_for_matching = suitable;
}
