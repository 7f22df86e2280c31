// src/normalize/phonetics.rs - Double Metaphone codes for street and place names
use log::warn;
use rphonetic::{DoubleMetaphone, Encoder};
use serde::{Deserialize, Serialize};

const COMMON_WORDS: &[&str] = &[
    "THE", "AND", "FOR", "WITH", "FLAT", "APARTMENT", "UNIT", "SUITE", "FLOOR", "GROUND",
    "FIRST", "SECOND", "THIRD", "UPPER", "LOWER", "REAR", "FRONT", "SIDE", "NORTH", "SOUTH",
    "EAST", "WEST", "OLD", "NEW", "LITTLE", "GREAT", "LAND", "ADJACENT",
];

/// Primary and alternate Double Metaphone codes of one word.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneticCode {
    pub primary: String,
    pub alternate: String,
}

impl PhoneticCode {
    pub fn of(word: &str) -> Self {
        let word = word.trim().to_uppercase();
        let encoded = std::panic::catch_unwind(|| {
            let encoder = DoubleMetaphone::default();
            (encoder.encode(&word), encoder.encode_alternate(&word))
        });
        match encoded {
            Ok((primary, alternate)) => Self { primary, alternate },
            Err(_) => {
                warn!("DoubleMetaphone panicked on input: {:?}", word);
                Self::default()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty()
    }

    /// Any pairing of primary/alternate codes agrees.
    pub fn matches(&self, other: &PhoneticCode) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        self.primary == other.primary
            || self.primary == other.alternate
            || (!self.alternate.is_empty()
                && (self.alternate == other.primary || self.alternate == other.alternate))
    }
}

pub fn phonetic_match(a: &str, b: &str) -> bool {
    if a.trim().is_empty() || b.trim().is_empty() {
        return false;
    }
    PhoneticCode::of(a).matches(&PhoneticCode::of(b))
}

/// Codes for the significant words of an address: numbers, words of two
/// letters or fewer, and filler words are skipped.
pub fn phonetic_tokens(text: &str) -> Vec<PhoneticCode> {
    text.to_uppercase()
        .split_whitespace()
        .filter(|token| token.len() > 2)
        .filter(|token| token.chars().all(|c| c.is_ascii_alphabetic()))
        .filter(|token| !COMMON_WORDS.contains(token))
        .map(PhoneticCode::of)
        .filter(|code| !code.is_empty())
        .collect()
}

/// Number of codes in `left` with a phonetic twin in `right`.
pub fn phonetic_overlap(left: &[PhoneticCode], right: &[PhoneticCode]) -> usize {
    left.iter()
        .filter(|code| right.iter().any(|other| code.matches(other)))
        .count()
}
