// src/models/address.rs
use serde::{Deserialize, Serialize};

/// A historic document address awaiting resolution to a UPRN.
///
/// Owned by the ingestion pipeline; this crate only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    /// Stable identifier of the source document
    pub document_id: i64,

    /// Document classification (planning, land charge, ...), used for scoped runs
    pub doc_type: Option<String>,

    /// Free-text address as captured on the document
    pub raw_address: String,

    /// Legacy UPRN recorded on the document, if any. Often stale or malformed.
    pub raw_uprn: Option<String>,

    /// British National Grid easting in metres
    pub easting: Option<f64>,

    /// British National Grid northing in metres
    pub northing: Option<f64>,
}

impl SourceDocument {
    pub fn new(document_id: i64, raw_address: &str) -> Self {
        Self {
            document_id,
            doc_type: None,
            raw_address: raw_address.to_string(),
            raw_uprn: None,
            easting: None,
            northing: None,
        }
    }

    pub fn with_uprn(mut self, uprn: &str) -> Self {
        self.raw_uprn = Some(uprn.to_string());
        self
    }

    pub fn with_coordinates(mut self, easting: f64, northing: f64) -> Self {
        self.easting = Some(easting);
        self.northing = Some(northing);
        self
    }

    /// Trimmed legacy UPRN, `None` when absent or blank. A zero decimal
    /// suffix left by numeric exports ("1710022145.00") is dropped.
    pub fn legacy_uprn(&self) -> Option<&str> {
        self.raw_uprn
            .as_deref()
            .map(str::trim)
            .map(|uprn| match uprn.split_once('.') {
                Some((whole, fraction)) if fraction.chars().all(|c| c == '0') => whole,
                _ => uprn,
            })
            .filter(|uprn| !uprn.is_empty())
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.easting, self.northing) {
            (Some(e), Some(n)) => Some((e, n)),
            _ => None,
        }
    }
}

/// An authoritative gazetteer (LLPG) address. Read-only to this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GazetteerEntry {
    /// Unique Property Reference Number
    pub uprn: String,

    /// Full display address
    pub full_address: String,

    /// Canonical text, precomputed with the same normalizer as source text
    pub canonical_address: String,

    pub easting: Option<f64>,
    pub northing: Option<f64>,

    /// Whether the LLPG record is live (logical status 1)
    pub is_live: bool,

    /// Unique Street Reference Number
    pub usrn: Option<String>,
}

impl GazetteerEntry {
    /// Builds an entry whose canonical text is derived from `full_address`.
    pub fn new(uprn: &str, full_address: &str) -> Self {
        Self {
            uprn: uprn.to_string(),
            full_address: full_address.to_string(),
            canonical_address: crate::normalize::canonical_address(full_address),
            easting: None,
            northing: None,
            is_live: true,
            usrn: None,
        }
    }

    pub fn with_coordinates(mut self, easting: f64, northing: f64) -> Self {
        self.easting = Some(easting);
        self.northing = Some(northing);
        self
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.easting, self.northing) {
            (Some(e), Some(n)) => Some((e, n)),
            _ => None,
        }
    }
}

/// Structured components parsed from a single address string.
///
/// Built fresh per parse call and never patched afterwards; reparse instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddressComponents {
    /// Primary identifier used for matching: unit/flat designator when one is
    /// present, otherwise the street number (e.g. "UNIT 2", "FLAT A", "12A")
    pub house_number: Option<String>,

    pub street: Option<String>,
    pub locality: Option<String>,

    /// Postcode in "OUTWARD INWARD" form
    pub postcode: Option<String>,

    /// Unit/flat/suite designator when present
    pub sub_building: Option<String>,

    /// Building number that follows a unit/flat designator ("UNIT 7, 4 MILL LANE" → "4")
    pub street_number: Option<String>,

    /// Mean of per-component presence/validity checks, in [0,1]
    pub extraction_confidence: f64,

    pub issues: Vec<String>,

    /// False for vague references ("LAND AT ...") or when house number/street are missing
    pub is_suitable_for_matching: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_uprn_cleanup() {
        let doc = |uprn: &str| SourceDocument::new(1, "1 MILL LANE").with_uprn(uprn);
        assert_eq!(doc(" 1710022145 ").legacy_uprn(), Some("1710022145"));
        assert_eq!(doc("1710022145.00").legacy_uprn(), Some("1710022145"));
        assert_eq!(doc("1710022145.").legacy_uprn(), Some("1710022145"));
        assert_eq!(doc("1710022145.5").legacy_uprn(), Some("1710022145.5"));
        assert_eq!(doc("   ").legacy_uprn(), None);
        assert_eq!(doc(".00").legacy_uprn(), None);
        assert_eq!(SourceDocument::new(2, "1 MILL LANE").legacy_uprn(), None);
    }
}
