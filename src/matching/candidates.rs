// src/matching/candidates.rs - Gazetteer collaborators and multi-strategy candidate generation
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::address::{AddressComponents, GazetteerEntry, SourceDocument};
use crate::models::config::MatchingConfig;
use crate::models::matching::{Candidate, CandidateMethod};
use crate::normalize::address::{canonical_address, extract_locality_tokens};
use crate::utils::progress_bars::logging::{LogStage, MatchingLogger};

pub const IDENTIFIER_SCORE: f64 = 1.0;
pub const EXACT_CANONICAL_SCORE: f64 = 0.99;
pub const COMPONENT_SCORE: f64 = 0.85;
pub const STREET_FALLBACK_SCORE: f64 = 0.60;

/// Field-equality lookup. Absent fields are unconstrained.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComponentQuery {
    /// Postcode without internal spaces
    pub postcode: Option<String>,
    pub house_number: Option<String>,
    /// Canonical street text
    pub street: Option<String>,
    pub locality: Option<String>,
}

impl ComponentQuery {
    pub fn is_empty(&self) -> bool {
        self.postcode.is_none()
            && self.house_number.is_none()
            && self.street.is_none()
            && self.locality.is_none()
    }
}

/// Read access to the authoritative address index.
#[async_trait]
pub trait Gazetteer: Send + Sync {
    async fn lookup_by_identifier(&self, uprn: &str) -> Result<Option<GazetteerEntry>>;

    async fn lookup_by_exact_canonical_text(
        &self,
        canonical: &str,
        limit: usize,
    ) -> Result<Vec<GazetteerEntry>>;

    /// Entries with similarity >= `min_score`, best first.
    async fn lookup_by_similarity(
        &self,
        canonical: &str,
        min_score: f64,
        limit: usize,
    ) -> Result<Vec<(GazetteerEntry, f64)>>;

    async fn lookup_by_components(
        &self,
        query: &ComponentQuery,
        limit: usize,
    ) -> Result<Vec<GazetteerEntry>>;
}

/// Optional nearest-neighbour index over gazetteer text.
#[async_trait]
pub trait SemanticIndex: Send + Sync {
    async fn nearest(&self, text: &str, limit: usize) -> Result<Vec<(GazetteerEntry, f64)>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrategyFailure {
    pub method: CandidateMethod,
    pub error: String,
}

/// What one or more strategies produced for a document.
#[derive(Debug, Clone, Default)]
pub struct GenerationReport {
    pub candidates: Vec<Candidate>,
    pub attempted: Vec<CandidateMethod>,
    pub failures: Vec<StrategyFailure>,
}

impl GenerationReport {
    pub fn absorb(&mut self, other: GenerationReport) {
        merge_candidates(&mut self.candidates, other.candidates);
        self.attempted.extend(other.attempted);
        self.failures.extend(other.failures);
    }

    /// Something was tried and nothing answered.
    pub fn all_failed(&self) -> bool {
        !self.attempted.is_empty() && self.failures.len() == self.attempted.len()
    }

    pub fn failure_messages(&self) -> Vec<String> {
        self.failures
            .iter()
            .map(|f| format!("{}: {}", f.method, f.error))
            .collect()
    }
}

/// Folds `incoming` into `pool`, one candidate per UPRN.
pub fn merge_candidates(pool: &mut Vec<Candidate>, incoming: Vec<Candidate>) {
    let mut index: HashMap<String, usize> = pool
        .iter()
        .enumerate()
        .map(|(i, c)| (c.entry.uprn.clone(), i))
        .collect();

    for candidate in incoming {
        match index.get(&candidate.entry.uprn) {
            Some(&i) => pool[i].merge(candidate),
            None => {
                index.insert(candidate.entry.uprn.clone(), pool.len());
                pool.push(candidate);
            }
        }
    }
}

/// Keeps the `max` highest raw scores (ties by UPRN).
pub fn cap_pool(mut pool: Vec<Candidate>, max: usize) -> Vec<Candidate> {
    pool.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.entry.uprn.cmp(&b.entry.uprn))
    });
    pool.truncate(max);
    pool
}

/// Runs the enabled strategies against the gazetteer. Strategy failures are
/// recorded in the report, never raised.
pub struct CandidateGenerator {
    gazetteer: Arc<dyn Gazetteer>,
    semantic: Option<Arc<dyn SemanticIndex>>,
    config: Arc<MatchingConfig>,
}

impl CandidateGenerator {
    pub fn new(
        gazetteer: Arc<dyn Gazetteer>,
        semantic: Option<Arc<dyn SemanticIndex>>,
        config: Arc<MatchingConfig>,
    ) -> Self {
        Self {
            gazetteer,
            semantic,
            config,
        }
    }

    pub fn has_semantic_index(&self) -> bool {
        self.semantic.is_some()
    }

    fn fail(&self, report: &mut GenerationReport, method: CandidateMethod, doc_id: i64, e: anyhow::Error) {
        let message = format!("{:#}", e);
        MatchingLogger::new(LogStage::for_method(method)).log_strategy_failure(method, doc_id, &message);
        report.failures.push(StrategyFailure {
            method,
            error: message,
        });
    }

    pub async fn legacy_identifier(&self, doc: &SourceDocument) -> GenerationReport {
        let mut report = GenerationReport::default();
        let uprn = match doc.legacy_uprn() {
            Some(uprn) if self.config.strategies.legacy_identifier => uprn,
            _ => return report,
        };

        report.attempted.push(CandidateMethod::LegacyUprn);
        match self.gazetteer.lookup_by_identifier(uprn).await {
            Ok(Some(entry)) => report.candidates.push(Candidate::new(
                entry,
                IDENTIFIER_SCORE,
                CandidateMethod::LegacyUprn,
            )),
            Ok(None) => {}
            Err(e) => self.fail(&mut report, CandidateMethod::LegacyUprn, doc.document_id, e),
        }
        report
    }

    pub async fn exact_canonical(&self, doc: &SourceDocument, canonical: &str) -> GenerationReport {
        let mut report = GenerationReport::default();
        if !self.config.strategies.exact_canonical || canonical.is_empty() {
            return report;
        }

        report.attempted.push(CandidateMethod::ExactCanonical);
        match self
            .gazetteer
            .lookup_by_exact_canonical_text(canonical, self.config.generation.exact_limit)
            .await
        {
            Ok(entries) => report.candidates = entries
                .into_iter()
                .map(|e| Candidate::new(e, EXACT_CANONICAL_SCORE, CandidateMethod::ExactCanonical))
                .collect(),
            Err(e) => self.fail(&mut report, CandidateMethod::ExactCanonical, doc.document_id, e),
        }
        report
    }

    /// Similarity, component and street-fallback strategies. `pool_size` is
    /// the number of candidates already found by earlier tiers.
    pub async fn fuzzy_tier(
        &self,
        doc: &SourceDocument,
        canonical: &str,
        components: &AddressComponents,
        pool_size: usize,
    ) -> GenerationReport {
        let limits = &self.config.generation;
        let mut report = GenerationReport::default();

        if self.config.strategies.similarity && !canonical.is_empty() {
            report.attempted.push(CandidateMethod::Similarity);
            match self
                .gazetteer
                .lookup_by_similarity(canonical, limits.similarity_floor, limits.similarity_limit)
                .await
            {
                Ok(hits) => {
                    let source_localities = extract_locality_tokens(&doc.raw_address);
                    let found: Vec<Candidate> = hits
                        .into_iter()
                        .filter(|(entry, _)| locality_compatible(&source_localities, entry))
                        .map(|(entry, sim)| Candidate::new(entry, sim, CandidateMethod::Similarity))
                        .collect();
                    merge_candidates(&mut report.candidates, found);
                }
                Err(e) => self.fail(&mut report, CandidateMethod::Similarity, doc.document_id, e),
            }
        }

        if self.config.strategies.components {
            if let (Some(postcode), Some(house)) = (&components.postcode, &components.house_number) {
                let query = ComponentQuery {
                    postcode: Some(postcode.replace(' ', "")),
                    house_number: Some(canonical_address(house)),
                    ..Default::default()
                };
                report.attempted.push(CandidateMethod::Components);
                match self.gazetteer.lookup_by_components(&query, limits.component_limit).await {
                    Ok(entries) => merge_candidates(
                        &mut report.candidates,
                        entries
                            .into_iter()
                            .map(|e| Candidate::new(e, COMPONENT_SCORE, CandidateMethod::Components))
                            .collect(),
                    ),
                    Err(e) => self.fail(&mut report, CandidateMethod::Components, doc.document_id, e),
                }
            }
        }

        let starved = pool_size + report.candidates.len() < limits.starvation_threshold;
        if self.config.strategies.street_fallback && starved {
            if let Some(street) = components.street.as_deref().map(canonical_address) {
                if street.len() >= 3 {
                    let query = ComponentQuery {
                        street: Some(street),
                        locality: components.locality.as_deref().and_then(first_locality),
                        ..Default::default()
                    };
                    report.attempted.push(CandidateMethod::StreetFallback);
                    match self
                        .gazetteer
                        .lookup_by_components(&query, limits.street_fallback_limit)
                        .await
                    {
                        Ok(entries) => merge_candidates(
                            &mut report.candidates,
                            entries
                                .into_iter()
                                .map(|e| {
                                    Candidate::new(e, STREET_FALLBACK_SCORE, CandidateMethod::StreetFallback)
                                })
                                .collect(),
                        ),
                        Err(e) => {
                            self.fail(&mut report, CandidateMethod::StreetFallback, doc.document_id, e)
                        }
                    }
                }
            }
        }

        report
    }

    pub async fn semantic_tier(&self, doc: &SourceDocument, canonical: &str) -> GenerationReport {
        let mut report = GenerationReport::default();
        let index = match &self.semantic {
            Some(index) if self.config.strategies.semantic && !canonical.is_empty() => index,
            _ => return report,
        };

        report.attempted.push(CandidateMethod::Semantic);
        match index.nearest(canonical, self.config.generation.semantic_limit).await {
            Ok(hits) => {
                report.candidates = hits
                    .into_iter()
                    .map(|(entry, score)| {
                        let mut candidate = Candidate::new(entry, score, CandidateMethod::Semantic);
                        candidate.semantic_score = Some(score);
                        candidate
                    })
                    .collect();
            }
            Err(e) => self.fail(&mut report, CandidateMethod::Semantic, doc.document_id, e),
        }
        report
    }
}

/// Similarity hits must share a locality with the document, unless either
/// side names none.
fn locality_compatible(source_localities: &[String], entry: &GazetteerEntry) -> bool {
    if source_localities.is_empty() {
        return true;
    }
    let entry_localities = extract_locality_tokens(&entry.full_address);
    entry_localities.is_empty() || entry_localities.iter().any(|l| source_localities.contains(l))
}

fn first_locality(locality: &str) -> Option<String> {
    locality
        .split(',')
        .map(canonical_address)
        .find(|l| !l.is_empty() && l != "HAMPSHIRE")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::memory::{FailingGazetteer, InMemoryGazetteer};
    use crate::matching::parser::parse_address;

    fn gazetteer() -> Arc<dyn Gazetteer> {
        Arc::new(InMemoryGazetteer::new(vec![
            GazetteerEntry::new("1001", "168 STATION ROAD, LISS, GU33 7AA"),
            GazetteerEntry::new("1002", "169 STATION ROAD, LISS, GU33 7AA"),
            GazetteerEntry::new("1003", "168 STATION ROAD, ALTON, GU34 1AA"),
            GazetteerEntry::new("2001", "UNIT 5, AMEY INDUSTRIAL ESTATE, FRENCHMANS ROAD, PETERSFIELD"),
        ]))
    }

    fn generator(gazetteer: Arc<dyn Gazetteer>) -> CandidateGenerator {
        CandidateGenerator::new(gazetteer, None, Arc::new(MatchingConfig::default()))
    }

    #[test]
    fn test_merge_keeps_one_per_uprn() {
        let entry = GazetteerEntry::new("1", "1 HIGH STREET, ALTON");
        let mut pool = vec![Candidate::new(entry.clone(), 0.7, CandidateMethod::Similarity)];
        merge_candidates(
            &mut pool,
            vec![
                Candidate::new(entry, 0.85, CandidateMethod::Components),
                Candidate::new(GazetteerEntry::new("2", "2 HIGH STREET, ALTON"), 0.6, CandidateMethod::Similarity),
            ],
        );
        assert_eq!(pool.len(), 2);
        assert_eq!(pool[0].score, 0.85);
        assert_eq!(pool[0].methods, vec![CandidateMethod::Similarity, CandidateMethod::Components]);
    }

    #[test]
    fn test_cap_pool_keeps_best() {
        let pool: Vec<Candidate> = (0..10)
            .map(|i| {
                Candidate::new(
                    GazetteerEntry::new(&i.to_string(), "1 HIGH STREET"),
                    i as f64 / 10.0,
                    CandidateMethod::Similarity,
                )
            })
            .collect();
        let capped = cap_pool(pool, 3);
        let uprns: Vec<&str> = capped.iter().map(|c| c.uprn()).collect();
        assert_eq!(uprns, vec!["9", "8", "7"]);
    }

    #[tokio::test]
    async fn test_legacy_identifier() {
        let g = generator(gazetteer());
        let doc = SourceDocument::new(1, "somewhere").with_uprn(" 1002 ");
        let report = g.legacy_identifier(&doc).await;
        assert_eq!(report.candidates.len(), 1);
        assert_eq!(report.candidates[0].score, IDENTIFIER_SCORE);

        let unknown = SourceDocument::new(2, "somewhere").with_uprn("999");
        let report = g.legacy_identifier(&unknown).await;
        assert!(report.candidates.is_empty());
        assert_eq!(report.attempted, vec![CandidateMethod::LegacyUprn]);
    }

    #[tokio::test]
    async fn test_similarity_filters_other_localities() {
        let g = generator(gazetteer());
        let doc = SourceDocument::new(1, "168 STATION ROAD, LISS");
        let canonical = canonical_address(&doc.raw_address);
        let report = g
            .fuzzy_tier(&doc, &canonical, &parse_address(&doc.raw_address), 0)
            .await;
        let uprns: Vec<&str> = report.candidates.iter().map(|c| c.uprn()).collect();
        assert!(uprns.contains(&"1001"));
        assert!(uprns.contains(&"1002"));
        assert!(!uprns.contains(&"1003"));
    }

    #[tokio::test]
    async fn test_street_fallback_for_vague_input() {
        let g = generator(gazetteer());
        let doc = SourceDocument::new(1, "LAND AT AMEY INDUSTRIAL ESTATE");
        let canonical = canonical_address(&doc.raw_address);
        let report = g
            .fuzzy_tier(&doc, &canonical, &parse_address(&doc.raw_address), 0)
            .await;
        assert!(report.attempted.contains(&CandidateMethod::StreetFallback));
        let fallback = report.candidates.iter().find(|c| c.uprn() == "2001");
        assert!(fallback.map_or(false, |c| c.methods.contains(&CandidateMethod::StreetFallback)));
    }

    #[tokio::test]
    async fn test_failures_are_recorded_not_raised() {
        let g = generator(Arc::new(FailingGazetteer));
        let doc = SourceDocument::new(1, "168 STATION ROAD, LISS, GU33 7AA");
        let canonical = canonical_address(&doc.raw_address);
        let mut report = g.exact_canonical(&doc, &canonical).await;
        report.absorb(
            g.fuzzy_tier(&doc, &canonical, &parse_address(&doc.raw_address), 0)
                .await,
        );
        assert!(report.candidates.is_empty());
        assert!(report.all_failed());
        assert_eq!(report.failures.len(), report.attempted.len());
        assert!(report.failure_messages()[0].starts_with("addr_exact"));
    }
}
