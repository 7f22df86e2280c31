pub mod address;
pub mod config;
pub mod matching;
pub mod stats_models;

pub use address::{AddressComponents, GazetteerEntry, SourceDocument};
pub use config::MatchingConfig;
pub use matching::{Candidate, CandidateFeatures, CandidateMethod, DecisionTag, MatchDecision};
pub use stats_models::{RunScope, RunStats};
