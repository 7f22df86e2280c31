pub mod batch;
pub mod candidates;
pub mod db;
pub mod features;
pub mod memory;
pub mod orchestrator;
pub mod parser;
pub mod scorer;
pub mod threshold_sweep;
pub mod validator;

pub use batch::{BatchOptions, BatchProcessor, DocumentError, ResultStore};
pub use candidates::{ComponentQuery, Gazetteer, SemanticIndex};
pub use orchestrator::MatchEngine;
