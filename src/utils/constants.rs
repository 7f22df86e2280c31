// src/utils/constants.rs

/// Page size used when neither the CLI nor `MATCH_BATCH_SIZE` sets one.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Rows per multi-VALUES upsert statement; keeps the bind count well under
/// the Postgres limit of 65535 parameters.
pub const UPSERT_CHUNK_ROWS: usize = 1000;

