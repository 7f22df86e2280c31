pub mod address;
pub mod phonetics;

pub use address::{
    canonical_address, extract_house_numbers, extract_locality_tokens, grid_distance,
    has_descriptor, normalize_address, tokenize_street, NormalizedAddress,
};
pub use phonetics::{phonetic_overlap, phonetic_tokens};
