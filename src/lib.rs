pub mod matching;
pub mod models;
pub mod normalize;
pub mod utils;
