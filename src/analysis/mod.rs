//! Inclusivity and near-duplicate analysis.

pub mod inclusivity;
pub mod near_dup;

pub use inclusivity::MessageContent;
pub use near_dup::{NearDup, NearDupAnalyzer};
