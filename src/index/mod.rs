//! Batch-wide lookups built before any thread resolution starts.

pub mod identity;

pub use identity::{Handle, IdentityIndex};
