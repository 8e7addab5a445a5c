//! Thread Graph Builder: tiered parent resolution, then grouping.

pub mod graph;
pub mod resolver;

pub use graph::{ThreadGraph, ThreadGroup};
pub use resolver::{Resolution, Resolver};
