//! `threadline` — evidence threading and deduplication for email archives.
//!
//! Takes a batch of raw message records, reduces each to a canonical form,
//! links replies to their parents with tiered header evidence, groups
//! threads, flags inclusive messages and near-duplicates, deduplicates
//! attachments by content, and reports every inconsistency it sees.
//! Output never depends on the order records arrive in.

pub mod analysis;
pub mod canonical;
pub mod config;
pub mod error;
pub mod export;
pub mod index;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod store;
pub mod thread;

pub use config::Config;
pub use error::{EngineError, Result};
pub use pipeline::{CancelToken, Engine, MessageRecord, RunOutput, RunSummary};
pub use store::AttachmentStore;
