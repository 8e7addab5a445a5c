//! Attachment storage.

pub mod dedup;

pub use dedup::{AttachmentStore, Blob};
