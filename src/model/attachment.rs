//! Deduplicated attachment rows.
//!
//! One row per distinct byte sequence. The row owns the single physical
//! blob reference; messages only point at it.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::digest::Digest256;

/// A content-addressed attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    /// SHA-256 over the raw bytes. The identity key.
    pub attachment_hash: Digest256,
    /// Exact byte length.
    pub size_bytes: u64,
    /// Declared or sniffed MIME type (e.g. `"application/pdf"`).
    pub mime_type: String,
    /// Where the single stored copy lives (`sha256/ab/abcd…`).
    pub canonical_blob_ref: String,
    /// Number of times these bytes were interned.
    pub intern_count: u64,
    /// Every logical owner, in append order. Never shrinks.
    pub references: Vec<AttachmentReference>,
}

/// One message's use of a deduplicated attachment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttachmentReference {
    pub owning_email_id: Uuid,
    pub owning_message_id: Option<String>,
    pub original_filename: String,
    pub original_path: Option<String>,
    /// Run that recorded this reference.
    pub run_id: Option<Uuid>,
}

/// Result of canonicalizing attachment bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentIdentity {
    pub attachment_hash: Digest256,
    pub size_bytes: u64,
    pub mime_type: String,
    /// `true` if the payload was stream-hashed rather than buffered.
    pub streamed: bool,
}
