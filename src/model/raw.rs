//! Upstream records as handed over by the archive reader.
//!
//! Every field is optional or defaulted: the reader makes no promise
//! about completeness, and the canonicalizer never rejects a record.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// One message as extracted from the source archive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawMessage {
    /// `Message-ID` as extracted (brackets, case and whitespace untouched).
    pub message_id: Option<String>,
    /// `In-Reply-To` as extracted.
    pub in_reply_to: Option<String>,
    /// Raw `References` header value.
    pub references_raw: Option<String>,
    /// MAPI conversation index, hex encoded.
    pub conversation_index_raw: Option<String>,
    /// Subject as extracted (may contain RFC 2047 encoded words).
    pub subject: Option<String>,
    /// Body exactly as extracted.
    pub body_raw: RawBody,
    /// Full raw header block, used to recover fields the reader missed.
    pub headers: Option<String>,
    /// `From` value(s).
    pub sender: Option<String>,
    /// Recipient lists.
    pub recipients: Recipients,
    /// Date as extracted (RFC 2822, RFC 3339 or worse).
    pub date_sent: Option<String>,
    /// Attachments with their payloads.
    pub attachments: Vec<RawAttachment>,
}

/// Body payload: decoded text, or bytes in an unknown charset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawBody {
    Text(String),
    Bytes(Vec<u8>),
}

impl Default for RawBody {
    fn default() -> Self {
        RawBody::Text(String::new())
    }
}

/// Recipient lists; each entry may be a single address or a list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Recipients {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
}

/// One attachment of a raw message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawAttachment {
    /// Filename as it appeared in the message. Generated if missing.
    #[serde(default)]
    pub filename: Option<String>,
    /// Folder path inside the source archive.
    #[serde(default)]
    pub path: Option<String>,
    /// Declared MIME type, if the reader saw one.
    #[serde(default)]
    pub content_type: Option<String>,
    /// Where the payload bytes are.
    pub content: AttachmentSource,
}

/// Location of an attachment payload.
///
/// `File` payloads larger than the hashing limit are streamed through the
/// hasher rather than buffered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentSource {
    /// Bytes already in memory.
    Bytes(Vec<u8>),
    /// Bytes in a file written by the archive reader.
    File(PathBuf),
}

impl RawMessage {
    /// Convenience constructor used by tests and drivers.
    pub fn new(message_id: Option<&str>, subject: &str, body: &str) -> Self {
        Self {
            message_id: message_id.map(String::from),
            subject: Some(subject.to_string()),
            body_raw: RawBody::Text(body.to_string()),
            ..Default::default()
        }
    }
}

/// Read upstream records, one JSON object per line. Blank lines are
/// skipped; any other undecodable line fails the whole read.
pub fn read_records<R: BufRead>(reader: R) -> Result<Vec<RawMessage>> {
    let mut records = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| EngineError::InvalidInput {
            line: i + 1,
            reason: e.to_string(),
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|e| EngineError::InvalidInput {
            line: i + 1,
            reason: e.to_string(),
        })?;
        records.push(record);
    }
    Ok(records)
}

/// [`read_records`] from a file.
pub fn load_records(path: &Path) -> Result<Vec<RawMessage>> {
    let file = File::open(path).map_err(|e| EngineError::io(path, e))?;
    read_records(BufReader::new(file))
}
