//! Canonical message record: identity fields used for threading plus the
//! assignments made by the engine.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::digest::{hex_bytes, Digest256};

/// A message reduced to its hashable, comparable form.
///
/// The raw record is never replaced by this; it travels next to it to
/// persistence untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalMessage {
    /// Deterministic record identifier (stable across runs and input orders).
    pub email_id: Uuid,

    /// Normalized `Message-ID` (no brackets, lowercase). Absent if missing or empty.
    pub message_id: Option<String>,
    /// Normalized `In-Reply-To`.
    pub in_reply_to: Option<String>,
    /// Normalized `References`, oldest → newest, de-duplicated.
    pub references: Vec<String>,
    /// Decoded MAPI conversation index bytes.
    #[serde(with = "hex_bytes")]
    pub conversation_index: Option<Vec<u8>>,
    /// Subject with reply/forward prefixes stripped, whitespace collapsed, case-folded.
    pub subject_normalized: String,
    /// The raw subject opened with a forward prefix.
    #[serde(default)]
    pub is_forward: bool,
    /// SHA-256 over the canonical body.
    pub content_hash: Digest256,
    /// Canonical body text. Identity/comparison only; not persisted.
    #[serde(skip)]
    pub canonical_body: String,
    /// Names of banner/footer rules that fired during canonicalization.
    pub stripped_rules: Vec<String>,

    pub sender: BTreeSet<String>,
    pub recipients_to: BTreeSet<String>,
    pub recipients_cc: BTreeSet<String>,
    /// `None` when the source date was missing or unparseable.
    pub date_sent: Option<DateTime<Utc>>,

    /// Attachments referenced by this message (payloads live in the dedup store).
    pub attachments: Vec<MessageAttachment>,

    // ── Assigned by the engine ──────────────────────────────────
    pub thread_group_id: String,
    /// `message_id` of the parent (or its `email_id` if it has none).
    pub parent_message_id: Option<String>,
    pub parent_email_id: Option<Uuid>,
    pub thread_path: String,
    pub is_inclusive: bool,
    pub near_dup_group_id: Option<String>,
    pub near_dup_score: Option<f64>,
}

/// A message's handle on one deduplicated attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAttachment {
    pub attachment_hash: Digest256,
    pub original_filename: String,
    pub original_path: Option<String>,
}

impl CanonicalMessage {
    /// Every address on the message: sender, To and Cc.
    pub fn participants(&self) -> BTreeSet<String> {
        self.sender
            .iter()
            .chain(self.recipients_to.iter())
            .chain(self.recipients_cc.iter())
            .cloned()
            .collect()
    }

    /// Chronological ordering used everywhere a tie must be broken:
    /// dated messages first by date, undated last, then by `email_id`.
    pub fn chrono_cmp(&self, other: &Self) -> Ordering {
        chrono_key(self.date_sent, self.email_id).cmp(&chrono_key(other.date_sent, other.email_id))
    }

    /// `message_id` if present, otherwise the `email_id` as text.
    pub fn display_id(&self) -> String {
        self.message_id
            .clone()
            .unwrap_or_else(|| self.email_id.to_string())
    }
}

/// Sort key behind [`CanonicalMessage::chrono_cmp`].
pub fn chrono_key(date: Option<DateTime<Utc>>, id: Uuid) -> (bool, Option<DateTime<Utc>>, Uuid) {
    (date.is_none(), date, id)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Small builder for canonical messages in unit tests.

    use chrono::TimeZone;

    use super::*;
    use crate::canonical::hash::sha256;

    pub(crate) struct MessageBuilder(CanonicalMessage);

    /// Message `n` with the given id, dated `2024-01-01 + n hours`.
    pub(crate) fn msg(n: u128, message_id: Option<&str>) -> MessageBuilder {
        let date = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
            + chrono::Duration::hours(n as i64);
        MessageBuilder(CanonicalMessage {
            email_id: Uuid::from_u128(n),
            message_id: message_id.map(String::from),
            in_reply_to: None,
            references: Vec::new(),
            conversation_index: None,
            subject_normalized: "topic".into(),
            is_forward: false,
            content_hash: sha256(b""),
            canonical_body: String::new(),
            stripped_rules: Vec::new(),
            sender: BTreeSet::from([format!("user{n}@example.com")]),
            recipients_to: BTreeSet::from(["team@example.com".to_string()]),
            recipients_cc: BTreeSet::new(),
            date_sent: Some(date),
            attachments: Vec::new(),
            thread_group_id: String::new(),
            parent_message_id: None,
            parent_email_id: None,
            thread_path: String::new(),
            is_inclusive: false,
            near_dup_group_id: None,
            near_dup_score: None,
        })
    }

    impl MessageBuilder {
        pub(crate) fn reply_to(mut self, id: &str) -> Self {
            self.0.in_reply_to = Some(id.to_string());
            self
        }

        pub(crate) fn references(mut self, ids: &[&str]) -> Self {
            self.0.references = ids.iter().map(|s| s.to_string()).collect();
            self
        }

        pub(crate) fn subject(mut self, subject: &str) -> Self {
            self.0.subject_normalized = subject.to_string();
            self
        }

        pub(crate) fn forward(mut self) -> Self {
            self.0.is_forward = true;
            self
        }

        pub(crate) fn hours(mut self, hours: i64) -> Self {
            self.0.date_sent = Some(
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::hours(hours),
            );
            self
        }

        pub(crate) fn undated(mut self) -> Self {
            self.0.date_sent = None;
            self
        }

        pub(crate) fn body(mut self, body: &str) -> Self {
            self.0.canonical_body = body.to_string();
            self.0.content_hash = sha256(body.as_bytes());
            self
        }

        pub(crate) fn conversation_index(mut self, bytes: Vec<u8>) -> Self {
            self.0.conversation_index = Some(bytes);
            self
        }

        pub(crate) fn participants(mut self, sender: &str, to: &[&str]) -> Self {
            self.0.sender = BTreeSet::from([sender.to_string()]);
            self.0.recipients_to = to.iter().map(|s| s.to_string()).collect();
            self
        }

        pub(crate) fn attachment(mut self, filename: &str, bytes: &[u8]) -> Self {
            self.0.attachments.push(MessageAttachment {
                attachment_hash: sha256(bytes),
                original_filename: filename.to_string(),
                original_path: None,
            });
            self
        }

        pub(crate) fn build(self) -> CanonicalMessage {
            self.0
        }
    }
}
