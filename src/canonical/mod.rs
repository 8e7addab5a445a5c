//! Canonicalizer: raw records to hashable, comparable form.
//!
//! Never fails on malformed message data. Missing or broken fields become
//! absent values plus an anomaly; the raw record is left untouched.

pub mod body;
pub mod conversation_index;
pub mod hash;
pub mod header;
pub mod patterns;

use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::config::Config;
use crate::error::Result;
use crate::model::address::address_set;
use crate::model::anomaly::{Anomaly, AnomalyKind};
use crate::model::attachment::AttachmentIdentity;
use crate::model::digest::Digest256;
use crate::model::message::CanonicalMessage;
use crate::model::raw::{AttachmentSource, RawAttachment, RawBody, RawMessage};

use self::body::{canonicalize_body, decode_body};
use self::header::{
    decode_encoded_words, is_forward_subject, normalize_message_id, normalize_subject, parse_date,
    parse_references, HeaderBlock,
};
use self::patterns::PatternSet;

/// Namespace for record identifiers.
pub const EMAIL_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_93d7_4b0a_8e55_1d2c_7a90_e3b4);

/// A canonical message with the anomalies observed while building it.
#[derive(Debug, Clone)]
pub struct Canonicalized {
    pub message: CanonicalMessage,
    pub anomalies: Vec<Anomaly>,
}

/// Turns raw records into canonical ones using a compiled pattern table.
#[derive(Debug, Clone)]
pub struct Canonicalizer {
    patterns: PatternSet,
    max_buffered_bytes: u64,
}

impl Canonicalizer {
    /// Compile the configured pattern table.
    pub fn new(config: &Config) -> Result<Self> {
        let patterns =
            PatternSet::compile(&config.canonical.ruleset_version, &config.canonical.patterns)?;
        Ok(Self {
            patterns,
            max_buffered_bytes: config.attachments.max_attachment_bytes_for_hashing,
        })
    }

    pub fn with_patterns(patterns: PatternSet, max_buffered_bytes: u64) -> Self {
        Self {
            patterns,
            max_buffered_bytes,
        }
    }

    pub fn patterns(&self) -> &PatternSet {
        &self.patterns
    }

    /// Canonicalize one message. Attachments are left to
    /// [`Canonicalizer::canonicalize_attachment`]; the returned message has
    /// an empty attachment list.
    pub fn canonicalize_message(&self, raw: &RawMessage, email_id: Uuid) -> Canonicalized {
        let headers = raw
            .headers
            .as_deref()
            .map(HeaderBlock::parse)
            .unwrap_or_default();
        let mut anomalies = Vec::new();

        let raw_id = field_or_header(raw.message_id.as_deref(), &headers, "message-id");
        let message_id = raw_id.and_then(normalize_message_id);
        if message_id.is_none() {
            anomalies.push(
                Anomaly::new(
                    AnomalyKind::MissingMessageId,
                    vec![email_id],
                    match raw_id {
                        Some(_) => "Message-ID present but unusable",
                        None => "no Message-ID",
                    },
                )
                .with_evidence("raw_message_id", raw_id.unwrap_or_default()),
            );
        }

        let in_reply_to = field_or_header(raw.in_reply_to.as_deref(), &headers, "in-reply-to")
            .and_then(normalize_message_id);

        let references = field_or_header(raw.references_raw.as_deref(), &headers, "references")
            .map(parse_references)
            .unwrap_or_default();

        let conversation_index = self.conversation_index(raw, &headers, email_id, &mut anomalies);

        let subject_raw = field_or_header(raw.subject.as_deref(), &headers, "subject")
            .map(decode_encoded_words)
            .unwrap_or_default();
        let subject = normalize_subject(&subject_raw);
        let is_forward = is_forward_subject(&subject_raw);

        let raw_date = field_or_header(raw.date_sent.as_deref(), &headers, "date");
        let date_sent = raw_date.and_then(parse_date);
        if let (Some(value), None) = (raw_date, date_sent) {
            anomalies.push(
                Anomaly::new(
                    AnomalyKind::UnparseableDate,
                    vec![email_id],
                    "date could not be parsed; message sorts after dated messages",
                )
                .with_evidence("raw_date", value),
            );
        }

        let sender = address_set(&header_list(raw.sender.as_deref(), &headers, "from"));
        let recipients_to = address_set(&list_or_header(&raw.recipients.to, &headers, "to"));
        let recipients_cc = address_set(&list_or_header(&raw.recipients.cc, &headers, "cc"));

        let body = canonicalize_body(&decode_body(&raw.body_raw), &self.patterns);
        let content_hash = hash::sha256(body.text.as_bytes());

        debug!(
            email_id = %email_id,
            message_id = message_id.as_deref().unwrap_or("-"),
            rules = body.stripped_rules.len(),
            "canonicalized message"
        );

        Canonicalized {
            message: CanonicalMessage {
                email_id,
                message_id,
                in_reply_to,
                references,
                conversation_index,
                subject_normalized: subject,
                is_forward,
                content_hash,
                canonical_body: body.text,
                stripped_rules: body.stripped_rules,
                sender,
                recipients_to,
                recipients_cc,
                date_sent,
                attachments: Vec::new(),
                thread_group_id: String::new(),
                parent_message_id: None,
                parent_email_id: None,
                thread_path: String::new(),
                is_inclusive: false,
                near_dup_group_id: None,
                near_dup_score: None,
            },
            anomalies,
        }
    }

    /// Hash and type one attachment. Returns the payload bytes when they
    /// were buffered (always for in-memory sources, for files up to the
    /// hashing limit).
    pub fn canonicalize_attachment(
        &self,
        attachment: &RawAttachment,
        filename: &str,
    ) -> Result<(AttachmentIdentity, Option<Vec<u8>>)> {
        hash::identify_source(
            &attachment.content,
            filename,
            attachment.content_type.as_deref(),
            self.max_buffered_bytes,
        )
    }

    /// `(attachment_hash, size, mime_type)` of in-memory bytes.
    pub fn canonicalize_attachment_bytes(&self, bytes: &[u8], filename: &str) -> AttachmentIdentity {
        hash::identify_bytes(bytes, filename, None)
    }

    fn conversation_index(
        &self,
        raw: &RawMessage,
        headers: &HeaderBlock,
        email_id: Uuid,
        anomalies: &mut Vec<Anomaly>,
    ) -> Option<Vec<u8>> {
        let (value, decoded) = match raw.conversation_index_raw.as_deref().map(str::trim) {
            Some(hex) if !hex.is_empty() => (hex, conversation_index::from_hex(hex)),
            _ => {
                let b64 = headers.get("thread-index")?;
                (b64, conversation_index::from_base64(b64))
            }
        };
        match decoded {
            Ok(idx) => Some(idx.into_bytes()),
            Err(e) => {
                anomalies.push(
                    Anomaly::new(
                        AnomalyKind::MalformedConversationIndex,
                        vec![email_id],
                        e.to_string(),
                    )
                    .with_evidence("raw_conversation_index", value),
                );
                None
            }
        }
    }
}

fn field_or_header<'a>(field: Option<&'a str>, headers: &'a HeaderBlock, name: &str) -> Option<&'a str> {
    field
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| headers.get(name))
}

fn header_list(field: Option<&str>, headers: &HeaderBlock, name: &str) -> Vec<String> {
    field_or_header(field, headers, name)
        .map(|v| vec![decode_encoded_words(v)])
        .unwrap_or_default()
}

fn list_or_header(values: &[String], headers: &HeaderBlock, name: &str) -> Vec<String> {
    if values.iter().any(|v| !v.trim().is_empty()) {
        values.to_vec()
    } else {
        header_list(None, headers, name)
    }
}

/// SHA-256 over every identity-bearing field of a raw record.
///
/// Two records share a fingerprint only if they are the same record
/// delivered twice; [`email_id`] separates those by occurrence number.
pub fn fingerprint(raw: &RawMessage) -> Digest256 {
    let mut hasher = Sha256::new();
    let mut field = |tag: &str, value: Option<&[u8]>| {
        hasher.update(tag.as_bytes());
        match value {
            Some(v) => {
                hasher.update([1u8]);
                hasher.update((v.len() as u64).to_be_bytes());
                hasher.update(v);
            }
            None => hasher.update([0u8]),
        }
    };

    field("message_id", raw.message_id.as_deref().map(str::as_bytes));
    field("in_reply_to", raw.in_reply_to.as_deref().map(str::as_bytes));
    field("references", raw.references_raw.as_deref().map(str::as_bytes));
    field(
        "conversation_index",
        raw.conversation_index_raw.as_deref().map(str::as_bytes),
    );
    field("subject", raw.subject.as_deref().map(str::as_bytes));
    match &raw.body_raw {
        RawBody::Text(t) => field("body_text", Some(t.as_bytes())),
        RawBody::Bytes(b) => field("body_bytes", Some(b)),
    }
    field("headers", raw.headers.as_deref().map(str::as_bytes));
    field("sender", raw.sender.as_deref().map(str::as_bytes));
    for (tag, list) in [
        ("to", &raw.recipients.to),
        ("cc", &raw.recipients.cc),
        ("bcc", &raw.recipients.bcc),
    ] {
        for value in list {
            field(tag, Some(value.as_bytes()));
        }
    }
    field("date", raw.date_sent.as_deref().map(str::as_bytes));
    for att in &raw.attachments {
        field("att_name", att.filename.as_deref().map(str::as_bytes));
        field("att_path", att.path.as_deref().map(str::as_bytes));
        match &att.content {
            AttachmentSource::Bytes(b) => field("att_bytes", Some(hash::sha256(b).0.as_slice())),
            AttachmentSource::File(p) => {
                field("att_file", Some(p.to_string_lossy().as_bytes()))
            }
        }
    }

    Digest256(hasher.finalize().into())
}

/// Deterministic record id from a fingerprint and its occurrence number
/// among records with the same fingerprint.
pub fn email_id(fingerprint: &Digest256, occurrence: u32) -> Uuid {
    let mut name = Vec::with_capacity(36);
    name.extend_from_slice(&fingerprint.0);
    name.extend_from_slice(&occurrence.to_be_bytes());
    Uuid::new_v5(&EMAIL_ID_NAMESPACE, &name)
}
