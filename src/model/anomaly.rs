//! Anomaly records produced by the Consistency Reporter.
//!
//! None of these fail a run. They document where the input was damaged
//! or ambiguous and what the engine did about it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// What was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnomalyKind {
    /// Header evidence pointed at a parent that is not in the batch; the
    /// message fell back to tier 4 or became a root.
    OrphanFallback,
    /// Participants differ significantly from the thread parent.
    RecipientDrift,
    /// Same filename, different bytes, same thread.
    AttachmentDivergence,
    /// Child dated before its parent, or an unusually long gap.
    TimeAnomaly,
    /// Several records carry the same `Message-ID`.
    DuplicateMessageId,
    /// A parent cycle was cut.
    CycleBroken,
    /// Conversation index bytes could not be decoded.
    MalformedConversationIndex,
    /// No usable `Message-ID`.
    MissingMessageId,
    /// Date present but unparseable.
    UnparseableDate,
    /// Attachment too large to buffer; hashed by streaming.
    StreamedHash,
}

/// Error taxonomy bucket of an anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    RecoverableMalformedInput,
    ResourceExhaustion,
    StructuralInconsistency,
}

impl AnomalyKind {
    pub fn class(self) -> ErrorClass {
        match self {
            AnomalyKind::MalformedConversationIndex
            | AnomalyKind::MissingMessageId
            | AnomalyKind::UnparseableDate => ErrorClass::RecoverableMalformedInput,
            AnomalyKind::StreamedHash => ErrorClass::ResourceExhaustion,
            AnomalyKind::OrphanFallback
            | AnomalyKind::RecipientDrift
            | AnomalyKind::AttachmentDivergence
            | AnomalyKind::TimeAnomaly
            | AnomalyKind::DuplicateMessageId
            | AnomalyKind::CycleBroken => ErrorClass::StructuralInconsistency,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AnomalyKind::OrphanFallback => "orphan-fallback",
            AnomalyKind::RecipientDrift => "recipient-drift",
            AnomalyKind::AttachmentDivergence => "attachment-divergence",
            AnomalyKind::TimeAnomaly => "time-anomaly",
            AnomalyKind::DuplicateMessageId => "duplicate-message-id",
            AnomalyKind::CycleBroken => "cycle-broken",
            AnomalyKind::MalformedConversationIndex => "malformed-conversation-index",
            AnomalyKind::MissingMessageId => "missing-message-id",
            AnomalyKind::UnparseableDate => "unparseable-date",
            AnomalyKind::StreamedHash => "streamed-hash",
        }
    }
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observation with its evidentiary context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub class: ErrorClass,
    /// Records involved, most relevant first.
    pub email_ids: Vec<Uuid>,
    pub thread_group_id: Option<String>,
    pub detail: String,
    pub evidence: Map<String, Value>,
}

impl Anomaly {
    pub fn new(kind: AnomalyKind, email_ids: Vec<Uuid>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            class: kind.class(),
            email_ids,
            thread_group_id: None,
            detail: detail.into(),
            evidence: Map::new(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.thread_group_id = Some(group.into());
        self
    }

    pub fn with_evidence(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.evidence.insert(key.to_string(), value.into());
        self
    }
}

/// All anomalies of one run, sorted, with per-kind counts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub anomalies: Vec<Anomaly>,
    pub counts: BTreeMap<AnomalyKind, usize>,
}

impl AnomalyReport {
    /// Sort into report order and count per kind.
    ///
    /// Order is kind, then involved ids, then group, then detail, so the
    /// report is identical however the anomalies were collected.
    pub fn from_anomalies(mut anomalies: Vec<Anomaly>) -> Self {
        anomalies.sort_by(|a, b| {
            a.kind
                .cmp(&b.kind)
                .then_with(|| a.email_ids.cmp(&b.email_ids))
                .then_with(|| a.thread_group_id.cmp(&b.thread_group_id))
                .then_with(|| a.detail.cmp(&b.detail))
        });
        let mut counts = BTreeMap::new();
        for a in &anomalies {
            *counts.entry(a.kind).or_insert(0) += 1;
        }
        Self { anomalies, counts }
    }

    pub fn len(&self) -> usize {
        self.anomalies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anomalies.is_empty()
    }

    pub fn count(&self, kind: AnomalyKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn of_kind(&self, kind: AnomalyKind) -> impl Iterator<Item = &Anomaly> {
        self.anomalies.iter().filter(move |a| a.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serialization_matches_as_str() {
        for kind in [
            AnomalyKind::OrphanFallback,
            AnomalyKind::AttachmentDivergence,
            AnomalyKind::MalformedConversationIndex,
            AnomalyKind::StreamedHash,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn test_classes() {
        assert_eq!(
            AnomalyKind::UnparseableDate.class(),
            ErrorClass::RecoverableMalformedInput
        );
        assert_eq!(
            AnomalyKind::StreamedHash.class(),
            ErrorClass::ResourceExhaustion
        );
        assert_eq!(
            AnomalyKind::CycleBroken.class(),
            ErrorClass::StructuralInconsistency
        );
    }

    #[test]
    fn test_builder() {
        let a = Anomaly::new(AnomalyKind::TimeAnomaly, vec![Uuid::nil()], "child before parent")
            .with_group("g1")
            .with_evidence("gap_hours", -2.5);
        assert_eq!(a.thread_group_id.as_deref(), Some("g1"));
        assert_eq!(a.evidence["gap_hours"], serde_json::json!(-2.5));
    }

    #[test]
    fn test_report_sorted_and_counted() {
        let report = AnomalyReport::from_anomalies(vec![
            Anomaly::new(AnomalyKind::TimeAnomaly, vec![Uuid::from_u128(2)], "b"),
            Anomaly::new(AnomalyKind::OrphanFallback, vec![Uuid::from_u128(9)], "x"),
            Anomaly::new(AnomalyKind::TimeAnomaly, vec![Uuid::from_u128(1)], "a"),
        ]);
        assert_eq!(report.len(), 3);
        assert_eq!(report.anomalies[0].kind, AnomalyKind::OrphanFallback);
        assert_eq!(report.anomalies[1].detail, "a");
        assert_eq!(report.count(AnomalyKind::TimeAnomaly), 2);
        assert_eq!(report.count(AnomalyKind::CycleBroken), 0);
    }
}
