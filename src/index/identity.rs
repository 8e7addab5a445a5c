//! Identity Index: `message_id` → canonical message, for a whole batch.
//!
//! The index is built in one pass over the complete batch and is read-only
//! afterwards. Every lookup answer depends only on the set of messages,
//! never on the order they arrived in.

use std::collections::HashMap;

use tracing::debug;

use crate::model::anomaly::{Anomaly, AnomalyKind};
use crate::model::message::{chrono_key, CanonicalMessage};

/// Stable handle of a message within one run: its position in the arena.
pub type Handle = usize;

/// A `message_id` carried by more than one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateId {
    pub message_id: String,
    /// The occurrence the index resolves the id to.
    pub canonical: Handle,
    /// Every later occurrence, chronological.
    pub others: Vec<Handle>,
}

/// Arena of canonical messages plus the lookups threading needs.
#[derive(Debug, Default)]
pub struct IdentityIndex {
    /// Sorted by `email_id`.
    arena: Vec<CanonicalMessage>,
    by_message_id: HashMap<String, Handle>,
    duplicates: Vec<DuplicateId>,
    /// Normalized subject → handles, chronological.
    by_subject: HashMap<String, Vec<Handle>>,
    /// Conversation index bytes → handles, chronological.
    by_conversation_index: HashMap<Vec<u8>, Vec<Handle>>,
}

impl IdentityIndex {
    /// Build the index over the complete batch.
    pub fn build(mut messages: Vec<CanonicalMessage>) -> Self {
        messages.sort_by_key(|m| m.email_id);

        let mut chrono: Vec<Handle> = (0..messages.len()).collect();
        chrono.sort_by_key(|&h| chrono_key(messages[h].date_sent, messages[h].email_id));

        let mut by_message_id: HashMap<String, Handle> = HashMap::new();
        let mut seen: HashMap<String, Vec<Handle>> = HashMap::new();
        let mut by_subject: HashMap<String, Vec<Handle>> = HashMap::new();
        let mut by_conversation_index: HashMap<Vec<u8>, Vec<Handle>> = HashMap::new();

        // Chronological pass: the first holder of an id is the earliest one.
        for &h in &chrono {
            let m = &messages[h];
            if let Some(id) = &m.message_id {
                by_message_id.entry(id.clone()).or_insert(h);
                seen.entry(id.clone()).or_default().push(h);
            }
            by_subject
                .entry(m.subject_normalized.clone())
                .or_default()
                .push(h);
            if let Some(ci) = &m.conversation_index {
                by_conversation_index.entry(ci.clone()).or_default().push(h);
            }
        }

        let mut duplicates: Vec<DuplicateId> = seen
            .into_iter()
            .filter(|(_, handles)| handles.len() > 1)
            .map(|(message_id, handles)| DuplicateId {
                message_id,
                canonical: handles[0],
                others: handles[1..].to_vec(),
            })
            .collect();
        duplicates.sort_by(|a, b| a.message_id.cmp(&b.message_id));

        debug!(
            messages = messages.len(),
            ids = by_message_id.len(),
            duplicates = duplicates.len(),
            subjects = by_subject.len(),
            "identity index built"
        );

        Self {
            arena: messages,
            by_message_id,
            duplicates,
            by_subject,
            by_conversation_index,
        }
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn get(&self, handle: Handle) -> &CanonicalMessage {
        &self.arena[handle]
    }

    /// Handle of the record with this `email_id`.
    pub fn handle_of(&self, email_id: uuid::Uuid) -> Option<Handle> {
        self.arena.binary_search_by_key(&email_id, |m| m.email_id).ok()
    }

    pub fn messages(&self) -> &[CanonicalMessage] {
        &self.arena
    }

    /// Canonical holder of a normalized `message_id`.
    pub fn lookup(&self, message_id: &str) -> Option<Handle> {
        self.by_message_id.get(message_id).copied()
    }

    /// Whether `handle` is the occurrence its `message_id` resolves to.
    pub fn is_canonical_holder(&self, handle: Handle) -> bool {
        self.arena[handle]
            .message_id
            .as_deref()
            .and_then(|id| self.lookup(id))
            == Some(handle)
    }

    /// Messages with this normalized subject, chronological.
    pub fn subject_bucket(&self, subject: &str) -> &[Handle] {
        self.by_subject.get(subject).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Messages whose conversation index is exactly `key`, chronological.
    pub fn with_conversation_index(&self, key: &[u8]) -> &[Handle] {
        self.by_conversation_index
            .get(key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every `message_id` seen more than once, sorted by id.
    pub fn duplicates(&self) -> &[DuplicateId] {
        &self.duplicates
    }

    /// Pairs `(canonical, later occurrence)` for the near-duplicate analyzer.
    pub fn duplicate_pairs(&self) -> Vec<(Handle, Handle)> {
        self.duplicates
            .iter()
            .flat_map(|d| d.others.iter().map(move |&o| (d.canonical, o)))
            .collect()
    }

    /// One `duplicate-message-id` anomaly per repeated id.
    pub fn duplicate_anomalies(&self) -> Vec<Anomaly> {
        self.duplicates
            .iter()
            .map(|d| {
                let mut ids = vec![self.arena[d.canonical].email_id];
                ids.extend(d.others.iter().map(|&h| self.arena[h].email_id));
                debug!(
                    message_id = %d.message_id,
                    occurrences = ids.len(),
                    "duplicate Message-ID; earliest occurrence kept as canonical"
                );
                Anomaly::new(
                    AnomalyKind::DuplicateMessageId,
                    ids,
                    format!("{} records share one Message-ID", d.others.len() + 1),
                )
                .with_evidence("message_id", d.message_id.as_str())
            })
            .collect()
    }

    /// Hand the arena back once the run no longer needs lookups.
    pub fn into_messages(self) -> Vec<CanonicalMessage> {
        self.arena
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::message::testing::msg;

    #[test]
    fn test_empty_batch() {
        let index = IdentityIndex::build(Vec::new());
        assert!(index.is_empty());
        assert!(index.lookup("a").is_none());
        assert!(index.duplicates().is_empty());
    }

    #[test]
    fn test_lookup_and_arena_order() {
        let index = IdentityIndex::build(vec![
            msg(3, Some("c")).build(),
            msg(1, Some("a")).build(),
            msg(2, Some("b")).build(),
        ]);
        let ids: Vec<u128> = index.messages().iter().map(|m| m.email_id.as_u128()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(index.lookup("b"), Some(1));
        assert!(index.lookup("zzz").is_none());
    }

    #[test]
    fn test_duplicate_keeps_earliest() {
        // email_id 1 is dated later than email_id 2
        let index = IdentityIndex::build(vec![
            msg(1, Some("dup")).hours(50).build(),
            msg(2, Some("dup")).hours(5).build(),
        ]);
        let h = index.lookup("dup").unwrap();
        assert_eq!(index.get(h).email_id.as_u128(), 2);
        assert!(index.is_canonical_holder(h));
        assert_eq!(index.duplicates().len(), 1);
        assert_eq!(index.duplicate_pairs().len(), 1);

        let anomalies = index.duplicate_anomalies();
        assert_eq!(anomalies[0].kind, AnomalyKind::DuplicateMessageId);
        assert_eq!(anomalies[0].email_ids[0].as_u128(), 2);
    }

    #[test]
    fn test_undated_duplicate_loses() {
        let index = IdentityIndex::build(vec![
            msg(1, Some("dup")).undated().build(),
            msg(2, Some("dup")).build(),
        ]);
        let h = index.lookup("dup").unwrap();
        assert_eq!(index.get(h).email_id.as_u128(), 2);
    }

    #[test]
    fn test_order_independent() {
        let batch = vec![
            msg(1, Some("x")).hours(3).build(),
            msg(2, Some("x")).hours(3).build(),
            msg(3, Some("y")).build(),
        ];
        let mut reversed = batch.clone();
        reversed.reverse();
        let a = IdentityIndex::build(batch);
        let b = IdentityIndex::build(reversed);
        assert_eq!(a.lookup("x"), b.lookup("x"));
        assert_eq!(a.duplicates(), b.duplicates());
        assert_eq!(a.subject_bucket("topic"), b.subject_bucket("topic"));
    }
}
