//! Thread link audit records (`email_thread_links` rows).

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// How a parent was found. Ordered strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkMethod {
    MessageIdExact,
    ReferencesChain,
    ConversationIndex,
    SubjectTimeHeuristic,
}

impl LinkMethod {
    /// Tier number (1 = strongest).
    pub fn tier(self) -> u8 {
        match self {
            LinkMethod::MessageIdExact => 1,
            LinkMethod::ReferencesChain => 2,
            LinkMethod::ConversationIndex => 3,
            LinkMethod::SubjectTimeHeuristic => 4,
        }
    }

    /// Confidence assigned when this tier alone picks the parent.
    pub fn base_confidence(self) -> f64 {
        match self {
            LinkMethod::MessageIdExact => 0.98,
            LinkMethod::ReferencesChain => 0.96,
            LinkMethod::ConversationIndex => 0.85,
            LinkMethod::SubjectTimeHeuristic => 0.60,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LinkMethod::MessageIdExact => "MESSAGE_ID_EXACT",
            LinkMethod::ReferencesChain => "REFERENCES_CHAIN",
            LinkMethod::ConversationIndex => "CONVERSATION_INDEX",
            LinkMethod::SubjectTimeHeuristic => "SUBJECT_TIME_HEURISTIC",
        }
    }
}

/// A candidate parent that was considered but not chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alternative {
    /// `None` when the candidate is not in the batch at all.
    pub candidate_email_id: Option<Uuid>,
    pub candidate_message_id: Option<String>,
    pub reason: String,
    pub score: f64,
}

/// One resolved edge (or an audited root).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadLink {
    /// Deterministic row id derived from `(child, parent)`.
    pub id: Uuid,
    pub child_email_id: Uuid,
    /// `None` for roots.
    pub parent_email_id: Option<Uuid>,
    pub methods: BTreeSet<LinkMethod>,
    pub evidence: Map<String, Value>,
    pub alternatives: Vec<Alternative>,
    pub confidence: f64,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_serializes_screaming_case() {
        let json = serde_json::to_string(&LinkMethod::SubjectTimeHeuristic).unwrap();
        assert_eq!(json, "\"SUBJECT_TIME_HEURISTIC\"");
        assert_eq!(LinkMethod::MessageIdExact.as_str(), "MESSAGE_ID_EXACT");
    }

    #[test]
    fn test_method_order_is_tier_order() {
        let mut methods = vec![
            LinkMethod::SubjectTimeHeuristic,
            LinkMethod::MessageIdExact,
            LinkMethod::ConversationIndex,
            LinkMethod::ReferencesChain,
        ];
        methods.sort();
        let tiers: Vec<u8> = methods.iter().map(|m| m.tier()).collect();
        assert_eq!(tiers, vec![1, 2, 3, 4]);
    }
}
