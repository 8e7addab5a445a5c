//! Per-message parent selection.
//!
//! Tiers, strongest first:
//! 1. `In-Reply-To` names a message in the batch.
//! 2. The newest `References` entry found in the batch.
//! 3. A message whose conversation index is this one minus its last block,
//!    with the same normalized subject.
//! 4. The nearest earlier message with the same normalized subject inside
//!    the fallback window. Forwards are not threaded this way by default.
//!
//! Every tier is evaluated so that agreeing tiers can corroborate the
//! winner. Resolution reads the index only; messages are independent.

use std::collections::BTreeSet;

use chrono::Duration;
use rayon::prelude::*;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::canonical::conversation_index::ConversationIndex;
use crate::config::ThreadingConfig;
use crate::index::{Handle, IdentityIndex};
use crate::model::address::overlap_ratio;
use crate::model::digest::to_hex;
use crate::model::link::{Alternative, LinkMethod};
use crate::model::message::{chrono_key, CanonicalMessage};

/// Ceiling for corroborated confidence.
const MAX_CONFIDENCE: f64 = 0.99;
/// Added per corroborating tier.
const CORROBORATION_BONUS: f64 = 0.01;
/// Subject fallback confidence at the far edge of the window.
const SUBJECT_FLOOR_CONFIDENCE: f64 = 0.40;

/// Outcome of parent selection for one message.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub child: Handle,
    pub parent: Option<Handle>,
    /// Winning tier.
    pub method: Option<LinkMethod>,
    /// Winning tier plus every tier that picked the same parent.
    pub methods: BTreeSet<LinkMethod>,
    pub confidence: f64,
    pub evidence: Map<String, Value>,
    pub alternatives: Vec<Alternative>,
    /// Header-level evidence (tiers 1-3) named a parent that is not here.
    pub unresolved: Vec<String>,
}

impl Resolution {
    fn root(child: Handle) -> Self {
        Self {
            child,
            parent: None,
            method: None,
            methods: BTreeSet::new(),
            confidence: 0.0,
            evidence: Map::new(),
            alternatives: Vec::new(),
            unresolved: Vec::new(),
        }
    }

    /// Turn into a root, keeping the audit trail.
    pub fn detach(&mut self) {
        self.parent = None;
        self.method = None;
        self.methods.clear();
        self.confidence = 0.0;
    }

    /// Root with something worth auditing.
    pub fn has_audit_content(&self) -> bool {
        !self.alternatives.is_empty() || !self.unresolved.is_empty() || !self.evidence.is_empty()
    }
}

/// Result of one tier.
#[derive(Debug, Default)]
struct TierOutcome {
    parent: Option<Handle>,
    confidence: f64,
    evidence: Map<String, Value>,
    alternatives: Vec<Alternative>,
    unresolved: Vec<String>,
}

/// Tiered parent resolver.
#[derive(Debug, Clone)]
pub struct Resolver {
    window: Duration,
    window_days: i64,
    require_participants: bool,
    skip_forwards: bool,
    use_conversation_index: bool,
}

impl Resolver {
    pub fn new(config: &ThreadingConfig) -> Self {
        Self {
            window: Duration::try_days(config.fallback_time_window_days).unwrap_or(Duration::MAX),
            window_days: config.fallback_time_window_days,
            require_participants: config.subject_fallback_requires_participants,
            skip_forwards: config.subject_fallback_skips_forwards,
            use_conversation_index: config.conversation_index_enabled,
        }
    }

    /// Resolve every message of the index, in parallel. Output is in
    /// handle order.
    pub fn resolve_all(&self, index: &IdentityIndex) -> Vec<Resolution> {
        let resolutions: Vec<Resolution> = (0..index.len())
            .into_par_iter()
            .map(|h| self.resolve(index, h))
            .collect();

        let mut per_tier = [0usize; 5];
        for r in &resolutions {
            per_tier[r.method.map(|m| m.tier() as usize).unwrap_or(0)] += 1;
        }
        debug!(
            roots = per_tier[0],
            message_id = per_tier[1],
            references = per_tier[2],
            conversation_index = per_tier[3],
            subject_time = per_tier[4],
            "parent selection finished"
        );
        resolutions
    }

    /// Pick a parent for one message.
    pub fn resolve(&self, index: &IdentityIndex, h: Handle) -> Resolution {
        let tiers = [
            (LinkMethod::MessageIdExact, self.by_in_reply_to(index, h)),
            (LinkMethod::ReferencesChain, self.by_references(index, h)),
            (LinkMethod::ConversationIndex, self.by_conversation_index(index, h)),
            (LinkMethod::SubjectTimeHeuristic, self.by_subject_window(index, h)),
        ];

        let mut resolution = Resolution::root(h);
        for (method, outcome) in &tiers {
            if method.tier() <= 3 {
                resolution.unresolved.extend(outcome.unresolved.iter().cloned());
            }
        }

        let winner = tiers.iter().position(|(_, o)| o.parent.is_some());

        // Alternatives from every tier consulted up to and including the winner.
        let consulted = winner.map(|w| w + 1).unwrap_or(tiers.len());
        for (_, outcome) in &tiers[..consulted] {
            for alt in &outcome.alternatives {
                if !resolution.alternatives.contains(alt) {
                    resolution.alternatives.push(alt.clone());
                }
            }
        }

        let Some(w) = winner else {
            if !resolution.unresolved.is_empty() {
                resolution
                    .evidence
                    .insert("unresolved_ids".into(), json!(resolution.unresolved));
            }
            return resolution;
        };

        let (method, outcome) = &tiers[w];
        let parent = outcome.parent;
        resolution.parent = parent;
        resolution.method = Some(*method);
        resolution.methods = tiers
            .iter()
            .filter(|(_, o)| o.parent.is_some() && o.parent == parent)
            .map(|(m, _)| *m)
            .collect();

        let bonus = CORROBORATION_BONUS * (resolution.methods.len() - 1) as f64;
        resolution.confidence = (outcome.confidence + bonus).min(MAX_CONFIDENCE);

        let mut evidence = outcome.evidence.clone();
        evidence.insert("method".into(), json!(method.as_str()));
        if let Some(p) = parent {
            describe_parent(&mut evidence, index.get(h), index.get(p));
        }
        if resolution.methods.len() > 1 {
            let corroborating: Vec<&str> = resolution
                .methods
                .iter()
                .filter(|m| *m != method)
                .map(|m| m.as_str())
                .collect();
            evidence.insert("corroborated_by".into(), json!(corroborating));
        }
        if !resolution.unresolved.is_empty() {
            evidence.insert("unresolved_ids".into(), json!(resolution.unresolved));
        }
        resolution.evidence = evidence;
        resolution
    }

    // ── Tier 1 ──────────────────────────────────────────────────

    fn by_in_reply_to(&self, index: &IdentityIndex, h: Handle) -> TierOutcome {
        let mut out = TierOutcome::default();
        let Some(target) = index.get(h).in_reply_to.as_deref() else {
            return out;
        };
        out.evidence.insert("in_reply_to".into(), json!(target));
        match index.lookup(target) {
            Some(p) if p != h => {
                out.parent = Some(p);
                out.confidence = LinkMethod::MessageIdExact.base_confidence();
                out.alternatives = duplicate_alternatives(index, target, p, h);
            }
            Some(_) => {
                out.evidence.insert("self_reference".into(), json!(true));
            }
            None => {
                out.unresolved.push(target.to_string());
                out.alternatives.push(missing(target));
            }
        }
        out
    }

    // ── Tier 2 ──────────────────────────────────────────────────

    fn by_references(&self, index: &IdentityIndex, h: Handle) -> TierOutcome {
        let mut out = TierOutcome::default();
        let me = index.get(h);
        if me.references.is_empty() {
            return out;
        }
        out.evidence.insert("references".into(), json!(me.references));

        let mut distance = 0usize;
        for reference in me.references.iter().rev() {
            if me.message_id.as_deref() == Some(reference.as_str()) {
                continue;
            }
            match index.lookup(reference) {
                Some(p) if p == h => {}
                Some(p) => match out.parent {
                    None => {
                        out.parent = Some(p);
                        out.confidence = LinkMethod::ReferencesChain.base_confidence();
                        out.evidence
                            .insert("matched_reference".into(), json!(reference));
                        out.alternatives
                            .extend(duplicate_alternatives(index, reference, p, h));
                    }
                    Some(_) => {
                        distance += 1;
                        let score = (LinkMethod::ReferencesChain.base_confidence()
                            - 0.02 * distance as f64)
                            .max(0.0);
                        out.alternatives
                            .push(candidate(index, p, "older_reference", score));
                    }
                },
                None => {
                    out.unresolved.push(reference.clone());
                    if out.parent.is_none() {
                        out.alternatives.push(missing(reference));
                    }
                }
            }
        }
        out
    }

    // ── Tier 3 ──────────────────────────────────────────────────

    fn by_conversation_index(&self, index: &IdentityIndex, h: Handle) -> TierOutcome {
        let mut out = TierOutcome::default();
        if !self.use_conversation_index {
            return out;
        }
        let me = index.get(h);
        let Some(idx) = me
            .conversation_index
            .as_deref()
            .and_then(|b| ConversationIndex::decode(b).ok())
        else {
            return out;
        };
        let Some(parent_key) = idx.parent_key() else {
            return out;
        };
        out.evidence
            .insert("conversation_index".into(), json!(to_hex(idx.as_bytes())));
        out.evidence
            .insert("conversation_depth".into(), json!(idx.depth()));
        out.evidence
            .insert("conversation_guid".into(), json!(to_hex(&idx.guid())));
        if let Some(t) = idx.hop_time() {
            out.evidence
                .insert("conversation_time".into(), json!(t.to_rfc3339()));
        }

        let candidates: Vec<Handle> = index
            .with_conversation_index(parent_key)
            .iter()
            .copied()
            .filter(|&c| c != h && index.get(c).subject_normalized == me.subject_normalized)
            .collect();

        match candidates.split_first() {
            Some((&first, rest)) => {
                out.parent = Some(first);
                out.confidence = LinkMethod::ConversationIndex.base_confidence();
                out.evidence.insert(
                    "parent_conversation_index".into(),
                    json!(to_hex(parent_key)),
                );
                for &c in rest {
                    out.alternatives.push(candidate(
                        index,
                        c,
                        "conversation_index_sibling",
                        LinkMethod::ConversationIndex.base_confidence(),
                    ));
                }
            }
            None => out
                .unresolved
                .push(format!("conversation_index:{}", to_hex(parent_key))),
        }
        out
    }

    // ── Tier 4 ──────────────────────────────────────────────────

    fn by_subject_window(&self, index: &IdentityIndex, h: Handle) -> TierOutcome {
        let mut out = TierOutcome::default();
        let me = index.get(h);
        if me.subject_normalized.is_empty() || (self.skip_forwards && me.is_forward) {
            return out;
        }
        let Some(my_date) = me.date_sent else {
            return out;
        };
        let my_key = chrono_key(me.date_sent, me.email_id);
        let my_participants = me.participants();

        let mut best: Option<(Handle, Duration)> = None;
        let mut others: Vec<(Handle, Duration)> = Vec::new();
        for &c in index.subject_bucket(&me.subject_normalized) {
            let cand = index.get(c);
            if c == h || chrono_key(cand.date_sent, cand.email_id) >= my_key {
                continue;
            }
            let Some(cand_date) = cand.date_sent else {
                continue;
            };
            let delta = my_date - cand_date;
            if delta > self.window {
                continue;
            }
            if self.require_participants && my_participants.is_disjoint(&cand.participants()) {
                continue;
            }
            // Buckets are chronological, so the last eligible one is nearest.
            if let Some(prev) = best.replace((c, delta)) {
                others.push(prev);
            }
        }

        let Some((parent, delta)) = best else {
            return out;
        };
        out.parent = Some(parent);
        out.confidence = self.subject_confidence(delta);
        out.evidence
            .insert("subject_normalized".into(), json!(me.subject_normalized));
        out.evidence
            .insert("window_days".into(), json!(self.window_days));
        let overlap = overlap_ratio(&my_participants, &index.get(parent).participants());
        out.evidence
            .insert("participant_overlap".into(), json!(overlap));
        for (c, d) in others.into_iter().rev() {
            out.alternatives.push(candidate(
                index,
                c,
                "subject_window",
                self.subject_confidence(d),
            ));
        }
        out
    }

    /// 0.60 at zero distance, falling linearly to 0.40 at the window edge.
    fn subject_confidence(&self, delta: Duration) -> f64 {
        let base = LinkMethod::SubjectTimeHeuristic.base_confidence();
        let window = self.window.num_seconds().max(1) as f64;
        let frac = (delta.num_seconds().max(0) as f64 / window).min(1.0);
        base - (base - SUBJECT_FLOOR_CONFIDENCE) * frac
    }
}

fn describe_parent(
    evidence: &mut Map<String, Value>,
    child: &CanonicalMessage,
    parent: &CanonicalMessage,
) {
    evidence.insert("parent_email_id".into(), json!(parent.email_id.to_string()));
    if let Some(id) = &parent.message_id {
        evidence.insert("parent_message_id".into(), json!(id));
    }
    if let (Some(c), Some(p)) = (child.date_sent, parent.date_sent) {
        let hours = (c - p).num_seconds() as f64 / 3600.0;
        evidence.insert("time_delta_hours".into(), json!(hours));
    }
}

fn missing(message_id: &str) -> Alternative {
    Alternative {
        candidate_email_id: None,
        candidate_message_id: Some(message_id.to_string()),
        reason: "missing_from_batch".into(),
        score: 0.0,
    }
}

fn candidate(index: &IdentityIndex, h: Handle, reason: &str, score: f64) -> Alternative {
    let m = index.get(h);
    Alternative {
        candidate_email_id: Some(m.email_id),
        candidate_message_id: m.message_id.clone(),
        reason: reason.to_string(),
        score,
    }
}

/// Later holders of a duplicated id that lost to the canonical one.
fn duplicate_alternatives(
    index: &IdentityIndex,
    message_id: &str,
    chosen: Handle,
    child: Handle,
) -> Vec<Alternative> {
    index
        .duplicates()
        .iter()
        .filter(|d| d.message_id == message_id)
        .flat_map(|d| d.others.iter().copied())
        .filter(|&o| o != chosen && o != child)
        .map(|o| candidate(index, o, "duplicate_message_id", 0.0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::conversation_index::tests::{child_of, sample_header};
    use crate::model::message::testing::msg;

    fn resolver() -> Resolver {
        Resolver::new(&ThreadingConfig::default())
    }

    fn parent_id(index: &IdentityIndex, r: &Resolution) -> Option<String> {
        r.parent.and_then(|p| index.get(p).message_id.clone())
    }

    fn resolve_id(index: &IdentityIndex, id: &str) -> Resolution {
        let h = index.lookup(id).unwrap();
        resolver().resolve(index, h)
    }

    #[test]
    fn test_in_reply_to_wins() {
        let index = IdentityIndex::build(vec![
            msg(1, Some("a")).build(),
            msg(2, Some("b")).reply_to("a").build(),
        ]);
        let r = resolve_id(&index, "b");
        assert_eq!(parent_id(&index, &r).as_deref(), Some("a"));
        assert_eq!(r.method, Some(LinkMethod::MessageIdExact));
        // same subject and earlier: the subject tier agrees
        assert!(r.methods.contains(&LinkMethod::SubjectTimeHeuristic));
        assert!((r.confidence - 0.99).abs() < 1e-9);
    }

    #[test]
    fn test_references_newest_resolvable() {
        let index = IdentityIndex::build(vec![
            msg(1, Some("a")).subject("x").build(),
            msg(2, Some("b")).subject("y").build(),
            msg(3, Some("c"))
                .subject("z")
                .references(&["a", "b", "gone"])
                .build(),
        ]);
        let r = resolve_id(&index, "c");
        assert_eq!(parent_id(&index, &r).as_deref(), Some("b"));
        assert_eq!(r.method, Some(LinkMethod::ReferencesChain));
        assert_eq!(r.unresolved, vec!["gone".to_string()]);
        let reasons: Vec<&str> = r.alternatives.iter().map(|a| a.reason.as_str()).collect();
        assert_eq!(reasons, vec!["missing_from_batch", "older_reference"]);
        assert!((r.confidence - 0.96).abs() < 1e-9);
    }

    #[test]
    fn test_conversation_index_parent() {
        let root = sample_header(9);
        let child = child_of(&root, 1);
        let index = IdentityIndex::build(vec![
            msg(1, Some("a")).subject("x").conversation_index(root).build(),
            msg(2, Some("b"))
                .subject("x")
                .hours(500)
                .conversation_index(child)
                .build(),
        ]);
        let r = resolve_id(&index, "b");
        assert_eq!(parent_id(&index, &r).as_deref(), Some("a"));
        assert_eq!(r.method, Some(LinkMethod::ConversationIndex));
    }

    #[test]
    fn test_conversation_index_requires_same_subject() {
        let root = sample_header(9);
        let child = child_of(&root, 1);
        let index = IdentityIndex::build(vec![
            msg(1, Some("a")).subject("x").conversation_index(root).build(),
            msg(2, Some("b"))
                .subject("other")
                .conversation_index(child)
                .build(),
        ]);
        let r = resolve_id(&index, "b");
        assert!(r.parent.is_none());
        assert_eq!(r.unresolved.len(), 1);
    }

    #[test]
    fn test_conversation_index_disabled() {
        let root = sample_header(9);
        let child = child_of(&root, 1);
        let index = IdentityIndex::build(vec![
            msg(1, Some("a")).subject("x").conversation_index(root).build(),
            msg(2, Some("b"))
                .subject("x")
                .hours(5000)
                .conversation_index(child)
                .build(),
        ]);
        let config = ThreadingConfig {
            conversation_index_enabled: false,
            ..ThreadingConfig::default()
        };
        let r = Resolver::new(&config).resolve(&index, index.lookup("b").unwrap());
        assert!(r.parent.is_none());
    }

    #[test]
    fn test_subject_window_nearest_earlier() {
        let index = IdentityIndex::build(vec![
            msg(1, Some("a")).hours(0).build(),
            msg(2, Some("b")).hours(10).build(),
            msg(3, Some("c")).hours(20).build(),
        ]);
        let r = resolve_id(&index, "c");
        assert_eq!(parent_id(&index, &r).as_deref(), Some("b"));
        assert_eq!(r.method, Some(LinkMethod::SubjectTimeHeuristic));
        assert!(r.confidence <= 0.60 && r.confidence >= 0.40);
        assert_eq!(r.alternatives.len(), 1);
        assert_eq!(r.alternatives[0].reason, "subject_window");

        let first = resolve_id(&index, "a");
        assert!(first.parent.is_none());
    }

    #[test]
    fn test_subject_window_bounded() {
        let index = IdentityIndex::build(vec![
            msg(1, Some("a")).hours(0).build(),
            msg(2, Some("b")).hours(24 * 91).build(),
        ]);
        assert!(resolve_id(&index, "b").parent.is_none());
    }

    #[test]
    fn test_subject_window_participants() {
        let index = IdentityIndex::build(vec![
            msg(1, Some("a")).participants("x@a.com", &["y@a.com"]).build(),
            msg(2, Some("b")).participants("p@b.com", &["q@b.com"]).build(),
        ]);
        let strict = Resolver::new(&ThreadingConfig {
            subject_fallback_requires_participants: true,
            ..ThreadingConfig::default()
        });
        let h = index.lookup("b").unwrap();
        assert!(strict.resolve(&index, h).parent.is_none());
        assert!(resolver().resolve(&index, h).parent.is_some());
    }

    #[test]
    fn test_forwards_skip_subject_window() {
        let index = IdentityIndex::build(vec![
            msg(1, Some("fw1")).forward().build(),
            msg(2, Some("fw2")).forward().build(),
            msg(3, Some("re")).build(),
        ]);
        assert!(resolve_id(&index, "fw2").parent.is_none());
        // a forward can still be the parent of a plain follow-up
        assert_eq!(
            parent_id(&index, &resolve_id(&index, "re")).as_deref(),
            Some("fw2")
        );

        let lenient = Resolver::new(&ThreadingConfig {
            subject_fallback_skips_forwards: false,
            ..ThreadingConfig::default()
        });
        let r = lenient.resolve(&index, index.lookup("fw2").unwrap());
        assert_eq!(parent_id(&index, &r).as_deref(), Some("fw1"));
    }

    #[test]
    fn test_forward_still_threads_by_headers() {
        let index = IdentityIndex::build(vec![
            msg(1, Some("a")).build(),
            msg(2, Some("fw")).forward().reply_to("a").build(),
        ]);
        let r = resolve_id(&index, "fw");
        assert_eq!(parent_id(&index, &r).as_deref(), Some("a"));
        assert_eq!(r.methods.len(), 1);
    }

    #[test]
    fn test_missing_parent_recorded() {
        let index = IdentityIndex::build(vec![msg(1, Some("b")).reply_to("gone").build()]);
        let r = resolve_id(&index, "b");
        assert!(r.parent.is_none());
        assert_eq!(r.unresolved, vec!["gone".to_string()]);
        assert!(r.has_audit_content());
        assert_eq!(r.alternatives[0].reason, "missing_from_batch");
    }

    #[test]
    fn test_self_reference_ignored() {
        let index = IdentityIndex::build(vec![msg(1, Some("a"))
            .reply_to("a")
            .references(&["a"])
            .build()]);
        let r = resolve_id(&index, "a");
        assert!(r.parent.is_none());
    }

    #[test]
    fn test_undated_message_skips_subject_tier() {
        let index = IdentityIndex::build(vec![
            msg(1, Some("a")).build(),
            msg(2, Some("b")).undated().build(),
        ]);
        assert!(resolve_id(&index, "b").parent.is_none());
    }

    #[test]
    fn test_duplicate_parent_alternatives() {
        let index = IdentityIndex::build(vec![
            msg(1, Some("a")).subject("x").build(),
            msg(2, Some("a")).subject("x").hours(2).build(),
            msg(3, Some("b")).subject("y").reply_to("a").build(),
        ]);
        let r = resolve_id(&index, "b");
        assert_eq!(index.get(r.parent.unwrap()).email_id.as_u128(), 1);
        assert_eq!(r.alternatives.len(), 1);
        assert_eq!(r.alternatives[0].reason, "duplicate_message_id");
    }
}
