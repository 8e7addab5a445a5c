//! Structural checks over a finished thread graph.
//!
//! Nothing here changes an assignment. Each check only records what looks
//! wrong, with enough evidence to find the records again.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Duration;
use rayon::prelude::*;
use serde_json::json;

use crate::config::ConsistencyConfig;
use crate::index::{Handle, IdentityIndex};
use crate::model::address::overlap_ratio;
use crate::model::anomaly::{Anomaly, AnomalyKind};
use crate::model::digest::Digest256;
use crate::model::link::LinkMethod;
use crate::thread::{ThreadGraph, ThreadGroup};

/// Orphan, drift, divergence and timing checks.
#[derive(Debug, Clone)]
pub struct ConsistencyChecker {
    drift_threshold: f64,
    gap: Duration,
    gap_days: i64,
}

impl ConsistencyChecker {
    pub fn new(config: &ConsistencyConfig) -> Self {
        Self {
            drift_threshold: config.recipient_drift_threshold,
            gap: Duration::try_days(config.time_gap_threshold_days).unwrap_or(Duration::MAX),
            gap_days: config.time_gap_threshold_days,
        }
    }

    /// Run every check. Order of the result is unspecified; the report
    /// sorts it.
    pub fn check(&self, index: &IdentityIndex, graph: &ThreadGraph) -> Vec<Anomaly> {
        let mut out: Vec<Anomaly> = (0..index.len())
            .into_par_iter()
            .flat_map_iter(|h| {
                let mut found = Vec::new();
                found.extend(self.orphan(index, graph, h));
                found.extend(self.drift(index, graph, h));
                found.extend(self.timing(index, graph, h));
                found
            })
            .collect();
        out.extend(
            graph
                .groups
                .par_iter()
                .flat_map_iter(|g| divergence(index, g))
                .collect::<Vec<_>>(),
        );
        out
    }

    /// Header evidence named a parent outside the batch, and the message
    /// ended up a root or on a subject/time guess.
    fn orphan(&self, index: &IdentityIndex, graph: &ThreadGraph, h: Handle) -> Option<Anomaly> {
        let r = &graph.resolutions[h];
        if r.unresolved.is_empty() {
            return None;
        }
        let outcome = match r.method {
            None => "treated as thread root",
            Some(LinkMethod::SubjectTimeHeuristic) => "assigned by subject/time fallback",
            Some(_) => return None,
        };
        let m = index.get(h);
        Some(
            Anomaly::new(
                AnomalyKind::OrphanFallback,
                vec![m.email_id],
                format!(
                    "referenced parent not in batch ({}); {outcome}",
                    r.unresolved.join(", ")
                ),
            )
            .with_group(graph.group_id(h))
            .with_evidence("unresolved_ids", json!(r.unresolved))
            .with_evidence("message_id", json!(m.message_id))
            .with_evidence("parent_email_id", json!(r.parent.map(|p| index.get(p).email_id))),
        )
    }

    fn drift(&self, index: &IdentityIndex, graph: &ThreadGraph, h: Handle) -> Option<Anomaly> {
        let p = graph.resolutions[h].parent?;
        let (child, parent) = (index.get(h), index.get(p));
        let (mine, theirs) = (child.participants(), parent.participants());
        let ratio = overlap_ratio(&mine, &theirs);
        if ratio >= self.drift_threshold {
            return None;
        }
        let added: Vec<&String> = mine.difference(&theirs).collect();
        let dropped: Vec<&String> = theirs.difference(&mine).collect();
        Some(
            Anomaly::new(
                AnomalyKind::RecipientDrift,
                vec![child.email_id, parent.email_id],
                format!(
                    "participant overlap with parent {ratio:.2} below {:.2}",
                    self.drift_threshold
                ),
            )
            .with_group(graph.group_id(h))
            .with_evidence("overlap_ratio", ratio)
            .with_evidence("added", json!(added))
            .with_evidence("dropped", json!(dropped)),
        )
    }

    fn timing(&self, index: &IdentityIndex, graph: &ThreadGraph, h: Handle) -> Option<Anomaly> {
        let p = graph.resolutions[h].parent?;
        let (child, parent) = (index.get(h), index.get(p));
        let delta = child.date_sent? - parent.date_sent?;
        let detail = if delta < Duration::zero() {
            "child dated before its parent".to_string()
        } else if delta > self.gap {
            format!("gap to parent exceeds {} days", self.gap_days)
        } else {
            return None;
        };
        Some(
            Anomaly::new(
                AnomalyKind::TimeAnomaly,
                vec![child.email_id, parent.email_id],
                detail,
            )
            .with_group(graph.group_id(h))
            .with_evidence("gap_hours", delta.num_seconds() as f64 / 3600.0)
            .with_evidence("threshold_days", self.gap_days),
        )
    }
}

/// Same filename, different bytes, one thread.
fn divergence(index: &IdentityIndex, group: &ThreadGroup) -> Vec<Anomaly> {
    let mut by_name: BTreeMap<String, BTreeMap<Digest256, BTreeSet<uuid::Uuid>>> = BTreeMap::new();
    for &h in &group.members {
        let m = index.get(h);
        for a in &m.attachments {
            by_name
                .entry(a.original_filename.trim().to_lowercase())
                .or_default()
                .entry(a.attachment_hash)
                .or_default()
                .insert(m.email_id);
        }
    }

    by_name
        .into_iter()
        .filter(|(name, hashes)| !name.is_empty() && hashes.len() > 1)
        .map(|(name, hashes)| {
            let ids: BTreeSet<uuid::Uuid> = hashes.values().flatten().copied().collect();
            let versions: Vec<_> = hashes
                .iter()
                .map(|(d, owners)| json!({ "attachment_hash": d, "email_ids": owners }))
                .collect();
            Anomaly::new(
                AnomalyKind::AttachmentDivergence,
                ids.into_iter().collect(),
                format!("{} versions of {name} in one thread", hashes.len()),
            )
            .with_group(group.id.clone())
            .with_evidence("filename", name)
            .with_evidence("versions", json!(versions))
        })
        .collect()
}
