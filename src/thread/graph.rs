//! Thread graph: cycle breaking, grouping and materialized paths.
//!
//! Input is one [`Resolution`] per message. Output assigns every message to
//! exactly one group, rooted at a single message, with a path that sorts
//! the group in tree order.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::index::{Handle, IdentityIndex};
use crate::model::anomaly::{Anomaly, AnomalyKind};
use crate::model::link::{Alternative, ThreadLink};
use crate::model::message::chrono_key;

use super::resolver::Resolution;

/// Namespace for thread link row ids.
pub const LINK_ID_NAMESPACE: Uuid = Uuid::from_u128(0x2b8e_51c4_0d6f_4e93_a1b7_c6d0_58f2_9e17);

/// One thread: a root and everything below it.
#[derive(Debug, Clone)]
pub struct ThreadGroup {
    pub id: String,
    pub root: Handle,
    /// Members in tree order (root first, children by date).
    pub members: Vec<Handle>,
}

/// Resolved structure of a whole batch.
#[derive(Debug)]
pub struct ThreadGraph {
    pub resolutions: Vec<Resolution>,
    /// Groups sorted by id.
    pub groups: Vec<ThreadGroup>,
    /// Group position per handle.
    pub group_of: Vec<usize>,
    /// Children per handle, chronological.
    pub children: Vec<Vec<Handle>>,
    pub anomalies: Vec<Anomaly>,
}

impl ThreadGraph {
    /// Break cycles and build groups. Sequential: depends on every
    /// resolution at once.
    pub fn build(index: &IdentityIndex, mut resolutions: Vec<Resolution>) -> Self {
        let cuts = break_cycles(index, &mut resolutions);

        let n = index.len();
        let mut children: Vec<Vec<Handle>> = vec![Vec::new(); n];
        for r in &resolutions {
            if let Some(p) = r.parent {
                children[p].push(r.child);
            }
        }
        for list in &mut children {
            list.sort_by_key(|&h| {
                let m = index.get(h);
                chrono_key(m.date_sent, m.email_id)
            });
        }

        let mut groups: Vec<ThreadGroup> = (0..n)
            .filter(|&h| resolutions[h].parent.is_none())
            .map(|root| ThreadGroup {
                id: group_id(index, root),
                root,
                members: preorder(root, &children),
            })
            .collect();
        groups.sort_by(|a, b| a.id.cmp(&b.id).then(a.root.cmp(&b.root)));

        let mut group_of = vec![0usize; n];
        for (gi, group) in groups.iter().enumerate() {
            for &m in &group.members {
                group_of[m] = gi;
            }
        }

        let anomalies = cuts
            .into_iter()
            .map(|(h, a)| a.with_group(groups[group_of[h]].id.clone()))
            .collect();

        Self {
            resolutions,
            groups,
            group_of,
            children,
            anomalies,
        }
    }

    /// Group id of a message.
    pub fn group_id(&self, h: Handle) -> &str {
        &self.groups[self.group_of[h]].id
    }

    /// Materialized paths for one group, keyed by handle.
    ///
    /// The root is `"0"`; each child appends its position among its
    /// siblings (chronological), zero-padded to the width of the largest
    /// position in that sibling set so plain string order is tree order.
    pub fn paths(&self, group: &ThreadGroup) -> HashMap<Handle, String> {
        let mut paths = HashMap::with_capacity(group.members.len());
        paths.insert(group.root, "0".to_string());
        let mut stack = vec![group.root];
        while let Some(h) = stack.pop() {
            let siblings = &self.children[h];
            if siblings.is_empty() {
                continue;
            }
            let width = (siblings.len() - 1).to_string().len();
            let base = paths.get(&h).cloned().unwrap_or_default();
            for (i, &c) in siblings.iter().enumerate() {
                paths.insert(c, format!("{base}/{i:0width$}"));
                stack.push(c);
            }
        }
        paths
    }

    /// Ancestors of `h`, nearest first.
    pub fn ancestors(&self, h: Handle) -> Vec<Handle> {
        let mut out = Vec::new();
        let mut cur = self.resolutions[h].parent;
        while let Some(p) = cur {
            out.push(p);
            cur = self.resolutions[p].parent;
        }
        out
    }

    /// Audit rows: one per edge, plus one per root with something to audit.
    pub fn links(
        &self,
        index: &IdentityIndex,
        run_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Vec<ThreadLink> {
        let mut links: Vec<ThreadLink> = self
            .resolutions
            .iter()
            .filter(|r| r.parent.is_some() || r.has_audit_content())
            .map(|r| {
                let child = index.get(r.child).email_id;
                let parent = r.parent.map(|p| index.get(p).email_id);
                let mut evidence = r.evidence.clone();
                evidence.insert("thread_group_id".into(), json!(self.group_id(r.child)));
                ThreadLink {
                    id: link_id(child, parent),
                    child_email_id: child,
                    parent_email_id: parent,
                    methods: r.methods.clone(),
                    evidence,
                    alternatives: r.alternatives.clone(),
                    confidence: r.confidence,
                    run_id,
                    created_at,
                }
            })
            .collect();
        links.sort_by_key(|l| l.child_email_id);
        links
    }
}

/// Deterministic row id of the `child → parent` edge.
pub fn link_id(child: Uuid, parent: Option<Uuid>) -> Uuid {
    let mut name = Vec::with_capacity(32);
    name.extend_from_slice(child.as_bytes());
    name.extend_from_slice(parent.unwrap_or_else(Uuid::nil).as_bytes());
    Uuid::new_v5(&LINK_ID_NAMESPACE, &name)
}

/// The root's `message_id` when it owns it, else its `email_id`.
fn group_id(index: &IdentityIndex, root: Handle) -> String {
    let m = index.get(root);
    match &m.message_id {
        Some(id) if index.is_canonical_holder(root) => id.clone(),
        _ => m.email_id.to_string(),
    }
}

fn preorder(root: Handle, children: &[Vec<Handle>]) -> Vec<Handle> {
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(h) = stack.pop() {
        out.push(h);
        stack.extend(children[h].iter().rev());
    }
    out
}

/// Find every parent cycle and cut its weakest edge.
///
/// Weakest = highest tier number; ties go to the edge whose child sorts
/// first chronologically. The cut child becomes a root.
fn break_cycles(
    index: &IdentityIndex,
    resolutions: &mut [Resolution],
) -> Vec<(Handle, Anomaly)> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        OnPath,
        Done,
    }

    let n = resolutions.len();
    let mut mark = vec![Mark::New; n];
    let mut cuts = Vec::new();

    for start in 0..n {
        if mark[start] != Mark::New {
            continue;
        }
        let mut path: Vec<Handle> = Vec::new();
        let mut cur = Some(start);
        while let Some(h) = cur {
            match mark[h] {
                Mark::Done => break,
                Mark::OnPath => {
                    let pos = path.iter().position(|&p| p == h).unwrap_or(0);
                    let cycle: Vec<Handle> = path[pos..].to_vec();
                    cuts.push(cut_weakest(index, resolutions, &cycle));
                    break;
                }
                Mark::New => {
                    mark[h] = Mark::OnPath;
                    path.push(h);
                    cur = resolutions[h].parent;
                }
            }
        }
        for h in path {
            mark[h] = Mark::Done;
        }
    }
    cuts
}

fn cut_weakest(
    index: &IdentityIndex,
    resolutions: &mut [Resolution],
    cycle: &[Handle],
) -> (Handle, Anomaly) {
    let weakest = cycle
        .iter()
        .copied()
        .max_by(|&a, &b| {
            let tier = |h: Handle| resolutions[h].method.map(|m| m.tier()).unwrap_or(0);
            let key = |h: Handle| {
                let m = index.get(h);
                chrono_key(m.date_sent, m.email_id)
            };
            // highest tier wins; among equals the earliest child wins
            tier(a).cmp(&tier(b)).then_with(|| key(b).cmp(&key(a)))
        })
        .unwrap_or(cycle[0]);

    let r = &mut resolutions[weakest];
    let cut_parent = r.parent;
    let cut_method = r.method;
    let cut_confidence = r.confidence;
    if let Some(p) = cut_parent {
        let pm = index.get(p);
        r.alternatives.push(Alternative {
            candidate_email_id: Some(pm.email_id),
            candidate_message_id: pm.message_id.clone(),
            reason: "cycle_break".into(),
            score: cut_confidence,
        });
    }
    r.detach();
    r.evidence.insert("cycle_broken".into(), json!(true));

    let ids: Vec<Uuid> = cycle.iter().map(|&h| index.get(h).email_id).collect();
    let message_ids: Vec<String> = cycle.iter().map(|&h| index.get(h).display_id()).collect();
    warn!(
        cycle_len = cycle.len(),
        cut_child = %index.get(weakest).display_id(),
        "parent cycle broken"
    );

    let cut_id = index.get(weakest).email_id;
    let mut email_ids = vec![cut_id];
    email_ids.extend(ids.into_iter().filter(|id| *id != cut_id));
    let anomaly = Anomaly::new(
        AnomalyKind::CycleBroken,
        email_ids,
        format!("cycle of {} messages; weakest edge cut", cycle.len()),
    )
    .with_evidence("cycle", json!(message_ids))
    .with_evidence(
        "cut_method",
        json!(cut_method.map(|m| m.as_str()).unwrap_or("NONE")),
    );
    (weakest, anomaly)
}

/// Group sizes, for logging.
pub fn size_histogram(graph: &ThreadGraph) -> BTreeMap<usize, usize> {
    let mut hist = BTreeMap::new();
    for g in &graph.groups {
        *hist.entry(g.members.len()).or_insert(0) += 1;
    }
    hist
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThreadingConfig;
    use crate::model::link::LinkMethod;
    use crate::model::message::testing::msg;
    use crate::thread::resolver::Resolver;

    fn graph(index: &IdentityIndex) -> ThreadGraph {
        let resolutions = Resolver::new(&ThreadingConfig::default()).resolve_all(index);
        ThreadGraph::build(index, resolutions)
    }

    fn path_of(index: &IdentityIndex, g: &ThreadGraph, id: &str) -> String {
        let h = index.lookup(id).unwrap();
        let group = &g.groups[g.group_of[h]];
        g.paths(group)[&h].clone()
    }

    #[test]
    fn test_simple_reply_paths() {
        let index = IdentityIndex::build(vec![
            msg(1, Some("a")).subject("s1").build(),
            msg(2, Some("b")).subject("s2").reply_to("a").build(),
            msg(3, Some("c")).subject("s3").reply_to("a").build(),
        ]);
        let g = graph(&index);
        assert_eq!(g.groups.len(), 1);
        assert_eq!(g.groups[0].id, "a");
        assert_eq!(path_of(&index, &g, "a"), "0");
        assert_eq!(path_of(&index, &g, "b"), "0/0");
        assert_eq!(path_of(&index, &g, "c"), "0/1");
    }

    #[test]
    fn test_deep_chain_and_ancestors() {
        let index = IdentityIndex::build(vec![
            msg(1, Some("a")).build(),
            msg(2, Some("b")).reply_to("a").build(),
            msg(3, Some("c")).reply_to("b").build(),
        ]);
        let g = graph(&index);
        assert_eq!(path_of(&index, &g, "c"), "0/0/0");
        let c = index.lookup("c").unwrap();
        let anc: Vec<_> = g.ancestors(c).iter().map(|&h| index.get(h).message_id.clone().unwrap()).collect();
        assert_eq!(anc, vec!["b", "a"]);
    }

    #[test]
    fn test_wide_sibling_set_padded() {
        let mut batch = vec![msg(0, Some("root")).subject("r").build()];
        for i in 1..=11u128 {
            let id = format!("m{i}");
            batch.push(msg(i, Some(&id)).subject(&id).reply_to("root").build());
        }
        let index = IdentityIndex::build(batch);
        let g = graph(&index);
        let group = &g.groups[0];
        let paths = g.paths(group);
        let mut sorted: Vec<&String> = paths.values().collect();
        sorted.sort();
        assert_eq!(sorted[0], "0");
        assert_eq!(sorted[1], "0/00");
        assert_eq!(sorted[11], "0/10");
        assert_eq!(paths[&index.lookup("m3").unwrap()], "0/02");
    }

    #[test]
    fn test_unrelated_messages_separate() {
        let index = IdentityIndex::build(vec![
            msg(1, Some("a")).subject("one").build(),
            msg(2, Some("b")).subject("two").build(),
        ]);
        let g = graph(&index);
        assert_eq!(g.groups.len(), 2);
        assert!(g.links(&index, Uuid::nil(), Utc::now()).is_empty());
    }

    #[test]
    fn test_cycle_broken_deterministically() {
        let index = IdentityIndex::build(vec![
            msg(1, Some("a")).subject("x").reply_to("b").build(),
            msg(2, Some("b")).subject("y").reply_to("a").build(),
        ]);
        let g = graph(&index);
        assert_eq!(g.groups.len(), 1);
        assert_eq!(g.anomalies.len(), 1);
        assert_eq!(g.anomalies[0].kind, AnomalyKind::CycleBroken);
        // equal tiers: the earliest child (a) loses its edge
        let a = index.lookup("a").unwrap();
        assert!(g.resolutions[a].parent.is_none());
        assert!(g
            .resolutions[a]
            .alternatives
            .iter()
            .any(|alt| alt.reason == "cycle_break"));
        assert_eq!(g.groups[0].id, "a");
        assert_eq!(g.anomalies[0].thread_group_id.as_deref(), Some("a"));
    }

    #[test]
    fn test_cycle_cuts_weakest_tier() {
        // b -> c by References, c -> b by In-Reply-To: the References edge goes
        let index = IdentityIndex::build(vec![
            msg(1, Some("b")).subject("p").references(&["c"]).build(),
            msg(2, Some("c")).subject("q").reply_to("b").build(),
        ]);
        let g = graph(&index);
        let b = index.lookup("b").unwrap();
        let c = index.lookup("c").unwrap();
        assert!(g.resolutions[b].parent.is_none());
        assert_eq!(g.resolutions[c].parent, Some(b));
        assert_eq!(g.resolutions[c].method, Some(LinkMethod::MessageIdExact));
    }

    #[test]
    fn test_duplicate_root_uses_email_id() {
        let index = IdentityIndex::build(vec![
            msg(1, Some("dup")).subject("one").build(),
            msg(2, Some("dup")).subject("two").build(),
        ]);
        let g = graph(&index);
        let ids: Vec<&str> = g.groups.iter().map(|gr| gr.id.as_str()).collect();
        assert!(ids.contains(&"dup"));
        assert!(ids.contains(&Uuid::from_u128(2).to_string().as_str()));
    }

    #[test]
    fn test_links_one_per_edge() {
        let index = IdentityIndex::build(vec![
            msg(1, Some("a")).subject("s").build(),
            msg(2, Some("b")).subject("t").reply_to("a").build(),
            msg(3, Some("c")).subject("u").reply_to("missing").build(),
        ]);
        let g = graph(&index);
        let run = Uuid::from_u128(99);
        let links = g.links(&index, run, Utc::now());
        assert_eq!(links.len(), 2);
        let edge = links.iter().find(|l| l.parent_email_id.is_some()).unwrap();
        assert_eq!(edge.id, link_id(Uuid::from_u128(2), Some(Uuid::from_u128(1))));
        assert_eq!(edge.run_id, run);
        assert_eq!(edge.evidence["thread_group_id"], json!("a"));
        let root = links.iter().find(|l| l.parent_email_id.is_none()).unwrap();
        assert_eq!(root.alternatives[0].reason, "missing_from_batch");
    }
}
