//! Inclusivity: does a message add anything its ancestors did not carry?
//!
//! A message is inclusive if it has a body segment or an attachment hash
//! that no ancestor has. Thread roots are always inclusive.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::index::{Handle, IdentityIndex};
use crate::model::digest::Digest256;
use crate::model::message::CanonicalMessage;
use crate::thread::{ThreadGraph, ThreadGroup};

/// What a message contributes: its body segments and attachment hashes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageContent {
    pub segments: BTreeSet<String>,
    pub attachments: BTreeSet<Digest256>,
}

impl MessageContent {
    pub fn of(message: &CanonicalMessage) -> Self {
        Self {
            segments: segments(&message.canonical_body),
            attachments: message
                .attachments
                .iter()
                .map(|a| a.attachment_hash)
                .collect(),
        }
    }
}

fn attribution_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(?:on\s.{1,200}\swrote:|-+\s*(?:original message|forwarded message)\s*-+)$")
            .expect("valid attribution regex")
    })
}

fn quoted_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(?:from|sent|to|cc|bcc|subject|date)\s*:").expect("valid header regex")
    })
}

/// Split a canonical body into comparable segments.
///
/// Segments are blank-line separated blocks. Quote markers are removed so
/// a quoted copy of an ancestor's paragraph matches the original; quoted
/// header lines and reply attributions are ignored.
pub fn segments(body: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let mut current: Vec<String> = Vec::new();

    let mut flush = |current: &mut Vec<String>| {
        if !current.is_empty() {
            out.insert(current.join(" "));
            current.clear();
        }
    };

    for line in body.lines() {
        let unquoted = line.trim_start_matches(|c: char| c == '>' || c.is_whitespace());
        let text = unquoted.split_whitespace().collect::<Vec<_>>().join(" ");
        if text.is_empty() {
            flush(&mut current);
            continue;
        }
        if quoted_header_re().is_match(&text) || attribution_re().is_match(&text) {
            continue;
        }
        current.push(text);
    }
    flush(&mut current);
    out
}

/// Inclusivity of every member of one thread.
///
/// `content` is indexed by handle.
pub fn analyze_group(
    graph: &ThreadGraph,
    group: &ThreadGroup,
    content: &[MessageContent],
) -> Vec<(Handle, bool)> {
    group
        .members
        .iter()
        .map(|&h| {
            if h == group.root {
                return (h, true);
            }
            let ancestors = graph.ancestors(h);
            let own = &content[h];
            let new_segment = own
                .segments
                .iter()
                .any(|s| !ancestors.iter().any(|&a| content[a].segments.contains(s)));
            let new_attachment = own
                .attachments
                .iter()
                .any(|d| !ancestors.iter().any(|&a| content[a].attachments.contains(d)));
            (h, new_segment || new_attachment)
        })
        .collect()
}

/// Content of every message in the index, by handle.
pub fn content_table(index: &IdentityIndex) -> Vec<MessageContent> {
    use rayon::prelude::*;
    index.messages().par_iter().map(MessageContent::of).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThreadingConfig;
    use crate::model::message::testing::msg;
    use crate::thread::Resolver;

    fn inclusivity(batch: Vec<CanonicalMessage>) -> Vec<(String, bool)> {
        let index = IdentityIndex::build(batch);
        let resolutions = Resolver::new(&ThreadingConfig::default()).resolve_all(&index);
        let graph = ThreadGraph::build(&index, resolutions);
        let content = content_table(&index);
        let mut out: Vec<(String, bool)> = graph
            .groups
            .iter()
            .flat_map(|g| analyze_group(&graph, g, &content))
            .map(|(h, inc)| (index.get(h).message_id.clone().unwrap_or_default(), inc))
            .collect();
        out.sort();
        out
    }

    #[test]
    fn test_segments_strip_quotes() {
        let body = "thanks, agreed.\n\non mon, 1 jan 2024 at 10:00, bob wrote:\n> the pour is on friday.\n> > weather permitting";
        let segs = segments(body);
        assert!(segs.contains("thanks, agreed."));
        assert!(segs.contains("the pour is on friday. weather permitting"));
        assert_eq!(segs.len(), 2);
    }

    #[test]
    fn test_segments_skip_quoted_headers() {
        let body = "see below\n\nfrom: alice@x.com\nsent: monday\nsubject: slab\nthe slab is poured";
        let segs = segments(body);
        assert!(segs.contains("the slab is poured"));
        assert!(!segs.iter().any(|s| s.contains("alice@x.com")));
    }

    #[test]
    fn test_root_always_inclusive() {
        let out = inclusivity(vec![msg(1, Some("a")).body("").build()]);
        assert_eq!(out, vec![("a".to_string(), true)]);
    }

    #[test]
    fn test_pure_quote_not_inclusive() {
        let out = inclusivity(vec![
            msg(1, Some("a")).body("the pour is on friday.").build(),
            msg(2, Some("b")).reply_to("a").body("> the pour is on friday.").build(),
            msg(3, Some("c")).reply_to("a").body("moved to monday.\n\n> the pour is on friday.").build(),
        ]);
        assert_eq!(
            out,
            vec![
                ("a".to_string(), true),
                ("b".to_string(), false),
                ("c".to_string(), true)
            ]
        );
    }

    #[test]
    fn test_new_attachment_is_inclusive() {
        let out = inclusivity(vec![
            msg(1, Some("a")).body("drawings").attachment("rev-a.pdf", b"A").build(),
            msg(2, Some("b")).reply_to("a").body("drawings").attachment("rev-a.pdf", b"A").build(),
            msg(3, Some("c")).reply_to("b").body("drawings").attachment("rev-b.pdf", b"B").build(),
        ]);
        assert_eq!(out[1], ("b".to_string(), false));
        assert_eq!(out[2], ("c".to_string(), true));
    }
}
