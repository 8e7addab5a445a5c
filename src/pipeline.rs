//! Two-phase engine run.
//!
//! Phase 1 canonicalizes every record independently and hashes its
//! attachments. Phase 2 starts only once the whole batch is canonical: it
//! builds the identity index, resolves parents, assigns threads, analyzes
//! and reports. Attachments are committed to the store last, so a failed
//! or cancelled run leaves nothing behind.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::analysis::{inclusivity, NearDupAnalyzer};
use crate::canonical::{self, Canonicalized, Canonicalizer};
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::index::{Handle, IdentityIndex};
use crate::model::anomaly::{Anomaly, AnomalyKind, AnomalyReport};
use crate::model::attachment::{Attachment, AttachmentIdentity, AttachmentReference};
use crate::model::digest::Digest256;
use crate::model::link::ThreadLink;
use crate::model::message::{CanonicalMessage, MessageAttachment};
use crate::model::raw::{AttachmentSource, RawMessage};
use crate::report::{self, ConsistencyChecker};
use crate::store::{AttachmentStore, Blob};
use crate::thread::graph::size_histogram;
use crate::thread::{Resolver, ThreadGraph};

/// Progress callback: `(records canonicalized, total records)`. May borrow
/// from the caller's stack.
pub type ProgressFn<'a> = dyn Fn(u64, u64) + Sync + 'a;

/// Cooperative cancellation flag, checked at phase boundaries and per
/// record or thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A canonical message next to the raw record it came from.
///
/// The raw record is passed through as received, minus attachment
/// payloads, which live in the attachment store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub canonical: CanonicalMessage,
    pub raw: RawMessage,
}

/// Everything one run produced. Only ever returned whole.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub ruleset_version: String,
    pub ruleset_hash: Digest256,
    /// Sorted by `email_id`.
    pub messages: Vec<MessageRecord>,
    /// Sorted by child `email_id`.
    pub links: Vec<ThreadLink>,
    /// Store contents after the run, sorted by hash.
    pub attachments: Vec<Attachment>,
    pub anomalies: AnomalyReport,
}

/// Counts describing one run (`run.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub ruleset_version: String,
    pub ruleset_hash: Digest256,
    pub messages: usize,
    pub thread_groups: usize,
    pub thread_links: usize,
    pub inclusive_messages: usize,
    pub near_dup_groups: usize,
    pub attachments: usize,
    pub attachment_references: usize,
    pub attachment_bytes: u64,
    pub anomalies: BTreeMap<AnomalyKind, usize>,
}

impl RunOutput {
    pub fn summary(&self) -> RunSummary {
        let canonical = || self.messages.iter().map(|r| &r.canonical);
        let groups: BTreeSet<&str> = canonical().map(|m| m.thread_group_id.as_str()).collect();
        let near: BTreeSet<&str> = canonical()
            .filter_map(|m| m.near_dup_group_id.as_deref())
            .collect();
        RunSummary {
            run_id: self.run_id,
            created_at: self.created_at,
            ruleset_version: self.ruleset_version.clone(),
            ruleset_hash: self.ruleset_hash,
            messages: self.messages.len(),
            thread_groups: groups.len(),
            thread_links: self.links.len(),
            inclusive_messages: canonical().filter(|m| m.is_inclusive).count(),
            near_dup_groups: near.len(),
            attachments: self.attachments.len(),
            attachment_references: self
                .attachments
                .iter()
                .flat_map(|a| &a.references)
                .filter(|r| r.run_id == Some(self.run_id))
                .count(),
            attachment_bytes: self.attachments.iter().map(|a| a.size_bytes).sum(),
            anomalies: self.anomalies.counts.clone(),
        }
    }
}

struct PendingAttachment {
    identity: AttachmentIdentity,
    blob: Blob,
    reference: AttachmentReference,
}

struct Prepared {
    message: CanonicalMessage,
    raw: RawMessage,
    anomalies: Vec<Anomaly>,
    attachments: Vec<PendingAttachment>,
}

/// The threading and deduplication engine.
#[derive(Debug)]
pub struct Engine {
    config: Config,
    canonicalizer: Canonicalizer,
    resolver: Resolver,
    near_dup: NearDupAnalyzer,
    checker: ConsistencyChecker,
    pool: Option<rayon::ThreadPool>,
}

impl Engine {
    /// Validate the configuration and compile the pattern table.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let canonicalizer = Canonicalizer::new(&config)?;
        let pool = match config.general.worker_threads {
            0 => None,
            n => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("threadline-{i}"))
                    .build()
                    .map_err(|e| EngineError::InvalidConfig(format!("worker pool: {e}")))?,
            ),
        };
        Ok(Self {
            resolver: Resolver::new(&config.threading),
            near_dup: NearDupAnalyzer::new(&config.analysis),
            checker: ConsistencyChecker::new(&config.consistency),
            canonicalizer,
            pool,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// An empty store using the configured blob prefix.
    pub fn new_store(&self) -> AttachmentStore {
        AttachmentStore::new(&self.config.attachments.blob_prefix)
    }

    /// Process one batch with a fresh attachment store.
    pub fn run(&self, records: Vec<RawMessage>, cancel: &CancelToken) -> Result<RunOutput> {
        let store = self.new_store();
        self.run_with_store(records, &store, cancel, None)
    }

    /// Process one batch, appending to an existing attachment store.
    pub fn run_with_store(
        &self,
        records: Vec<RawMessage>,
        store: &AttachmentStore,
        cancel: &CancelToken,
        progress: Option<&ProgressFn<'_>>,
    ) -> Result<RunOutput> {
        match &self.pool {
            Some(pool) => pool.install(|| self.execute(records, store, cancel, progress)),
            None => self.execute(records, store, cancel, progress),
        }
    }

    fn execute(
        &self,
        records: Vec<RawMessage>,
        store: &AttachmentStore,
        cancel: &CancelToken,
        progress: Option<&ProgressFn<'_>>,
    ) -> Result<RunOutput> {
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        let created_at = Utc::now();
        let total = records.len() as u64;
        info!(run_id = %run_id, records = total, "Run started");
        cancel.check()?;

        // ── Phase 1: canonicalize ───────────────────────────────
        let phase = Instant::now();
        let fingerprints: Vec<Digest256> = records.par_iter().map(canonical::fingerprint).collect();
        let mut occurrences: HashMap<Digest256, u32> = HashMap::new();
        let ids: Vec<Uuid> = fingerprints
            .iter()
            .map(|fp| {
                let n = occurrences.entry(*fp).or_insert(0);
                let id = canonical::email_id(fp, *n);
                *n += 1;
                id
            })
            .collect();

        let done = AtomicU64::new(0);
        let mut prepared: Vec<Prepared> = records
            .into_par_iter()
            .zip(ids.into_par_iter())
            .map(|(raw, id)| {
                cancel.check()?;
                let p = self.prepare(raw, id, run_id)?;
                if let Some(report_progress) = progress {
                    report_progress(done.fetch_add(1, Ordering::Relaxed) + 1, total);
                }
                Ok(p)
            })
            .collect::<Result<Vec<_>>>()?;
        prepared.sort_by_key(|p| p.message.email_id);

        let mut messages = Vec::with_capacity(prepared.len());
        let mut raws = Vec::with_capacity(prepared.len());
        let mut anomalies = Vec::new();
        let mut pending = Vec::new();
        for p in prepared {
            messages.push(p.message);
            raws.push(p.raw);
            anomalies.extend(p.anomalies);
            pending.extend(p.attachments);
        }
        info!(
            messages = messages.len(),
            attachments = pending.len(),
            elapsed_ms = phase.elapsed().as_millis() as u64,
            "Phase 1 complete: canonicalized"
        );
        cancel.check()?;

        // ── Phase 2: index, thread, analyze ─────────────────────
        let phase = Instant::now();
        let index = IdentityIndex::build(messages);
        let resolutions = self.resolver.resolve_all(&index);
        cancel.check()?;

        let graph = ThreadGraph::build(&index, resolutions);
        debug!(sizes = ?size_histogram(&graph), "Thread size histogram");
        let content = inclusivity::content_table(&index);
        let per_group: Vec<Vec<(Handle, String, bool)>> = graph
            .groups
            .par_iter()
            .map(|g| {
                cancel.check()?;
                let mut paths = graph.paths(g);
                Ok(inclusivity::analyze_group(&graph, g, &content)
                    .into_iter()
                    .map(|(h, inclusive)| (h, paths.remove(&h).unwrap_or_default(), inclusive))
                    .collect())
            })
            .collect::<Result<_>>()?;
        cancel.check()?;

        let near = self.near_dup.analyze(&index, &index.duplicate_pairs());
        let links = graph.links(&index, run_id, created_at);
        info!(
            groups = graph.groups.len(),
            links = links.len(),
            elapsed_ms = phase.elapsed().as_millis() as u64,
            "Phase 2 complete: threaded"
        );

        anomalies.extend(index.duplicate_anomalies());
        anomalies.extend(graph.anomalies.iter().cloned());
        anomalies.extend(self.checker.check(&index, &graph));
        for a in anomalies.iter_mut().filter(|a| a.thread_group_id.is_none()) {
            if let Some(h) = a.email_ids.first().and_then(|&id| index.handle_of(id)) {
                a.thread_group_id = Some(graph.group_id(h).to_string());
            }
        }
        let anomalies = report::assemble([anomalies]);

        let n = index.len();
        let mut paths = vec![String::new(); n];
        let mut inclusive = vec![false; n];
        for (h, path, inc) in per_group.into_iter().flatten() {
            paths[h] = path;
            inclusive[h] = inc;
        }
        let parents: Vec<Option<(String, Uuid)>> = (0..n)
            .map(|h| {
                graph.resolutions[h].parent.map(|p| {
                    let parent = index.get(p);
                    (parent.display_id(), parent.email_id)
                })
            })
            .collect();
        let groups: Vec<String> = (0..n).map(|h| graph.group_id(h).to_string()).collect();

        let mut canonical = index.into_messages();
        for (h, m) in canonical.iter_mut().enumerate() {
            m.thread_group_id = groups[h].clone();
            m.thread_path = std::mem::take(&mut paths[h]);
            m.is_inclusive = inclusive[h];
            if let Some((message_id, email_id)) = &parents[h] {
                m.parent_message_id = Some(message_id.clone());
                m.parent_email_id = Some(*email_id);
            }
            if let Some(nd) = &near[h] {
                m.near_dup_group_id = Some(nd.group_id.clone());
                m.near_dup_score = Some(nd.score);
            }
        }

        // Last checkpoint before the store is touched.
        cancel.check()?;
        pending.into_par_iter().for_each(|p| {
            let hash = store.intern_identified(p.identity, p.blob);
            store.add_reference(&hash, p.reference);
        });

        let messages: Vec<MessageRecord> = canonical
            .into_iter()
            .zip(raws)
            .map(|(canonical, raw)| MessageRecord { canonical, raw })
            .collect();
        let patterns = self.canonicalizer.patterns();
        let output = RunOutput {
            run_id,
            created_at,
            ruleset_version: patterns.version().to_string(),
            ruleset_hash: patterns.ruleset_hash(),
            messages,
            links,
            attachments: store.snapshot(),
            anomalies,
        };
        info!(
            run_id = %run_id,
            messages = output.messages.len(),
            attachments = output.attachments.len(),
            anomalies = output.anomalies.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Run complete"
        );
        Ok(output)
    }

    /// Phase 1 for one record.
    fn prepare(&self, mut raw: RawMessage, email_id: Uuid, run_id: Uuid) -> Result<Prepared> {
        let Canonicalized {
            mut message,
            mut anomalies,
        } = self.canonicalizer.canonicalize_message(&raw, email_id);

        let mut attachments = Vec::with_capacity(raw.attachments.len());
        for (i, att) in std::mem::take(&mut raw.attachments).into_iter().enumerate() {
            let filename = att
                .filename
                .as_deref()
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(String::from)
                .unwrap_or_else(|| format!("attachment-{}", i + 1));
            let (identity, buffered) = self.canonicalizer.canonicalize_attachment(&att, &filename)?;
            if identity.streamed {
                anomalies.push(
                    Anomaly::new(
                        AnomalyKind::StreamedHash,
                        vec![email_id],
                        format!("{filename} exceeds the buffering limit; hashed by streaming"),
                    )
                    .with_evidence("filename", filename.as_str())
                    .with_evidence("size_bytes", identity.size_bytes)
                    .with_evidence("attachment_hash", identity.attachment_hash.to_hex()),
                );
            }
            let blob = match (buffered, att.content) {
                (Some(bytes), _) => Blob::Bytes(Arc::new(bytes)),
                (None, AttachmentSource::Bytes(bytes)) => Blob::Bytes(Arc::new(bytes)),
                (None, AttachmentSource::File(path)) => Blob::File(path),
            };
            message.attachments.push(MessageAttachment {
                attachment_hash: identity.attachment_hash,
                original_filename: filename.clone(),
                original_path: att.path.clone(),
            });
            attachments.push(PendingAttachment {
                reference: AttachmentReference {
                    owning_email_id: email_id,
                    owning_message_id: message.message_id.clone(),
                    original_filename: filename,
                    original_path: att.path,
                    run_id: Some(run_id),
                },
                identity,
                blob,
            });
        }

        Ok(Prepared {
            message,
            raw,
            anomalies,
            attachments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::raw::RawAttachment;

    fn engine() -> Engine {
        Engine::new(Config::default()).unwrap()
    }

    fn reply(id: &str, parent: &str, body: &str) -> RawMessage {
        let mut r = RawMessage::new(Some(id), "Re: Site visit", body);
        r.in_reply_to = Some(parent.to_string());
        r.sender = Some("bob@x.com".into());
        r.recipients.to = vec!["ann@x.com".into()];
        r
    }

    #[test]
    fn test_cancelled_before_start() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = engine()
            .run(vec![RawMessage::new(Some("<a@x>"), "s", "b")], &cancel)
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[test]
    fn test_cancelled_run_leaves_store_untouched() {
        let e = engine();
        let store = e.new_store();
        let mut raw = RawMessage::new(Some("<a@x>"), "s", "b");
        raw.attachments.push(RawAttachment {
            filename: Some("a.txt".into()),
            path: None,
            content_type: None,
            content: AttachmentSource::Bytes(b"payload".to_vec()),
        });
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(e.run_with_store(vec![raw], &store, &cancel, None).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_small_thread_assignments() {
        let mut root = RawMessage::new(Some("<a@x>"), "Site visit", "Can we meet on site at nine?");
        root.sender = Some("ann@x.com".into());
        root.recipients.to = vec!["bob@x.com".into()];
        root.date_sent = Some("Mon, 01 Jan 2024 09:00:00 +0000".into());
        let mut b = reply("<b@x>", "<a@x>", "Nine works.");
        b.date_sent = Some("Mon, 01 Jan 2024 10:00:00 +0000".into());

        let out = engine().run(vec![b, root], &CancelToken::new()).unwrap();
        assert_eq!(out.messages.len(), 2);
        let by_id: HashMap<&str, &CanonicalMessage> = out
            .messages
            .iter()
            .map(|r| (r.canonical.message_id.as_deref().unwrap(), &r.canonical))
            .collect();
        assert_eq!(by_id["a@x"].thread_path, "0");
        assert_eq!(by_id["b@x"].thread_path, "0/0");
        assert_eq!(by_id["b@x"].thread_group_id, "a@x");
        assert_eq!(by_id["b@x"].parent_message_id.as_deref(), Some("a@x"));
        assert!(by_id["a@x"].is_inclusive && by_id["b@x"].is_inclusive);
        assert_eq!(out.links.len(), 1);
        assert!(out.anomalies.is_empty(), "{:?}", out.anomalies);
    }

    #[test]
    fn test_progress_reported() {
        let seen = AtomicU64::new(0);
        let callback: &ProgressFn<'_> = &|done, total| {
            assert!(done <= total);
            seen.fetch_max(done, Ordering::Relaxed);
        };
        let e = engine();
        let store = e.new_store();
        let records = (0..5)
            .map(|i| RawMessage::new(Some(&format!("<m{i}@x>")), "s", "b"))
            .collect();
        e.run_with_store(records, &store, &CancelToken::new(), Some(callback))
            .unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_summary_counts() {
        let out = engine()
            .run(
                vec![
                    RawMessage::new(Some("<a@x>"), "one", "first"),
                    RawMessage::new(Some("<b@x>"), "two", "second"),
                ],
                &CancelToken::new(),
            )
            .unwrap();
        let s = out.summary();
        assert_eq!(s.messages, 2);
        assert_eq!(s.thread_groups, 2);
        assert_eq!(s.inclusive_messages, 2);
        assert_eq!(s.attachments, 0);
    }
}
