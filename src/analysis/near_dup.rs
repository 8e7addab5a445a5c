//! Corpus-wide near-duplicate clustering.
//!
//! Canonical bodies are cut into word shingles, each hashed to 64 bits.
//! Pairs whose shingle sets have a Jaccard resemblance at or above the
//! threshold are unioned; each resulting group is represented by its
//! earliest message.

use std::collections::{BTreeMap, HashMap};

use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::AnalysisConfig;
use crate::index::{Handle, IdentityIndex};
use crate::model::message::chrono_key;

/// Near-duplicate membership of one message.
#[derive(Debug, Clone, PartialEq)]
pub struct NearDup {
    pub group_id: String,
    /// Resemblance to the group representative (1.0 for the representative).
    pub score: f64,
}

/// Shingle-based near-duplicate analyzer.
#[derive(Debug, Clone)]
pub struct NearDupAnalyzer {
    threshold: f64,
    shingle_size: usize,
}

impl NearDupAnalyzer {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            threshold: config.near_dup_similarity_threshold,
            shingle_size: config.shingle_size.max(1),
        }
    }

    /// Cluster the whole batch. `extra_pairs` are always compared (e.g.
    /// records sharing a `message_id`). Output is indexed by handle.
    pub fn analyze(
        &self,
        index: &IdentityIndex,
        extra_pairs: &[(Handle, Handle)],
    ) -> Vec<Option<NearDup>> {
        let shingles: Vec<Vec<u64>> = index
            .messages()
            .par_iter()
            .map(|m| hashed_shingles(&m.canonical_body, self.shingle_size))
            .collect();

        let mut pairs = self.candidate_pairs(&shingles);
        for &(a, b) in extra_pairs {
            if shingles[a].is_empty() || shingles[b].is_empty() {
                continue;
            }
            if jaccard(&shingles[a], &shingles[b]) >= self.threshold {
                pairs.push((a.min(b), a.max(b)));
            }
        }
        pairs.sort_unstable();
        pairs.dedup();

        let mut uf = UnionFind::new(index.len());
        for &(a, b) in &pairs {
            uf.union(a, b);
        }

        let mut components: BTreeMap<usize, Vec<Handle>> = BTreeMap::new();
        for &(a, b) in &pairs {
            for h in [a, b] {
                let root = uf.find(h);
                let members = components.entry(root).or_default();
                if !members.contains(&h) {
                    members.push(h);
                }
            }
        }

        let mut out: Vec<Option<NearDup>> = vec![None; index.len()];
        for members in components.values() {
            let Some(&rep) = members.iter().min_by_key(|&&h| {
                let m = index.get(h);
                chrono_key(m.date_sent, m.email_id)
            }) else {
                continue;
            };
            let group_id = format!("near_dup_{}", index.get(rep).email_id);
            for &h in members {
                let score = if h == rep {
                    1.0
                } else {
                    jaccard(&shingles[h], &shingles[rep])
                };
                out[h] = Some(NearDup {
                    group_id: group_id.clone(),
                    score,
                });
            }
        }

        debug!(
            pairs = pairs.len(),
            groups = components.len(),
            threshold = self.threshold,
            "near-duplicate clustering finished"
        );
        out
    }

    /// Pairs `(a, b)`, `a < b`, at or above the threshold, found through an
    /// inverted shingle index.
    fn candidate_pairs(&self, shingles: &[Vec<u64>]) -> Vec<(Handle, Handle)> {
        let mut postings: HashMap<u64, Vec<Handle>> = HashMap::new();
        for (h, set) in shingles.iter().enumerate() {
            for &s in set {
                postings.entry(s).or_default().push(h);
            }
        }

        (0..shingles.len())
            .into_par_iter()
            .flat_map_iter(|a| {
                let mine = &shingles[a];
                let mut shared: HashMap<Handle, usize> = HashMap::new();
                for s in mine {
                    if let Some(list) = postings.get(s) {
                        for &b in list.iter().filter(|&&b| b > a) {
                            let (small, large) = if mine.len() < shingles[b].len() {
                                (mine.len(), shingles[b].len())
                            } else {
                                (shingles[b].len(), mine.len())
                            };
                            // J(A, B) <= |small| / |large|
                            if (small as f64) < self.threshold * large as f64 {
                                continue;
                            }
                            *shared.entry(b).or_insert(0) += 1;
                        }
                    }
                }
                let threshold = self.threshold;
                let mine_len = mine.len();
                shared
                    .into_iter()
                    .filter(move |&(b, inter)| {
                        let union = mine_len + shingles[b].len() - inter;
                        union > 0 && inter as f64 / union as f64 >= threshold
                    })
                    .map(move |(b, _)| (a, b))
            })
            .collect()
    }
}

/// Sorted, de-duplicated 64-bit hashes of the word shingles of `text`.
///
/// Texts shorter than one shingle yield a single shingle of all their
/// words; empty texts yield nothing and never match.
pub fn hashed_shingles(text: &str, n: usize) -> Vec<u64> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return Vec::new();
    }
    let mut out: Vec<u64> = if words.len() < n {
        vec![shingle_hash(&words)]
    } else {
        words.windows(n).map(shingle_hash).collect()
    };
    out.sort_unstable();
    out.dedup();
    out
}

fn shingle_hash(words: &[&str]) -> u64 {
    let mut hasher = Sha256::new();
    for w in words {
        hasher.update(w.as_bytes());
        hasher.update([0x1f]);
    }
    let digest = hasher.finalize();
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(buf)
}

/// Jaccard resemblance of two sorted, de-duplicated sets.
pub fn jaccard(a: &[u64], b: &[u64]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let (mut i, mut j, mut inter) = (0, 0, 0usize);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                inter += 1;
                i += 1;
                j += 1;
            }
        }
    }
    let union = a.len() + b.len() - inter;
    inter as f64 / union as f64
}

/// Union-find with path halving; the smaller handle becomes the root.
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}
