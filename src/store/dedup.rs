//! Content-addressed attachment store.
//!
//! One entry per distinct byte sequence, keyed by SHA-256. The entry owns
//! the only copy of the payload; messages hold references. Inserts go
//! through the map's entry API, so concurrent interning of equal bytes
//! still yields exactly one blob.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use crate::canonical::hash;
use crate::model::attachment::{Attachment, AttachmentIdentity, AttachmentReference};
use crate::model::digest::Digest256;

/// Where the single physical copy of an attachment lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blob {
    /// Payload held in memory.
    Bytes(Arc<Vec<u8>>),
    /// Payload too large to buffer; still in the reader's file.
    File(PathBuf),
}

#[derive(Debug)]
struct StoreEntry {
    row: Attachment,
    blob: Blob,
}

/// Concurrent dedup table.
#[derive(Debug)]
pub struct AttachmentStore {
    prefix: String,
    entries: DashMap<Digest256, StoreEntry>,
}

impl AttachmentStore {
    pub fn new(blob_prefix: &str) -> Self {
        Self {
            prefix: blob_prefix.trim_end_matches('/').to_string(),
            entries: DashMap::new(),
        }
    }

    /// Intern raw bytes. Same bytes, same hash; the second call only bumps
    /// the intern count.
    pub fn intern(&self, bytes: &[u8]) -> Digest256 {
        let identity = hash::identify_bytes(bytes, "", None);
        self.intern_identified(identity, Blob::Bytes(Arc::new(bytes.to_vec())))
    }

    /// Intern a payload whose identity was already computed.
    pub fn intern_identified(&self, identity: AttachmentIdentity, blob: Blob) -> Digest256 {
        let key = identity.attachment_hash;
        match self.entries.entry(key) {
            Entry::Occupied(mut e) => {
                e.get_mut().row.intern_count += 1;
                trace!(hash = %key, "attachment already interned");
            }
            Entry::Vacant(e) => {
                let row = Attachment {
                    attachment_hash: key,
                    size_bytes: identity.size_bytes,
                    mime_type: identity.mime_type,
                    canonical_blob_ref: blob_ref(&self.prefix, &key),
                    intern_count: 1,
                    references: Vec::new(),
                };
                e.insert(StoreEntry { row, blob });
                trace!(hash = %key, "attachment interned");
            }
        }
        key
    }

    /// Append a reference. References are never removed. Returns `false`
    /// if the hash was never interned.
    pub fn add_reference(&self, hash: &Digest256, reference: AttachmentReference) -> bool {
        match self.entries.get_mut(hash) {
            Some(mut e) => {
                e.row.references.push(reference);
                true
            }
            None => false,
        }
    }

    /// Number of distinct attachments (and physical blobs).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, hash: &Digest256) -> bool {
        self.entries.contains_key(hash)
    }

    /// Row for one hash, references in stable order.
    pub fn get(&self, hash: &Digest256) -> Option<Attachment> {
        self.entries.get(hash).map(|e| sorted_row(&e.row))
    }

    /// The stored payload for one hash.
    pub fn blob(&self, hash: &Digest256) -> Option<Blob> {
        self.entries.get(hash).map(|e| e.blob.clone())
    }

    /// Every row, sorted by hash, references in stable order.
    pub fn snapshot(&self) -> Vec<Attachment> {
        let mut rows: Vec<Attachment> = self.entries.iter().map(|e| sorted_row(&e.row)).collect();
        rows.sort_by_key(|r| r.attachment_hash);
        rows
    }
}

fn sorted_row(row: &Attachment) -> Attachment {
    let mut row = row.clone();
    row.references.sort();
    row
}

/// `<prefix>/<first two hex chars>/<full hex>`.
pub fn blob_ref(prefix: &str, hash: &Digest256) -> String {
    let hex = hash.to_hex();
    format!("{prefix}/{}/{hex}", &hex[..2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;
    use uuid::Uuid;

    fn reference(n: u128, filename: &str) -> AttachmentReference {
        AttachmentReference {
            owning_email_id: Uuid::from_u128(n),
            owning_message_id: Some(format!("m{n}")),
            original_filename: filename.to_string(),
            original_path: None,
            run_id: None,
        }
    }

    #[test]
    fn test_intern_is_idempotent() {
        let store = AttachmentStore::new("sha256");
        let a = store.intern(b"%PDF-1.4 contract");
        assert_eq!(store.len(), 1);
        let b = store.intern(b"%PDF-1.4 contract");
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&a).unwrap().intern_count, 2);
    }

    #[test]
    fn test_references_append_only() {
        let store = AttachmentStore::new("sha256");
        let h = store.intern(b"bytes");
        assert!(store.add_reference(&h, reference(2, "contract (1).pdf")));
        assert!(store.add_reference(&h, reference(1, "contract.pdf")));
        let row = store.get(&h).unwrap();
        assert_eq!(row.references.len(), 2);
        assert_eq!(row.references[0].original_filename, "contract.pdf");

        let unknown = hash::sha256(b"never interned");
        assert!(!store.add_reference(&unknown, reference(3, "x")));
    }

    #[test]
    fn test_blob_ref_layout() {
        let store = AttachmentStore::new("sha256/");
        let h = store.intern(b"abc");
        let row = store.get(&h).unwrap();
        assert_eq!(
            row.canonical_blob_ref,
            "sha256/ba/ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_concurrent_intern_single_blob() {
        let store = AttachmentStore::new("sha256");
        let hashes: Vec<Digest256> = (0..64u64)
            .into_par_iter()
            .map(|i| {
                let h = store.intern(b"same payload");
                store.add_reference(&h, reference(u128::from(i), "same.bin"));
                h
            })
            .collect();
        assert!(hashes.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.len(), 1);
        let row = store.get(&hashes[0]).unwrap();
        assert_eq!(row.intern_count, 64);
        assert_eq!(row.references.len(), 64);
        assert!(matches!(store.blob(&hashes[0]), Some(Blob::Bytes(_))));
    }

    #[test]
    fn test_snapshot_sorted() {
        let store = AttachmentStore::new("sha256");
        for payload in [&b"one"[..], b"two", b"three"] {
            store.intern(payload);
        }
        let rows = store.snapshot();
        assert_eq!(rows.len(), 3);
        assert!(rows.windows(2).all(|w| w[0].attachment_hash < w[1].attachment_hash));
    }
}
