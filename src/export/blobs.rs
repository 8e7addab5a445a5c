//! Content-addressed blob files.

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::canonical::hash::sha256_copy;
use crate::error::{EngineError, Result};
use crate::model::attachment::Attachment;
use crate::model::digest::Digest256;
use crate::store::{AttachmentStore, Blob};

/// Write one file per distinct attachment under `root`, at its
/// `canonical_blob_ref`. Existing blobs are left alone: same path, same
/// bytes. Returns the number of files written.
pub fn write_blobs(store: &AttachmentStore, rows: &[Attachment], root: &Path) -> Result<usize> {
    let mut written = 0;
    for row in rows {
        let target = blob_path(root, &row.canonical_blob_ref);
        if target.exists() {
            continue;
        }
        let Some(blob) = store.blob(&row.attachment_hash) else {
            debug!(hash = %row.attachment_hash, "No payload held for attachment; skipping");
            continue;
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
        }
        let partial = target.with_extension("partial");
        match blob {
            Blob::Bytes(bytes) => {
                fs::write(&partial, bytes.as_slice()).map_err(|e| EngineError::io(&partial, e))?
            }
            Blob::File(source) => {
                if let Err(e) = copy_verified(&source, &partial, &row.attachment_hash) {
                    let _ = fs::remove_file(&partial);
                    return Err(e);
                }
            }
        }
        fs::rename(&partial, &target).map_err(|e| EngineError::io(&target, e))?;
        written += 1;
    }
    Ok(written)
}

/// Copy a source file to `dest`, failing if its bytes no longer hash to
/// `expected`.
fn copy_verified(source: &Path, dest: &Path, expected: &Digest256) -> Result<()> {
    let input = File::open(source).map_err(|e| EngineError::io(source, e))?;
    let output = File::create(dest).map_err(|e| EngineError::io(dest, e))?;
    let mut writer = BufWriter::new(output);
    let (actual, _) = sha256_copy(input, &mut writer).map_err(|e| EngineError::io(source, e))?;
    if actual != *expected {
        return Err(EngineError::io(
            source,
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("content changed since hashing: expected {expected}, found {actual}"),
            ),
        ));
    }
    Ok(())
}

/// `root/<prefix>/<ab>/<hex>` from a blob reference.
pub fn blob_path(root: &Path, blob_ref: &str) -> PathBuf {
    blob_ref
        .split('/')
        .filter(|part| !part.is_empty() && *part != "..")
        .fold(root.to_path_buf(), |path, part| path.join(part))
}
