//! Hand-off files for the persistence layer: JSON Lines tables, a CSV view
//! of thread links, the run summary and content-addressed blobs.

pub mod blobs;
pub mod csv;
pub mod jsonl;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{EngineError, Result};
use crate::pipeline::RunOutput;
use crate::store::AttachmentStore;

pub const MESSAGES_FILE: &str = "messages.jsonl";
pub const LINKS_FILE: &str = "thread_links.jsonl";
pub const LINKS_CSV_FILE: &str = "thread_links.csv";
pub const ATTACHMENTS_FILE: &str = "attachments.jsonl";
pub const ANOMALIES_FILE: &str = "anomalies.jsonl";
pub const RUN_FILE: &str = "run.json";
pub const BLOBS_DIR: &str = "blobs";

/// Write a complete run into `out_dir`.
///
/// Everything goes to a sibling staging directory first, which is renamed
/// into place only once every file is written. `out_dir` must not exist.
pub fn write_run(output: &RunOutput, store: &AttachmentStore, out_dir: &Path) -> Result<PathBuf> {
    if out_dir.exists() {
        return Err(EngineError::io(
            out_dir,
            io::Error::new(io::ErrorKind::AlreadyExists, "output directory already exists"),
        ));
    }
    let staging = staging_dir(out_dir);
    if staging.exists() {
        fs::remove_dir_all(&staging).map_err(|e| EngineError::io(&staging, e))?;
    }
    fs::create_dir_all(&staging).map_err(|e| EngineError::io(&staging, e))?;

    if let Err(e) = write_files(output, store, &staging) {
        let _ = fs::remove_dir_all(&staging);
        return Err(e);
    }
    fs::rename(&staging, out_dir).map_err(|e| EngineError::io(out_dir, e))?;
    info!(path = %out_dir.display(), run_id = %output.run_id, "Run output written");
    Ok(out_dir.to_path_buf())
}

fn write_files(output: &RunOutput, store: &AttachmentStore, dir: &Path) -> Result<()> {
    jsonl::write_jsonl(&output.messages, &dir.join(MESSAGES_FILE))?;
    jsonl::write_jsonl(&output.links, &dir.join(LINKS_FILE))?;
    jsonl::write_jsonl(&output.attachments, &dir.join(ATTACHMENTS_FILE))?;
    jsonl::write_jsonl(&output.anomalies.anomalies, &dir.join(ANOMALIES_FILE))?;
    csv::export_links_csv(&output.links, &dir.join(LINKS_CSV_FILE))?;
    jsonl::write_json(&output.summary(), &dir.join(RUN_FILE))?;
    blobs::write_blobs(store, &output.attachments, &dir.join(BLOBS_DIR))?;
    Ok(())
}

/// `.<name>.staging` next to the target.
fn staging_dir(out_dir: &Path) -> PathBuf {
    let name = out_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "threadline-out".to_string());
    let parent = out_dir.parent().unwrap_or(Path::new("."));
    parent.join(format!(".{name}.staging"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use predicates::prelude::*;

    use crate::config::Config;
    use crate::model::raw::{AttachmentSource, RawAttachment, RawMessage};
    use crate::pipeline::{CancelToken, Engine};

    fn sample_run() -> (RunOutput, AttachmentStore) {
        let engine = Engine::new(Config::default()).unwrap();
        let store = engine.new_store();
        let mut a = RawMessage::new(Some("<a@x>"), "Contract", "Draft attached.");
        a.attachments.push(RawAttachment {
            filename: Some("contract.pdf".into()),
            path: None,
            content_type: None,
            content: AttachmentSource::Bytes(b"%PDF-1.4 v1".to_vec()),
        });
        let mut b = RawMessage::new(Some("<b@x>"), "Re: Contract", "Same file again.");
        b.in_reply_to = Some("<a@x>".into());
        b.attachments.push(RawAttachment {
            filename: Some("contract (1).pdf".into()),
            path: None,
            content_type: None,
            content: AttachmentSource::Bytes(b"%PDF-1.4 v1".to_vec()),
        });
        let out = engine
            .run_with_store(vec![a, b], &store, &CancelToken::new(), None)
            .unwrap();
        (out, store)
    }

    #[test]
    fn test_write_run_layout() {
        let (out, store) = sample_run();
        let tmp = assert_fs::TempDir::new().unwrap();
        let target = tmp.child("run1");
        write_run(&out, &store, target.path()).unwrap();

        for name in [MESSAGES_FILE, LINKS_FILE, ATTACHMENTS_FILE, ANOMALIES_FILE, LINKS_CSV_FILE, RUN_FILE] {
            target.child(name).assert(predicate::path::is_file());
        }
        target
            .child(MESSAGES_FILE)
            .assert(predicate::str::contains("\"thread_path\":\"0/0\""));
        target
            .child(ATTACHMENTS_FILE)
            .assert(predicate::str::contains("contract (1).pdf"));
        target
            .child(RUN_FILE)
            .assert(predicate::str::contains("\"attachments\": 1"));
        let hash = out.attachments[0].attachment_hash.to_hex();
        target
            .child(format!("{BLOBS_DIR}/sha256/{}/{hash}", &hash[..2]))
            .assert("%PDF-1.4 v1");
        tmp.child(".run1.staging").assert(predicate::path::missing());
    }

    #[test]
    fn test_existing_target_refused() {
        let (out, store) = sample_run();
        let tmp = assert_fs::TempDir::new().unwrap();
        let target = tmp.child("run1");
        target.create_dir_all().unwrap();
        let err = write_run(&out, &store, target.path()).unwrap_err();
        assert!(matches!(err, EngineError::Io { .. }));
    }
}
