//! Content hashing and MIME detection for attachments.
//!
//! Hashing is format-agnostic: bytes in, SHA-256 out. MIME detection only
//! looks at the first few bytes and the filename, never at content structure.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{EngineError, Result};
use crate::model::attachment::AttachmentIdentity;
use crate::model::digest::Digest256;
use crate::model::raw::AttachmentSource;

/// Read chunk size for streamed hashing.
pub const STREAM_CHUNK_BYTES: usize = 64 * 1024;

/// Bytes kept from the head of a streamed file for magic-byte sniffing.
const SNIFF_BYTES: usize = 16;

pub const OCTET_STREAM: &str = "application/octet-stream";

/// SHA-256 of a byte slice.
pub fn sha256(bytes: &[u8]) -> Digest256 {
    Digest256(Sha256::digest(bytes).into())
}

/// SHA-256 of a reader, consumed in fixed-size chunks.
///
/// Returns the digest, the number of bytes read, and the first bytes of
/// the stream for sniffing.
pub fn sha256_reader<R: Read>(mut reader: R) -> std::io::Result<(Digest256, u64, Vec<u8>)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; STREAM_CHUNK_BYTES];
    let mut head = Vec::with_capacity(SNIFF_BYTES);
    let mut total: u64 = 0;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if head.len() < SNIFF_BYTES {
            let take = (SNIFF_BYTES - head.len()).min(n);
            head.extend_from_slice(&buf[..take]);
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    Ok((Digest256(hasher.finalize().into()), total, head))
}

/// Copy `reader` into `writer`, hashing on the way through.
pub fn sha256_copy<R: Read, W: Write>(mut reader: R, writer: &mut W) -> std::io::Result<(Digest256, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; STREAM_CHUNK_BYTES];
    let mut total: u64 = 0;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    writer.flush()?;

    Ok((Digest256(hasher.finalize().into()), total))
}

/// Identity of in-memory attachment bytes.
pub fn identify_bytes(bytes: &[u8], filename: &str, declared: Option<&str>) -> AttachmentIdentity {
    AttachmentIdentity {
        attachment_hash: sha256(bytes),
        size_bytes: bytes.len() as u64,
        mime_type: detect_mime(declared, bytes, filename),
        streamed: false,
    }
}

/// Identity of an attachment source.
///
/// File sources above `max_buffered` bytes are streamed through the hasher
/// instead of being read whole. An unreadable file is an error: the run
/// cannot vouch for bytes it never saw.
pub fn identify_source(
    source: &AttachmentSource,
    filename: &str,
    declared: Option<&str>,
    max_buffered: u64,
) -> Result<(AttachmentIdentity, Option<Vec<u8>>)> {
    match source {
        AttachmentSource::Bytes(bytes) => Ok((identify_bytes(bytes, filename, declared), None)),
        AttachmentSource::File(path) => identify_file(path, filename, declared, max_buffered),
    }
}

fn identify_file(
    path: &Path,
    filename: &str,
    declared: Option<&str>,
    max_buffered: u64,
) -> Result<(AttachmentIdentity, Option<Vec<u8>>)> {
    let meta = std::fs::metadata(path).map_err(|e| EngineError::io(path, e))?;
    if meta.len() <= max_buffered {
        let bytes = std::fs::read(path).map_err(|e| EngineError::io(path, e))?;
        let identity = identify_bytes(&bytes, filename, declared);
        return Ok((identity, Some(bytes)));
    }

    let file = File::open(path).map_err(|e| EngineError::io(path, e))?;
    let (digest, size, head) =
        sha256_reader(BufReader::new(file)).map_err(|e| EngineError::io(path, e))?;
    Ok((
        AttachmentIdentity {
            attachment_hash: digest,
            size_bytes: size,
            mime_type: detect_mime(declared, &head, filename),
            streamed: true,
        },
        None,
    ))
}

// ── MIME detection ──────────────────────────────────────────────

/// Declared type if usable, else magic bytes, else file extension.
pub fn detect_mime(declared: Option<&str>, head: &[u8], filename: &str) -> String {
    if let Some(d) = declared.map(normalize_declared).filter(|d| !d.is_empty()) {
        if d != OCTET_STREAM {
            return d;
        }
    }
    sniff_magic(head)
        .or_else(|| mime_from_extension(filename))
        .unwrap_or(OCTET_STREAM)
        .to_string()
}

/// `"Application/PDF; name=x.pdf"` → `"application/pdf"`.
fn normalize_declared(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

fn sniff_magic(head: &[u8]) -> Option<&'static str> {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"%PDF-", "application/pdf"),
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xFF\xD8\xFF", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"II*\x00", "image/tiff"),
        (b"MM\x00*", "image/tiff"),
        (b"\xD0\xCF\x11\xE0\xA1\xB1\x1A\xE1", "application/x-ole-storage"),
        (b"PK\x03\x04", "application/zip"),
        (b"Rar!\x1a\x07", "application/vnd.rar"),
        (b"7z\xBC\xAF\x27\x1C", "application/x-7z-compressed"),
        (b"\x1F\x8B", "application/gzip"),
        (b"{\\rtf", "application/rtf"),
    ];
    SIGNATURES
        .iter()
        .find(|(magic, _)| head.starts_with(magic))
        .map(|(_, mime)| *mime)
}

fn mime_from_extension(filename: &str) -> Option<&'static str> {
    let ext = Path::new(filename)
        .extension()?
        .to_str()?
        .to_ascii_lowercase();
    let mime = match ext.as_str() {
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "msg" => "application/vnd.ms-outlook",
        "eml" => "message/rfc822",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "htm" | "html" => "text/html",
        "xml" => "application/xml",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "tif" | "tiff" => "image/tiff",
        "zip" => "application/zip",
        "dwg" => "image/vnd.dwg",
        "mpp" => "application/vnd.ms-project",
        _ => return None,
    };
    Some(mime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_sha256_known_value() {
        assert_eq!(
            sha256(b"abc").to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_reader_matches_slice() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let (digest, size, head) = sha256_reader(&data[..]).unwrap();
        assert_eq!(digest, sha256(&data));
        assert_eq!(size, data.len() as u64);
        assert_eq!(head, data[..SNIFF_BYTES].to_vec());
    }

    #[test]
    fn test_detect_mime_order() {
        assert_eq!(
            detect_mime(Some("Application/PDF; name=a.pdf"), b"", "a.bin"),
            "application/pdf"
        );
        assert_eq!(detect_mime(None, b"%PDF-1.7\n", "contract"), "application/pdf");
        assert_eq!(
            detect_mime(Some(OCTET_STREAM), b"\x89PNG\r\n\x1a\n", "x"),
            "image/png"
        );
        assert_eq!(detect_mime(None, b"hello", "notes.TXT"), "text/plain");
        assert_eq!(detect_mime(None, b"hello", "noext"), OCTET_STREAM);
    }

    #[test]
    fn test_identify_file_streams_above_limit() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data = vec![7u8; 10_000];
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        let source = AttachmentSource::File(file.path().to_path_buf());

        let (buffered, bytes) = identify_source(&source, "a.bin", None, 1 << 20).unwrap();
        assert!(!buffered.streamed);
        assert_eq!(bytes.as_deref(), Some(&data[..]));

        let (streamed, bytes) = identify_source(&source, "a.bin", None, 1_000).unwrap();
        assert!(streamed.streamed);
        assert!(bytes.is_none());
        assert_eq!(streamed.attachment_hash, buffered.attachment_hash);
        assert_eq!(streamed.size_bytes, 10_000);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let source = AttachmentSource::File("/nonexistent/threadline/blob".into());
        let err = identify_source(&source, "x", None, 10).unwrap_err();
        assert!(matches!(err, EngineError::Io { .. }));
    }
}
