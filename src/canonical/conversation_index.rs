//! MAPI conversation index (`PidTagConversationIndex` / `Thread-Index`).
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │ HEADER (22 bytes)                          │
//! │  reserved + FILETIME high bytes: [u8; 6]   │
//! │  conversation GUID:              [u8; 16]  │
//! ├────────────────────────────────────────────┤
//! │ CHILD BLOCK (5 bytes) × reply depth        │
//! │  delta code (1 bit) + time delta (31 bits) │
//! │  random (4 bits) + sequence (4 bits)       │
//! └────────────────────────────────────────────┘
//! ```
//!
//! A reply's index is its parent's index plus one block, which makes the
//! parent lookup a prefix match.

use byteorder::{BigEndian, ByteOrder};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Header length in bytes.
pub const HEADER_LEN: usize = 22;

/// Child block length in bytes.
pub const BLOCK_LEN: usize = 5;

/// Seconds between 1601-01-01 (FILETIME epoch) and 1970-01-01.
const FILETIME_UNIX_OFFSET_SECS: i64 = 11_644_473_600;

/// Why a conversation index could not be used.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexDecodeError {
    #[error("conversation index is {0} bytes, shorter than the 22-byte header")]
    TooShort(usize),
    #[error("conversation index is {0} bytes, not 22 + 5n")]
    Misaligned(usize),
    #[error("conversation index is not valid hex or base64")]
    BadEncoding,
}

/// A decoded conversation index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationIndex {
    raw: Vec<u8>,
}

impl ConversationIndex {
    /// Validate raw bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, IndexDecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(IndexDecodeError::TooShort(bytes.len()));
        }
        if (bytes.len() - HEADER_LEN) % BLOCK_LEN != 0 {
            return Err(IndexDecodeError::Misaligned(bytes.len()));
        }
        Ok(Self {
            raw: bytes.to_vec(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.raw
    }

    /// Number of reply hops below the conversation root.
    pub fn depth(&self) -> usize {
        (self.raw.len() - HEADER_LEN) / BLOCK_LEN
    }

    /// The 22-byte header shared by every message of the conversation.
    pub fn root(&self) -> &[u8] {
        &self.raw[..HEADER_LEN]
    }

    /// Conversation GUID from the header.
    pub fn guid(&self) -> [u8; 16] {
        let mut guid = [0u8; 16];
        guid.copy_from_slice(&self.raw[6..HEADER_LEN]);
        guid
    }

    /// The index the parent must have: this one minus its last block.
    /// `None` for a conversation root.
    pub fn parent_key(&self) -> Option<&[u8]> {
        if self.depth() == 0 {
            None
        } else {
            Some(&self.raw[..self.raw.len() - BLOCK_LEN])
        }
    }

    /// Header timestamp (start of the conversation).
    pub fn root_time(&self) -> Option<DateTime<Utc>> {
        filetime_to_utc(self.root_filetime())
    }

    /// Timestamp encoded for this hop (root time plus every block delta).
    pub fn hop_time(&self) -> Option<DateTime<Utc>> {
        let mut ft = self.root_filetime();
        for block in self.raw[HEADER_LEN..].chunks_exact(BLOCK_LEN) {
            let word = BigEndian::read_u32(&block[..4]);
            let delta = u64::from(word & 0x7FFF_FFFF);
            let shifted = if word & 0x8000_0000 == 0 {
                delta << 18
            } else {
                delta << 23
            };
            ft = ft.saturating_add(shifted);
        }
        filetime_to_utc(ft)
    }

    fn root_filetime(&self) -> u64 {
        BigEndian::read_u48(&self.raw[..6]) << 16
    }
}

/// Parse an index given as hex (`conversation_index_raw`).
pub fn from_hex(value: &str) -> Result<ConversationIndex, IndexDecodeError> {
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(compact.trim_start_matches("0x"))
        .map_err(|_| IndexDecodeError::BadEncoding)?;
    ConversationIndex::decode(&bytes)
}

/// Parse an index given as base64 (the `Thread-Index` header).
pub fn from_base64(value: &str) -> Result<ConversationIndex, IndexDecodeError> {
    let bytes =
        crate::canonical::header::decode_base64(value).ok_or(IndexDecodeError::BadEncoding)?;
    ConversationIndex::decode(&bytes)
}

fn filetime_to_utc(ft: u64) -> Option<DateTime<Utc>> {
    let secs = (ft / 10_000_000) as i64 - FILETIME_UNIX_OFFSET_SECS;
    let nanos = ((ft % 10_000_000) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
}
