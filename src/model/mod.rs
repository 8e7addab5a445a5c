//! Core data model: upstream records, canonical messages, attachments,
//! thread links and anomalies.

pub mod address;
pub mod anomaly;
pub mod attachment;
pub mod digest;
pub mod link;
pub mod message;
pub mod raw;
