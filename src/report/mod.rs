//! Anomaly reporting.

pub mod consistency;

pub use consistency::ConsistencyChecker;

use tracing::warn;

use crate::model::anomaly::{Anomaly, AnomalyReport};

/// Merge anomalies from every stage into one sorted report, logging each.
pub fn assemble<I>(parts: I) -> AnomalyReport
where
    I: IntoIterator<Item = Vec<Anomaly>>,
{
    let report = AnomalyReport::from_anomalies(parts.into_iter().flatten().collect());
    for a in &report.anomalies {
        warn!(
            kind = %a.kind,
            class = ?a.class,
            group = a.thread_group_id.as_deref().unwrap_or("-"),
            email_ids = ?a.email_ids,
            "{}",
            a.detail
        );
    }
    report
}
