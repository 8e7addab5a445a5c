//! Export thread links to CSV.
//!
//! Output is UTF-8 with BOM for Excel compatibility.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{EngineError, Result};
use crate::model::link::ThreadLink;

/// Export thread link rows to a CSV file.
///
/// Columns: Link_ID, Child_Email_ID, Parent_Email_ID, Thread_Group_ID,
/// Methods, Confidence, Alternatives, Run_ID, Created_At
pub fn export_links_csv(links: &[ThreadLink], output_path: &Path) -> Result<()> {
    let io = |e| EngineError::io(output_path, e);
    let file = File::create(output_path).map_err(io)?;
    let mut out = BufWriter::new(file);

    // UTF-8 BOM for Excel
    out.write_all(&[0xEF, 0xBB, 0xBF]).map_err(io)?;
    writeln!(
        out,
        "Link_ID,Child_Email_ID,Parent_Email_ID,Thread_Group_ID,Methods,Confidence,Alternatives,Run_ID,Created_At"
    )
    .map_err(io)?;

    for link in links {
        let parent = link
            .parent_email_id
            .map(|p| p.to_string())
            .unwrap_or_default();
        let group = link
            .evidence
            .get("thread_group_id")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let methods = link
            .methods
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        writeln!(
            out,
            "{},{},{},{},{},{:.2},{},{},{}",
            link.id,
            link.child_email_id,
            parent,
            csv_escape(group),
            csv_escape(&methods),
            link.confidence,
            link.alternatives.len(),
            link.run_id,
            link.created_at.to_rfc3339(),
        )
        .map_err(io)?;
    }
    out.flush().map_err(io)?;
    Ok(())
}

/// Escape a value for CSV (RFC 4180).
///
/// Wraps in double quotes if the value contains commas, quotes, or newlines.
fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
