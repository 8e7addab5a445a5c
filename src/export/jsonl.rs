//! JSON Lines writers, one row per line.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;

use crate::error::{EngineError, Result};

/// Write every row as one JSON object per line. Returns the row count.
pub fn write_jsonl<T, I>(rows: I, path: &Path) -> Result<usize>
where
    T: Serialize,
    I: IntoIterator<Item = T>,
{
    let file = File::create(path).map_err(|e| EngineError::io(path, e))?;
    let mut out = BufWriter::new(file);
    let mut count = 0;
    for row in rows {
        serde_json::to_writer(&mut out, &row)?;
        out.write_all(b"\n").map_err(|e| EngineError::io(path, e))?;
        count += 1;
    }
    out.flush().map_err(|e| EngineError::io(path, e))?;
    Ok(count)
}

/// Pretty-printed single JSON document.
pub fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let file = File::create(path).map_err(|e| EngineError::io(path, e))?;
    let mut out = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut out, value)?;
    out.write_all(b"\n").map_err(|e| EngineError::io(path, e))?;
    out.flush().map_err(|e| EngineError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use predicates::prelude::*;

    #[derive(Serialize)]
    struct Row<'a> {
        id: u32,
        name: &'a str,
    }

    #[test]
    fn test_one_object_per_line() {
        let dir = assert_fs::TempDir::new().unwrap();
        let file = dir.child("rows.jsonl");
        let n = write_jsonl(
            [Row { id: 1, name: "a" }, Row { id: 2, name: "b\nc" }],
            file.path(),
        )
        .unwrap();
        assert_eq!(n, 2);
        file.assert("{\"id\":1,\"name\":\"a\"}\n{\"id\":2,\"name\":\"b\\nc\"}\n");
    }

    #[test]
    fn test_empty_input_writes_empty_file() {
        let dir = assert_fs::TempDir::new().unwrap();
        let file = dir.child("none.jsonl");
        assert_eq!(write_jsonl(Vec::<Row>::new(), file.path()).unwrap(), 0);
        file.assert(predicate::str::is_empty());
    }
}
