//! CSV writer for chunk files
//!
//! Rows are encoded with the `csv` crate into an in-memory buffer per batch
//! and appended to a large buffered file handle, so each batch costs one
//! write call. The header row is derived from the configured column list or,
//! when none is configured, from the keys of the first row.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use crate::backend::Row;
use crate::error::WriteError;

const WRITE_BUFFER: usize = 8 * 1024 * 1024;

/// Which fields become CSV columns.
#[derive(Debug, Clone, Default)]
pub struct ColumnSpec {
    /// Fixed column order; `None` means the first row decides.
    pub columns: Option<Vec<String>>,
    /// Fields never written.
    pub excluded: Vec<String>,
}

impl ColumnSpec {
    pub fn new(columns: Option<Vec<String>>, excluded: Vec<String>) -> Self {
        Self { columns, excluded }
    }

    fn keep(&self, field: &str) -> bool {
        !self.excluded.iter().any(|e| e == field)
    }

    /// Columns known before any row is seen.
    fn fixed(&self) -> Option<Vec<String>> {
        self.columns
            .as_ref()
            .map(|cols| cols.iter().filter(|c| self.keep(c)).cloned().collect())
    }

    fn resolve(&self, first: &Row) -> Vec<String> {
        self.fixed()
            .unwrap_or_else(|| first.keys().filter(|k| self.keep(k)).cloned().collect())
    }
}

/// Header name for a field: `srcIp` becomes `SRC_IP`.
pub fn header_name(field: &str) -> String {
    let mut out = String::with_capacity(field.len() + 4);
    for c in field.chars() {
        if c.is_ascii_uppercase() && !out.is_empty() {
            out.push('_');
        }
        out.push(c.to_ascii_uppercase());
    }
    out
}

/// Plain-text rendering of a JSON value for one CSV cell.
fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => other.to_string(),
    }
}

/// Incremental writer of one chunk file.
pub struct CsvChunkWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    spec: ColumnSpec,
    columns: Option<Vec<String>>,
    rows_written: u64,
    buffer: Vec<u8>,
}

impl CsvChunkWriter {
    /// Create (or truncate) the chunk file at `path`.
    pub async fn create(path: PathBuf, spec: ColumnSpec) -> Result<Self, WriteError> {
        let file = File::create(&path).await.map_err(|source| WriteError::Create {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "created chunk file");

        Ok(Self {
            writer: BufWriter::with_capacity(WRITE_BUFFER, file),
            path,
            spec,
            columns: None,
            rows_written: 0,
            buffer: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    fn encode_error(&self, e: impl std::fmt::Display) -> WriteError {
        WriteError::Encode {
            path: self.path.clone(),
            message: e.to_string(),
        }
    }

    /// Encode the header (when not yet written) and `rows` into the batch buffer.
    fn encode(&mut self, rows: &[Row]) -> Result<(), WriteError> {
        self.buffer.clear();
        let header = match (&self.columns, rows.first()) {
            (Some(_), _) => None,
            (None, Some(first)) => Some(self.spec.resolve(first)),
            (None, None) => self.spec.fixed(),
        };

        let mut csv = csv::WriterBuilder::new().from_writer(&mut self.buffer);
        let mut failure = None;

        if let Some(columns) = &header {
            if !columns.is_empty() {
                if let Err(e) = csv.write_record(columns.iter().map(|c| header_name(c))) {
                    failure = Some(e.to_string());
                }
            }
        }

        // Rows with no surviving column would encode as blank lines.
        let columns = header
            .as_ref()
            .or(self.columns.as_ref())
            .filter(|columns| !columns.is_empty());
        if let (None, Some(columns)) = (&failure, columns) {
            for row in rows {
                let record = columns.iter().map(|c| cell(row.get(c)));
                if let Err(e) = csv.write_record(record) {
                    failure = Some(e.to_string());
                    break;
                }
            }
        }

        if failure.is_none() {
            if let Err(e) = csv.flush() {
                failure = Some(e.to_string());
            }
        }
        drop(csv);

        if let Some(message) = failure {
            return Err(self.encode_error(message));
        }
        if header.is_some() {
            self.columns = header;
        }
        Ok(())
    }

    /// Append a batch of rows. Returns the number of rows written.
    pub async fn write_rows(&mut self, rows: &[Row]) -> Result<usize, WriteError> {
        if rows.is_empty() {
            return Ok(0);
        }

        self.encode(rows)?;
        self.writer
            .write_all(&self.buffer)
            .await
            .map_err(|source| WriteError::Write {
                path: self.path.clone(),
                source,
            })?;

        self.rows_written += rows.len() as u64;
        Ok(rows.len())
    }

    /// Flush and close the file. Returns its size in bytes.
    ///
    /// A file that never saw a row still gets the header when the column
    /// list is configured.
    pub async fn finish(mut self) -> Result<u64, WriteError> {
        if self.columns.is_none() {
            self.encode(&[])?;
            if !self.buffer.is_empty() {
                self.writer
                    .write_all(&self.buffer)
                    .await
                    .map_err(|source| WriteError::Write {
                        path: self.path.clone(),
                        source,
                    })?;
            }
        }

        let flush_err = |source| WriteError::Flush {
            path: self.path.clone(),
            source,
        };
        self.writer.flush().await.map_err(flush_err)?;
        self.writer.shutdown().await.map_err(flush_err)?;

        let size = tokio::fs::metadata(&self.path)
            .await
            .map_err(flush_err)?
            .len();
        debug!(
            path = %self.path.display(),
            rows = self.rows_written,
            bytes = size,
            "finished chunk file"
        );
        Ok(size)
    }
}

/// Delete a chunk file, logging instead of failing.
pub async fn remove_file_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed chunk file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove chunk file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("row must be an object"),
        }
    }

    #[test]
    fn test_header_name() {
        assert_eq!(header_name("srcIp"), "SRC_IP");
        assert_eq!(header_name("dstPort"), "DST_PORT");
        assert_eq!(header_name("action"), "ACTION");
        assert_eq!(header_name("@timestamp"), "@TIMESTAMP");
        assert_eq!(header_name("Leading"), "LEADING");
    }

    #[test]
    fn test_cell_rendering() {
        assert_eq!(cell(None), "");
        assert_eq!(cell(Some(&Value::Null)), "");
        assert_eq!(cell(Some(&json!("a,b"))), "a,b");
        assert_eq!(cell(Some(&json!(42))), "42");
        assert_eq!(cell(Some(&json!(true))), "true");
        assert_eq!(cell(Some(&json!(["x", 1]))), "[\"x\",1]");
    }

    #[tokio::test]
    async fn test_write_rows_with_header_from_first_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunk_1.csv");
        let spec = ColumnSpec::new(None, vec!["message".into()]);

        let mut writer = CsvChunkWriter::create(path.clone(), spec).await.unwrap();
        writer
            .write_rows(&[
                row(json!({ "srcIp": "10.0.0.1", "action": "allow", "message": "x" })),
                row(json!({ "srcIp": "10.0.0.2", "action": "say \"hi\", bye" })),
            ])
            .await
            .unwrap();
        writer
            .write_rows(&[row(json!({ "action": "line\nbreak", "srcIp": null }))])
            .await
            .unwrap();
        let size = writer.finish().await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(size, content.len() as u64);
        assert_eq!(
            content,
            "SRC_IP,ACTION\n\
             10.0.0.1,allow\n\
             10.0.0.2,\"say \"\"hi\"\", bye\"\n\
             ,\"line\nbreak\"\n"
        );
    }

    #[tokio::test]
    async fn test_configured_columns_and_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        let spec = ColumnSpec::new(Some(vec!["a".into(), "message".into(), "bB".into()]), vec!["message".into()]);

        let writer = CsvChunkWriter::create(path.clone(), spec).await.unwrap();
        writer.finish().await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "A,B_B\n");
    }

    #[tokio::test]
    async fn test_empty_file_without_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");

        let writer = CsvChunkWriter::create(path.clone(), ColumnSpec::default())
            .await
            .unwrap();
        assert_eq!(writer.finish().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rows_with_only_excluded_fields_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bare.csv");
        let spec = ColumnSpec::new(None, vec!["message".into()]);

        let mut writer = CsvChunkWriter::create(path.clone(), spec).await.unwrap();
        let written = writer
            .write_rows(&[
                row(json!({ "message": "a" })),
                row(json!({ "message": "b", "srcIp": "10.0.0.1" })),
            ])
            .await
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(writer.finish().await.unwrap(), 0);
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_create_in_missing_directory_fails() {
        let result =
            CsvChunkWriter::create(PathBuf::from("/nonexistent/dir/x.csv"), ColumnSpec::default())
                .await;
        assert!(matches!(result, Err(WriteError::Create { .. })));
    }

    #[tokio::test]
    async fn test_remove_file_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.csv");
        tokio::fs::write(&path, b"x").await.unwrap();

        remove_file_quietly(&path).await;
        assert!(!path.exists());
        // Second removal is silent.
        remove_file_quietly(&path).await;
    }
}
