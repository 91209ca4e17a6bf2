//! Reference `Sink` implementations: an in-memory sink for
//! tests and a newline-delimited-JSON file sink for the demo binary.
//! Both compute `content_hash` as the SHA-256 of the bytes actually
//! written, matching the artifact invariant.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use elspeth_core::{ArtifactDescriptor, ArtifactType, ExecutionContext, Sink};
use elspeth_domain::{RowData, SchemaContract};
use sha2::{Digest, Sha256};

fn rows_to_ndjson(rows: &[RowData]) -> Vec<u8> {
    let mut buf = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut buf, &row.as_value()).expect("serialize row");
        buf.push(b'\n');
    }
    buf
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Collects every row written to it, in write order. Used by tests that
/// assert on final sink contents.
pub struct VecSink {
    name: String,
    input_schema: SchemaContract,
    rows: Mutex<Vec<serde_json::Value>>,
}

impl VecSink {
    pub fn new(name: impl Into<String>, input_schema: SchemaContract) -> Self {
        Self {
            name: name.into(),
            input_schema,
            rows: Mutex::new(Vec::new()),
        }
    }

    pub fn rows(&self) -> Vec<serde_json::Value> {
        self.rows.lock().expect("VecSink rows lock poisoned").clone()
    }
}

impl Sink for VecSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_schema(&self) -> &SchemaContract {
        &self.input_schema
    }

    fn idempotent(&self) -> bool {
        false
    }

    fn write(&self, rows: &[RowData], _ctx: &ExecutionContext) -> Result<ArtifactDescriptor, String> {
        let bytes = rows_to_ndjson(rows);
        let content_hash = sha256_hex(&bytes);
        self.rows.lock().expect("VecSink rows lock poisoned").extend(rows.iter().map(RowData::as_value));
        Ok(ArtifactDescriptor {
            artifact_type: ArtifactType::Database,
            path_or_uri: format!("mem://{}", self.name),
            content_hash,
            size_bytes: bytes.len() as u64,
            metadata: None,
        })
    }
}

/// Appends rows as newline-delimited JSON to a file. `flush` calls
/// `sync_all`, satisfying the durable-barrier contract the release
/// queue relies on before recording a checkpoint.
pub struct FileSink {
    name: String,
    input_schema: SchemaContract,
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl FileSink {
    pub fn new(name: impl Into<String>, input_schema: SchemaContract, path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            name: name.into(),
            input_schema,
            path,
            file: Mutex::new(file),
        })
    }
}

impl Sink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_schema(&self) -> &SchemaContract {
        &self.input_schema
    }

    fn idempotent(&self) -> bool {
        false
    }

    fn write(&self, rows: &[RowData], _ctx: &ExecutionContext) -> Result<ArtifactDescriptor, String> {
        let bytes = rows_to_ndjson(rows);
        let content_hash = sha256_hex(&bytes);
        let mut file = self.file.lock().expect("FileSink file lock poisoned");
        file.write_all(&bytes).map_err(|e| format!("write to {}: {e}", self.path.display()))?;
        Ok(ArtifactDescriptor {
            artifact_type: ArtifactType::File,
            path_or_uri: self.path.display().to_string(),
            content_hash,
            size_bytes: bytes.len() as u64,
            metadata: None,
        })
    }

    fn flush(&self) -> Result<(), String> {
        self.file.lock().expect("FileSink file lock poisoned").sync_all().map_err(|e| format!("sync {}: {e}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use elspeth_domain::SchemaMode;
    use uuid::Uuid;

    fn ctx() -> ExecutionContext {
        ExecutionContext { run_id: Uuid::new_v4(), node_id: "sink_vec_1".into() }
    }

    fn row(n: i64) -> RowData {
        let schema = SchemaContract::builder(SchemaMode::Observed).build();
        let mut fields = serde_json::Map::new();
        fields.insert("n".into(), serde_json::json!(n));
        RowData::new(std::sync::Arc::new(schema), fields)
    }

    #[test]
    fn vec_sink_hashes_bytes_actually_written() {
        let schema = SchemaContract::builder(SchemaMode::Observed).build();
        let sink = VecSink::new("out", schema);
        let rows = vec![row(2), row(4)];
        let descriptor = sink.write(&rows, &ctx()).unwrap();
        let expected = sha256_hex(&rows_to_ndjson(&rows));
        assert_eq!(descriptor.content_hash, expected);
        assert_eq!(sink.rows().len(), 2);
    }

    #[test]
    fn file_sink_appends_and_flush_syncs() {
        let dir = std::env::temp_dir().join(format!("elspeth-filesink-test-{}", Uuid::new_v4()));
        let schema = SchemaContract::builder(SchemaMode::Observed).build();
        let sink = FileSink::new("out", schema, &dir).unwrap();
        sink.write(&[row(1)], &ctx()).unwrap();
        sink.write(&[row(2)], &ctx()).unwrap();
        sink.flush().unwrap();
        let contents = std::fs::read_to_string(&dir).unwrap();
        assert_eq!(contents.lines().count(), 2);
        let _ = std::fs::remove_file(&dir);
    }
}
