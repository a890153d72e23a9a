use super::RecordSink;
use crate::error::StorageError;
use crate::model::ExtractedRecord;
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

/// JSON Lines: one serialized record per line.
pub struct JsonLinesSink {
    file: File,
}

impl JsonLinesSink {
    pub fn new(path: PathBuf) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;

        Ok(Self { file })
    }
}

#[async_trait]
impl RecordSink for JsonLinesSink {
    async fn write(&mut self, record: &ExtractedRecord) -> Result<(), StorageError> {
        serde_json::to_writer(&mut self.file, record)?;
        writeln!(self.file)?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobId;
    use chrono::Utc;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn appends_one_record_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.jsonl");
        let mut sink = JsonLinesSink::new(path.clone()).unwrap();

        for url in ["https://a.example/", "https://b.example/"] {
            sink.write(&ExtractedRecord {
                job_id: JobId::new(),
                source_url: url.into(),
                fields: BTreeMap::new(),
                extra: BTreeMap::new(),
                raw_snapshot_ref: "sha256:00".into(),
                extracted_at: Utc::now(),
                dedup_key: url.into(),
            })
            .await
            .unwrap();
        }
        sink.close().await.unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<ExtractedRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].source_url, "https://b.example/");
    }
}
