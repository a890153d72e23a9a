use super::{PROVENANCE_COLUMNS, RecordSink};
use crate::error::StorageError;
use crate::model::ExtractedRecord;
use async_trait::async_trait;
use std::path::PathBuf;

/// One row per record: provenance, schema fields, then `extra` as JSON.
pub struct CsvSink {
    writer: csv::Writer<std::fs::File>,
    fields: Vec<String>,
}

impl CsvSink {
    pub fn new(path: PathBuf, fields: Vec<String>) -> Result<Self, StorageError> {
        let mut writer = csv::Writer::from_path(path)?;

        let mut headers: Vec<&str> = PROVENANCE_COLUMNS.to_vec();
        headers.extend(fields.iter().map(String::as_str));
        headers.push("extra");
        writer.write_record(&headers)?;
        writer.flush()?;

        Ok(Self { writer, fields })
    }
}

#[async_trait]
impl RecordSink for CsvSink {
    async fn write(&mut self, record: &ExtractedRecord) -> Result<(), StorageError> {
        let mut row = vec![
            record.job_id.to_string(),
            record.source_url.clone(),
            crate::db::timestamp(record.extracted_at),
        ];
        for field in &self.fields {
            row.push(record.fields.get(field).cloned().unwrap_or_default());
        }
        row.push(serde_json::to_string(&record.extra)?);

        self.writer.write_record(&row)?;
        // Rows become visible as pages finish, not at job end.
        self.writer.flush()?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        self.writer.flush()?;
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
    async fn writes_header_and_extra_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.csv");
        let mut sink = CsvSink::new(path.clone(), vec!["name".into(), "price".into()]).unwrap();

        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), "Kettle, steel".to_string());
        fields.insert("price".to_string(), "$20".to_string());
        let mut extra = BTreeMap::new();
        extra.insert("rating".to_string(), "4.5".to_string());

        sink.write(&ExtractedRecord {
            job_id: JobId::new(),
            source_url: "https://shop.example/c/1".into(),
            fields,
            extra,
            raw_snapshot_ref: "sha256:00".into(),
            extracted_at: Utc::now(),
            dedup_key: "k".into(),
        })
        .await
        .unwrap();
        sink.close().await.unwrap();

        let mut reader = csv::Reader::from_path(path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            vec!["job_id", "source_url", "extracted_at", "name", "price", "extra"]
        );
        let row = reader.records().next().unwrap().unwrap();
        assert_eq!(&row[3], "Kettle, steel");
        assert_eq!(&row[5], r#"{"rating":"4.5"}"#);
    }
}
