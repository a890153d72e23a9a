use super::{PROVENANCE_COLUMNS, RecordSink};
use crate::db;
use crate::error::StorageError;
use crate::model::{ExtractedRecord, JobId};
use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use std::path::PathBuf;

/// A table per job, one column per schema field.
pub struct SqliteSink {
    pool: SqlitePool,
    table_name: String,
    insert: String,
    fields: Vec<String>,
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl SqliteSink {
    pub async fn new(
        path: PathBuf,
        table_prefix: &str,
        job_id: JobId,
        fields: Vec<String>,
    ) -> Result<Self, StorageError> {
        let pool = db::connect(&path.display().to_string()).await?;
        let table_name = format!("{}_{}", table_prefix, job_id.0.simple());

        let mut columns: Vec<String> = PROVENANCE_COLUMNS
            .iter()
            .map(|c| format!("{} TEXT NOT NULL", c))
            .collect();
        columns.push("dedup_key TEXT NOT NULL UNIQUE".to_string());
        columns.push("raw_snapshot_ref TEXT NOT NULL".to_string());
        columns.extend(fields.iter().map(|f| format!("{} TEXT", quote_ident(f))));
        columns.push("extra TEXT NOT NULL".to_string());

        let query = format!(
            "CREATE TABLE IF NOT EXISTS {} (id INTEGER PRIMARY KEY, {})",
            quote_ident(&table_name),
            columns.join(", ")
        );
        sqlx::query(&query).execute(&pool).await?;

        let mut names: Vec<String> = PROVENANCE_COLUMNS.iter().map(|c| c.to_string()).collect();
        names.push("dedup_key".to_string());
        names.push("raw_snapshot_ref".to_string());
        names.extend(fields.iter().map(|f| quote_ident(f)));
        names.push("extra".to_string());
        let placeholders: Vec<_> = (1..=names.len()).map(|i| format!("?{}", i)).collect();
        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(&table_name),
            names.join(", "),
            placeholders.join(", ")
        );

        log::debug!("Writing records to table {}", table_name);
        Ok(Self {
            pool,
            table_name,
            insert,
            fields,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }
}

#[async_trait]
impl RecordSink for SqliteSink {
    async fn write(&mut self, record: &ExtractedRecord) -> Result<(), StorageError> {
        let mut q = sqlx::query(&self.insert)
            .bind(record.job_id.to_string())
            .bind(&record.source_url)
            .bind(db::timestamp(record.extracted_at))
            .bind(&record.dedup_key)
            .bind(&record.raw_snapshot_ref);
        for field in &self.fields {
            q = q.bind(record.fields.get(field).cloned());
        }
        q = q.bind(serde_json::to_string(&record.extra)?);

        q.execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        self.pool.close().await;
        Ok(())
    }
}
