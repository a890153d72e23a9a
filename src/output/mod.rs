use crate::config::{ExtractionConfig, OutputConfig};
use crate::error::StorageError;
use crate::model::{ExtractedRecord, JobId};
use async_trait::async_trait;
use std::path::PathBuf;

pub mod csv;
pub mod json;
pub mod memory;
pub mod sqlite;

pub use self::csv::CsvSink;
pub use self::json::JsonLinesSink;
pub use self::memory::{MemorySink, MemorySinks};
pub use self::sqlite::SqliteSink;

/// Columns every sink writes ahead of the schema fields.
pub const PROVENANCE_COLUMNS: [&str; 3] = ["job_id", "source_url", "extracted_at"];

#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn write(&mut self, record: &ExtractedRecord) -> Result<(), StorageError>;
    async fn close(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Opens the output stream for a newly submitted job.
#[async_trait]
pub trait SinkFactory: Send + Sync {
    async fn open(&self, job_id: JobId) -> Result<Box<dyn RecordSink>, StorageError>;
}

/// Sinks built from the `output` section of the config.
pub struct ConfiguredSinks {
    output: OutputConfig,
    fields: Vec<String>,
}

impl ConfiguredSinks {
    pub fn new(output: OutputConfig, extraction: &ExtractionConfig) -> Self {
        Self {
            output,
            fields: extraction.fields.iter().map(|f| f.name.clone()).collect(),
        }
    }
}

#[async_trait]
impl SinkFactory for ConfiguredSinks {
    async fn open(&self, job_id: JobId) -> Result<Box<dyn RecordSink>, StorageError> {
        let sink: Box<dyn RecordSink> = match &self.output {
            OutputConfig::Csv { dir } => {
                let path = job_file(dir, job_id, "csv")?;
                Box::new(CsvSink::new(path, self.fields.clone())?)
            }
            OutputConfig::Jsonl { dir } => {
                let path = job_file(dir, job_id, "jsonl")?;
                Box::new(JsonLinesSink::new(path)?)
            }
            OutputConfig::Sqlite { path, table_prefix } => Box::new(
                SqliteSink::new(PathBuf::from(path), table_prefix, job_id, self.fields.clone())
                    .await?,
            ),
        };
        Ok(sink)
    }
}

fn job_file(dir: &str, job_id: JobId, extension: &str) -> Result<PathBuf, StorageError> {
    std::fs::create_dir_all(dir)?;
    Ok(PathBuf::from(dir).join(format!("{}.{}", job_id, extension)))
}
