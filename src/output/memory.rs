use super::{RecordSink, SinkFactory};
use crate::error::StorageError;
use crate::model::{ExtractedRecord, JobId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Keeps records in process, for embedding and tests.
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<ExtractedRecord>>>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<ExtractedRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn write(&mut self, record: &ExtractedRecord) -> Result<(), StorageError> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemorySinks {
    jobs: Arc<Mutex<HashMap<JobId, MemorySink>>>,
}

impl MemorySinks {
    pub fn records(&self, job_id: JobId) -> Vec<ExtractedRecord> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_id)
            .map(MemorySink::records)
            .unwrap_or_default()
    }
}

#[async_trait]
impl SinkFactory for MemorySinks {
    async fn open(&self, job_id: JobId) -> Result<Box<dyn RecordSink>, StorageError> {
        let sink = self
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(job_id)
            .or_default()
            .clone();
        Ok(Box::new(sink))
    }
}
