use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub urls_queued: u64,
    pub urls_processed: u64,
    pub urls_failed: u64,
    pub pages_processed: u64,
    pub records_emitted: u64,
    pub duplicates_dropped: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub inference_calls: u64,
    pub budget_denials: u64,
    pub active_workers: u64,
    pub cache_hit_rate: f64,
    pub urls_per_second: f64,
    pub elapsed_seconds: f64,
}
