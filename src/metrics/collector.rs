use crate::metrics::snapshot::MetricsSnapshot;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::Instant;

/// Process-wide pipeline counters, shared by every job.
#[derive(Clone)]
pub struct MetricsCollector {
    urls_queued: Arc<AtomicU64>,
    urls_processed: Arc<AtomicU64>,
    urls_failed: Arc<AtomicU64>,
    pages_processed: Arc<AtomicU64>,
    records_emitted: Arc<AtomicU64>,
    duplicates_dropped: Arc<AtomicU64>,
    cache_hits: Arc<AtomicU64>,
    cache_misses: Arc<AtomicU64>,
    inference_calls: Arc<AtomicU64>,
    budget_denials: Arc<AtomicU64>,
    active_workers: Arc<AtomicU64>,
    start_time: Arc<Instant>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self {
            urls_queued: Arc::new(AtomicU64::new(0)),
            urls_processed: Arc::new(AtomicU64::new(0)),
            urls_failed: Arc::new(AtomicU64::new(0)),
            pages_processed: Arc::new(AtomicU64::new(0)),
            records_emitted: Arc::new(AtomicU64::new(0)),
            duplicates_dropped: Arc::new(AtomicU64::new(0)),
            cache_hits: Arc::new(AtomicU64::new(0)),
            cache_misses: Arc::new(AtomicU64::new(0)),
            inference_calls: Arc::new(AtomicU64::new(0)),
            budget_denials: Arc::new(AtomicU64::new(0)),
            active_workers: Arc::new(AtomicU64::new(0)),
            start_time: Arc::new(Instant::now()),
        }
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_urls_queued(&self, count: u64) {
        self.urls_queued.fetch_add(count, Ordering::SeqCst);
    }

    pub fn increment_urls_processed(&self) {
        self.urls_processed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_urls_failed(&self) {
        self.urls_failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_pages_processed(&self) {
        self.pages_processed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_records_emitted(&self) {
        self.records_emitted.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_duplicates_dropped(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_cache_misses(&self) {
        self.cache_misses.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_inference_calls(&self) {
        self.inference_calls.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_budget_denials(&self) {
        self.budget_denials.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_active_workers(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement_active_workers(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let hits = self.cache_hits.load(Ordering::SeqCst);
        let misses = self.cache_misses.load(Ordering::SeqCst);
        let processed = self.urls_processed.load(Ordering::SeqCst);

        let cache_hit_rate = if hits + misses > 0 {
            (hits as f64 / (hits + misses) as f64) * 100.0
        } else {
            0.0
        };

        let elapsed = self.start_time.elapsed().as_secs_f64();

        MetricsSnapshot {
            urls_queued: self.urls_queued.load(Ordering::SeqCst),
            urls_processed: processed,
            urls_failed: self.urls_failed.load(Ordering::SeqCst),
            pages_processed: self.pages_processed.load(Ordering::SeqCst),
            records_emitted: self.records_emitted.load(Ordering::SeqCst),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::SeqCst),
            cache_hits: hits,
            cache_misses: misses,
            inference_calls: self.inference_calls.load(Ordering::SeqCst),
            budget_denials: self.budget_denials.load(Ordering::SeqCst),
            active_workers: self.active_workers.load(Ordering::SeqCst),
            cache_hit_rate,
            urls_per_second: if elapsed > 0.0 {
                processed as f64 / elapsed
            } else {
                0.0
            },
            elapsed_seconds: elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_counters() {
        let metrics = MetricsCollector::new();
        let worker = metrics.clone();
        worker.increment_cache_hits();
        worker.increment_cache_hits();
        worker.increment_cache_hits();
        worker.increment_cache_misses();
        metrics.add_urls_queued(4);

        let snap = metrics.snapshot();
        assert_eq!(snap.urls_queued, 4);
        assert_eq!(snap.cache_hits, 3);
        assert_eq!(snap.cache_hit_rate, 75.0);
    }
}
