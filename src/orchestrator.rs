use crate::error::{Error, InferenceError, PipelineError, Result};
use crate::extraction::Deduper;
use crate::metrics::collector::MetricsCollector;
use crate::metrics::snapshot::MetricsSnapshot;
use crate::model::{
    ExtractedRecord, JobContext, JobId, JobState, JobStatus, ScrapeJob, UrlOutcome,
};
use crate::output::{RecordSink, SinkFactory};
use crate::pipeline::Pipeline;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, watch};

/// Why a job stopped taking new URLs before running out of them.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StopReason {
    Cancelled,
    BudgetBlocked,
    /// Spend could not be recorded; continuing would be unmetered.
    Unmetered(String),
    Output(String),
}

struct JobHandle {
    status: Mutex<JobStatus>,
    state_tx: watch::Sender<JobState>,
    stop_tx: watch::Sender<Option<StopReason>>,
}

impl JobHandle {
    fn update<F: FnOnce(&mut JobStatus)>(&self, f: F) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut status);
    }

    fn snapshot(&self) -> JobStatus {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// First reason wins; later ones are ignored.
    fn stop(&self, reason: StopReason) -> bool {
        self.stop_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    fn stop_reason(&self) -> Option<StopReason> {
        self.stop_tx.borrow().clone()
    }
}

/// How long a finished job stays queryable by default.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);

pub struct JobOrchestrator {
    pipeline: Arc<Pipeline>,
    sinks: Arc<dyn SinkFactory>,
    permits: Arc<Semaphore>,
    concurrency: usize,
    retention: Duration,
    metrics: MetricsCollector,
    jobs: Arc<RwLock<HashMap<JobId, Arc<JobHandle>>>>,
}

impl JobOrchestrator {
    /// `concurrency` permits are shared by every job this orchestrator runs.
    pub fn new(pipeline: Pipeline, sinks: Arc<dyn SinkFactory>, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        let metrics = pipeline.metrics().clone();
        Self {
            pipeline: Arc::new(pipeline),
            sinks,
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            retention: DEFAULT_RETENTION,
            metrics,
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub async fn submit(
        &self,
        urls: Vec<String>,
        tenant_id: &str,
        user_id: Option<String>,
    ) -> Result<JobId> {
        if tenant_id.trim().is_empty() {
            return Err(Error::InvalidJob("tenant id is required".to_string()));
        }
        if urls.is_empty() {
            return Err(Error::InvalidJob("no target urls".to_string()));
        }
        self.prune();

        let ctx = JobContext {
            job_id: JobId::new(),
            tenant_id: tenant_id.to_string(),
            user_id,
        };
        let sink = self.sinks.open(ctx.job_id).await?;

        let job = ScrapeJob {
            job_id: ctx.job_id,
            tenant_id: ctx.tenant_id.clone(),
            user_id: ctx.user_id.clone(),
            target_urls: urls.clone(),
            status: JobState::Pending,
            created_at: Utc::now(),
            finished_at: None,
        };
        let (state_tx, _) = watch::channel(JobState::Pending);
        let (stop_tx, _) = watch::channel(None);
        let handle = Arc::new(JobHandle {
            status: Mutex::new(JobStatus {
                job,
                records_emitted: 0,
                outcomes: Vec::new(),
                errors: Vec::new(),
            }),
            state_tx,
            stop_tx,
        });

        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ctx.job_id, handle.clone());
        self.metrics.add_urls_queued(urls.len() as u64);
        log::info!(
            "Submitted job {} for tenant {} ({} urls)",
            ctx.job_id,
            ctx.tenant_id,
            urls.len()
        );

        let runner = JobRunner {
            pipeline: self.pipeline.clone(),
            permits: self.permits.clone(),
            concurrency: self.concurrency,
            metrics: self.metrics.clone(),
            handle,
        };
        let job_id = ctx.job_id;
        tokio::spawn(runner.run(ctx, urls, sink));
        Ok(job_id)
    }

    pub fn status(&self, job_id: JobId) -> Result<JobStatus> {
        Ok(self.handle(job_id)?.snapshot())
    }

    /// Requests cooperative cancellation. URLs already in flight finish and
    /// their records are kept. Returns false if the job had already ended.
    pub fn cancel(&self, job_id: JobId) -> Result<bool> {
        let handle = self.handle(job_id)?;
        if handle.state_tx.borrow().is_terminal() {
            return Ok(false);
        }
        if handle.stop(StopReason::Cancelled) {
            log::info!("Cancellation requested for job {}", job_id);
        }
        Ok(true)
    }

    /// Resolves once the job reaches a terminal state.
    pub async fn wait(&self, job_id: JobId) -> Result<JobStatus> {
        let handle = self.handle(job_id)?;
        let mut state_rx = handle.state_tx.subscribe();
        state_rx
            .wait_for(|state| state.is_terminal())
            .await
            .map_err(|_| Error::Internal(format!("job {} state channel closed", job_id)))?;
        Ok(handle.snapshot())
    }

    /// Forgets jobs that finished more than the retention period ago.
    /// Returns how many were dropped.
    pub fn prune(&self) -> usize {
        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let before = jobs.len();
        jobs.retain(|_, handle| {
            let finished_at = handle.snapshot().job.finished_at;
            let expired = handle.state_tx.borrow().is_terminal()
                && finished_at.is_some_and(|at| now.signed_duration_since(at) >= retention);
            !expired
        });
        let pruned = before - jobs.len();
        if pruned > 0 {
            log::debug!("Pruned {} finished job(s)", pruned);
        }
        pruned
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn watch_metrics(&self) -> watch::Receiver<MetricsSnapshot> {
        let (tx, rx) = watch::channel(self.metrics.snapshot());
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(500));
            loop {
                interval.tick().await;
                if tx.send(metrics.snapshot()).is_err() {
                    break;
                }
            }
        });
        rx
    }

    fn handle(&self, job_id: JobId) -> Result<Arc<JobHandle>> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_id)
            .cloned()
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))
    }
}

struct JobRunner {
    pipeline: Arc<Pipeline>,
    permits: Arc<Semaphore>,
    concurrency: usize,
    metrics: MetricsCollector,
    handle: Arc<JobHandle>,
}

impl JobRunner {
    async fn run(self, ctx: JobContext, urls: Vec<String>, sink: Box<dyn RecordSink>) {
        self.handle.state_tx.send_replace(JobState::Running);
        self.handle.update(|s| s.job.status = JobState::Running);

        // Pages hand their records to a single writer in completion order.
        let (records_tx, records_rx) = mpsc::channel::<Vec<ExtractedRecord>>(64);
        let writer = tokio::spawn(write_records(
            records_rx,
            sink,
            self.handle.clone(),
            self.metrics.clone(),
        ));

        let runner = &self;
        let ctx = &ctx;
        stream::iter(urls)
            .for_each_concurrent(self.concurrency, |url| {
                let records_tx = records_tx.clone();
                async move {
                    let outcome = runner.process_url(ctx, &url, &records_tx).await;
                    runner.handle.update(|s| s.outcomes.push((url, outcome)));
                }
            })
            .await;

        // Writer drains whatever is still queued once the last sender is gone.
        drop(records_tx);
        if let Err(e) = writer.await {
            log::error!("Record writer for job {} panicked: {}", ctx.job_id, e);
            self.handle.stop(StopReason::Output(e.to_string()));
        }

        self.finish(ctx);
    }

    async fn process_url(
        &self,
        ctx: &JobContext,
        url: &str,
        records_tx: &mpsc::Sender<Vec<ExtractedRecord>>,
    ) -> UrlOutcome {
        let mut stop_rx = self.handle.stop_tx.subscribe();
        if stop_rx.borrow().is_some() {
            return UrlOutcome::Skipped;
        }

        let _permit = tokio::select! {
            permit = self.permits.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return UrlOutcome::Skipped,
            },
            _ = stop_rx.wait_for(|reason| reason.is_some()) => return UrlOutcome::Skipped,
        };
        // Checked again: the job may have stopped while this URL waited.
        if self.handle.stop_reason().is_some() {
            return UrlOutcome::Skipped;
        }

        self.metrics.increment_active_workers();
        let result = self
            .pipeline
            .process(ctx, url, || self.handle.stop_reason().is_some())
            .await;
        self.metrics.decrement_active_workers();
        self.metrics.increment_urls_processed();

        match result {
            Ok(page) => {
                let records = page.records.len();
                if records_tx.send(page.records).await.is_err() {
                    log::error!("Record writer for job {} is gone", ctx.job_id);
                }
                // Later pages failing still stop the job when the cause is budget or metering.
                if let Some(e) = page.halted {
                    self.escalate(ctx, url, &e);
                }
                UrlOutcome::Succeeded {
                    records,
                    pages: page.pages,
                    inference_calls: page.inference_calls,
                    cache_hit: page.cache_hit,
                }
            }
            Err(PipelineError::Inference(InferenceError::BudgetExceeded)) => {
                self.escalate(ctx, url, &PipelineError::Inference(InferenceError::BudgetExceeded));
                UrlOutcome::BudgetBlocked
            }
            Err(e) => {
                self.metrics.increment_urls_failed();
                log::error!("Failed to scrape {}: {}", url, e);
                self.escalate(ctx, url, &e);
                UrlOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Records the error against the job and stops it when continuing
    /// would overspend or go unmetered.
    fn escalate(&self, ctx: &JobContext, url: &str, error: &PipelineError) {
        match error {
            PipelineError::Inference(InferenceError::BudgetExceeded) => {
                self.metrics.increment_budget_denials();
                if self.handle.stop(StopReason::BudgetBlocked) {
                    log::warn!(
                        "Tenant {} is out of budget; job {} stops taking urls",
                        ctx.tenant_id,
                        ctx.job_id
                    );
                }
                self.handle
                    .update(|s| s.errors.push(format!("{}: tenant budget exceeded", url)));
            }
            PipelineError::Inference(InferenceError::Unmetered(storage)) => {
                self.handle.stop(StopReason::Unmetered(storage.to_string()));
                self.handle.update(|s| s.errors.push(format!("{}: {}", url, error)));
            }
            other => {
                self.handle.update(|s| s.errors.push(format!("{}: {}", url, other)));
            }
        }
    }

    fn finish(&self, ctx: &JobContext) {
        let stop = self.handle.stop_reason();
        let mut final_state = JobState::Failed;
        self.handle.update(|status| {
            final_state = aggregate(stop.as_ref(), &status.outcomes);
            if let Some(StopReason::Unmetered(msg) | StopReason::Output(msg)) = &stop {
                status.errors.push(format!("job aborted: {}", msg));
            }
            status.job.status = final_state;
            status.job.finished_at = Some(Utc::now());
        });
        log::info!("Job {} finished: {}", ctx.job_id, final_state);
        self.handle.state_tx.send_replace(final_state);
    }
}

async fn write_records(
    mut records_rx: mpsc::Receiver<Vec<ExtractedRecord>>,
    mut sink: Box<dyn RecordSink>,
    handle: Arc<JobHandle>,
    metrics: MetricsCollector,
) {
    let mut deduper = Deduper::default();
    let mut failed = false;

    while let Some(batch) = records_rx.recv().await {
        if failed {
            continue;
        }
        for record in batch {
            if !deduper.admit(&record) {
                metrics.increment_duplicates_dropped();
                continue;
            }
            if let Err(e) = sink.write(&record).await {
                log::error!("Failed to write record for job {}: {}", record.job_id, e);
                handle.stop(StopReason::Output(e.to_string()));
                failed = true;
                break;
            }
            metrics.increment_records_emitted();
            handle.update(|s| s.records_emitted += 1);
        }
    }

    if let Err(e) = sink.close().await {
        log::error!("Failed to close output: {}", e);
        handle.update(|s| s.errors.push(format!("output close failed: {}", e)));
    }
}

fn aggregate(stop: Option<&StopReason>, outcomes: &[(String, UrlOutcome)]) -> JobState {
    match stop {
        Some(StopReason::BudgetBlocked) => return JobState::BudgetBlocked,
        Some(StopReason::Unmetered(_) | StopReason::Output(_)) => return JobState::Failed,
        Some(StopReason::Cancelled)
            if outcomes.iter().any(|(_, o)| *o == UrlOutcome::Skipped) =>
        {
            return JobState::Cancelled;
        }
        _ => {}
    }

    let succeeded = outcomes.iter().filter(|(_, o)| o.is_success()).count();
    if succeeded == 0 {
        JobState::Failed
    } else if succeeded == outcomes.len() {
        JobState::Completed
    } else {
        JobState::PartialSuccess
    }
}
