use crate::selector::{CssSelector, SelectorStability};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-job identity threaded through every pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub job_id: JobId,
    pub tenant_id: String,
    pub user_id: Option<String>,
}

/// Structural "shape" of a page: stable across re-crawls, changes on redesign.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SiteSignature {
    pub host: String,
    pub path_template: String,
    pub layout_hash: String,
}

impl SiteSignature {
    pub fn key(&self) -> String {
        format!("{}|{}|{}", self.host, self.path_template, self.layout_hash)
    }

    /// Inverse of [`SiteSignature::key`].
    pub fn from_key(key: &str) -> Option<Self> {
        let mut parts = key.splitn(3, '|');
        let host = parts.next().filter(|s| !s.is_empty())?;
        let path_template = parts.next().filter(|s| !s.is_empty())?;
        let layout_hash = parts.next().filter(|s| !s.is_empty())?;
        Some(Self {
            host: host.to_string(),
            path_template: path_template.to_string(),
            layout_hash: layout_hash.to_string(),
        })
    }
}

impl fmt::Display for SiteSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{} [{}]", self.host, self.path_template, self.layout_hash)
    }
}

/// A learned set of selectors for one site signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorPattern {
    pub signature: SiteSignature,
    /// Matches one element per record (a card, a row).
    pub container: CssSelector,
    /// Field selectors, scoped to the container.
    pub fields: BTreeMap<String, CssSelector>,
    /// Link to the following page of a paginated listing, if the page has one.
    #[serde(default)]
    pub next_page: Option<CssSelector>,
    pub confidence: f64,
    pub consecutive_failures: u32,
    pub hits: u64,
    pub last_validated_at: Option<DateTime<Utc>>,
}

impl SelectorPattern {
    /// A freshly inferred pattern that has not been checked against a page yet.
    pub fn candidate(
        signature: SiteSignature,
        container: CssSelector,
        fields: BTreeMap<String, CssSelector>,
    ) -> Self {
        Self {
            signature,
            container,
            fields,
            next_page: None,
            confidence: 0.0,
            consecutive_failures: 0,
            hits: 0,
            last_validated_at: None,
        }
    }

    /// Classified by the container, which decides whether any record is found.
    pub fn stability(&self) -> SelectorStability {
        self.container.stability()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    PartialSuccess,
    Failed,
    BudgetBlocked,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Pending | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::PartialSuccess => "partial_success",
            JobState::Failed => "failed",
            JobState::BudgetBlocked => "budget_blocked",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub job_id: JobId,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub target_urls: Vec<String>,
    pub status: JobState,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// How a single target URL of a job ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UrlOutcome {
    Succeeded {
        records: usize,
        pages: u32,
        inference_calls: u32,
        cache_hit: bool,
    },
    Failed {
        error: String,
    },
    BudgetBlocked,
    Skipped,
}

impl UrlOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UrlOutcome::Succeeded { .. })
    }
}

/// Snapshot returned by status polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub job: ScrapeJob,
    pub records_emitted: usize,
    pub outcomes: Vec<(String, UrlOutcome)>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub job_id: JobId,
    pub source_url: String,
    /// Values for the configured field set, in schema order.
    pub fields: BTreeMap<String, String>,
    /// Fields the pattern produced that the schema does not model.
    pub extra: BTreeMap<String, String>,
    pub raw_snapshot_ref: String,
    pub extracted_at: DateTime<Utc>,
    pub dedup_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsageOutcome {
    Success,
    Failure,
}

impl UsageOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            UsageOutcome::Success => "success",
            UsageOutcome::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AIUsageEvent {
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub feature: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost: f64,
    pub timestamp: DateTime<Utc>,
    pub outcome: UsageOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BudgetState {
    UnderBudget,
    NearLimit,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantBudget {
    pub tenant_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub limit: f64,
    pub consumed: f64,
}

impl TenantBudget {
    pub fn state(&self, near_limit_ratio: f64) -> BudgetState {
        if self.consumed >= self.limit {
            BudgetState::Exhausted
        } else if self.consumed >= self.limit * near_limit_ratio {
            BudgetState::NearLimit
        } else {
            BudgetState::UnderBudget
        }
    }

    pub fn remaining(&self) -> f64 {
        (self.limit - self.consumed).max(0.0)
    }
}
