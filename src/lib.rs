pub mod backoff;
pub mod budget;
pub mod config;
pub mod db;
pub mod error;
pub mod extraction;
pub mod inference;
pub mod metrics;
pub mod model;
pub mod navigation;
pub mod orchestrator;
pub mod output;
pub mod pagination;
pub mod patterns;
pub mod pipeline;
pub mod selector;
pub mod signature;

pub use budget::{BudgetGovernor, SqliteLedger, UsageLedger};
pub use error::{Error, Result};
pub use extraction::ExtractionEngine;
pub use inference::{InferenceClient, VisionModel};
pub use metrics::collector::MetricsCollector;
pub use metrics::snapshot::MetricsSnapshot;
pub use navigation::{Browser, BrowserContext, NavigationController};
pub use orchestrator::JobOrchestrator;
pub use patterns::{PatternStore, SqlitePatternStore};
pub use pipeline::Pipeline;
