pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{
    BudgetConfig, BudgetPeriod, ExtractionConfig, FieldSpec, InferenceConfig, NavigationConfig,
    OutputConfig, PaginationConfig, PatternConfig, ScraperConfig,
};
