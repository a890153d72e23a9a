use crate::selector::CssSelector;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ScraperConfig {
    #[serde(default)]
    #[validate(length(min = 1))]
    pub name: String,

    #[serde(default = "default_concurrency")]
    #[validate(range(min = 1, max = 64))]
    pub concurrency: usize,

    #[serde(default = "default_database")]
    #[validate(length(min = 1))]
    pub database: String,

    #[serde(default)]
    #[validate]
    pub navigation: NavigationConfig,

    #[serde(default)]
    #[validate]
    pub inference: InferenceConfig,

    #[serde(default)]
    #[validate]
    pub extraction: ExtractionConfig,

    #[serde(default)]
    #[validate]
    pub patterns: PatternConfig,

    #[serde(default)]
    #[validate]
    pub budget: BudgetConfig,

    #[serde(default)]
    #[validate]
    pub pagination: PaginationConfig,

    #[serde(default)]
    pub output: OutputConfig,

    /// Optional path to a parent configuration file to inherit from
    #[serde(default)]
    pub extends: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_delay_window"))]
pub struct NavigationConfig {
    #[serde(default = "default_nav_timeout")]
    #[validate(range(min = 1))]
    pub timeout_ms: u64,

    #[serde(default = "default_min_delay")]
    pub min_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_scroll_steps")]
    pub scroll_steps: u32,

    #[serde(default = "default_attempts")]
    #[validate(range(min = 1, max = 10))]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_true")]
    pub headless: bool,

    #[serde(default)]
    pub chrome_executable: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct InferenceConfig {
    #[serde(default = "default_endpoint")]
    #[validate(url)]
    pub endpoint: String,

    #[serde(default = "default_model")]
    #[validate(length(min = 1))]
    pub model: String,

    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_inference_timeout")]
    #[validate(range(min = 1))]
    pub timeout_ms: u64,

    #[serde(default = "default_attempts")]
    #[validate(range(min = 1, max = 10))]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    /// Cost reserved against the tenant budget before each call.
    #[serde(default = "default_estimated_cost")]
    #[validate(range(min = 0.0))]
    pub estimated_cost: f64,

    #[serde(default = "default_price_in")]
    #[validate(range(min = 0.0))]
    pub price_per_1k_input: f64,

    #[serde(default = "default_price_out")]
    #[validate(range(min = 0.0))]
    pub price_per_1k_output: f64,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_key_fields"))]
pub struct ExtractionConfig {
    #[serde(default)]
    #[validate(length(min = 1), custom = "validate_fields")]
    pub fields: Vec<FieldSpec>,

    /// Fields hashed into the dedup key; empty means the first required field.
    #[serde(default)]
    pub key_fields: Vec<String>,

    #[serde(default = "default_min_records")]
    #[validate(range(min = 1))]
    pub min_records: usize,

    #[serde(default = "default_completeness")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub min_field_completeness: f64,

    /// Depth below `<body>` that contributes to the layout hash.
    #[serde(default = "default_layout_depth")]
    #[validate(range(min = 1, max = 12))]
    pub layout_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PatternConfig {
    #[serde(default = "default_fresh_confidence")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub fresh_confidence: f64,

    /// Multiplier applied to confidence after a failed validation.
    #[serde(default = "default_decay")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub decay_factor: f64,

    #[serde(default = "default_eviction_threshold")]
    #[validate(range(min = 1))]
    pub eviction_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BudgetConfig {
    #[serde(default = "default_limit")]
    #[validate(range(min = 0.0))]
    pub default_limit: f64,

    #[serde(default = "default_near_limit")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub near_limit_ratio: f64,

    #[serde(default)]
    pub period: BudgetPeriod,

    /// Day of the month a monthly period starts on; clamped to short months.
    #[serde(default = "default_billing_day")]
    #[validate(range(min = 1, max = 31))]
    pub billing_day: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PaginationConfig {
    /// Pages read per target URL, the first one included.
    #[serde(default = "default_max_pages")]
    #[validate(range(min = 1, max = 100))]
    pub max_pages: u32,

    /// Tried in order when the pattern has no next-page selector of its own.
    #[serde(default = "default_next_selectors")]
    #[validate(custom = "validate_selectors")]
    pub next_selectors: Vec<String>,

    /// Query parameter bumped (`?page=2`, `?page=3`, ...) when no next link is found.
    #[serde(default)]
    pub page_param: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPeriod {
    Daily,
    Weekly,
    #[default]
    Monthly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutputConfig {
    Csv {
        #[serde(default = "default_output_dir")]
        dir: String,
    },
    Jsonl {
        #[serde(default = "default_output_dir")]
        dir: String,
    },
    Sqlite {
        path: String,
        #[serde(default = "default_table_prefix")]
        table_prefix: String,
    },
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig::Csv {
            dir: default_output_dir(),
        }
    }
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_nav_timeout(),
            min_delay_ms: default_min_delay(),
            max_delay_ms: default_max_delay(),
            scroll_steps: default_scroll_steps(),
            max_attempts: default_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            headless: true,
            chrome_executable: None,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            timeout_ms: default_inference_timeout(),
            max_attempts: default_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            estimated_cost: default_estimated_cost(),
            price_per_1k_input: default_price_in(),
            price_per_1k_output: default_price_out(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            fields: Vec::new(),
            key_fields: Vec::new(),
            min_records: default_min_records(),
            min_field_completeness: default_completeness(),
            layout_depth: default_layout_depth(),
        }
    }
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            fresh_confidence: default_fresh_confidence(),
            decay_factor: default_decay(),
            eviction_threshold: default_eviction_threshold(),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            near_limit_ratio: default_near_limit(),
            period: BudgetPeriod::default(),
            billing_day: default_billing_day(),
        }
    }
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            max_pages: default_max_pages(),
            next_selectors: default_next_selectors(),
            page_param: None,
        }
    }
}

impl ExtractionConfig {
    pub fn required_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.required)
    }

    /// Fields that feed the dedup key.
    pub fn dedup_fields(&self) -> Vec<String> {
        if !self.key_fields.is_empty() {
            return self.key_fields.clone();
        }
        self.required_fields()
            .next()
            .or_else(|| self.fields.first())
            .map(|f| vec![f.name.clone()])
            .unwrap_or_default()
    }
}

fn validate_delay_window(nav: &NavigationConfig) -> Result<(), ValidationError> {
    if nav.min_delay_ms > nav.max_delay_ms {
        return Err(ValidationError::new("min_delay_ms must not exceed max_delay_ms"));
    }
    if nav.backoff_base_ms > nav.backoff_max_ms {
        return Err(ValidationError::new("backoff_base_ms must not exceed backoff_max_ms"));
    }
    Ok(())
}

fn validate_key_fields(extraction: &ExtractionConfig) -> Result<(), ValidationError> {
    for key in &extraction.key_fields {
        match extraction.fields.iter().find(|f| &f.name == key) {
            None => return Err(ValidationError::new("key_fields must name a declared field")),
            Some(field) if !field.required => {
                return Err(ValidationError::new("key_fields must name required fields"));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn validate_selectors(selectors: &[String]) -> Result<(), ValidationError> {
    if selectors.iter().any(|s| CssSelector::parse(s).is_err()) {
        return Err(ValidationError::new("unparsable next-page selector"));
    }
    Ok(())
}

const RESERVED_FIELD_NAMES: [&str; 7] = [
    "id",
    "job_id",
    "source_url",
    "extracted_at",
    "dedup_key",
    "raw_snapshot_ref",
    "extra",
];

fn validate_fields(fields: &[FieldSpec]) -> Result<(), ValidationError> {
    let mut seen = std::collections::HashSet::new();
    for field in fields {
        if field.name.trim().is_empty() {
            return Err(ValidationError::new("field name must not be empty"));
        }
        if RESERVED_FIELD_NAMES.contains(&field.name.as_str()) {
            return Err(ValidationError::new("field name collides with a record column"));
        }
        if !seen.insert(field.name.as_str()) {
            return Err(ValidationError::new("duplicate field name"));
        }
    }
    if !fields.iter().any(|f| f.required) {
        return Err(ValidationError::new("at least one field must be required"));
    }
    Ok(())
}

fn default_concurrency() -> usize {
    2
}

fn default_database() -> String {
    "scrapesight.db".to_string()
}

fn default_nav_timeout() -> u64 {
    30_000
}

fn default_min_delay() -> u64 {
    400
}

fn default_max_delay() -> u64 {
    1_500
}

fn default_scroll_steps() -> u32 {
    6
}

fn default_attempts() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    1_000
}

fn default_backoff_max() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_inference_timeout() -> u64 {
    60_000
}

fn default_estimated_cost() -> f64 {
    0.05
}

fn default_price_in() -> f64 {
    0.0025
}

fn default_price_out() -> f64 {
    0.01
}

fn default_max_output_tokens() -> u32 {
    1_024
}

fn default_min_records() -> usize {
    2
}

fn default_completeness() -> f64 {
    0.8
}

fn default_layout_depth() -> usize {
    4
}

fn default_fresh_confidence() -> f64 {
    0.9
}

fn default_decay() -> f64 {
    0.5
}

fn default_eviction_threshold() -> u32 {
    3
}

fn default_limit() -> f64 {
    10.0
}

fn default_near_limit() -> f64 {
    0.8
}

fn default_billing_day() -> u32 {
    1
}

fn default_max_pages() -> u32 {
    10
}

fn default_next_selectors() -> Vec<String> {
    [
        "a[rel='next']",
        "a[aria-label='Next page']",
        "li.next a",
        ".pagination__item--next a",
        ".pager__item--next a",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_output_dir() -> String {
    "output".to_string()
}

fn default_table_prefix() -> String {
    "records".to_string()
}
