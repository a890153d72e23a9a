pub mod openai;

pub use openai::OpenAiVisionModel;

use crate::backoff;
use crate::budget::{Authorization, BudgetGovernor};
use crate::config::{ExtractionConfig, InferenceConfig};
use crate::error::InferenceError;
use crate::model::{AIUsageEvent, JobContext, SelectorPattern, SiteSignature, UsageOutcome};
use crate::selector::CssSelector;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

pub const FEATURE: &str = "selector_inference";

#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub screenshot_png: Vec<u8>,
    pub system_prompt: String,
    pub user_prompt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenUsage {
    pub tokens_in: u32,
    pub tokens_out: u32,
}

#[derive(Debug, Clone)]
pub struct ModelReply {
    pub content: String,
    pub refusal: Option<String>,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    Timeout,
    Unavailable(String),
    Refused(String),
    /// The provider answered, but not with anything we could read.
    InvalidBody(String),
}

/// Transport to a vision-capable model.
#[async_trait]
pub trait VisionModel: Send + Sync {
    fn model_name(&self) -> &str;
    async fn complete(&self, request: &InferenceRequest) -> Result<ModelReply, ModelError>;
}

pub struct InferenceClient {
    model: Arc<dyn VisionModel>,
    governor: Arc<BudgetGovernor>,
    config: InferenceConfig,
    extraction: ExtractionConfig,
}

impl InferenceClient {
    pub fn new(
        model: Arc<dyn VisionModel>,
        governor: Arc<BudgetGovernor>,
        config: InferenceConfig,
        extraction: ExtractionConfig,
    ) -> Self {
        Self {
            model,
            governor,
            config,
            extraction,
        }
    }

    pub async fn infer(
        &self,
        ctx: &JobContext,
        screenshot: &[u8],
        signature: &SiteSignature,
    ) -> Result<SelectorPattern, InferenceError> {
        let request = InferenceRequest {
            screenshot_png: screenshot.to_vec(),
            system_prompt: system_prompt(&self.extraction),
            user_prompt: user_prompt(signature),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let reservation = match self
                .governor
                .authorize(&ctx.tenant_id, self.config.estimated_cost)
                .await
                .map_err(InferenceError::Unmetered)?
            {
                Authorization::Allowed(reservation) => reservation,
                Authorization::Denied(_) => return Err(InferenceError::BudgetExceeded),
            };

            log::info!(
                "Inferring selectors for {} (job {}, attempt {})",
                signature,
                ctx.job_id,
                attempt
            );
            let (result, usage) = self.call(&request, signature).await;

            let cost = match usage {
                Some(usage) => self.cost_of(usage),
                None => reservation.amount(),
            };
            let usage = usage.unwrap_or(TokenUsage {
                tokens_in: 0,
                tokens_out: 0,
            });
            let event = AIUsageEvent {
                tenant_id: ctx.tenant_id.clone(),
                user_id: ctx.user_id.clone(),
                feature: FEATURE.to_string(),
                model: self.model.model_name().to_string(),
                tokens_in: usage.tokens_in,
                tokens_out: usage.tokens_out,
                cost,
                timestamp: Utc::now(),
                outcome: if result.is_ok() {
                    UsageOutcome::Success
                } else {
                    UsageOutcome::Failure
                },
            };
            self.governor
                .record(reservation, event)
                .await
                .map_err(InferenceError::Unmetered)?;

            match result {
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    let wait = backoff::delay(
                        self.config.backoff_base_ms,
                        self.config.backoff_max_ms,
                        attempt,
                    );
                    log::warn!("Inference attempt {} failed ({}); retrying in {:?}", attempt, e, wait);
                    sleep(wait).await;
                }
                other => return other,
            }
        }
    }

    async fn call(
        &self,
        request: &InferenceRequest,
        signature: &SiteSignature,
    ) -> (Result<SelectorPattern, InferenceError>, Option<TokenUsage>) {
        let limit = Duration::from_millis(self.config.timeout_ms);
        let reply = match timeout(limit, self.model.complete(request)).await {
            Err(_) | Ok(Err(ModelError::Timeout)) => return (Err(InferenceError::Timeout), None),
            Ok(Err(ModelError::Unavailable(msg))) => {
                return (Err(InferenceError::Unavailable(msg)), None);
            }
            Ok(Err(ModelError::Refused(msg))) => return (Err(InferenceError::Refused(msg)), None),
            Ok(Err(ModelError::InvalidBody(msg))) => {
                return (Err(InferenceError::Malformed(msg)), None);
            }
            Ok(Ok(reply)) => reply,
        };

        let result = match reply.refusal {
            Some(reason) => Err(InferenceError::Refused(reason)),
            None => parse_pattern(&reply.content, signature, &self.extraction),
        };
        (result, reply.usage)
    }

    fn cost_of(&self, usage: TokenUsage) -> f64 {
        usage.tokens_in as f64 / 1000.0 * self.config.price_per_1k_input
            + usage.tokens_out as f64 / 1000.0 * self.config.price_per_1k_output
    }
}

#[derive(Debug, Deserialize)]
struct RawPattern {
    container: String,
    #[serde(default)]
    fields: BTreeMap<String, String>,
    #[serde(default)]
    next_page: Option<String>,
}

/// Validates an untrusted model answer into a candidate pattern.
///
/// Generated class names break on the site's next deploy, so they are
/// refused for the container and required fields and dropped elsewhere.
pub fn parse_pattern(
    content: &str,
    signature: &SiteSignature,
    extraction: &ExtractionConfig,
) -> Result<SelectorPattern, InferenceError> {
    let body = strip_code_fence(content);
    if body.is_empty() {
        return Err(InferenceError::Malformed("empty response".to_string()));
    }

    let raw: RawPattern = serde_json::from_str(body)
        .map_err(|e| InferenceError::Malformed(format!("not a selector object: {}", e)))?;

    let container = CssSelector::parse(&raw.container)
        .map_err(|e| InferenceError::Malformed(format!("container: {}", e)))?;
    if container.is_list() {
        return Err(InferenceError::Malformed(
            "container must be a single selector, not a list".to_string(),
        ));
    }
    if container.is_obfuscated() {
        return Err(InferenceError::Malformed(format!(
            "container {} uses a generated class name",
            container
        )));
    }

    let mut fields = BTreeMap::new();
    for (name, selector) in raw.fields {
        let name = name.trim().to_string();
        if name.is_empty() || selector.trim().is_empty() {
            continue;
        }
        let parsed = CssSelector::parse(&selector)
            .map_err(|e| InferenceError::Malformed(format!("field {}: {}", name, e)))?;
        if parsed.is_obfuscated() {
            if extraction.required_fields().any(|f| f.name == name) {
                return Err(InferenceError::Malformed(format!(
                    "field {} uses a generated class name",
                    name
                )));
            }
            log::debug!("Dropping field {} with generated selector {}", name, parsed);
            continue;
        }
        fields.insert(name, parsed);
    }

    if let Some(missing) = extraction
        .required_fields()
        .find(|f| !fields.contains_key(&f.name))
    {
        return Err(InferenceError::Malformed(format!(
            "no selector for required field {}",
            missing.name
        )));
    }

    let next_page = raw
        .next_page
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| CssSelector::parse(s).ok())
        .filter(|s| !s.is_obfuscated());

    let mut pattern = SelectorPattern::candidate(signature.clone(), container, fields);
    pattern.next_page = next_page;
    Ok(pattern)
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn system_prompt(extraction: &ExtractionConfig) -> String {
    let mut fields = String::new();
    for field in &extraction.fields {
        let requirement = if field.required { "required" } else { "optional" };
        match &field.description {
            Some(desc) => fields.push_str(&format!("- {} ({}): {}\n", field.name, requirement, desc)),
            None => fields.push_str(&format!("- {} ({})\n", field.name, requirement)),
        }
    }

    format!(
        "You write CSS selectors for scraping repeated records from a web page screenshot.\n\
         Identify the element that wraps one record (a card, row or list item) and, for each \
         field below, a selector relative to that element.\n\n\
         Fields:\n{fields}\n\
         Selectors may use only tag names, .class, #id, [attr] and [attr='value'], combined \
         with descendant (space) or child (>) combinators. No pseudo-classes. Prefer \
         [data-test] or [data-testid] attributes when present and never use generated class \
         names such as css-1x2y3z or sc-abcdef.\n\
         If the page links to a next page of results, add \"next_page\" with a selector for \
         that link.\n\
         Answer with one JSON object and nothing else:\n\
         {{\"container\": \"<selector>\", \"fields\": {{\"<field>\": \"<selector>\"}}, \
         \"next_page\": \"<selector or null>\"}}"
    )
}

fn user_prompt(signature: &SiteSignature) -> String {
    format!(
        "Page host: {}\nPath shape: {}\nReturn the selector object for this page.",
        signature.host, signature.path_template
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::SqliteLedger;
    use crate::config::{BudgetConfig, BudgetPeriod, FieldSpec};
    use crate::db;
    use crate::model::JobId;
    use crate::selector::SelectorStability;
    use std::sync::Mutex;

    fn extraction_config() -> ExtractionConfig {
        ExtractionConfig {
            fields: vec![
                FieldSpec {
                    name: "name".into(),
                    required: true,
                    description: Some("product name".into()),
                },
                FieldSpec {
                    name: "price".into(),
                    required: false,
                    description: None,
                },
            ],
            ..ExtractionConfig::default()
        }
    }

    fn signature() -> SiteSignature {
        SiteSignature {
            host: "shop.example".into(),
            path_template: "/c/{n}".into(),
            layout_hash: "abc".into(),
        }
    }

    struct ScriptedModel {
        replies: Mutex<Vec<Result<ModelReply, ModelError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedModel {
        fn new(mut replies: Vec<Result<ModelReply, ModelError>>) -> Self {
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl VisionModel for ScriptedModel {
        fn model_name(&self) -> &str {
            "scripted"
        }
        async fn complete(&self, _request: &InferenceRequest) -> Result<ModelReply, ModelError> {
            *self.calls.lock().unwrap() += 1;
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(ModelError::Unavailable("exhausted".into())))
        }
    }

    fn reply(content: &str) -> Result<ModelReply, ModelError> {
        Ok(ModelReply {
            content: content.to_string(),
            refusal: None,
            usage: Some(TokenUsage {
                tokens_in: 2000,
                tokens_out: 100,
            }),
        })
    }

    async fn client(
        model: Arc<ScriptedModel>,
        limit: f64,
    ) -> (tempfile::TempDir, Arc<BudgetGovernor>, InferenceClient) {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect(dir.path().join("t.db").to_str().unwrap())
            .await
            .unwrap();
        let ledger = Arc::new(SqliteLedger::new(pool).await.unwrap());
        let governor = Arc::new(BudgetGovernor::new(
            ledger,
            BudgetConfig {
                default_limit: limit,
                near_limit_ratio: 0.8,
                period: BudgetPeriod::Monthly,
                billing_day: 1,
            },
        ));
        let config = InferenceConfig {
            estimated_cost: 1.0,
            price_per_1k_input: 0.5,
            price_per_1k_output: 1.0,
            backoff_base_ms: 1,
            max_attempts: 2,
            ..InferenceConfig::default()
        };
        let client = InferenceClient::new(model, governor.clone(), config, extraction_config());
        (dir, governor, client)
    }

    fn ctx() -> JobContext {
        JobContext {
            job_id: JobId::new(),
            tenant_id: "acme".into(),
            user_id: Some("u-7".into()),
        }
    }

    #[test]
    fn parses_fenced_json_and_keeps_extra_fields() {
        let content = "```json\n{\"container\": \"div.card\", \"fields\": {\"name\": \"h2\", \"price\": \".price\", \"rating\": \"span.stars\"}}\n```";
        let pattern = parse_pattern(content, &signature(), &extraction_config()).unwrap();
        assert_eq!(pattern.container.to_css_string(), "div.card");
        assert_eq!(pattern.fields.len(), 3);
        assert_eq!(pattern.confidence, 0.0);
    }

    #[test]
    fn rejects_untrusted_shapes() {
        let cfg = extraction_config();
        let sig = signature();
        for bad in [
            "",
            "sorry, I cannot help",
            r#"{"fields": {"name": "h2"}}"#,
            r#"{"container": "div.card", "fields": {"price": ".p"}}"#,
            r#"{"container": "div.a, div.b", "fields": {"name": "h2"}}"#,
            r#"{"container": "div.card", "fields": {"name": "h2:first-child"}}"#,
            r#"{"container": "div.css-x9f2kq", "fields": {"name": "h2"}}"#,
            r#"{"container": "div.card", "fields": {"name": "span.sc-bdfbzx"}}"#,
        ] {
            assert!(
                matches!(parse_pattern(bad, &sig, &cfg), Err(InferenceError::Malformed(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn drops_generated_optional_selectors_and_reads_next_page() {
        let content = r#"{
            "container": "li[data-testid='result']",
            "fields": {"name": "h2", "price": "span.ab12345"},
            "next_page": "a[rel='next']"
        }"#;
        let pattern = parse_pattern(content, &signature(), &extraction_config()).unwrap();
        assert_eq!(pattern.fields.len(), 1);
        assert!(!pattern.fields.contains_key("price"));
        assert_eq!(pattern.next_page, Some(CssSelector::parse("a[rel='next']").unwrap()));
        assert_eq!(pattern.stability(), SelectorStability::Stable);

        let no_link = r#"{"container": "div.card", "fields": {"name": "h2"}, "next_page": null}"#;
        let pattern = parse_pattern(no_link, &signature(), &extraction_config()).unwrap();
        assert!(pattern.next_page.is_none());
        assert_eq!(pattern.stability(), SelectorStability::Fragile);
    }

    #[tokio::test]
    async fn malformed_replies_are_still_charged() {
        let model = Arc::new(ScriptedModel::new(vec![reply("not json")]));
        let (_dir, governor, client) = client(model.clone(), 10.0).await;

        let err = client.infer(&ctx(), b"png", &signature()).await.unwrap_err();
        assert!(matches!(err, InferenceError::Malformed(_)));

        let budget = governor.budget("acme").await.unwrap();
        // 2000 in * 0.5/1k + 100 out * 1.0/1k
        assert!((budget.consumed - 1.1).abs() < 1e-9);
        assert_eq!(*model.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn timeouts_retry_and_charge_the_estimate() {
        let model = Arc::new(ScriptedModel::new(vec![
            Err(ModelError::Timeout),
            reply(r#"{"container": "li.item", "fields": {"name": "a"}}"#),
        ]));
        let (_dir, governor, client) = client(model.clone(), 10.0).await;

        let pattern = client.infer(&ctx(), b"png", &signature()).await.unwrap();
        assert_eq!(pattern.fields["name"], CssSelector::Tag("a".into()));
        assert_eq!(*model.calls.lock().unwrap(), 2);

        let budget = governor.budget("acme").await.unwrap();
        assert!((budget.consumed - (1.0 + 1.1)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn denied_budget_skips_the_call() {
        let model = Arc::new(ScriptedModel::new(vec![reply("{}")]));
        let (_dir, governor, client) = client(model.clone(), 0.5).await;

        let err = client.infer(&ctx(), b"png", &signature()).await.unwrap_err();
        assert!(matches!(err, InferenceError::BudgetExceeded));
        assert_eq!(*model.calls.lock().unwrap(), 0);
        assert_eq!(governor.budget("acme").await.unwrap().consumed, 0.0);
    }
}
