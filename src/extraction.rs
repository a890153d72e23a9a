use crate::config::{ExtractionConfig, PatternConfig};
use crate::error::ExtractionError;
use crate::model::{ExtractedRecord, JobContext, SelectorPattern};
use crate::navigation::RenderedPage;
use crate::patterns::PatternStore;
use chrono::Utc;
use select::document::Document;
use select::node::Node;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Attributes read when a matched element carries no text (links, images, meta).
const VALUE_ATTRIBUTES: [&str; 5] = ["content", "href", "src", "alt", "title"];

pub struct ExtractionEngine {
    store: Arc<dyn PatternStore>,
    config: ExtractionConfig,
    fresh_confidence: f64,
}

impl ExtractionEngine {
    pub fn new(store: Arc<dyn PatternStore>, config: ExtractionConfig, patterns: &PatternConfig) -> Self {
        Self {
            store,
            config,
            fresh_confidence: patterns.fresh_confidence,
        }
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Runs the pattern against the page. The store is not touched.
    pub fn extract(
        &self,
        ctx: &JobContext,
        page: &RenderedPage,
        pattern: &SelectorPattern,
    ) -> Result<Vec<ExtractedRecord>, ExtractionError> {
        self.extract_document(ctx, page.url.as_str(), &page.html, &page.snapshot_ref(), pattern)
    }

    pub fn extract_document(
        &self,
        ctx: &JobContext,
        source_url: &str,
        html: &str,
        snapshot_ref: &str,
        pattern: &SelectorPattern,
    ) -> Result<Vec<ExtractedRecord>, ExtractionError> {
        let document = Document::from(html);
        let candidates = collect_candidates(&document, pattern);

        if candidates.is_empty() {
            return Err(ExtractionError::EmptyResult);
        }

        let total = candidates.len();
        let complete: Vec<BTreeMap<String, String>> = candidates
            .into_iter()
            .filter(|values| {
                self.config
                    .required_fields()
                    .all(|f| values.get(&f.name).is_some_and(|v| !v.is_empty()))
            })
            .collect();
        let completeness = complete.len() as f64 / total as f64;

        if total < self.config.min_records || completeness < self.config.min_field_completeness {
            return Err(ExtractionError::ValidationFailed(format!(
                "{} containers, {:.0}% complete (need {} and {:.0}%)",
                total,
                completeness * 100.0,
                self.config.min_records,
                self.config.min_field_completeness * 100.0
            )));
        }

        let extracted_at = Utc::now();
        let key_fields = self.config.dedup_fields();
        let records = complete
            .into_iter()
            .map(|mut values| {
                let mut fields = BTreeMap::new();
                for spec in &self.config.fields {
                    let value = values.remove(&spec.name).unwrap_or_default();
                    fields.insert(spec.name.clone(), value);
                }
                let dedup_key = dedup_key(&fields, &key_fields, source_url);
                ExtractedRecord {
                    job_id: ctx.job_id,
                    source_url: source_url.to_string(),
                    fields,
                    extra: values,
                    raw_snapshot_ref: snapshot_ref.to_string(),
                    extracted_at,
                    dedup_key,
                }
            })
            .collect::<Vec<_>>();

        log::debug!(
            "Extracted {} of {} candidates from {} using {}",
            records.len(),
            total,
            source_url,
            pattern.signature
        );
        Ok(records)
    }

    /// Uses a pattern from the store: success counts a hit, failure degrades it.
    pub async fn apply_cached(
        &self,
        ctx: &JobContext,
        page: &RenderedPage,
        pattern: &SelectorPattern,
    ) -> Result<Vec<ExtractedRecord>, ExtractionError> {
        match self.extract(ctx, page, pattern) {
            Ok(records) => {
                if let Err(e) = self.store.record_hit(&pattern.signature).await {
                    log::warn!("Could not record pattern hit for {}: {}", pattern.signature, e);
                }
                Ok(records)
            }
            Err(e) => {
                log::info!("Cached pattern for {} failed: {}", pattern.signature, e);
                if let Err(store_err) = self.store.degrade(&pattern.signature).await {
                    log::warn!("Could not degrade pattern for {}: {}", pattern.signature, store_err);
                }
                Err(e)
            }
        }
    }

    /// Validates a freshly inferred pattern and caches it on success.
    pub async fn apply_inferred(
        &self,
        ctx: &JobContext,
        page: &RenderedPage,
        candidate: SelectorPattern,
    ) -> Result<Vec<ExtractedRecord>, ExtractionError> {
        let records = self.extract(ctx, page, &candidate)?;

        let pattern = SelectorPattern {
            confidence: self.fresh_confidence,
            consecutive_failures: 0,
            hits: 0,
            last_validated_at: Some(Utc::now()),
            ..candidate
        };
        // A failed write only costs a future cache miss.
        if let Err(e) = self.store.upsert(&pattern).await {
            log::warn!("Could not cache pattern for {}: {}", pattern.signature, e);
        }
        Ok(records)
    }
}

/// One value map per container match, in document order.
fn collect_candidates(document: &Document, pattern: &SelectorPattern) -> Vec<BTreeMap<String, String>> {
    document
        .find(&pattern.container)
        .map(|container| {
            pattern
                .fields
                .iter()
                .filter_map(|(name, selector)| {
                    container
                        .find(selector)
                        .map(node_value)
                        .find(|v| !v.is_empty())
                        .map(|v| (name.clone(), v))
                })
                .collect()
        })
        .collect()
}

fn node_value(node: Node) -> String {
    let text = normalize(&node.text());
    if !text.is_empty() {
        return text;
    }
    VALUE_ATTRIBUTES
        .iter()
        .find_map(|attr| node.attr(attr).map(normalize).filter(|v| !v.is_empty()))
        .unwrap_or_default()
}

fn normalize(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Hash of the case-folded key fields plus the source URL.
pub fn dedup_key(fields: &BTreeMap<String, String>, key_fields: &[String], source_url: &str) -> String {
    let mut hasher = Sha256::new();
    for name in key_fields {
        let value = fields.get(name).map(|v| v.to_lowercase()).unwrap_or_default();
        hasher.update(value.as_bytes());
        hasher.update([0x1f]);
    }
    hasher.update(source_url.as_bytes());
    hex::encode(hasher.finalize())
}

/// First-wins filter over the records of one job.
#[derive(Debug, Default)]
pub struct Deduper {
    seen: HashSet<String>,
}

impl Deduper {
    pub fn admit(&mut self, record: &ExtractedRecord) -> bool {
        self.seen.insert(record.dedup_key.clone())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
