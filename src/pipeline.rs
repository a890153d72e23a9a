use crate::config::PaginationConfig;
use crate::error::{ExtractionError, PipelineError};
use crate::extraction::ExtractionEngine;
use crate::inference::InferenceClient;
use crate::metrics::collector::MetricsCollector;
use crate::model::{ExtractedRecord, JobContext, SelectorPattern};
use crate::navigation::{NavigationController, RenderedPage};
use crate::pagination::Paginator;
use crate::patterns::PatternStore;
use crate::signature;
use std::collections::HashSet;
use std::sync::Arc;
use url::Url;

#[derive(Debug)]
pub struct PageOutcome {
    /// Records from every page read, in page order.
    pub records: Vec<ExtractedRecord>,
    pub pages: u32,
    pub inference_calls: u32,
    /// The first page was served by a stored pattern.
    pub cache_hit: bool,
    /// Error that stopped pagination after the first page. Records read
    /// before it are kept.
    pub halted: Option<PipelineError>,
}

/// One rendered page, already closed.
struct Visit {
    url: Url,
    records: Vec<ExtractedRecord>,
    inference_calls: u32,
    cache_hit: bool,
    pattern: SelectorPattern,
    next_page: Option<Url>,
}

pub struct Pipeline {
    navigation: NavigationController,
    inference: InferenceClient,
    extraction: ExtractionEngine,
    store: Arc<dyn PatternStore>,
    paginator: Paginator,
    metrics: MetricsCollector,
}

impl Pipeline {
    pub fn new(
        navigation: NavigationController,
        inference: InferenceClient,
        extraction: ExtractionEngine,
        store: Arc<dyn PatternStore>,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            navigation,
            inference,
            extraction,
            store,
            paginator: Paginator::new(&PaginationConfig::default()),
            metrics,
        }
    }

    pub fn with_pagination(mut self, config: &PaginationConfig) -> Self {
        self.paginator = Paginator::new(config);
        self
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Reads `url` and the pages it links to as "next", up to `max_pages`.
    /// `stopped` is checked before each further page.
    pub async fn process<F>(
        &self,
        ctx: &JobContext,
        url: &str,
        stopped: F,
    ) -> Result<PageOutcome, PipelineError>
    where
        F: Fn() -> bool,
    {
        let first = self.visit(ctx, url, None).await?;
        let mut visited = HashSet::from([first.url.to_string()]);
        let mut outcome = PageOutcome {
            records: first.records,
            pages: 1,
            inference_calls: first.inference_calls,
            cache_hit: first.cache_hit,
            halted: None,
        };
        let mut pattern = first.pattern;
        let mut next = first.next_page;

        while let Some(page_url) = next.take() {
            if outcome.pages >= self.paginator.max_pages() {
                log::info!("Reached {} pages for {}", outcome.pages, url);
                break;
            }
            if !visited.insert(page_url.to_string()) || stopped() {
                break;
            }

            match self.visit(ctx, page_url.as_str(), Some(&pattern)).await {
                Ok(visit) => {
                    outcome.pages += 1;
                    outcome.inference_calls += visit.inference_calls;
                    outcome.records.extend(visit.records);
                    pattern = visit.pattern;
                    next = visit.next_page;
                }
                // A page without usable records is the end of the listing.
                Err(PipelineError::Extraction(e)) => {
                    log::info!("Stopped paging {} at {}: {}", url, page_url, e);
                }
                Err(e) => {
                    log::warn!("Paging {} halted at {}: {}", url, page_url, e);
                    outcome.halted = Some(e);
                }
            }
        }

        if outcome.pages > 1 {
            log::info!(
                "Read {} pages from {} ({} records)",
                outcome.pages,
                url,
                outcome.records.len()
            );
        }
        Ok(outcome)
    }

    async fn visit(
        &self,
        ctx: &JobContext,
        url: &str,
        carried: Option<&SelectorPattern>,
    ) -> Result<Visit, PipelineError> {
        let page = self.navigation.open(url).await?;
        self.metrics.increment_pages_processed();
        let result = self.process_page(ctx, &page, carried).await;
        let next_page = match &result {
            Ok(visit) => {
                let current = Url::parse(&page.final_url).unwrap_or_else(|_| page.url.clone());
                self.paginator
                    .next_url(&page.html, &current, visit.pattern.next_page.as_ref())
            }
            Err(_) => None,
        };
        page.close().await;
        result.map(|visit| Visit { next_page, ..visit })
    }

    async fn process_page(
        &self,
        ctx: &JobContext,
        page: &RenderedPage,
        carried: Option<&SelectorPattern>,
    ) -> Result<Visit, PipelineError> {
        let layout_depth = self.extraction.config().layout_depth;
        let signature = signature::derive(&page.url, &page.html, layout_depth);
        let done = |records, inference_calls, cache_hit, pattern| Visit {
            url: page.url.clone(),
            records,
            inference_calls,
            cache_hit,
            pattern,
            next_page: None,
        };

        // Later pages that still look like the first reuse its pattern as is.
        if let Some(pattern) = carried.filter(|p| p.signature == signature) {
            let records = self.extraction.extract(ctx, page, pattern)?;
            log::debug!("Reused page pattern on {} ({} records)", page.url, records.len());
            return Ok(done(records, 0, true, pattern.clone()));
        }

        let cached = match self.store.lookup(&signature).await {
            Ok(found) => found,
            Err(e) => {
                log::warn!("Pattern lookup failed for {}: {}", signature, e);
                None
            }
        };

        // A failed validation earns exactly one fresh inference; a miss gets
        // the first inference plus that one fallback.
        let mut budgeted_inferences = 2;
        if let Some(pattern) = cached {
            match self.extraction.apply_cached(ctx, page, &pattern).await {
                Ok(records) => {
                    self.metrics.increment_cache_hits();
                    log::info!("Reused pattern for {} ({} records)", page.url, records.len());
                    return Ok(done(records, 0, true, pattern));
                }
                Err(e) => {
                    log::info!("Cached pattern rejected on {}: {}", page.url, e);
                    budgeted_inferences = 1;
                }
            }
        }
        self.metrics.increment_cache_misses();

        let screenshot = page.screenshot().await?;
        let mut inference_calls = 0;
        let mut last_error = ExtractionError::EmptyResult;
        while inference_calls < budgeted_inferences {
            inference_calls += 1;
            self.metrics.increment_inference_calls();
            let candidate = self.inference.infer(ctx, &screenshot, &signature).await?;

            match self
                .extraction
                .apply_inferred(ctx, page, candidate.clone())
                .await
            {
                Ok(records) => {
                    log::info!(
                        "Learned pattern for {} after {} inference call(s) ({} records)",
                        page.url,
                        inference_calls,
                        records.len()
                    );
                    return Ok(done(records, inference_calls, false, candidate));
                }
                Err(e) => {
                    log::warn!("Inferred pattern rejected on {}: {}", page.url, e);
                    last_error = e;
                }
            }
        }
        Err(last_error.into())
    }
}
