use super::{Browser, BrowserContext, PageLoad, classify_browser_error};
use crate::config::NavigationConfig;
use crate::error::NavigationError;
use async_trait::async_trait;
use chromiumoxide::browser::{Browser as CdpBrowser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const STATUS_JS: &str =
    "(() => { const e = performance.getEntriesByType('navigation')[0]; return e && e.responseStatus ? e.responseStatus : 0; })()";
const SCROLL_JS: &str = "window.scrollBy(0, Math.round(window.innerHeight * 0.8))";
const HTML_JS: &str = "document.documentElement.outerHTML";

pub struct ChromiumBrowser {
    browser: Arc<CdpBrowser>,
    active: Arc<AtomicUsize>,
}

impl ChromiumBrowser {
    pub async fn launch(config: &NavigationConfig) -> Result<Self, NavigationError> {
        let mut builder = BrowserConfig::builder()
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-blink-features=AutomationControlled");
        if !config.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &config.chrome_executable {
            builder = builder.chrome_executable(path);
        }
        let browser_config = builder
            .build()
            .map_err(|e| NavigationError::Permanent(format!("invalid browser config: {e}")))?;

        let (browser, mut handler) = CdpBrowser::launch(browser_config)
            .await
            .map_err(|e| NavigationError::Permanent(format!("failed to launch Chromium: {e}")))?;

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    log::debug!("Chromium handler event error: {}", e);
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn active_contexts(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Browser for ChromiumBrowser {
    async fn new_context(&self) -> Result<Box<dyn BrowserContext>, NavigationError> {
        let created = self
            .browser
            .execute(CreateBrowserContextParams::default())
            .await
            .map_err(|e| classify_browser_error(&e.to_string()))?;
        let context_id = created.result.browser_context_id.clone();

        let target = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id.clone())
            .build()
            .map_err(NavigationError::Permanent)?;
        let page = match self.browser.new_page(target).await {
            Ok(page) => page,
            Err(e) => {
                let _ = self
                    .browser
                    .execute(DisposeBrowserContextParams::new(context_id))
                    .await;
                return Err(classify_browser_error(&e.to_string()));
            }
        };

        self.active.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(ChromiumContext {
            browser: self.browser.clone(),
            context_id,
            page,
            active: self.active.clone(),
        }))
    }
}

/// One incognito browser context holding a single tab.
pub struct ChromiumContext {
    browser: Arc<CdpBrowser>,
    context_id: BrowserContextId,
    page: Page,
    active: Arc<AtomicUsize>,
}

#[async_trait]
impl BrowserContext for ChromiumContext {
    async fn goto(&mut self, url: &str) -> Result<PageLoad, NavigationError> {
        self.page
            .goto(url)
            .await
            .map_err(|e| classify_browser_error(&e.to_string()))?;
        let _ = self.page.wait_for_navigation().await;

        let final_url = self
            .page
            .url()
            .await
            .ok()
            .flatten()
            .map(|u| u.to_string())
            .unwrap_or_else(|| url.to_string());

        let status = self
            .page
            .evaluate(STATUS_JS)
            .await
            .ok()
            .and_then(|v| v.into_value::<u16>().ok())
            .filter(|s| *s != 0);

        Ok(PageLoad { final_url, status })
    }

    async fn scroll_step(&mut self) -> Result<(), NavigationError> {
        self.page
            .evaluate(SCROLL_JS)
            .await
            .map(|_| ())
            .map_err(|e| NavigationError::Transient(format!("scroll failed: {e}")))
    }

    async fn html(&self) -> Result<String, NavigationError> {
        self.page
            .evaluate(HTML_JS)
            .await
            .map_err(|e| NavigationError::Transient(format!("failed to read HTML: {e}")))?
            .into_value::<String>()
            .map_err(|e| NavigationError::Transient(format!("failed to read HTML: {e:?}")))
    }

    async fn screenshot(&self) -> Result<Vec<u8>, NavigationError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        self.page
            .screenshot(params)
            .await
            .map_err(|e| NavigationError::Transient(format!("screenshot failed: {e}")))
    }

    async fn close(self: Box<Self>) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        let ChromiumContext {
            browser,
            context_id,
            page,
            ..
        } = *self;
        let _ = page.close().await;
        if let Err(e) = browser
            .execute(DisposeBrowserContextParams::new(context_id))
            .await
        {
            log::debug!("Failed to dispose browser context: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_context_ids_dispose_the_same_context() {
        let id = BrowserContextId::new("ctx-1");
        let target = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(id.clone())
            .build()
            .unwrap();
        assert_eq!(target.browser_context_id.as_ref(), Some(&id));
        assert_eq!(DisposeBrowserContextParams::new(id.clone()).browser_context_id, id);
    }

    #[tokio::test]
    #[ignore] // Requires Chromium to be installed
    async fn contexts_are_isolated_and_released() {
        let config = NavigationConfig::default();
        let browser = ChromiumBrowser::launch(&config).await.unwrap();

        let mut ctx = browser.new_context().await.unwrap();
        ctx.goto("data:text/html,<h1>Hello</h1>").await.unwrap();
        assert!(ctx.html().await.unwrap().contains("<h1>Hello</h1>"));
        assert!(!ctx.screenshot().await.unwrap().is_empty());
        assert_eq!(browser.active_contexts(), 1);

        ctx.close().await;
        assert_eq!(browser.active_contexts(), 0);
    }
}
