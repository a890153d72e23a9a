pub mod chromium;

use crate::backoff;
use crate::config::NavigationConfig;
use crate::error::NavigationError;
use async_trait::async_trait;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use url::Url;

/// What the browser reports after a navigation settles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLoad {
    pub final_url: String,
    /// Main document status, when the engine exposes it.
    pub status: Option<u16>,
}

#[async_trait]
pub trait Browser: Send + Sync {
    /// Opens a fresh context with its own cookies and storage.
    async fn new_context(&self) -> Result<Box<dyn BrowserContext>, NavigationError>;
}

#[async_trait]
pub trait BrowserContext: Send + Sync {
    async fn goto(&mut self, url: &str) -> Result<PageLoad, NavigationError>;
    /// Scrolls roughly one viewport down.
    async fn scroll_step(&mut self) -> Result<(), NavigationError>;
    async fn html(&self) -> Result<String, NavigationError>;
    /// Full-page PNG.
    async fn screenshot(&self) -> Result<Vec<u8>, NavigationError>;
    async fn close(self: Box<Self>);
}

/// A loaded page whose browsing context is still open.
pub struct RenderedPage {
    pub url: Url,
    pub final_url: String,
    pub html: String,
    context: Box<dyn BrowserContext>,
}

impl RenderedPage {
    pub fn new(url: Url, final_url: String, html: String, context: Box<dyn BrowserContext>) -> Self {
        Self {
            url,
            final_url,
            html,
            context,
        }
    }

    pub async fn screenshot(&self) -> Result<Vec<u8>, NavigationError> {
        self.context.screenshot().await
    }

    /// Content-addressed reference to the HTML this page was extracted from.
    pub fn snapshot_ref(&self) -> String {
        let digest = Sha256::digest(self.html.as_bytes());
        format!("sha256:{}", hex::encode(digest))
    }

    pub async fn close(self) {
        self.context.close().await;
    }
}

pub struct NavigationController {
    browser: Arc<dyn Browser>,
    config: NavigationConfig,
}

impl NavigationController {
    pub fn new(browser: Arc<dyn Browser>, config: NavigationConfig) -> Self {
        Self { browser, config }
    }

    pub async fn open(&self, target: &str) -> Result<RenderedPage, NavigationError> {
        let url = Url::parse(target)
            .map_err(|e| NavigationError::Permanent(format!("invalid url {}: {}", target, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(NavigationError::Permanent(format!(
                "unsupported scheme: {}",
                url.scheme()
            )));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_open(&url).await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    let wait = backoff::delay(
                        self.config.backoff_base_ms,
                        self.config.backoff_max_ms,
                        attempt,
                    );
                    log::warn!(
                        "Attempt {}/{} for {} failed ({}); retrying in {:?}",
                        attempt,
                        self.config.max_attempts,
                        url,
                        e,
                        wait
                    );
                    sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_open(&self, url: &Url) -> Result<RenderedPage, NavigationError> {
        let mut context = self.browser.new_context().await?;
        match self.load(context.as_mut(), url).await {
            Ok((load, html)) => Ok(RenderedPage::new(url.clone(), load.final_url, html, context)),
            Err(e) => {
                context.close().await;
                Err(e)
            }
        }
    }

    async fn load(
        &self,
        context: &mut dyn BrowserContext,
        url: &Url,
    ) -> Result<(PageLoad, String), NavigationError> {
        let nav_timeout = Duration::from_millis(self.config.timeout_ms);
        let load = timeout(nav_timeout, context.goto(url.as_str()))
            .await
            .map_err(|_| {
                NavigationError::Transient(format!(
                    "navigation timed out after {}ms",
                    self.config.timeout_ms
                ))
            })??;

        if let Some(status) = load.status {
            classify_status(status)?;
        }

        // Incremental scrolling triggers lazy-loaded content.
        for _ in 0..self.config.scroll_steps {
            self.pause().await;
            context.scroll_step().await?;
        }
        self.pause().await;

        let html = context.html().await?;
        if looks_like_challenge(&html) {
            return Err(NavigationError::Transient(
                "anti-bot challenge page detected".to_string(),
            ));
        }

        log::debug!("Loaded {} ({} bytes)", load.final_url, html.len());
        Ok((load, html))
    }

    async fn pause(&self) {
        let (min, max) = (self.config.min_delay_ms, self.config.max_delay_ms);
        if max == 0 {
            return;
        }
        let ms = rand::thread_rng().gen_range(min..=max);
        sleep(Duration::from_millis(ms)).await;
    }
}

pub fn classify_status(status: u16) -> Result<(), NavigationError> {
    match status {
        0..=399 => Ok(()),
        408 | 425 | 429 => Err(NavigationError::Transient(format!("HTTP {}", status))),
        400..=499 => Err(NavigationError::Permanent(format!("HTTP {}", status))),
        _ => Err(NavigationError::Transient(format!("HTTP {}", status))),
    }
}

/// Maps a browser engine error message onto the transient/permanent split.
pub fn classify_browser_error(message: &str) -> NavigationError {
    const PERMANENT: &[&str] = &[
        "ERR_NAME_NOT_RESOLVED",
        "ERR_NAME_RESOLUTION_FAILED",
        "ERR_INVALID_URL",
        "ERR_UNKNOWN_URL_SCHEME",
        "ERR_BLOCKED_BY_CLIENT",
        "ERR_CERT_",
    ];
    if PERMANENT.iter().any(|marker| message.contains(marker)) {
        NavigationError::Permanent(message.to_string())
    } else {
        NavigationError::Transient(message.to_string())
    }
}

pub fn looks_like_challenge(html: &str) -> bool {
    const MARKERS: &[&str] = &[
        "cf-browser-verification",
        "challenge-platform",
        "cf-chl-",
        "<title>just a moment...</title>",
        "attention required! | cloudflare",
        "px-captcha",
        "g-recaptcha",
        "h-captcha",
        "distil_r_captcha",
    ];
    let lower = html.to_ascii_lowercase();
    MARKERS.iter().any(|marker| lower.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Plays back one scripted result per opened context.
    struct ScriptedBrowser {
        script: Mutex<Vec<Result<(Option<u16>, String), NavigationError>>>,
        opened: AtomicUsize,
        closed: Arc<AtomicUsize>,
    }

    impl ScriptedBrowser {
        fn new(mut script: Vec<Result<(Option<u16>, String), NavigationError>>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
                opened: AtomicUsize::new(0),
                closed: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    struct ScriptedContext {
        result: Option<Result<(Option<u16>, String), NavigationError>>,
        html: String,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Browser for ScriptedBrowser {
        async fn new_context(&self) -> Result<Box<dyn BrowserContext>, NavigationError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let result = self.script.lock().unwrap().pop();
            Ok(Box::new(ScriptedContext {
                result,
                html: String::new(),
                closed: self.closed.clone(),
            }))
        }
    }

    #[async_trait]
    impl BrowserContext for ScriptedContext {
        async fn goto(&mut self, url: &str) -> Result<PageLoad, NavigationError> {
            let (status, html) = self
                .result
                .take()
                .unwrap_or_else(|| Err(NavigationError::Permanent("script exhausted".into())))?;
            self.html = html;
            Ok(PageLoad {
                final_url: url.to_string(),
                status,
            })
        }
        async fn scroll_step(&mut self) -> Result<(), NavigationError> {
            Ok(())
        }
        async fn html(&self) -> Result<String, NavigationError> {
            Ok(self.html.clone())
        }
        async fn screenshot(&self) -> Result<Vec<u8>, NavigationError> {
            Ok(vec![0x89, b'P', b'N', b'G'])
        }
        async fn close(self: Box<Self>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_config() -> NavigationConfig {
        NavigationConfig {
            min_delay_ms: 0,
            max_delay_ms: 0,
            backoff_base_ms: 1,
            backoff_max_ms: 2,
            max_attempts: 3,
            ..NavigationConfig::default()
        }
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let browser = Arc::new(ScriptedBrowser::new(vec![
            Err(NavigationError::Transient("ERR_CONNECTION_RESET".into())),
            Ok((Some(503), String::new())),
            Ok((Some(200), "<html><body>ok</body></html>".into())),
        ]));
        let controller = NavigationController::new(browser.clone(), fast_config());

        let page = controller.open("https://shop.example/a").await.unwrap();
        assert!(page.html.contains("ok"));
        assert!(page.snapshot_ref().starts_with("sha256:"));
        assert_eq!(browser.opened.load(Ordering::SeqCst), 3);
        // Failed attempts release their contexts immediately.
        assert_eq!(browser.closed.load(Ordering::SeqCst), 2);
        page.close().await;
        assert_eq!(browser.closed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let browser = Arc::new(ScriptedBrowser::new(vec![
            Ok((Some(404), String::new())),
            Ok((Some(200), "<html></html>".into())),
        ]));
        let controller = NavigationController::new(browser.clone(), fast_config());

        let err = controller.open("https://shop.example/missing").await.err().unwrap();
        assert!(matches!(err, NavigationError::Permanent(_)));
        assert_eq!(browser.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn challenge_pages_exhaust_the_attempt_ceiling() {
        let challenge = "<html><head><title>Just a moment...</title></head></html>".to_string();
        let browser = Arc::new(ScriptedBrowser::new(vec![
            Ok((Some(200), challenge.clone())),
            Ok((Some(200), challenge.clone())),
            Ok((Some(200), challenge)),
        ]));
        let controller = NavigationController::new(browser.clone(), fast_config());

        let err = controller.open("https://shop.example/").await.err().unwrap();
        assert!(err.is_transient());
        assert_eq!(browser.opened.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejects_non_http_targets() {
        let browser = Arc::new(ScriptedBrowser::new(vec![]));
        let controller = NavigationController::new(browser.clone(), fast_config());
        let err = controller.open("file:///etc/passwd").await.err().unwrap();
        assert!(matches!(err, NavigationError::Permanent(_)));
        assert_eq!(browser.opened.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn classifies_engine_errors() {
        assert!(matches!(
            classify_browser_error("net::ERR_NAME_NOT_RESOLVED"),
            NavigationError::Permanent(_)
        ));
        assert!(classify_browser_error("net::ERR_TIMED_OUT").is_transient());
        assert!(classify_status(429).is_err_and(|e| e.is_transient()));
        assert!(classify_status(410).is_err_and(|e| !e.is_transient()));
        assert!(classify_status(200).is_ok());
    }
}
