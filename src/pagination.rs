use crate::config::PaginationConfig;
use crate::selector::CssSelector;
use select::document::Document;
use url::Url;

/// Finds the link to the next page of a listing.
#[derive(Debug, Clone)]
pub struct Paginator {
    selectors: Vec<CssSelector>,
    page_param: Option<String>,
    max_pages: u32,
}

impl Paginator {
    pub fn new(config: &PaginationConfig) -> Self {
        let selectors = config
            .next_selectors
            .iter()
            .filter_map(|raw| match CssSelector::parse(raw) {
                Ok(selector) => Some(selector),
                Err(e) => {
                    log::warn!("Ignoring next-page selector '{}': {}", raw, e);
                    None
                }
            })
            .collect();

        Self {
            selectors,
            page_param: config.page_param.clone().filter(|p| !p.is_empty()),
            max_pages: config.max_pages.max(1),
        }
    }

    pub fn max_pages(&self) -> u32 {
        self.max_pages
    }

    /// The learned selector wins over the configured ones. Links leaving the
    /// current host are ignored.
    pub fn next_url(&self, html: &str, current: &Url, learned: Option<&CssSelector>) -> Option<Url> {
        let document = Document::from(html);
        let linked = learned
            .into_iter()
            .chain(self.selectors.iter())
            .find_map(|selector| {
                document
                    .find(selector)
                    .filter_map(|node| node.attr("href"))
                    .find_map(|href| resolve(current, href))
            });

        linked.or_else(|| {
            self.page_param
                .as_deref()
                .map(|param| bump_page_param(current, param))
        })
    }
}

fn resolve(current: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    let mut url = current.join(href).ok()?;
    url.set_fragment(None);
    let same_site = matches!(url.scheme(), "http" | "https") && url.host_str() == current.host_str();
    (same_site && url != *current).then_some(url)
}

fn bump_page_param(current: &Url, param: &str) -> Url {
    let page = current
        .query_pairs()
        .find(|(key, _)| *key == param)
        .and_then(|(_, value)| value.parse::<u32>().ok())
        .unwrap_or(1);
    let kept: Vec<(String, String)> = current
        .query_pairs()
        .filter(|(key, _)| *key != param)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    let mut next = current.clone();
    next.set_fragment(None);
    next.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair(param, &(page + 1).to_string());
    next
}
