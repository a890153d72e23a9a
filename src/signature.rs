use crate::model::SiteSignature;
use select::document::Document;
use select::node::Node;
use select::predicate::Name;
use sha2::{Digest, Sha256};
use url::Url;

/// Key for "pages that look the same": host, path template and a hash of the
/// element skeleton. Text and list lengths do not change it.
pub fn derive(url: &Url, html: &str, layout_depth: usize) -> SiteSignature {
    let host = url
        .host_str()
        .map(|h| h.trim_start_matches("www.").to_ascii_lowercase())
        .unwrap_or_default();

    SiteSignature {
        host,
        path_template: path_template(url),
        layout_hash: layout_hash(html, layout_depth),
    }
}

pub fn path_template(url: &Url) -> String {
    let segments: Vec<String> = url
        .path_segments()
        .map(|segs| {
            segs.filter(|s| !s.is_empty())
                .map(template_segment)
                .collect()
        })
        .unwrap_or_default();

    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

fn template_segment(segment: &str) -> String {
    let lower = segment.to_ascii_lowercase();
    if lower.chars().all(|c| c.is_ascii_digit()) {
        return "{n}".to_string();
    }
    let hexish = lower.len() >= 8
        && lower.chars().all(|c| c.is_ascii_hexdigit() || c == '-')
        && lower.chars().any(|c| c.is_ascii_digit());
    if hexish {
        return "{id}".to_string();
    }
    if lower.contains('-') && lower.chars().any(|c| c.is_ascii_digit()) {
        return "{slug}".to_string();
    }
    lower
}

/// Hex prefix of a SHA-256 over the body's element skeleton.
pub fn layout_hash(html: &str, depth: usize) -> String {
    let doc = Document::from(html);
    let mut skeleton = Vec::new();
    if let Some(body) = doc.find(Name("body")).next() {
        walk(&body, 0, depth, &mut skeleton);
    }

    let mut hasher = Sha256::new();
    for token in &skeleton {
        hasher.update(token.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())[..16].to_string()
}

fn walk(node: &Node, level: usize, max_depth: usize, out: &mut Vec<String>) {
    if level >= max_depth {
        return;
    }

    let mut previous: Option<String> = None;
    for child in node.children() {
        let Some(name) = child.name() else { continue };
        if matches!(name, "script" | "style" | "noscript" | "template") {
            continue;
        }

        let token = element_token(&child, name, level);
        // Repeated siblings (list items, cards) count once.
        if previous.as_deref() == Some(token.as_str()) {
            continue;
        }
        out.push(token.clone());
        previous = Some(token);
        walk(&child, level + 1, max_depth, out);
    }
}

fn element_token(node: &Node, name: &str, level: usize) -> String {
    let mut classes: Vec<&str> = node
        .attr("class")
        .map(|c| c.split_whitespace().collect())
        .unwrap_or_default();
    classes.sort_unstable();
    classes.dedup();

    if classes.is_empty() {
        format!("{}:{}", level, name)
    } else {
        format!("{}:{}.{}", level, name, classes.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(items: usize, text: &str) -> String {
        let cards: String = (0..items)
            .map(|i| format!(r#"<div class="card"><h2>{text} {i}</h2><span class="price">{i}</span></div>"#))
            .collect();
        format!(r#"<html><body><main class="grid">{cards}</main><script>x()</script></body></html>"#)
    }

    #[test]
    fn template_replaces_volatile_segments() {
        let url = Url::parse("https://www.Shop.example/products/12345/red-shoe-42?ref=x").unwrap();
        assert_eq!(path_template(&url), "/products/{n}/{slug}");

        let url = Url::parse("https://shop.example/item/9f8e7d6c-aaaa-4bbb-8ccc-123456789abc/").unwrap();
        assert_eq!(path_template(&url), "/item/{id}");

        let url = Url::parse("https://shop.example").unwrap();
        assert_eq!(path_template(&url), "/");
    }

    #[test]
    fn signature_is_stable_across_content_changes() {
        let url = Url::parse("https://www.shop.example/category/7").unwrap();
        let a = derive(&url, &page(3, "Alpha"), 4);
        let b = derive(&url, &page(12, "Beta"), 4);
        assert_eq!(a, b);
        assert_eq!(a.host, "shop.example");
    }

    #[test]
    fn redesign_changes_layout_hash() {
        let before = page(3, "Alpha");
        let after = before.replace("class=\"card\"", "class=\"tile\"");
        assert_ne!(layout_hash(&before, 4), layout_hash(&after, 4));
    }
}
