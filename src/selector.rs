use regex::Regex;
use select::node::Node;
use select::predicate::Predicate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

/// Generated class names (css-in-js hashes, styled-components) that change
/// whenever the site is rebuilt.
static OBFUSCATED: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bcss-[a-z0-9]{5,}",
        r"(?i)\.[a-z]{2,4}[0-9]{4,}",
        r"(?i)\bsc-[a-z]{5,}",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// A recursive, serializable definition of a CSS selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "spec")]
pub enum CssSelector {
    /// Matches an HTML tag name (e.g., "div", "a")
    Tag(String),

    /// Matches a CSS class (e.g., "quote")
    Class(String),

    /// Matches an HTML ID (e.g., "main")
    Id(String),

    /// Matches an attribute existence or specific value
    Attribute { key: String, value: Option<String> },

    /// AND Logic: Matches if ALL sub-selectors match
    And(Vec<CssSelector>),

    /// OR Logic: Matches if ANY sub-selector matches
    Or(Vec<CssSelector>),

    /// Descendant Logic: .ancestor .descendant
    Descendant {
        ancestor: Box<CssSelector>,
        descendant: Box<CssSelector>,
    },

    /// Child Logic: .parent > .child
    Child {
        parent: Box<CssSelector>,
        child: Box<CssSelector>,
    },
}

/// How likely a selector is to survive a redesign of the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorStability {
    /// Anchored on `data-test`/`data-testid` hooks.
    Stable,
    /// Anchored on presentation classes, tags or ids.
    Fragile,
}

impl fmt::Display for SelectorStability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorStability::Stable => f.write_str("stable"),
            SelectorStability::Fragile => f.write_str("fragile"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectorParseError {
    #[error("empty selector")]
    Empty,

    #[error("unsupported character '{ch}' in selector '{selector}'")]
    Unexpected { ch: char, selector: String },

    #[error("invalid attribute selector '[{0}]'")]
    InvalidAttribute(String),

    #[error("dangling combinator in selector '{0}'")]
    DanglingCombinator(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    Descendant,
    Child,
}

impl CssSelector {
    /// Parses the subset of CSS this crate can evaluate: tags, classes, ids,
    /// attribute presence/equality, compounds, descendant and child
    /// combinators, and top-level selector lists.
    pub fn parse(input: &str) -> Result<Self, SelectorParseError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(SelectorParseError::Empty);
        }

        let mut alternatives = split_top_level(input)
            .into_iter()
            .map(|part| parse_complex(part.trim()))
            .collect::<Result<Vec<_>, _>>()?;

        if alternatives.len() == 1 {
            Ok(alternatives.remove(0))
        } else {
            Ok(CssSelector::Or(alternatives))
        }
    }

    /// Selector lists cannot be scoped under another selector by string
    /// concatenation.
    pub fn is_list(&self) -> bool {
        matches!(self, CssSelector::Or(_))
    }

    /// True when the selector relies on a machine-generated class name.
    pub fn is_obfuscated(&self) -> bool {
        let css = self.to_css_string();
        OBFUSCATED.iter().any(|re| re.is_match(&css))
    }

    pub fn stability(&self) -> SelectorStability {
        if self.uses_test_hook() {
            SelectorStability::Stable
        } else {
            SelectorStability::Fragile
        }
    }

    fn uses_test_hook(&self) -> bool {
        match self {
            CssSelector::Attribute { key, .. } => key.starts_with("data-test"),
            CssSelector::And(selectors) | CssSelector::Or(selectors) => {
                selectors.iter().any(|s| s.uses_test_hook())
            }
            CssSelector::Descendant {
                ancestor,
                descendant,
            } => ancestor.uses_test_hook() || descendant.uses_test_hook(),
            CssSelector::Child { parent, child } => {
                parent.uses_test_hook() || child.uses_test_hook()
            }
            CssSelector::Tag(_) | CssSelector::Class(_) | CssSelector::Id(_) => false,
        }
    }

    /// Converts the structured selector into a standard CSS selector string.
    pub fn to_css_string(&self) -> String {
        match self {
            CssSelector::Tag(tag) => tag.clone(),
            CssSelector::Class(cls) => format!(".{}", cls),
            CssSelector::Id(id) => format!("#{}", id),
            CssSelector::Attribute { key, value } => match value {
                Some(v) => format!("[{}='{}']", key, v),
                None => format!("[{}]", key),
            },
            CssSelector::And(selectors) => selectors
                .iter()
                .map(|s| s.to_css_string())
                .collect::<Vec<_>>()
                .join(""),
            CssSelector::Or(selectors) => selectors
                .iter()
                .map(|s| s.to_css_string())
                .collect::<Vec<_>>()
                .join(", "),
            CssSelector::Descendant {
                ancestor,
                descendant,
            } => {
                format!(
                    "{} {}",
                    ancestor.to_css_string(),
                    descendant.to_css_string()
                )
            }
            CssSelector::Child { parent, child } => {
                format!("{} > {}", parent.to_css_string(), child.to_css_string())
            }
        }
    }
}

impl fmt::Display for CssSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_css_string())
    }
}

impl Predicate for CssSelector {
    fn matches(&self, node: &Node) -> bool {
        match self {
            CssSelector::Tag(tag) => node.name() == Some(tag),
            CssSelector::Class(cls) => node
                .attr("class")
                .map(|classes| classes.split_whitespace().any(|c| c == cls))
                .unwrap_or(false),
            CssSelector::Id(id) => node.attr("id") == Some(id),
            CssSelector::Attribute { key, value } => match value {
                Some(v) => node.attr(key.as_str()) == Some(v),
                None => node.attr(key.as_str()).is_some(),
            },
            CssSelector::And(selectors) => selectors.iter().all(|s| s.matches(node)),
            CssSelector::Or(selectors) => selectors.iter().any(|s| s.matches(node)),
            CssSelector::Descendant {
                ancestor,
                descendant,
            } => {
                if !descendant.matches(node) {
                    return false;
                }
                let mut current = node.parent();
                while let Some(parent) = current {
                    if ancestor.matches(&parent) {
                        return true;
                    }
                    current = parent.parent();
                }
                false
            }
            CssSelector::Child { parent, child } => {
                child.matches(node) && node.parent().map(|p| parent.matches(&p)).unwrap_or(false)
            }
        }
    }
}

impl<'a> Predicate for &'a CssSelector {
    fn matches(&self, node: &Node) -> bool {
        (*self).matches(node)
    }
}

/// Splits on commas that are not inside an attribute selector.
fn split_top_level(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

fn parse_complex(input: &str) -> Result<CssSelector, SelectorParseError> {
    if input.is_empty() {
        return Err(SelectorParseError::Empty);
    }

    let mut compounds: Vec<(Option<Combinator>, String)> = Vec::new();
    let mut current = String::new();
    let mut pending: Option<Combinator> = None;
    let mut in_brackets = false;

    let flush = |current: &mut String,
                     pending: &mut Option<Combinator>,
                     compounds: &mut Vec<(Option<Combinator>, String)>|
     -> Result<(), SelectorParseError> {
        let combinator = pending.take();
        if compounds.is_empty() && combinator == Some(Combinator::Child) {
            return Err(SelectorParseError::DanglingCombinator(input.to_string()));
        }
        compounds.push((combinator, std::mem::take(current)));
        Ok(())
    };

    for c in input.chars() {
        match c {
            '[' => {
                in_brackets = true;
                current.push(c);
            }
            ']' => {
                in_brackets = false;
                current.push(c);
            }
            c if in_brackets => current.push(c),
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    flush(&mut current, &mut pending, &mut compounds)?;
                    pending = Some(Combinator::Descendant);
                }
            }
            '>' => {
                if !current.is_empty() {
                    flush(&mut current, &mut pending, &mut compounds)?;
                }
                pending = Some(Combinator::Child);
            }
            c => current.push(c),
        }
    }

    if current.is_empty() {
        return Err(SelectorParseError::DanglingCombinator(input.to_string()));
    }
    flush(&mut current, &mut pending, &mut compounds)?;

    let mut iter = compounds.into_iter();
    let (_, first) = iter.next().ok_or(SelectorParseError::Empty)?;
    let mut acc = parse_compound(&first)?;
    for (combinator, text) in iter {
        let next = parse_compound(&text)?;
        acc = match combinator.unwrap_or(Combinator::Descendant) {
            Combinator::Descendant => CssSelector::Descendant {
                ancestor: Box::new(acc),
                descendant: Box::new(next),
            },
            Combinator::Child => CssSelector::Child {
                parent: Box::new(acc),
                child: Box::new(next),
            },
        };
    }
    Ok(acc)
}

fn parse_compound(input: &str) -> Result<CssSelector, SelectorParseError> {
    let unexpected = |ch: char| SelectorParseError::Unexpected {
        ch,
        selector: input.to_string(),
    };

    let mut parts = Vec::new();
    let mut chars = input.chars().peekable();

    if chars.peek().is_some_and(|c| c.is_ascii_alphabetic()) {
        parts.push(CssSelector::Tag(read_ident(&mut chars).to_ascii_lowercase()));
    }

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                let ident = read_ident(&mut chars);
                if ident.is_empty() {
                    return Err(unexpected('.'));
                }
                parts.push(CssSelector::Class(ident));
            }
            '#' => {
                let ident = read_ident(&mut chars);
                if ident.is_empty() {
                    return Err(unexpected('#'));
                }
                parts.push(CssSelector::Id(ident));
            }
            '[' => {
                let mut body = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    body.push(c);
                }
                if !closed {
                    return Err(SelectorParseError::InvalidAttribute(body));
                }
                parts.push(parse_attribute(&body)?);
            }
            other => return Err(unexpected(other)),
        }
    }

    match parts.len() {
        0 => Err(SelectorParseError::Empty),
        1 => Ok(parts.remove(0)),
        _ => Ok(CssSelector::And(parts)),
    }
}

fn parse_attribute(body: &str) -> Result<CssSelector, SelectorParseError> {
    let invalid = || SelectorParseError::InvalidAttribute(body.to_string());
    let (key, value) = match body.split_once('=') {
        Some((key, value)) => {
            let value = value.trim();
            let unquoted = value
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
                .unwrap_or(value);
            (key.trim(), Some(unquoted.to_string()))
        }
        None => (body.trim(), None),
    };

    let valid_key = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ':');
    if !valid_key {
        return Err(invalid());
    }

    Ok(CssSelector::Attribute {
        key: key.to_string(),
        value,
    })
}

fn read_ident(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut ident = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            ident.push(c);
            chars.next();
        } else {
            break;
        }
    }
    ident
}
