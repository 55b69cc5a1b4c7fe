//! Rule store: parsing, indexing, and querying of filtering rules.
//!
//! Rules are grouped by category id (1..=255) so whole rule sets can be
//! enabled and disabled at runtime. Each category holds three indices: block
//! rules and exception rules bucketed by fingerprint token, and element-hiding
//! rules bucketed by domain. The store is guarded by a reader/writer lock so
//! traffic keeps flowing while lists are reloaded; `parking_lot`'s fair lock
//! bounds how long a reload can be starved by readers.

mod cosmetic;
mod matcher;
mod parser;

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::options::CategorySet;

pub use cosmetic::{inject_style, style_block, CosmeticIndex, CosmeticRule};
pub use matcher::{Anchor, UrlPattern, WildcardPattern};
pub use parser::{parse_rule, ParsedRule, RuleKind, RuleOptions, TypeMask, UrlRule};

use matcher::TokenIndex;

/// Broad resource classes a request can be asking for, inferred from request
/// metadata and matched against `$` type options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Document,
    Subdocument,
    Script,
    Image,
    Stylesheet,
    XmlHttpRequest,
    #[default]
    Other,
}

impl ResourceType {
    /// Infers the resource type from the `Sec-Fetch-Dest` and `Accept`
    /// headers, falling back to the URL path extension.
    pub fn infer(sec_fetch_dest: Option<&str>, accept: Option<&str>, path: &str) -> Self {
        if let Some(dest) = sec_fetch_dest {
            match dest {
                "document" => return Self::Document,
                "iframe" | "frame" | "embed" | "object" => return Self::Subdocument,
                "script" | "worker" | "serviceworker" | "sharedworker" => return Self::Script,
                "image" => return Self::Image,
                "style" => return Self::Stylesheet,
                "empty" => return Self::XmlHttpRequest,
                _ => {}
            }
        }
        if let Some(accept) = accept {
            if accept.contains("text/html") {
                return Self::Document;
            }
            if accept.contains("text/css") {
                return Self::Stylesheet;
            }
            if accept.starts_with("image/") {
                return Self::Image;
            }
        }

        let path = path.split(['?', '#']).next().unwrap_or(path);
        match path.rsplit('.').next().map(str::to_ascii_lowercase).as_deref() {
            Some("js" | "mjs") => Self::Script,
            Some("css") => Self::Stylesheet,
            Some("png" | "jpg" | "jpeg" | "gif" | "webp" | "svg" | "ico" | "bmp" | "avif") => {
                Self::Image
            }
            Some("htm" | "html" | "xhtml") => Self::Document,
            _ => Self::Other,
        }
    }
}

/// The request fingerprint a classification runs against.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    /// Full request URL.
    pub url: &'a str,
    /// Request host (from the Host header or SNI).
    pub host: &'a str,
    /// Host of the referring document, when known.
    pub referer_host: Option<&'a str>,
    pub resource_type: ResourceType,
}

impl RequestContext<'_> {
    /// A request is third-party when the requested host and the referring
    /// document's host have different registrable domains. Without a referrer
    /// the request is treated as first-party.
    pub fn is_third_party(&self) -> bool {
        match self.referer_host {
            Some(referer) => base_domain(self.host) != base_domain(referer),
            None => false,
        }
    }
}

/// Last two labels of a hostname. A public-suffix list would be more precise;
/// for filtering purposes the two-label heuristic matches what the rule
/// grammar can express.
fn base_domain(host: &str) -> &str {
    let mut dots = host.rmatch_indices('.');
    dots.next();
    match dots.next() {
        Some((idx, _)) => &host[idx + 1..],
        None => host,
    }
}

/// Outcome of a URL classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum Decision {
    /// An exception rule matched; the request must not be blocked.
    Allow { category: u8, rule: String },
    /// A block rule matched.
    Block { category: u8, rule: String },
    /// No enabled rule matched.
    None,
}

impl Decision {
    pub fn is_block(&self) -> bool {
        matches!(self, Decision::Block { .. })
    }
}

/// Counts returned by a rule-list load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSummary {
    /// Rules successfully parsed and stored.
    pub loaded: u32,
    /// Lines that looked like rules but failed to parse.
    pub failed: u32,
}

#[derive(Default)]
struct CategoryRules {
    block: TokenIndex,
    exception: TokenIndex,
    cosmetic: CosmeticIndex,
}

impl CategoryRules {
    fn is_empty(&self) -> bool {
        self.block.len() == 0 && self.exception.len() == 0 && self.cosmetic.is_empty()
    }
}

/// Categorized, reader/writer-protected store of URL and element-hiding
/// rules.
#[derive(Default)]
pub struct FilterStore {
    inner: RwLock<BTreeMap<u8, CategoryRules>>,
}

impl FilterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `text` line by line into `category`, returning how many rules
    /// loaded and how many failed. With `flush_existing`, the category is
    /// emptied first. Category 0 is reserved and rejected.
    pub fn load_from_text(
        &self,
        text: &str,
        category: u8,
        flush_existing: bool,
    ) -> Result<LoadSummary> {
        if category == 0 {
            return Err(CoreError::ReservedCategory);
        }

        let mut summary = LoadSummary::default();
        let mut inner = self.inner.write();
        if flush_existing {
            inner.remove(&category);
        }
        let rules = inner.entry(category).or_default();

        for line in text.split(['\n', '\r']) {
            match parser::parse_rule(line) {
                Ok(Some(ParsedRule::Url(rule))) => {
                    summary.loaded += 1;
                    match rule.kind {
                        RuleKind::Block => rules.block.insert(rule),
                        RuleKind::Exception => rules.exception.insert(rule),
                    }
                }
                Ok(Some(ParsedRule::Cosmetic(rule))) => {
                    summary.loaded += 1;
                    rules.cosmetic.insert(rule);
                }
                Ok(None) => {}
                Err(err) => {
                    summary.failed += 1;
                    tracing::debug!(line, %err, "rejected filter rule");
                }
            }
        }

        if rules.is_empty() {
            inner.remove(&category);
        }
        Ok(summary)
    }

    /// Drops every rule in `category`.
    pub fn unload_category(&self, category: u8) {
        self.inner.write().remove(&category);
    }

    /// Total number of URL rules across all categories.
    pub fn rule_count(&self) -> usize {
        self.inner
            .read()
            .values()
            .map(|r| r.block.len() + r.exception.len())
            .sum()
    }

    /// Classifies a request against every enabled category. Exception rules
    /// are consulted first across all enabled categories; any hit allows the
    /// request unconditionally. Otherwise the first matching block rule wins.
    pub fn query_url(&self, ctx: &RequestContext<'_>, categories: &CategorySet) -> Decision {
        let url_folded = ctx.url.to_ascii_lowercase();
        let inner = self.inner.read();

        for (&category, rules) in inner.iter() {
            if !categories.get(category) {
                continue;
            }
            if let Some(rule) = rules.exception.query(ctx, &url_folded) {
                return Decision::Allow {
                    category,
                    rule: rule.text.clone(),
                };
            }
        }

        for (&category, rules) in inner.iter() {
            if !categories.get(category) {
                continue;
            }
            if let Some(rule) = rules.block.query(ctx, &url_folded) {
                return Decision::Block {
                    category,
                    rule: rule.text.clone(),
                };
            }
        }

        Decision::None
    }

    /// Element-hiding selectors applicable to `host`, grouped by the enabled
    /// category that contributed them.
    pub fn element_hide_selectors(
        &self,
        host: &str,
        categories: &CategorySet,
    ) -> Vec<(u8, Vec<String>)> {
        let host = host.to_ascii_lowercase();
        let inner = self.inner.read();
        let mut out = Vec::new();
        for (&category, rules) in inner.iter() {
            if !categories.get(category) || rules.cosmetic.is_empty() {
                continue;
            }
            let selectors = rules.cosmetic.selectors_for(&host);
            if !selectors.is_empty() {
                out.push((category, selectors));
            }
        }
        out
    }

    /// True when any enabled category holds element-hiding rules.
    pub fn has_cosmetic_rules(&self, categories: &CategorySet) -> bool {
        self.inner
            .read()
            .iter()
            .any(|(&cat, rules)| categories.get(cat) && !rules.cosmetic.is_empty())
    }
}
