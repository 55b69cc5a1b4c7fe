//! Cosmetic (element-hiding) rules.
//!
//! `domain##selector` hides elements matching a CSS selector on the listed
//! domains; a bare `##selector` applies everywhere; `domain#@#selector` lifts
//! a hide rule again. Hiding is applied by injecting a `<style>` block into
//! HTML responses, so these rules never influence network decisions.

use std::collections::HashMap;

use crate::error::RuleParseError;

use super::parser::host_in_domain;

/// One parsed element-hiding rule.
#[derive(Debug, Clone)]
pub struct CosmeticRule {
    /// Original rule text.
    pub text: String,
    /// The CSS selector to hide (or unhide).
    pub selector: String,
    /// True for `#@#` exception rules.
    pub unhide: bool,
    pub include_domains: Vec<String>,
    pub exclude_domains: Vec<String>,
}

impl CosmeticRule {
    /// Attempts to parse `line` as a cosmetic rule. Returns `Ok(None)` when
    /// the line carries no cosmetic marker.
    pub fn parse(line: &str) -> Result<Option<Self>, RuleParseError> {
        let (prefix, selector, unhide) = if let Some(idx) = line.find("#@#") {
            (&line[..idx], &line[idx + 3..], true)
        } else if let Some(idx) = line.find("##") {
            (&line[..idx], &line[idx + 2..], false)
        } else {
            return Ok(None);
        };

        let selector = selector.trim();
        if selector.is_empty() || selector.contains(['{', '}', '<']) {
            return Err(RuleParseError::BadSelector);
        }

        let mut include_domains = Vec::new();
        let mut exclude_domains = Vec::new();
        for domain in prefix.split(',') {
            let domain = domain.trim();
            if domain.is_empty() {
                continue;
            }
            match domain.strip_prefix('~') {
                Some(name) if !name.is_empty() => {
                    exclude_domains.push(name.to_ascii_lowercase())
                }
                Some(_) => return Err(RuleParseError::EmptyDomains),
                None => include_domains.push(domain.to_ascii_lowercase()),
            }
        }

        Ok(Some(Self {
            text: line.to_owned(),
            selector: selector.to_owned(),
            unhide,
            include_domains,
            exclude_domains,
        }))
    }

    fn applies_to(&self, host: &str) -> bool {
        if self.exclude_domains.iter().any(|d| host_in_domain(host, d)) {
            return false;
        }
        self.include_domains.is_empty()
            || self.include_domains.iter().any(|d| host_in_domain(host, d))
    }
}

/// Element-hiding rules bucketed by applicable domain suffix, with a global
/// bucket for unrestricted rules.
#[derive(Debug, Default)]
pub struct CosmeticIndex {
    global: Vec<CosmeticRule>,
    by_domain: HashMap<String, Vec<CosmeticRule>>,
    len: usize,
}

impl CosmeticIndex {
    pub fn insert(&mut self, rule: CosmeticRule) {
        self.len += 1;
        if rule.include_domains.is_empty() {
            self.global.push(rule);
        } else {
            for domain in &rule.include_domains {
                self.by_domain
                    .entry(domain.clone())
                    .or_default()
                    .push(rule.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Selectors to hide on `host`: every applicable hide rule minus the
    /// selectors lifted again by matching unhide rules.
    pub fn selectors_for(&self, host: &str) -> Vec<String> {
        let mut hidden = Vec::new();
        let mut unhidden = Vec::new();

        let mut visit = |rules: &[CosmeticRule]| {
            for rule in rules {
                if !rule.applies_to(host) {
                    continue;
                }
                if rule.unhide {
                    unhidden.push(rule.selector.clone());
                } else if !hidden.contains(&rule.selector) {
                    hidden.push(rule.selector.clone());
                }
            }
        };

        visit(&self.global);
        for suffix in domain_suffixes(host) {
            if let Some(rules) = self.by_domain.get(suffix) {
                visit(rules);
            }
        }

        hidden.retain(|sel| !unhidden.contains(sel));
        hidden
    }
}

/// Suffixes of a hostname, longest first: `a.b.c` → `a.b.c`, `b.c`, `c`.
fn domain_suffixes(host: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(Some(host), |h| h.split_once('.').map(|(_, rest)| rest))
}

/// Builds the `<style>` block injected into filtered HTML responses.
pub fn style_block(selectors: &[String]) -> String {
    let mut css = String::with_capacity(64 * selectors.len());
    css.push_str("<style type=\"text/css\">");
    for selector in selectors {
        css.push_str(selector);
        css.push_str("{display:none !important;}");
    }
    css.push_str("</style>");
    css
}

/// Injects `style` into an HTML document: immediately before `</head>` when
/// one is present (case-insensitive), otherwise prepended to the document.
pub fn inject_style(html: &[u8], style: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(html.len() + style.len());
    match find_case_insensitive(html, b"</head>") {
        Some(idx) => {
            out.extend_from_slice(&html[..idx]);
            out.extend_from_slice(style.as_bytes());
            out.extend_from_slice(&html[idx..]);
        }
        None => {
            out.extend_from_slice(style.as_bytes());
            out.extend_from_slice(html);
        }
    }
    out
}

fn find_case_insensitive(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(line: &str) -> CosmeticRule {
        CosmeticRule::parse(line).unwrap().unwrap()
    }

    #[test]
    fn parses_global_rule() {
        let r = rule("##.ad-banner");
        assert_eq!(r.selector, ".ad-banner");
        assert!(!r.unhide);
        assert!(r.include_domains.is_empty());
    }

    #[test]
    fn parses_domain_scoped_rule() {
        let r = rule("example.com,~shop.example.com##.promo");
        assert_eq!(r.include_domains, vec!["example.com"]);
        assert_eq!(r.exclude_domains, vec!["shop.example.com"]);
    }

    #[test]
    fn parses_unhide_rule() {
        let r = rule("example.com#@#.promo");
        assert!(r.unhide);
    }

    #[test]
    fn rejects_unsafe_selector() {
        assert!(CosmeticRule::parse("##.x{color:red}").is_err());
        assert!(CosmeticRule::parse("##").is_err());
    }

    #[test]
    fn non_cosmetic_line_is_none() {
        assert!(CosmeticRule::parse("||example.com^").unwrap().is_none());
    }

    #[test]
    fn index_scopes_by_domain() {
        let mut index = CosmeticIndex::default();
        index.insert(rule("##.ad"));
        index.insert(rule("example.com##.promo"));

        let on_example = index.selectors_for("www.example.com");
        assert!(on_example.contains(&".ad".to_string()));
        assert!(on_example.contains(&".promo".to_string()));

        let elsewhere = index.selectors_for("other.test");
        assert_eq!(elsewhere, vec![".ad".to_string()]);
    }

    #[test]
    fn unhide_lifts_selector() {
        let mut index = CosmeticIndex::default();
        index.insert(rule("##.ad"));
        index.insert(rule("friendly.test#@#.ad"));

        assert!(index.selectors_for("friendly.test").is_empty());
        assert_eq!(index.selectors_for("other.test"), vec![".ad".to_string()]);
    }

    #[test]
    fn exclude_domain_skips_rule() {
        let mut index = CosmeticIndex::default();
        index.insert(rule("~quiet.test##.ad"));
        assert!(index.selectors_for("quiet.test").is_empty());
        assert_eq!(index.selectors_for("loud.test"), vec![".ad".to_string()]);
    }

    #[test]
    fn duplicate_selectors_collapse() {
        let mut index = CosmeticIndex::default();
        index.insert(rule("##.ad"));
        index.insert(rule("example.com##.ad"));
        assert_eq!(index.selectors_for("example.com"), vec![".ad".to_string()]);
    }

    #[test]
    fn style_block_format() {
        let css = style_block(&[".ad-banner".to_string(), "#promo".to_string()]);
        assert_eq!(
            css,
            "<style type=\"text/css\">.ad-banner{display:none !important;}#promo{display:none !important;}</style>"
        );
    }

    #[test]
    fn injects_before_head_close() {
        let html = b"<html><head><title>t</title></head><body></body></html>";
        let out = inject_style(html, "<style>x</style>");
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "<html><head><title>t</title><style>x</style></head><body></body></html>"
        );
    }

    #[test]
    fn injection_is_case_insensitive() {
        let html = b"<HTML><HEAD></HEAD><BODY></BODY></HTML>";
        let out = inject_style(html, "<style>x</style>");
        assert!(String::from_utf8(out).unwrap().contains("<style>x</style></HEAD>"));
    }

    #[test]
    fn headless_document_gets_prefix() {
        let html = b"<p>bare fragment</p>";
        let out = inject_style(html, "<style>x</style>");
        assert!(out.starts_with(b"<style>x</style><p>"));
    }
}
