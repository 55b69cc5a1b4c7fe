//! Adblock Plus rule parsing.
//!
//! Accepted grammar: plain patterns with `*` wildcards and `^` separators,
//! `|` / `||` anchors, `@@` exception prefixes, `/.../` regex bodies, an
//! option suffix after `$` (`domain=`, `third-party`, resource types,
//! `match-case`), and cosmetic rules `domain##selector` / `##selector` /
//! `domain#@#selector`. Comment lines (`!`) and `[Adblock ...]` headers are
//! skipped. A rule with an unknown option fails on its own without aborting
//! the surrounding batch.

use regex::RegexBuilder;

use crate::error::RuleParseError;

use super::cosmetic::CosmeticRule;
use super::matcher::{UrlPattern, WildcardPattern};
use super::{RequestContext, ResourceType};

/// Whether a URL rule blocks or exempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Block,
    Exception,
}

/// Bit set over [`ResourceType`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeMask(u16);

impl TypeMask {
    fn bit(ty: ResourceType) -> u16 {
        1 << ty as u16
    }

    pub fn insert(&mut self, ty: ResourceType) {
        self.0 |= Self::bit(ty);
    }

    pub fn contains(&self, ty: ResourceType) -> bool {
        self.0 & Self::bit(ty) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Parsed `$` option suffix of a URL rule.
#[derive(Debug, Clone, Default)]
pub struct RuleOptions {
    pub include_domains: Vec<String>,
    pub exclude_domains: Vec<String>,
    /// `Some(true)` for `$third-party`, `Some(false)` for `$~third-party`.
    pub third_party: Option<bool>,
    pub include_types: TypeMask,
    pub exclude_types: TypeMask,
    pub match_case: bool,
}

impl RuleOptions {
    /// Tests the option constraints against a request.
    pub fn applies(&self, ctx: &RequestContext<'_>) -> bool {
        if !self.include_types.is_empty() && !self.include_types.contains(ctx.resource_type) {
            return false;
        }
        if self.exclude_types.contains(ctx.resource_type) {
            return false;
        }
        if let Some(wants_third_party) = self.third_party {
            if ctx.is_third_party() != wants_third_party {
                return false;
            }
        }
        if !self.include_domains.is_empty() || !self.exclude_domains.is_empty() {
            let doc_host = ctx.referer_host.unwrap_or(ctx.host);
            if !self.include_domains.is_empty()
                && !self.include_domains.iter().any(|d| host_in_domain(doc_host, d))
            {
                return false;
            }
            if self.exclude_domains.iter().any(|d| host_in_domain(doc_host, d)) {
                return false;
            }
        }
        true
    }
}

/// Returns true when `host` equals `domain` or is a subdomain of it.
pub(crate) fn host_in_domain(host: &str, domain: &str) -> bool {
    host == domain
        || (host.len() > domain.len()
            && host.ends_with(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

/// An immutable, compiled URL filter rule.
#[derive(Debug, Clone)]
pub struct UrlRule {
    /// The original rule text, kept for events and diagnostics.
    pub text: String,
    pub kind: RuleKind,
    pub pattern: UrlPattern,
    pub options: RuleOptions,
}

impl UrlRule {
    /// Tests the rule against a request. `url_folded` is the request URL
    /// folded to ASCII lowercase.
    pub fn matches(&self, ctx: &RequestContext<'_>, url_folded: &str) -> bool {
        self.options.applies(ctx)
            && self
                .pattern
                .matches(ctx.url, url_folded, self.options.match_case)
    }
}

/// One successfully parsed line.
#[derive(Debug, Clone)]
pub enum ParsedRule {
    Url(UrlRule),
    Cosmetic(CosmeticRule),
}

/// Parses one rule line. Returns `Ok(None)` for lines that carry no rule
/// (empty, comment, list header).
pub fn parse_rule(line: &str) -> Result<Option<ParsedRule>, RuleParseError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('!') || line.starts_with('[') {
        return Ok(None);
    }

    if let Some(rule) = CosmeticRule::parse(line)? {
        return Ok(Some(ParsedRule::Cosmetic(rule)));
    }

    Ok(Some(ParsedRule::Url(parse_url_rule(line)?)))
}

fn parse_url_rule(line: &str) -> Result<UrlRule, RuleParseError> {
    let (kind, body) = match line.strip_prefix("@@") {
        Some(rest) => (RuleKind::Exception, rest),
        None => (RuleKind::Block, line),
    };

    let (body, options) = split_options(body)?;
    if body.is_empty() {
        return Err(RuleParseError::EmptyPattern);
    }

    let pattern = if body.len() > 2 && body.starts_with('/') && body.ends_with('/') {
        let source = &body[1..body.len() - 1];
        let re = RegexBuilder::new(source)
            .case_insensitive(!options.match_case)
            .size_limit(1 << 20)
            .build()
            .map_err(|e| RuleParseError::BadRegex(e.to_string()))?;
        UrlPattern::Regex(Box::new(re))
    } else {
        UrlPattern::Wildcard(WildcardPattern::compile(body, options.match_case))
    };

    Ok(UrlRule {
        text: line.to_owned(),
        kind,
        pattern,
        options,
    })
}

/// Splits the option suffix off a rule body. The `$` must introduce a suffix
/// that looks like an option list so `$` inside regex bodies is left alone.
fn split_options(body: &str) -> Result<(&str, RuleOptions), RuleParseError> {
    let mut options = RuleOptions::default();
    let Some(idx) = body.rfind('$') else {
        return Ok((body, options));
    };
    let suffix = &body[idx + 1..];
    if suffix.is_empty()
        || !suffix
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'~' | b'=' | b'|' | b',' | b'.' | b'_'))
    {
        return Ok((body, options));
    }

    for opt in suffix.split(',') {
        parse_option(opt.trim(), &mut options)?;
    }
    Ok((&body[..idx], options))
}

fn parse_option(opt: &str, options: &mut RuleOptions) -> Result<(), RuleParseError> {
    if let Some(domains) = opt.strip_prefix("domain=") {
        for domain in domains.split('|') {
            let (list, name) = match domain.strip_prefix('~') {
                Some(name) => (&mut options.exclude_domains, name),
                None => (&mut options.include_domains, domain),
            };
            if !name.is_empty() {
                list.push(name.to_ascii_lowercase());
            }
        }
        if options.include_domains.is_empty() && options.exclude_domains.is_empty() {
            return Err(RuleParseError::EmptyDomains);
        }
        return Ok(());
    }

    let (inverted, name) = match opt.strip_prefix('~') {
        Some(rest) => (true, rest),
        None => (false, opt),
    };

    let ty = match name {
        "third-party" => {
            options.third_party = Some(!inverted);
            return Ok(());
        }
        "match-case" => {
            if inverted {
                return Err(RuleParseError::UnknownOption(opt.to_owned()));
            }
            options.match_case = true;
            return Ok(());
        }
        "script" => ResourceType::Script,
        "image" => ResourceType::Image,
        "stylesheet" => ResourceType::Stylesheet,
        "xmlhttprequest" => ResourceType::XmlHttpRequest,
        "document" => ResourceType::Document,
        "subdocument" => ResourceType::Subdocument,
        _ => return Err(RuleParseError::UnknownOption(opt.to_owned())),
    };

    if inverted {
        options.exclude_types.insert(ty);
    } else {
        options.include_types.insert(ty);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url_rule(line: &str) -> UrlRule {
        match parse_rule(line).unwrap().unwrap() {
            ParsedRule::Url(rule) => rule,
            other => panic!("expected URL rule, got {other:?}"),
        }
    }

    fn ctx<'a>(url: &'a str, host: &'a str) -> RequestContext<'a> {
        RequestContext {
            url,
            host,
            referer_host: None,
            resource_type: ResourceType::Other,
        }
    }

    fn matches(line: &str, url: &str) -> bool {
        let rule = url_rule(line);
        let host = url
            .split("://")
            .nth(1)
            .unwrap_or(url)
            .split(['/', ':', '?'])
            .next()
            .unwrap();
        let folded = url.to_ascii_lowercase();
        rule.matches(&ctx(url, host), &folded)
    }

    // ==================== Line Classification Tests ====================

    #[test]
    fn skips_comments_and_headers() {
        assert!(parse_rule("! a comment").unwrap().is_none());
        assert!(parse_rule("[Adblock Plus 2.0]").unwrap().is_none());
        assert!(parse_rule("").unwrap().is_none());
        assert!(parse_rule("   ").unwrap().is_none());
    }

    #[test]
    fn exception_prefix_sets_kind() {
        assert_eq!(url_rule("@@||example.com^").kind, RuleKind::Exception);
        assert_eq!(url_rule("||example.com^").kind, RuleKind::Block);
    }

    #[test]
    fn cosmetic_marker_takes_precedence() {
        let parsed = parse_rule("example.com##.ad-banner").unwrap().unwrap();
        assert!(matches!(parsed, ParsedRule::Cosmetic(_)));
    }

    // ==================== Option Parsing Tests ====================

    #[test]
    fn parses_domain_option() {
        let rule = url_rule("/ads/$domain=example.com|~shop.example.com");
        assert_eq!(rule.options.include_domains, vec!["example.com"]);
        assert_eq!(rule.options.exclude_domains, vec!["shop.example.com"]);
    }

    #[test]
    fn parses_third_party_option() {
        assert_eq!(url_rule("||ads.net^$third-party").options.third_party, Some(true));
        assert_eq!(url_rule("||cdn.net^$~third-party").options.third_party, Some(false));
    }

    #[test]
    fn parses_type_options() {
        let rule = url_rule("||example.com^$script,~image");
        assert!(rule.options.include_types.contains(ResourceType::Script));
        assert!(rule.options.exclude_types.contains(ResourceType::Image));
    }

    #[test]
    fn unknown_option_fails_rule() {
        assert!(matches!(
            parse_rule("||example.com^$websocket"),
            Err(RuleParseError::UnknownOption(_))
        ));
    }

    #[test]
    fn match_case_is_honored() {
        let rule = url_rule("/BaNNer/$match-case");
        assert!(rule.options.match_case);
        let folded = "http://x.test/banner/".to_ascii_lowercase();
        assert!(!rule.matches(&ctx("http://x.test/banner/", "x.test"), &folded));
        let raw = "http://x.test/BaNNer/";
        assert!(rule.matches(&ctx(raw, "x.test"), &raw.to_ascii_lowercase()));
    }

    // ==================== Matching Tests ====================

    #[test]
    fn domain_anchored_block() {
        assert!(matches("||ads.example.com^", "http://ads.example.com/banner.gif"));
        assert!(!matches("||ads.example.com^", "http://example.com/ads.html"));
    }

    #[test]
    fn regex_rule() {
        assert!(matches(r"/banner[0-9]+\.gif/", "http://x.test/banner12.gif"));
        assert!(!matches(r"/banner[0-9]+\.gif/", "http://x.test/banner.gif"));
    }

    #[test]
    fn bad_regex_fails_rule() {
        assert!(matches!(
            parse_rule(r"/ba(nner/"),
            Err(RuleParseError::BadRegex(_))
        ));
    }

    #[test]
    fn third_party_option_constrains_match() {
        let rule = url_rule("||ads.example.com^$third-party");
        let url = "http://ads.example.com/banner.gif";
        let folded = url.to_ascii_lowercase();

        let first_party = RequestContext {
            url,
            host: "ads.example.com",
            referer_host: Some("example.com"),
            resource_type: ResourceType::Image,
        };
        assert!(!rule.matches(&first_party, &folded));

        let third_party = RequestContext {
            url,
            host: "ads.example.com",
            referer_host: Some("news.example.org"),
            resource_type: ResourceType::Image,
        };
        assert!(rule.matches(&third_party, &folded));
    }

    #[test]
    fn domain_option_scopes_to_document() {
        let rule = url_rule("/promo/$domain=example.com");
        let url = "http://cdn.test/promo/x.js";
        let folded = url.to_ascii_lowercase();

        let on_example = RequestContext {
            url,
            host: "cdn.test",
            referer_host: Some("www.example.com"),
            resource_type: ResourceType::Script,
        };
        assert!(rule.matches(&on_example, &folded));

        let elsewhere = RequestContext {
            url,
            host: "cdn.test",
            referer_host: Some("other.test"),
            resource_type: ResourceType::Script,
        };
        assert!(!rule.matches(&elsewhere, &folded));
    }

    #[test]
    fn host_in_domain_requires_label_boundary() {
        assert!(host_in_domain("example.com", "example.com"));
        assert!(host_in_domain("a.example.com", "example.com"));
        assert!(!host_in_domain("notexample.com", "example.com"));
    }
}
