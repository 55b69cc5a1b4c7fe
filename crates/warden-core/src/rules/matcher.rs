//! URL pattern matching.
//!
//! Filter bodies compile into a tagged representation instead of one type per
//! rule kind: a wildcard pattern (literal pieces separated by `*`, with `^`
//! separator placeholders and optional `|` / `||` anchors) or a compiled
//! regex. Wildcard pieces also yield a fingerprint token used to bucket rules
//! for fast candidate selection.

use std::collections::HashMap;

use regex::Regex;

use super::parser::UrlRule;
use super::RequestContext;

/// Left-edge anchoring of a wildcard pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    /// Pattern may match anywhere in the URL.
    None,
    /// `|` — pattern must match at the start of the URL.
    Start,
    /// `||` — pattern must match at a domain label boundary of the host.
    Domain,
}

/// A compiled wildcard filter body.
#[derive(Debug, Clone)]
pub struct WildcardPattern {
    anchor: Anchor,
    anchor_end: bool,
    /// Literal pieces between `*` wildcards. `^` bytes inside a piece match a
    /// single separator character or the end of the URL.
    pieces: Vec<String>,
}

/// Returns true for characters the `^` placeholder matches: anything that is
/// not a letter, digit, or one of `_ - . %`.
fn is_separator(b: u8) -> bool {
    !(b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'%'))
}

/// Matches `piece` at exactly `start`, returning the end offset on success.
/// A trailing run of `^` may match the end of the URL without consuming input.
fn piece_match_at(url: &[u8], start: usize, piece: &[u8]) -> Option<usize> {
    let mut i = start;
    for &c in piece {
        if c == b'^' {
            if i == url.len() {
                // `^` matches end-of-address; consume nothing.
                continue;
            }
            if !is_separator(url[i]) {
                return None;
            }
            i += 1;
        } else {
            if i >= url.len() || url[i] != c {
                return None;
            }
            i += 1;
        }
    }
    Some(i)
}

/// Finds the leftmost match of `piece` at or after `from`.
fn find_piece(url: &[u8], from: usize, piece: &[u8]) -> Option<(usize, usize)> {
    for s in from..=url.len() {
        if let Some(e) = piece_match_at(url, s, piece) {
            return Some((s, e));
        }
    }
    None
}

/// Candidate start offsets for a `||` anchored pattern: the beginning of the
/// host and the position after each `.` inside it.
fn domain_anchor_positions(url: &[u8]) -> Vec<usize> {
    let host_start = url
        .windows(3)
        .position(|w| w == b"://")
        .map(|i| i + 3)
        .unwrap_or(0);
    let host_end = url[host_start..]
        .iter()
        .position(|&b| matches!(b, b'/' | b'?' | b'#'))
        .map(|i| host_start + i)
        .unwrap_or(url.len());

    let mut positions = vec![host_start];
    for i in host_start..host_end {
        if url[i] == b'.' {
            positions.push(i + 1);
        }
    }
    positions
}

impl WildcardPattern {
    /// Compiles a filter body (anchors included, options already stripped).
    /// Case folding happens here when the rule is case-insensitive.
    pub fn compile(body: &str, match_case: bool) -> Self {
        let mut anchor = Anchor::None;
        let mut rest = body;
        if let Some(stripped) = rest.strip_prefix("||") {
            anchor = Anchor::Domain;
            rest = stripped;
        } else if let Some(stripped) = rest.strip_prefix('|') {
            anchor = Anchor::Start;
            rest = stripped;
        }

        let mut anchor_end = false;
        if let Some(stripped) = rest.strip_suffix('|') {
            anchor_end = true;
            rest = stripped;
        }

        let folded;
        let rest = if match_case {
            rest
        } else {
            folded = rest.to_ascii_lowercase();
            &folded
        };

        // A wildcard at either edge makes the adjacent anchor meaningless.
        if rest.starts_with('*') {
            anchor = Anchor::None;
        }
        if rest.ends_with('*') {
            anchor_end = false;
        }

        let pieces: Vec<String> = rest
            .split('*')
            .filter(|p| !p.is_empty())
            .map(str::to_owned)
            .collect();

        Self {
            anchor,
            anchor_end,
            pieces,
        }
    }

    /// Returns true when the pattern carries no literal content (`*`).
    pub fn is_universal(&self) -> bool {
        self.pieces.is_empty()
    }

    fn match_tail(&self, url: &[u8], mut pos: usize, from_piece: usize) -> bool {
        if from_piece == self.pieces.len() {
            return !self.anchor_end || pos == url.len();
        }
        for (idx, piece) in self.pieces.iter().enumerate().skip(from_piece) {
            let last = idx == self.pieces.len() - 1;
            if last && self.anchor_end {
                // The final piece must end flush with the URL.
                let mut scan = pos;
                loop {
                    match find_piece(url, scan, piece.as_bytes()) {
                        Some((_, e)) if e == url.len() => return true,
                        Some((s, _)) => scan = s + 1,
                        None => return false,
                    }
                }
            }
            match find_piece(url, pos, piece.as_bytes()) {
                Some((_, e)) => pos = e,
                None => return false,
            }
        }
        true
    }

    /// Tests the pattern against a URL already folded to the pattern's case.
    pub fn matches(&self, url: &str) -> bool {
        let u = url.as_bytes();
        if self.pieces.is_empty() {
            return true;
        }

        match self.anchor {
            Anchor::Start => match piece_match_at(u, 0, self.pieces[0].as_bytes()) {
                Some(end) => self.match_tail(u, end, 1),
                None => false,
            },
            Anchor::Domain => domain_anchor_positions(u).into_iter().any(|start| {
                piece_match_at(u, start, self.pieces[0].as_bytes())
                    .map(|end| self.match_tail(u, end, 1))
                    .unwrap_or(false)
            }),
            Anchor::None => {
                let first = self.pieces[0].as_bytes();
                let mut scan = 0;
                while let Some((s, e)) = find_piece(u, scan, first) {
                    if self.match_tail(u, e, 1) {
                        return true;
                    }
                    scan = s + 1;
                }
                false
            }
        }
    }

    /// Longest literal alphanumeric run usable as an index token.
    ///
    /// A run only qualifies when the URL tokenizer is guaranteed to emit it
    /// whole for every matching URL: it must be delimited by literal
    /// non-alphanumeric bytes in the pattern itself, or sit against an
    /// anchored pattern edge. An unbounded run (like the bare pattern
    /// `banner`) can match mid-token in a URL, so it cannot key a bucket.
    pub(crate) fn fingerprint_token(&self) -> Option<String> {
        let mut best: Option<&str> = None;
        let piece_count = self.pieces.len();
        for (piece_idx, piece) in self.pieces.iter().enumerate() {
            let bytes = piece.as_bytes();
            let mut start = 0;
            while start < bytes.len() {
                if !bytes[start].is_ascii_alphanumeric() {
                    start += 1;
                    continue;
                }
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_alphanumeric() {
                    end += 1;
                }
                let bounded_left =
                    start > 0 || (piece_idx == 0 && self.anchor != Anchor::None);
                let bounded_right = end < bytes.len()
                    || (piece_idx == piece_count - 1 && self.anchor_end);
                if bounded_left
                    && bounded_right
                    && end - start >= MIN_TOKEN_LEN
                    && best.map(|b| b.len() < end - start).unwrap_or(true)
                {
                    best = Some(&piece[start..end]);
                }
                start = end;
            }
        }
        best.map(|b| b.to_ascii_lowercase())
    }
}

/// A compiled URL pattern: wildcard or regex.
#[derive(Debug, Clone)]
pub enum UrlPattern {
    Wildcard(WildcardPattern),
    Regex(Box<Regex>),
}

impl UrlPattern {
    /// Tests the pattern. `url` is the raw URL, `url_folded` the same URL
    /// folded to ASCII lowercase.
    pub fn matches(&self, url: &str, url_folded: &str, match_case: bool) -> bool {
        match self {
            UrlPattern::Wildcard(p) => p.matches(if match_case { url } else { url_folded }),
            UrlPattern::Regex(re) => re.is_match(url),
        }
    }

    fn fingerprint_token(&self) -> Option<String> {
        match self {
            UrlPattern::Wildcard(p) => p.fingerprint_token(),
            UrlPattern::Regex(_) => None,
        }
    }
}

const MIN_TOKEN_LEN: usize = 3;

fn alnum_runs(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|run| !run.is_empty())
}

/// Alphanumeric runs of a folded URL, for index lookups.
fn url_tokens(url_folded: &str) -> impl Iterator<Item = &str> {
    alnum_runs(url_folded).filter(|run| run.len() >= MIN_TOKEN_LEN)
}

/// Rules bucketed by fingerprint token, with a spill bucket for rules that
/// have no usable token (regex rules, very short patterns).
#[derive(Debug, Default)]
pub(crate) struct TokenIndex {
    by_token: HashMap<String, Vec<UrlRule>>,
    rest: Vec<UrlRule>,
    len: usize,
}

impl TokenIndex {
    pub fn insert(&mut self, rule: UrlRule) {
        self.len += 1;
        match rule.pattern.fingerprint_token() {
            Some(token) => self.by_token.entry(token).or_default().push(rule),
            None => self.rest.push(rule),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// First rule matching the request, consulting only buckets whose token
    /// appears in the URL.
    pub fn query(
        &self,
        ctx: &RequestContext<'_>,
        url_folded: &str,
    ) -> Option<&UrlRule> {
        for token in url_tokens(url_folded) {
            if let Some(bucket) = self.by_token.get(token) {
                if let Some(rule) = bucket.iter().find(|r| r.matches(ctx, url_folded)) {
                    return Some(rule);
                }
            }
        }
        self.rest.iter().find(|r| r.matches(ctx, url_folded))
    }
}
