/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::LazyLock;
use url::Url;

/// Longest target URL we store or send to.
pub const MAX_URL_LENGTH: usize = 1500;

pub const DEFAULT_DOMAIN_BLOCKLIST: &str = include_str!("../domain_blocklist.txt");
pub const DEFAULT_BETA_USERS: &str = include_str!("../beta_users.txt");

/// Individual URLs we never fetch or send to.
pub const URL_BLOCKLIST: &[&str] = &["http://www.evdemon.org/2015/learning-more-about-quill"];

pub const LOCAL_HOSTS: &[&str] = &["localhost", "127.0.0.1"];

/// Never webmention targets, in any environment.
const RESERVED_SUFFIXES: &[&str] = &[".onion", ".test", ".local", ".invalid"];

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s<>"'\[\]\{\}|\\^`\x00-\x1f\x7f]+"#).expect("valid url regex")
});

static TAG_URI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^tag:([^,]+),\d{4}(?:-\d{2}){0,2}:(.+)$").expect("valid tag regex"));

/// Lowercases scheme and host, drops default ports, `utm_*` query params and
/// tracking fragments. Only http(s) URLs have a canonical form.
pub fn canonicalize(input: &str) -> Option<String> {
    let mut url = Url::parse(input.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }

    if let Some(query) = url.query() {
        let kept: Vec<&str> = query
            .split('&')
            .filter(|part| !part.is_empty())
            .filter(|part| {
                let name = part.split('=').next().unwrap_or_default();
                !name.to_ascii_lowercase().starts_with("utm_")
            })
            .collect();
        let kept = kept.join("&");
        url.set_query(if kept.is_empty() { None } else { Some(&kept) });
    }

    if let Some(fragment) = url.fragment() {
        if fragment.is_empty() || fragment.starts_with("utm_") || fragment.starts_with(":~:") {
            url.set_fragment(None);
        }
    }

    Some(url.to_string())
}

pub fn strip_fragment(input: &str) -> String {
    match Url::parse(input) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => input.split('#').next().unwrap_or(input).to_string(),
    }
}

fn bare_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    match host.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => host,
    }
}

/// Host equality that ignores case and a leading `www.`.
pub fn hosts_match(a: &str, b: &str) -> bool {
    bare_host(a) == bare_host(b)
}

/// Lowercased host of `url` without a leading `www.`.
pub fn domain_from_link(url: &str) -> Option<String> {
    let parsed = Url::parse(url.trim()).ok()?;
    parsed.host_str().map(bare_host).filter(|h| !h.is_empty())
}

/// Whether `host` equals `domain` or is one of its subdomains.
pub fn domain_or_parent_in<'a>(host: &str, domains: impl IntoIterator<Item = &'a String>) -> bool {
    let host = bare_host(host);
    domains.into_iter().any(|d| {
        let d = bare_host(d);
        !d.is_empty() && (host == d || host.ends_with(&format!(".{d}")))
    })
}

/// Absolute http(s) URLs in free text, in order of appearance.
pub fn extract_links(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for m in URL_RE.find_iter(text) {
        let mut link = m.as_str();
        loop {
            let trimmed = link.trim_end_matches(['.', ',', ';', ':', '!', '?']);
            let trimmed = if trimmed.ends_with(')') && !trimmed.contains('(') {
                &trimmed[..trimmed.len() - 1]
            } else {
                trimmed
            };
            if trimmed == link {
                break;
            }
            link = trimmed;
        }
        if Url::parse(link).is_ok() && !out.iter().any(|l| l == link) {
            out.push(link.to_string());
        }
    }
    out
}

pub fn tag_uri(domain: &str, id: &str) -> String {
    format!("tag:{domain},2013:{id}")
}

/// `tag:fa.ke,2013:123` -> `("fa.ke", "123")`.
pub fn parse_tag_uri(uri: &str) -> Option<(String, String)> {
    let caps = TAG_URI_RE.captures(uri.trim())?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

/// Orders activity ids numerically when both parse as integers,
/// lexicographically otherwise.
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u128>(), b.parse::<u128>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

/// Keeps the first `MAX_URL_LENGTH - 1` chars and appends an ellipsis.
pub fn truncate_url(url: &str) -> String {
    let mut out: String = url.chars().take(MAX_URL_LENGTH - 1).collect();
    out.push('…');
    out
}

fn load_lines(text: &str) -> HashSet<String> {
    text.lines()
        .map(|l| l.split('#').next().unwrap_or_default().trim())
        .filter(|l| !l.is_empty())
        .map(|l| l.to_ascii_lowercase())
        .collect()
}

/// Domains that don't accept webmentions, mostly the silos themselves.
/// Subdomains of listed domains are blocked too.
#[derive(Clone, Debug, Default)]
pub struct DomainBlocklist {
    domains: HashSet<String>,
}

impl DomainBlocklist {
    pub fn from_text(text: &str) -> Self {
        Self {
            domains: load_lines(text),
        }
    }

    pub fn builtin() -> Self {
        Self::from_text(DEFAULT_DOMAIN_BLOCKLIST)
    }

    pub fn extend(&mut self, domains: impl IntoIterator<Item = String>) {
        self.domains
            .extend(domains.into_iter().map(|d| bare_host(&d)).filter(|d| !d.is_empty()));
    }

    pub fn merge(&mut self, other: DomainBlocklist) {
        self.domains.extend(other.domains);
    }

    pub fn contains_host(&self, host: &str) -> bool {
        domain_or_parent_in(host, &self.domains)
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

/// `/silo/user-id` paths of users opted into beta features. Advisory only.
#[derive(Clone, Debug, Default)]
pub struct BetaUsers {
    paths: HashSet<String>,
}

impl BetaUsers {
    pub fn from_text(text: &str) -> Self {
        Self {
            paths: load_lines(text),
        }
    }

    pub fn builtin() -> Self {
        Self::from_text(DEFAULT_BETA_USERS)
    }

    pub fn contains(&self, bridgy_path: &str) -> bool {
        self.paths.contains(&bridgy_path.trim().to_ascii_lowercase())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetCheck {
    /// Canonical URL, ok to send to.
    Send(String),
    /// Canonical URL over `MAX_URL_LENGTH`. Goes to `failed`, truncated.
    TooLong(String),
    Skip(&'static str),
}

/// Decides which URLs may receive webmentions, without touching the network.
#[derive(Clone, Debug)]
pub struct TargetFilter {
    blocklist: DomainBlocklist,
    production: bool,
}

impl TargetFilter {
    pub fn new(blocklist: DomainBlocklist, production: bool) -> Self {
        Self {
            blocklist,
            production,
        }
    }

    pub fn production(&self) -> bool {
        self.production
    }

    pub fn is_blocked_host(&self, host: &str) -> bool {
        let host = host.trim().trim_matches(['[', ']']).to_ascii_lowercase();
        if host.is_empty() {
            return true;
        }
        if RESERVED_SUFFIXES.iter().any(|s| host.ends_with(s)) {
            return true;
        }
        if self.blocklist.contains_host(&host) {
            return true;
        }
        if self.production {
            if LOCAL_HOSTS.contains(&host.as_str()) {
                return true;
            }
            if let Ok(ip) = host.parse::<IpAddr>() {
                return is_local_ip(&ip);
            }
        }
        false
    }

    pub fn is_blocked_url(&self, url: &str) -> bool {
        URL_BLOCKLIST.contains(&url.trim())
    }

    pub fn check(&self, url: &str) -> TargetCheck {
        let url = url.trim();
        if self.is_blocked_url(url) {
            return TargetCheck::Skip("url blocklisted");
        }
        let Ok(parsed) = Url::parse(url) else {
            return TargetCheck::Skip("unparseable url");
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            return TargetCheck::Skip("not http(s)");
        }
        let Some(host) = parsed.host_str() else {
            return TargetCheck::Skip("no host");
        };
        if self.is_blocked_host(host) {
            return TargetCheck::Skip("host blocklisted");
        }
        let Some(canon) = canonicalize(url) else {
            return TargetCheck::Skip("unparseable url");
        };
        if canon.len() > MAX_URL_LENGTH {
            return TargetCheck::TooLong(canon);
        }
        TargetCheck::Send(canon)
    }
}

fn is_local_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}
