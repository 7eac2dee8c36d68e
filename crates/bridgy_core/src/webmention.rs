/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Webmention endpoint discovery and sending.

use crate::endpoint_cache::{Endpoint, EndpointCache};
use crate::http_fetch::{self, HttpFetcher, MAX_REDIRECTS, USER_AGENT};
use anyhow::{Context, Result};
use regex::Regex;
use reqwest::{header, Method, Response, StatusCode};
use scraper::{Html, Selector};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

pub const WEBMENTION_TIMEOUT: Duration = Duration::from_secs(999);

static LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<([^>]*)>((?:\s*;\s*[A-Za-z*]+\s*=\s*(?:"[^"]*"|[^\s;,"]+))*)"#)
        .expect("valid link header regex")
});
static REL_PARAM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i);\s*rel\s*=\s*(?:"([^"]*)"|([^\s;,"]+))"#).expect("valid rel param regex")
});
static WEBMENTION_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("link[rel][href], a[rel][href]").expect("valid webmention selector")
});

/// Where one target ended up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { endpoint: String },
    /// No endpoint, 204 from the target, or an unusable URL. Not retried.
    Skipped(String),
    /// 4xx from the target or endpoint, or DNS failure. Not retried.
    Failed(String),
    /// 5xx, timeouts and connection failures. Retried with the response.
    Error(String),
}

impl SendOutcome {
    fn from_status(status: StatusCode, what: &str) -> Self {
        let msg = format!("{what} returned {status}");
        if status == StatusCode::NO_CONTENT {
            SendOutcome::Skipped(msg)
        } else if status.is_client_error() {
            SendOutcome::Failed(msg)
        } else {
            SendOutcome::Error(msg)
        }
    }

    fn from_transport(e: &reqwest::Error, what: &str) -> Self {
        let msg = format!("{what}: {e:#}");
        if is_dns_error(e) {
            SendOutcome::Failed(msg)
        } else {
            SendOutcome::Error(msg)
        }
    }
}

#[derive(Clone)]
pub struct WebmentionClient {
    fetcher: HttpFetcher,
    post_client: reqwest::Client,
}

impl WebmentionClient {
    pub fn new(fetcher: HttpFetcher) -> Result<Self> {
        let post_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(WEBMENTION_TIMEOUT)
            .build()
            .context("build webmention client")?;
        Ok(Self {
            fetcher,
            post_client,
        })
    }

    pub fn fetcher(&self) -> &HttpFetcher {
        &self.fetcher
    }

    /// Finds the target's endpoint from its `Link` headers or HTML. `Err`
    /// carries the outcome to record when the target itself is unusable.
    pub async fn discover(&self, target: &str) -> Result<Endpoint, SendOutcome> {
        let head = self.follow(Method::HEAD, target).await;
        if let Ok((page_url, resp)) = &head {
            if resp.status().is_success() {
                if let Some(endpoint) = endpoint_from_headers(page_url, resp) {
                    return Ok(Endpoint::Url(endpoint));
                }
                let non_html = http_fetch::content_type(resp).is_some_and(|ct| !http_fetch::is_html(&ct));
                if non_html {
                    return Ok(Endpoint::NoEndpoint);
                }
            }
        }

        let (page_url, resp) = self
            .follow(Method::GET, target)
            .await
            .map_err(|e| SendOutcome::from_transport(&e, "discovery"))?;
        let status = resp.status();
        if status == StatusCode::NO_CONTENT || !status.is_success() {
            return Err(SendOutcome::from_status(status, "target"));
        }
        if let Some(endpoint) = endpoint_from_headers(&page_url, &resp) {
            return Ok(Endpoint::Url(endpoint));
        }
        if http_fetch::content_type(&resp).is_some_and(|ct| !http_fetch::is_html(&ct)) {
            return Ok(Endpoint::NoEndpoint);
        }
        let body = match http_fetch::read_capped(resp, self.fetcher.max_bytes()).await {
            Ok(Some(body)) => body,
            Ok(None) => return Ok(Endpoint::NoEndpoint),
            Err(e) => return Err(SendOutcome::Error(format!("reading {page_url}: {e:#}"))),
        };
        Ok(endpoint_from_html(&page_url, &String::from_utf8_lossy(&body))
            .map(Endpoint::Url)
            .unwrap_or(Endpoint::NoEndpoint))
    }

    /// Follows redirects by hand so each hop is logged and capped.
    async fn follow(&self, method: Method, url: &str) -> Result<(String, Response), reqwest::Error> {
        let mut current = url.to_string();
        let mut hops = 0;
        loop {
            let resp = self.fetcher.request(method.clone(), &current).send().await?;
            if resp.status().is_redirection() && hops < MAX_REDIRECTS {
                if let Some(next) = http_fetch::redirect_target(&current, &resp) {
                    debug!("{method} {current} redirected to {next}");
                    current = next;
                    hops += 1;
                    continue;
                }
            }
            return Ok((current, resp));
        }
    }

    /// POSTs `source` and `target` to `endpoint`. Redirects aren't followed.
    pub async fn send(&self, endpoint: &str, source: &str, target: &str) -> SendOutcome {
        let req = self
            .post_client
            .post(endpoint)
            .form(&[("source", source), ("target", target)]);
        match req.send().await {
            Ok(resp) if resp.status().is_success() => {
                info!("webmention to {target} via {endpoint}: {}", resp.status());
                SendOutcome::Sent {
                    endpoint: endpoint.to_string(),
                }
            }
            Ok(resp) if resp.status().is_redirection() => {
                SendOutcome::Failed(format!("endpoint {endpoint} redirected: {}", resp.status()))
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                let mut outcome = SendOutcome::from_status(status, &format!("endpoint {endpoint}"));
                if let SendOutcome::Failed(msg) | SendOutcome::Error(msg) = &mut outcome {
                    let snippet: String = body.chars().take(200).collect();
                    if !snippet.trim().is_empty() {
                        msg.push_str(": ");
                        msg.push_str(snippet.trim());
                    }
                }
                outcome
            }
            Err(e) => SendOutcome::from_transport(&e, &format!("endpoint {endpoint}")),
        }
    }

    /// Discovers (or reuses a cached) endpoint for `target` and sends.
    pub async fn send_cached(&self, cache: &EndpointCache, source: &str, target: &str) -> SendOutcome {
        let endpoint = match cache.get(target) {
            Some(hit) => {
                debug!("using cached webmention endpoint for {target}: {hit:?}");
                hit
            }
            None => match self.discover(target).await {
                Ok(found) => {
                    cache.put(target, found.clone());
                    found
                }
                Err(outcome) => return outcome,
            },
        };
        match endpoint {
            Endpoint::NoEndpoint => SendOutcome::Skipped(format!("no webmention endpoint at {target}")),
            Endpoint::Url(endpoint) => self.send(&endpoint, source, target).await,
        }
    }
}

/// The first `rel=webmention` link in `Link` headers, resolved against `base`.
pub fn endpoint_from_headers(base: &str, resp: &Response) -> Option<String> {
    resp.headers()
        .get_all(header::LINK)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|v| endpoint_from_link_header(base, v))
}

pub fn endpoint_from_link_header(base: &str, value: &str) -> Option<String> {
    for caps in LINK_RE.captures_iter(value) {
        let params = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        let is_webmention = REL_PARAM_RE.captures_iter(params).any(|rel| {
            rel.get(1)
                .or_else(|| rel.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default()
                .split_ascii_whitespace()
                .any(|r| r.eq_ignore_ascii_case("webmention"))
        });
        if is_webmention {
            return resolve(base, &caps[1]);
        }
    }
    None
}

/// The first `<link>` or `<a>` with `rel=webmention`, in document order.
pub fn endpoint_from_html(base: &str, html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    doc.select(&WEBMENTION_SEL)
        .find(|el| {
            el.value()
                .attr("rel")
                .unwrap_or_default()
                .split_ascii_whitespace()
                .any(|r| r.eq_ignore_ascii_case("webmention"))
        })
        .and_then(|el| el.value().attr("href"))
        .and_then(|href| resolve(base, href))
}

fn resolve(base: &str, href: &str) -> Option<String> {
    Url::parse(base).ok()?.join(href.trim()).ok().map(String::from)
}

fn is_dns_error(e: &reqwest::Error) -> bool {
    let mut source: Option<&dyn std::error::Error> = Some(e);
    while let Some(err) = source {
        let text = err.to_string().to_ascii_lowercase();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return true;
        }
        source = err.source();
    }
    false
}
