/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Outbound HTTP for site fetches: size-capped GETs, HEAD requests and
//! single-hop redirect resolution, all with the Bridgy user agent.

use crate::endpoint_cache::{RedirectCache, ResolvedUrl};
use crate::http_retry::send_with_retry;
use crate::urls::{self, TargetCheck, TargetFilter};
use anyhow::{bail, Context, Result};
use bytes::{Bytes, BytesMut};
use reqwest::{header, Method, RequestBuilder, Response};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

pub const USER_AGENT: &str = "Bridgy (https://brid.gy/about)";
pub const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_REDIRECTS: usize = 5;

/// Sent only to sites that would otherwise serve JSON to us.
pub const CONNEG_ACCEPT: &str = "text/html, application/json; q=0.9, */*; q=0.8";

#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    filter: TargetFilter,
    redirects: Arc<RedirectCache>,
    conneg_domains: Vec<String>,
    max_bytes: usize,
}

#[derive(Clone, Debug)]
pub struct FetchedPage {
    /// Final URL after redirects.
    pub url: String,
    pub content_type: Option<String>,
    pub body: String,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, filter: TargetFilter, conneg_domains: Vec<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            filter,
            redirects: RedirectCache::shared(),
            conneg_domains,
            max_bytes: MAX_RESPONSE_BYTES,
        })
    }

    pub fn with_redirect_cache(mut self, redirects: Arc<RedirectCache>) -> Self {
        self.redirects = redirects;
        self
    }

    pub fn redirect_cache(&self) -> &Arc<RedirectCache> {
        &self.redirects
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn filter(&self) -> &TargetFilter {
        &self.filter
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// The content negotiation override for `url`, if its domain needs one.
    pub fn accept_header(&self, url: &str) -> Option<&'static str> {
        let host = Url::parse(url).ok()?.host_str()?.to_string();
        urls::domain_or_parent_in(&host, &self.conneg_domains).then_some(CONNEG_ACCEPT)
    }

    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let req = self.client.request(method, url);
        match self.accept_header(url) {
            Some(accept) => req.header(header::ACCEPT, accept),
            None => req,
        }
    }

    /// Follows at most one redirect from `url` and reports the content type
    /// there. Redirects onto blocked hosts aren't followed. Never fails: on
    /// HEAD errors the URL comes back unchanged with a type guessed from its
    /// extension.
    pub async fn resolve(&self, url: &str) -> ResolvedUrl {
        if let Some(hit) = self.redirects.get(url) {
            return hit;
        }
        let resolved = match send_with_retry(|| self.request(Method::HEAD, url), 2).await {
            Ok(resp) if resp.status().is_redirection() => match redirect_target(url, &resp) {
                Some(next) => self.follow_once(url, &next).await,
                None => ResolvedUrl {
                    url: url.to_string(),
                    content_type: guess_content_type(url),
                },
            },
            Ok(resp) => ResolvedUrl {
                url: url.to_string(),
                content_type: if resp.status().is_success() {
                    content_type(&resp).or_else(|| guess_content_type(url))
                } else {
                    guess_content_type(url)
                },
            },
            Err(e) => {
                debug!("HEAD {url} failed: {e:#}");
                ResolvedUrl {
                    url: url.to_string(),
                    content_type: guess_content_type(url),
                }
            }
        };
        self.redirects.put(url, resolved.clone());
        resolved
    }

    async fn follow_once(&self, from: &str, to: &str) -> ResolvedUrl {
        let Some(canon) = urls::canonicalize(to) else {
            return ResolvedUrl {
                url: from.to_string(),
                content_type: guess_content_type(from),
            };
        };
        if let TargetCheck::Skip(reason) = self.filter.check(&canon) {
            debug!("not following redirect {from} -> {canon}: {reason}");
            return ResolvedUrl {
                url: from.to_string(),
                content_type: guess_content_type(from),
            };
        }
        let content_type = match send_with_retry(|| self.request(Method::HEAD, &canon), 2).await {
            Ok(resp) if resp.status().is_success() => {
                content_type(&resp).or_else(|| guess_content_type(&canon))
            }
            _ => guess_content_type(&canon),
        };
        ResolvedUrl {
            url: canon,
            content_type,
        }
    }

    /// Applies the target filter before and after resolving redirects, and
    /// skips targets that aren't HTML.
    pub async fn webmention_target(&self, url: &str) -> TargetCheck {
        let canon = match self.filter.check(url) {
            TargetCheck::Send(canon) => canon,
            other => return other,
        };
        let resolved = self.resolve(&canon).await;
        if let Some(ct) = resolved.content_type.as_deref() {
            if !is_html(ct) {
                return TargetCheck::Skip("not html");
            }
        }
        self.filter.check(&resolved.url)
    }

    /// GETs an HTML page, following redirects. `Ok(None)` when the page
    /// isn't HTML, is over the size cap, or lives on a blocked host.
    pub async fn fetch_html(&self, url: &str) -> Result<Option<FetchedPage>> {
        let resolved = self.resolve(url).await;
        if let Some(ct) = resolved.content_type.as_deref() {
            if !is_html(ct) {
                debug!("skipping {url}: content type {ct}");
                return Ok(None);
            }
        }

        let mut current = resolved.url;
        for _ in 0..=MAX_REDIRECTS {
            if let TargetCheck::Skip(reason) = self.filter.check(&current) {
                debug!("not fetching {current}: {reason}");
                return Ok(None);
            }
            let resp = send_with_retry(|| self.request(Method::GET, &current), 2)
                .await
                .with_context(|| format!("GET {current}"))?;
            let status = resp.status();
            if status.is_redirection() {
                match redirect_target(&current, &resp) {
                    Some(next) => {
                        current = next;
                        continue;
                    }
                    None => bail!("GET {current}: {status} without Location"),
                }
            }
            if !status.is_success() {
                bail!("GET {current}: {status}");
            }
            let ct = content_type(&resp);
            if let Some(ct) = ct.as_deref() {
                if !is_html(ct) {
                    debug!("dropping {current}: content type {ct}");
                    return Ok(None);
                }
            }
            let Some(body) = read_capped(resp, self.max_bytes).await? else {
                debug!("dropping {current}: over {} bytes", self.max_bytes);
                return Ok(None);
            };
            return Ok(Some(FetchedPage {
                url: current,
                content_type: ct,
                body: String::from_utf8_lossy(&body).into_owned(),
            }));
        }
        bail!("GET {url}: too many redirects")
    }
}

/// Reads a response body, giving up with `None` past `max_bytes`.
pub async fn read_capped(mut resp: Response, max_bytes: usize) -> Result<Option<Bytes>> {
    if resp.content_length().is_some_and(|len| len as usize > max_bytes) {
        return Ok(None);
    }
    let mut buf = BytesMut::new();
    while let Some(chunk) = resp.chunk().await? {
        if buf.len() + chunk.len() > max_bytes {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Some(buf.freeze()))
}

pub fn content_type(resp: &Response) -> Option<String> {
    resp.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
}

/// `Location` of a redirect response, resolved against `base`.
pub fn redirect_target(base: &str, resp: &Response) -> Option<String> {
    let location = resp.headers().get(header::LOCATION)?.to_str().ok()?;
    Url::parse(base).ok()?.join(location.trim()).ok().map(String::from)
}

pub fn is_html(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    matches!(
        essence.as_str(),
        "text/html" | "text/mf2+html" | "application/mf2+html" | "application/xhtml+xml"
    )
}

/// Content type implied by the URL's file extension. `None` when the path
/// has no extension, which callers treat as probably HTML.
pub fn guess_content_type(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last = parsed.path_segments()?.last()?;
    if !last.contains('.') {
        return None;
    }
    mime_guess::from_path(last)
        .first()
        .map(|m| m.essence_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint_cache::{REDIRECT_CACHE_CAPACITY, REDIRECT_CACHE_TTL};
    use crate::testutil;
    use crate::urls::DomainBlocklist;
    use axum::{
        http::{header as h, StatusCode},
        response::{Html, IntoResponse},
        routing::get,
        Router,
    };

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(
            Duration::from_secs(5),
            TargetFilter::new(DomainBlocklist::default(), false),
            vec!["rhiaro.co.uk".to_string()],
        )
        .unwrap()
        .with_redirect_cache(Arc::new(RedirectCache::new(
            REDIRECT_CACHE_CAPACITY,
            REDIRECT_CACHE_TTL,
        )))
    }

    fn site() -> Router {
        Router::new()
            .route(
                "/redir/0",
                get(|| async {
                    (StatusCode::MOVED_PERMANENTLY, [(h::LOCATION, "/final?utm_medium=x")])
                }),
            )
            .route("/final", get(|| async { Html("<html>final</html>") }))
            .route(
                "/image.png",
                get(|| async { ([(h::CONTENT_TYPE, "image/png")], vec![0u8; 4]).into_response() }),
            )
            .route("/big", get(|| async { Html("x".repeat(4096)) }))
    }

    #[tokio::test]
    async fn resolve_follows_one_redirect_and_strips_utm() {
        let base = testutil::serve(site()).await;
        let f = fetcher();
        let target = format!("{base}/redir/0?utm_source=y");
        match f.webmention_target(&target).await {
            TargetCheck::Send(url) => assert_eq!(url, format!("{base}/final")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_html_targets_are_skipped() {
        let base = testutil::serve(site()).await;
        let f = fetcher();
        assert_eq!(
            f.webmention_target(&format!("{base}/image.png")).await,
            TargetCheck::Skip("not html")
        );
        assert!(f.fetch_html(&format!("{base}/image.png")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fetch_html_caps_size() {
        let base = testutil::serve(site()).await;
        let f = fetcher().with_max_bytes(1024);
        assert!(f.fetch_html(&format!("{base}/big")).await.unwrap().is_none());
        let page = f.fetch_html(&format!("{base}/final")).await.unwrap().unwrap();
        assert!(page.body.contains("final"));
        assert!(f.fetch_html(&format!("{base}/missing")).await.is_err());
    }

    #[test]
    fn content_types() {
        assert!(is_html("text/html; charset=utf-8"));
        assert!(is_html("text/mf2+html"));
        assert!(!is_html("application/json"));
        assert_eq!(guess_content_type("http://a/x.jpg").as_deref(), Some("image/jpeg"));
        assert_eq!(guess_content_type("http://a/post"), None);
    }

    #[test]
    fn conneg_only_for_listed_domains() {
        let f = fetcher();
        assert_eq!(f.accept_header("https://rhiaro.co.uk/2015/post"), Some(CONNEG_ACCEPT));
        assert_eq!(f.accept_header("https://example.com/post"), None);
    }
}
