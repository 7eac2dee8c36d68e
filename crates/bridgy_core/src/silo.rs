/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! The capability set the poller uses to reach one silo. Adapters are
//! injected through [`SiloRegistry`]; the engine never talks to silo APIs
//! directly.

use crate::as1;
use crate::models::Source;
use crate::urls;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Cap on stored block list ids, to keep source rows small.
pub const BLOCKLIST_MAX_IDS: usize = 20_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Silo {
    Blogger,
    Bluesky,
    Flickr,
    GitHub,
    Instagram,
    Mastodon,
    Medium,
    Reddit,
    Tumblr,
    Twitter,
    WordPress,
}

impl Silo {
    pub const ALL: [Silo; 11] = [
        Silo::Blogger,
        Silo::Bluesky,
        Silo::Flickr,
        Silo::GitHub,
        Silo::Instagram,
        Silo::Mastodon,
        Silo::Medium,
        Silo::Reddit,
        Silo::Tumblr,
        Silo::Twitter,
        Silo::WordPress,
    ];

    pub fn short_name(self) -> &'static str {
        match self {
            Silo::Blogger => "blogger",
            Silo::Bluesky => "bluesky",
            Silo::Flickr => "flickr",
            Silo::GitHub => "github",
            Silo::Instagram => "instagram",
            Silo::Mastodon => "mastodon",
            Silo::Medium => "medium",
            Silo::Reddit => "reddit",
            Silo::Tumblr => "tumblr",
            Silo::Twitter => "twitter",
            Silo::WordPress => "wordpress",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Silo::Blogger => "Blogger",
            Silo::Bluesky => "Bluesky",
            Silo::Flickr => "Flickr",
            Silo::GitHub => "GitHub",
            Silo::Instagram => "Instagram",
            Silo::Mastodon => "Mastodon",
            Silo::Medium => "Medium",
            Silo::Reddit => "Reddit",
            Silo::Tumblr => "Tumblr",
            Silo::Twitter => "Twitter",
            Silo::WordPress => "WordPress",
        }
    }

    pub fn from_short_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|s| s.short_name() == name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SiloError {
    #[error("silo returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    /// The user revoked our access, or the account is gone.
    #[error("source disabled: {0}")]
    Disable(String),
    #[error("connection failed: {0}")]
    Connection(String),
    /// Rate limited partway through; carries whatever was fetched so far.
    #[error("rate limited after {} ids", .partial.len())]
    RateLimited { partial: Vec<String> },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<reqwest::Error> for SiloError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return SiloError::Http {
                status: status.as_u16(),
                body: e.to_string(),
            };
        }
        if e.is_connect() || e.is_timeout() || e.is_request() {
            return SiloError::Connection(e.to_string());
        }
        SiloError::Other(e.into())
    }
}

/// How a failed silo call is handled by the poller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollFailure {
    AuthRevoked,
    RateLimited,
    Transient,
    Fatal,
}

pub fn classify(adapter: &dyn SiloAdapter, err: &SiloError) -> PollFailure {
    match err {
        SiloError::Disable(_) => PollFailure::AuthRevoked,
        SiloError::RateLimited { .. } => PollFailure::RateLimited,
        SiloError::Connection(_) => PollFailure::Transient,
        SiloError::Http { status, .. } => {
            if adapter.disable_http_codes().contains(status) {
                PollFailure::AuthRevoked
            } else if adapter.rate_limit_http_codes().contains(status) {
                PollFailure::RateLimited
            } else if *status >= 500 || adapter.transient_error_http_codes().contains(status) {
                PollFailure::Transient
            } else {
                PollFailure::Fatal
            }
        }
        SiloError::Other(_) => PollFailure::Fatal,
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActivitiesRequest {
    /// Fetch just this post instead of the user's timeline.
    pub activity_id: Option<String>,
    pub fetch_replies: bool,
    pub fetch_likes: bool,
    pub fetch_shares: bool,
    pub fetch_mentions: bool,
    pub count: usize,
    pub etag: Option<String>,
    pub min_id: Option<String>,
    pub search_query: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct ActivitiesResponse {
    pub items: Vec<Value>,
    pub etag: Option<String>,
}

#[async_trait]
pub trait SiloAdapter: Send + Sync {
    fn silo(&self) -> Silo;

    /// Web domain of the silo, e.g. `twitter.com`.
    fn domain(&self) -> &str;

    fn name(&self) -> &str {
        self.silo().display_name()
    }

    fn rate_limit_http_codes(&self) -> &[u16] {
        &[429]
    }

    fn disable_http_codes(&self) -> &[u16] {
        &[401]
    }

    fn transient_error_http_codes(&self) -> &[u16] {
        &[]
    }

    /// Comment counts on activities are exact, so unchanged counts mean no new comments.
    fn optimized_comments(&self) -> bool {
        false
    }

    fn backfeed_requires_syndication_link(&self) -> bool {
        false
    }

    fn has_blocks(&self) -> bool {
        false
    }

    /// Whether URL fragments identify distinct posts (GitHub comments do).
    fn fragment_significant(&self) -> bool {
        false
    }

    /// Path prefixes on the silo domain that never identify a post.
    fn path_blocklist(&self) -> &[&str] {
        &[]
    }

    /// Canonical form of a silo URL, or `None` if it isn't a post on this silo.
    fn canonicalize_url(&self, url: &str) -> Option<String> {
        let canon = urls::canonicalize(url)?;
        let canon = if self.fragment_significant() {
            canon
        } else {
            urls::strip_fragment(&canon)
        };
        let mut parsed = url::Url::parse(&canon).ok()?;
        let host = parsed.host_str()?.to_string();
        if !urls::hosts_match(&host, self.domain()) {
            return None;
        }
        if let Some(bare) = host.strip_prefix("www.") {
            parsed.set_host(Some(bare)).ok()?;
        }
        if self
            .path_blocklist()
            .iter()
            .any(|p| parsed.path().starts_with(p))
        {
            return None;
        }
        Some(parsed.to_string())
    }

    fn tag_uri(&self, id: &str) -> String {
        urls::tag_uri(self.domain(), id)
    }

    fn user_tag_id(&self, source: &Source) -> String {
        self.tag_uri(&source.user_id)
    }

    fn user_url(&self, user_id: &str) -> String {
        format!("https://{}/{user_id}", self.domain())
    }

    fn user_to_actor(&self, user: &Value) -> Value {
        user.clone()
    }

    fn activity_changed(&self, before: &Value, after: &Value) -> bool {
        as1::activity_changed(before, after)
    }

    fn get_rsvps_from_event(&self, event: &Value) -> Vec<Value> {
        as1::rsvps_from_event(event)
    }

    /// The id of the post at `url`, usually its last path segment.
    fn post_id(&self, url: &str) -> Option<String> {
        let parsed = url::Url::parse(url).ok()?;
        parsed
            .path_segments()?
            .filter(|s| !s.is_empty())
            .last()
            .map(str::to_string)
    }

    async fn get_activities_response(
        &self,
        source: &Source,
        req: &ActivitiesRequest,
        cache: &mut BTreeMap<String, Value>,
    ) -> Result<ActivitiesResponse, SiloError>;

    /// Posts by anyone that link to the user's `domains`.
    async fn search_for_links(&self, _source: &Source) -> Result<Vec<Value>, SiloError> {
        Ok(Vec::new())
    }

    async fn get_comment(
        &self,
        _source: &Source,
        _comment_id: &str,
        _activity_id: Option<&str>,
        _activity_author_id: Option<&str>,
        _activity: Option<&Value>,
    ) -> Result<Option<Value>, SiloError> {
        Ok(None)
    }

    async fn get_like(
        &self,
        _source: &Source,
        _activity_user_id: &str,
        _activity_id: &str,
        _like_user_id: &str,
        _activity: Option<&Value>,
    ) -> Result<Option<Value>, SiloError> {
        Ok(None)
    }

    async fn get_share(
        &self,
        _source: &Source,
        _activity_user_id: &str,
        _activity_id: &str,
        _share_id: &str,
        _activity: Option<&Value>,
    ) -> Result<Option<Value>, SiloError> {
        Ok(None)
    }

    async fn get_reaction(
        &self,
        _source: &Source,
        _activity_user_id: &str,
        _activity_id: &str,
        _reaction_user_id: &str,
        _reaction_id: &str,
        _activity: Option<&Value>,
    ) -> Result<Option<Value>, SiloError> {
        Ok(None)
    }

    async fn get_event(&self, _source: &Source, _event_id: &str) -> Result<Option<Value>, SiloError> {
        Ok(None)
    }

    async fn get_rsvp(
        &self,
        _source: &Source,
        _activity_user_id: &str,
        _event_id: &str,
        _user_id: &str,
        _event: Option<&Value>,
    ) -> Result<Option<Value>, SiloError> {
        Ok(None)
    }

    async fn get_blocklist_ids(&self, _source: &Source) -> Result<Vec<String>, SiloError> {
        Ok(Vec::new())
    }

    async fn get_actor(&self, source: &Source, user_id: Option<&str>) -> Result<Value, SiloError> {
        let id = user_id.unwrap_or(&source.user_id);
        Ok(json!({
            "objectType": "person",
            "id": self.tag_uri(id),
            "url": self.user_url(id),
        }))
    }
}

/// Adapters by silo. Sources whose silo has no adapter are skipped.
#[derive(Clone, Default)]
pub struct SiloRegistry {
    adapters: HashMap<Silo, Arc<dyn SiloAdapter>>,
}

impl SiloRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn SiloAdapter>) {
        self.adapters.insert(adapter.silo(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn SiloAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, silo: Silo) -> Option<Arc<dyn SiloAdapter>> {
        self.adapters.get(&silo).cloned()
    }

    /// Web domains of every registered silo, which never receive webmentions.
    pub fn domains(&self) -> Vec<String> {
        self.adapters
            .values()
            .map(|a| a.domain().to_ascii_lowercase())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
