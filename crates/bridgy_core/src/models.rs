/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::silo::Silo;
use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use time::{macros::format_description, OffsetDateTime, PrimitiveDateTime};

pub const MINUTE_MS: i64 = 60 * 1000;
pub const HOUR_MS: i64 = 60 * MINUTE_MS;
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// Propagate tasks run for at most 10 minutes; the lease adds slack on top.
pub const LEASE_MS: i64 = 12 * MINUTE_MS;

/// `last_hfeed_refetch` value that forces a refetch on the next poll.
pub const REFETCH_HFEED_TRIGGER: i64 = -1;

pub const MAX_OLD_RESPONSE_JSONS: usize = 10;

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Formats a millisecond timestamp the way poll tasks carry `last_polled`.
pub fn format_poll_timestamp(ms: i64) -> String {
    let fmt = format_description!("[year]-[month]-[day]-[hour]-[minute]-[second]");
    OffsetDateTime::from_unix_timestamp(ms.div_euclid(1000))
        .ok()
        .and_then(|t| t.format(&fmt).ok())
        .unwrap_or_else(|| "1970-01-01-00-00-00".to_string())
}

pub fn parse_poll_timestamp(text: &str) -> Option<i64> {
    let fmt = format_description!("[year]-[month]-[day]-[hour]-[minute]-[second]");
    let t = PrimitiveDateTime::parse(text.trim(), &fmt).ok()?;
    Some(t.assume_utc().unix_timestamp() * 1000)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    Listen,
    Publish,
    Webmention,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    #[default]
    Enabled,
    Disabled,
    Error,
}

impl SourceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceStatus::Enabled => "enabled",
            SourceStatus::Disabled => "disabled",
            SourceStatus::Error => "error",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollStatus {
    #[default]
    Ok,
    Polling,
    Error,
}

/// A silo account whose activity gets backfed to the user's web sites.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Source {
    pub silo: Silo,
    pub user_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
    /// Opaque token blob handed to the silo adapter.
    #[serde(default)]
    pub credentials: Option<String>,
    #[serde(default)]
    pub features: Vec<Feature>,
    #[serde(default)]
    pub status: SourceStatus,
    #[serde(default)]
    pub poll_status: PollStatus,
    #[serde(default)]
    pub rate_limited: bool,
    #[serde(default)]
    pub domain_urls: Vec<String>,
    #[serde(default)]
    pub domains: Vec<String>,
    pub created_ms: i64,
    #[serde(default)]
    pub updated_ms: i64,
    #[serde(default)]
    pub last_polled_ms: i64,
    #[serde(default)]
    pub last_poll_attempt_ms: i64,
    #[serde(default)]
    pub last_activity_id: Option<String>,
    #[serde(default)]
    pub last_activities_etag: Option<String>,
    #[serde(default)]
    pub last_activities_cache: BTreeMap<String, Value>,
    #[serde(default)]
    pub last_public_post_ms: Option<i64>,
    #[serde(default)]
    pub recent_private_posts: u32,
    #[serde(default)]
    pub last_syndication_url_ms: Option<i64>,
    #[serde(default)]
    pub last_feed_syndication_url_ms: Option<i64>,
    #[serde(default)]
    pub last_hfeed_refetch_ms: i64,
    #[serde(default)]
    pub last_webmention_sent_ms: Option<i64>,
    #[serde(default)]
    pub webmention_endpoint: Option<String>,
    /// Pruned responses persisted by the previous poll.
    #[serde(default)]
    pub seen_responses_cache: Vec<Value>,
    #[serde(default)]
    pub blocked_ids: Vec<String>,
}

impl Source {
    pub fn new(silo: Silo, user_id: impl Into<String>, now: i64) -> Self {
        Self {
            silo,
            user_id: user_id.into(),
            name: None,
            url: None,
            picture: None,
            credentials: None,
            features: vec![Feature::Listen],
            status: SourceStatus::Enabled,
            poll_status: PollStatus::Ok,
            rate_limited: false,
            domain_urls: Vec::new(),
            domains: Vec::new(),
            created_ms: now,
            updated_ms: now,
            last_polled_ms: 0,
            last_poll_attempt_ms: 0,
            last_activity_id: None,
            last_activities_etag: None,
            last_activities_cache: BTreeMap::new(),
            last_public_post_ms: None,
            recent_private_posts: 0,
            last_syndication_url_ms: None,
            last_feed_syndication_url_ms: None,
            last_hfeed_refetch_ms: 0,
            last_webmention_sent_ms: None,
            webmention_endpoint: None,
            seen_responses_cache: Vec::new(),
            blocked_ids: Vec::new(),
        }
    }

    pub fn key(&self) -> String {
        source_key(self.silo, &self.user_id)
    }

    pub fn is_enabled(&self) -> bool {
        self.status != SourceStatus::Disabled
    }

    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    /// e.g. `/mastodon/alice`; also the line format of `beta_users.txt`.
    pub fn bridgy_path(&self) -> String {
        format!("/{}/{}", self.silo.short_name(), self.user_id)
    }

    pub fn label(&self) -> String {
        let name = self
            .name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.user_id);
        format!("{name} ({})", self.silo.display_name())
    }

    /// URLs of the user's own sites, checked for h-feeds.
    pub fn author_urls(&self) -> &[String] {
        &self.domain_urls
    }
}

pub fn source_key(silo: Silo, user_id: &str) -> String {
    format!("{}:{}", silo.short_name(), user_id)
}

pub fn parse_source_key(key: &str) -> Option<(Silo, &str)> {
    let (silo, user) = key.split_once(':')?;
    let user = user.trim();
    if user.is_empty() {
        return None;
    }
    Some((Silo::from_short_name(silo)?, user))
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    #[default]
    Comment,
    Like,
    Repost,
    React,
    Rsvp,
    Post,
}

impl ResponseType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseType::Comment => "comment",
            ResponseType::Like => "like",
            ResponseType::Repost => "repost",
            ResponseType::React => "react",
            ResponseType::Rsvp => "rsvp",
            ResponseType::Post => "post",
        }
    }

    pub fn from_verb(verb: &str) -> Option<Self> {
        Some(match verb {
            "comment" => ResponseType::Comment,
            "like" => ResponseType::Like,
            "repost" => ResponseType::Repost,
            "react" => ResponseType::React,
            "rsvp" => ResponseType::Rsvp,
            "post" => ResponseType::Post,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebmentionStatus {
    #[default]
    New,
    Processing,
    Complete,
    Error,
}

impl WebmentionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WebmentionStatus::New => "new",
            WebmentionStatus::Processing => "processing",
            WebmentionStatus::Complete => "complete",
            WebmentionStatus::Error => "error",
        }
    }
}

/// Target URLs bucketed by delivery outcome. Pairwise disjoint at rest.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Targets {
    #[serde(default)]
    pub unsent: Vec<String>,
    #[serde(default)]
    pub sent: Vec<String>,
    #[serde(default)]
    pub error: Vec<String>,
    #[serde(default)]
    pub failed: Vec<String>,
    #[serde(default)]
    pub skipped: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bucket {
    Unsent,
    Sent,
    Error,
    Failed,
    Skipped,
}

impl Bucket {
    pub const ALL: [Bucket; 5] = [
        Bucket::Sent,
        Bucket::Unsent,
        Bucket::Error,
        Bucket::Failed,
        Bucket::Skipped,
    ];
}

impl Targets {
    pub fn bucket(&self, bucket: Bucket) -> &Vec<String> {
        match bucket {
            Bucket::Unsent => &self.unsent,
            Bucket::Sent => &self.sent,
            Bucket::Error => &self.error,
            Bucket::Failed => &self.failed,
            Bucket::Skipped => &self.skipped,
        }
    }

    pub fn bucket_mut(&mut self, bucket: Bucket) -> &mut Vec<String> {
        match bucket {
            Bucket::Unsent => &mut self.unsent,
            Bucket::Sent => &mut self.sent,
            Bucket::Error => &mut self.error,
            Bucket::Failed => &mut self.failed,
            Bucket::Skipped => &mut self.skipped,
        }
    }

    pub fn all(&self) -> impl Iterator<Item = &String> {
        self.sent
            .iter()
            .chain(&self.unsent)
            .chain(&self.error)
            .chain(&self.failed)
            .chain(&self.skipped)
    }

    pub fn contains(&self, url: &str) -> bool {
        self.all().any(|u| u == url)
    }

    /// Adds `url` to `bucket` unless some bucket already holds it.
    pub fn push(&mut self, bucket: Bucket, url: String) -> bool {
        if self.contains(&url) {
            return false;
        }
        self.bucket_mut(bucket).push(url);
        true
    }

    /// Moves every URL back into `unsent`, deduped, keeping first-seen order.
    pub fn reset_all_to_unsent(&mut self) {
        let all = dedupe(
            self.unsent
                .iter()
                .chain(&self.sent)
                .chain(&self.error)
                .chain(&self.failed)
                .chain(&self.skipped)
                .cloned(),
        );
        *self = Targets {
            unsent: all,
            ..Targets::default()
        };
    }
}

pub fn dedupe(urls: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.into_iter().filter(|u| seen.insert(u.clone())).collect()
}

/// Entities whose targets are drained by the webmention sender under a lease.
pub trait Webmentions: Clone + Serialize + DeserializeOwned + Send + 'static {
    const TABLE: &'static str;

    fn key(&self) -> &str;
    fn source_key(&self) -> &str;
    fn status(&self) -> WebmentionStatus;
    fn set_status(&mut self, status: WebmentionStatus);
    fn leased_until_ms(&self) -> Option<i64>;
    fn set_leased_until_ms(&mut self, until: Option<i64>);
    fn targets(&self) -> &Targets;
    fn targets_mut(&mut self) -> &mut Targets;
    fn touch(&mut self, now: i64);
    fn label(&self) -> String;
}

/// A comment, like, repost, reaction, RSVP or mention to be propagated.
/// Keyed by the response's tag URI.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub key: String,
    pub source_key: String,
    #[serde(rename = "type")]
    pub kind: ResponseType,
    /// Pruned activities this response belongs to, one JSON document each.
    #[serde(default)]
    pub activities_json: Vec<String>,
    pub response_json: String,
    /// Target URL to index into `activities_json`, set only with several activities.
    #[serde(default)]
    pub urls_to_activity: Option<BTreeMap<String, usize>>,
    #[serde(default)]
    pub original_posts: Vec<String>,
    #[serde(default)]
    pub old_response_jsons: Vec<String>,
    #[serde(flatten)]
    pub targets: Targets,
    #[serde(default)]
    pub status: WebmentionStatus,
    #[serde(default)]
    pub leased_until_ms: Option<i64>,
    pub created_ms: i64,
    pub updated_ms: i64,
}

impl Response {
    pub fn response(&self) -> Result<Value> {
        serde_json::from_str(&self.response_json)
            .with_context(|| format!("decode response_json of {}", self.key))
    }

    pub fn activities(&self) -> Result<Vec<Value>> {
        self.activities_json
            .iter()
            .map(|a| {
                serde_json::from_str(a)
                    .with_context(|| format!("decode activities_json of {}", self.key))
            })
            .collect()
    }
}

impl Webmentions for Response {
    const TABLE: &'static str = "responses";

    fn key(&self) -> &str {
        &self.key
    }
    fn source_key(&self) -> &str {
        &self.source_key
    }
    fn status(&self) -> WebmentionStatus {
        self.status
    }
    fn set_status(&mut self, status: WebmentionStatus) {
        self.status = status;
    }
    fn leased_until_ms(&self) -> Option<i64> {
        self.leased_until_ms
    }
    fn set_leased_until_ms(&mut self, until: Option<i64>) {
        self.leased_until_ms = until;
    }
    fn targets(&self) -> &Targets {
        &self.targets
    }
    fn targets_mut(&mut self) -> &mut Targets {
        &mut self.targets
    }
    fn touch(&mut self, now: i64) {
        self.updated_ms = now;
    }
    fn label(&self) -> String {
        let url = self
            .response()
            .ok()
            .and_then(|r| r.get("url").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| "[no url]".to_string());
        format!("Response {} {} {url}", self.kind.as_str(), self.key)
    }
}

/// Outbound webmentions from one of the user's own blog posts.
/// Keyed by the blog post URL.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlogPost {
    pub key: String,
    pub source_key: String,
    #[serde(default)]
    pub feed_item_json: Option<String>,
    #[serde(flatten)]
    pub targets: Targets,
    #[serde(default)]
    pub status: WebmentionStatus,
    #[serde(default)]
    pub leased_until_ms: Option<i64>,
    pub created_ms: i64,
    pub updated_ms: i64,
}

impl Webmentions for BlogPost {
    const TABLE: &'static str = "blog_posts";

    fn key(&self) -> &str {
        &self.key
    }
    fn source_key(&self) -> &str {
        &self.source_key
    }
    fn status(&self) -> WebmentionStatus {
        self.status
    }
    fn set_status(&mut self, status: WebmentionStatus) {
        self.status = status;
    }
    fn leased_until_ms(&self) -> Option<i64> {
        self.leased_until_ms
    }
    fn set_leased_until_ms(&mut self, until: Option<i64>) {
        self.leased_until_ms = until;
    }
    fn targets(&self) -> &Targets {
        &self.targets
    }
    fn targets_mut(&mut self) -> &mut Targets {
        &mut self.targets
    }
    fn touch(&mut self, now: i64) {
        self.updated_ms = now;
    }
    fn label(&self) -> String {
        format!("BlogPost {}", self.key)
    }
}

/// A remembered mapping between a web permalink and its silo copy. A `None`
/// side records that we looked and found nothing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyndicatedPost {
    pub id: i64,
    pub source_key: String,
    pub original: Option<String>,
    pub syndication: Option<String>,
    pub created_ms: i64,
    pub updated_ms: i64,
}
