/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Process-wide caches for webmention endpoints and resolved redirects.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use url::Url;

pub const ENDPOINT_CACHE_CAPACITY: usize = 500;
pub const ENDPOINT_CACHE_TTL: Duration = Duration::from_secs(2 * 60 * 60);
pub const REDIRECT_CACHE_CAPACITY: usize = 2000;
pub const REDIRECT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

static SHARED_ENDPOINTS: LazyLock<Arc<EndpointCache>> =
    LazyLock::new(|| Arc::new(EndpointCache::new(ENDPOINT_CACHE_CAPACITY, ENDPOINT_CACHE_TTL)));

static SHARED_REDIRECTS: LazyLock<Arc<RedirectCache>> =
    LazyLock::new(|| Arc::new(RedirectCache::new(REDIRECT_CACHE_CAPACITY, REDIRECT_CACHE_TTL)));

/// A bounded map whose entries expire. When full, the oldest insert goes first.
pub struct TtlCache<V> {
    inner: Mutex<Entries<V>>,
    capacity: usize,
    ttl: Duration,
}

struct Entries<V> {
    map: HashMap<String, (V, Instant)>,
    order: VecDeque<String>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Entries {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries<V>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.lock();
        let expired = match entries.map.get(key) {
            None => return None,
            Some((value, expires)) if *expires > Instant::now() => return Some(value.clone()),
            Some(_) => true,
        };
        if expired {
            entries.map.remove(key);
            entries.order.retain(|k| k != key);
        }
        None
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        let expires = Instant::now() + self.ttl;
        let mut entries = self.lock();
        if entries.map.insert(key.clone(), (value, expires)).is_some() {
            entries.order.retain(|k| *k != key);
        }
        entries.order.push_back(key);
        while entries.map.len() > self.capacity {
            let Some(oldest) = entries.order.pop_front() else {
                break;
            };
            entries.map.remove(&oldest);
        }
    }

    pub fn remove(&self, key: &str) {
        let mut entries = self.lock();
        if entries.map.remove(key).is_some() {
            entries.order.retain(|k| k != key);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut entries = self.lock();
        entries.map.clear();
        entries.order.clear();
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Url(String),
    NoEndpoint,
}

/// `W <scheme> <host>` for pages, `W <scheme> <host> /` for the home page.
pub fn cache_key(target: &str) -> Option<String> {
    let parsed = Url::parse(target.trim()).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let mut key = format!("W {} {host}", parsed.scheme());
    if parsed.path() == "/" || parsed.path().is_empty() {
        key.push_str(" /");
    }
    Some(key)
}

pub struct EndpointCache {
    cache: TtlCache<Endpoint>,
}

impl EndpointCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            cache: TtlCache::new(capacity, ttl),
        }
    }

    /// The process-wide instance.
    pub fn shared() -> Arc<Self> {
        SHARED_ENDPOINTS.clone()
    }

    pub fn get(&self, target: &str) -> Option<Endpoint> {
        self.cache.get(&cache_key(target)?)
    }

    pub fn put(&self, target: &str, endpoint: Endpoint) {
        if let Some(key) = cache_key(target) {
            self.cache.insert(key, endpoint);
        }
    }

    pub fn evict(&self, target: &str) {
        if let Some(key) = cache_key(target) {
            self.cache.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Where a URL ended up after following one redirect, and its content type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedUrl {
    pub url: String,
    pub content_type: Option<String>,
}

pub struct RedirectCache {
    cache: TtlCache<ResolvedUrl>,
}

impl RedirectCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            cache: TtlCache::new(capacity, ttl),
        }
    }

    pub fn shared() -> Arc<Self> {
        SHARED_REDIRECTS.clone()
    }

    pub fn get(&self, url: &str) -> Option<ResolvedUrl> {
        self.cache.get(&format!("R {url}"))
    }

    pub fn put(&self, url: &str, resolved: ResolvedUrl) {
        self.cache.insert(format!("R {url}"), resolved);
    }

    pub fn evict(&self, url: &str) {
        self.cache.remove(&format!("R {url}"));
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_and_page_keys_differ() {
        assert_eq!(cache_key("https://example.com/").as_deref(), Some("W https example.com /"));
        assert_eq!(cache_key("https://example.com").as_deref(), Some("W https example.com /"));
        assert_eq!(cache_key("https://Example.com/x").as_deref(), Some("W https example.com"));
        assert_eq!(cache_key("https://example.com/x/y?z"), cache_key("https://example.com/x"));
        assert_ne!(cache_key("http://example.com/x"), cache_key("https://example.com/x"));
        assert_eq!(cache_key("not a url"), None);
    }

    #[test]
    fn entries_expire() {
        let cache = EndpointCache::new(10, Duration::from_millis(0));
        cache.put("https://a.example/p", Endpoint::NoEndpoint);
        assert_eq!(cache.get("https://a.example/p"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_evicts_oldest() {
        let cache: TtlCache<u32> = TtlCache::new(2, Duration::from_secs(60));
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("a", 3);
        cache.insert("c", 4);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(3));
        assert_eq!(cache.get("c"), Some(4));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn hits_are_shared_per_host() {
        let cache = EndpointCache::new(10, Duration::from_secs(60));
        cache.put(
            "https://a.example/post/1",
            Endpoint::Url("https://a.example/wm".into()),
        );
        assert_eq!(
            cache.get("https://a.example/post/2"),
            Some(Endpoint::Url("https://a.example/wm".into()))
        );
        assert_eq!(cache.get("https://a.example/"), None);
        cache.evict("https://a.example/post/3");
        assert_eq!(cache.get("https://a.example/post/1"), None);
    }
}
