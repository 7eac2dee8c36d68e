/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Original post discovery: maps a silo activity to the user's own web
//! permalinks ("originals") and to other web pages it links to ("mentions").
//!
//! Links on the activity itself are the cheap path. When the user's site
//! POSSEs to the silo without linking back, the reverse lookup walks the
//! user's h-feed for an entry whose `u-syndication` points at the activity,
//! remembering every answer (and every non-answer) as a [`SyndicatedPost`].

use crate::as1;
use crate::http_fetch::{is_html, HttpFetcher};
use crate::mf2::{self, Item};
use crate::models::{dedupe, now_ms, ResponseType, Source, SyndicatedPost};
use crate::silo::SiloAdapter;
use crate::store::BridgyDb;
use crate::urls::{self, TargetCheck};
use anyhow::Result;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

pub const MAX_AUTHOR_URLS: usize = 5;
pub const MAX_FEEDS: usize = 2;
pub const MAX_FEED_ENTRIES: usize = 30;
pub const MAX_PERMALINK_FETCHES: usize = 20;
pub const MAX_ORIGINAL_CANDIDATES: usize = 10;
pub const MAX_MENTION_CANDIDATES: usize = 10;

/// Tag object types that name people or topics rather than linking a page.
const NON_LINK_TAG_TYPES: &[&str] = &["person", "hashtag", "group", "mention"];

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Discovered {
    pub originals: BTreeSet<String>,
    pub mentions: BTreeSet<String>,
}

/// Source fields OPD wants changed. Applied by the poller together with its
/// own updates, in one write.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceUpdates {
    pub last_syndication_url_ms: Option<i64>,
    pub last_feed_syndication_url_ms: Option<i64>,
    /// Full replacement for `Source::domains`, set when a rel=feed link
    /// pointed at a new domain.
    pub domains: Option<Vec<String>>,
}

impl SourceUpdates {
    pub fn is_empty(&self) -> bool {
        *self == SourceUpdates::default()
    }

    pub fn apply(&self, source: &mut Source) {
        if let Some(ms) = self.last_syndication_url_ms {
            source.last_syndication_url_ms = Some(ms);
        }
        if let Some(ms) = self.last_feed_syndication_url_ms {
            source.last_feed_syndication_url_ms = Some(ms);
        }
        if let Some(domains) = &self.domains {
            source.domains = dedupe(source.domains.iter().chain(domains).cloned());
        }
    }

    fn add_domain(&mut self, source: &Source, domain: String) {
        if source.domains.contains(&domain) {
            return;
        }
        let domains = self.domains.get_or_insert_with(|| source.domains.clone());
        if !domains.contains(&domain) {
            info!("rel-feed found new domain {domain} for {}", source.label());
            domains.push(domain);
        }
    }
}

/// Syndication URL to the relationships newly found for it.
pub type Relationships = BTreeMap<String, Vec<SyndicatedPost>>;

fn merge(into: &mut Relationships, from: Relationships) {
    for (synd, posts) in from {
        into.entry(synd).or_default().extend(posts);
    }
}

/// The URLs a response should be delivered to. Mentions only count for
/// posts and comments.
pub fn targets_for_response(
    kind: ResponseType,
    originals: &BTreeSet<String>,
    mentions: &BTreeSet<String>,
) -> BTreeSet<String> {
    let mut targets = BTreeSet::new();
    if kind != ResponseType::Post {
        targets.extend(originals.iter().cloned());
    }
    if matches!(kind, ResponseType::Post | ResponseType::Comment) {
        targets.extend(mentions.iter().cloned());
    }
    targets
}

/// Web links an activity carries, minus links back into the silo itself.
pub fn candidate_urls(activity: &Value, adapter: &dyn SiloAdapter) -> Vec<String> {
    let obj = as1::object_or_self(activity);
    let mut out = Vec::new();
    let mut scan = |o: &Value| {
        for dup in as1::get_list(o, "upstreamDuplicates") {
            if let Some(s) = dup.as_str() {
                out.push(s.to_string());
            }
        }
        for tag in as1::get_list(o, "tags") {
            let kind = as1::get_str(tag, "objectType").unwrap_or_default();
            if !NON_LINK_TAG_TYPES.contains(&kind) {
                out.extend(as1::object_urls(tag));
            }
        }
        for att in as1::get_list(o, "attachments") {
            out.extend(as1::object_urls(att));
            if let Some(content) = as1::get_str(att, "content") {
                out.extend(urls::extract_links(content));
            }
        }
        for parent in as1::get_list(o, "inReplyTo") {
            out.extend(as1::object_urls(parent));
        }
        if let Some(content) = as1::get_str(o, "content") {
            out.extend(urls::extract_links(content));
        }
    };
    scan(obj);
    if !std::ptr::eq(obj, activity) {
        scan(activity);
    }

    let silo_domain = vec![adapter.domain().to_string()];
    dedupe(out.into_iter().filter(|u| {
        urls::domain_from_link(u).is_some_and(|host| !urls::domain_or_parent_in(&host, &silo_domain))
    }))
}

/// One OPD run for one source. Holds the per-run permalink fetch budget.
pub struct Resolver<'a> {
    db: &'a BridgyDb,
    fetcher: &'a HttpFetcher,
    adapter: &'a dyn SiloAdapter,
    source: &'a Source,
    permalink_fetches: usize,
}

impl<'a> Resolver<'a> {
    pub fn new(
        db: &'a BridgyDb,
        fetcher: &'a HttpFetcher,
        adapter: &'a dyn SiloAdapter,
        source: &'a Source,
    ) -> Self {
        Self {
            db,
            fetcher,
            adapter,
            source,
            permalink_fetches: 0,
        }
    }

    /// Originals and mentions for `activity`. With `fetch_hfeed` false only
    /// stored relationships are consulted and nothing new is recorded.
    pub async fn discover(
        &mut self,
        activity: &Value,
        fetch_hfeed: bool,
        updates: &mut SourceUpdates,
    ) -> Result<Discovered> {
        self.permalink_fetches = 0;
        let obj = as1::object_or_self(activity);

        let mut originals = BTreeSet::new();
        let mut mentions = BTreeSet::new();
        for url in candidate_urls(activity, self.adapter) {
            let own = urls::domain_from_link(&url)
                .is_some_and(|host| urls::domain_or_parent_in(&host, &self.source.domains));
            if own && originals.len() < MAX_ORIGINAL_CANDIDATES {
                originals.insert(url);
            } else if !own && mentions.len() < MAX_MENTION_CANDIDATES {
                mentions.insert(url);
            }
        }

        let user = self.adapter.user_tag_id(self.source);
        if let Some(author) = as1::author_id(obj).filter(|a| *a != user) {
            debug!("demoting original post links: {author} isn't {user}");
            mentions.append(&mut originals);
        }

        let mut found = Discovered {
            originals: self.resolve(originals).await,
            mentions: self.resolve(mentions).await,
        };

        if self.source.author_urls().is_empty() {
            debug!("{} has no web site, not looking for an h-feed", self.source.label());
        } else if let Some(synd) = as1::get_url(obj).and_then(|u| self.adapter.canonicalize_url(u)) {
            let posse = self.posse_discovery(&synd, fetch_hfeed, updates).await?;
            found.originals.extend(posse);
        } else {
            debug!("no syndication url on activity, not processing h-entries");
        }

        found.mentions.retain(|m| !found.originals.contains(m));
        Ok(found)
    }

    /// Rereads the user's feeds, bypassing stored relationships, and returns
    /// relationships that weren't known before.
    pub async fn refetch(&mut self, updates: &mut SourceUpdates) -> Result<Relationships> {
        self.permalink_fetches = 0;
        debug!("refetching h-feed for {}", self.source.label());
        let mut results = Relationships::new();
        for url in self.author_urls() {
            let found = self.process_author(&url, true, updates).await?;
            merge(&mut results, found);
        }
        Ok(results)
    }

    fn author_urls(&self) -> Vec<String> {
        let all = self.source.author_urls();
        if all.len() > MAX_AUTHOR_URLS {
            warn!(
                "{} has {} urls, only checking the first {MAX_AUTHOR_URLS}",
                self.source.label(),
                all.len()
            );
        }
        all.iter().take(MAX_AUTHOR_URLS).cloned().collect()
    }

    /// Final URLs of the candidates that may receive webmentions. Over-long
    /// URLs are kept here; the poller moves them to `failed`.
    async fn resolve(&self, candidates: BTreeSet<String>) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for url in candidates {
            match self.fetcher.webmention_target(&url).await {
                TargetCheck::Send(final_url) | TargetCheck::TooLong(final_url) => {
                    out.insert(final_url);
                }
                TargetCheck::Skip(reason) => debug!("dropping candidate {url}: {reason}"),
            }
        }
        out
    }

    async fn posse_discovery(
        &mut self,
        synd: &str,
        fetch_hfeed: bool,
        updates: &mut SourceUpdates,
    ) -> Result<Vec<String>> {
        debug!("posse post discovery for {synd}");
        let source_key = self.source.key();
        let lookup = synd.to_string();
        let mut relationships = self
            .db
            .call(move |db| db.syndicated_by_syndication(&source_key, &lookup))
            .await?;

        if relationships.is_empty() && fetch_hfeed {
            let mut results = Relationships::new();
            for url in self.author_urls() {
                let found = self.process_author(&url, false, updates).await?;
                merge(&mut results, found);
            }
            relationships = results.remove(synd).unwrap_or_default();
        }

        if relationships.is_empty() {
            debug!("no original found for {synd}");
            if fetch_hfeed {
                let source_key = self.source.key();
                let blank = synd.to_string();
                self.db
                    .call(move |db| db.insert_syndication_blank(&source_key, &blank))
                    .await?;
            }
        }

        let originals: Vec<String> = relationships.into_iter().filter_map(|r| r.original).collect();
        if !originals.is_empty() {
            debug!("found original(s) for {synd}: {originals:?}");
        }
        Ok(originals)
    }

    async fn process_author(
        &mut self,
        author_url: &str,
        refetch: bool,
        updates: &mut SourceUpdates,
    ) -> Result<Relationships> {
        let author_url = match self.fetcher.webmention_target(author_url).await {
            TargetCheck::Send(url) => url,
            other => {
                debug!("not searching {author_url}: {other:?}");
                return Ok(Relationships::new());
            }
        };

        let page = match self.fetcher.fetch_html(&author_url).await {
            Ok(Some(page)) => page,
            Ok(None) => return Ok(Relationships::new()),
            Err(e) => {
                warn!("could not fetch author url {author_url}: {e:#}");
                return Ok(Relationships::new());
            }
        };
        let doc = mf2::parse(&page.body, &page.url);
        let mut entries: Vec<Item> = doc.feed_entries().into_iter().cloned().collect();

        let mut feed_urls: Vec<String> = Vec::new();
        for (href, rel) in &doc.rel_urls {
            if feed_urls.len() >= MAX_FEEDS {
                break;
            }
            let is_feed = rel.rels.iter().any(|r| r == "feed");
            let is_alternate = rel.rels.iter().any(|r| r == "alternate")
                && rel.media_type.as_deref().is_some_and(is_html);
            if !is_feed && !is_alternate {
                continue;
            }
            let feed_url = match rel.media_type.as_deref() {
                Some(t) if is_html(t) => href.clone(),
                Some(t) => {
                    debug!("skipping feed {href} of type {t}");
                    continue;
                }
                None => match self.fetcher.webmention_target(href).await {
                    TargetCheck::Send(url) => url,
                    other => {
                        debug!("skipping feed {href}: {other:?}");
                        continue;
                    }
                },
            };
            if feed_url == author_url || feed_urls.contains(&feed_url) {
                continue;
            }
            feed_urls.push(feed_url);
        }

        for feed_url in feed_urls {
            match self.fetcher.fetch_html(&feed_url).await {
                Ok(Some(feed)) => {
                    let feed_doc = mf2::parse(&feed.body, &feed.url);
                    merge_feeds(&mut entries, feed_doc.feed_entries().into_iter().cloned());
                    if let Some(domain) = urls::domain_from_link(&feed_url) {
                        updates.add_domain(self.source, domain);
                    }
                }
                Ok(None) => debug!("rel-feed {feed_url} isn't usable html"),
                Err(e) => warn!("could not fetch h-feed {feed_url}: {e:#}"),
            }
        }

        let mut permalinks: Vec<(String, Item)> = Vec::new();
        for entry in entries.into_iter().filter(|e| e.has_type("h-entry")) {
            for url in entry.get("url") {
                if !permalinks.iter().any(|(p, _)| p == url) {
                    permalinks.push((url.clone(), entry.clone()));
                }
            }
        }
        permalinks.truncate(MAX_FEED_ENTRIES);

        let source_key = self.source.key();
        let lookup: Vec<String> = permalinks.iter().map(|(p, _)| p.clone()).collect();
        let mut preexisting: HashMap<String, Vec<SyndicatedPost>> = self
            .db
            .call(move |db| {
                lookup
                    .into_iter()
                    .map(|p| {
                        let found = db.syndicated_by_original(&source_key, &p)?;
                        Ok((p, found))
                    })
                    .collect()
            })
            .await?;

        let mut results = Relationships::new();
        for (permalink, entry) in permalinks {
            let known = preexisting.remove(&permalink).unwrap_or_default();
            let found = self.process_entry(&permalink, &entry, refetch, known, updates).await?;
            merge(&mut results, found);
        }

        if !results.is_empty() {
            updates.last_syndication_url_ms = Some(now_ms());
        }
        Ok(results)
    }

    async fn process_entry(
        &mut self,
        permalink: &str,
        entry: &Item,
        refetch: bool,
        mut preexisting: Vec<SyndicatedPost>,
        updates: &mut SourceUpdates,
    ) -> Result<Relationships> {
        if !preexisting.is_empty() && !refetch {
            return Ok(Relationships::new());
        }

        let (permalink, type_ok) = match self.fetcher.webmention_target(permalink).await {
            TargetCheck::Send(url) => (url, true),
            TargetCheck::TooLong(url) => (url, false),
            TargetCheck::Skip(_) => (permalink.to_string(), false),
        };

        let mut results = self
            .process_syndication_urls(&permalink, entry.get("syndication"), &preexisting)
            .await?;
        if !results.is_empty() {
            updates.last_feed_syndication_url_ms = Some(now_ms());
        }

        let mut success = true;
        if results.is_empty() && type_ok {
            if self.permalink_fetches >= MAX_PERMALINK_FETCHES {
                debug!("permalink fetch budget spent, not fetching {permalink}");
                return Ok(Relationships::new());
            }
            self.permalink_fetches += 1;
            debug!("fetching permalink {permalink}");
            match self.fetcher.fetch_html(&permalink).await {
                Ok(Some(page)) => {
                    let doc = mf2::parse(&page.body, &page.url);
                    let mut synds: Vec<String> = doc.rel("syndication").to_vec();
                    for hentry in doc.entries() {
                        synds.extend(hentry.get("syndication").iter().cloned());
                    }
                    results = self
                        .process_syndication_urls(&permalink, &synds, &preexisting)
                        .await?;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("could not fetch permalink {permalink}: {e:#}");
                    success = false;
                }
            }
        }

        if success {
            let kept: HashSet<i64> = results.values().flatten().map(|s| s.id).collect();
            let mut stale = Vec::new();
            preexisting.retain(|s| {
                let gone = s.syndication.is_some() && !kept.contains(&s.id);
                if gone {
                    stale.push(s.id);
                }
                !gone
            });
            if !stale.is_empty() {
                info!("deleting {} relationship(s) that disappeared from {permalink}", stale.len());
                self.db
                    .call(move |db| {
                        for id in stale {
                            db.delete_syndicated(id)?;
                        }
                        Ok(())
                    })
                    .await?;
            }
        }

        if results.is_empty() {
            if preexisting.is_empty() {
                debug!("no syndication links on {permalink}, remembering that");
                let source_key = self.source.key();
                let original = permalink.clone();
                self.db
                    .call(move |db| db.insert_original_blank(&source_key, &original))
                    .await?;
            }
            return Ok(Relationships::new());
        }

        let known: HashSet<i64> = preexisting.iter().map(|s| s.id).collect();
        let mut fresh = Relationships::new();
        for (synd, posts) in results {
            let posts: Vec<SyndicatedPost> = posts.into_iter().filter(|p| !known.contains(&p.id)).collect();
            if !posts.is_empty() {
                fresh.insert(synd, posts);
            }
        }
        if !fresh.is_empty() {
            debug!("discovered relationships for {permalink}: {:?}", fresh.keys());
        }
        Ok(fresh)
    }

    /// Stores a relationship for every URL that is a post on this silo.
    async fn process_syndication_urls(
        &self,
        permalink: &str,
        syndication_urls: &[String],
        preexisting: &[SyndicatedPost],
    ) -> Result<Relationships> {
        let canon: BTreeSet<String> = syndication_urls
            .iter()
            .filter_map(|u| self.adapter.canonicalize_url(u))
            .collect();

        let mut results = Relationships::new();
        for synd in canon {
            let known = preexisting.iter().find(|s| {
                s.syndication.as_deref() == Some(synd.as_str())
                    && s.original.as_deref() == Some(permalink)
            });
            let post = match known {
                Some(post) => post.clone(),
                None => {
                    debug!("saving relationship {synd} -> {permalink}");
                    let source_key = self.source.key();
                    let (s, o) = (synd.clone(), permalink.to_string());
                    self.db
                        .call(move |db| db.insert_syndicated(&source_key, &s, &o))
                        .await?
                }
            };
            results.entry(synd).or_default().push(post);
        }
        Ok(results)
    }
}

/// Appends entries from `more` whose urls aren't already present.
fn merge_feeds(entries: &mut Vec<Item>, more: impl IntoIterator<Item = Item>) {
    let seen: HashSet<String> = entries.iter().flat_map(|e| e.get("url").iter().cloned()).collect();
    entries.extend(
        more.into_iter()
            .filter(|e| e.get("url").iter().all(|u| !seen.contains(u))),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, FakeSilo};
    use axum::{
        extract::{Path, State},
        http::{header as h, Method},
        response::{Html, IntoResponse},
        routing::get,
        Router,
    };
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};

    type Page = Arc<Mutex<String>>;

    fn feed_html(synd: &str) -> String {
        format!(
            r#"<html><body><div class="h-feed">
              <div class="h-entry"><a class="u-url" href="/post">post</a>
                <a class="u-syndication" href="{synd}">copy</a></div>
              <div class="h-entry"><a class="u-url" href="/other">other</a></div>
            </div></body></html>"#
        )
    }

    fn site(home: Page) -> Router {
        Router::new()
            .route(
                "/",
                get(|axum::extract::State(home): axum::extract::State<Page>| async move {
                    Html(home.lock().unwrap().clone())
                }),
            )
            .route(
                "/other",
                get(|| async {
                    Html(r#"<html><body><div class="h-entry"><a class="u-url" href="/other">o</a></div></body></html>"#)
                }),
            )
            .route("/post", get(|| async { Html("<html><body>post</body></html>") }))
            .route(
                "/img.png",
                get(|| async { ([(h::CONTENT_TYPE, "image/png")], vec![0u8; 4]).into_response() }),
            )
            .with_state(home)
    }

    fn activity() -> Value {
        testutil::post("url")
    }

    type Hits = Arc<Mutex<Vec<usize>>>;

    /// `/n/:n` pages that record which ones were GETted. HEADs aren't counted.
    async fn numbered(Path(n): Path<usize>, method: Method, State(hits): State<Hits>) -> Html<String> {
        if method == Method::GET {
            hits.lock().unwrap().push(n);
        }
        Html(format!("<html><body>page {n}</body></html>"))
    }

    fn sorted(hits: &Hits) -> Vec<usize> {
        let mut got = hits.lock().unwrap().clone();
        got.sort_unstable();
        got.dedup();
        got
    }

    #[tokio::test]
    async fn finds_original_through_hfeed() {
        let home: Page = Arc::new(Mutex::new(feed_html("https://fa.ke/post/url")));
        let (base, hits) = testutil::serve_counted(site(home)).await;
        let (_dir, db) = testutil::temp_db();
        let fetcher = testutil::fetcher();
        let fake = FakeSilo::new();
        let source = testutil::source_for(&base);

        let mut updates = SourceUpdates::default();
        let mut resolver = Resolver::new(&db, &fetcher, &fake, &source);
        let first = resolver.discover(&activity(), true, &mut updates).await.unwrap();
        assert_eq!(
            first.originals.into_iter().collect::<Vec<_>>(),
            vec![format!("{base}/post")]
        );
        assert!(first.mentions.is_empty());
        assert!(updates.last_syndication_url_ms.is_some());

        // the other entry got a blank so it isn't fetched again
        let blanks = db.syndicated_by_original(&source.key(), &format!("{base}/other")).unwrap();
        assert_eq!(blanks.len(), 1);
        assert_eq!(blanks[0].syndication, None);

        let before = hits.load(Ordering::SeqCst);
        let mut resolver = Resolver::new(&db, &fetcher, &fake, &source);
        let second = resolver
            .discover(&activity(), true, &mut SourceUpdates::default())
            .await
            .unwrap();
        assert_eq!(second.originals.len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn unmatched_syndication_gets_a_blank() {
        let home: Page = Arc::new(Mutex::new(feed_html("https://fa.ke/post/elsewhere")));
        let base = testutil::serve(site(home)).await;
        let (_dir, db) = testutil::temp_db();
        let fetcher = testutil::fetcher();
        let fake = FakeSilo::new();
        let source = testutil::source_for(&base);

        let mut resolver = Resolver::new(&db, &fetcher, &fake, &source);
        let found = resolver
            .discover(&activity(), true, &mut SourceUpdates::default())
            .await
            .unwrap();
        assert!(found.originals.is_empty());
        let blank = db
            .syndicated_by_syndication(&source.key(), "https://fa.ke/post/url")
            .unwrap();
        assert_eq!(blank.len(), 1);
        assert_eq!(blank[0].original, None);
    }

    #[tokio::test]
    async fn links_split_into_originals_and_mentions() {
        let home: Page = Arc::new(Mutex::new("<html></html>".to_string()));
        let base = testutil::serve(site(home)).await;
        let (_dir, db) = testutil::temp_db();
        let fetcher = testutil::fetcher();
        let fake = FakeSilo::new();
        let mut source = testutil::source_for(&base);
        source.domain_urls.clear();

        let mut act = activity();
        act["object"]["content"] = json!(format!(
            "see {base}/post and http://localhost:{}/post, also https://fa.ke/post/9 and {base}/img.png",
            base.rsplit(':').next().unwrap()
        ));
        let mut resolver = Resolver::new(&db, &fetcher, &fake, &source);
        let found = resolver
            .discover(&act, false, &mut SourceUpdates::default())
            .await
            .unwrap();
        assert_eq!(found.originals.iter().collect::<Vec<_>>(), [&format!("{base}/post")]);
        assert!(found.mentions.iter().all(|m| !m.contains("fa.ke") && !m.ends_with(".png")));
    }

    #[tokio::test]
    async fn someone_elses_post_only_mentions() {
        let home: Page = Arc::new(Mutex::new("<html></html>".to_string()));
        let base = testutil::serve(site(home)).await;
        let (_dir, db) = testutil::temp_db();
        let fetcher = testutil::fetcher();
        let fake = FakeSilo::new();
        let mut source = testutil::source_for(&base);
        source.domain_urls.clear();

        let mut act = activity();
        act["object"]["author"] = json!({"id": "tag:fa.ke,2013:bob"});
        act["object"]["content"] = json!(format!("{base}/post"));
        let mut resolver = Resolver::new(&db, &fetcher, &fake, &source);
        let found = resolver
            .discover(&act, false, &mut SourceUpdates::default())
            .await
            .unwrap();
        assert!(found.originals.is_empty());
        assert_eq!(found.mentions.iter().collect::<Vec<_>>(), [&format!("{base}/post")]);
    }

    #[tokio::test]
    async fn refetch_finds_new_links_once() {
        let home: Page = Arc::new(Mutex::new(feed_html("https://fa.ke/post/elsewhere")));
        let base = testutil::serve(site(home.clone())).await;
        let (_dir, db) = testutil::temp_db();
        let fetcher = testutil::fetcher();
        let fake = FakeSilo::new();
        let source = testutil::source_for(&base);

        let mut resolver = Resolver::new(&db, &fetcher, &fake, &source);
        resolver
            .discover(&activity(), true, &mut SourceUpdates::default())
            .await
            .unwrap();

        *home.lock().unwrap() = format!(
            r#"<html><body><div class="h-feed">
              <div class="h-entry"><a class="u-url" href="/post">post</a>
                <a class="u-syndication" href="https://fa.ke/post/elsewhere">a</a></div>
              <div class="h-entry"><a class="u-url" href="/other">other</a>
                <a class="u-syndication" href="https://www.fa.ke/post/url">b</a></div>
            </div></body></html>"#
        );
        let mut resolver = Resolver::new(&db, &fetcher, &fake, &source);
        let mut updates = SourceUpdates::default();
        let found = resolver.refetch(&mut updates).await.unwrap();
        assert_eq!(found.keys().collect::<Vec<_>>(), ["https://fa.ke/post/url"]);
        assert_eq!(
            found["https://fa.ke/post/url"][0].original.as_deref(),
            Some(format!("{base}/other").as_str())
        );
        assert!(db
            .syndicated_by_original(&source.key(), &format!("{base}/other"))
            .unwrap()
            .iter()
            .all(|s| s.syndication.is_some()));

        let mut resolver = Resolver::new(&db, &fetcher, &fake, &source);
        assert!(resolver.refetch(&mut SourceUpdates::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn refetch_drops_vanished_links() {
        let home: Page = Arc::new(Mutex::new(feed_html("https://fa.ke/post/url")));
        let base = testutil::serve(site(home.clone())).await;
        let (_dir, db) = testutil::temp_db();
        let fetcher = testutil::fetcher();
        let fake = FakeSilo::new();
        let source = testutil::source_for(&base);

        let mut resolver = Resolver::new(&db, &fetcher, &fake, &source);
        resolver
            .discover(&activity(), true, &mut SourceUpdates::default())
            .await
            .unwrap();
        assert_eq!(
            db.syndicated_by_syndication(&source.key(), "https://fa.ke/post/url").unwrap().len(),
            1
        );

        *home.lock().unwrap() = feed_html("https://fa.ke/post/moved");
        let mut resolver = Resolver::new(&db, &fetcher, &fake, &source);
        let found = resolver.refetch(&mut SourceUpdates::default()).await.unwrap();
        assert!(found.contains_key("https://fa.ke/post/moved"));
        assert!(db
            .syndicated_by_syndication(&source.key(), "https://fa.ke/post/url")
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn rel_feed_adds_domain() {
        let feed_base = testutil::serve(Router::new().route(
            "/notes",
            get(|| async {
                Html(r#"<div class="h-entry"><a class="u-url" href="/n1">n</a><a class="u-syndication" href="https://fa.ke/post/url">s</a></div>"#)
            }),
        ))
        .await;
        let feed_link = format!(
            r#"<html><head><link rel="feed" type="text/html" href="{feed_base}/notes"></head></html>"#
        );
        let home: Page = Arc::new(Mutex::new(feed_link));
        let base = testutil::serve(site(home)).await;
        let (_dir, db) = testutil::temp_db();
        let fetcher = testutil::fetcher();
        let fake = FakeSilo::new();
        let mut source = testutil::source_for(&base);
        source.domains = vec!["or.ig".to_string()];

        let mut updates = SourceUpdates::default();
        let mut resolver = Resolver::new(&db, &fetcher, &fake, &source);
        let found = resolver.discover(&activity(), true, &mut updates).await.unwrap();
        assert_eq!(
            found.originals.into_iter().collect::<Vec<_>>(),
            vec![format!("{feed_base}/n1")]
        );
        assert_eq!(
            updates.domains,
            Some(vec!["or.ig".to_string(), "127.0.0.1".to_string()])
        );
        updates.apply(&mut source);
        assert_eq!(source.domains, ["or.ig", "127.0.0.1"]);
    }

    #[tokio::test]
    async fn only_the_first_author_urls_are_searched() {
        let hits = Hits::default();
        let base = testutil::serve(
            Router::new()
                .route("/n/:n", get(numbered))
                .with_state(hits.clone()),
        )
        .await;
        let (_dir, db) = testutil::temp_db();
        let fetcher = testutil::fetcher();
        let fake = FakeSilo::new();
        let mut source = testutil::source_for(&base);
        source.domain_urls = (0..MAX_AUTHOR_URLS + 3).map(|n| format!("{base}/n/{n}")).collect();

        let mut resolver = Resolver::new(&db, &fetcher, &fake, &source);
        let found = resolver.refetch(&mut SourceUpdates::default()).await.unwrap();
        assert!(found.is_empty());
        assert_eq!(sorted(&hits), (0..MAX_AUTHOR_URLS).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn permalink_fetches_stop_at_the_budget() {
        let entries = MAX_PERMALINK_FETCHES + 5;
        let feed: String = (0..entries)
            .map(|n| format!(r#"<div class="h-entry"><a class="u-url" href="/n/{n}">{n}</a></div>"#))
            .collect();
        let home: Page = Arc::new(Mutex::new(format!(
            r#"<html><body><div class="h-feed">{feed}</div></body></html>"#
        )));
        let hits = Hits::default();
        let pages = Router::new()
            .route("/n/:n", get(numbered))
            .with_state(hits.clone());
        let base = testutil::serve(site(home).merge(pages)).await;
        let (_dir, db) = testutil::temp_db();
        let fetcher = testutil::fetcher();
        let fake = FakeSilo::new();
        let source = testutil::source_for(&base);

        let mut resolver = Resolver::new(&db, &fetcher, &fake, &source);
        let found = resolver
            .discover(&activity(), true, &mut SourceUpdates::default())
            .await
            .unwrap();
        assert!(found.originals.is_empty());
        assert_eq!(sorted(&hits), (0..MAX_PERMALINK_FETCHES).collect::<Vec<_>>());

        for n in 0..entries {
            let blanks = db
                .syndicated_by_original(&source.key(), &format!("{base}/n/{n}"))
                .unwrap();
            if n < MAX_PERMALINK_FETCHES {
                assert_eq!(blanks.len(), 1, "entry {n}");
                assert_eq!(blanks[0].syndication, None);
            } else {
                assert!(blanks.is_empty(), "entry {n} was never fetched");
            }
        }
    }

    #[test]
    fn targets_depend_on_type() {
        let originals: BTreeSet<String> = ["http://or.ig/post".to_string()].into();
        let mentions: BTreeSet<String> = ["http://other/x".to_string()].into();
        let all = |k| targets_for_response(k, &originals, &mentions).len();
        assert_eq!(all(ResponseType::Like), 1);
        assert_eq!(all(ResponseType::Comment), 2);
        assert_eq!(
            targets_for_response(ResponseType::Post, &originals, &mentions),
            mentions
        );
    }
}
