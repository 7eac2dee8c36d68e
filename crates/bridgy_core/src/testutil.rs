/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Fakes shared by the unit tests: a scripted silo, a local HTTP server
//! standing in for users' sites, and throwaway databases.

use crate::endpoint_cache::{RedirectCache, REDIRECT_CACHE_CAPACITY, REDIRECT_CACHE_TTL};
use crate::http_fetch::HttpFetcher;
use crate::models::Source;
use crate::silo::{ActivitiesRequest, ActivitiesResponse, Silo, SiloAdapter, SiloError};
use crate::store::BridgyDb;
use crate::urls::{self, DomainBlocklist, TargetFilter};
use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    middleware::{self, Next},
    response::Response as AxumResponse,
    Router,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) const FAKE_DOMAIN: &str = "fa.ke";

/// Binds `app` to an ephemeral local port and returns `http://127.0.0.1:<port>`.
pub(crate) async fn serve(app: Router) -> String {
    serve_at("127.0.0.1", app).await
}

/// Like [`serve`] on another loopback address, e.g. `127.0.0.2`, for tests
/// that need targets on distinct hosts. Endpoint cache keys ignore the port.
pub(crate) async fn serve_at(ip: &str, app: Router) -> String {
    let listener = tokio::net::TcpListener::bind((ip, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

async fn count_requests(
    State(counter): State<Arc<AtomicUsize>>,
    req: Request,
    next: Next,
) -> AxumResponse {
    counter.fetch_add(1, Ordering::SeqCst);
    next.run(req).await
}

/// Like [`serve`], also counting every request the server sees.
pub(crate) async fn serve_counted(app: Router) -> (String, Arc<AtomicUsize>) {
    let counter = Arc::new(AtomicUsize::new(0));
    let app = app.layer(middleware::from_fn_with_state(counter.clone(), count_requests));
    (serve(app).await, counter)
}

pub(crate) fn temp_db() -> (tempfile::TempDir, BridgyDb) {
    let dir = tempfile::tempdir().unwrap();
    let db = BridgyDb::open(dir.path().join("bridgy.db")).unwrap();
    (dir, db)
}

/// A fetcher with its own redirect cache that blocks the fake silo's domain.
pub(crate) fn fetcher() -> HttpFetcher {
    HttpFetcher::new(
        Duration::from_secs(5),
        TargetFilter::new(DomainBlocklist::from_text(FAKE_DOMAIN), false),
        Vec::new(),
    )
    .unwrap()
    .with_redirect_cache(Arc::new(RedirectCache::new(
        REDIRECT_CACHE_CAPACITY,
        REDIRECT_CACHE_TTL,
    )))
}

/// `mastodon:foo` on the fake silo, with `site` (a local server base URL)
/// as its web site.
pub(crate) fn source_for(site: &str) -> Source {
    let mut source = Source::new(Silo::Mastodon, "foo", crate::models::now_ms());
    source.domain_urls = vec![format!("{site}/")];
    source.domains = urls::domain_from_link(site).into_iter().collect();
    source
}

#[derive(Default)]
pub(crate) struct FakeState {
    pub activities: Vec<Value>,
    pub links: Vec<Value>,
    pub etag: Option<String>,
    pub fail_status: Option<u16>,
    pub disable: Option<String>,
    pub blocked: Vec<String>,
    pub requests: Vec<ActivitiesRequest>,
}

/// Silo adapter for `fa.ke` that serves whatever the test scripted.
pub(crate) struct FakeSilo {
    pub state: Mutex<FakeState>,
    pub requires_syndication_link: bool,
    pub blocks: bool,
}

impl FakeSilo {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            requires_syndication_link: false,
            blocks: false,
        }
    }

    pub fn with_activities(activities: Vec<Value>) -> Self {
        let fake = Self::new();
        fake.set_activities(activities);
        fake
    }

    pub fn set_activities(&self, activities: Vec<Value>) {
        self.state.lock().unwrap().activities = activities;
    }

    pub fn set_links(&self, links: Vec<Value>) {
        self.state.lock().unwrap().links = links;
    }

    pub fn fail_with(&self, status: Option<u16>) {
        self.state.lock().unwrap().fail_status = status;
    }

    pub fn requests(&self) -> Vec<ActivitiesRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    fn check_failure(&self) -> Result<(), SiloError> {
        let state = self.state.lock().unwrap();
        if let Some(reason) = &state.disable {
            return Err(SiloError::Disable(reason.clone()));
        }
        if let Some(status) = state.fail_status {
            return Err(SiloError::Http {
                status,
                body: "scripted failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SiloAdapter for FakeSilo {
    fn silo(&self) -> Silo {
        Silo::Mastodon
    }

    fn domain(&self) -> &str {
        FAKE_DOMAIN
    }

    fn backfeed_requires_syndication_link(&self) -> bool {
        self.requires_syndication_link
    }

    fn has_blocks(&self) -> bool {
        self.blocks
    }

    async fn get_activities_response(
        &self,
        _source: &Source,
        req: &ActivitiesRequest,
        cache: &mut BTreeMap<String, Value>,
    ) -> Result<ActivitiesResponse, SiloError> {
        self.check_failure()?;
        let mut state = self.state.lock().unwrap();
        state.requests.push(req.clone());
        let items: Vec<Value> = match &req.activity_id {
            Some(id) => {
                let tag = self.tag_uri(id);
                state
                    .activities
                    .iter()
                    .filter(|a| a["id"] == tag.as_str())
                    .cloned()
                    .collect()
            }
            None => state.activities.clone(),
        };
        for item in &items {
            if let Some((_, local)) = item["id"].as_str().and_then(urls::parse_tag_uri) {
                cache.insert(format!("AR {local}"), json!(1));
            }
        }
        Ok(ActivitiesResponse {
            items,
            etag: state.etag.clone(),
        })
    }

    async fn search_for_links(&self, _source: &Source) -> Result<Vec<Value>, SiloError> {
        self.check_failure()?;
        Ok(self.state.lock().unwrap().links.clone())
    }

    async fn get_event(&self, _source: &Source, event_id: &str) -> Result<Option<Value>, SiloError> {
        self.check_failure()?;
        let tag = self.tag_uri(event_id);
        Ok(self
            .state
            .lock()
            .unwrap()
            .activities
            .iter()
            .find(|a| a["id"] == tag.as_str() && a["objectType"] == "event")
            .cloned())
    }

    async fn get_blocklist_ids(&self, _source: &Source) -> Result<Vec<String>, SiloError> {
        Ok(self.state.lock().unwrap().blocked.clone())
    }
}

/// A public post by `foo` at `https://fa.ke/post/<id>`.
pub(crate) fn post(id: &str) -> Value {
    json!({
        "objectType": "activity",
        "verb": "post",
        "id": format!("tag:fa.ke,2013:{id}"),
        "url": format!("https://fa.ke/post/{id}"),
        "actor": {"id": "tag:fa.ke,2013:foo"},
        "object": {
            "objectType": "note",
            "id": format!("tag:fa.ke,2013:{id}"),
            "url": format!("https://fa.ke/post/{id}"),
            "author": {"id": "tag:fa.ke,2013:foo"},
            "content": "foo bar",
        },
    })
}

/// A reply to `post` by someone else.
pub(crate) fn reply(id: &str, post_id: &str, content: &str) -> Value {
    json!({
        "objectType": "comment",
        "id": format!("tag:fa.ke,2013:{id}"),
        "url": format!("https://fa.ke/post/{post_id}#reply-{id}"),
        "author": {"id": "tag:fa.ke,2013:bob"},
        "content": content,
        "inReplyTo": [{"id": format!("tag:fa.ke,2013:{post_id}")}],
    })
}

pub(crate) fn with_replies(mut activity: Value, replies: Vec<Value>) -> Value {
    activity["object"]["replies"] = json!({"items": replies});
    activity
}
