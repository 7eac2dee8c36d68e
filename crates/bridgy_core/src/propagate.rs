/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! The propagate tasks: lease a response or blog post, send its webmentions
//! one target at a time, and record where each target ended up.

use crate::as1;
use crate::engine::Engine;
use crate::models::{
    dedupe, now_ms, BlogPost, Bucket, Response, ResponseType, Source, WebmentionStatus,
    Webmentions,
};
use crate::store::Lease;
use crate::task_queue::TaskOutcome;
use crate::urls::{self, TargetCheck};
use crate::webmention::SendOutcome;
use anyhow::Result;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

/// `https://<host>` for `host_url`, whatever scheme it was configured with.
pub fn public_base(host_url: &str) -> String {
    let trimmed = host_url.trim().trim_end_matches('/');
    match Url::parse(trimmed) {
        Ok(mut url) if url.host_str().is_some() => {
            if url.set_scheme("https").is_err() {
                let host = url.host_str().unwrap_or_default();
                let port = url.port().map(|p| format!(":{p}")).unwrap_or_default();
                warn!("host url {trimmed} can't be made https, using https://{host}{port}");
                return format!("https://{host}{port}");
            }
            url.set_path("");
            url.set_query(None);
            url.as_str().trim_end_matches('/').to_string()
        }
        _ => {
            let host = trimmed
                .trim_start_matches("https://")
                .trim_start_matches("http://");
            format!("https://{host}")
        }
    }
}

fn local_part(id: &str) -> String {
    urls::parse_tag_uri(id)
        .map(|(_, local)| local)
        .unwrap_or_else(|| id.to_string())
}

/// The Bridgy-hosted URL a receiver fetches to render `response` as it
/// appeared on `activity`.
pub fn response_source_url(
    base: &str,
    source: &Source,
    kind: ResponseType,
    response: &Value,
    activity: &Value,
) -> Option<String> {
    let post_id = as1::get_id(activity)
        .or_else(|| as1::get_id(as1::object_or_self(activity)))
        .map(local_part)?;
    let mut segments = vec![
        kind.as_str().to_string(),
        source.silo.short_name().to_string(),
        source.user_id.clone(),
        post_id,
    ];
    if kind != ResponseType::Post {
        let id = local_part(as1::get_id(response)?);
        match kind {
            ResponseType::Comment => segments.push(id),
            ResponseType::React => match id.split_once("_by_") {
                Some((head, responder)) => {
                    segments.push(responder.to_string());
                    segments.push(head.rsplit('_').next().unwrap_or(head).to_string());
                }
                None => {
                    segments.push(id.rsplit('_').next().unwrap_or(&id).to_string());
                    segments.push(as1::get_str(response, "content").unwrap_or_default().to_string());
                }
            },
            _ => segments.push(id.rsplit('_').next().unwrap_or(&id).to_string()),
        }
    }
    let path: Vec<String> = segments
        .iter()
        .map(|s| urlencoding::encode(s).into_owned())
        .collect();
    Some(format!("{base}/{}", path.join("/")))
}

async fn lease<T: Webmentions>(engine: &Engine, key: &str) -> Result<Lease<T>> {
    let key = key.to_string();
    let now = now_ms();
    engine.db.call(move |db| db.lease::<T>(&key, now)).await
}

/// Handles a `propagate` task.
pub async fn propagate_response(engine: &Engine, key: &str) -> TaskOutcome {
    let (mut response, source) = match lease::<Response>(engine, key).await {
        Ok(Lease::Acquired { entity, source }) => (entity, source),
        Ok(other) => return lease_outcome(key, other),
        Err(e) => return TaskOutcome::Failed(e),
    };
    match send_response(engine, &source, &mut response).await {
        Ok(()) => finish(engine, response).await,
        Err(e) => {
            release_after_failure(engine, response).await;
            TaskOutcome::Failed(e)
        }
    }
}

/// Handles a `propagate-blogpost` task.
pub async fn propagate_blogpost(engine: &Engine, key: &str) -> TaskOutcome {
    let (mut post, source) = match lease::<BlogPost>(engine, key).await {
        Ok(Lease::Acquired { entity, source }) => (entity, source),
        Ok(other) => return lease_outcome(key, other),
        Err(e) => return TaskOutcome::Failed(e),
    };

    let own: Vec<String> = post
        .targets
        .unsent
        .iter()
        .filter(|t| {
            urls::domain_from_link(t).is_some_and(|host| urls::domain_or_parent_in(&host, &source.domains))
        })
        .cloned()
        .collect();
    for target in own {
        debug!("{key}: not sending to own domain {target}");
        post.targets.unsent.retain(|t| *t != target);
        post.targets.push(Bucket::Skipped, target);
    }

    prepare_targets(engine, &mut post).await;
    let source_url = post.key.clone();
    send_targets(engine, &source, &mut post, |_| Ok(source_url.clone())).await;
    finish(engine, post).await
}

fn lease_outcome<T>(key: &str, lease: Lease<T>) -> TaskOutcome {
    match lease {
        Lease::Complete => {
            info!("{key} already propagated");
            TaskOutcome::Done
        }
        Lease::Busy { leased_until_ms } => {
            TaskOutcome::Retry(format!("{key} is leased until {leased_until_ms}"))
        }
        Lease::Missing(why) => {
            warn!("not propagating {key}: {why}");
            TaskOutcome::Done
        }
        Lease::Acquired { .. } => TaskOutcome::Done,
    }
}

async fn send_response(engine: &Engine, source: &Source, response: &mut Response) -> Result<()> {
    let activities = response.activities()?;
    let json = response.response()?;
    if !as1::is_public(&json) || activities.iter().any(|a| !as1::is_public(a)) {
        info!("{} is not public, marking complete without sending", response.key);
        for url in std::mem::take(&mut response.targets.unsent) {
            response.targets.push(Bucket::Skipped, url);
        }
        return Ok(());
    }

    prepare_targets(engine, response).await;

    let base = public_base(&engine.host_url);
    let kind = response.kind;
    let urls_to_activity = response.urls_to_activity.clone();
    let source_for = |target: &str| -> std::result::Result<String, String> {
        let index = if activities.len() > 1 {
            *urls_to_activity
                .as_ref()
                .and_then(|m| m.get(target))
                .ok_or_else(|| format!("no activity for target {target}"))?
        } else {
            0
        };
        let activity = activities
            .get(index)
            .ok_or_else(|| format!("no activity {index}"))?;
        response_source_url(&base, source, kind, &json, activity)
            .ok_or_else(|| "activity or response has no id".to_string())
    };
    send_targets(engine, source, response, source_for).await;
    Ok(())
}

/// Folds `error` and `failed` back into `unsent` and resolves every target
/// once, bucketing the ones that can't be sent to.
async fn prepare_targets<T: Webmentions>(engine: &Engine, entity: &mut T) {
    let targets = entity.targets_mut();
    let mut pending = std::mem::take(&mut targets.unsent);
    pending.append(&mut targets.error);
    pending.append(&mut targets.failed);

    for url in dedupe(pending) {
        if url.ends_with('…') {
            entity.targets_mut().push(Bucket::Failed, url);
            continue;
        }
        match engine.fetcher.webmention_target(&url).await {
            TargetCheck::Send(resolved) => {
                if !entity.targets_mut().push(Bucket::Unsent, resolved.clone()) {
                    debug!("{}: {url} resolved to already known {resolved}", entity.key());
                }
            }
            TargetCheck::TooLong(resolved) => {
                entity
                    .targets_mut()
                    .push(Bucket::Failed, urls::truncate_url(&resolved));
            }
            TargetCheck::Skip(reason) => {
                debug!("{}: skipping {url}: {reason}", entity.key());
                entity.targets_mut().push(Bucket::Skipped, url);
            }
        }
    }
}

async fn send_targets<T, F>(engine: &Engine, source: &Source, entity: &mut T, source_url: F)
where
    T: Webmentions,
    F: Fn(&str) -> std::result::Result<String, String>,
{
    let mut queue = std::mem::take(&mut entity.targets_mut().unsent);
    queue.sort();
    info!("{}: sending {} webmention(s)", entity.label(), queue.len());

    for target in queue {
        let outcome = match source_url(&target) {
            Ok(source_url) => {
                engine
                    .webmentions
                    .send_cached(&engine.endpoints, &source_url, &target)
                    .await
            }
            Err(why) => SendOutcome::Error(why),
        };
        let targets = entity.targets_mut();
        match outcome {
            SendOutcome::Sent { endpoint } => {
                info!("sent webmention to {target} via {endpoint}");
                targets.sent.push(target.clone());
                let key = source.key();
                let now = now_ms();
                let recorded = engine
                    .db
                    .call(move |db| db.record_source_webmention(&key, &target, Some(&endpoint), now))
                    .await;
                if let Err(e) = recorded {
                    warn!("couldn't record webmention on {}: {e:#}", source.key());
                }
            }
            SendOutcome::Skipped(why) => {
                debug!("skipped {target}: {why}");
                targets.skipped.push(target);
            }
            SendOutcome::Failed(why) => {
                info!("giving up on {target}: {why}");
                targets.failed.push(target);
            }
            SendOutcome::Error(why) => {
                warn!("error sending to {target}: {why}");
                targets.error.push(target);
            }
        }
    }
}

/// Completes the entity, or releases it as `error` when some targets
/// should be retried.
async fn finish<T: Webmentions>(engine: &Engine, entity: T) -> TaskOutcome {
    let now = now_ms();
    let errors = entity.targets().error.len();
    let retry = errors > 0;
    let stored = engine
        .db
        .call(move |db| {
            let mut entity = entity;
            if retry {
                db.release(&mut entity, WebmentionStatus::Error, now)
            } else {
                db.complete(&mut entity, now)
            }
        })
        .await;
    match stored {
        Err(e) => TaskOutcome::Failed(e),
        Ok(_) if retry => TaskOutcome::Retry(format!("{errors} target(s) errored")),
        Ok(_) => TaskOutcome::Done,
    }
}

async fn release_after_failure<T: Webmentions>(engine: &Engine, entity: T) {
    let key = entity.key().to_string();
    let now = now_ms();
    let released = engine
        .db
        .call(move |db| {
            let mut entity = entity;
            db.release(&mut entity, WebmentionStatus::Error, now)
        })
        .await;
    if let Err(e) = released {
        warn!("couldn't release {key}: {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint_cache::Endpoint;
    use crate::engine::tests::engine;
    use crate::models::{Targets, MINUTE_MS};
    use crate::silo::Silo;
    use crate::testutil::{self, post, reply, FakeSilo};
    use axum::{
        extract::State,
        http::{header as h, StatusCode as S},
        response::Html,
        routing::{get, post as post_route},
        Form, Router,
    };
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::{Arc, Mutex};

    type Received = Arc<Mutex<Vec<HashMap<String, String>>>>;

    const LINK: (h::HeaderName, &str) = (h::LINK, r#"</wm>; rel="webmention""#);

    fn site(received: Received) -> Router {
        Router::new()
            .route("/post", get(|| async { ([LINK], Html("<p>post</p>")) }))
            .route("/other", get(|| async { ([LINK], Html("<p>other</p>")) }))
            .route(
                "/redir/0",
                get(|| async { (S::MOVED_PERMANENTLY, [(h::LOCATION, "/post?utm_medium=x")]) }),
            )
            .route("/plain", get(|| async { Html("<p>no endpoint here</p>") }))
            .route(
                "/flaky",
                get(|| async { ([(h::LINK, r#"</wm-down>; rel="webmention""#)], Html("<p>flaky</p>")) }),
            )
            .route(
                "/rejects",
                get(|| async { ([(h::LINK, r#"</wm-reject>; rel="webmention""#)], Html("<p>rejects</p>")) }),
            )
            .route(
                "/wm",
                post_route(
                    |State(received): State<Received>, Form(form): Form<HashMap<String, String>>| async move {
                        received.lock().unwrap().push(form);
                        S::ACCEPTED
                    },
                ),
            )
            .route("/wm-down", post_route(|| async { S::SERVICE_UNAVAILABLE }))
            .route("/wm-reject", post_route(|| async { S::BAD_REQUEST }))
            .with_state(received)
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        engine: Engine,
        base: String,
        received: Received,
        source: Source,
    }

    async fn fixture() -> Fixture {
        let received: Received = Arc::default();
        let base = testutil::serve(site(received.clone())).await;
        let (dir, engine) = engine(Arc::new(FakeSilo::new()));
        let source = testutil::source_for(&base);
        engine.put_source(source.clone()).await.unwrap();
        Fixture {
            _dir: dir,
            engine,
            base,
            received,
            source,
        }
    }

    fn response(unsent: Vec<String>) -> Response {
        Response {
            key: "tag:fa.ke,2013:r1".to_string(),
            source_key: "mastodon:foo".to_string(),
            kind: ResponseType::Comment,
            activities_json: vec![as1::prune_activity(&post("url")).to_string()],
            response_json: as1::prune_response(&reply("r1", "url", "hi")).to_string(),
            urls_to_activity: None,
            original_posts: Vec::new(),
            old_response_jsons: Vec::new(),
            targets: Targets {
                unsent,
                ..Targets::default()
            },
            status: WebmentionStatus::New,
            leased_until_ms: None,
            created_ms: 0,
            updated_ms: 0,
        }
    }

    fn get_response(engine: &Engine) -> Response {
        engine.db.get::<Response>("tag:fa.ke,2013:r1").unwrap().unwrap()
    }

    #[test]
    fn source_urls_are_https_on_the_public_host() {
        let source = Source::new(Silo::Mastodon, "foo", 0);
        let act = post("123");
        let base = public_base("http://localhost:8080/");
        assert_eq!(base, "https://localhost:8080");
        assert_eq!(
            response_source_url(&base, &source, ResponseType::Comment, &reply("r1", "123", "x"), &act)
                .as_deref(),
            Some("https://localhost:8080/comment/mastodon/foo/123/r1")
        );
        assert_eq!(
            response_source_url(&base, &source, ResponseType::Post, &act, &act).as_deref(),
            Some("https://localhost:8080/post/mastodon/foo/123")
        );
        assert_eq!(public_base("brid.gy/"), "https://brid.gy");
        assert_eq!(public_base("foo://brid.gy/x?y"), "https://brid.gy");
        assert_eq!(public_base("foo://user@brid.gy:8443"), "https://brid.gy:8443");
        let like = json!({"id": "tag:fa.ke,2013:123_liked_by_bob"});
        assert_eq!(
            response_source_url("https://brid.gy", &source, ResponseType::Like, &like, &act).as_deref(),
            Some("https://brid.gy/like/mastodon/foo/123/bob")
        );
        let react = json!({"id": "tag:fa.ke,2013:123_wow_by_bob", "content": "😮"});
        assert_eq!(
            response_source_url("https://brid.gy", &source, ResponseType::React, &react, &act).as_deref(),
            Some("https://brid.gy/react/mastodon/foo/123/bob/wow")
        );
    }

    #[tokio::test]
    async fn sends_and_completes() {
        let f = fixture().await;
        let target = format!("{}/post", f.base);
        f.engine.db.put(&response(vec![target.clone()])).unwrap();

        let outcome = propagate_response(&f.engine, "tag:fa.ke,2013:r1").await;
        assert!(matches!(outcome, TaskOutcome::Done));

        let stored = get_response(&f.engine);
        assert_eq!(stored.status, WebmentionStatus::Complete);
        assert_eq!(stored.targets.sent, vec![target.clone()]);
        assert!(stored.targets.unsent.is_empty());
        assert_eq!(stored.leased_until_ms, None);

        let got = f.received.lock().unwrap().clone();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["source"], "https://brid.gy/comment/mastodon/foo/url/r1");
        assert_eq!(got[0]["target"], target);

        let source = f.engine.load_source(&f.source.key()).await.unwrap().unwrap();
        assert!(source.last_webmention_sent_ms.is_some());
        assert_eq!(source.webmention_endpoint, Some(format!("{}/wm", f.base)));

        // a second task for the same response is a no-op
        assert!(matches!(
            propagate_response(&f.engine, "tag:fa.ke,2013:r1").await,
            TaskOutcome::Done
        ));
        assert_eq!(f.received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn every_target_lands_in_one_bucket() {
        let f = fixture().await;
        // one host per target, so each discovers its own endpoint
        let plain = testutil::serve_at("127.0.0.2", site(Received::default())).await;
        let flaky = testutil::serve_at("127.0.0.3", site(Received::default())).await;
        let rejects = testutil::serve_at("127.0.0.4", site(Received::default())).await;
        let unsent = vec![
            format!("{}/post", f.base),
            format!("{plain}/plain"),
            format!("{flaky}/flaky"),
            format!("{rejects}/rejects"),
            "https://fa.ke/post/url".to_string(),
        ];
        f.engine.db.put(&response(unsent.clone())).unwrap();

        let outcome = propagate_response(&f.engine, "tag:fa.ke,2013:r1").await;
        assert_eq!(outcome.http_status(), 304);

        let stored = get_response(&f.engine);
        assert_eq!(stored.status, WebmentionStatus::Error);
        assert!(stored.targets.unsent.is_empty());
        assert_eq!(stored.targets.sent, vec![format!("{}/post", f.base)]);
        assert_eq!(stored.targets.error, vec![format!("{flaky}/flaky")]);
        assert_eq!(stored.targets.failed, vec![format!("{rejects}/rejects")]);
        let mut skipped = stored.targets.skipped.clone();
        skipped.sort();
        assert_eq!(skipped, vec![format!("{plain}/plain"), "https://fa.ke/post/url".to_string()]);

        let mut all: Vec<&String> = stored.targets.all().collect();
        all.sort();
        let mut expected: Vec<&String> = unsent.iter().collect();
        expected.sort();
        assert_eq!(all, expected);

        // the retry resends errors and failures, but not what was sent
        f.received.lock().unwrap().clear();
        propagate_response(&f.engine, "tag:fa.ke,2013:r1").await;
        assert!(f.received.lock().unwrap().is_empty());
        let again = get_response(&f.engine);
        assert_eq!(again.targets.sent.len(), 1);
        assert_eq!(again.targets.error, vec![format!("{flaky}/flaky")]);
        assert_eq!(again.targets.failed, vec![format!("{rejects}/rejects")]);
    }

    #[tokio::test]
    async fn pages_on_one_host_share_an_endpoint() {
        let f = fixture().await;
        // /rejects advertises /wm-reject, but /post was discovered first
        let unsent = vec![format!("{}/rejects", f.base), format!("{}/post", f.base)];
        f.engine.db.put(&response(unsent)).unwrap();

        let outcome = propagate_response(&f.engine, "tag:fa.ke,2013:r1").await;
        assert!(matches!(outcome, TaskOutcome::Done));
        let stored = get_response(&f.engine);
        assert_eq!(
            stored.targets.sent,
            vec![format!("{}/post", f.base), format!("{}/rejects", f.base)]
        );
        assert!(stored.targets.failed.is_empty());

        let got = f.received.lock().unwrap().clone();
        let targets: Vec<&str> = got.iter().map(|form| form["target"].as_str()).collect();
        assert_eq!(targets, [format!("{}/post", f.base), format!("{}/rejects", f.base)]);
        assert_eq!(
            f.engine.endpoints.get(&format!("{}/anything", f.base)),
            Some(Endpoint::Url(format!("{}/wm", f.base)))
        );
    }

    #[tokio::test]
    async fn redirected_target_is_sent_to_final_url() {
        let f = fixture().await;
        f.engine
            .db
            .put(&response(vec![format!("{}/redir/0?utm_source=y", f.base)]))
            .unwrap();
        propagate_response(&f.engine, "tag:fa.ke,2013:r1").await;

        let stored = get_response(&f.engine);
        assert_eq!(stored.targets.sent, vec![format!("{}/post", f.base)]);
        assert_eq!(f.received.lock().unwrap()[0]["target"], format!("{}/post", f.base));
    }

    #[tokio::test]
    async fn leased_response_is_left_alone() {
        let f = fixture().await;
        f.engine
            .db
            .put(&response(vec![format!("{}/post", f.base)]))
            .unwrap();

        // another worker took the lease a minute ago
        let held = match f.engine.db.lease::<Response>("tag:fa.ke,2013:r1", now_ms() - MINUTE_MS).unwrap() {
            Lease::Acquired { entity, .. } => entity,
            other => panic!("unexpected {other:?}"),
        };
        let before = get_response(&f.engine);
        assert_eq!(before.status, WebmentionStatus::Processing);
        assert!(before.leased_until_ms.unwrap() > now_ms());

        let outcome = propagate_response(&f.engine, "tag:fa.ke,2013:r1").await;
        assert_eq!(outcome.http_status(), 304);
        assert_eq!(get_response(&f.engine), before);
        assert!(f.received.lock().unwrap().is_empty());

        // the holder finishes; a retry sees it complete
        let mut done = held;
        done.targets.sent = std::mem::take(&mut done.targets.unsent);
        assert!(f.engine.db.complete(&mut done, now_ms()).unwrap());
        let outcome = propagate_response(&f.engine, "tag:fa.ke,2013:r1").await;
        assert_eq!(outcome.http_status(), 200);
        assert!(f.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn private_response_is_never_sent() {
        let f = fixture().await;
        let mut private = response(vec![format!("{}/post", f.base)]);
        let mut act = post("url");
        act["to"] = json!([{"objectType": "group", "alias": "@private"}]);
        private.activities_json = vec![as1::prune_activity(&act).to_string()];
        f.engine.db.put(&private).unwrap();

        assert!(matches!(
            propagate_response(&f.engine, "tag:fa.ke,2013:r1").await,
            TaskOutcome::Done
        ));
        let stored = get_response(&f.engine);
        assert_eq!(stored.status, WebmentionStatus::Complete);
        assert!(stored.targets.sent.is_empty());
        assert_eq!(stored.targets.skipped, vec![format!("{}/post", f.base)]);
        assert!(f.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn each_target_uses_its_own_activity() {
        let f = fixture().await;
        let mut resp = response(vec![format!("{}/post", f.base), format!("{}/other", f.base)]);
        resp.activities_json = vec![
            as1::prune_activity(&post("a1")).to_string(),
            as1::prune_activity(&post("a2")).to_string(),
        ];
        resp.urls_to_activity = Some(BTreeMap::from([(format!("{}/other", f.base), 1)]));
        f.engine.db.put(&resp).unwrap();

        let outcome = propagate_response(&f.engine, "tag:fa.ke,2013:r1").await;
        assert_eq!(outcome.http_status(), 304);
        let stored = get_response(&f.engine);
        assert_eq!(stored.targets.sent, vec![format!("{}/other", f.base)]);
        assert_eq!(stored.targets.error, vec![format!("{}/post", f.base)]);
        let got = f.received.lock().unwrap().clone();
        assert_eq!(got[0]["source"], "https://brid.gy/comment/mastodon/foo/a2/r1");
    }

    #[tokio::test]
    async fn blog_post_skips_own_domain() {
        let f = fixture().await;
        let mut blogger = f.source.clone();
        blogger.domains = vec!["localhost".to_string()];
        f.engine.put_source(blogger).await.unwrap();
        let own = format!("{}/other", f.base.replace("127.0.0.1", "localhost"));
        let elsewhere = format!("{}/post", f.base);

        let blog = BlogPost {
            key: format!("{own}-post"),
            source_key: f.source.key(),
            feed_item_json: None,
            targets: Targets {
                unsent: vec![own.clone(), elsewhere.clone()],
                ..Targets::default()
            },
            status: WebmentionStatus::New,
            leased_until_ms: None,
            created_ms: 0,
            updated_ms: 0,
        };
        f.engine.db.put(&blog).unwrap();

        let outcome = propagate_blogpost(&f.engine, &blog.key).await;
        assert!(matches!(outcome, TaskOutcome::Done));
        let stored = f.engine.db.get::<BlogPost>(&blog.key).unwrap().unwrap();
        assert_eq!(stored.status, WebmentionStatus::Complete);
        assert_eq!(stored.targets.skipped, vec![own]);
        assert_eq!(stored.targets.sent, vec![elsewhere]);
        let got = f.received.lock().unwrap().clone();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["source"], blog.key);
    }
}
