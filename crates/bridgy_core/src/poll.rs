/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! The poll and discover tasks: fetch a source's recent activity from its
//! silo, turn the interactions into responses, and store them for sending.

use crate::as1;
use crate::engine::Engine;
use crate::models::{
    format_poll_timestamp, now_ms, Bucket, Feature, PollStatus, Response, ResponseType, Source,
    SourceStatus, WebmentionStatus, Webmentions,
};
use crate::opd::{self, Discovered, Relationships, Resolver, SourceUpdates};
use crate::scheduler;
use crate::silo::{classify, ActivitiesRequest, PollFailure, SiloAdapter, SiloError, BLOCKLIST_MAX_IDS};
use crate::task_queue::TaskOutcome;
use crate::urls::{self, TargetCheck};
use anyhow::anyhow;
use bridgy_protocol::{DiscoverTask, PollTask, QueueTask};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Timeline page size requested from the silo.
pub const POLL_ACTIVITY_COUNT: usize = 50;

#[derive(Debug, thiserror::Error)]
enum PollError {
    #[error(transparent)]
    Silo(#[from] SiloError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A response found while polling, and the activities it hangs off.
#[derive(Debug)]
struct Gathered {
    json: Value,
    /// Indexes into `Backfeed::activities`, most recent sighting first.
    activities: Vec<usize>,
    /// Set for activities backfed as mentions of the user.
    kind: Option<ResponseType>,
}

/// Everything one poll or discover run collected, before OPD.
#[derive(Debug, Default)]
struct Backfeed {
    activities: Vec<Value>,
    responses: BTreeMap<String, Gathered>,
    /// Extra mention targets per activity, from person tags naming the user.
    tagged: HashMap<usize, BTreeSet<String>>,
}

impl Backfeed {
    fn push_activity(&mut self, activity: Value) -> usize {
        self.activities.push(activity);
        self.activities.len() - 1
    }

    /// Adds a response, or merges it into one already seen under the same id.
    /// The later copy wins; activity lists are unioned.
    fn add(
        &mut self,
        adapter: &dyn SiloAdapter,
        blocked: &HashSet<String>,
        json: Value,
        activity: usize,
        kind: Option<ResponseType>,
    ) {
        let Some(id) = as1::get_id(&json).map(str::to_string) else {
            debug!("skipping response without id");
            return;
        };
        if let Some(author) = as1::author_id(&json).filter(|a| is_blocked(blocked, a)) {
            debug!("dropping {id}: author {author} is blocked");
            return;
        }
        match self.responses.get_mut(&id) {
            Some(existing) => {
                if adapter.activity_changed(&existing.json, &json) {
                    debug!("two different versions of response {id}, using the later one");
                }
                let mut activities = vec![activity];
                for a in existing.activities.drain(..) {
                    if !activities.contains(&a) {
                        activities.push(a);
                    }
                }
                existing.json = json;
                existing.activities = activities;
                if kind.is_some() {
                    existing.kind = kind;
                }
            }
            None => {
                self.responses.insert(
                    id,
                    Gathered {
                        json,
                        activities: vec![activity],
                        kind,
                    },
                );
            }
        }
    }

    /// Pulls the responses out of one of the user's activities.
    fn extract(
        &mut self,
        adapter: &dyn SiloAdapter,
        source: &Source,
        blocked: &HashSet<String>,
        idx: usize,
    ) {
        let activity = self.activities[idx].clone();
        let obj = as1::object_or_self(&activity);
        let user = adapter.user_tag_id(source);

        if as1::author_id(obj) != Some(user.as_str()) {
            let tag_urls: Vec<String> = as1::get_list(obj, "tags")
                .into_iter()
                .filter(|t| {
                    as1::get_str(t, "objectType") == Some("person")
                        && as1::get_id(t) == Some(user.as_str())
                })
                .flat_map(as1::object_urls)
                .collect();
            if !tag_urls.is_empty() {
                debug!("{} mentions the user", as1::get_id(&activity).unwrap_or("?"));
                self.tagged.entry(idx).or_default().extend(tag_urls);
                self.add(adapter, blocked, activity.clone(), idx, Some(ResponseType::Post));
            }
        }

        let quotes_user = as1::get_list(obj, "attachments").into_iter().any(|att| {
            matches!(as1::get_str(att, "objectType"), Some("note" | "article"))
                && as1::author_id(att) == Some(user.as_str())
        });
        if quotes_user {
            debug!("{} quotes the user", as1::get_id(&activity).unwrap_or("?"));
            self.add(adapter, blocked, activity.clone(), idx, Some(ResponseType::Post));
        }

        let mut found: Vec<Value> = Vec::new();
        if let Some(replies) = obj.get("replies") {
            found.extend(as1::get_list(replies, "items").into_iter().cloned());
        }
        for tag in as1::get_list(obj, "tags") {
            if matches!(as1::get_str(tag, "verb"), Some("like" | "react" | "share")) {
                found.push(tag.clone());
            }
        }
        found.extend(adapter.get_rsvps_from_event(obj));

        for resp in found {
            self.add(adapter, blocked, resp, idx, None);
        }
    }

    /// Drops responses identical to what the previous poll stored. Returns
    /// the seen entries that were kept.
    fn drop_seen(&mut self, adapter: &dyn SiloAdapter, seen: &[Value]) -> Vec<Value> {
        let mut unchanged = Vec::new();
        for cached in seen {
            let Some(id) = as1::get_id(cached) else {
                continue;
            };
            let same = self
                .responses
                .get(id)
                .is_some_and(|g| !adapter.activity_changed(cached, &g.json));
            if same {
                self.responses.remove(id);
                unchanged.push(cached.clone());
            }
        }
        unchanged
    }
}

fn is_blocked(blocked: &HashSet<String>, id: &str) -> bool {
    if blocked.contains(id) {
        return true;
    }
    urls::parse_tag_uri(id).is_some_and(|(_, local)| blocked.contains(&local))
}

fn published_ms(obj: &Value) -> Option<i64> {
    let text = as1::get_str(obj, "published")?;
    let dt = OffsetDateTime::parse(text, &Rfc3339).ok()?;
    Some((dt.unix_timestamp_nanos() / 1_000_000) as i64)
}

/// The silo-local id of an activity, unwrapping tag URIs.
fn local_id(activity: &Value) -> Option<String> {
    let id = as1::get_id(activity)?;
    Some(
        urls::parse_tag_uri(id)
            .map(|(_, local)| local)
            .unwrap_or_else(|| id.to_string()),
    )
}

/// Source fields owned by the poller, copied onto a freshly read row so
/// concurrent writers (the sender's `last_webmention_sent`) aren't lost.
fn copy_poll_fields(from: &Source, to: &mut Source) {
    to.status = from.status;
    to.poll_status = from.poll_status;
    to.rate_limited = from.rate_limited;
    to.last_polled_ms = from.last_polled_ms;
    to.last_poll_attempt_ms = from.last_poll_attempt_ms;
    to.last_activity_id = from.last_activity_id.clone();
    to.last_activities_etag = from.last_activities_etag.clone();
    to.last_activities_cache = from.last_activities_cache.clone();
    to.last_public_post_ms = from.last_public_post_ms;
    to.recent_private_posts = from.recent_private_posts;
    to.last_syndication_url_ms = from.last_syndication_url_ms;
    to.last_feed_syndication_url_ms = from.last_feed_syndication_url_ms;
    to.last_hfeed_refetch_ms = from.last_hfeed_refetch_ms;
    to.seen_responses_cache = from.seen_responses_cache.clone();
    to.blocked_ids = from.blocked_ids.clone();
    to.domains = from.domains.clone();
}

async fn save_poll_fields(engine: &Engine, source: &Source) -> anyhow::Result<()> {
    let snapshot = source.clone();
    engine
        .db
        .call(move |db| db.update_source(&snapshot.key(), |s| copy_poll_fields(&snapshot, s)))
        .await?;
    Ok(())
}

/// Loads the task's source, or says why the task has nothing to do.
async fn listening_source(
    engine: &Engine,
    key: &str,
) -> Result<(Source, Arc<dyn SiloAdapter>), TaskOutcome> {
    let source = match engine.load_source(key).await {
        Ok(Some(source)) => source,
        Ok(None) => {
            warn!("source {key} not found");
            return Err(TaskOutcome::Done);
        }
        Err(e) => return Err(TaskOutcome::Failed(e)),
    };
    if !source.is_enabled() || !source.has_feature(Feature::Listen) {
        info!("{} is disabled or not listening, skipping", source.label());
        return Err(TaskOutcome::Done);
    }
    let Some(adapter) = engine.adapter(&source) else {
        warn!("no silo adapter registered for {}", source.silo.short_name());
        return Err(TaskOutcome::Done);
    };
    Ok((source, adapter))
}

/// Handles a `poll` or `poll-now` task.
pub async fn run_poll(engine: &Engine, task: &PollTask) -> TaskOutcome {
    let (mut source, adapter) = match listening_source(engine, &task.source_key).await {
        Ok(found) => found,
        Err(outcome) => return outcome,
    };
    let current = format_poll_timestamp(source.last_polled_ms);
    if task.last_polled != current {
        warn!(
            "duplicate poll task for {}: last_polled {} != {current}",
            source.key(),
            task.last_polled
        );
        return TaskOutcome::Done;
    }

    let now = now_ms();
    source.poll_status = PollStatus::Polling;
    source.last_poll_attempt_ms = now;
    source.rate_limited = false;
    if let Err(e) = save_poll_fields(engine, &source).await {
        return TaskOutcome::Failed(e);
    }
    info!("polling {} ({})", source.key(), source.label());

    let outcome = match poll(engine, &adapter, &mut source, now).await {
        Ok(()) => {
            source.poll_status = PollStatus::Ok;
            source.last_polled_ms = source.last_poll_attempt_ms;
            TaskOutcome::Done
        }
        Err(PollError::Silo(e)) => match classify(adapter.as_ref(), &e) {
            PollFailure::AuthRevoked => {
                warn!("disabling {}: {e}", source.key());
                source.status = SourceStatus::Disabled;
                source.poll_status = PollStatus::Ok;
                TaskOutcome::Done
            }
            PollFailure::RateLimited => {
                warn!("rate limited polling {}: {e}", source.key());
                source.rate_limited = true;
                source.poll_status = PollStatus::Error;
                TaskOutcome::Done
            }
            PollFailure::Transient => {
                source.poll_status = PollStatus::Error;
                TaskOutcome::Retry(format!("silo unavailable: {e}"))
            }
            PollFailure::Fatal => {
                source.poll_status = PollStatus::Error;
                TaskOutcome::Failed(anyhow!(e))
            }
        },
        Err(PollError::Other(e)) => {
            source.poll_status = PollStatus::Error;
            TaskOutcome::Failed(e)
        }
    };

    if let Err(e) = save_poll_fields(engine, &source).await {
        return TaskOutcome::Failed(e);
    }
    if matches!(outcome, TaskOutcome::Done) && source.is_enabled() {
        if let Err(e) = engine.scheduler.enqueue_poll(&source, false, now_ms()).await {
            warn!("could not queue next poll for {}: {e:#}", source.key());
        }
    }
    outcome
}

async fn poll(
    engine: &Engine,
    adapter: &Arc<dyn SiloAdapter>,
    source: &mut Source,
    now: i64,
) -> Result<(), PollError> {
    if adapter.has_blocks() {
        match adapter.get_blocklist_ids(source).await {
            Ok(mut ids) => {
                ids.truncate(BLOCKLIST_MAX_IDS);
                source.blocked_ids = ids;
            }
            Err(e) => warn!("couldn't fetch blocklist for {}: {e}", source.key()),
        }
    }
    let blocked: HashSet<String> = source.blocked_ids.iter().cloned().collect();

    let links = adapter.search_for_links(source).await?;
    let mut cache = source.last_activities_cache.clone();
    let req = ActivitiesRequest {
        fetch_replies: true,
        fetch_likes: true,
        fetch_shares: true,
        fetch_mentions: true,
        count: POLL_ACTIVITY_COUNT,
        etag: source.last_activities_etag.clone(),
        min_id: source.last_activity_id.clone(),
        ..ActivitiesRequest::default()
    };
    let resp = adapter.get_activities_response(source, &req, &mut cache).await?;
    let timeline = resp.items;
    if let Some(etag) = resp.etag {
        source.last_activities_etag = Some(etag);
    }
    debug!("{} gave {} activities and {} links", source.key(), timeline.len(), links.len());

    let user = adapter.user_tag_id(source);
    let mut ids = HashSet::new();
    let mut private = 0;
    for activity in &timeline {
        if let Some(id) = local_id(activity) {
            let newer = match &source.last_activity_id {
                Some(last) => urls::compare_ids(&id, last) == Ordering::Greater,
                None => true,
            };
            if newer {
                source.last_activity_id = Some(id.clone());
            }
            ids.insert(id);
        }
        if as1::author_id(as1::object_or_self(activity)) == Some(user.as_str()) {
            if as1::is_public(activity) {
                let published = published_ms(as1::object_or_self(activity));
                if published > source.last_public_post_ms {
                    source.last_public_post_ms = published;
                }
            } else {
                private += 1;
            }
        }
    }
    if !timeline.is_empty() {
        source.recent_private_posts = private;
    }
    cache.retain(|key, _| key.split_whitespace().last().is_some_and(|t| ids.contains(t)));
    source.last_activities_cache = cache;

    let mut backfeed = Backfeed::default();
    let mut scan = Vec::new();
    for link in links {
        if !as1::is_public(&link) {
            continue;
        }
        let own = as1::author_id(as1::object_or_self(&link)) == Some(user.as_str());
        let idx = backfeed.push_activity(link.clone());
        if own {
            scan.push(idx);
        } else {
            backfeed.add(adapter.as_ref(), &blocked, link, idx, None);
        }
    }
    for activity in timeline {
        if !as1::is_public(&activity) {
            debug!("skipping non-public activity {}", as1::get_id(&activity).unwrap_or("?"));
            continue;
        }
        scan.push(backfeed.push_activity(activity));
    }
    for idx in scan {
        backfeed.extract(adapter.as_ref(), source, &blocked, idx);
    }

    let unchanged = backfeed.drop_seen(adapter.as_ref(), &source.seen_responses_cache);
    let mut updates = SourceUpdates::default();
    let mut pruned = store_responses(engine, adapter, source, backfeed, false, &mut updates).await?;
    if !pruned.is_empty() {
        pruned.extend(unchanged);
        source.seen_responses_cache = pruned;
    }
    updates.apply(source);

    if scheduler::should_refetch(source, now) {
        info!("refetching h-feed for {}", source.key());
        let mut refetch_updates = SourceUpdates::default();
        let relationships = {
            let mut resolver = Resolver::new(&engine.db, &engine.fetcher, adapter.as_ref(), source);
            resolver.refetch(&mut refetch_updates).await?
        };
        refetch_updates.apply(source);
        source.last_hfeed_refetch_ms = now;
        if !relationships.is_empty() {
            repropagate_old_responses(engine, adapter, source, &relationships).await?;
        }
    }
    Ok(())
}

/// Runs OPD for each gathered response and stores it. Returns the pruned
/// JSON of every response stored.
async fn store_responses(
    engine: &Engine,
    adapter: &Arc<dyn SiloAdapter>,
    source: &Source,
    backfeed: Backfeed,
    restart: bool,
    updates: &mut SourceUpdates,
) -> anyhow::Result<Vec<Value>> {
    let Backfeed {
        activities,
        responses,
        tagged,
    } = backfeed;
    let filter = engine.fetcher.filter();
    let gated = adapter.backfeed_requires_syndication_link();
    let mut discovered: HashMap<usize, Discovered> = HashMap::new();
    let mut resolver = Resolver::new(&engine.db, &engine.fetcher, adapter.as_ref(), source);
    let mut pruned = Vec::new();

    for (id, gathered) in responses {
        let kind = gathered.kind.unwrap_or_else(|| as1::get_type(&gathered.json));
        let mut kept: Vec<usize> = Vec::new();
        let mut urls_to_activity: BTreeMap<String, usize> = BTreeMap::new();
        let mut too_long: BTreeSet<String> = BTreeSet::new();
        let mut originals: BTreeSet<String> = BTreeSet::new();

        for idx in gathered.activities {
            if !discovered.contains_key(&idx) {
                let mut found = resolver.discover(&activities[idx], true, updates).await?;
                if let Some(extra) = tagged.get(&idx) {
                    found.mentions.extend(extra.iter().cloned());
                }
                discovered.insert(idx, found);
            }
            let Some(found) = discovered.get(&idx) else {
                continue;
            };
            if gated && kind != ResponseType::Post && found.originals.is_empty() {
                debug!("{id}: activity has no syndication link back, skipping it");
                continue;
            }
            let pos = kept.len();
            kept.push(idx);
            originals.extend(found.originals.iter().cloned());
            for target in opd::targets_for_response(kind, &found.originals, &found.mentions) {
                match filter.check(&target) {
                    TargetCheck::Send(url) => {
                        urls_to_activity.insert(url, pos);
                    }
                    TargetCheck::TooLong(url) => {
                        too_long.insert(urls::truncate_url(&url));
                    }
                    TargetCheck::Skip(reason) => debug!("{id}: dropping target {target}: {reason}"),
                }
            }
        }
        if kept.is_empty() {
            continue;
        }

        let mut response = Response {
            key: id.clone(),
            source_key: source.key(),
            kind,
            activities_json: kept
                .iter()
                .map(|idx| as1::prune_activity(&activities[*idx]).to_string())
                .collect(),
            response_json: as1::prune_response(&gathered.json).to_string(),
            urls_to_activity: None,
            original_posts: originals.into_iter().collect(),
            old_response_jsons: Vec::new(),
            targets: Default::default(),
            status: WebmentionStatus::New,
            leased_until_ms: None,
            created_ms: 0,
            updated_ms: 0,
        };
        response.targets.unsent = urls_to_activity.keys().cloned().collect();
        for url in too_long {
            response.targets.push(Bucket::Failed, url);
        }
        if kept.len() > 1 {
            response.urls_to_activity = Some(urls_to_activity);
        }
        debug!(
            "{id}: {} with {} target(s)",
            kind.as_str(),
            response.targets.unsent.len()
        );
        engine.get_or_save(adapter, response, restart).await?;
        pruned.push(as1::prune_response(&gathered.json));
    }
    Ok(pruned)
}

/// Reopens stored responses whose activities gained originals in a refetch.
async fn repropagate_old_responses(
    engine: &Engine,
    adapter: &Arc<dyn SiloAdapter>,
    source: &Source,
    relationships: &Relationships,
) -> anyhow::Result<()> {
    let key = source.key();
    let responses = engine.db.call(move |db| db.responses_for_source(&key)).await?;
    for mut response in responses {
        let mut new_originals: Vec<String> = Vec::new();
        for activity in response.activities()? {
            let mut activity_urls = as1::object_urls(&activity);
            activity_urls.extend(as1::object_urls(as1::object_or_self(&activity)));
            for url in activity_urls {
                let Some(synd) = adapter.canonicalize_url(&url) else {
                    continue;
                };
                for post in relationships.get(&synd).into_iter().flatten() {
                    let Some(original) = &post.original else {
                        continue;
                    };
                    if !response.targets.sent.contains(original)
                        && !response.original_posts.contains(original)
                        && !new_originals.contains(original)
                    {
                        new_originals.push(original.clone());
                    }
                }
            }
        }
        if new_originals.is_empty() {
            continue;
        }
        info!("found new original(s) {new_originals:?} for {}", response.key);
        for original in &new_originals {
            response.targets.push(Bucket::Unsent, original.clone());
        }
        response.original_posts.extend(new_originals);
        response.set_status(WebmentionStatus::New);
        response.set_leased_until_ms(None);
        response.touch(now_ms());
        let stored = response.clone();
        engine.db.call(move |db| db.put(&stored)).await?;
        engine.enqueue_propagate(&response.key).await?;
    }
    Ok(())
}

/// Handles a `discover` task: backfeed for one silo post, restarting any
/// responses already stored for it.
pub async fn run_discover(engine: &Engine, task: &DiscoverTask) -> TaskOutcome {
    let (source, adapter) = match listening_source(engine, &task.source_key).await {
        Ok(found) => found,
        Err(outcome) => return outcome,
    };
    match discover(engine, &adapter, &source, task).await {
        Ok(()) => TaskOutcome::Done,
        Err(PollError::Silo(e)) => match classify(adapter.as_ref(), &e) {
            PollFailure::AuthRevoked => {
                warn!("disabling {}: {e}", source.key());
                let key = source.key();
                let disabled = engine
                    .db
                    .call(move |db| db.update_source(&key, |s| s.status = SourceStatus::Disabled))
                    .await;
                match disabled {
                    Ok(_) => TaskOutcome::Done,
                    Err(e) => TaskOutcome::Failed(e),
                }
            }
            PollFailure::RateLimited | PollFailure::Transient => {
                TaskOutcome::Retry(format!("silo unavailable: {e}"))
            }
            PollFailure::Fatal => TaskOutcome::Failed(anyhow!(e)),
        },
        Err(PollError::Other(e)) => TaskOutcome::Failed(e),
    }
}

async fn discover(
    engine: &Engine,
    adapter: &Arc<dyn SiloAdapter>,
    source: &Source,
    task: &DiscoverTask,
) -> Result<(), PollError> {
    let activities = if task.kind.as_deref() == Some("event") {
        adapter
            .get_event(source, &task.post_id)
            .await?
            .into_iter()
            .collect::<Vec<_>>()
    } else {
        let req = ActivitiesRequest {
            activity_id: Some(task.post_id.clone()),
            fetch_replies: true,
            fetch_likes: true,
            fetch_shares: true,
            ..ActivitiesRequest::default()
        };
        let mut cache = BTreeMap::new();
        adapter
            .get_activities_response(source, &req, &mut cache)
            .await?
            .items
    };
    if activities.is_empty() {
        info!("{} post {} not found", source.key(), task.post_id);
        return Ok(());
    }

    let blocked: HashSet<String> = source.blocked_ids.iter().cloned().collect();
    let mut backfeed = Backfeed::default();
    let mut parents = BTreeSet::new();
    for activity in activities {
        if !as1::is_public(&activity) {
            info!("{} post {} isn't public, skipping", source.key(), task.post_id);
            continue;
        }
        for parent in as1::in_reply_to_ids(as1::object_or_self(&activity)) {
            if let Some((domain, id)) = urls::parse_tag_uri(&parent) {
                if urls::hosts_match(&domain, adapter.domain()) && id != task.post_id {
                    parents.insert(id);
                }
            }
        }
        let idx = backfeed.push_activity(activity.clone());
        backfeed.add(adapter.as_ref(), &blocked, activity, idx, Some(ResponseType::Post));
        backfeed.extract(adapter.as_ref(), source, &blocked, idx);
    }

    let mut updates = SourceUpdates::default();
    store_responses(engine, adapter, source, backfeed, true, &mut updates).await?;
    if !updates.is_empty() {
        let key = source.key();
        engine
            .db
            .call(move |db| db.update_source(&key, |s| updates.apply(s)))
            .await?;
    }

    for parent in parents {
        debug!("queueing discover for parent post {parent}");
        let queued = QueueTask::Discover(DiscoverTask {
            source_key: source.key(),
            post_id: parent,
            kind: None,
        });
        engine.queue.enqueue(&queued, now_ms()).await?;
    }
    Ok(())
}
