/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Shared context for the task handlers, and the per-queue dispatcher.

use crate::endpoint_cache::EndpointCache;
use crate::http_fetch::HttpFetcher;
use crate::models::{
    now_ms, Bucket, Feature, Response, Source, SourceStatus, WebmentionStatus, Webmentions,
    REFETCH_HFEED_TRIGGER,
};
use crate::scheduler::Scheduler;
use crate::silo::{SiloAdapter, SiloRegistry};
use crate::store::BridgyDb;
use crate::task_queue::{TaskHandler, TaskOutcome, TaskQueue};
use crate::urls::BetaUsers;
use crate::webmention::WebmentionClient;
use crate::{as1, poll, propagate};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bridgy_protocol::{PropagateTask, QueueTask};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_HOST_URL: &str = "https://brid.gy";

pub struct Engine {
    pub db: BridgyDb,
    pub queue: TaskQueue,
    pub scheduler: Scheduler,
    pub fetcher: HttpFetcher,
    pub webmentions: WebmentionClient,
    pub silos: SiloRegistry,
    pub endpoints: Arc<EndpointCache>,
    /// Canonical public host that `source` URLs are rewritten to.
    pub host_url: String,
    pub beta_users: BetaUsers,
}

impl Engine {
    pub fn new(
        db: BridgyDb,
        queue: TaskQueue,
        fetcher: HttpFetcher,
        silos: SiloRegistry,
        endpoints: Arc<EndpointCache>,
        host_url: impl Into<String>,
    ) -> Result<Self> {
        let webmentions = WebmentionClient::new(fetcher.clone())?;
        let scheduler = Scheduler::new(db.clone(), queue.clone());
        Ok(Self {
            db,
            queue,
            scheduler,
            fetcher,
            webmentions,
            silos,
            endpoints,
            host_url: host_url.into(),
            beta_users: BetaUsers::default(),
        })
    }

    pub fn with_beta_users(mut self, beta_users: BetaUsers) -> Self {
        self.beta_users = beta_users;
        self
    }

    pub fn adapter(&self, source: &Source) -> Option<Arc<dyn SiloAdapter>> {
        self.silos.get(source.silo)
    }

    pub async fn load_source(&self, key: &str) -> Result<Option<Source>> {
        let key = key.to_string();
        self.db.call(move |db| db.get_source(&key)).await
    }

    pub async fn put_source(&self, source: Source) -> Result<()> {
        self.db.call(move |db| db.put_source(&source)).await
    }

    /// Creates or refreshes a source and queues an immediate poll for it.
    /// Cursors and caches of an existing source are kept.
    pub async fn add_source(&self, incoming: Source) -> Result<Source> {
        let now = now_ms();
        let source = match self.load_source(&incoming.key()).await? {
            Some(mut existing) => {
                existing.name = incoming.name;
                existing.url = incoming.url;
                existing.picture = incoming.picture;
                existing.credentials = incoming.credentials;
                existing.features = incoming.features;
                existing.domain_urls = incoming.domain_urls;
                existing.domains = incoming.domains;
                existing.status = SourceStatus::Enabled;
                existing.updated_ms = now;
                existing
            }
            None => incoming,
        };
        self.put_source(source.clone()).await?;
        info!("added source {} ({})", source.key(), source.label());
        if self.beta_users.contains(&source.bridgy_path()) {
            debug!("{} is a beta user", source.bridgy_path());
        }
        if source.has_feature(Feature::Listen) {
            self.scheduler.enqueue_poll(&source, true, now).await?;
        }
        Ok(source)
    }

    /// Disables a source. Its pending tasks become no-ops.
    pub async fn delete_source(&self, key: &str) -> Result<bool> {
        let k = key.to_string();
        let now = now_ms();
        let updated = self
            .db
            .call(move |db| {
                db.update_source(&k, |s| {
                    s.status = SourceStatus::Disabled;
                    s.updated_ms = now;
                })
            })
            .await?;
        if updated.is_some() {
            info!("disabled source {key}");
        }
        Ok(updated.is_some())
    }

    /// Polls a source right away and forces a full h-feed refetch.
    pub async fn crawl_now(&self, key: &str) -> Result<bool> {
        let k = key.to_string();
        let updated = self
            .db
            .call(move |db| db.update_source(&k, |s| s.last_hfeed_refetch_ms = REFETCH_HFEED_TRIGGER))
            .await?;
        let Some(source) = updated else {
            return Ok(false);
        };
        self.scheduler.enqueue_poll(&source, true, now_ms()).await?;
        Ok(true)
    }

    pub async fn enqueue_propagate(&self, response_key: &str) -> Result<()> {
        let task = QueueTask::Propagate(PropagateTask {
            response_key: response_key.to_string(),
        });
        self.queue.replace(&task, now_ms()).await?;
        Ok(())
    }

    /// Stores a polled response, merging it into the existing record.
    /// Changed responses are restarted; so is any existing one when
    /// `restart` is set. Queues a propagate task when there's work.
    pub async fn get_or_save(
        &self,
        adapter: &Arc<dyn SiloAdapter>,
        response: Response,
        restart: bool,
    ) -> Result<Response> {
        let now = now_ms();
        let changed_adapter = adapter.clone();
        let outcome = self
            .db
            .call(move |db| {
                db.save_response(response, now, &|a, b| changed_adapter.activity_changed(a, b))
            })
            .await?;

        if outcome.changed || (restart && outcome.existed) {
            return self.restart(adapter, outcome.response).await;
        }
        if outcome.propagate {
            self.enqueue_propagate(&outcome.response.key).await?;
        } else {
            debug!("nothing new to send for {}", outcome.response.key);
        }
        Ok(outcome.response)
    }

    /// Resends every target of a response, plus originals of any known
    /// syndicated copies of its activities.
    pub async fn restart(
        &self,
        adapter: &Arc<dyn SiloAdapter>,
        mut response: Response,
    ) -> Result<Response> {
        let syndications: Vec<String> = response
            .activities()?
            .iter()
            .flat_map(|a| {
                let mut urls = as1::object_urls(a);
                urls.extend(as1::object_urls(as1::object_or_self(a)));
                urls
            })
            .filter_map(|u| adapter.canonicalize_url(&u))
            .collect();
        let originals = if syndications.is_empty() {
            Vec::new()
        } else {
            self.db
                .call(move |db| db.originals_for_syndications(&syndications))
                .await?
        };
        for original in originals {
            response.targets.push(Bucket::Unsent, original);
        }
        response.targets.reset_all_to_unsent();
        for target in &response.targets.unsent {
            self.endpoints.evict(target);
            self.fetcher.redirect_cache().evict(target);
        }
        response.set_status(WebmentionStatus::New);
        response.set_leased_until_ms(None);
        response.touch(now_ms());

        let stored = response.clone();
        self.db
            .call(move |db| db.put(&stored))
            .await
            .with_context(|| format!("restart {}", response.key))?;
        info!(
            "restarted {} with {} target(s)",
            response.key,
            response.targets.unsent.len()
        );
        self.enqueue_propagate(&response.key).await?;
        Ok(response)
    }
}

#[async_trait]
impl TaskHandler for Engine {
    async fn handle(&self, task: QueueTask) -> TaskOutcome {
        let queue = task.queue();
        let subject = task.subject().to_string();
        let outcome = match task {
            QueueTask::Poll(t) | QueueTask::PollNow(t) => poll::run_poll(self, &t).await,
            QueueTask::Discover(t) => poll::run_discover(self, &t).await,
            QueueTask::Propagate(t) => propagate::propagate_response(self, &t.response_key).await,
            QueueTask::PropagateBlogpost(t) => propagate::propagate_blogpost(self, &t.key).await,
        };
        match &outcome {
            TaskOutcome::Done => info!("{queue} {subject}: done"),
            TaskOutcome::Retry(reason) => warn!("{queue} {subject}: retry: {reason}"),
            TaskOutcome::Failed(e) => warn!("{queue} {subject}: failed: {e:#}"),
        }
        outcome
    }
}
