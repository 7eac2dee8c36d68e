/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Poll cadence and the sweep that keeps one poll task queued per source.

use crate::models::{format_poll_timestamp, Source, DAY_MS, HOUR_MS, MINUTE_MS, REFETCH_HFEED_TRIGGER};
use crate::store::BridgyDb;
use crate::task_queue::{TaskQueue, DEAD_TASK_RETENTION_MS};
use anyhow::Result;
use bridgy_protocol::{PollTask, QueueTask};
use rand::Rng;
use tracing::{debug, info, warn};

pub const FAST_POLL_MS: i64 = 30 * MINUTE_MS;
pub const SLOW_POLL_MS: i64 = 2 * HOUR_MS;
pub const RATE_LIMITED_POLL_MS: i64 = 30 * HOUR_MS;
pub const FAST_POLL_GRACE_PERIOD_MS: i64 = DAY_MS;
pub const RECENT_WEBMENTION_MS: i64 = 30 * DAY_MS;
pub const FAST_REFETCH_MS: i64 = 6 * HOUR_MS;
pub const SLOW_REFETCH_MS: i64 = 2 * DAY_MS;
pub const RECENT_SYNDICATION_MS: i64 = 14 * DAY_MS;

/// Sweep requeues a source once it's gone this long past its period.
const MIN_SWEEP_GAP_MS: i64 = 2 * HOUR_MS;

pub fn poll_period(source: &Source, now: i64) -> i64 {
    if source.rate_limited {
        return RATE_LIMITED_POLL_MS;
    }
    if now < source.created_ms + FAST_POLL_GRACE_PERIOD_MS {
        return FAST_POLL_MS;
    }
    match source.last_webmention_sent_ms {
        Some(sent) if sent > now - RECENT_WEBMENTION_MS => FAST_POLL_MS,
        _ => SLOW_POLL_MS,
    }
}

pub fn refetch_period(source: &Source, now: i64) -> i64 {
    match source.last_syndication_url_ms {
        Some(last) if last > now - RECENT_SYNDICATION_MS => FAST_REFETCH_MS,
        _ => SLOW_REFETCH_MS,
    }
}

/// Whether the poller should rerun OPD over the user's whole feed.
pub fn should_refetch(source: &Source, now: i64) -> bool {
    if source.last_hfeed_refetch_ms == REFETCH_HFEED_TRIGGER {
        return true;
    }
    if source.last_syndication_url_ms.is_none() {
        return false;
    }
    source.last_hfeed_refetch_ms + refetch_period(source, now) <= source.last_poll_attempt_ms
}

/// Whether a sweep should assume the source's poll task went missing.
pub fn is_overdue(source: &Source, now: i64) -> bool {
    let gap = (2 * poll_period(source, now)).max(MIN_SWEEP_GAP_MS);
    now - source.last_poll_attempt_ms > gap
}

/// `period` scaled by a uniform factor in [0.8, 1.2).
pub fn jittered(period: i64) -> i64 {
    let factor: f64 = rand::thread_rng().gen_range(0.8..1.2);
    (period as f64 * factor) as i64
}

pub fn poll_task(source: &Source) -> PollTask {
    PollTask {
        source_key: source.key(),
        last_polled: format_poll_timestamp(source.last_polled_ms),
    }
}

#[derive(Clone)]
pub struct Scheduler {
    db: BridgyDb,
    queue: TaskQueue,
}

impl Scheduler {
    pub fn new(db: BridgyDb, queue: TaskQueue) -> Self {
        Self { db, queue }
    }

    /// Queues the source's next poll, replacing any pending one. `immediate`
    /// uses the poll-now queue with no delay. Returns the ETA.
    pub async fn enqueue_poll(&self, source: &Source, immediate: bool, now: i64) -> Result<i64> {
        let task = poll_task(source);
        if immediate {
            self.queue.replace(&QueueTask::PollNow(task), now).await?;
            debug!("queued immediate poll for {}", source.key());
            return Ok(now);
        }
        let eta = now + jittered(poll_period(source, now));
        self.queue.replace(&QueueTask::Poll(task), eta).await?;
        debug!("queued poll for {} in {}s", source.key(), (eta - now) / 1000);
        Ok(eta)
    }

    /// Queues a poll for every listening source that looks forgotten and
    /// prunes long-dead tasks. Returns how many polls were queued.
    /// Per-source failures are left for the next sweep.
    pub async fn sweep(&self, now: i64) -> Result<usize> {
        match self.queue.prune_dead(now - DEAD_TASK_RETENTION_MS).await {
            Ok(0) => {}
            Ok(n) => info!("sweep pruned {n} dead task(s)"),
            Err(e) => warn!("sweep could not prune dead tasks: {e:#}"),
        }
        let sources = self.db.call(|db| db.listening_sources()).await?;
        let mut queued = 0;
        for source in sources {
            if !is_overdue(&source, now) {
                continue;
            }
            match self.enqueue_poll(&source, false, now).await {
                Ok(_) => queued += 1,
                Err(e) => warn!("sweep could not queue poll for {}: {e:#}", source.key()),
            }
        }
        if queued > 0 {
            info!("sweep queued {queued} poll task(s)");
        }
        Ok(queued)
    }
}
