/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::models::now_ms;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bridgy_protocol::{QueueName, QueueTask};
use futures_util::stream::{self, StreamExt};
use rand::{rngs::OsRng, RngCore};
use rusqlite::{params, Connection};
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

const STATUS_PENDING: i64 = 0;
const STATUS_RUNNING: i64 = 1;
const STATUS_DEAD: i64 = 3;

/// Dead tasks are kept this long for inspection, then pruned by the sweep.
pub const DEAD_TASK_RETENTION_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// Durable named queues of tasks with an ETA, retried with backoff.
#[derive(Clone)]
pub struct TaskQueue {
    db_path: PathBuf,
    notify: Arc<Notify>,
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub max_attempts: u32,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub tick_ms: u64,
    pub batch: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_backoff_secs: 5,
            max_backoff_secs: 3600,
            tick_ms: 2000,
            batch: 20,
        }
    }
}

/// How a task handler finished. The HTTP layer maps these to 200 / 304 / 500.
#[derive(Debug)]
pub enum TaskOutcome {
    Done,
    /// Classified transient failure; retry later.
    Retry(String),
    Failed(anyhow::Error),
}

impl TaskOutcome {
    pub fn http_status(&self) -> u16 {
        match self {
            TaskOutcome::Done => 200,
            TaskOutcome::Retry(_) => 304,
            TaskOutcome::Failed(_) => 500,
        }
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: QueueTask) -> TaskOutcome;
}

#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub id: String,
    pub task: QueueTask,
    pub eta_ms: i64,
    pub attempt: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub running: u64,
    pub dead: u64,
}

impl TaskQueue {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        init_db(&db_path)?;
        Ok(Self {
            db_path,
            notify: Arc::new(Notify::new()),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub async fn enqueue(&self, task: &QueueTask, eta_ms: i64) -> Result<String> {
        let id = tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let task = task.clone();
            move || -> Result<String> {
                let conn = Connection::open(db_path)?;
                insert_task(&conn, &task, eta_ms)
            }
        })
        .await??;
        self.notify.notify_one();
        Ok(id)
    }

    /// Enqueues `task`, dropping any pending task on the same queue for the
    /// same subject, so at most one stays pending.
    pub async fn replace(&self, task: &QueueTask, eta_ms: i64) -> Result<String> {
        let id = tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let task = task.clone();
            move || -> Result<String> {
                let mut conn = Connection::open(db_path)?;
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM tasks WHERE queue = ?1 AND subject = ?2 AND status = ?3",
                    params![task.queue().as_str(), task.subject(), STATUS_PENDING],
                )?;
                let id = insert_task(&tx, &task, eta_ms)?;
                tx.commit()?;
                Ok(id)
            }
        })
        .await??;
        self.notify.notify_one();
        Ok(id)
    }

    pub async fn has_pending(&self, queue: QueueName, subject: &str) -> Result<bool> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let subject = subject.to_string();
            move || -> Result<bool> {
                let conn = Connection::open(db_path)?;
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM tasks WHERE queue = ?1 AND subject = ?2 AND status = ?3",
                    params![queue.as_str(), subject, STATUS_PENDING],
                    |r| r.get(0),
                )?;
                Ok(n > 0)
            }
        })
        .await?
    }

    /// Pending tasks on `queue`, soonest first.
    pub async fn pending(&self, queue: QueueName) -> Result<Vec<QueuedTask>> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<Vec<QueuedTask>> {
                let conn = Connection::open(db_path)?;
                let mut stmt = conn.prepare(
                    "SELECT id, payload_json, eta_ms, attempt FROM tasks
                     WHERE queue = ?1 AND status = ?2 ORDER BY eta_ms, created_ms",
                )?;
                let mut rows = stmt.query(params![queue.as_str(), STATUS_PENDING])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(read_task(row)?);
                }
                Ok(out)
            }
        })
        .await?
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<QueueStats> {
                let conn = Connection::open(db_path)?;
                let count = |status: i64| -> Result<u64> {
                    Ok(conn.query_row(
                        "SELECT COUNT(*) FROM tasks WHERE status = ?1",
                        params![status],
                        |r| r.get(0),
                    )?)
                };
                Ok(QueueStats {
                    pending: count(STATUS_PENDING)?,
                    running: count(STATUS_RUNNING)?,
                    dead: count(STATUS_DEAD)?,
                })
            }
        })
        .await?
    }

    pub fn start_worker(
        &self,
        shutdown: watch::Receiver<bool>,
        handler: Arc<dyn TaskHandler>,
        settings: QueueSettings,
    ) {
        let queue = self.clone();
        tokio::spawn(async move {
            if let Err(e) = queue.run_loop(shutdown, handler, settings).await {
                warn!("task worker stopped: {e:#}");
            }
        });
    }

    async fn run_loop(
        &self,
        mut shutdown: watch::Receiver<bool>,
        handler: Arc<dyn TaskHandler>,
        settings: QueueSettings,
    ) -> Result<()> {
        info!("task queue db: {}", self.db_path.display());
        let recovered = self.requeue_running().await?;
        if recovered > 0 {
            info!("requeued {recovered} tasks left running by a previous process");
        }

        let tick = Duration::from_millis(settings.tick_ms.max(50));
        loop {
            if *shutdown.borrow() {
                break;
            }

            let due = self.claim_due(settings.batch.max(1)).await?;
            if due.is_empty() {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(tick) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            stream::iter(due)
                .for_each_concurrent(settings.batch.max(1), |job| {
                    let handler = handler.clone();
                    async move {
                        if let Err(e) = self.run_one(job, handler.as_ref(), &settings).await {
                            warn!("task bookkeeping failed: {e:#}");
                        }
                    }
                })
                .await;
        }
        Ok(())
    }

    /// Runs every due task once, in the calling task. Returns how many ran.
    pub async fn drain_due(
        &self,
        handler: &dyn TaskHandler,
        settings: &QueueSettings,
    ) -> Result<usize> {
        let due = self.claim_due(settings.batch.max(1)).await?;
        let n = due.len();
        for job in due {
            self.run_one(job, handler, settings).await?;
        }
        Ok(n)
    }

    async fn run_one(
        &self,
        job: QueuedTask,
        handler: &dyn TaskHandler,
        settings: &QueueSettings,
    ) -> Result<()> {
        let QueuedTask { id, task, attempt, .. } = job;
        let queue = task.queue();
        let subject = task.subject().to_string();
        match handler.handle(task).await {
            TaskOutcome::Done => {
                info!("task {queue} {subject} done");
                self.delete(&id).await
            }
            TaskOutcome::Retry(reason) => {
                warn!("task {queue} {subject} will retry: {reason}");
                self.retry_or_bury(&id, attempt, &reason, settings).await
            }
            TaskOutcome::Failed(e) => {
                warn!("task {queue} {subject} failed: {e:#}");
                self.retry_or_bury(&id, attempt, &format!("{e:#}"), settings).await
            }
        }
    }

    async fn retry_or_bury(
        &self,
        id: &str,
        attempt: u32,
        err: &str,
        settings: &QueueSettings,
    ) -> Result<()> {
        let attempt_no = attempt.saturating_add(1);
        if attempt_no >= settings.max_attempts {
            return self.mark_dead(id, err).await;
        }
        let delay = next_backoff(attempt_no, settings.base_backoff_secs, settings.max_backoff_secs);
        self.reschedule(id, attempt_no, delay, err).await
    }

    /// Deletes dead tasks that died before `cutoff_ms`. Returns how many.
    pub async fn prune_dead(&self, cutoff_ms: i64) -> Result<usize> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<usize> {
                let conn = Connection::open(db_path)?;
                Ok(conn.execute(
                    "DELETE FROM tasks WHERE status = ?1 AND eta_ms < ?2",
                    params![STATUS_DEAD, cutoff_ms],
                )?)
            }
        })
        .await?
    }

    async fn claim_due(&self, limit: usize) -> Result<Vec<QueuedTask>> {
        let now = now_ms();
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<Vec<QueuedTask>> {
                let mut conn = Connection::open(db_path)?;
                let tx = conn.transaction()?;
                let mut out = Vec::new();
                {
                    let mut stmt = tx.prepare(
                        "SELECT id, payload_json, eta_ms, attempt FROM tasks
                         WHERE status = ?1 AND eta_ms <= ?2 ORDER BY eta_ms, created_ms LIMIT ?3",
                    )?;
                    let mut rows = stmt.query(params![STATUS_PENDING, now, limit as i64])?;
                    while let Some(row) = rows.next()? {
                        match read_task(row) {
                            Ok(t) => out.push(t),
                            Err(e) => warn!("dropping undecodable task: {e:#}"),
                        }
                    }
                }
                for t in &out {
                    tx.execute(
                        "UPDATE tasks SET status = ?2 WHERE id = ?1",
                        params![t.id, STATUS_RUNNING],
                    )?;
                }
                tx.commit()?;
                Ok(out)
            }
        })
        .await?
    }

    async fn requeue_running(&self) -> Result<usize> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<usize> {
                let conn = Connection::open(db_path)?;
                Ok(conn.execute(
                    "UPDATE tasks SET status = ?1 WHERE status = ?2",
                    params![STATUS_PENDING, STATUS_RUNNING],
                )?)
            }
        })
        .await?
    }

    async fn delete(&self, id: &str) -> Result<()> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let id = id.to_string();
            move || -> Result<()> {
                let conn = Connection::open(db_path)?;
                conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
                Ok(())
            }
        })
        .await??;
        Ok(())
    }

    /// Buries the task. `eta_ms` becomes the time of death, for pruning.
    async fn mark_dead(&self, id: &str, err: &str) -> Result<()> {
        let now = now_ms();
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let id = id.to_string();
            let err = err.to_string();
            move || -> Result<()> {
                let conn = Connection::open(db_path)?;
                conn.execute(
                    "UPDATE tasks SET status = ?2, eta_ms = ?3, last_error = ?4 WHERE id = ?1",
                    params![id, STATUS_DEAD, now, err],
                )?;
                Ok(())
            }
        })
        .await??;
        Ok(())
    }

    async fn reschedule(&self, id: &str, attempt: u32, delay: Duration, err: &str) -> Result<()> {
        let next = now_ms().saturating_add(delay.as_millis() as i64);
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let id = id.to_string();
            let err = err.to_string();
            move || -> Result<()> {
                let conn = Connection::open(db_path)?;
                conn.execute(
                    "UPDATE tasks SET status = ?2, attempt = ?3, eta_ms = ?4, last_error = ?5 WHERE id = ?1",
                    params![id, STATUS_PENDING, attempt, next, err],
                )?;
                Ok(())
            }
        })
        .await??;
        Ok(())
    }
}

fn init_db(path: &Path) -> Result<()> {
    let conn = Connection::open(path).with_context(|| format!("open db: {}", path.display()))?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS tasks (
          id TEXT PRIMARY KEY,
          queue TEXT NOT NULL,
          subject TEXT NOT NULL,
          payload_json TEXT NOT NULL,
          created_ms INTEGER NOT NULL,
          eta_ms INTEGER NOT NULL,
          attempt INTEGER NOT NULL,
          status INTEGER NOT NULL,
          last_error TEXT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(status, eta_ms);
        CREATE INDEX IF NOT EXISTS idx_tasks_subject ON tasks(queue, subject, status);
        "#,
    )?;
    Ok(())
}

fn insert_task(conn: &Connection, task: &QueueTask, eta_ms: i64) -> Result<String> {
    let id = new_task_id();
    conn.execute(
        r#"
        INSERT INTO tasks (id, queue, subject, payload_json, created_ms, eta_ms, attempt, status, last_error)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, NULL)
        "#,
        params![
            id,
            task.queue().as_str(),
            task.subject(),
            serde_json::to_string(task)?,
            now_ms(),
            eta_ms,
            STATUS_PENDING
        ],
    )?;
    Ok(id)
}

fn read_task(row: &rusqlite::Row<'_>) -> Result<QueuedTask> {
    let id: String = row.get(0)?;
    let payload: String = row.get(1)?;
    let task: QueueTask =
        serde_json::from_str(&payload).with_context(|| format!("decode task {id}"))?;
    Ok(QueuedTask {
        id,
        task,
        eta_ms: row.get(2)?,
        attempt: row.get(3)?,
    })
}

fn new_task_id() -> String {
    // 16 random bytes -> 32 hex chars
    let mut b = [0u8; 16];
    OsRng.fill_bytes(&mut b);
    b.iter().map(|v| format!("{v:02x}")).collect()
}

pub fn next_backoff(attempt: u32, base_secs: u64, max_secs: u64) -> Duration {
    let pow = attempt.saturating_sub(1).min(20);
    let mut secs = base_secs.saturating_mul(1u64 << pow);
    if secs > max_secs {
        secs = max_secs;
    }
    // jitter 0..1000ms
    let mut b = [0u8; 2];
    OsRng.fill_bytes(&mut b);
    let jitter_ms = u16::from_le_bytes(b) as u64 % 1000;
    Duration::from_secs(secs) + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridgy_protocol::{PollTask, PropagateTask};
    use std::sync::Mutex;

    struct Scripted {
        outcomes: Mutex<Vec<TaskOutcome>>,
        seen: Mutex<Vec<QueueTask>>,
    }

    #[async_trait]
    impl TaskHandler for Scripted {
        async fn handle(&self, task: QueueTask) -> TaskOutcome {
            self.seen.lock().unwrap().push(task);
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                TaskOutcome::Done
            } else {
                outcomes.remove(0)
            }
        }
    }

    fn propagate(key: &str) -> QueueTask {
        QueueTask::Propagate(PropagateTask {
            response_key: key.to_string(),
        })
    }

    fn poll(key: &str, last_polled: &str) -> QueueTask {
        QueueTask::Poll(PollTask {
            source_key: key.to_string(),
            last_polled: last_polled.to_string(),
        })
    }

    #[tokio::test]
    async fn replace_keeps_one_pending_per_subject() {
        let dir = tempfile::tempdir().unwrap();
        let q = TaskQueue::open(dir.path().join("q.db")).unwrap();
        q.replace(&poll("fake:foo", "a"), 10).await.unwrap();
        q.replace(&poll("fake:foo", "b"), 20).await.unwrap();
        q.replace(&poll("fake:bar", "a"), 30).await.unwrap();

        let pending = q.pending(QueueName::Poll).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].task, poll("fake:foo", "b"));
        assert!(q.has_pending(QueueName::Poll, "fake:bar").await.unwrap());
        assert!(!q.has_pending(QueueName::PollNow, "fake:bar").await.unwrap());
    }

    #[tokio::test]
    async fn retry_reschedules_then_buries() {
        let dir = tempfile::tempdir().unwrap();
        let q = TaskQueue::open(dir.path().join("q.db")).unwrap();
        q.enqueue(&propagate("r1"), 0).await.unwrap();
        q.enqueue(&propagate("future"), now_ms() + 3_600_000).await.unwrap();

        let handler = Scripted {
            outcomes: Mutex::new(vec![TaskOutcome::Retry("busy".into())]),
            seen: Mutex::new(Vec::new()),
        };
        let settings = QueueSettings {
            max_attempts: 2,
            base_backoff_secs: 0,
            max_backoff_secs: 0,
            ..QueueSettings::default()
        };

        assert_eq!(q.drain_due(&handler, &settings).await.unwrap(), 1);
        let pending = q.pending(QueueName::Propagate).await.unwrap();
        let retried = pending.iter().find(|t| t.task == propagate("r1")).unwrap();
        assert_eq!(retried.attempt, 1);

        // Backoff jitter is under a second.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        *handler.outcomes.lock().unwrap() = vec![TaskOutcome::Failed(anyhow::anyhow!("boom"))];
        assert_eq!(q.drain_due(&handler, &settings).await.unwrap(), 1);
        let stats = q.stats().await.unwrap();
        assert_eq!(stats.dead, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(handler.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn worker_runs_enqueued_tasks_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let q = TaskQueue::open(dir.path().join("q.db")).unwrap();
        let handler = Arc::new(Scripted {
            outcomes: Mutex::new(Vec::new()),
            seen: Mutex::new(Vec::new()),
        });
        let (tx, rx) = watch::channel(false);
        q.start_worker(rx, handler.clone(), QueueSettings::default());
        q.enqueue(&propagate("r1"), 0).await.unwrap();

        for _ in 0..100 {
            if handler.seen.lock().unwrap().len() == 1 && q.stats().await.unwrap() == QueueStats::default() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(handler.seen.lock().unwrap().len(), 1);
        assert_eq!(q.stats().await.unwrap(), QueueStats::default());
        let _ = tx.send(true);
    }

    fn row_count(q: &TaskQueue) -> i64 {
        let conn = Connection::open(q.db_path()).unwrap();
        conn.query_row("SELECT COUNT(*) FROM tasks", [], |r| r.get(0)).unwrap()
    }

    #[tokio::test]
    async fn finished_tasks_leave_no_rows() {
        let dir = tempfile::tempdir().unwrap();
        let q = TaskQueue::open(dir.path().join("q.db")).unwrap();
        let handler = Scripted {
            outcomes: Mutex::new(Vec::new()),
            seen: Mutex::new(Vec::new()),
        };
        let settings = QueueSettings {
            batch: 50,
            ..QueueSettings::default()
        };
        for round in 0..5 {
            for i in 0..20 {
                q.enqueue(&propagate(&format!("r{round}-{i}")), 0).await.unwrap();
            }
            assert_eq!(q.drain_due(&handler, &settings).await.unwrap(), 20);
        }
        assert_eq!(handler.seen.lock().unwrap().len(), 100);
        assert_eq!(row_count(&q), 0);
    }

    #[tokio::test]
    async fn dead_tasks_are_pruned_after_retention() {
        let dir = tempfile::tempdir().unwrap();
        let q = TaskQueue::open(dir.path().join("q.db")).unwrap();
        q.enqueue(&propagate("r1"), 0).await.unwrap();
        let handler = Scripted {
            outcomes: Mutex::new(vec![TaskOutcome::Failed(anyhow::anyhow!("boom"))]),
            seen: Mutex::new(Vec::new()),
        };
        let settings = QueueSettings {
            max_attempts: 1,
            ..QueueSettings::default()
        };
        q.drain_due(&handler, &settings).await.unwrap();
        assert_eq!(q.stats().await.unwrap().dead, 1);

        // still within retention
        assert_eq!(q.prune_dead(now_ms() - DEAD_TASK_RETENTION_MS).await.unwrap(), 0);
        assert_eq!(row_count(&q), 1);

        assert_eq!(q.prune_dead(now_ms() + 1).await.unwrap(), 1);
        assert_eq!(row_count(&q), 0);
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert!(next_backoff(1, 5, 3600) < Duration::from_secs(6));
        assert!(next_backoff(3, 5, 3600) >= Duration::from_secs(20));
        assert!(next_backoff(30, 5, 3600) < Duration::from_secs(3601));
    }
}
