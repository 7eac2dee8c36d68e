/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::models::{
    now_ms, Bucket, Feature, Response, Source, SourceStatus, SyndicatedPost, WebmentionStatus,
    Webmentions, LEASE_MS, MAX_OLD_RESPONSE_JSONS,
};
use crate::urls;
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct BridgyDb {
    path: PathBuf,
}

/// Result of trying to lease a webmentions entity for sending.
#[derive(Debug)]
pub enum Lease<T> {
    Acquired { entity: T, source: Source },
    /// Already propagated; the task can finish.
    Complete,
    /// Another worker holds the lease.
    Busy { leased_until_ms: i64 },
    /// Entity or its source is gone, or the source is disabled.
    Missing(&'static str),
}

/// What `save_response` did with an incoming response.
#[derive(Debug)]
pub struct SaveOutcome {
    pub response: Response,
    /// New targets to send; enqueue a propagate task.
    pub propagate: bool,
    /// The stored response changed; it should be restarted.
    pub changed: bool,
    pub existed: bool,
}

impl BridgyDb {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn = Connection::open(&path).with_context(|| format!("open db: {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS sources (
              key TEXT PRIMARY KEY,
              silo TEXT NOT NULL,
              status TEXT NOT NULL,
              listen INTEGER NOT NULL,
              last_poll_attempt_ms INTEGER NOT NULL,
              updated_ms INTEGER NOT NULL,
              source_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sources_listen ON sources(listen, status);

            CREATE TABLE IF NOT EXISTS responses (
              key TEXT PRIMARY KEY,
              source_key TEXT NOT NULL,
              status TEXT NOT NULL,
              leased_until_ms INTEGER NULL,
              updated_ms INTEGER NOT NULL,
              body_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_responses_source ON responses(source_key, updated_ms);

            CREATE TABLE IF NOT EXISTS blog_posts (
              key TEXT PRIMARY KEY,
              source_key TEXT NOT NULL,
              status TEXT NOT NULL,
              leased_until_ms INTEGER NULL,
              updated_ms INTEGER NOT NULL,
              body_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_blog_posts_source ON blog_posts(source_key, updated_ms);

            CREATE TABLE IF NOT EXISTS syndicated_posts (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              source_key TEXT NOT NULL,
              original TEXT NULL,
              syndication TEXT NULL,
              created_ms INTEGER NOT NULL,
              updated_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_synd_syndication ON syndicated_posts(source_key, syndication);
            CREATE INDEX IF NOT EXISTS idx_synd_original ON syndicated_posts(source_key, original);
            "#,
        )?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs blocking db work off the async executor.
    pub async fn call<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&BridgyDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("open db: {}", self.path.display()))?;
        conn.busy_timeout(Duration::from_secs(10))?;
        Ok(conn)
    }

    // Sources

    pub fn put_source(&self, source: &Source) -> Result<()> {
        let conn = self.conn()?;
        write_source(&conn, source)
    }

    pub fn get_source(&self, key: &str) -> Result<Option<Source>> {
        let conn = self.conn()?;
        read_source(&conn, key)
    }

    /// Read-modify-write of one source in a transaction. `None` if it doesn't exist.
    pub fn update_source<F>(&self, key: &str, f: F) -> Result<Option<Source>>
    where
        F: FnOnce(&mut Source),
    {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let Some(mut source) = read_source(&tx, key)? else {
            return Ok(None);
        };
        f(&mut source);
        source.updated_ms = now_ms();
        write_source(&tx, &source)?;
        tx.commit()?;
        Ok(Some(source))
    }

    /// Sources with `listen` enabled that aren't disabled.
    pub fn listening_sources(&self) -> Result<Vec<Source>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT source_json FROM sources WHERE listen = 1 AND status != 'disabled' ORDER BY key",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let text: String = row.get(0)?;
            match serde_json::from_str::<Source>(&text) {
                Ok(s) => out.push(s),
                Err(e) => warn!("skipping undecodable source row: {e}"),
            }
        }
        Ok(out)
    }

    /// Stamps `last_webmention_sent`, and adopts `endpoint` as the source's own
    /// endpoint when the target is on one of its domains.
    pub fn record_source_webmention(
        &self,
        source_key: &str,
        target: &str,
        endpoint: Option<&str>,
        now: i64,
    ) -> Result<Option<Source>> {
        self.update_source(source_key, |source| {
            source.last_webmention_sent_ms = Some(now);
            let Some(endpoint) = endpoint else {
                return;
            };
            let on_own_domain = urls::domain_from_link(target)
                .map(|d| source.domains.iter().any(|own| urls::hosts_match(own, &d)))
                .unwrap_or(false);
            if on_own_domain && source.webmention_endpoint.as_deref() != Some(endpoint) {
                info!(
                    "setting webmention_endpoint of {} to {endpoint} (discovered in {target}; was {:?})",
                    source.key(),
                    source.webmention_endpoint
                );
                source.webmention_endpoint = Some(endpoint.to_string());
            }
        })
    }

    // Webmentions entities

    pub fn get<T: Webmentions>(&self, key: &str) -> Result<Option<T>> {
        let conn = self.conn()?;
        read_entity(&conn, key)
    }

    pub fn put<T: Webmentions>(&self, entity: &T) -> Result<()> {
        let conn = self.conn()?;
        write_entity(&conn, entity)
    }

    pub fn responses_for_source(&self, source_key: &str) -> Result<Vec<Response>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT body_json FROM responses WHERE source_key = ?1 ORDER BY updated_ms DESC",
        )?;
        let mut rows = stmt.query(params![source_key])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let text: String = row.get(0)?;
            out.push(serde_json::from_str(&text).context("decode response row")?);
        }
        Ok(out)
    }

    pub fn lease<T: Webmentions>(&self, key: &str, now: i64) -> Result<Lease<T>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let Some(mut entity) = read_entity::<T>(&tx, key)? else {
            return Ok(Lease::Missing("no entity"));
        };
        let Some(source) = read_source(&tx, entity.source_key())? else {
            return Ok(Lease::Missing("no source"));
        };
        if source.status == SourceStatus::Disabled {
            return Ok(Lease::Missing("source disabled"));
        }

        match entity.status() {
            WebmentionStatus::Complete => return Ok(Lease::Complete),
            WebmentionStatus::Processing => {
                if let Some(until) = entity.leased_until_ms().filter(|until| *until > now) {
                    return Ok(Lease::Busy {
                        leased_until_ms: until,
                    });
                }
            }
            WebmentionStatus::New | WebmentionStatus::Error => {}
        }

        entity.set_status(WebmentionStatus::Processing);
        entity.set_leased_until_ms(Some(now + LEASE_MS));
        entity.touch(now);
        write_entity(&tx, &entity)?;
        tx.commit()?;
        Ok(Lease::Acquired { entity, source })
    }

    /// Marks a leased entity complete, storing its final targets. Returns
    /// false if another worker already finished it.
    pub fn complete<T: Webmentions>(&self, entity: &mut T, now: i64) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let Some(existing) = read_entity::<T>(&tx, entity.key())? else {
            error!("entity disappeared: {}", entity.key());
            return Ok(false);
        };
        match existing.status() {
            WebmentionStatus::Complete => {
                warn!(
                    "another task stole and finished {}. did my lease expire?",
                    entity.key()
                );
                return Ok(false);
            }
            WebmentionStatus::New => {
                error!("{} went backward from processing to new", entity.key());
                return Ok(false);
            }
            WebmentionStatus::Processing | WebmentionStatus::Error => {}
        }
        entity.set_status(WebmentionStatus::Complete);
        entity.set_leased_until_ms(None);
        entity.touch(now);
        write_entity(&tx, entity)?;
        tx.commit()?;
        Ok(true)
    }

    /// Gives up the lease, leaving the entity in `new_status`. No-op unless it's
    /// still processing.
    pub fn release<T: Webmentions>(
        &self,
        entity: &mut T,
        new_status: WebmentionStatus,
        now: i64,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let still_processing = read_entity::<T>(&tx, entity.key())?
            .map(|e| e.status() == WebmentionStatus::Processing)
            .unwrap_or(false);
        if !still_processing {
            return Ok(false);
        }
        entity.set_status(new_status);
        entity.set_leased_until_ms(None);
        entity.touch(now);
        write_entity(&tx, entity)?;
        tx.commit()?;
        Ok(true)
    }

    /// Stores a freshly polled response, merging it into any existing record.
    ///
    /// Targets the record doesn't know yet are added to their buckets; new
    /// `unsent` or `error` targets mean it needs propagating. A brand new
    /// response with nothing to send is stored complete. When the type or the
    /// content changed (per `changed`), the old JSON moves into
    /// `old_response_jsons` and the outcome asks for a restart.
    pub fn save_response(
        &self,
        mut incoming: Response,
        now: i64,
        changed: &dyn Fn(&Value, &Value) -> bool,
    ) -> Result<SaveOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let existing = read_entity::<Response>(&tx, &incoming.key)?;

        let outcome = match existing {
            None => {
                let propagate =
                    !incoming.targets.unsent.is_empty() || !incoming.targets.error.is_empty();
                incoming.status = if propagate {
                    WebmentionStatus::New
                } else {
                    WebmentionStatus::Complete
                };
                incoming.created_ms = now;
                incoming.updated_ms = now;
                SaveOutcome {
                    response: incoming,
                    propagate,
                    changed: false,
                    existed: false,
                }
            }
            Some(mut stored) => {
                let mut propagate = false;
                for bucket in Bucket::ALL {
                    for url in incoming.targets.bucket(bucket).clone() {
                        if stored.targets.push(bucket, url)
                            && matches!(bucket, Bucket::Unsent | Bucket::Error)
                        {
                            propagate = true;
                        }
                    }
                }
                merge_activities(&mut stored, &incoming);
                if propagate && stored.status == WebmentionStatus::Complete {
                    stored.status = WebmentionStatus::New;
                }

                let before = stored.response().unwrap_or(Value::Null);
                let after = incoming.response().unwrap_or(Value::Null);
                let is_changed = stored.kind != incoming.kind || changed(&before, &after);
                if is_changed {
                    info!("response changed, re-propagating: {}", stored.key);
                    let mut history = vec![stored.response_json.clone()];
                    history.extend(stored.old_response_jsons.drain(..));
                    history.truncate(MAX_OLD_RESPONSE_JSONS);
                    stored.old_response_jsons = history;
                    stored.response_json = incoming.response_json;
                    stored.kind = incoming.kind;
                }
                stored.updated_ms = now;
                SaveOutcome {
                    response: stored,
                    propagate,
                    changed: is_changed,
                    existed: true,
                }
            }
        };

        write_entity(&tx, &outcome.response)?;
        tx.commit()?;
        Ok(outcome)
    }

    // Syndicated posts

    pub fn syndicated_by_syndication(
        &self,
        source_key: &str,
        syndication: &str,
    ) -> Result<Vec<SyndicatedPost>> {
        let conn = self.conn()?;
        query_synd(
            &conn,
            "SELECT id, source_key, original, syndication, created_ms, updated_ms
             FROM syndicated_posts WHERE source_key = ?1 AND syndication = ?2 ORDER BY id",
            source_key,
            syndication,
        )
    }

    pub fn syndicated_by_original(
        &self,
        source_key: &str,
        original: &str,
    ) -> Result<Vec<SyndicatedPost>> {
        let conn = self.conn()?;
        query_synd(
            &conn,
            "SELECT id, source_key, original, syndication, created_ms, updated_ms
             FROM syndicated_posts WHERE source_key = ?1 AND original = ?2 ORDER BY id",
            source_key,
            original,
        )
    }

    /// Records that `original` has no syndication links, unless we already
    /// know something about it.
    pub fn insert_original_blank(&self, source_key: &str, original: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let exists: bool = tx
            .query_row(
                "SELECT 1 FROM syndicated_posts WHERE source_key = ?1 AND original = ?2 LIMIT 1",
                params![source_key, original],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if !exists {
            insert_synd(&tx, source_key, Some(original), None)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Records that no original was found for `syndication`, unless we
    /// already know something about it.
    pub fn insert_syndication_blank(&self, source_key: &str, syndication: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let exists: bool = tx
            .query_row(
                "SELECT 1 FROM syndicated_posts WHERE source_key = ?1 AND syndication = ?2 LIMIT 1",
                params![source_key, syndication],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if !exists {
            insert_synd(&tx, source_key, None, Some(syndication))?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Stores a concrete mapping, replacing blanks for either side. Returns the
    /// existing row if the exact mapping is already known.
    pub fn insert_syndicated(
        &self,
        source_key: &str,
        syndication: &str,
        original: &str,
    ) -> Result<SyndicatedPost> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM syndicated_posts WHERE source_key = ?1 AND
               ((original = ?2 AND syndication IS NULL) OR (syndication = ?3 AND original IS NULL))",
            params![source_key, original, syndication],
        )?;
        let existing = query_synd(
            &tx,
            "SELECT id, source_key, original, syndication, created_ms, updated_ms
             FROM syndicated_posts WHERE source_key = ?1 AND syndication = ?2 ORDER BY id",
            source_key,
            syndication,
        )?
        .into_iter()
        .find(|s| s.original.as_deref() == Some(original));
        let post = match existing {
            Some(post) => post,
            None => insert_synd(&tx, source_key, Some(original), Some(syndication))?,
        };
        tx.commit()?;
        Ok(post)
    }

    pub fn delete_syndicated(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM syndicated_posts WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Originals mapped to any of `syndications`, across all sources.
    pub fn originals_for_syndications(&self, syndications: &[String]) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT original FROM syndicated_posts WHERE syndication = ?1 AND original IS NOT NULL ORDER BY id",
        )?;
        let mut out = Vec::new();
        for synd in syndications {
            let mut rows = stmt.query(params![synd])?;
            while let Some(row) = rows.next()? {
                out.push(row.get::<_, String>(0)?);
            }
        }
        Ok(crate::models::dedupe(out))
    }

    pub fn count_syndicated(&self, source_key: &str) -> Result<u64> {
        let conn = self.conn()?;
        let n: u64 = conn.query_row(
            "SELECT COUNT(*) FROM syndicated_posts WHERE source_key = ?1",
            params![source_key],
            |r| r.get(0),
        )?;
        Ok(n)
    }
}

/// Unions the incoming activities into `stored`, keyed by activity id with
/// the incoming copy winning, and remaps `urls_to_activity` onto the result.
fn merge_activities(stored: &mut Response, incoming: &Response) {
    if incoming.activities_json.is_empty() {
        return;
    }
    let id_of = |json: &String| -> String {
        serde_json::from_str::<Value>(json)
            .ok()
            .and_then(|v| v.get("id").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| json.clone())
    };
    let mut ids: Vec<String> = Vec::new();
    let mut merged: Vec<String> = Vec::new();
    for json in stored.activities_json.iter().chain(&incoming.activities_json) {
        let id = id_of(json);
        match ids.iter().position(|i| *i == id) {
            Some(pos) => merged[pos] = json.clone(),
            None => {
                ids.push(id);
                merged.push(json.clone());
            }
        }
    }

    let mut map = BTreeMap::new();
    for resp in [incoming, &*stored] {
        for target in resp.targets.all() {
            let idx = resp
                .urls_to_activity
                .as_ref()
                .and_then(|m| m.get(target))
                .copied()
                .unwrap_or(0);
            let pos = resp
                .activities_json
                .get(idx)
                .and_then(|json| ids.iter().position(|i| *i == id_of(json)));
            if let Some(pos) = pos {
                map.entry(target.clone()).or_insert(pos);
            }
        }
    }
    stored.urls_to_activity = (merged.len() > 1).then_some(map);
    stored.activities_json = merged;
}

fn read_source(conn: &Connection, key: &str) -> Result<Option<Source>> {
    let text: Option<String> = conn
        .query_row(
            "SELECT source_json FROM sources WHERE key = ?1",
            params![key],
            |r| r.get(0),
        )
        .optional()?;
    text.map(|t| serde_json::from_str(&t).with_context(|| format!("decode source {key}")))
        .transpose()
}

fn write_source(conn: &Connection, source: &Source) -> Result<()> {
    let json = serde_json::to_string(source)?;
    conn.execute(
        r#"
        INSERT INTO sources (key, silo, status, listen, last_poll_attempt_ms, updated_ms, source_json)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(key) DO UPDATE SET
          status = excluded.status,
          listen = excluded.listen,
          last_poll_attempt_ms = excluded.last_poll_attempt_ms,
          updated_ms = excluded.updated_ms,
          source_json = excluded.source_json
        "#,
        params![
            source.key(),
            source.silo.short_name(),
            source.status.as_str(),
            source.has_feature(Feature::Listen) as i64,
            source.last_poll_attempt_ms,
            source.updated_ms,
            json
        ],
    )?;
    Ok(())
}

fn read_entity<T: Webmentions>(conn: &Connection, key: &str) -> Result<Option<T>> {
    let text: Option<String> = conn
        .query_row(
            &format!("SELECT body_json FROM {} WHERE key = ?1", T::TABLE),
            params![key],
            |r| r.get(0),
        )
        .optional()?;
    text.map(|t| serde_json::from_str(&t).with_context(|| format!("decode {} {key}", T::TABLE)))
        .transpose()
}

fn write_entity<T: Webmentions>(conn: &Connection, entity: &T) -> Result<()> {
    let json = serde_json::to_string(entity)?;
    conn.execute(
        &format!(
            r#"
            INSERT INTO {} (key, source_key, status, leased_until_ms, updated_ms, body_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(key) DO UPDATE SET
              source_key = excluded.source_key,
              status = excluded.status,
              leased_until_ms = excluded.leased_until_ms,
              updated_ms = excluded.updated_ms,
              body_json = excluded.body_json
            "#,
            T::TABLE
        ),
        params![
            entity.key(),
            entity.source_key(),
            entity.status().as_str(),
            entity.leased_until_ms(),
            now_ms(),
            json
        ],
    )?;
    Ok(())
}

fn query_synd(conn: &Connection, sql: &str, a: &str, b: &str) -> Result<Vec<SyndicatedPost>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params![a, b])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(SyndicatedPost {
            id: row.get(0)?,
            source_key: row.get(1)?,
            original: row.get(2)?,
            syndication: row.get(3)?,
            created_ms: row.get(4)?,
            updated_ms: row.get(5)?,
        });
    }
    Ok(out)
}

fn insert_synd(
    tx: &Transaction<'_>,
    source_key: &str,
    original: Option<&str>,
    syndication: Option<&str>,
) -> Result<SyndicatedPost> {
    let now = now_ms();
    tx.execute(
        "INSERT INTO syndicated_posts (source_key, original, syndication, created_ms, updated_ms)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![source_key, original, syndication, now],
    )?;
    Ok(SyndicatedPost {
        id: tx.last_insert_rowid(),
        source_key: source_key.to_string(),
        original: original.map(str::to_string),
        syndication: syndication.map(str::to_string),
        created_ms: now,
        updated_ms: now,
    })
}
