/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// `last_polled` values travel as `YYYY-MM-DD-HH-MM-SS` (UTC).
pub const POLL_TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    Poll,
    PollNow,
    Discover,
    Propagate,
    PropagateBlogpost,
}

impl QueueName {
    pub const ALL: [QueueName; 5] = [
        QueueName::Poll,
        QueueName::PollNow,
        QueueName::Discover,
        QueueName::Propagate,
        QueueName::PropagateBlogpost,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::Poll => "poll",
            QueueName::PollNow => "poll-now",
            QueueName::Discover => "discover",
            QueueName::Propagate => "propagate",
            QueueName::PropagateBlogpost => "propagate-blogpost",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|q| q.as_str() == input.trim().trim_matches('/'))
    }

    /// Worker endpoint path, e.g. `/queue/poll`.
    pub fn path(self) -> String {
        format!("/queue/{}", self.as_str())
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollTask {
    pub source_key: String,
    pub last_polled: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverTask {
    pub source_key: String,
    pub post_id: String,
    /// `event` to fetch the post as an event instead of an activity.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagateTask {
    pub response_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagateBlogpostTask {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "queue", rename_all = "kebab-case")]
pub enum QueueTask {
    Poll(PollTask),
    PollNow(PollTask),
    Discover(DiscoverTask),
    Propagate(PropagateTask),
    PropagateBlogpost(PropagateBlogpostTask),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormError(pub String);

impl fmt::Display for FormError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task payload: {}", self.0)
    }
}

impl std::error::Error for FormError {}

impl QueueTask {
    pub fn queue(&self) -> QueueName {
        match self {
            QueueTask::Poll(_) => QueueName::Poll,
            QueueTask::PollNow(_) => QueueName::PollNow,
            QueueTask::Discover(_) => QueueName::Discover,
            QueueTask::Propagate(_) => QueueName::Propagate,
            QueueTask::PropagateBlogpost(_) => QueueName::PropagateBlogpost,
        }
    }

    /// The entity this task is about: a source key, response key or blog post URL.
    pub fn subject(&self) -> &str {
        match self {
            QueueTask::Poll(t) | QueueTask::PollNow(t) => &t.source_key,
            QueueTask::Discover(t) => &t.source_key,
            QueueTask::Propagate(t) => &t.response_key,
            QueueTask::PropagateBlogpost(t) => &t.key,
        }
    }

    pub fn form_pairs(&self) -> Vec<(&'static str, String)> {
        match self {
            QueueTask::Poll(t) | QueueTask::PollNow(t) => vec![
                ("source_key", t.source_key.clone()),
                ("last_polled", t.last_polled.clone()),
            ],
            QueueTask::Discover(t) => {
                let mut out = vec![
                    ("source_key", t.source_key.clone()),
                    ("post_id", t.post_id.clone()),
                ];
                if let Some(kind) = &t.kind {
                    out.push(("type", kind.clone()));
                }
                out
            }
            QueueTask::Propagate(t) => vec![("response_key", t.response_key.clone())],
            QueueTask::PropagateBlogpost(t) => vec![("key", t.key.clone())],
        }
    }

    /// `application/x-www-form-urlencoded` body for the worker endpoint.
    pub fn to_form(&self) -> String {
        encode_form(&self.form_pairs())
    }

    pub fn from_form(queue: QueueName, body: &str) -> Result<Self, FormError> {
        let pairs = decode_form(body)?;
        let get = |name: &str| -> Result<String, FormError> {
            pairs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| FormError(format!("missing {name}")))
        };
        let optional = |name: &str| {
            pairs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Ok(match queue {
            QueueName::Poll | QueueName::PollNow => {
                let task = PollTask {
                    source_key: get("source_key")?,
                    last_polled: optional("last_polled").unwrap_or_default(),
                };
                if queue == QueueName::Poll {
                    QueueTask::Poll(task)
                } else {
                    QueueTask::PollNow(task)
                }
            }
            QueueName::Discover => QueueTask::Discover(DiscoverTask {
                source_key: get("source_key")?,
                post_id: get("post_id")?,
                kind: optional("type"),
            }),
            QueueName::Propagate => QueueTask::Propagate(PropagateTask {
                response_key: get("response_key")?,
            }),
            QueueName::PropagateBlogpost => {
                QueueTask::PropagateBlogpost(PropagateBlogpostTask { key: get("key")? })
            }
        })
    }
}

pub fn encode_form(pairs: &[(&str, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

pub fn decode_form(body: &str) -> Result<Vec<(String, String)>, FormError> {
    let mut out = Vec::new();
    for part in body.split('&').filter(|p| !p.is_empty()) {
        let (k, v) = part.split_once('=').unwrap_or((part, ""));
        let k = urlencoding::decode(&k.replace('+', " "))
            .map_err(|e| FormError(e.to_string()))?
            .into_owned();
        let v = urlencoding::decode(&v.replace('+', " "))
            .map_err(|e| FormError(e.to_string()))?
            .into_owned();
        out.push((k, v));
    }
    Ok(out)
}
