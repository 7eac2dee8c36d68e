/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::engine::DEFAULT_HOST_URL;
use crate::task_queue::QueueSettings;
use crate::urls::{BetaUsers, DomainBlocklist};
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "BRIDGY_CONFIG";

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BridgyConfig {
    pub bind: String,
    pub data_dir: Option<String>,
    pub db_path: Option<String>,
    /// Canonical public host used in the `source` of every webmention.
    pub host_url: String,
    /// Blocks localhost targets when set.
    pub production: bool,
    pub http_timeout_secs: u64,
    /// Extra blocked domains, one per line, on top of the built-in list.
    pub domain_blocklist_path: Option<String>,
    pub beta_users_path: Option<String>,
    /// Hosts that get `Accept: text/html` on every fetch.
    pub conneg_domains: Vec<String>,
    pub queue: QueueSettings,
    pub sweep_interval_secs: u64,
}

impl Default for BridgyConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            data_dir: None,
            db_path: None,
            host_url: DEFAULT_HOST_URL.to_string(),
            production: false,
            http_timeout_secs: 60,
            domain_blocklist_path: None,
            beta_users_path: None,
            conneg_domains: vec!["rhiaro.co.uk".to_string()],
            queue: QueueSettings::default(),
            sweep_interval_secs: 300,
        }
    }
}

pub fn default_data_dir() -> Result<PathBuf> {
    let proj = ProjectDirs::from("gy", "brid", "Bridgy")
        .context("unable to determine platform data dir")?;
    Ok(proj.data_local_dir().to_path_buf())
}

impl BridgyConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("decode BridgyConfig")
    }

    /// Reads `path` and applies the `BRIDGY_*` environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        let mut cfg = Self::from_json(&text)?;
        cfg.apply_overrides(|k| std::env::var(k).ok());
        Ok(cfg)
    }

    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        let var = |k: &str| var(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        if let Some(v) = var("BRIDGY_BIND") {
            self.bind = v;
        }
        if let Some(v) = var("BRIDGY_DB") {
            self.db_path = Some(v);
        }
        if let Some(v) = var("BRIDGY_HOST_URL") {
            self.host_url = v;
        }
        if let Some(v) = var("BRIDGY_PRODUCTION") {
            self.production = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match self.data_dir.as_deref().map(str::trim) {
            Some(dir) if !dir.is_empty() => Ok(PathBuf::from(dir)),
            _ => default_data_dir(),
        }
    }

    pub fn db_path(&self) -> Result<PathBuf> {
        match self.db_path.as_deref().map(str::trim) {
            Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
            _ => Ok(self.data_dir()?.join("bridgy.db")),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn domain_blocklist(&self) -> Result<DomainBlocklist> {
        let mut blocklist = DomainBlocklist::builtin();
        if let Some(path) = &self.domain_blocklist_path {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("read domain blocklist: {path}"))?;
            blocklist.merge(DomainBlocklist::from_text(&text));
        }
        Ok(blocklist)
    }

    pub fn beta_users(&self) -> Result<BetaUsers> {
        match &self.beta_users_path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("read beta users: {path}"))?;
                Ok(BetaUsers::from_text(&text))
            }
            None => Ok(BetaUsers::builtin()),
        }
    }
}
