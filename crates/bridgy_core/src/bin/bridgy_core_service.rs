/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use bridgy_core::config::{default_data_dir, BridgyConfig, CONFIG_ENV};
use bridgy_core::runtime;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

fn hash_text(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

fn parse_config_path() -> Result<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return Ok(PathBuf::from(path));
            }
            return Err(anyhow::anyhow!("--config requires a path"));
        }
    }
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(default_data_dir()?.join("config.json"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg_path = parse_config_path()?;
    info!("bridgy service starting");
    info!("config: {}", cfg_path.display());

    let mut handle: Option<u64> = None;
    let mut last_hash: Option<u64> = None;
    let mut last_failed_hash: Option<u64> = None;
    let mut missing_logged = false;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let text = match std::fs::read_to_string(&cfg_path) {
            Ok(t) => Some(t),
            Err(e) => {
                if !missing_logged {
                    warn!("config missing: {} ({e}); using defaults", cfg_path.display());
                    missing_logged = true;
                }
                None
            }
        };
        if text.is_some() {
            missing_logged = false;
        }
        let text = text.unwrap_or_else(|| "{}".to_string());

        let hash = hash_text(&text);
        if last_hash != Some(hash) && last_failed_hash != Some(hash) {
            match BridgyConfig::from_json(&text) {
                Ok(mut cfg) => {
                    cfg.apply_overrides(|k| std::env::var(k).ok());
                    if let Some(h) = handle.take() {
                        if let Err(e) = runtime::stop(h) {
                            warn!("failed to stop previous service: {e:#}");
                        }
                    }
                    match runtime::start(cfg) {
                        Ok(h) => {
                            handle = Some(h);
                            last_hash = Some(hash);
                            last_failed_hash = None;
                            info!("service started (handle={h})");
                        }
                        Err(e) => {
                            error!("failed to start service: {e:#}");
                            last_failed_hash = Some(hash);
                        }
                    }
                }
                Err(e) => {
                    warn!("invalid config: {e:#}");
                    last_failed_hash = Some(hash);
                }
            }
        }

        tokio::select! {
            _ = &mut ctrl_c => {
                info!("shutdown requested");
                break;
            }
            _ = sleep(Duration::from_secs(2)) => {}
        }
    }

    if let Some(h) = handle.take() {
        if let Err(e) = runtime::stop(h) {
            warn!("failed to stop service: {e:#}");
        }
    }
    Ok(())
}
