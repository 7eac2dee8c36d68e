/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod as1;
pub mod config;
pub mod endpoint_cache;
pub mod engine;
pub mod http_fetch;
pub mod http_retry;
pub mod mf2;
pub mod models;
pub mod opd;
pub mod poll;
pub mod propagate;
pub mod runtime;
pub mod scheduler;
pub mod silo;
pub mod store;
pub mod task_queue;
pub mod urls;
pub mod webmention;

#[cfg(test)]
pub(crate) mod testutil;

pub use bridgy_protocol::{QueueName, QueueTask};
