// Copyright (c) 2026 DroidAudit Contributors
// SPDX-License-Identifier: Apache-2.0

//! droidaudit-proxy
//!
//! Comm proxy recorder: a small HTTP surface (`GET /health`, `POST /act`) between the
//! agent and its executor that appends every exchange to `comm_proxy_trace.jsonl`.
//! When no socket can be bound the same service is reachable in-process.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod client;
pub mod config;
pub mod error;
pub mod recorder;
pub mod registry;
pub mod server;
pub mod service;
pub mod trace;

pub use crate::client::CommProxyClient;
pub use crate::config::ProxyConfig;
pub use crate::error::{ProxyError, ProxyResult};
pub use crate::recorder::{CommProxyRecorder, RecorderHandle, StopOutcome, Transport};
pub use crate::registry::InProcessRegistry;
pub use crate::service::{ActionService, ProxyReply};
