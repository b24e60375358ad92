// Copyright (c) 2026 DroidAudit Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use droidaudit_proxy::{CommProxyRecorder, InProcessRegistry, ProxyConfig, Transport};

#[derive(Debug, Parser)]
#[command(name = "droidaudit-proxy")]
#[command(about = "Records agent action calls into comm_proxy_trace.jsonl")]
struct Args {
    /// Defaults come from DROIDAUDIT_PROXY_HOST.
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    action_endpoint: Option<String>,

    /// Episode evidence directory or explicit trace file path.
    #[arg(long)]
    trace: Option<PathBuf>,

    #[arg(long)]
    max_body_bytes: Option<usize>,

    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(args.log))
        .init();

    let mut cfg = ProxyConfig::from_env();
    if let Some(host) = args.host {
        cfg.host = host;
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(endpoint) = args.action_endpoint {
        cfg.action_endpoint = endpoint;
    }
    if let Some(trace) = args.trace {
        cfg.trace_path = if trace.is_dir() {
            trace.join(droidaudit_core::evidence_pack::COMM_PROXY_TRACE)
        } else {
            trace
        };
    }
    if let Some(limit) = args.max_body_bytes {
        cfg.max_body_bytes = limit;
    }
    cfg.force_in_process = false;

    let handle = CommProxyRecorder::start(cfg, InProcessRegistry::new())?;
    if handle.is_in_process() {
        handle.stop()?;
        return Err("cannot bind a listening socket in this environment".into());
    }
    if let Transport::Http(addr) = handle.transport() {
        tracing::info!(%addr, "serving until ctrl-c");
    }

    tokio::signal::ctrl_c().await?;
    let outcome = tokio::task::spawn_blocking(move || handle.stop()).await??;
    tracing::info!(?outcome, "shutdown complete");
    Ok(())
}
