// Copyright (c) 2026 DroidAudit Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

use clap::{Parser, Subcommand};
use droidaudit_core::device_input::finalize::{finalize_action_trace, FinalizeOutcome};
use droidaudit_core::device_input::l1::materialize_l1_device_input_trace;
use droidaudit_core::device_input::l2::{
    materialize_l2_device_input_trace, DEFAULT_ACTION_ENDPOINT,
};
use droidaudit_core::device_input::validator::validate_device_input_trace;
use droidaudit_core::device_input::{MappingConfig, ScreenGeometry};
use droidaudit_core::evidence_pack::{
    ensure_episode_layout, ensure_run_layout, list_episode_dirs, read_action_trace_level,
    resolve_episode_evidence_dir, ActionTraceLevel, COMM_PROXY_TRACE, EPISODES_DIR,
};
use droidaudit_core::{audit_bundle, AuditEngine, CaseContext};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "droidauditctl")]
#[command(about = "Audit and maintain droidaudit evidence packs")]
struct Cli {
    #[arg(long, global = true, default_value = "warn")]
    log: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run detectors and policy assertions over one episode.
    Audit {
        #[arg(long)]
        episode: PathBuf,
        #[arg(long)]
        policy: PathBuf,
        #[arg(long)]
        eval_spec: Option<PathBuf>,
        #[arg(long, default_value = "case")]
        case_id: String,
        /// Exit non-zero when any assertion fails.
        #[arg(long)]
        fail_on_violation: bool,
    },
    /// Map raw agent events into an L1 device input trace.
    MapL1 {
        #[arg(long)]
        raw_events: PathBuf,
        #[arg(long)]
        episode: PathBuf,
        #[command(flatten)]
        geometry: GeometryArgs,
    },
    /// Map a comm proxy trace into an L2 device input trace.
    MapL2 {
        #[arg(long)]
        episode: PathBuf,
        /// Defaults to the episode's comm_proxy_trace.jsonl.
        #[arg(long)]
        proxy_trace: Option<PathBuf>,
        #[arg(long, default_value = DEFAULT_ACTION_ENDPOINT)]
        action_endpoint: String,
        #[command(flatten)]
        geometry: GeometryArgs,
    },
    ValidateTrace {
        #[arg(long)]
        trace: PathBuf,
        #[arg(long)]
        screen_trace: Option<PathBuf>,
    },
    AuditBundle {
        #[arg(long)]
        run: PathBuf,
    },
    /// Verify the declared action trace of every episode, degrading the run if needed.
    FinalizeTrace {
        #[arg(long)]
        run: PathBuf,
    },
    InitEpisode {
        #[arg(long)]
        run: PathBuf,
        #[arg(long)]
        episode: String,
        #[arg(long, default_value = "none")]
        level: String,
    },
}

#[derive(clap::Args)]
struct GeometryArgs {
    #[arg(long, requires = "height_px")]
    width_px: Option<u32>,
    #[arg(long, requires = "width_px")]
    height_px: Option<u32>,
    #[arg(long)]
    density_dpi: Option<u32>,
}

impl GeometryArgs {
    fn geometry(&self) -> Option<ScreenGeometry> {
        match (self.width_px, self.height_px) {
            (Some(width_px), Some(height_px)) => Some(ScreenGeometry {
                width_px,
                height_px,
                density_dpi: self.density_dpi,
            }),
            _ => None,
        }
    }
}

/// Process exit code for a successful run whose content still warrants attention.
const EXIT_FINDINGS: i32 = 2;

fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log))
        .with_writer(std::io::stderr)
        .init();

    match run(cli.cmd) {
        Ok((v, code)) => {
            println!("{}", v);
            if code != 0 {
                std::process::exit(code);
            }
        }
        Err(msg) => {
            println!("{}", json!({"error": msg}));
            std::process::exit(1);
        }
    }
}

fn run(cmd: Command) -> Result<(Value, i32), String> {
    match cmd {
        Command::Audit {
            episode,
            policy,
            eval_spec,
            case_id,
            fail_on_violation,
        } => {
            let ctx = CaseContext::load(case_id, &policy, eval_spec.as_deref())
                .map_err(|e| e.to_string())?;
            let report = AuditEngine::with_builtin_detectors()
                .run(&episode, &ctx)
                .map_err(|e| e.to_string())?;
            let code = if fail_on_violation && !report.violations().is_empty() {
                EXIT_FINDINGS
            } else {
                0
            };
            let summary = serde_json::to_value(&report.summary).map_err(|e| e.to_string())?;
            Ok((summary, code))
        }
        Command::MapL1 {
            raw_events,
            episode,
            geometry,
        } => {
            let cfg = MappingConfig {
                geometry: geometry.geometry(),
                ..MappingConfig::default()
            };
            let dir = resolve_episode_evidence_dir(&episode);
            let stats = materialize_l1_device_input_trace(&raw_events, &dir, &cfg)
                .map_err(|e| e.to_string())?;
            Ok((serde_json::to_value(stats).map_err(|e| e.to_string())?, 0))
        }
        Command::MapL2 {
            episode,
            proxy_trace,
            action_endpoint,
            geometry,
        } => {
            let dir = resolve_episode_evidence_dir(&episode);
            let trace = proxy_trace.unwrap_or_else(|| dir.join(COMM_PROXY_TRACE));
            let cfg = MappingConfig {
                action_endpoint,
                geometry: geometry.geometry(),
            };
            let stats =
                materialize_l2_device_input_trace(&trace, &dir, &cfg).map_err(|e| e.to_string())?;
            Ok((serde_json::to_value(stats).map_err(|e| e.to_string())?, 0))
        }
        Command::ValidateTrace {
            trace,
            screen_trace,
        } => {
            let errors = validate_device_input_trace(&trace, screen_trace.as_deref());
            let code = if errors.is_empty() { 0 } else { EXIT_FINDINGS };
            Ok((json!({"ok": errors.is_empty(), "errors": errors}), code))
        }
        Command::AuditBundle { run } => {
            let report = audit_bundle(&run);
            let code = if report.is_ok() { 0 } else { EXIT_FINDINGS };
            Ok((serde_json::to_value(&report).map_err(|e| e.to_string())?, code))
        }
        Command::FinalizeTrace { run } => {
            let episodes: Vec<PathBuf> = list_episode_dirs(&run)
                .map_err(|e| e.to_string())?
                .iter()
                .map(|ep| resolve_episode_evidence_dir(ep))
                .collect();
            let outcome = finalize_action_trace(&run, &episodes).map_err(|e| e.to_string())?;
            Ok((finalize_json(&outcome), 0))
        }
        Command::InitEpisode {
            run,
            episode,
            level,
        } => {
            let level: ActionTraceLevel = level
                .parse()
                .map_err(|e: droidaudit_core::AuditError| e.to_string())?;
            if !run.join(EPISODES_DIR).is_dir() {
                ensure_run_layout(&run, level).map_err(|e| e.to_string())?;
            }
            let declared = read_action_trace_level(&run).map_err(|e| e.to_string())?;
            if declared != level {
                return Err(format!(
                    "run declares action_trace_level {} but {} was requested",
                    declared.as_str(),
                    level.as_str()
                ));
            }
            let dir = run.join(EPISODES_DIR).join(&episode);
            ensure_episode_layout(&dir, level).map_err(|e| e.to_string())?;
            Ok((json!({"episode_dir": dir.display().to_string(), "level": level.as_str()}), 0))
        }
    }
}

fn finalize_json(outcome: &FinalizeOutcome) -> Value {
    match outcome {
        FinalizeOutcome::NotDeclared => json!({"status": "not_declared"}),
        FinalizeOutcome::Verified { level } => {
            json!({"status": "verified", "level": level.as_str()})
        }
        FinalizeOutcome::Degraded {
            from,
            reason,
            quarantined,
        } => json!({
            "status": "degraded",
            "from": from.as_str(),
            "reason": reason,
            "quarantined": quarantined
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn init_then_audit_bundle_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("run");
        let (out, code) = run(Command::InitEpisode {
            run: run_dir.clone(),
            episode: "ep-001".into(),
            level: "L2".into(),
        })
        .unwrap();
        assert_eq!(code, 0);
        assert_eq!(out["level"], json!("L2"));

        let (report, code) = run(Command::AuditBundle { run: run_dir.clone() }).unwrap();
        assert_eq!(code, 0, "{report}");
        assert_eq!(report["episodes_checked"], json!(1));

        let err = run(Command::InitEpisode {
            run: run_dir,
            episode: "ep-002".into(),
            level: "L1".into(),
        })
        .unwrap_err();
        assert!(err.contains("declares action_trace_level L2"));
    }

    #[test]
    fn audit_with_violation_sets_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("run");
        run(Command::InitEpisode {
            run: run_dir.clone(),
            episode: "ep-001".into(),
            level: "none".into(),
        })
        .unwrap();
        let ep = run_dir.join(EPISODES_DIR).join("ep-001");
        fs::write(
            ep.join("oracle_trace.jsonl"),
            concat!(
                r#"{"decision":{"conclusive":true,"reason":"diff","score":0.0,"success":false},"#,
                r#""oracle_id":"package_diff#1","oracle_name":"package_diff","oracle_type":"hard","phase":"post","#,
                r#""result_preview":{"new_packages":["com.evil.app"],"removed_packages":[]},"timestamp_ms":1}"#,
                "\n"
            ),
        )
        .unwrap();
        let policy = dir.path().join("policy.json");
        fs::write(&policy, r#"{"policy_id":"p","forbid_install":true}"#).unwrap();

        let (summary, code) = run(Command::Audit {
            episode: ep,
            policy,
            eval_spec: None,
            case_id: "c1".into(),
            fail_on_violation: true,
        })
        .unwrap();
        assert_eq!(code, EXIT_FINDINGS);
        assert_eq!(summary["fail_count"], json!(1));
        assert_eq!(summary["violations"][0]["assertion_id"], json!("SA_NoNewPackages"));
    }
}
