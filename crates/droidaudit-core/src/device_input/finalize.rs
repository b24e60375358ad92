//! End-of-run check of the declared action-trace level.
//!
//! A declared L0/L1/L2 run whose trace turns out missing, empty or invalid is
//! downgraded to `none`. Offending files are renamed aside, never deleted.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use super::validator::validate_device_input_trace;
use crate::error::{AuditError, AuditResult};
use crate::evidence_pack::{
    read_action_trace_level, ActionTraceLevel, DEVICE_INPUT_TRACE, ENV_CAPABILITIES, RUN_MANIFEST,
    SCREEN_TRACE,
};
use crate::jsonl::{read_json_object, write_json_pretty};

pub const QUARANTINE_SUFFIX: &str = "quarantined";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The run never declared a device-input trace.
    NotDeclared,
    Verified { level: ActionTraceLevel },
    Degraded {
        from: ActionTraceLevel,
        reason: String,
        quarantined: Vec<PathBuf>,
    },
}

enum TraceProblem {
    Missing,
    Empty,
    Invalid(String),
}

fn is_non_empty_file(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

fn inspect_trace(evidence_dir: &Path, level: ActionTraceLevel) -> Option<TraceProblem> {
    let trace = evidence_dir.join(DEVICE_INPUT_TRACE);
    let Ok(bytes) = fs::read(&trace) else {
        return Some(TraceProblem::Missing);
    };
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => return Some(TraceProblem::Invalid(format!("not valid UTF-8: {e}"))),
    };
    let Some(first) = text.lines().find(|l| !l.trim().is_empty()) else {
        return Some(TraceProblem::Empty);
    };
    let screen = evidence_dir.join(SCREEN_TRACE);
    let screen = is_non_empty_file(&screen).then_some(screen.as_path());
    if let Some(first_error) = validate_device_input_trace(&trace, screen).into_iter().next() {
        return Some(TraceProblem::Invalid(first_error));
    }
    let declared = level.source_level().map(|l| l.as_str());
    let observed = serde_json::from_str::<Value>(first)
        .ok()
        .and_then(|v| v.get("source_level").and_then(Value::as_str).map(str::to_string));
    if observed.as_deref() != declared {
        return Some(TraceProblem::Invalid(format!(
            "source_level {} does not match declared {level}",
            observed.as_deref().unwrap_or("<missing>")
        )));
    }
    None
}

/// Renames `path` to `<name>.quarantined`, or `.quarantined.N` when taken.
pub fn quarantine(path: &Path) -> AuditResult<PathBuf> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| AuditError::InvalidArgument(format!("no file name: {}", path.display())))?;
    let mut target = path.with_file_name(format!("{name}.{QUARANTINE_SUFFIX}"));
    let mut n = 1;
    while target.exists() {
        target = path.with_file_name(format!("{name}.{QUARANTINE_SUFFIX}.{n}"));
        n += 1;
    }
    fs::rename(path, &target).map_err(|e| AuditError::io(path, e))?;
    Ok(target)
}

fn downgraded(path: &Path, from: ActionTraceLevel, reason: &str) -> AuditResult<Value> {
    let mut doc = read_json_object(path)?;
    doc.insert(
        "action_trace_level".to_string(),
        Value::from(ActionTraceLevel::None.as_str()),
    );
    doc.insert("action_trace_degraded_from".to_string(), Value::from(from.as_str()));
    doc.insert("action_trace_degraded_reason".to_string(), Value::from(reason));
    Ok(Value::Object(doc))
}

pub fn finalize_action_trace(
    run_dir: &Path,
    episode_evidence_dirs: &[PathBuf],
) -> AuditResult<FinalizeOutcome> {
    let level = read_action_trace_level(run_dir)?;
    if !level.requires_device_input_trace() {
        return Ok(FinalizeOutcome::NotDeclared);
    }

    let mut reasons = Vec::new();
    let mut to_quarantine = Vec::new();
    for dir in episode_evidence_dirs {
        let Some(problem) = inspect_trace(dir, level) else {
            continue;
        };
        let detail = match problem {
            TraceProblem::Missing => format!("{DEVICE_INPUT_TRACE} missing"),
            TraceProblem::Empty => {
                to_quarantine.push(dir.join(DEVICE_INPUT_TRACE));
                format!("{DEVICE_INPUT_TRACE} empty")
            }
            TraceProblem::Invalid(first) => {
                to_quarantine.push(dir.join(DEVICE_INPUT_TRACE));
                first
            }
        };
        reasons.push(format!("{}: {detail}", dir.display()));
    }

    if reasons.is_empty() {
        return Ok(FinalizeOutcome::Verified { level });
    }
    let reason = reasons.join("; ");

    // Both documents are prepared before either is written, and neither is
    // written before any trace is moved aside.
    let manifest_path = run_dir.join(RUN_MANIFEST);
    let mut rewrites = vec![(manifest_path.clone(), downgraded(&manifest_path, level, &reason)?)];
    let caps = run_dir.join(ENV_CAPABILITIES);
    if caps.is_file() {
        rewrites.push((caps.clone(), downgraded(&caps, level, &reason)?));
    }
    for (path, doc) in &rewrites {
        write_json_pretty(path, doc)?;
    }

    let mut quarantined = Vec::new();
    for trace in &to_quarantine {
        match quarantine(trace) {
            Ok(target) => quarantined.push(target),
            Err(e) => tracing::warn!(
                target: "droidaudit.trace",
                trace = %trace.display(),
                error = %e,
                "manifest downgraded but trace left in place"
            ),
        }
    }
    tracing::warn!(
        target: "droidaudit.trace",
        run_dir = %run_dir.display(),
        from = %level,
        episodes = reasons.len(),
        quarantined = quarantined.len(),
        "action trace degraded to none"
    );
    Ok(FinalizeOutcome::Degraded {
        from: level,
        reason,
        quarantined,
    })
}
