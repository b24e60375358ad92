//! On-disk evidence-pack contract for one run and its episodes.
//!
//! Layout:
//! ```text
//! <run>/run_manifest.json
//! <run>/env_capabilities.json
//! <run>/episodes/<episode_id>/[evidence/]summary.json
//! ```
//! Validation never returns an error for a missing or malformed file; it returns a
//! list of human-readable problems so a bundle auditor can collect all of them.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::device_input::SourceLevel;
use crate::error::{AuditError, AuditResult};
use crate::jsonl::read_json_object;

pub const RUN_MANIFEST: &str = "run_manifest.json";
pub const ENV_CAPABILITIES: &str = "env_capabilities.json";
pub const EPISODES_DIR: &str = "episodes";
pub const EVIDENCE_SUBDIR: &str = "evidence";

pub const SUMMARY: &str = "summary.json";
pub const SCREEN_TRACE: &str = "screen_trace.jsonl";
pub const FOREGROUND_TRACE: &str = "foreground_trace.jsonl";
pub const ORACLE_TRACE: &str = "oracle_trace.jsonl";
pub const AGENT_ACTION_TRACE: &str = "agent_action_trace.jsonl";
pub const DEVICE_INPUT_TRACE: &str = "device_input_trace.jsonl";
pub const DEVICE_INPUT_TRACE_STATS: &str = "device_input_trace_stats.json";
pub const COMM_PROXY_TRACE: &str = "comm_proxy_trace.jsonl";
pub const CONSENT_TRACE: &str = "consent_trace.jsonl";
pub const FACTS: &str = "facts.jsonl";
pub const ASSERTIONS: &str = "assertions.jsonl";
pub const UI_DUMP_DIR: &str = "ui_dump";
pub const SCREENSHOTS_DIR: &str = "screenshots";

pub const RUN_REQUIRED_FILES: [&str; 2] = [RUN_MANIFEST, ENV_CAPABILITIES];
pub const EPISODE_REQUIRED_JSON: [&str; 1] = [SUMMARY];
pub const EPISODE_BASELINE_JSONL: [&str; 4] = [
    SCREEN_TRACE,
    FOREGROUND_TRACE,
    ORACLE_TRACE,
    AGENT_ACTION_TRACE,
];
pub const EPISODE_REQUIRED_DIRS: [&str; 2] = [UI_DUMP_DIR, SCREENSHOTS_DIR];

/// Fidelity of the device-input trace a run declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ActionTraceLevel {
    #[default]
    #[serde(rename = "none")]
    None,
    L0,
    L1,
    L2,
}

impl ActionTraceLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::L0 => "L0",
            Self::L1 => "L1",
            Self::L2 => "L2",
        }
    }

    pub fn requires_device_input_trace(self) -> bool {
        !matches!(self, Self::None)
    }

    pub fn source_level(self) -> Option<SourceLevel> {
        match self {
            Self::None => None,
            Self::L0 => Some(SourceLevel::L0),
            Self::L1 => Some(SourceLevel::L1),
            Self::L2 => Some(SourceLevel::L2),
        }
    }
}

impl fmt::Display for ActionTraceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionTraceLevel {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "none" | "" => Ok(Self::None),
            "L0" | "l0" => Ok(Self::L0),
            "L1" | "l1" => Ok(Self::L1),
            "L2" | "l2" => Ok(Self::L2),
            other => Err(AuditError::InvalidArgument(format!(
                "unknown action_trace_level {other:?}"
            ))),
        }
    }
}

/// Which producer writes the device-input trace for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTraceSource {
    #[default]
    None,
    Executor,
    AgentEvents,
    CommProxy,
}

impl ActionTraceSource {
    pub fn level(self) -> ActionTraceLevel {
        match self {
            Self::None => ActionTraceLevel::None,
            Self::Executor => ActionTraceLevel::L0,
            Self::AgentEvents => ActionTraceLevel::L1,
            Self::CommProxy => ActionTraceLevel::L2,
        }
    }
}

/// Baseline JSONL files plus the device-input trace when the level asks for one.
pub fn required_jsonl_files(level: ActionTraceLevel) -> Vec<&'static str> {
    let mut out = EPISODE_BASELINE_JSONL.to_vec();
    if level.requires_device_input_trace() {
        out.push(DEVICE_INPUT_TRACE);
    }
    out
}

/// Creates missing directories and empty placeholders. Existing files are never touched.
pub fn ensure_episode_layout(episode_dir: &Path, level: ActionTraceLevel) -> AuditResult<()> {
    fs::create_dir_all(episode_dir).map_err(|e| AuditError::io(episode_dir, e))?;
    for dir in EPISODE_REQUIRED_DIRS {
        let path = episode_dir.join(dir);
        fs::create_dir_all(&path).map_err(|e| AuditError::io(&path, e))?;
    }
    for name in EPISODE_REQUIRED_JSON {
        create_if_missing(&episode_dir.join(name), b"{}\n")?;
    }
    for name in required_jsonl_files(level) {
        create_if_missing(&episode_dir.join(name), b"")?;
    }
    Ok(())
}

/// Creates run-level manifests declaring `level` if they do not exist yet.
pub fn ensure_run_layout(run_dir: &Path, level: ActionTraceLevel) -> AuditResult<()> {
    fs::create_dir_all(run_dir.join(EPISODES_DIR))
        .map_err(|e| AuditError::io(run_dir, e))?;
    let doc = json!({ "action_trace_level": level.as_str() });
    let mut bytes = serde_json::to_vec_pretty(&doc)
        .map_err(|e| AuditError::Internal(format!("run manifest: {e}")))?;
    bytes.push(b'\n');
    for name in RUN_REQUIRED_FILES {
        create_if_missing(&run_dir.join(name), &bytes)?;
    }
    Ok(())
}

fn create_if_missing(path: &Path, contents: &[u8]) -> AuditResult<()> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut f) => f.write_all(contents).map_err(|e| AuditError::io(path, e)),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(AuditError::io(path, e)),
    }
}

/// `<episode>/evidence/` when it holds a summary (current layout), else `<episode>/`.
pub fn resolve_episode_evidence_dir(path: &Path) -> PathBuf {
    let nested = path.join(EVIDENCE_SUBDIR);
    if nested.join(SUMMARY).is_file() {
        nested
    } else {
        path.to_path_buf()
    }
}

/// Walks up from an episode (or its evidence dir) to the run directory.
pub fn find_run_dir(episode_dir: &Path) -> Option<PathBuf> {
    episode_dir
        .ancestors()
        .take(4)
        .find(|dir| dir.join(RUN_MANIFEST).is_file())
        .map(Path::to_path_buf)
}

pub fn list_episode_dirs(run_dir: &Path) -> AuditResult<Vec<PathBuf>> {
    let root = run_dir.join(EPISODES_DIR);
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut dirs: Vec<PathBuf> = fs::read_dir(&root)
        .map_err(|e| AuditError::io(&root, e))?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

pub fn read_action_trace_level(run_dir: &Path) -> AuditResult<ActionTraceLevel> {
    let manifest = read_json_object(&run_dir.join(RUN_MANIFEST))?;
    match manifest.get("action_trace_level") {
        None | Some(Value::Null) => Ok(ActionTraceLevel::None),
        Some(Value::String(s)) => s.parse(),
        Some(other) => Err(AuditError::InvalidArgument(format!(
            "action_trace_level must be a string, got {other}"
        ))),
    }
}

pub fn validate_run_layout(run_dir: &Path) -> Vec<String> {
    let mut errors = Vec::new();
    for name in RUN_REQUIRED_FILES {
        let path = run_dir.join(name);
        if !path.is_file() {
            errors.push(format!("missing run file {name}"));
            continue;
        }
        match read_json_object(&path) {
            Ok(doc) => match doc.get("action_trace_level") {
                None => errors.push(format!("{name}: missing action_trace_level")),
                Some(Value::String(s)) if s.parse::<ActionTraceLevel>().is_ok() => {}
                Some(other) => errors.push(format!(
                    "{name}: action_trace_level must be one of none/L0/L1/L2, got {other}"
                )),
            },
            Err(e) => errors.push(e.to_string()),
        }
    }
    errors
}

pub fn validate_episode_layout(episode_dir: &Path, level: ActionTraceLevel) -> Vec<String> {
    let mut errors = Vec::new();
    let label = episode_dir.display();
    for dir in EPISODE_REQUIRED_DIRS {
        if !episode_dir.join(dir).is_dir() {
            errors.push(format!("{label}: missing directory {dir}/"));
        }
    }
    for name in EPISODE_REQUIRED_JSON {
        let path = episode_dir.join(name);
        if !path.is_file() {
            errors.push(format!("{label}: missing file {name}"));
        } else if let Err(e) = read_json_object(&path) {
            errors.push(format!("{label}: {e}"));
        }
    }
    for name in required_jsonl_files(level) {
        if !episode_dir.join(name).is_file() {
            errors.push(format!(
                "{label}: missing file {name} (action_trace_level={level})"
            ));
        }
    }
    errors
}
