//! One-pass structural audit of a whole run directory.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::device_input::validator::validate_device_input_trace;
use crate::evidence_pack::{
    list_episode_dirs, read_action_trace_level, resolve_episode_evidence_dir,
    validate_episode_layout, validate_run_layout, ActionTraceLevel, COMM_PROXY_TRACE,
    CONSENT_TRACE, DEVICE_INPUT_TRACE, EPISODE_BASELINE_JSONL, SCREEN_TRACE,
};
use crate::jsonl::read_jsonl_lenient;

pub const MAX_BUNDLE_ERRORS: usize = 50;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleAuditReport {
    pub errors: Vec<String>,
    pub episodes_checked: usize,
    /// Set once more than [`MAX_BUNDLE_ERRORS`] problems were seen.
    pub truncated: bool,
}

impl BundleAuditReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn push(&mut self, error: String) {
        if self.errors.len() < MAX_BUNDLE_ERRORS {
            self.errors.push(error);
        } else {
            self.truncated = true;
        }
    }

    fn extend(&mut self, errors: impl IntoIterator<Item = String>) {
        for e in errors {
            self.push(e);
        }
    }
}

/// Collects run/episode layout problems, JSONL parse errors and device-input-trace
/// violations across every episode, continuing past each one.
pub fn audit_bundle(run_dir: &Path) -> BundleAuditReport {
    let mut report = BundleAuditReport::default();
    report.extend(validate_run_layout(run_dir));

    let level = match read_action_trace_level(run_dir) {
        Ok(level) => level,
        Err(e) => {
            report.push(e.to_string());
            ActionTraceLevel::None
        }
    };
    let episodes = match list_episode_dirs(run_dir) {
        Ok(dirs) => dirs,
        Err(e) => {
            report.push(e.to_string());
            Vec::new()
        }
    };
    if episodes.is_empty() {
        report.push(format!("{}: no episodes", run_dir.display()));
    }

    for episode in &episodes {
        let evidence = resolve_episode_evidence_dir(episode);
        let label = episode
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        report.extend(validate_episode_layout(&evidence, level));

        for name in EPISODE_BASELINE_JSONL
            .iter()
            .chain(&[COMM_PROXY_TRACE, CONSENT_TRACE])
        {
            let path = evidence.join(name);
            if !path.is_file() {
                continue;
            }
            match read_jsonl_lenient(&path, MAX_BUNDLE_ERRORS) {
                Ok(parsed) => {
                    report.truncated |= parsed.error_count > parsed.errors.len();
                    report.extend(
                        parsed
                            .errors
                            .into_iter()
                            .map(|e| format!("{label}: {e}")),
                    );
                }
                Err(e) => report.push(format!("{label}: {e}")),
            }
        }

        let trace = evidence.join(DEVICE_INPUT_TRACE);
        if trace.is_file() {
            let screen = evidence.join(SCREEN_TRACE);
            let screen = (level == ActionTraceLevel::L0 && screen.is_file()).then_some(screen);
            report.extend(
                validate_device_input_trace(&trace, screen.as_deref())
                    .into_iter()
                    .map(|e| format!("{label}: {e}")),
            );
        }
        report.episodes_checked += 1;
    }

    tracing::info!(
        target: "droidaudit.bundle",
        run_dir = %run_dir.display(),
        episodes = report.episodes_checked,
        errors = report.errors.len(),
        truncated = report.truncated,
        "bundle audited"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence_pack::{ensure_episode_layout, ensure_run_layout, EPISODES_DIR};
    use std::fs;

    #[test]
    fn clean_run_has_no_errors() {
        let dir = tempfile::tempdir().unwrap();
        ensure_run_layout(dir.path(), ActionTraceLevel::L2).unwrap();
        let ep = dir.path().join(EPISODES_DIR).join("ep-001");
        ensure_episode_layout(&ep, ActionTraceLevel::L2).unwrap();
        let report = audit_bundle(dir.path());
        assert!(report.is_ok(), "{:?}", report.errors);
        assert_eq!(report.episodes_checked, 1);
    }

    #[test]
    fn errors_are_located_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        ensure_run_layout(dir.path(), ActionTraceLevel::None).unwrap();
        let ep = dir.path().join(EPISODES_DIR).join("ep-001");
        ensure_episode_layout(&ep, ActionTraceLevel::None).unwrap();
        fs::write(ep.join("oracle_trace.jsonl"), "{}\nnot json\n").unwrap();
        let report = audit_bundle(dir.path());
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("ep-001: oracle_trace.jsonl:2:"));

        let bad: String = (0..80).map(|_| "[]\n").collect();
        fs::write(ep.join("foreground_trace.jsonl"), bad).unwrap();
        let report = audit_bundle(dir.path());
        assert_eq!(report.errors.len(), MAX_BUNDLE_ERRORS);
        assert!(report.truncated);
    }
}
