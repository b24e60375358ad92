//! Detectors read an episode's evidence and derive [`Fact`]s. They never write.
//!
//! The built-in registry is a fixed, ordered table; the audit engine runs every
//! entry and treats a detector error as "produced no facts".

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AuditError, AuditResult};
use crate::evidence_pack::{find_run_dir, read_action_trace_level, ActionTraceLevel, ORACLE_TRACE};
use crate::facts::Fact;
use crate::jsonl::{read_jsonl, JsonlParseError, JsonlRecord};
use crate::oracle::OracleEvent;
use crate::policy::CaseContext;

pub mod canary;
pub mod consent;
pub mod foreground;
pub mod oracle_index;
pub mod semantic;
pub mod step_count;

/// Read-only view of one episode's evidence directory.
#[derive(Debug, Clone)]
pub struct EpisodeEvidence {
    pub evidence_dir: PathBuf,
    pub run_dir: Option<PathBuf>,
    pub action_trace_level: ActionTraceLevel,
}

impl EpisodeEvidence {
    pub fn open(evidence_dir: &Path) -> AuditResult<Self> {
        if !evidence_dir.is_dir() {
            return Err(AuditError::NotFound(format!(
                "episode directory {}",
                evidence_dir.display()
            )));
        }
        let run_dir = find_run_dir(evidence_dir);
        let action_trace_level = match &run_dir {
            Some(run) => read_action_trace_level(run)?,
            None => ActionTraceLevel::None,
        };
        Ok(Self {
            evidence_dir: evidence_dir.to_path_buf(),
            run_dir,
            action_trace_level,
        })
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.evidence_dir.join(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.path(name).is_file()
    }

    /// Records of `name`, or `None` when the file does not exist.
    pub fn records(&self, name: &str) -> AuditResult<Option<Vec<JsonlRecord>>> {
        let path = self.path(name);
        if !path.is_file() {
            return Ok(None);
        }
        read_jsonl(&path).map(Some)
    }

    pub fn text(&self, name: &str) -> AuditResult<Option<String>> {
        let path = self.path(name);
        if !path.is_file() {
            return Ok(None);
        }
        fs::read_to_string(&path)
            .map(Some)
            .map_err(|e| AuditError::io(&path, e))
    }

    /// Line-numbered oracle events; `None` when the trace is absent.
    pub fn oracle_events(&self) -> AuditResult<Option<Vec<(usize, OracleEvent)>>> {
        let Some(records) = self.records(ORACLE_TRACE)? else {
            return Ok(None);
        };
        records
            .into_iter()
            .map(|r| {
                serde_json::from_value(serde_json::Value::Object(r.value))
                    .map(|event| (r.line, event))
                    .map_err(|e| {
                        AuditError::Parse(JsonlParseError {
                            file: ORACLE_TRACE.to_string(),
                            line: r.line,
                            message: format!("oracle event schema: {e}"),
                        })
                    })
            })
            .collect::<AuditResult<Vec<_>>>()
            .map(Some)
    }
}

pub trait Detector: Send + Sync {
    fn detector_id(&self) -> &'static str;
    fn extract(&self, evidence: &EpisodeEvidence, ctx: &CaseContext) -> AuditResult<Vec<Fact>>;
}

/// Built-in detectors in execution order.
pub fn builtin_detectors() -> Vec<Box<dyn Detector>> {
    vec![
        Box::new(foreground::ForegroundDetector),
        Box::new(oracle_index::OracleIndexDetector),
        Box::new(semantic::OracleSemanticDetector::with_builtin_adapters()),
        Box::new(step_count::StepCountDetector),
        Box::new(canary::CanaryScanDetector),
        Box::new(consent::ConsentTraceDetector),
    ]
}
