//! Device-state oracle protocol.
//!
//! Concrete oracles live outside this crate. They implement [`Oracle`], query the
//! device through the capability traits in [`controller`], bind historical queries
//! to a [`time_window::TimeWindow`] and store raw command output in the
//! [`artifacts::ArtifactStore`]. Events go to `oracle_trace.jsonl` through
//! [`trace::OracleTraceWriter`].

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::digest_hex;
use crate::error::AuditResult;

pub mod artifacts;
pub mod controller;
pub mod hybrid;
pub mod time_window;
pub mod trace;

use artifacts::ArtifactStore;
use controller::DeviceController;
use time_window::{EpisodeTime, HostClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleType {
    /// Deterministic device-state query.
    Hard,
    /// Heuristic or model-graded.
    Soft,
    /// Hard first, soft only when the hard decision is inconclusive.
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OraclePhase {
    Pre,
    Post,
}

impl OraclePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pre => "pre",
            Self::Post => "post",
        }
    }
}

impl fmt::Display for OraclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    AdbShell,
    Dumpsys,
    PullFile,
    Foreground,
    TimeAnchor,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AdbShell => "adb_shell",
            Self::Dumpsys => "dumpsys",
            Self::PullFile => "pull_file",
            Self::Foreground => "foreground",
            Self::TimeAnchor => "time_anchor",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleDecision {
    pub success: bool,
    pub score: f64,
    pub reason: String,
    pub conclusive: bool,
}

impl OracleDecision {
    /// `score` is clamped to `[0, 1]`; NaN becomes 0.
    pub fn new(success: bool, score: f64, reason: impl Into<String>, conclusive: bool) -> Self {
        let score = if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) };
        Self {
            success,
            score,
            reason: reason.into(),
            conclusive,
        }
    }

    pub fn pass(reason: impl Into<String>) -> Self {
        Self::new(true, 1.0, reason, true)
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self::new(false, 0.0, reason, true)
    }

    pub fn inconclusive(reason: impl Into<String>) -> Self {
        Self::new(false, 0.0, reason, false)
    }

    pub fn with_reason_prefix(mut self, prefix: &str) -> Self {
        self.reason = format!("{prefix}{}", self.reason);
        self
    }
}

/// Content-addressed raw output. `path` is relative to the episode directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub path: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub mime: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleEvent {
    pub oracle_id: String,
    pub oracle_name: String,
    pub oracle_type: OracleType,
    pub phase: OraclePhase,
    #[serde(default)]
    pub timestamp_ms: i64,
    #[serde(default)]
    pub queries: Vec<Value>,
    #[serde(default)]
    pub result_digest: Option<String>,
    /// Structured query result; may hold user data, facts must not copy it.
    #[serde(default)]
    pub result_preview: Option<Value>,
    pub decision: OracleDecision,
    #[serde(default)]
    pub capabilities_required: Vec<Capability>,
    #[serde(default)]
    pub missing_capabilities: Vec<Capability>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
    #[serde(default)]
    pub anti_gaming_notes: Vec<String>,
}

impl OracleEvent {
    pub fn builder(
        oracle_id: impl Into<String>,
        oracle_name: impl Into<String>,
        oracle_type: OracleType,
        phase: OraclePhase,
    ) -> OracleEventBuilder {
        OracleEventBuilder {
            event: OracleEvent {
                oracle_id: oracle_id.into(),
                oracle_name: oracle_name.into(),
                oracle_type,
                phase,
                timestamp_ms: 0,
                queries: Vec::new(),
                result_digest: None,
                result_preview: None,
                decision: OracleDecision::inconclusive("no_decision"),
                capabilities_required: Vec::new(),
                missing_capabilities: Vec::new(),
                artifacts: Vec::new(),
                anti_gaming_notes: Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct OracleEventBuilder {
    event: OracleEvent,
}

impl OracleEventBuilder {
    pub fn timestamp_ms(mut self, ts: i64) -> Self {
        self.event.timestamp_ms = ts;
        self
    }

    pub fn query(mut self, query: Value) -> Self {
        self.event.queries.push(query);
        self
    }

    /// Records the structured result and its canonical digest.
    pub fn result(mut self, result: Value) -> AuditResult<Self> {
        self.event.result_digest = Some(digest_hex(&result)?);
        self.event.result_preview = Some(result);
        Ok(self)
    }

    pub fn requires(mut self, caps: &[Capability]) -> Self {
        self.event.capabilities_required = caps.to_vec();
        self
    }

    pub fn missing(mut self, caps: Vec<Capability>) -> Self {
        self.event.missing_capabilities = caps;
        self
    }

    pub fn artifact(mut self, artifact: ArtifactRef) -> Self {
        self.event.artifacts.push(artifact);
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.event.anti_gaming_notes.push(note.into());
        self
    }

    pub fn decision(mut self, decision: OracleDecision) -> Self {
        self.event.decision = decision;
        self
    }

    /// Any missing capability replaces the decision with an inconclusive one.
    pub fn build(mut self) -> OracleEvent {
        if !self.event.missing_capabilities.is_empty() {
            let missing: Vec<&str> = self
                .event
                .missing_capabilities
                .iter()
                .map(|c| c.as_str())
                .collect();
            self.event.decision =
                OracleDecision::inconclusive(format!("missing_capability:{}", missing.join(",")));
        }
        self.event
    }
}

/// What an oracle gets to look at during a check.
pub struct OracleContext<'a> {
    pub episode_dir: &'a Path,
    pub controller: &'a dyn DeviceController,
    pub episode_time: Option<&'a EpisodeTime>,
    pub artifacts: &'a ArtifactStore,
    pub clock: &'a dyn HostClock,
}

pub trait Oracle: Send + Sync {
    fn oracle_id(&self) -> &str;
    fn oracle_name(&self) -> &str;
    fn oracle_type(&self) -> OracleType;

    fn capabilities_required(&self) -> &[Capability] {
        &[]
    }

    fn pre_check(&self, _ctx: &OracleContext<'_>) -> AuditResult<Vec<OracleEvent>> {
        Ok(Vec::new())
    }

    fn post_check(&self, ctx: &OracleContext<'_>) -> AuditResult<Vec<OracleEvent>>;
}

/// The decision of the last event emitted by `oracle_id`.
pub fn decision_for<'a>(events: &'a [OracleEvent], oracle_id: &str) -> Option<&'a OracleDecision> {
    events
        .iter()
        .rev()
        .find(|e| e.oracle_id == oracle_id)
        .map(|e| &e.decision)
}
