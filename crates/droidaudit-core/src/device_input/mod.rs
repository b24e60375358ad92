//! Canonical device-input trace (`device_input_trace.jsonl`).
//!
//! Exactly one producer writes the trace of an episode:
//! - L0: the executor, through [`l0::L0TraceWriter`]
//! - L1: agent-reported events, through [`l1::materialize_l1_device_input_trace`]
//! - L2: comm-proxy observed calls, through [`l2::materialize_l2_device_input_trace`]
//!
//! [`validator::validate_device_input_trace`] re-checks a written trace against the
//! per-level strictness rules.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AuditResult;
use crate::evidence_pack::{DEVICE_INPUT_TRACE, DEVICE_INPUT_TRACE_STATS};
use crate::jsonl::{write_json_pretty, write_jsonl};

pub mod finalize;
pub mod l0;
pub mod l1;
pub mod l2;
pub mod normalize;
pub mod validator;

pub const COORD_UNRESOLVED: &str = "coord_unresolved";
pub const EVENT_TYPE_UNSUPPORTED_PREFIX: &str = "event_type_unsupported:";
pub const PHYSICAL_PX: &str = "physical_px";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceLevel {
    L0,
    L1,
    L2,
}

impl SourceLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::L0 => "L0",
            Self::L1 => "L1",
            Self::L2 => "L2",
        }
    }
}

impl fmt::Display for SourceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceEventType {
    Tap,
    DoubleTap,
    LongPress,
    Swipe,
    Type,
    Back,
    Home,
    Enter,
    OpenApp,
    Wait,
    Finished,
}

impl DeviceEventType {
    pub const ALL: [DeviceEventType; 11] = [
        Self::Tap,
        Self::DoubleTap,
        Self::LongPress,
        Self::Swipe,
        Self::Type,
        Self::Back,
        Self::Home,
        Self::Enter,
        Self::OpenApp,
        Self::Wait,
        Self::Finished,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tap => "tap",
            Self::DoubleTap => "double_tap",
            Self::LongPress => "long_press",
            Self::Swipe => "swipe",
            Self::Type => "type",
            Self::Back => "back",
            Self::Home => "home",
            Self::Enter => "enter",
            Self::OpenApp => "open_app",
            Self::Wait => "wait",
            Self::Finished => "finished",
        }
    }

    pub fn from_canonical(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Events addressed by a single `x`/`y` point.
    pub fn is_point(self) -> bool {
        matches!(self, Self::Tap | Self::DoubleTap | Self::LongPress)
    }

    pub fn is_coordinate(self) -> bool {
        self.is_point() || self == Self::Swipe
    }
}

impl fmt::Display for DeviceEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalized action at a known fidelity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceInputEvent {
    pub step_idx: u64,
    pub ref_step_idx: Option<u64>,
    pub source_level: SourceLevel,
    pub event_type: DeviceEventType,
    pub payload: Map<String, Value>,
    pub timestamp_ms: i64,
    pub mapping_warnings: Vec<String>,
}

impl DeviceInputEvent {
    pub fn has_warning(&self, warning: &str) -> bool {
        self.mapping_warnings.iter().any(|w| w == warning)
    }
}

/// Physical screen size used to coerce normalized and dp coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenGeometry {
    pub width_px: u32,
    pub height_px: u32,
    #[serde(default)]
    pub density_dpi: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingConfig {
    pub action_endpoint: String,
    pub geometry: Option<ScreenGeometry>,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            action_endpoint: l2::DEFAULT_ACTION_ENDPOINT.to_string(),
            geometry: None,
        }
    }
}

/// Counts persisted next to a mapped trace as `device_input_trace_stats.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingStats {
    pub source_level: Option<SourceLevel>,
    pub input_total_count: u64,
    pub action_candidate_count: u64,
    pub mapped_action_count: u64,
    pub skipped_non_action_count: u64,
    pub unsupported_event_type_count: u64,
    pub coord_unresolved_count: u64,
}

impl MappingStats {
    pub(crate) fn observe(&mut self, event: &DeviceInputEvent) {
        self.mapped_action_count += 1;
        if event.has_warning(COORD_UNRESOLVED) {
            self.coord_unresolved_count += 1;
        }
        if event
            .mapping_warnings
            .iter()
            .any(|w| w.starts_with(EVENT_TYPE_UNSUPPORTED_PREFIX))
        {
            self.unsupported_event_type_count += 1;
        }
    }
}

/// Rewrites the episode's trace and its mapping stats. Re-mapping is deterministic.
pub(crate) fn persist_mapped_trace(
    episode_dir: &Path,
    events: &[DeviceInputEvent],
    stats: &MappingStats,
) -> AuditResult<()> {
    write_jsonl(&episode_dir.join(DEVICE_INPUT_TRACE), events)?;
    write_json_pretty(&episode_dir.join(DEVICE_INPUT_TRACE_STATS), stats)?;
    tracing::info!(
        target: "droidaudit.trace",
        episode_dir = %episode_dir.display(),
        source_level = ?stats.source_level,
        input_total = stats.input_total_count,
        mapped = stats.mapped_action_count,
        skipped_non_action = stats.skipped_non_action_count,
        coord_unresolved = stats.coord_unresolved_count,
        "device input trace materialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_names_round_trip() {
        for t in DeviceEventType::ALL {
            assert_eq!(DeviceEventType::from_canonical(t.as_str()), Some(t));
            let encoded = serde_json::to_value(t).unwrap();
            assert_eq!(encoded, Value::String(t.as_str().to_string()));
        }
        assert!(DeviceEventType::Swipe.is_coordinate());
        assert!(!DeviceEventType::Swipe.is_point());
        assert!(!DeviceEventType::Type.is_coordinate());
    }
}
