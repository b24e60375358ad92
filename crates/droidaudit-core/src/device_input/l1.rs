//! L1: map agent-reported raw events (`agent_events_v1`) onto the canonical trace.

use std::path::Path;

use serde_json::Value;

use super::normalize::normalize_action;
use super::{persist_mapped_trace, DeviceInputEvent, MappingConfig, MappingStats, SourceLevel};
use crate::error::AuditResult;
use crate::jsonl::{file_label, read_jsonl, JsonlParseError, JsonlRecord};

pub const AGENT_EVENTS_V1: &str = "agent_events_v1";

/// Agent step the event belongs to, when the agent reported one.
pub(crate) fn reported_step(value: &serde_json::Map<String, Value>) -> Option<u64> {
    ["ref_step_idx", "step_idx", "step"]
        .iter()
        .find_map(|k| value.get(*k).and_then(Value::as_u64))
}

/// Pure mapping over already-parsed records. Every record yields exactly one event.
pub fn map_agent_events(
    file: &str,
    records: &[JsonlRecord],
    cfg: &MappingConfig,
) -> Result<(Vec<DeviceInputEvent>, MappingStats), JsonlParseError> {
    let mut stats = MappingStats {
        source_level: Some(SourceLevel::L1),
        ..MappingStats::default()
    };
    let mut events = Vec::with_capacity(records.len());
    for record in records {
        stats.input_total_count += 1;
        if let Some(format) = record.get_str("format") {
            if format != AGENT_EVENTS_V1 {
                return Err(JsonlParseError {
                    file: file.to_string(),
                    line: record.line,
                    message: format!("unsupported raw event format {format:?}"),
                });
            }
        }
        let timestamp_ms = record.get_i64("timestamp_ms").ok_or_else(|| JsonlParseError {
            file: file.to_string(),
            line: record.line,
            message: "missing integer timestamp_ms".to_string(),
        })?;
        stats.action_candidate_count += 1;
        let normalized = normalize_action(&record.value, cfg.geometry.as_ref());
        let event = DeviceInputEvent {
            step_idx: events.len() as u64,
            ref_step_idx: reported_step(&record.value),
            source_level: SourceLevel::L1,
            event_type: normalized.event_type,
            payload: normalized.payload,
            timestamp_ms,
            mapping_warnings: normalized.warnings,
        };
        stats.observe(&event);
        events.push(event);
    }
    Ok((events, stats))
}

/// Reads `raw_events_path`, maps it and rewrites the episode's trace + stats.
pub fn materialize_l1_device_input_trace(
    raw_events_path: &Path,
    episode_dir: &Path,
    cfg: &MappingConfig,
) -> AuditResult<MappingStats> {
    let records = read_jsonl(raw_events_path)?;
    let (events, stats) = map_agent_events(&file_label(raw_events_path), &records, cfg)?;
    persist_mapped_trace(episode_dir, &events, &stats)?;
    Ok(stats)
}
