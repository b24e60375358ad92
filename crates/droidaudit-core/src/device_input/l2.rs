//! L2: map calls observed by the comm proxy (`comm_proxy_trace.jsonl`).

use std::path::Path;

use serde_json::{Map, Value};

use super::l1::reported_step;
use super::normalize::normalize_action;
use super::{
    persist_mapped_trace, DeviceEventType, DeviceInputEvent, MappingConfig, MappingStats,
    SourceLevel, EVENT_TYPE_UNSUPPORTED_PREFIX,
};
use crate::error::AuditResult;
use crate::jsonl::{file_label, read_jsonl, JsonlParseError, JsonlRecord};

pub const DEFAULT_ACTION_ENDPOINT: &str = "/act";

fn is_action_candidate(record: &JsonlRecord, endpoint: &str) -> bool {
    record.get_str("direction") == Some("request")
        && record.get_str("endpoint") == Some(endpoint)
        && record
            .get_str("method")
            .map_or(true, |m| m.eq_ignore_ascii_case("POST"))
}

/// Candidates are `request` records to the action endpoint; `step_idx` follows
/// candidate order, not the record index.
pub fn map_comm_proxy_records(
    file: &str,
    records: &[JsonlRecord],
    cfg: &MappingConfig,
) -> Result<(Vec<DeviceInputEvent>, MappingStats), JsonlParseError> {
    let mut stats = MappingStats {
        source_level: Some(SourceLevel::L2),
        input_total_count: records.len() as u64,
        ..MappingStats::default()
    };
    let mut events = Vec::new();
    for record in records {
        if !is_action_candidate(record, &cfg.action_endpoint) {
            stats.skipped_non_action_count += 1;
            continue;
        }
        stats.action_candidate_count += 1;
        let timestamp_ms = record.get_i64("timestamp_ms").ok_or_else(|| JsonlParseError {
            file: file.to_string(),
            line: record.line,
            message: "missing integer timestamp_ms".to_string(),
        })?;
        let step_idx = events.len() as u64;
        let event = match record.value.get("payload") {
            Some(Value::Object(payload)) => {
                let normalized = normalize_action(payload, cfg.geometry.as_ref());
                DeviceInputEvent {
                    step_idx,
                    ref_step_idx: reported_step(payload),
                    source_level: SourceLevel::L2,
                    event_type: normalized.event_type,
                    payload: normalized.payload,
                    timestamp_ms,
                    mapping_warnings: normalized.warnings,
                }
            }
            // Body was not a JSON object; the proxy kept only its digest.
            _ => {
                let mut payload = Map::new();
                if let Some(digest) = record.value.get("payload_digest") {
                    payload.insert("payload_digest".to_string(), digest.clone());
                }
                DeviceInputEvent {
                    step_idx,
                    ref_step_idx: None,
                    source_level: SourceLevel::L2,
                    event_type: DeviceEventType::Wait,
                    payload,
                    timestamp_ms,
                    mapping_warnings: vec![
                        format!("{EVENT_TYPE_UNSUPPORTED_PREFIX}<unparsed>"),
                        "payload_unparsed".to_string(),
                    ],
                }
            }
        };
        stats.observe(&event);
        events.push(event);
    }
    Ok((events, stats))
}

pub fn materialize_l2_device_input_trace(
    comm_proxy_trace_path: &Path,
    episode_dir: &Path,
    cfg: &MappingConfig,
) -> AuditResult<MappingStats> {
    let records = read_jsonl(comm_proxy_trace_path)?;
    let (events, stats) =
        map_comm_proxy_records(&file_label(comm_proxy_trace_path), &records, cfg)?;
    persist_mapped_trace(episode_dir, &events, &stats)?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonl::parse_jsonl_str;
    use serde_json::json;

    fn records(text: &str) -> Vec<JsonlRecord> {
        let parsed = parse_jsonl_str("comm_proxy_trace.jsonl", text, 10);
        assert_eq!(parsed.error_count, 0);
        parsed.records
    }

    #[test]
    fn only_action_requests_become_events() {
        let text = [
            r#"{"direction":"request","endpoint":"/health","method":"GET","timestamp_ms":1}"#,
            r#"{"direction":"request","endpoint":"/act","method":"POST","timestamp_ms":2,"payload":{"type":"home"}}"#,
            r#"{"direction":"response","endpoint":"/act","status":200,"timestamp_ms":3,"payload":{"ok":true}}"#,
            r#"{"direction":"request","endpoint":"/act","method":"POST","timestamp_ms":4,"payload_digest":"abc"}"#,
        ]
        .join("\n");
        let (events, stats) =
            map_comm_proxy_records("comm_proxy_trace.jsonl", &records(&text), &MappingConfig::default())
                .unwrap();
        assert_eq!(stats.input_total_count, 4);
        assert_eq!(stats.action_candidate_count, 2);
        assert_eq!(stats.skipped_non_action_count, 2);
        assert_eq!(stats.unsupported_event_type_count, 1);
        assert_eq!(events[0].step_idx, 0);
        assert_eq!(events[0].event_type, DeviceEventType::Home);
        assert_eq!(events[1].step_idx, 1);
        assert_eq!(events[1].event_type, DeviceEventType::Wait);
        assert_eq!(Value::Object(events[1].payload.clone()), json!({"payload_digest":"abc"}));
        assert!(events[1].has_warning("payload_unparsed"));
    }

    #[test]
    fn custom_endpoint_is_honored() {
        let text = r#"{"direction":"request","endpoint":"/v2/act","timestamp_ms":9,"payload":{"type":"back","step":3}}"#;
        let cfg = MappingConfig {
            action_endpoint: "/v2/act".to_string(),
            geometry: None,
        };
        let (events, stats) = map_comm_proxy_records("t", &records(text), &cfg).unwrap();
        assert_eq!(stats.mapped_action_count, 1);
        assert_eq!(events[0].ref_step_idx, Some(3));
        let (events, _) =
            map_comm_proxy_records("t", &records(text), &MappingConfig::default()).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn candidate_without_timestamp_is_located() {
        let text = "{\"direction\":\"message\",\"endpoint\":\"/act\"}\n{\"direction\":\"request\",\"endpoint\":\"/act\",\"payload\":{\"type\":\"home\"}}";
        let err = map_comm_proxy_records("comm_proxy_trace.jsonl", &records(text), &MappingConfig::default())
            .unwrap_err();
        assert_eq!(err.line, 2);
    }
}
