use serde_json::{json, Value};

use super::{Detector, EpisodeEvidence};
use crate::canonical::canonical_json_string;
use crate::error::AuditResult;
use crate::evidence_pack::{AGENT_ACTION_TRACE, DEVICE_INPUT_TRACE};
use crate::facts::{payload, EvidenceRef, Fact, OracleSource};
use crate::jsonl::JsonlRecord;
use crate::policy::CaseContext;

pub const FACT_STEP_COUNT: &str = "fact.step_count";

/// Bookkeeping keys that never make two actions different.
const VOLATILE_KEYS: [&str; 6] = [
    "timestamp_ms",
    "step_idx",
    "ref_step_idx",
    "step",
    "mapping_warnings",
    "source_level",
];

fn signature(record: &JsonlRecord) -> AuditResult<String> {
    let mut action = record.value.clone();
    for key in VOLATILE_KEYS {
        action.remove(key);
    }
    canonical_json_string(&Value::Object(action))
}

/// Step total plus the longest run of identical consecutive actions.
pub struct StepCountDetector;

impl Detector for StepCountDetector {
    fn detector_id(&self) -> &'static str {
        "step_count"
    }

    fn extract(&self, evidence: &EpisodeEvidence, _ctx: &CaseContext) -> AuditResult<Vec<Fact>> {
        let mut chosen = None;
        for name in [DEVICE_INPUT_TRACE, AGENT_ACTION_TRACE] {
            if let Some(records) = evidence.records(name)? {
                if !records.is_empty() {
                    chosen = Some((name, records));
                    break;
                }
            }
        }
        let Some((source, records)) = chosen else {
            return Ok(Vec::new());
        };

        let mut best = (0usize, 0usize);
        let mut run = (0usize, 0usize);
        let mut previous: Option<String> = None;
        for record in &records {
            let sig = signature(record)?;
            if previous.as_deref() == Some(sig.as_str()) {
                run.1 += 1;
            } else {
                run = (record.line, 1);
            }
            if run.1 > best.1 {
                best = run;
            }
            previous = Some(sig);
        }

        let first_line = records.first().map_or(1, |r| r.line);
        let last_line = records.last().map_or(1, |r| r.line);
        let refs = [
            EvidenceRef::file(source),
            EvidenceRef::line(source, first_line),
            EvidenceRef::line(source, last_line),
            EvidenceRef::line(source, best.0),
        ];
        Ok(vec![Fact::new(
            FACT_STEP_COUNT,
            OracleSource::None,
            refs,
            payload(json!({
                "source": source,
                "steps": records.len(),
                "max_identical_run": best.1,
                "max_identical_run_start_line": best.0,
                "last_line": last_line,
            })),
        )?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::testing::evidence;

    #[test]
    fn prefers_device_input_trace_and_finds_longest_run() {
        let dir = tempfile::tempdir().unwrap();
        let ev = evidence(
            dir.path(),
            &[
                (
                    DEVICE_INPUT_TRACE,
                    "{\"step_idx\":0,\"event_type\":\"back\",\"payload\":{},\"timestamp_ms\":1}\n\
                     {\"step_idx\":1,\"event_type\":\"tap\",\"payload\":{\"x\":1,\"y\":2},\"timestamp_ms\":2}\n\
                     {\"step_idx\":2,\"event_type\":\"tap\",\"payload\":{\"x\":1,\"y\":2},\"timestamp_ms\":3}\n\
                     {\"step_idx\":3,\"event_type\":\"tap\",\"payload\":{\"x\":1,\"y\":2},\"timestamp_ms\":4}\n",
                ),
                (AGENT_ACTION_TRACE, "{\"type\":\"home\"}\n"),
            ],
        );
        let facts = StepCountDetector.extract(&ev, &CaseContext::default()).unwrap();
        let fact = &facts[0];
        assert_eq!(fact.get("source"), Some(&json!(DEVICE_INPUT_TRACE)));
        assert_eq!(fact.get("steps"), Some(&json!(4)));
        assert_eq!(fact.get("max_identical_run"), Some(&json!(3)));
        assert_eq!(fact.get("max_identical_run_start_line"), Some(&json!(2)));
        assert!(fact
            .evidence_refs
            .contains(&"device_input_trace.jsonl:L4".to_string()));
    }

    #[test]
    fn falls_back_to_agent_actions_when_device_trace_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ev = evidence(
            dir.path(),
            &[
                (DEVICE_INPUT_TRACE, ""),
                (AGENT_ACTION_TRACE, "{\"type\":\"home\"}\n{\"type\":\"back\"}\n"),
            ],
        );
        let facts = StepCountDetector.extract(&ev, &CaseContext::default()).unwrap();
        assert_eq!(facts[0].get("source"), Some(&json!(AGENT_ACTION_TRACE)));
        assert_eq!(facts[0].get("max_identical_run"), Some(&json!(1)));
    }

    #[test]
    fn no_action_evidence_no_fact() {
        let dir = tempfile::tempdir().unwrap();
        let ev = evidence(dir.path(), &[]);
        assert!(StepCountDetector
            .extract(&ev, &CaseContext::default())
            .unwrap()
            .is_empty());
    }
}
