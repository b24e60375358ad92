use serde_json::json;

use super::{Detector, EpisodeEvidence};
use crate::error::AuditResult;
use crate::evidence_pack::FOREGROUND_TRACE;
use crate::facts::{payload, EvidenceRef, Fact, OracleSource};
use crate::policy::CaseContext;

pub const FACT_FOREGROUND_TRANSITIONS: &str = "fact.foreground.transitions";

/// Counts and sequences foreground-package changes.
pub struct ForegroundDetector;

impl Detector for ForegroundDetector {
    fn detector_id(&self) -> &'static str {
        "foreground"
    }

    fn extract(&self, evidence: &EpisodeEvidence, _ctx: &CaseContext) -> AuditResult<Vec<Fact>> {
        let Some(records) = evidence.records(FOREGROUND_TRACE)? else {
            return Ok(Vec::new());
        };

        let mut sequence: Vec<String> = Vec::new();
        let mut refs = vec![EvidenceRef::file(FOREGROUND_TRACE).to_string()];
        for record in &records {
            let Some(package) = record
                .get_str("package")
                .or_else(|| record.get_str("foreground_package"))
            else {
                continue;
            };
            if sequence.last().map(String::as_str) != Some(package) {
                sequence.push(package.to_string());
                refs.push(EvidenceRef::line(FOREGROUND_TRACE, record.line).to_string());
            }
        }

        let mut visited = sequence.clone();
        visited.sort();
        visited.dedup();
        let payload = payload(json!({
            "transition_count": sequence.len().saturating_sub(1),
            "sequence": sequence,
            "packages_visited": visited,
            "first_package": sequence.first(),
            "last_package": sequence.last(),
        }));
        Ok(vec![Fact::new(
            FACT_FOREGROUND_TRANSITIONS,
            OracleSource::None,
            refs,
            payload,
        )?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::testing::evidence;

    #[test]
    fn collapses_repeats_and_counts_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let ev = evidence(
            dir.path(),
            &[(
                FOREGROUND_TRACE,
                "{\"timestamp_ms\":1,\"package\":\"com.android.launcher\"}\n\
                 {\"timestamp_ms\":2,\"package\":\"com.android.settings\"}\n\
                 {\"timestamp_ms\":3,\"package\":\"com.android.settings\"}\n\
                 {\"timestamp_ms\":4,\"package\":\"com.android.launcher\"}\n",
            )],
        );
        let facts = ForegroundDetector.extract(&ev, &CaseContext::default()).unwrap();
        let fact = &facts[0];
        assert_eq!(fact.get("transition_count"), Some(&json!(2)));
        assert_eq!(
            fact.get("packages_visited"),
            Some(&json!(["com.android.launcher", "com.android.settings"]))
        );
        assert_eq!(
            fact.evidence_refs,
            vec![
                "foreground_trace.jsonl",
                "foreground_trace.jsonl:L1",
                "foreground_trace.jsonl:L2",
                "foreground_trace.jsonl:L4"
            ]
        );
    }

    #[test]
    fn absent_trace_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let ev = evidence(dir.path(), &[]);
        assert!(ForegroundDetector
            .extract(&ev, &CaseContext::default())
            .unwrap()
            .is_empty());
    }
}
