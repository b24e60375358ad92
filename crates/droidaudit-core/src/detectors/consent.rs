use std::collections::BTreeSet;

use serde_json::{json, Value};

use super::{Detector, EpisodeEvidence};
use crate::error::AuditResult;
use crate::evidence_pack::CONSENT_TRACE;
use crate::facts::{payload, EvidenceRef, Fact, OracleSource};
use crate::policy::CaseContext;

pub const FACT_CONSENT_TRACE: &str = "fact.consent_trace";

/// Summarizes `consent_trace.jsonl` records of the form `{action, granted, clarified}`.
pub struct ConsentTraceDetector;

impl Detector for ConsentTraceDetector {
    fn detector_id(&self) -> &'static str {
        "consent_trace"
    }

    fn extract(&self, evidence: &EpisodeEvidence, _ctx: &CaseContext) -> AuditResult<Vec<Fact>> {
        let Some(records) = evidence.records(CONSENT_TRACE)? else {
            return Ok(Vec::new());
        };

        let mut granted = BTreeSet::new();
        let mut clarified = BTreeSet::new();
        let mut entries = Vec::with_capacity(records.len());
        let mut refs = vec![EvidenceRef::file(CONSENT_TRACE)];
        for record in &records {
            let Some(action) = record.get_str("action") else {
                continue;
            };
            let flag = |k: &str| record.value.get(k).and_then(Value::as_bool).unwrap_or(false);
            let (is_granted, is_clarified) = (flag("granted"), flag("clarified"));
            if is_granted {
                granted.insert(action.to_string());
            }
            if is_clarified {
                clarified.insert(action.to_string());
            }
            entries.push(json!({
                "action": action,
                "granted": is_granted,
                "clarified": is_clarified,
                "line": record.line,
            }));
            refs.push(EvidenceRef::line(CONSENT_TRACE, record.line));
        }

        Ok(vec![Fact::new(
            FACT_CONSENT_TRACE,
            OracleSource::None,
            refs,
            payload(json!({
                "records": entries,
                "granted_actions": granted,
                "clarified_actions": clarified,
            })),
        )?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::testing::evidence;

    #[test]
    fn collects_granted_and_clarified_actions() {
        let dir = tempfile::tempdir().unwrap();
        let ev = evidence(
            dir.path(),
            &[(
                CONSENT_TRACE,
                "{\"action\":\"send_sms\",\"granted\":true}\n\
                 {\"action\":\"install_package\",\"granted\":false,\"clarified\":true}\n\
                 {\"note\":\"ignored\"}\n",
            )],
        );
        let facts = ConsentTraceDetector.extract(&ev, &CaseContext::default()).unwrap();
        let fact = &facts[0];
        assert_eq!(fact.get("granted_actions"), Some(&json!(["send_sms"])));
        assert_eq!(fact.get("clarified_actions"), Some(&json!(["install_package"])));
        assert_eq!(fact.line_refs().count(), 2);
    }
}
