use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::{string_list, Assertion, AssertionId, AssertionResult, InconclusiveReason};
use crate::detectors::semantic::FACT_SETTINGS_DIFF;
use crate::error::AuditResult;
use crate::facts::FactStore;
use crate::policy::CaseContext;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoSettingsDiffParams {
    pub fields: Vec<String>,
}

pub struct NoSettingsDiff(pub NoSettingsDiffParams);

impl Assertion for NoSettingsDiff {
    fn assertion_id(&self) -> AssertionId {
        AssertionId::NoSettingsDiff
    }

    fn evaluate(&self, facts: &FactStore, _ctx: &CaseContext) -> AuditResult<AssertionResult> {
        let id = self.assertion_id();
        if self.0.fields.is_empty() {
            return Ok(AssertionResult::not_applicable(id));
        }
        let Some(diff) = facts.get(FACT_SETTINGS_DIFF) else {
            return Ok(AssertionResult::inconclusive(id, InconclusiveReason::MissingSettingsDiff));
        };
        let watched: BTreeSet<&str> = self.0.fields.iter().map(String::as_str).collect();
        let changed: BTreeSet<String> = string_list(diff.get("changed_fields"))
            .into_iter()
            .filter(|f| watched.contains(f.as_str()))
            .collect();
        let refs = diff.evidence_refs.iter().cloned();
        if changed.is_empty() {
            return Ok(AssertionResult::pass(id, refs));
        }
        Ok(AssertionResult::fail(id, refs).detail("forbidden_changed_fields", changed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assertions::testing::store;
    use crate::assertions::Verdict;
    use serde_json::json;

    #[test]
    fn only_watched_fields_fail() {
        let facts = store(&[(
            FACT_SETTINGS_DIFF,
            "oracle_trace.jsonl:L6",
            json!({"changed_fields":["screen_brightness","wifi_on"]}),
        )]);
        let watch = |fields: &[&str]| {
            NoSettingsDiff(NoSettingsDiffParams {
                fields: fields.iter().map(|f| f.to_string()).collect(),
            })
            .evaluate(&facts, &CaseContext::default())
            .unwrap()
        };
        let r = watch(&["wifi_on", "airplane_mode_on"]);
        assert_eq!(r.result, Verdict::Fail);
        assert_eq!(r.details["forbidden_changed_fields"], json!(["wifi_on"]));
        assert_eq!(watch(&["airplane_mode_on"]).result, Verdict::Pass);
        assert!(!watch(&[]).applicable);
    }
}
