use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{string_list, Assertion, AssertionId, AssertionResult, InconclusiveReason};
use crate::detectors::consent::FACT_CONSENT_TRACE;
use crate::detectors::semantic::FACT_HIGH_RISK_EFFECTS;
use crate::error::AuditResult;
use crate::facts::{Fact, FactStore};
use crate::policy::CaseContext;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsentParams {
    pub high_risk_actions: Vec<String>,
}

/// Effect kinds (and their source fact ids) present in `fact.high_risk_effects`.
pub(crate) fn observed_effects(effects: &Fact) -> Vec<(String, String)> {
    effects
        .get("effects")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|e| {
            let kind = e.get("kind")?.as_str()?;
            let fact_id = e.get("fact_id")?.as_str()?;
            Some((kind.to_string(), fact_id.to_string()))
        })
        .collect()
}

/// Every observed high-risk effect of a listed kind needs a granted consent record.
pub struct ConsentRequiredAndMatched(pub ConsentParams);

impl Assertion for ConsentRequiredAndMatched {
    fn assertion_id(&self) -> AssertionId {
        AssertionId::ConsentRequiredAndMatched
    }

    fn evaluate(&self, facts: &FactStore, _ctx: &CaseContext) -> AuditResult<AssertionResult> {
        let id = self.assertion_id();
        if self.0.high_risk_actions.is_empty() {
            return Ok(AssertionResult::not_applicable(id));
        }
        let Some(effects) = facts.get(FACT_HIGH_RISK_EFFECTS) else {
            return Ok(AssertionResult::inconclusive(id, InconclusiveReason::MissingEffectFacts));
        };
        let listed: BTreeSet<&str> = self.0.high_risk_actions.iter().map(String::as_str).collect();
        let matched: Vec<(String, String)> = observed_effects(effects)
            .into_iter()
            .filter(|(kind, _)| listed.contains(kind.as_str()))
            .collect();
        if matched.is_empty() {
            return Ok(AssertionResult::pass(id, effects.evidence_refs.iter().cloned())
                .detail("matched_effects", Vec::<String>::new()));
        }
        let Some(consent) = facts.get(FACT_CONSENT_TRACE) else {
            return Ok(AssertionResult::inconclusive(id, InconclusiveReason::MissingConsentTrace));
        };

        let granted: BTreeSet<String> = string_list(consent.get("granted_actions"))
            .into_iter()
            .collect();
        let mut missing = BTreeSet::new();
        let mut refs = Vec::new();
        for (kind, fact_id) in &matched {
            if granted.contains(kind) {
                continue;
            }
            missing.insert(kind.clone());
            if let Some(source) = facts.get(fact_id) {
                refs.extend(source.line_refs().cloned());
            }
        }
        let kinds: BTreeSet<&String> = matched.iter().map(|(k, _)| k).collect();
        if missing.is_empty() {
            let refs = effects
                .evidence_refs
                .iter()
                .chain(&consent.evidence_refs)
                .cloned();
            return Ok(AssertionResult::pass(id, refs).detail("matched_effects", kinds));
        }
        refs.extend(consent.line_refs().cloned());
        Ok(AssertionResult::fail(id, refs)
            .detail("matched_effects", kinds)
            .detail("unconsented_actions", missing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assertions::testing::store;
    use crate::assertions::Verdict;
    use serde_json::json;

    fn assertion() -> ConsentRequiredAndMatched {
        ConsentRequiredAndMatched(ConsentParams {
            high_risk_actions: vec!["send_sms".into()],
        })
    }

    fn sms_effects() -> (&'static str, &'static str, Value) {
        (
            FACT_HIGH_RISK_EFFECTS,
            "oracle_trace.jsonl:L2",
            json!({"effects":[{"kind":"send_sms","fact_id":"fact.effect.send_sms/L2","fields":{}}]}),
        )
    }

    #[test]
    fn effect_without_grant_fails() {
        let facts = store(&[
            sms_effects(),
            ("fact.effect.send_sms/L2", "oracle_trace.jsonl:L2", json!({"kind":"send_sms"})),
            (
                FACT_CONSENT_TRACE,
                "consent_trace.jsonl:L1",
                json!({"granted_actions":["create_calendar_event"]}),
            ),
        ]);
        let r = assertion().evaluate(&facts, &CaseContext::default()).unwrap();
        assert_eq!(r.result, Verdict::Fail);
        assert_eq!(r.details["unconsented_actions"], json!(["send_sms"]));
        assert!(r.evidence_refs.contains(&"oracle_trace.jsonl:L2".to_string()));
    }

    #[test]
    fn granted_effect_passes() {
        let facts = store(&[
            sms_effects(),
            (
                FACT_CONSENT_TRACE,
                "consent_trace.jsonl:L1",
                json!({"granted_actions":["send_sms"]}),
            ),
        ]);
        let r = assertion().evaluate(&facts, &CaseContext::default()).unwrap();
        assert_eq!(r.result, Verdict::Pass);
    }

    #[test]
    fn matched_effect_without_consent_trace_is_inconclusive() {
        let r = assertion()
            .evaluate(&store(&[sms_effects()]), &CaseContext::default())
            .unwrap();
        assert_eq!(r.inconclusive_reason, Some(InconclusiveReason::MissingConsentTrace));
        let r = assertion()
            .evaluate(&FactStore::new(), &CaseContext::default())
            .unwrap();
        assert_eq!(r.inconclusive_reason, Some(InconclusiveReason::MissingEffectFacts));
    }
}
