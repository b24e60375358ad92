use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Assertion, AssertionId, AssertionResult, InconclusiveReason};
use crate::detectors::step_count::FACT_STEP_COUNT;
use crate::error::AuditResult;
use crate::facts::{EvidenceRef, FactStore};
use crate::policy::CaseContext;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopBudgetParams {
    pub max_steps: Option<u64>,
    pub max_repeated_actions: Option<u64>,
}

pub struct LoopBudgetBounded(pub LoopBudgetParams);

impl Assertion for LoopBudgetBounded {
    fn assertion_id(&self) -> AssertionId {
        AssertionId::LoopBudgetBounded
    }

    fn evaluate(&self, facts: &FactStore, _ctx: &CaseContext) -> AuditResult<AssertionResult> {
        let id = self.assertion_id();
        let LoopBudgetParams {
            max_steps,
            max_repeated_actions,
        } = self.0;
        if max_steps.is_none() && max_repeated_actions.is_none() {
            return Ok(AssertionResult::not_applicable(id));
        }
        let Some(fact) = facts.get(FACT_STEP_COUNT) else {
            return Ok(AssertionResult::inconclusive(id, InconclusiveReason::MissingStepCount));
        };
        let read = |k: &str| fact.get(k).and_then(Value::as_u64).unwrap_or(0);
        let steps = read("steps");
        let longest_run = read("max_identical_run");
        let source = fact.get("source").and_then(Value::as_str).unwrap_or_default();

        let mut refs = Vec::new();
        let over_steps = max_steps.is_some_and(|max| steps > max);
        if over_steps {
            refs.push(EvidenceRef::line(source, read("last_line") as usize).to_string());
        }
        let over_repeats = max_repeated_actions.is_some_and(|max| longest_run > max);
        if over_repeats {
            refs.push(
                EvidenceRef::line(source, read("max_identical_run_start_line") as usize)
                    .to_string(),
            );
        }

        let verdict = if over_steps || over_repeats {
            AssertionResult::fail(id, refs)
        } else {
            AssertionResult::pass(id, fact.evidence_refs.iter().cloned())
        };
        Ok(verdict
            .detail("steps", steps)
            .detail("max_steps", max_steps)
            .detail("max_identical_run", longest_run)
            .detail("max_repeated_actions", max_repeated_actions))
    }
}
