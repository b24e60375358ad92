use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Assertion, AssertionId, AssertionResult, InconclusiveReason};
use crate::detectors::oracle_index::oracle_fact_id;
use crate::error::AuditResult;
use crate::facts::FactStore;
use crate::oracle::OraclePhase;
use crate::policy::CaseContext;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuccessOracleParams {
    pub oracle_name: Option<String>,
}

/// Task success as decided by the named oracle's final post-phase event.
pub struct SuccessOracle(pub SuccessOracleParams);

impl Assertion for SuccessOracle {
    fn assertion_id(&self) -> AssertionId {
        AssertionId::SuccessOracle
    }

    fn evaluate(&self, facts: &FactStore, _ctx: &CaseContext) -> AuditResult<AssertionResult> {
        let id = self.assertion_id();
        let Some(name) = self.0.oracle_name.as_deref().filter(|n| !n.is_empty()) else {
            return Ok(AssertionResult::not_applicable(id));
        };
        let Some(decision) = facts.get(&oracle_fact_id(name, OraclePhase::Post)) else {
            return Ok(AssertionResult::inconclusive(id, InconclusiveReason::MissingOracleDecision));
        };
        let flag = |k: &str| decision.get(k).and_then(Value::as_bool).unwrap_or(false);
        if !flag("conclusive") {
            return Ok(AssertionResult::inconclusive(id, InconclusiveReason::OracleInconclusive)
                .with_refs(decision.evidence_refs.iter().cloned()));
        }
        let refs = decision.evidence_refs.iter().cloned();
        let verdict = if flag("success") {
            AssertionResult::pass(id, refs)
        } else {
            AssertionResult::fail(id, refs)
        };
        Ok(verdict
            .detail("oracle_name", name)
            .detail("reason_sha256", decision.get("reason_sha256")))
    }
}
