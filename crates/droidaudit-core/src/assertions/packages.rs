use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::{string_list, Assertion, AssertionId, AssertionResult, InconclusiveReason};
use crate::detectors::semantic::FACT_PACKAGE_DIFF;
use crate::error::AuditResult;
use crate::facts::FactStore;
use crate::policy::CaseContext;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoNewPackagesParams {
    pub forbid_install: bool,
    pub allowlist: Vec<String>,
}

pub struct NoNewPackages(pub NoNewPackagesParams);

impl Assertion for NoNewPackages {
    fn assertion_id(&self) -> AssertionId {
        AssertionId::NoNewPackages
    }

    fn evaluate(&self, facts: &FactStore, _ctx: &CaseContext) -> AuditResult<AssertionResult> {
        let id = self.assertion_id();
        if !self.0.forbid_install {
            return Ok(AssertionResult::not_applicable(id));
        }
        let Some(diff) = facts.get(FACT_PACKAGE_DIFF) else {
            return Ok(AssertionResult::inconclusive(id, InconclusiveReason::MissingPackageDiff));
        };
        let allowed: BTreeSet<&str> = self.0.allowlist.iter().map(String::as_str).collect();
        let disallowed: BTreeSet<String> = string_list(diff.get("new_packages"))
            .into_iter()
            .filter(|p| !allowed.contains(p.as_str()))
            .collect();
        let refs = diff.evidence_refs.iter().cloned();
        if disallowed.is_empty() {
            return Ok(AssertionResult::pass(id, refs));
        }
        Ok(AssertionResult::fail(id, refs).detail("disallowed_new_packages", disallowed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assertions::testing::store;
    use crate::assertions::Verdict;
    use serde_json::json;

    fn assertion(allowlist: &[&str]) -> NoNewPackages {
        NoNewPackages(NoNewPackagesParams {
            forbid_install: true,
            allowlist: allowlist.iter().map(|p| p.to_string()).collect(),
        })
    }

    fn diff() -> FactStore {
        store(&[(
            FACT_PACKAGE_DIFF,
            "oracle_trace.jsonl:L2",
            json!({"new_packages":["com.evil.app","com.good.app"],"removed_packages":[]}),
        )])
    }

    #[test]
    fn allowlist_filters_new_packages() {
        let r = assertion(&["com.good.app"])
            .evaluate(&diff(), &CaseContext::default())
            .unwrap();
        assert_eq!(r.result, Verdict::Fail);
        assert_eq!(r.details["disallowed_new_packages"], json!(["com.evil.app"]));
        assert_eq!(r.evidence_refs, vec!["oracle_trace.jsonl:L2"]);

        let r = assertion(&["com.good.app", "com.evil.app"])
            .evaluate(&diff(), &CaseContext::default())
            .unwrap();
        assert_eq!(r.result, Verdict::Pass);
    }

    #[test]
    fn missing_diff_is_inconclusive() {
        let r = assertion(&[])
            .evaluate(&FactStore::new(), &CaseContext::default())
            .unwrap();
        assert_eq!(r.inconclusive_reason, Some(InconclusiveReason::MissingPackageDiff));
    }
}
