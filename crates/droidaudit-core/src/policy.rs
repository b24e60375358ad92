//! Case policy, eval spec and the per-case context handed to detectors and assertions.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{AuditError, AuditResult};
use crate::jsonl::{file_label, JsonlParseError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Budgets {
    pub max_steps: Option<u64>,
    pub max_repeated_actions: Option<u64>,
}

/// Trace files (by name) a canary token must never reach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRule {
    pub rule_id: String,
    #[serde(default)]
    pub forbidden_sinks: Vec<String>,
}

/// A high-risk effect's `field` must be bound to `expected` (compared by digest).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRequirement {
    pub requirement_id: String,
    pub effect: String,
    pub field: String,
    pub expected: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForbidSettingsChange {
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub policy_id: String,
    pub budgets: Budgets,
    pub high_risk_actions: Vec<String>,
    pub flow_rules: Vec<FlowRule>,
    pub canary_tokens: Vec<String>,
    pub binding_requirements: Vec<BindingRequirement>,
    pub forbid_install: bool,
    pub install_allowlist: Vec<String>,
    pub forbid_settings_change: ForbidSettingsChange,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalSpec {
    pub task_id: String,
    pub max_steps: Option<u64>,
    /// Oracle name whose post-phase decision decides task success.
    pub success_oracle: Option<String>,
    pub canary_tokens: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaseContext {
    pub case_id: String,
    pub policy: Policy,
    pub eval_spec: EvalSpec,
}

pub(crate) fn read_json_as<T: DeserializeOwned>(path: &Path) -> AuditResult<T> {
    let bytes = fs::read(path).map_err(|e| AuditError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| {
        AuditError::Parse(JsonlParseError {
            file: file_label(path),
            line: e.line(),
            message: e.to_string(),
        })
    })
}

impl CaseContext {
    pub fn new(case_id: impl Into<String>, policy: Policy, eval_spec: EvalSpec) -> Self {
        Self {
            case_id: case_id.into(),
            policy,
            eval_spec,
        }
    }

    /// Loads `policy.json` and an optional eval spec; a missing eval spec means defaults.
    pub fn load(
        case_id: impl Into<String>,
        policy_path: &Path,
        eval_spec_path: Option<&Path>,
    ) -> AuditResult<Self> {
        let policy: Policy = read_json_as(policy_path)?;
        let eval_spec = match eval_spec_path {
            Some(path) => read_json_as(path)?,
            None => EvalSpec::default(),
        };
        Ok(Self::new(case_id, policy, eval_spec))
    }

    /// Policy and eval-spec tokens, sorted and deduplicated. Empty strings are dropped.
    pub fn canary_tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self
            .policy
            .canary_tokens
            .iter()
            .chain(&self.eval_spec.canary_tokens)
            .filter(|t| !t.is_empty())
            .cloned()
            .collect();
        tokens.sort();
        tokens.dedup();
        tokens
    }

    pub fn max_steps(&self) -> Option<u64> {
        self.policy.budgets.max_steps.or(self.eval_spec.max_steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_partial_documents_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let policy = dir.path().join("policy.json");
        fs::write(
            &policy,
            r#"{"policy_id":"p1","forbid_install":true,"canary_tokens":["tok","","tok"]}"#,
        )
        .unwrap();
        let spec = dir.path().join("eval_spec.json");
        fs::write(&spec, r#"{"task_id":"t","max_steps":12,"canary_tokens":["alpha"]}"#).unwrap();

        let ctx = CaseContext::load("case-1", &policy, Some(&spec)).unwrap();
        assert!(ctx.policy.forbid_install);
        assert!(ctx.policy.install_allowlist.is_empty());
        assert_eq!(ctx.max_steps(), Some(12));
        assert_eq!(ctx.canary_tokens(), vec!["alpha", "tok"]);
    }

    #[test]
    fn malformed_policy_is_a_located_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let policy = dir.path().join("policy.json");
        fs::write(&policy, "{\n  \"forbid_install\": \"yes\"\n}").unwrap();
        match CaseContext::load("c", &policy, None) {
            Err(AuditError::Parse(e)) => {
                assert_eq!(e.file, "policy.json");
                assert_eq!(e.line, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
