use std::collections::BTreeSet;

use super::binding::BindingParams;
use super::budget::LoopBudgetParams;
use super::canary::CanaryFlowParams;
use super::consent::ConsentParams;
use super::packages::NoNewPackagesParams;
use super::settings::NoSettingsDiffParams;
use super::success::SuccessOracleParams;
use super::{AssertionConfig, AssertionId};
use crate::error::{AuditError, AuditResult};
use crate::policy::{EvalSpec, Policy};

/// Enables the baseline assertions whose policy triggers are present, in a fixed order.
///
/// Fails with [`AuditError::EmptyAssertionSet`] when no trigger fires.
pub fn compile_baseline_assertions(
    policy: &Policy,
    eval_spec: &EvalSpec,
) -> AuditResult<Vec<AssertionConfig>> {
    let mut out = Vec::new();

    let max_steps = policy.budgets.max_steps.or(eval_spec.max_steps);
    if max_steps.is_some() {
        out.push(AssertionConfig::new(
            AssertionId::LoopBudgetBounded,
            &LoopBudgetParams {
                max_steps,
                max_repeated_actions: policy.budgets.max_repeated_actions,
            },
        )?);
    }

    if !policy.high_risk_actions.is_empty() {
        let actions: BTreeSet<&String> = policy.high_risk_actions.iter().collect();
        out.push(AssertionConfig::new(
            AssertionId::ConsentRequiredAndMatched,
            &ConsentParams {
                high_risk_actions: actions.into_iter().cloned().collect(),
            },
        )?);
    }

    let tokens_declared = policy
        .canary_tokens
        .iter()
        .chain(&eval_spec.canary_tokens)
        .any(|t| !t.is_empty());
    if !policy.flow_rules.is_empty() || tokens_declared {
        let sinks: BTreeSet<&String> = policy
            .flow_rules
            .iter()
            .flat_map(|r| &r.forbidden_sinks)
            .collect();
        out.push(AssertionConfig::new(
            AssertionId::CanaryNoUnauthorizedFlow,
            &CanaryFlowParams {
                rule_ids: policy.flow_rules.iter().map(|r| r.rule_id.clone()).collect(),
                forbidden_sinks: sinks.into_iter().cloned().collect(),
                tokens_declared,
            },
        )?);
    }

    if !policy.binding_requirements.is_empty() {
        out.push(AssertionConfig::new(
            AssertionId::BindingConsistentOrClarified,
            &BindingParams {
                requirements: policy.binding_requirements.clone(),
            },
        )?);
    }

    if policy.forbid_install {
        out.push(AssertionConfig::new(
            AssertionId::NoNewPackages,
            &NoNewPackagesParams {
                forbid_install: true,
                allowlist: policy.install_allowlist.clone(),
            },
        )?);
    }

    if !policy.forbid_settings_change.fields.is_empty() {
        out.push(AssertionConfig::new(
            AssertionId::NoSettingsDiff,
            &NoSettingsDiffParams {
                fields: policy.forbid_settings_change.fields.clone(),
            },
        )?);
    }

    if let Some(name) = eval_spec.success_oracle.as_ref().filter(|n| !n.is_empty()) {
        out.push(AssertionConfig::new(
            AssertionId::SuccessOracle,
            &SuccessOracleParams {
                oracle_name: Some(name.clone()),
            },
        )?);
    }

    if out.is_empty() {
        return Err(AuditError::EmptyAssertionSet);
    }
    Ok(out)
}
