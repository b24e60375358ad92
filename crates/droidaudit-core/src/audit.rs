//! Per-episode audit pass: detectors build a [`FactStore`], compiled assertions
//! judge it, and the results land next to the evidence.
//!
//! Detector failures degrade to "no facts" and are listed in the report. Assertion
//! failures abort the pass.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::assertions::{
    compile_baseline_assertions, AssertionConfig, AssertionResult, Severity, Verdict,
};
use crate::canonical::sha256_hex;
use crate::detectors::{builtin_detectors, Detector, EpisodeEvidence};
use crate::error::{AuditError, AuditResult};
use crate::evidence_pack::{resolve_episode_evidence_dir, ASSERTIONS, FACTS, SUMMARY};
use crate::facts::{Fact, FactStore};
use crate::jsonl::{encode_jsonl, read_json_object, write_atomic, write_json_pretty};
use crate::policy::CaseContext;

pub const SUMMARY_AUDIT_KEY: &str = "audit";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub assertion_id: String,
    pub severity: Severity,
    pub evidence_refs: Vec<String>,
}

/// Rates use the applicable assertions as denominator; 0.0 when none applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditRollup {
    pub total: usize,
    pub applicable_count: usize,
    pub applicable_rate: f64,
    pub pass_count: usize,
    pub fail_count: usize,
    pub inconclusive_count: usize,
    pub pass_rate: f64,
    pub fail_rate: f64,
    pub inconclusive_rate: f64,
}

fn rate(n: usize, d: usize) -> f64 {
    if d == 0 {
        0.0
    } else {
        n as f64 / d as f64
    }
}

impl AuditRollup {
    pub fn from_results(results: &[AssertionResult]) -> Self {
        let applicable: Vec<&AssertionResult> = results.iter().filter(|r| r.applicable).collect();
        let count = |v: Verdict| applicable.iter().filter(|r| r.result == v).count();
        let (pass, fail, inconclusive) = (
            count(Verdict::Pass),
            count(Verdict::Fail),
            count(Verdict::Inconclusive),
        );
        let n = applicable.len();
        Self {
            total: results.len(),
            applicable_count: n,
            applicable_rate: rate(n, results.len()),
            pass_count: pass,
            fail_count: fail,
            inconclusive_count: inconclusive,
            pass_rate: rate(pass, n),
            fail_rate: rate(fail, n),
            inconclusive_rate: rate(inconclusive, n),
        }
    }
}

/// The block merged into `summary.json` under `audit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditSummary {
    pub case_id: String,
    #[serde(flatten)]
    pub rollup: AuditRollup,
    pub violations: Vec<Violation>,
    pub fact_count: usize,
    pub facts_sha256: String,
    pub assertions_sha256: String,
    pub degraded_detectors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditReport {
    pub evidence_dir: PathBuf,
    pub facts: Vec<Fact>,
    pub assertions: Vec<AssertionResult>,
    pub summary: AuditSummary,
}

impl AuditReport {
    pub fn violations(&self) -> &[Violation] {
        &self.summary.violations
    }
}

pub struct AuditEngine {
    detectors: Vec<Box<dyn Detector>>,
}

impl AuditEngine {
    pub fn new(detectors: Vec<Box<dyn Detector>>) -> Self {
        Self { detectors }
    }

    pub fn with_builtin_detectors() -> Self {
        Self::new(builtin_detectors())
    }

    pub fn detector_ids(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.detector_id()).collect()
    }

    /// Audits one episode with the assertions compiled from `ctx`.
    pub fn run(&self, episode_dir: &Path, ctx: &CaseContext) -> AuditResult<AuditReport> {
        let configs = compile_baseline_assertions(&ctx.policy, &ctx.eval_spec)?;
        self.run_with(episode_dir, ctx, &configs)
    }

    pub fn run_with(
        &self,
        episode_dir: &Path,
        ctx: &CaseContext,
        configs: &[AssertionConfig],
    ) -> AuditResult<AuditReport> {
        if configs.is_empty() {
            return Err(AuditError::EmptyAssertionSet);
        }
        let evidence = EpisodeEvidence::open(&resolve_episode_evidence_dir(episode_dir))?;
        let (store, degraded_detectors) = self.collect_facts(&evidence, ctx);
        let assertions = evaluate(configs, &store, ctx)?;
        let facts = store.into_sorted_vec();

        let facts_bytes = encode_jsonl(&facts)?;
        let assertions_bytes = encode_jsonl(&assertions)?;
        write_atomic(&evidence.path(FACTS), &facts_bytes)?;
        write_atomic(&evidence.path(ASSERTIONS), &assertions_bytes)?;

        let violations = assertions
            .iter()
            .filter(|r| r.result == Verdict::Fail)
            .map(|r| Violation {
                assertion_id: r.assertion_id.to_string(),
                severity: r.severity,
                evidence_refs: r.evidence_refs.clone(),
            })
            .collect();
        let summary = AuditSummary {
            case_id: ctx.case_id.clone(),
            rollup: AuditRollup::from_results(&assertions),
            violations,
            fact_count: facts.len(),
            facts_sha256: sha256_hex(&facts_bytes),
            assertions_sha256: sha256_hex(&assertions_bytes),
            degraded_detectors,
        };
        merge_summary(&evidence.path(SUMMARY), &summary)?;

        tracing::info!(
            target: "droidaudit.audit",
            evidence_dir = %evidence.evidence_dir.display(),
            case_id = %ctx.case_id,
            facts = facts.len(),
            assertions = assertions.len(),
            violations = summary.violations.len(),
            degraded = summary.degraded_detectors.len(),
            "episode audited"
        );
        Ok(AuditReport {
            evidence_dir: evidence.evidence_dir,
            facts,
            assertions,
            summary,
        })
    }

    fn collect_facts(
        &self,
        evidence: &EpisodeEvidence,
        ctx: &CaseContext,
    ) -> (FactStore, Vec<String>) {
        let mut store = FactStore::new();
        let mut degraded = Vec::new();
        for detector in &self.detectors {
            match detector.extract(evidence, ctx) {
                Ok(facts) => {
                    tracing::debug!(
                        target: "droidaudit.detector",
                        detector = detector.detector_id(),
                        facts = facts.len(),
                        "detector finished"
                    );
                    store.extend(facts);
                }
                Err(err) => {
                    tracing::warn!(
                        target: "droidaudit.detector",
                        detector = detector.detector_id(),
                        error = %err,
                        "detector failed; continuing without its facts"
                    );
                    degraded.push(detector.detector_id().to_string());
                }
            }
        }
        (store, degraded)
    }
}

fn evaluate(
    configs: &[AssertionConfig],
    facts: &FactStore,
    ctx: &CaseContext,
) -> AuditResult<Vec<AssertionResult>> {
    let mut results = Vec::with_capacity(configs.len());
    for config in configs {
        let assertion = config.build()?;
        let result = assertion.evaluate(facts, ctx).map_err(|e| AuditError::AssertionEvaluation {
            assertion_id: config.assertion_id.to_string(),
            message: e.to_string(),
        })?;
        results.push(result);
    }
    results.sort_by(|a, b| a.assertion_id.as_str().cmp(b.assertion_id.as_str()));
    Ok(results)
}

/// Replaces the `audit` key of `summary.json`, keeping every other key.
fn merge_summary(path: &Path, summary: &AuditSummary) -> AuditResult<()> {
    let mut doc: Map<String, Value> = if path.is_file() {
        read_json_object(path)?
    } else {
        Map::new()
    };
    let block = serde_json::to_value(summary)
        .map_err(|e| AuditError::Internal(format!("serialize audit summary: {e}")))?;
    doc.insert(SUMMARY_AUDIT_KEY.to_string(), block);
    write_json_pretty(path, &doc)
}
