use std::collections::BTreeMap;

use serde_json::{json, Value};

use super::{Detector, EpisodeEvidence};
use crate::canonical::sha256_hex;
use crate::error::AuditResult;
use crate::evidence_pack::ORACLE_TRACE;
use crate::facts::{payload, EvidenceRef, Fact, OracleSource};
use crate::oracle::hybrid::{HARD_PREFIX, SOFT_FALLBACK_PREFIX};
use crate::oracle::{OracleEvent, OraclePhase, OracleType};
use crate::policy::CaseContext;

pub const FACT_ORACLE_INDEX: &str = "fact.oracle_index";

pub fn oracle_fact_id(oracle_name: &str, phase: OraclePhase) -> String {
    format!("fact.oracle/{oracle_name}/{phase}")
}

/// Which branch a hybrid oracle took, read off its reason prefix.
fn decision_path(event: &OracleEvent) -> Option<&'static str> {
    if event.oracle_type != OracleType::Hybrid {
        return None;
    }
    let reason = event.decision.reason.as_str();
    if reason.starts_with(HARD_PREFIX) {
        Some("hard")
    } else if reason.starts_with(SOFT_FALLBACK_PREFIX) {
        Some("soft_fallback")
    } else {
        None
    }
}

fn source_of(event: &OracleEvent) -> OracleSource {
    match event.oracle_type {
        OracleType::Hard => OracleSource::DeviceQuery,
        OracleType::Hybrid if event.decision.reason.starts_with(HARD_PREFIX) => {
            OracleSource::DeviceQuery
        }
        _ => OracleSource::TrajectoryDeclared,
    }
}

/// Indexes oracle events by `(oracle_name, phase)`; the last event per key wins.
pub struct OracleIndexDetector;

impl Detector for OracleIndexDetector {
    fn detector_id(&self) -> &'static str {
        "oracle_index"
    }

    fn extract(&self, evidence: &EpisodeEvidence, _ctx: &CaseContext) -> AuditResult<Vec<Fact>> {
        let Some(events) = evidence.oracle_events()? else {
            return Ok(Vec::new());
        };

        let mut latest: BTreeMap<(String, OraclePhase), (usize, &OracleEvent)> = BTreeMap::new();
        for (line, event) in &events {
            latest.insert((event.oracle_name.clone(), event.phase), (*line, event));
        }

        let mut facts = Vec::with_capacity(latest.len() + 1);
        let mut entries = Vec::with_capacity(latest.len());
        for ((name, phase), (line, event)) in &latest {
            let fact_id = oracle_fact_id(name, *phase);
            entries.push(json!({
                "fact_id": fact_id,
                "oracle_name": name,
                "phase": phase,
                "line": line,
            }));
            let mut refs = vec![EvidenceRef::line(ORACLE_TRACE, *line).to_string()];
            refs.extend(
                event
                    .artifacts
                    .iter()
                    .map(|a| EvidenceRef::artifact(a.path.clone()).to_string()),
            );
            let artifacts: Vec<Value> = event
                .artifacts
                .iter()
                .map(|a| json!({"path": a.path, "sha256": a.sha256, "size_bytes": a.size_bytes}))
                .collect();
            facts.push(Fact::new(
                fact_id,
                source_of(event),
                refs,
                payload(json!({
                    "oracle_id": event.oracle_id,
                    "oracle_name": name,
                    "oracle_type": event.oracle_type,
                    "phase": phase,
                    "success": event.decision.success,
                    "score": event.decision.score,
                    "conclusive": event.decision.conclusive,
                    // Oracle reasons may quote user content; only their digest is kept.
                    "reason_sha256": sha256_hex(event.decision.reason.as_bytes()),
                    "reason_len": event.decision.reason.len(),
                    "decision_path": decision_path(event),
                    "result_digest": event.result_digest,
                    "missing_capabilities": event.missing_capabilities,
                    "artifacts": artifacts,
                })),
            )?);
        }

        facts.push(Fact::new(
            FACT_ORACLE_INDEX,
            OracleSource::None,
            [EvidenceRef::file(ORACLE_TRACE).to_string()],
            payload(json!({
                "event_count": events.len(),
                "entries": entries,
            })),
        )?);
        Ok(facts)
    }
}
