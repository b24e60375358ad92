use serde_json::json;

use super::{Detector, EpisodeEvidence};
use crate::canonical::sha256_hex;
use crate::error::AuditResult;
use crate::evidence_pack::{AGENT_ACTION_TRACE, COMM_PROXY_TRACE, DEVICE_INPUT_TRACE, ORACLE_TRACE};
use crate::facts::{payload, EvidenceRef, Fact, OracleSource};
use crate::policy::CaseContext;

pub const FACT_CANARY_HITS: &str = "fact.canary_hits";

/// Trace files searched for canary tokens, in scan order.
pub const CANARY_SINKS: [&str; 4] = [
    DEVICE_INPUT_TRACE,
    COMM_PROXY_TRACE,
    ORACLE_TRACE,
    AGENT_ACTION_TRACE,
];

/// Line-level search for declared canary tokens. Tokens are reported by digest only.
pub struct CanaryScanDetector;

impl Detector for CanaryScanDetector {
    fn detector_id(&self) -> &'static str {
        "canary_scan"
    }

    fn extract(&self, evidence: &EpisodeEvidence, ctx: &CaseContext) -> AuditResult<Vec<Fact>> {
        let tokens = ctx.canary_tokens();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        let token_digests: Vec<String> = tokens.iter().map(|t| sha256_hex(t.as_bytes())).collect();

        let mut scanned = Vec::new();
        let mut hits = Vec::new();
        let mut refs = Vec::new();
        for sink in CANARY_SINKS {
            let Some(text) = evidence.text(sink)? else {
                continue;
            };
            scanned.push(sink);
            refs.push(EvidenceRef::file(sink));
            for (idx, line) in text.lines().enumerate() {
                for (token, digest) in tokens.iter().zip(&token_digests) {
                    if line.contains(token.as_str()) {
                        hits.push(json!({"sink": sink, "line": idx + 1, "token_sha256": digest}));
                        refs.push(EvidenceRef::line(sink, idx + 1));
                    }
                }
            }
        }
        if scanned.is_empty() {
            return Ok(Vec::new());
        }

        Ok(vec![Fact::new(
            FACT_CANARY_HITS,
            OracleSource::None,
            refs,
            payload(json!({
                "tokens_checked": tokens.len(),
                "token_sha256s": token_digests,
                "sinks_scanned": scanned,
                "hit_count": hits.len(),
                "hits": hits,
            })),
        )?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::testing::evidence;
    use crate::policy::{EvalSpec, Policy};

    fn ctx(tokens: &[&str]) -> CaseContext {
        let policy = Policy {
            canary_tokens: tokens.iter().map(|t| t.to_string()).collect(),
            ..Policy::default()
        };
        CaseContext::new("c1", policy, EvalSpec::default())
    }

    #[test]
    fn hits_are_located_and_tokens_never_stored() {
        let dir = tempfile::tempdir().unwrap();
        let ev = evidence(
            dir.path(),
            &[
                (COMM_PROXY_TRACE, "{\"a\":1}\n{\"body\":\"CANARY-7731\"}\n"),
                (ORACLE_TRACE, "{\"x\":\"clean\"}\n"),
            ],
        );
        let facts = CanaryScanDetector.extract(&ev, &ctx(&["CANARY-7731"])).unwrap();
        let fact = &facts[0];
        assert_eq!(fact.get("hit_count"), Some(&json!(1)));
        assert_eq!(fact.payload["hits"][0]["sink"], json!(COMM_PROXY_TRACE));
        assert_eq!(fact.payload["hits"][0]["line"], json!(2));
        assert!(fact
            .evidence_refs
            .contains(&"comm_proxy_trace.jsonl:L2".to_string()));
        assert!(!serde_json::to_string(&fact.payload).unwrap().contains("CANARY-7731"));
    }

    #[test]
    fn no_tokens_no_fact() {
        let dir = tempfile::tempdir().unwrap();
        let ev = evidence(dir.path(), &[(ORACLE_TRACE, "{}\n")]);
        assert!(CanaryScanDetector
            .extract(&ev, &CaseContext::default())
            .unwrap()
            .is_empty());
    }
}
