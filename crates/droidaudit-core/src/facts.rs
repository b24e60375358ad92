//! Facts: derived, digest-stable observations tied to raw evidence.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::canonical::digest_hex;
use crate::error::{AuditError, AuditResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleSource {
    None,
    DeviceQuery,
    TrajectoryDeclared,
}

/// Pointer into an evidence pack: `file`, `file:L<n>` or `artifact:<path>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum EvidenceRef {
    File(String),
    Line { file: String, line: usize },
    Artifact(String),
}

impl EvidenceRef {
    pub fn file(file: impl Into<String>) -> Self {
        Self::File(file.into())
    }

    pub fn line(file: impl Into<String>, line: usize) -> Self {
        Self::Line {
            file: file.into(),
            line,
        }
    }

    pub fn artifact(path: impl Into<String>) -> Self {
        Self::Artifact(path.into())
    }

    pub fn parse(s: &str) -> Self {
        if let Some(path) = s.strip_prefix("artifact:") {
            return Self::Artifact(path.to_string());
        }
        if let Some((file, line)) = s.rsplit_once(":L") {
            if let Ok(line) = line.parse::<usize>() {
                return Self::line(file, line);
            }
        }
        Self::File(s.to_string())
    }
}

impl fmt::Display for EvidenceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(file) => f.write_str(file),
            Self::Line { file, line } => write!(f, "{file}:L{line}"),
            Self::Artifact(path) => write!(f, "artifact:{path}"),
        }
    }
}

impl From<EvidenceRef> for String {
    fn from(r: EvidenceRef) -> Self {
        r.to_string()
    }
}

/// True for refs of the form `<file>:L<int>`.
pub fn is_line_locatable(evidence_ref: &str) -> bool {
    matches!(EvidenceRef::parse(evidence_ref), EvidenceRef::Line { ref file, .. } if !file.is_empty())
}

/// Payload map from a `json!` object literal; other values are wrapped as `value`.
pub fn payload(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// Sorted and deduplicated.
pub fn normalize_refs<I, S>(refs: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut out: Vec<String> = refs.into_iter().map(Into::into).collect();
    out.sort();
    out.dedup();
    out
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub fact_id: String,
    pub oracle_source: OracleSource,
    pub evidence_refs: Vec<String>,
    pub payload: Map<String, Value>,
    pub digest: String,
}

impl Fact {
    /// Builds a fact whose `digest` is the SHA-256 of the canonical payload.
    pub fn new<I, S>(
        fact_id: impl Into<String>,
        oracle_source: OracleSource,
        evidence_refs: I,
        payload: Map<String, Value>,
    ) -> AuditResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fact_id = fact_id.into();
        let evidence_refs = normalize_refs(evidence_refs);
        if evidence_refs.is_empty() {
            return Err(AuditError::InvalidArgument(format!(
                "fact {fact_id} has no evidence_refs"
            )));
        }
        let digest = digest_hex(&payload)?;
        Ok(Self {
            fact_id,
            oracle_source,
            evidence_refs,
            payload,
            digest,
        })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn line_refs(&self) -> impl Iterator<Item = &String> {
        self.evidence_refs.iter().filter(|r| is_line_locatable(r))
    }
}

/// Facts keyed by `fact_id`; iteration is ordered by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactStore {
    facts: BTreeMap<String, Fact>,
}

impl FactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `fact`, returning the one it replaced.
    pub fn insert(&mut self, fact: Fact) -> Option<Fact> {
        self.facts.insert(fact.fact_id.clone(), fact)
    }

    pub fn extend(&mut self, facts: impl IntoIterator<Item = Fact>) {
        for fact in facts {
            self.insert(fact);
        }
    }

    pub fn get(&self, fact_id: &str) -> Option<&Fact> {
        self.facts.get(fact_id)
    }

    pub fn contains(&self, fact_id: &str) -> bool {
        self.facts.contains_key(fact_id)
    }

    pub fn with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a Fact> + 'a {
        self.facts
            .range(prefix.to_string()..)
            .take_while(move |(id, _)| id.starts_with(prefix))
            .map(|(_, f)| f)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fact> {
        self.facts.values()
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    pub fn into_sorted_vec(self) -> Vec<Fact> {
        self.facts.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn digest_ignores_key_order_and_refs_are_normalized() {
        let a = Fact::new(
            "fact.x",
            OracleSource::None,
            ["b.jsonl:L2", "a.jsonl", "b.jsonl:L2"],
            obj(json!({"k":1,"j":[1,2]})),
        )
        .unwrap();
        let b = Fact::new(
            "fact.x",
            OracleSource::None,
            ["a.jsonl", "b.jsonl:L2"],
            obj(json!({"j":[1,2],"k":1})),
        )
        .unwrap();
        assert_eq!(a.digest, b.digest);
        assert_eq!(a.evidence_refs, vec!["a.jsonl", "b.jsonl:L2"]);
        assert_eq!(a.line_refs().count(), 1);
    }

    #[test]
    fn facts_need_evidence() {
        let err = Fact::new("fact.y", OracleSource::None, Vec::<String>::new(), Map::new());
        assert!(matches!(err, Err(AuditError::InvalidArgument(_))));
    }

    #[test]
    fn evidence_ref_forms() {
        assert!(is_line_locatable("oracle_trace.jsonl:L1"));
        assert!(!is_line_locatable("oracle_trace.jsonl"));
        assert!(!is_line_locatable("artifact:oracle_artifacts/ab.txt"));
        assert!(!is_line_locatable(":L3"));
        assert_eq!(EvidenceRef::line("f.jsonl", 7).to_string(), "f.jsonl:L7");
        assert_eq!(
            EvidenceRef::parse("artifact:x/y.txt"),
            EvidenceRef::artifact("x/y.txt")
        );
    }

    #[test]
    fn prefix_lookup_is_ordered() {
        let mut store = FactStore::new();
        for id in ["fact.oracle/b/post", "fact.oracle_index", "fact.oracle/a/pre"] {
            store.insert(Fact::new(id, OracleSource::None, ["f"], Map::new()).unwrap());
        }
        let ids: Vec<&str> = store
            .with_prefix("fact.oracle/")
            .map(|f| f.fact_id.as_str())
            .collect();
        assert_eq!(ids, vec!["fact.oracle/a/pre", "fact.oracle/b/post"]);
    }
}
