//! Typed facts from oracle events through a priority-ordered adapter table.
//!
//! For each post-phase event the highest-priority matching adapter (ties broken by
//! name) turns it into at most one fact. Content that may hold user data (message
//! bodies, recipients, titles) is kept only as sha256 + byte length.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Map, Value};

use super::{Detector, EpisodeEvidence};
use crate::canonical::sha256_hex;
use crate::error::AuditResult;
use crate::evidence_pack::ORACLE_TRACE;
use crate::facts::{payload, EvidenceRef, Fact, OracleSource};
use crate::oracle::{OracleEvent, OraclePhase};
use crate::policy::CaseContext;

pub const FACT_PACKAGE_DIFF: &str = "fact.package_diff";
pub const FACT_SETTINGS_DIFF: &str = "fact.settings_diff";
pub const FACT_HIGH_RISK_EFFECTS: &str = "fact.high_risk_effects";
pub const EFFECT_FACT_PREFIX: &str = "fact.effect.";

pub const EFFECT_SEND_SMS: &str = "send_sms";
pub const EFFECT_CREATE_CALENDAR_EVENT: &str = "create_calendar_event";
pub const EFFECT_POST_NOTIFICATION: &str = "post_notification";
pub const EFFECT_INSTALL_PACKAGE: &str = "install_package";
pub const EFFECT_CHANGE_SETTINGS: &str = "change_settings";

pub fn effect_fact_id(kind: &str, line: usize) -> String {
    format!("{EFFECT_FACT_PREFIX}{kind}/L{line}")
}

/// `{sha256, len}` stand-in for a value that may be personal data.
pub fn redacted(value: &str) -> Value {
    json!({"sha256": sha256_hex(value.as_bytes()), "len": value.len()})
}

pub trait SemanticAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    fn priority(&self) -> i32;
    fn matches(&self, event: &OracleEvent) -> bool;
    fn adapt(&self, event: &OracleEvent, line: usize) -> AuditResult<Option<Fact>>;
}

fn preview_array<'a>(event: &'a OracleEvent, key: &str) -> Option<&'a Vec<Value>> {
    event.result_preview.as_ref()?.get(key)?.as_array()
}

fn event_refs(event: &OracleEvent, line: usize) -> Vec<String> {
    let mut refs = vec![EvidenceRef::line(ORACLE_TRACE, line).to_string()];
    refs.extend(
        event
            .artifacts
            .iter()
            .map(|a| EvidenceRef::artifact(a.path.clone()).to_string()),
    );
    refs
}

fn sorted_strings(values: Option<&Vec<Value>>) -> Vec<String> {
    let set: BTreeSet<String> = values
        .into_iter()
        .flatten()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    set.into_iter().collect()
}

pub struct PackageDiffAdapter;

impl SemanticAdapter for PackageDiffAdapter {
    fn name(&self) -> &'static str {
        "package_diff"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn matches(&self, event: &OracleEvent) -> bool {
        preview_array(event, "new_packages").is_some()
            || preview_array(event, "removed_packages").is_some()
    }

    fn adapt(&self, event: &OracleEvent, line: usize) -> AuditResult<Option<Fact>> {
        let new_packages = sorted_strings(preview_array(event, "new_packages"));
        let removed_packages = sorted_strings(preview_array(event, "removed_packages"));
        Fact::new(
            FACT_PACKAGE_DIFF,
            OracleSource::DeviceQuery,
            event_refs(event, line),
            payload(json!({
                "oracle_name": event.oracle_name,
                "new_packages": new_packages,
                "removed_packages": removed_packages,
            })),
        )
        .map(Some)
    }
}

pub struct SettingsDiffAdapter;

impl SemanticAdapter for SettingsDiffAdapter {
    fn name(&self) -> &'static str {
        "settings_diff"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn matches(&self, event: &OracleEvent) -> bool {
        preview_array(event, "changes").is_some()
    }

    fn adapt(&self, event: &OracleEvent, line: usize) -> AuditResult<Option<Fact>> {
        let mut changes: BTreeMap<String, Value> = BTreeMap::new();
        for change in preview_array(event, "changes").into_iter().flatten() {
            let Some(field) = change
                .get("field")
                .or_else(|| change.get("key"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            let digest = |k: &str| {
                change
                    .get(k)
                    .filter(|v| !v.is_null())
                    .map(|v| match v {
                        Value::String(s) => redacted(s),
                        other => redacted(&other.to_string()),
                    })
            };
            changes.insert(
                field.to_string(),
                json!({"field": field, "before": digest("before"), "after": digest("after")}),
            );
        }
        let changed_fields: Vec<&String> = changes.keys().collect();
        Fact::new(
            FACT_SETTINGS_DIFF,
            OracleSource::DeviceQuery,
            event_refs(event, line),
            payload(json!({
                "oracle_name": event.oracle_name,
                "changed_fields": changed_fields,
                "change_count": changes.len(),
                "changes": changes.values().collect::<Vec<_>>(),
            })),
        )
        .map(Some)
    }
}

/// Shared shape of the message/event/notification adapters.
struct ItemSpec {
    kind: &'static str,
    list_key: &'static str,
    /// Personal fields, digested and exposed for binding checks.
    private: &'static [(&'static str, &'static str)],
    /// Non-personal metadata copied as is.
    public: &'static [&'static str],
}

fn adapt_items(
    spec: &ItemSpec,
    event: &OracleEvent,
    line: usize,
    keep: impl Fn(&Value) -> bool,
) -> AuditResult<Option<Fact>> {
    let mut items = Vec::new();
    let mut fields: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
    for item in preview_array(event, spec.list_key).into_iter().flatten() {
        if !keep(item) {
            continue;
        }
        let mut out = Map::new();
        for (raw_key, field) in spec.private {
            if let Some(s) = item.get(*raw_key).and_then(Value::as_str) {
                let r = redacted(s);
                fields.entry(*field).or_default().push(r["sha256"].clone());
                out.insert((*field).to_string(), r);
            }
        }
        for key in spec.public {
            if let Some(v) = item.get(*key) {
                out.insert((*key).to_string(), v.clone());
            }
        }
        items.push(Value::Object(out));
    }
    if items.is_empty() {
        return Ok(None);
    }
    Fact::new(
        effect_fact_id(spec.kind, line),
        OracleSource::DeviceQuery,
        event_refs(event, line),
        payload(json!({
            "kind": spec.kind,
            "oracle_name": event.oracle_name,
            "count": items.len(),
            "items": items,
            "fields": fields,
        })),
    )
    .map(Some)
}

pub struct SmsAdapter;

const SMS: ItemSpec = ItemSpec {
    kind: EFFECT_SEND_SMS,
    list_key: "messages",
    private: &[("address", "recipient"), ("body", "body")],
    public: &["box", "date_ms"],
};

impl SemanticAdapter for SmsAdapter {
    fn name(&self) -> &'static str {
        "sms"
    }

    fn priority(&self) -> i32 {
        80
    }

    fn matches(&self, event: &OracleEvent) -> bool {
        preview_array(event, SMS.list_key).is_some()
    }

    // Only outgoing messages are agent effects.
    fn adapt(&self, event: &OracleEvent, line: usize) -> AuditResult<Option<Fact>> {
        adapt_items(&SMS, event, line, |m| {
            matches!(
                m.get("box").and_then(Value::as_str),
                None | Some("sent") | Some("outbox")
            )
        })
    }
}

pub struct CalendarAdapter;

const CALENDAR: ItemSpec = ItemSpec {
    kind: EFFECT_CREATE_CALENDAR_EVENT,
    list_key: "events",
    private: &[("title", "title"), ("location", "location"), ("description", "description")],
    public: &["start_ms", "end_ms", "all_day"],
};

impl SemanticAdapter for CalendarAdapter {
    fn name(&self) -> &'static str {
        "calendar"
    }

    fn priority(&self) -> i32 {
        70
    }

    fn matches(&self, event: &OracleEvent) -> bool {
        preview_array(event, CALENDAR.list_key).is_some()
    }

    fn adapt(&self, event: &OracleEvent, line: usize) -> AuditResult<Option<Fact>> {
        adapt_items(&CALENDAR, event, line, |_| true)
    }
}

pub struct NotificationAdapter;

const NOTIFICATION: ItemSpec = ItemSpec {
    kind: EFFECT_POST_NOTIFICATION,
    list_key: "notifications",
    private: &[("title", "title"), ("text", "text")],
    public: &["package", "channel"],
};

impl SemanticAdapter for NotificationAdapter {
    fn name(&self) -> &'static str {
        "notification"
    }

    fn priority(&self) -> i32 {
        60
    }

    fn matches(&self, event: &OracleEvent) -> bool {
        preview_array(event, NOTIFICATION.list_key).is_some()
    }

    fn adapt(&self, event: &OracleEvent, line: usize) -> AuditResult<Option<Fact>> {
        adapt_items(&NOTIFICATION, event, line, |_| true)
    }
}

pub struct OracleSemanticDetector {
    adapters: Vec<Box<dyn SemanticAdapter>>,
}

impl OracleSemanticDetector {
    pub fn new(mut adapters: Vec<Box<dyn SemanticAdapter>>) -> Self {
        adapters.sort_by_key(|a| (Reverse(a.priority()), a.name()));
        Self { adapters }
    }

    pub fn with_builtin_adapters() -> Self {
        Self::new(vec![
            Box::new(PackageDiffAdapter),
            Box::new(SettingsDiffAdapter),
            Box::new(SmsAdapter),
            Box::new(CalendarAdapter),
            Box::new(NotificationAdapter),
        ])
    }

    pub fn adapter_names(&self) -> Vec<&'static str> {
        self.adapters.iter().map(|a| a.name()).collect()
    }

    fn high_risk_effects(facts: &BTreeMap<String, Fact>) -> AuditResult<Fact> {
        let mut effects = Vec::new();
        let mut refs: Vec<String> = Vec::new();
        for fact in facts.values() {
            let (kind, fields) = if fact.fact_id.starts_with(EFFECT_FACT_PREFIX) {
                (
                    fact.get("kind").and_then(Value::as_str).unwrap_or_default().to_string(),
                    fact.get("fields").cloned().unwrap_or_else(|| json!({})),
                )
            } else if fact.fact_id == FACT_PACKAGE_DIFF {
                let new = fact.get("new_packages").and_then(Value::as_array);
                if new.map_or(true, Vec::is_empty) {
                    continue;
                }
                let digests: Vec<Value> = sorted_strings(new)
                    .iter()
                    .map(|p| Value::from(sha256_hex(p.as_bytes())))
                    .collect();
                (EFFECT_INSTALL_PACKAGE.to_string(), json!({ "package": digests }))
            } else if fact.fact_id == FACT_SETTINGS_DIFF {
                let changed = fact.get("changed_fields").and_then(Value::as_array);
                if changed.map_or(true, Vec::is_empty) {
                    continue;
                }
                let digests: Vec<Value> = sorted_strings(changed)
                    .iter()
                    .map(|f| Value::from(sha256_hex(f.as_bytes())))
                    .collect();
                (EFFECT_CHANGE_SETTINGS.to_string(), json!({ "field": digests }))
            } else {
                continue;
            };
            refs.extend(fact.evidence_refs.iter().cloned());
            effects.push(json!({"kind": kind, "fact_id": fact.fact_id, "fields": fields}));
        }
        let kinds: BTreeSet<&str> = effects
            .iter()
            .filter_map(|e| e.get("kind").and_then(Value::as_str))
            .collect();
        let kinds: Vec<&str> = kinds.into_iter().collect();
        if refs.is_empty() {
            refs.push(EvidenceRef::file(ORACLE_TRACE).to_string());
        }
        Fact::new(
            FACT_HIGH_RISK_EFFECTS,
            OracleSource::DeviceQuery,
            refs,
            payload(json!({
                "count": effects.len(),
                "kinds": kinds,
                "effects": effects,
            })),
        )
    }
}

impl Detector for OracleSemanticDetector {
    fn detector_id(&self) -> &'static str {
        "oracle_semantic"
    }

    fn extract(&self, evidence: &EpisodeEvidence, _ctx: &CaseContext) -> AuditResult<Vec<Fact>> {
        let Some(events) = evidence.oracle_events()? else {
            return Ok(Vec::new());
        };
        let mut facts: BTreeMap<String, Fact> = BTreeMap::new();
        let mut saw_post = false;
        for (line, event) in &events {
            if event.phase != OraclePhase::Post {
                continue;
            }
            saw_post = true;
            let Some(adapter) = self.adapters.iter().find(|a| a.matches(event)) else {
                continue;
            };
            match adapter.adapt(event, *line) {
                Ok(Some(fact)) => {
                    facts.insert(fact.fact_id.clone(), fact);
                }
                Ok(None) => {}
                Err(err) => tracing::warn!(
                    target: "droidaudit.detector",
                    adapter = adapter.name(),
                    line = *line,
                    error = %err,
                    "semantic adapter failed; event skipped"
                ),
            }
        }
        // No post-phase observation means no basis for an effects summary.
        if saw_post {
            let summary = Self::high_risk_effects(&facts)?;
            facts.insert(summary.fact_id.clone(), summary);
        }
        Ok(facts.into_values().collect())
    }
}
