use std::path::Path;

use super::controller::missing_capabilities;
use super::{Capability, Oracle, OracleContext, OracleEvent, OraclePhase};
use crate::error::AuditResult;
use crate::evidence_pack::ORACLE_TRACE;
use crate::jsonl::JsonlAppender;

/// Appends canonical oracle events to `<episode>/oracle_trace.jsonl`.
#[derive(Debug)]
pub struct OracleTraceWriter {
    appender: JsonlAppender,
    written: usize,
}

impl OracleTraceWriter {
    pub fn open(episode_dir: &Path) -> AuditResult<Self> {
        Ok(Self {
            appender: JsonlAppender::open(&episode_dir.join(ORACLE_TRACE))?,
            written: 0,
        })
    }

    pub fn write(&mut self, event: &OracleEvent) -> AuditResult<()> {
        self.appender.append(event)?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

fn capability_gap(
    oracle: &dyn Oracle,
    ctx: &OracleContext<'_>,
    phase: OraclePhase,
    required: &[Capability],
    missing: Vec<Capability>,
) -> OracleEvent {
    OracleEvent::builder(
        oracle.oracle_id(),
        oracle.oracle_name(),
        oracle.oracle_type(),
        phase,
    )
    .timestamp_ms(ctx.clock.now_utc_ms())
    .requires(required)
    .missing(missing)
    .build()
}

/// Runs one phase of `oracle`. Missing capabilities short-circuit into a single
/// inconclusive event instead of calling the oracle.
pub fn check_oracle(
    oracle: &dyn Oracle,
    ctx: &OracleContext<'_>,
    phase: OraclePhase,
) -> AuditResult<Vec<OracleEvent>> {
    let required = oracle.capabilities_required();
    let mut missing = missing_capabilities(ctx.controller, required);
    if required.contains(&Capability::TimeAnchor)
        && ctx.episode_time.and_then(|t| t.device_start_epoch_ms).is_none()
    {
        missing.push(Capability::TimeAnchor);
    }
    if !missing.is_empty() {
        return Ok(vec![capability_gap(oracle, ctx, phase, required, missing)]);
    }
    match phase {
        OraclePhase::Pre => oracle.pre_check(ctx),
        OraclePhase::Post => oracle.post_check(ctx),
    }
}

/// Drives one phase for every oracle in registration order and traces the events.
pub fn run_oracles(
    oracles: &[Box<dyn Oracle>],
    ctx: &OracleContext<'_>,
    phase: OraclePhase,
    writer: &mut OracleTraceWriter,
) -> AuditResult<Vec<OracleEvent>> {
    let mut all = Vec::new();
    for oracle in oracles {
        let events = check_oracle(oracle.as_ref(), ctx, phase)?;
        for event in &events {
            writer.write(event)?;
        }
        tracing::debug!(
            target: "droidaudit.oracle",
            oracle_id = oracle.oracle_id(),
            phase = %phase,
            events = events.len(),
            "oracle phase complete"
        );
        all.extend(events);
    }
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonl::read_jsonl;
    use crate::oracle::artifacts::ArtifactStore;
    use crate::oracle::controller::require_adb_shell;
    use crate::oracle::{decision_for, OracleDecision};
    use crate::oracle::testing::{FakeDevice, FixedClock};
    use crate::oracle::time_window::{query_window, EpisodeTime, DEFAULT_SLACK_MS};
    use crate::oracle::OracleType;
    use serde_json::json;

    /// Counts packages and keeps the raw listing as an artifact.
    struct PackageCount;

    impl Oracle for PackageCount {
        fn oracle_id(&self) -> &str {
            "pkg-1"
        }
        fn oracle_name(&self) -> &str {
            "package_diff"
        }
        fn oracle_type(&self) -> OracleType {
            OracleType::Hard
        }
        fn capabilities_required(&self) -> &[Capability] {
            &[Capability::AdbShell, Capability::TimeAnchor]
        }
        fn post_check(&self, ctx: &OracleContext<'_>) -> AuditResult<Vec<OracleEvent>> {
            let builder = OracleEvent::builder("pkg-1", "package_diff", OracleType::Hard, OraclePhase::Post)
                .timestamp_ms(ctx.clock.now_utc_ms())
                .requires(self.capabilities_required());
            let decision = match query_window(ctx.controller, ctx.episode_time, DEFAULT_SLACK_MS) {
                Err(reason) => return Ok(vec![builder.decision(reason.decision()).build()]),
                Ok(_) => OracleDecision::pass("listed"),
            };
            let raw = require_adb_shell(ctx.controller)
                .ok()
                .and_then(|s| s.adb_shell("pm list packages").ok())
                .unwrap_or_default();
            let artifact = ctx.artifacts.put_text(&raw)?;
            let event = builder
                .query(json!({"cmd": "pm list packages"}))
                .result(json!({"new_packages": ["com.evil.app"]}))?
                .artifact(artifact)
                .decision(decision)
                .build();
            Ok(vec![event])
        }
    }

    #[test]
    fn missing_time_anchor_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let device = FakeDevice::with_shell(&[]);
        let ctx = OracleContext {
            episode_dir: dir.path(),
            controller: &device,
            episode_time: None,
            artifacts: &store,
            clock: &FixedClock(1),
        };
        let oracles: Vec<Box<dyn Oracle>> = vec![Box::new(PackageCount)];
        let mut writer = OracleTraceWriter::open(dir.path()).unwrap();
        let events = run_oracles(&oracles, &ctx, OraclePhase::Post, &mut writer).unwrap();
        let d = decision_for(&events, "pkg-1").unwrap();
        assert!(!d.conclusive);
        assert_eq!(d.reason, "missing_capability:time_anchor");
        assert_eq!(writer.written(), 1);
    }

    #[test]
    fn events_are_traced_with_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let device = FakeDevice::with_shell(&[
            Ok("1760000005000"),
            Ok("package:com.android.settings\npackage:com.evil.app\n"),
        ]);
        let anchor = EpisodeTime {
            host_start_utc_ms: 0,
            device_start_epoch_ms: Some(1_760_000_000_000),
        };
        let ctx = OracleContext {
            episode_dir: dir.path(),
            controller: &device,
            episode_time: Some(&anchor),
            artifacts: &store,
            clock: &FixedClock(1),
        };
        let oracles: Vec<Box<dyn Oracle>> = vec![Box::new(PackageCount)];
        let mut writer = OracleTraceWriter::open(dir.path()).unwrap();
        let events = run_oracles(&oracles, &ctx, OraclePhase::Post, &mut writer).unwrap();
        assert!(events[0].decision.conclusive);
        assert!(store.verify(&events[0].artifacts[0]));

        let lines = read_jsonl(&dir.path().join(ORACLE_TRACE)).unwrap();
        assert_eq!(lines.len(), 1);
        let back: OracleEvent =
            serde_json::from_value(serde_json::Value::Object(lines[0].value.clone())).unwrap();
        assert_eq!(back, events[0]);
    }
}
