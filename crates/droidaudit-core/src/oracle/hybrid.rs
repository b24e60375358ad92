use super::trace::check_oracle;
use super::{
    decision_for, Capability, Oracle, OracleContext, OracleDecision, OracleEvent, OraclePhase,
    OracleType,
};
use crate::error::AuditResult;

pub const HARD_PREFIX: &str = "hard:";
pub const SOFT_FALLBACK_PREFIX: &str = "soft_fallback:";

/// Hard oracle first; the paired soft oracle only runs when the hard decision is
/// not conclusive. The reason prefix discloses which path decided.
pub struct HybridOracle {
    oracle_id: String,
    oracle_name: String,
    hard: Box<dyn Oracle>,
    soft: Box<dyn Oracle>,
}

impl HybridOracle {
    pub fn new(
        oracle_id: impl Into<String>,
        oracle_name: impl Into<String>,
        hard: Box<dyn Oracle>,
        soft: Box<dyn Oracle>,
    ) -> Self {
        Self {
            oracle_id: oracle_id.into(),
            oracle_name: oracle_name.into(),
            hard,
            soft,
        }
    }

    fn combine(
        &self,
        ctx: &OracleContext<'_>,
        phase: OraclePhase,
        mut events: Vec<OracleEvent>,
    ) -> AuditResult<Vec<OracleEvent>> {
        let hard = decision_for(&events, self.hard.oracle_id())
            .cloned()
            .unwrap_or_else(|| OracleDecision::inconclusive("hard_oracle_silent"));

        let mut builder = OracleEvent::builder(
            self.oracle_id.clone(),
            self.oracle_name.clone(),
            OracleType::Hybrid,
            phase,
        )
        .timestamp_ms(ctx.clock.now_utc_ms())
        .requires(self.hard.capabilities_required());

        let decision = if hard.conclusive {
            hard.with_reason_prefix(HARD_PREFIX)
        } else {
            events.extend(check_oracle(self.soft.as_ref(), ctx, phase)?);
            builder = builder.note(format!("hard oracle inconclusive: {}", hard.reason));
            decision_for(&events, self.soft.oracle_id())
                .cloned()
                .unwrap_or_else(|| OracleDecision::inconclusive("soft_oracle_silent"))
                .with_reason_prefix(SOFT_FALLBACK_PREFIX)
        };
        events.push(builder.decision(decision).build());
        Ok(events)
    }
}

impl Oracle for HybridOracle {
    fn oracle_id(&self) -> &str {
        &self.oracle_id
    }

    fn oracle_name(&self) -> &str {
        &self.oracle_name
    }

    fn oracle_type(&self) -> OracleType {
        OracleType::Hybrid
    }

    // The soft path may still decide when hard capabilities are missing.
    fn capabilities_required(&self) -> &[Capability] {
        &[]
    }

    fn pre_check(&self, ctx: &OracleContext<'_>) -> AuditResult<Vec<OracleEvent>> {
        let events = check_oracle(self.hard.as_ref(), ctx, OraclePhase::Pre)?;
        if events.is_empty() {
            return Ok(events);
        }
        self.combine(ctx, OraclePhase::Pre, events)
    }

    fn post_check(&self, ctx: &OracleContext<'_>) -> AuditResult<Vec<OracleEvent>> {
        let events = check_oracle(self.hard.as_ref(), ctx, OraclePhase::Post)?;
        self.combine(ctx, OraclePhase::Post, events)
    }
}
