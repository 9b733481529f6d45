//! Pre-execution guardrails.
//!
//! `evaluate` is a pure function over the proposal, a point-in-time ledger
//! view, and a freshly-read live value. Rejections are ordinary values; the
//! first failing check wins. The rate limit (check 8) lives at the HTTP
//! boundary in `middleware::rate_limit`.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;

use crate::config::GuardrailConfig;
use crate::ledger::LedgerView;
use crate::models::{Action, Lever, Recommendation, RiskTier};
use crate::rules::Rule;

/// Absolute sanity bounds per lever, independent of any rule.
pub const MIN_BID: f64 = 0.01;
pub const MAX_BID: f64 = 500.0;
pub const MIN_BUDGET: f64 = 1.0;
pub const MAX_BUDGET: f64 = 1_000_000.0;

/// Tolerance when comparing the proposal's `old_value` to the live value.
const VALUE_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RejectReason {
    ValidationFailed { field: String, message: String },
    StaleProposal { expected: f64, found: Option<f64> },
    InCooldown { until: DateTime<Utc> },
    ConflictingLever { lever: Lever },
    MaxChangeExceeded { change_pct: f64, max_change_pct: f64 },
    RiskGate { required_confidence: f64 },
    BatchCapExceeded { cap: usize },
    RateLimited { retry_after_secs: u64 },
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::ValidationFailed { .. } => "validation_failed",
            RejectReason::StaleProposal { .. } => "stale_proposal",
            RejectReason::InCooldown { .. } => "in_cooldown",
            RejectReason::ConflictingLever { .. } => "conflicting_lever",
            RejectReason::MaxChangeExceeded { .. } => "max_change_exceeded",
            RejectReason::RiskGate { .. } => "risk_gate",
            RejectReason::BatchCapExceeded { .. } => "batch_cap_exceeded",
            RejectReason::RateLimited { .. } => "rate_limited",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::ValidationFailed { field, message } => {
                write!(f, "validation failed on `{field}`: {message}")
            }
            RejectReason::StaleProposal { expected, found } => write!(
                f,
                "stale proposal: expected current value {expected}, found {found:?}"
            ),
            RejectReason::InCooldown { until } => {
                write!(f, "in cooldown until {}", until.to_rfc3339())
            }
            RejectReason::ConflictingLever { lever } => {
                write!(f, "conflicting change on lever `{}`", lever.as_str())
            }
            RejectReason::MaxChangeExceeded {
                change_pct,
                max_change_pct,
            } => write!(
                f,
                "change {:.1}% exceeds cap {:.1}%",
                change_pct * 100.0,
                max_change_pct * 100.0
            ),
            RejectReason::RiskGate {
                required_confidence,
            } => write!(
                f,
                "high-risk proposal requires an approver and confidence >= {required_confidence}"
            ),
            RejectReason::BatchCapExceeded { cap } => {
                write!(f, "batch exceeds cap of {cap} proposals")
            }
            RejectReason::RateLimited { retry_after_secs } => {
                write!(f, "rate limited, retry after {retry_after_secs}s")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accept,
    Reject(RejectReason),
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }
}

/// Which checks apply. Rollbacks keep schema and liveness but bypass
/// cooldown, one-lever, the change cap, the risk gate, and the batch cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    Standard,
    Rollback,
}

pub struct GuardrailContext<'a> {
    pub config: &'a GuardrailConfig,
    pub mode: CheckMode,
    /// Lever value reread from the warehouse just before evaluation; None
    /// when the entity is no longer present.
    pub live_value: Option<f64>,
    pub approver: Option<&'a str>,
    /// Zero-based position of this proposal within its batch.
    pub batch_index: usize,
    pub batch_cap: usize,
    pub now: DateTime<Utc>,
}

pub fn evaluate(
    proposal: &Recommendation,
    rule: Option<&Rule>,
    ctx: &GuardrailContext<'_>,
    view: &LedgerView,
) -> Verdict {
    // 1. Schema validation: closed action set, values within absolute bounds.
    if let Some(reason) = validate_schema(proposal) {
        return Verdict::Reject(reason);
    }

    // 2. Entity liveness: the proposal's old_value must still be current.
    match ctx.live_value {
        Some(live) if (live - proposal.old_value).abs() <= VALUE_EPSILON => {}
        found => {
            return Verdict::Reject(RejectReason::StaleProposal {
                expected: proposal.old_value,
                found,
            })
        }
    }

    if ctx.mode == CheckMode::Rollback {
        return Verdict::Accept;
    }

    // Standard execution needs the originating rule for its thresholds; a
    // proposal whose rule has left the registry cannot be safely applied.
    let rule = match rule {
        Some(rule) => rule,
        None => {
            return Verdict::Reject(RejectReason::ValidationFailed {
                field: "rule_id".to_string(),
                message: format!("rule `{}` is not in the registry", proposal.rule_id),
            })
        }
    };

    let cooldown_days = rule.cooldown_days_or(ctx.config.default_cooldown_days);
    let cooldown = Duration::days(i64::from(cooldown_days));
    let since = ctx.now - cooldown;
    let entity_id = proposal.entity.entity_id;

    // 3. Cooldown on this entity-lever (24h rolling from execution).
    if let Some(prior) = view.last_change(entity_id, proposal.lever, since) {
        return Verdict::Reject(RejectReason::InCooldown {
            until: prior.change_date + cooldown,
        });
    }

    // 4. One lever at a time per entity.
    if let Some(conflict) = view.other_lever_change(entity_id, proposal.lever, since) {
        return Verdict::Reject(RejectReason::ConflictingLever {
            lever: conflict.lever,
        });
    }

    // 5. Relative change cap.
    if proposal.change_pct.abs() > rule.max_change_pct + VALUE_EPSILON {
        return Verdict::Reject(RejectReason::MaxChangeExceeded {
            change_pct: proposal.change_pct,
            max_change_pct: rule.max_change_pct,
        });
    }

    // 6. Risk gate: HIGH needs a named approver and a confidence floor.
    if proposal.risk_tier == RiskTier::High {
        let floor = ctx.config.high_risk_confidence_floor;
        if ctx.approver.is_none() || proposal.confidence < floor {
            return Verdict::Reject(RejectReason::RiskGate {
                required_confidence: floor,
            });
        }
    }

    // 7. Batch cap.
    if ctx.batch_index >= ctx.batch_cap {
        return Verdict::Reject(RejectReason::BatchCapExceeded { cap: ctx.batch_cap });
    }

    Verdict::Accept
}

fn validate_schema(proposal: &Recommendation) -> Option<RejectReason> {
    if !proposal.confidence.is_finite() || !(0.0..=1.0).contains(&proposal.confidence) {
        return Some(RejectReason::ValidationFailed {
            field: "confidence".to_string(),
            message: "must be within [0, 1]".to_string(),
        });
    }
    if !proposal.change_pct.is_finite() {
        return Some(RejectReason::ValidationFailed {
            field: "change_pct".to_string(),
            message: "must be finite".to_string(),
        });
    }
    if proposal.action.lever() != proposal.lever {
        return Some(RejectReason::ValidationFailed {
            field: "lever".to_string(),
            message: "does not match the action".to_string(),
        });
    }

    match &proposal.action {
        Action::AdjustBid { new_bid } => {
            if !new_bid.is_finite() || *new_bid < MIN_BID || *new_bid > MAX_BID {
                return Some(RejectReason::ValidationFailed {
                    field: "new_bid".to_string(),
                    message: format!("must be within [{MIN_BID}, {MAX_BID}]"),
                });
            }
        }
        Action::AdjustBudget { new_budget } => {
            if !new_budget.is_finite() || *new_budget < MIN_BUDGET || *new_budget > MAX_BUDGET {
                return Some(RejectReason::ValidationFailed {
                    field: "new_budget".to_string(),
                    message: format!("must be within [{MIN_BUDGET}, {MAX_BUDGET}]"),
                });
            }
        }
        Action::AddNegative { keyword_text, .. } => {
            if keyword_text.trim().is_empty() {
                return Some(RejectReason::ValidationFailed {
                    field: "keyword_text".to_string(),
                    message: "must not be empty".to_string(),
                });
            }
        }
        Action::SetStatus { .. } | Action::ExcludeProduct { .. } => {}
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityKind, EntityRef, RecommendationStatus};
    use crate::rules::catalog;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn proposal(entity_id: i64, old: f64, new: f64) -> Recommendation {
        Recommendation {
            recommendation_id: "r1".to_string(),
            rule_id: "KW_BID_UP_LOW_CPA".to_string(),
            entity: EntityRef::new(9_999_999_999, EntityKind::Keyword, entity_id),
            action: Action::AdjustBid { new_bid: new },
            lever: Lever::Bid,
            old_value: old,
            new_value: new,
            change_pct: crate::models::change_pct(old, new),
            risk_tier: RiskTier::Low,
            confidence: 0.8,
            evidence: BTreeMap::new(),
            reasoning: "test".to_string(),
            status: RecommendationStatus::Approved,
            snapshot_date: NaiveDate::from_ymd_opt(2025, 6, 30).unwrap(),
            created_at: Utc::now(),
            decided_at: None,
            approved_by: Some("ops".to_string()),
            failure_reason: None,
        }
    }

    fn rule() -> Rule {
        catalog::default_rules()
            .into_iter()
            .find(|r| r.rule_id == "KW_BID_UP_LOW_CPA")
            .unwrap()
    }

    fn ctx<'a>(config: &'a GuardrailConfig, live: Option<f64>) -> GuardrailContext<'a> {
        GuardrailContext {
            config,
            mode: CheckMode::Standard,
            live_value: live,
            approver: Some("ops"),
            batch_index: 0,
            batch_cap: 100,
            now: Utc::now(),
        }
    }

    #[test]
    fn clean_proposal_accepts() {
        let config = GuardrailConfig::default();
        let verdict = evaluate(
            &proposal(3005, 1.0, 1.15),
            Some(&rule()),
            &ctx(&config, Some(1.0)),
            &LedgerView::empty(),
        );
        assert_eq!(verdict, Verdict::Accept);
    }

    #[test]
    fn stale_value_rejects_before_cooldown() {
        let config = GuardrailConfig::default();
        // Live value drifted AND a cooldown entry exists: staleness wins.
        let mut view = LedgerView::empty();
        view.note_pending(3005, Lever::Bid, Utc::now());

        let verdict = evaluate(
            &proposal(3005, 1.0, 1.15),
            Some(&rule()),
            &ctx(&config, Some(1.07)),
            &view,
        );
        assert!(matches!(
            verdict,
            Verdict::Reject(RejectReason::StaleProposal { .. })
        ));
    }

    #[test]
    fn cooldown_reject_names_release_time() {
        let config = GuardrailConfig::default();
        let now = Utc::now();
        let changed_at = now - Duration::days(3);
        let mut view = LedgerView::empty();
        view.note_pending(3005, Lever::Bid, changed_at);

        let verdict = evaluate(
            &proposal(3005, 1.0, 1.15),
            Some(&rule()),
            &ctx(&config, Some(1.0)),
            &view,
        );
        match verdict {
            Verdict::Reject(RejectReason::InCooldown { until }) => {
                assert_eq!(until, changed_at + Duration::days(7));
            }
            other => panic!("expected InCooldown, got {other:?}"),
        }
    }

    #[test]
    fn other_lever_conflicts() {
        let config = GuardrailConfig::default();
        let mut view = LedgerView::empty();
        view.note_pending(3005, Lever::Status, Utc::now() - Duration::days(1));

        let verdict = evaluate(
            &proposal(3005, 1.0, 1.15),
            Some(&rule()),
            &ctx(&config, Some(1.0)),
            &view,
        );
        assert!(matches!(
            verdict,
            Verdict::Reject(RejectReason::ConflictingLever { lever: Lever::Status })
        ));
    }

    #[test]
    fn oversized_change_rejects() {
        let config = GuardrailConfig::default();
        let verdict = evaluate(
            &proposal(3005, 1.0, 1.5), // +50% against a 20% cap
            Some(&rule()),
            &ctx(&config, Some(1.0)),
            &LedgerView::empty(),
        );
        assert!(matches!(
            verdict,
            Verdict::Reject(RejectReason::MaxChangeExceeded { .. })
        ));
    }

    #[test]
    fn high_risk_requires_approver_and_confidence() {
        let config = GuardrailConfig::default();
        let mut p = proposal(3005, 1.0, 1.15);
        p.risk_tier = RiskTier::High;
        p.confidence = 0.7; // below the 0.85 floor

        let verdict = evaluate(&p, Some(&rule()), &ctx(&config, Some(1.0)), &LedgerView::empty());
        assert!(matches!(verdict, Verdict::Reject(RejectReason::RiskGate { .. })));

        p.confidence = 0.9;
        let mut no_approver = ctx(&config, Some(1.0));
        no_approver.approver = None;
        let verdict = evaluate(&p, Some(&rule()), &no_approver, &LedgerView::empty());
        assert!(matches!(verdict, Verdict::Reject(RejectReason::RiskGate { .. })));

        let verdict = evaluate(&p, Some(&rule()), &ctx(&config, Some(1.0)), &LedgerView::empty());
        assert_eq!(verdict, Verdict::Accept);
    }

    #[test]
    fn batch_overflow_rejects() {
        let config = GuardrailConfig::default();
        let mut overflow = ctx(&config, Some(1.0));
        overflow.batch_index = 100;
        let verdict = evaluate(
            &proposal(3005, 1.0, 1.15),
            Some(&rule()),
            &overflow,
            &LedgerView::empty(),
        );
        assert!(matches!(
            verdict,
            Verdict::Reject(RejectReason::BatchCapExceeded { cap: 100 })
        ));
    }

    #[test]
    fn rollback_mode_keeps_schema_and_liveness_only() {
        let config = GuardrailConfig::default();
        let now = Utc::now();
        let mut view = LedgerView::empty();
        view.note_pending(3005, Lever::Bid, now); // would fail cooldown

        let mut rollback = ctx(&config, Some(1.15));
        rollback.mode = CheckMode::Rollback;

        // Inverse mutation: restore 1.15 back to 1.0.
        let p = proposal(3005, 1.15, 1.0);
        assert_eq!(evaluate(&p, Some(&rule()), &rollback, &view), Verdict::Accept);

        // Liveness still applies in rollback mode.
        rollback.live_value = Some(0.9);
        assert!(matches!(
            evaluate(&p, Some(&rule()), &rollback, &view),
            Verdict::Reject(RejectReason::StaleProposal { .. })
        ));
    }

    #[test]
    fn absolute_bounds_reject_zero_bid() {
        let config = GuardrailConfig::default();
        let mut p = proposal(3005, 1.0, 0.0);
        p.action = Action::AdjustBid { new_bid: 0.0 };
        let verdict = evaluate(&p, Some(&rule()), &ctx(&config, Some(1.0)), &LedgerView::empty());
        assert!(matches!(
            verdict,
            Verdict::Reject(RejectReason::ValidationFailed { .. })
        ));
    }
}
