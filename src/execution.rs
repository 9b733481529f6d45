//! Execution engine.
//!
//! Orchestrates approval -> guardrails -> adapter -> ledger for single
//! proposals and batches. A batch is never atomic: each proposal's outcome is
//! independent, and the guardrail view accumulates in-batch accepts so two
//! proposals cannot both pass cooldown on one entity-lever.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{error, info, warn};

use crate::adapter::{build_mutation, AdapterOutcome, AdsApiAdapter, MutationRequest};
use crate::approval::ApprovalStore;
use crate::cache::ExpiringCache;
use crate::config::{AppConfig, ExecutionMode};
use crate::error::{AutopilotError, Result};
use crate::guardrails::{self, CheckMode, GuardrailContext, Verdict};
use crate::ledger::{ChangeLedger, LedgerView, NewChangeRecord};
use crate::models::{
    Action, ChangeMetadata, ChangeRecord, EntityStatus, Recommendation, RecommendationStatus,
    RollbackStatus,
};
use crate::rules::RuleRegistry;
use crate::warehouse::Warehouse;

/// Per-proposal outcome, reported to the caller as-is.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Executed {
        change_id: i64,
    },
    /// Dry-run acceptance: the serialized mutation that would be sent.
    WouldExecute {
        payload: MutationRequest,
    },
    Rejected {
        reason_code: String,
        reason: String,
    },
    Failed {
        reason: String,
    },
    NotFound,
    IllegalState {
        current_status: RecommendationStatus,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub recommendation_id: String,
    #[serde(flatten)]
    pub outcome: ExecutionOutcome,
}

pub struct ExecutionEngine {
    approval: Arc<ApprovalStore>,
    ledger: Arc<ChangeLedger>,
    warehouse: Arc<dyn Warehouse>,
    adapter: Arc<dyn AdsApiAdapter>,
    registry: Arc<RuleRegistry>,
    cache: Arc<ExpiringCache>,
    config: AppConfig,
}

impl ExecutionEngine {
    pub fn new(
        approval: Arc<ApprovalStore>,
        ledger: Arc<ChangeLedger>,
        warehouse: Arc<dyn Warehouse>,
        adapter: Arc<dyn AdsApiAdapter>,
        registry: Arc<RuleRegistry>,
        cache: Arc<ExpiringCache>,
        config: AppConfig,
    ) -> Self {
        Self {
            approval,
            ledger,
            warehouse,
            adapter,
            registry,
            cache,
            config,
        }
    }

    pub async fn execute_one(
        &self,
        id: &str,
        mode: ExecutionMode,
        approver: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ExecutionResult> {
        let mut results = self
            .execute_batch(std::slice::from_ref(&id.to_string()), mode, approver, now)
            .await?;
        Ok(results.remove(0))
    }

    /// Execute a batch in presented order. The ledger view is snapshotted
    /// once at the start and extended with in-batch accepts.
    pub async fn execute_batch(
        &self,
        ids: &[String],
        mode: ExecutionMode,
        approver: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionResult>> {
        let horizon = self.cooldown_horizon();
        // One view per customer seen in the batch, loaded lazily.
        let mut views: HashMap<i64, LedgerView> = HashMap::new();
        let mut touched_customers: HashSet<i64> = HashSet::new();
        let mut results = Vec::with_capacity(ids.len());

        for (batch_index, id) in ids.iter().enumerate() {
            let result = self
                .execute_proposal(
                    id,
                    mode,
                    approver,
                    now,
                    batch_index,
                    horizon,
                    &mut views,
                    &mut touched_customers,
                )
                .await?;
            results.push(result);
        }

        // Executed changes make cached dashboard reads stale.
        for customer_id in touched_customers {
            self.cache.invalidate_prefix(&format!("cust:{customer_id}:"));
        }

        Ok(results)
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_proposal(
        &self,
        id: &str,
        mode: ExecutionMode,
        approver: Option<&str>,
        now: DateTime<Utc>,
        batch_index: usize,
        horizon: ChronoDuration,
        views: &mut HashMap<i64, LedgerView>,
        touched_customers: &mut HashSet<i64>,
    ) -> Result<ExecutionResult> {
        let result = |outcome| ExecutionResult {
            recommendation_id: id.to_string(),
            outcome,
        };

        let proposal = match self.approval.get(id) {
            Ok(proposal) => proposal,
            Err(AutopilotError::NotFound(_)) => return Ok(result(ExecutionOutcome::NotFound)),
            Err(other) => return Err(other),
        };
        if proposal.status != RecommendationStatus::Approved {
            return Ok(result(ExecutionOutcome::IllegalState {
                current_status: proposal.status,
            }));
        }

        let customer_id = proposal.entity.customer_id;
        if let Entry::Vacant(slot) = views.entry(customer_id) {
            let entries = self.ledger.lever_changes_since(customer_id, now - horizon)?;
            slot.insert(LedgerView::new(entries));
        }

        // Liveness reread happens here so guardrails stay pure. A warehouse
        // outage refuses the whole batch rather than guessing.
        let live_value = self
            .warehouse
            .as_ref()
            .current_value(&proposal.entity, proposal.lever)?;

        let rule = self.registry.get(&proposal.rule_id);
        let ctx = GuardrailContext {
            config: &self.config.guardrails,
            mode: CheckMode::Standard,
            live_value,
            approver: approver.or(proposal.approved_by.as_deref()),
            batch_index,
            batch_cap: self.config.execution.batch_cap,
            now,
        };
        let view = views.entry(customer_id).or_default();
        let verdict = guardrails::evaluate(&proposal, rule, &ctx, view);

        if let Verdict::Reject(reason) = verdict {
            info!(
                recommendation_id = id,
                entity = %proposal.entity,
                lever = proposal.lever.as_str(),
                decision = "reject",
                reason_code = reason.code(),
                reason = %reason,
                "guardrail rejection"
            );
            // Dry runs advance nothing; live rejects settle the proposal.
            if mode == ExecutionMode::Live {
                self.approval.mark_failed(id, &reason.to_string(), now)?;
            }
            return Ok(result(ExecutionOutcome::Rejected {
                reason_code: reason.code().to_string(),
                reason: reason.to_string(),
            }));
        }

        let request = build_mutation(&proposal.entity, &proposal.action);

        if mode == ExecutionMode::DryRun {
            info!(
                recommendation_id = id,
                entity = %proposal.entity,
                decision = "accept",
                outcome = "dry_run",
                "dry run accepted"
            );
            return Ok(result(ExecutionOutcome::WouldExecute { payload: request }));
        }

        match self.apply_with_retry(&request).await {
            AdapterOutcome::Ok { platform_ack } => {
                let change_id = self.record_execution(&proposal, approver, now)?;
                self.approval.mark_executed(id, now)?;
                views
                    .entry(customer_id)
                    .or_default()
                    .note_pending(proposal.entity.entity_id, proposal.lever, now);
                touched_customers.insert(customer_id);
                info!(
                    recommendation_id = id,
                    entity = %proposal.entity,
                    lever = proposal.lever.as_str(),
                    decision = "accept",
                    outcome = "executed",
                    change_id,
                    platform_ack = %platform_ack,
                    "proposal executed"
                );
                Ok(result(ExecutionOutcome::Executed { change_id }))
            }
            AdapterOutcome::Transient { .. } => {
                let reason = "adapter retries exhausted".to_string();
                self.approval.mark_failed(id, &reason, now)?;
                warn!(recommendation_id = id, outcome = "failed", %reason, "execution failed");
                Ok(result(ExecutionOutcome::Failed { reason }))
            }
            AdapterOutcome::Permanent { error_kind } => {
                let reason = format!("platform rejected: {error_kind}");
                self.approval.mark_failed(id, &reason, now)?;
                warn!(recommendation_id = id, outcome = "failed", %reason, "execution failed");
                Ok(result(ExecutionOutcome::Failed { reason }))
            }
        }
    }

    /// Up to `retry.max` retries with exponential backoff, bounded by the
    /// per-attempt timeout and the overall deadline. Returns the terminal
    /// outcome; `Transient` here means every attempt was transient.
    async fn apply_with_retry(&self, request: &MutationRequest) -> AdapterOutcome {
        let retry = &self.config.execution.retry;
        let attempt_timeout = Duration::from_millis(self.config.execution.attempt_timeout_ms);
        let deadline = Instant::now() + Duration::from_millis(retry.deadline_ms);

        let mut last = AdapterOutcome::Transient { retry_after: None };
        for attempt in 0..=retry.max {
            let outcome = match timeout(attempt_timeout, self.adapter.apply(request)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(attempt, "adapter attempt timed out");
                    AdapterOutcome::Transient { retry_after: None }
                }
            };

            match outcome {
                AdapterOutcome::Transient { retry_after } => {
                    last = AdapterOutcome::Transient { retry_after };
                    if attempt == retry.max {
                        break;
                    }
                    let backoff = Duration::from_millis(
                        retry
                            .base_ms
                            .checked_shl(attempt)
                            .unwrap_or(retry.cap_ms)
                            .min(retry.cap_ms),
                    );
                    let wait = retry_after.unwrap_or(backoff).max(backoff);
                    if Instant::now() + wait >= deadline {
                        warn!("adapter deadline exhausted before next retry");
                        break;
                    }
                    sleep(wait).await;
                }
                terminal => return terminal,
            }
        }
        last
    }

    fn record_execution(
        &self,
        proposal: &Recommendation,
        approver: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let monitored = is_monitorable(&proposal.action);
        let mut metadata = ChangeMetadata {
            confidence: proposal.confidence,
            evidence: proposal.evidence.clone(),
            reasoning: proposal.reasoning.clone(),
            ..ChangeMetadata::default()
        };
        metadata.old_values.insert(
            proposal.lever.as_str().to_string(),
            proposal.old_value.to_string(),
        );
        metadata.new_values.insert(
            proposal.lever.as_str().to_string(),
            proposal.new_value.to_string(),
        );

        let change_id = self.ledger.append(NewChangeRecord {
            entity: proposal.entity.clone(),
            action_type: proposal.action.kind().to_string(),
            lever: proposal.lever,
            old_value: proposal.old_value,
            new_value: proposal.new_value,
            change_pct: proposal.change_pct,
            rule_id: proposal.rule_id.clone(),
            risk_tier: proposal.risk_tier,
            metadata,
            change_date: now,
            executed_at: now,
            approved_by: approver
                .map(str::to_string)
                .or_else(|| proposal.approved_by.clone()),
            rollback_status: monitored.then_some(RollbackStatus::Monitoring),
            rollback_id: None,
            monitoring_started_at: monitored.then_some(now),
        })?;
        Ok(change_id)
    }

    /// Reverse an executed change. Cooldown, one-lever, and risk gates are
    /// bypassed; schema and liveness still apply. On success the new record
    /// points at the original via `rollback_id` and the original settles as
    /// `rolled_back`.
    pub async fn execute_rollback(
        &self,
        original: &ChangeRecord,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let inverse = match inverse_action(original) {
            Some(inverse) => inverse,
            None => {
                warn!(
                    change_id = original.change_id,
                    action_type = %original.action_type,
                    "change has no expressible inverse; skipping rollback"
                );
                return Ok(None);
            }
        };

        let proposal = synthetic_rollback_proposal(original, inverse, now);
        let live_value = self
            .warehouse
            .as_ref()
            .current_value(&proposal.entity, proposal.lever)?;

        let ctx = GuardrailContext {
            config: &self.config.guardrails,
            mode: CheckMode::Rollback,
            live_value,
            approver: None,
            batch_index: 0,
            batch_cap: self.config.execution.batch_cap,
            now,
        };
        let verdict = guardrails::evaluate(&proposal, None, &ctx, &LedgerView::empty());
        if let Verdict::Reject(reject) = verdict {
            // Liveness drift means someone else already moved the lever;
            // leave the record under monitoring and let the next tick decide.
            warn!(
                change_id = original.change_id,
                reason_code = reject.code(),
                reason = %reject,
                "rollback blocked by guardrails"
            );
            return Ok(None);
        }

        let request = build_mutation(&proposal.entity, &proposal.action);
        match self.apply_with_retry(&request).await {
            AdapterOutcome::Ok { platform_ack } => {
                let mut metadata = ChangeMetadata {
                    confidence: 1.0,
                    evidence: original.metadata.evidence.clone(),
                    reasoning: format!("rollback of change {}: {reason}", original.change_id),
                    ..ChangeMetadata::default()
                };
                metadata.old_values.insert(
                    original.lever.as_str().to_string(),
                    original.new_value.to_string(),
                );
                metadata.new_values.insert(
                    original.lever.as_str().to_string(),
                    original.old_value.to_string(),
                );

                let change_id = self.ledger.append(NewChangeRecord {
                    entity: original.entity.clone(),
                    action_type: proposal.action.kind().to_string(),
                    lever: original.lever,
                    old_value: original.new_value,
                    new_value: original.old_value,
                    change_pct: crate::models::change_pct(original.new_value, original.old_value),
                    rule_id: original.rule_id.clone(),
                    risk_tier: original.risk_tier,
                    metadata,
                    change_date: now,
                    executed_at: now,
                    approved_by: None,
                    // Rollbacks are not monitored for secondary regressions.
                    rollback_status: None,
                    rollback_id: Some(original.change_id),
                    monitoring_started_at: None,
                })?;

                self.ledger.mark_rollback_result(
                    original.change_id,
                    RollbackStatus::RolledBack,
                    Some(reason),
                    now,
                )?;
                self.cache
                    .invalidate_prefix(&format!("cust:{}:", original.entity.customer_id));
                info!(
                    original_change_id = original.change_id,
                    rollback_change_id = change_id,
                    platform_ack = %platform_ack,
                    reason,
                    "rollback executed"
                );
                Ok(Some(change_id))
            }
            AdapterOutcome::Transient { .. } | AdapterOutcome::Permanent { .. } => {
                error!(
                    change_id = original.change_id,
                    "rollback mutation failed; record stays under monitoring"
                );
                Ok(None)
            }
        }
    }

    /// Widest cooldown any rule can demand, for sizing the ledger snapshot.
    fn cooldown_horizon(&self) -> ChronoDuration {
        let default_days = self.config.guardrails.default_cooldown_days;
        let max_days = self
            .registry
            .rules()
            .iter()
            .map(|r| r.cooldown_days.unwrap_or(default_days))
            .max()
            .unwrap_or(default_days)
            .max(default_days);
        ChronoDuration::days(i64::from(max_days) + 1)
    }
}

fn is_monitorable(action: &Action) -> bool {
    matches!(
        action,
        Action::AdjustBid { .. } | Action::AdjustBudget { .. } | Action::SetStatus { .. }
    )
}

fn inverse_action(original: &ChangeRecord) -> Option<Action> {
    match original.action_type.as_str() {
        "adjust_bid" => Some(Action::AdjustBid {
            new_bid: original.old_value,
        }),
        "adjust_budget" => Some(Action::AdjustBudget {
            new_budget: original.old_value,
        }),
        "set_status" => Some(Action::SetStatus {
            status: if original.old_value == 1.0 {
                EntityStatus::Enabled
            } else {
                EntityStatus::Paused
            },
        }),
        // Criterion creates (negatives, exclusions) have no restore-value
        // inverse on the platform.
        _ => None,
    }
}

fn synthetic_rollback_proposal(
    original: &ChangeRecord,
    inverse: Action,
    now: DateTime<Utc>,
) -> Recommendation {
    Recommendation {
        recommendation_id: format!("rollback-{}", original.change_id),
        rule_id: original.rule_id.clone(),
        entity: original.entity.clone(),
        lever: original.lever,
        action: inverse,
        old_value: original.new_value,
        new_value: original.old_value,
        change_pct: crate::models::change_pct(original.new_value, original.old_value),
        risk_tier: original.risk_tier,
        confidence: 1.0,
        evidence: original.metadata.evidence.clone(),
        reasoning: format!("inverse of change {}", original.change_id),
        status: RecommendationStatus::Approved,
        snapshot_date: now.date_naive(),
        created_at: now,
        decided_at: None,
        approved_by: None,
        failure_reason: None,
    }
}
