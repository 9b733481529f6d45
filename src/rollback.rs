//! Rollback monitor.
//!
//! Watches every executed change while it is under monitoring, compares the
//! post-change window against the pre-change baseline, and reverses the
//! change when the regression predicate fires. Settled records are never
//! re-evaluated.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{RegressionConfig, RollbackConfig};
use crate::error::Result;
use crate::execution::ExecutionEngine;
use crate::ledger::ChangeLedger;
use crate::models::{ChangeRecord, RollbackStatus, WindowSums};
use crate::rules::RuleRegistry;
use crate::warehouse::Warehouse;

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickSummary {
    pub examined: usize,
    pub rolled_back: usize,
    pub confirmed_good: usize,
    pub extended: usize,
    pub blocked: usize,
}

/// What the regression predicate decided for one record.
#[derive(Debug, Clone, PartialEq)]
enum Assessment {
    Regressed { reason: String },
    Healthy,
    InsufficientSignal,
}

pub struct RollbackMonitor {
    ledger: Arc<ChangeLedger>,
    warehouse: Arc<dyn Warehouse>,
    execution: Arc<ExecutionEngine>,
    registry: Arc<RuleRegistry>,
    config: RollbackConfig,
    /// Per-record advisory claim; a concurrent tick loses and skips.
    in_flight: Mutex<HashSet<i64>>,
}

impl RollbackMonitor {
    pub fn new(
        ledger: Arc<ChangeLedger>,
        warehouse: Arc<dyn Warehouse>,
        execution: Arc<ExecutionEngine>,
        registry: Arc<RuleRegistry>,
        config: RollbackConfig,
    ) -> Self {
        Self {
            ledger,
            warehouse,
            execution,
            registry,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// One monitoring pass over every due record.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickSummary> {
        let window = Duration::days(i64::from(self.config.window_days));
        let due = self.ledger.due_for_monitoring(now, window)?;
        let mut summary = TickSummary::default();

        for record in due {
            if !self.in_flight.lock().insert(record.change_id) {
                continue; // another tick holds the claim
            }
            let outcome = self.evaluate_record(&record, now).await;
            self.in_flight.lock().remove(&record.change_id);

            summary.examined += 1;
            match outcome? {
                RecordOutcome::RolledBack => summary.rolled_back += 1,
                RecordOutcome::ConfirmedGood => summary.confirmed_good += 1,
                RecordOutcome::Extended => summary.extended += 1,
                RecordOutcome::Blocked => summary.blocked += 1,
            }
        }

        if summary.examined > 0 {
            info!(
                examined = summary.examined,
                rolled_back = summary.rolled_back,
                confirmed_good = summary.confirmed_good,
                extended = summary.extended,
                blocked = summary.blocked,
                "rollback monitor tick"
            );
        }
        Ok(summary)
    }

    async fn evaluate_record(
        &self,
        record: &ChangeRecord,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome> {
        match self.assess(record)? {
            Assessment::InsufficientSignal => {
                let cap = Duration::days(i64::from(self.config.max_monitoring_days));
                if now - record.executed_at >= cap {
                    self.ledger.mark_rollback_result(
                        record.change_id,
                        RollbackStatus::ConfirmedGood,
                        Some("insufficient_signal"),
                        now,
                    )?;
                    info!(
                        change_id = record.change_id,
                        "monitoring capped without enough signal; confirmed good"
                    );
                    Ok(RecordOutcome::ConfirmedGood)
                } else {
                    // Not enough post data yet; check again next tick.
                    Ok(RecordOutcome::Extended)
                }
            }
            Assessment::Healthy => {
                self.ledger.mark_rollback_result(
                    record.change_id,
                    RollbackStatus::ConfirmedGood,
                    None,
                    now,
                )?;
                Ok(RecordOutcome::ConfirmedGood)
            }
            Assessment::Regressed { reason } => {
                warn!(
                    change_id = record.change_id,
                    entity = %record.entity,
                    %reason,
                    "regression detected; reversing change"
                );
                match self.execution.execute_rollback(record, &reason, now).await? {
                    Some(_) => Ok(RecordOutcome::RolledBack),
                    None => Ok(RecordOutcome::Blocked),
                }
            }
        }
    }

    /// Compare `[executed - W, executed)` against `[executed, executed + W)`.
    fn assess(&self, record: &ChangeRecord) -> Result<Assessment> {
        let window_days = i64::from(self.config.window_days);
        let executed = record.executed_at.date_naive();

        let baseline = self.window_sums(
            record,
            executed - Duration::days(window_days),
            executed - Duration::days(1),
        )?;
        let post = self.window_sums(
            record,
            executed,
            executed + Duration::days(window_days - 1),
        )?;

        let required_clicks = baseline.clicks.max(self.config.min_post_data_points);
        if post.clicks < required_clicks {
            return Ok(Assessment::InsufficientSignal);
        }

        let thresholds = self.thresholds_for(record);
        Ok(assess_windows(&baseline, &post, &thresholds))
    }

    fn window_sums(
        &self,
        record: &ChangeRecord,
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    ) -> Result<WindowSums> {
        let rows = self.warehouse.get_entity_metrics_between(
            record.entity.entity_kind,
            record.entity.customer_id,
            record.entity.entity_id,
            start,
            end,
        )?;
        let mut sums = WindowSums::default();
        for row in &rows {
            sums.accumulate(row);
        }
        Ok(sums)
    }

    fn thresholds_for(&self, record: &ChangeRecord) -> RegressionConfig {
        self.registry
            .get(&record.rule_id)
            .and_then(|rule| rule.regression_override.clone())
            .unwrap_or_else(|| self.config.regression.clone())
    }
}

enum RecordOutcome {
    RolledBack,
    ConfirmedGood,
    Extended,
    Blocked,
}

/// Default predicate: a ROAS drop beyond the threshold while spend rose, or
/// a CPA increase beyond its threshold, is a regression.
fn assess_windows(
    baseline: &WindowSums,
    post: &WindowSums,
    thresholds: &RegressionConfig,
) -> Assessment {
    if baseline.roas() > 0.0 {
        let drop = (baseline.roas() - post.roas()) / baseline.roas();
        if drop > thresholds.roas_drop_pct && post.cost > baseline.cost {
            return Assessment::Regressed {
                reason: format!("roas_regression_{:.0}%", drop * 100.0),
            };
        }
    }

    if baseline.conversions > 0.0 && baseline.cpa() > 0.0 {
        // Spend without a single conversion is a worst-case CPA.
        let increase = if post.conversions <= 0.0 {
            if post.cost > 0.0 {
                f64::INFINITY
            } else {
                0.0
            }
        } else {
            (post.cpa() - baseline.cpa()) / baseline.cpa()
        };
        if increase > thresholds.cpa_increase_pct {
            let label = if increase.is_finite() {
                format!("cpa_regression_{:.0}%", increase * 100.0)
            } else {
                "cpa_regression_no_conversions".to_string()
            };
            return Assessment::Regressed { reason: label };
        }
    }

    Assessment::Healthy
}

/// Periodic driver: one tick every `tick_seconds` until the process exits.
pub async fn run(monitor: Arc<RollbackMonitor>) {
    let period = std::time::Duration::from_secs(monitor.config.tick_seconds);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(err) = monitor.tick(Utc::now()).await {
            warn!(error = %err, "rollback monitor tick failed");
        }
    }
}
