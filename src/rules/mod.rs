//! Declarative optimization rules.
//!
//! A rule is data: an eligibility predicate over windowed metrics, a change
//! spec, and scoring knobs. Evaluation is deterministic so repeated runs over
//! the same snapshot produce identical proposals.

pub mod catalog;
pub mod registry;

pub use registry::RuleRegistry;

use serde::{Deserialize, Serialize};

use crate::config::RegressionConfig;
use crate::models::{
    Action, EntityKind, EntityRef, EntityState, EntityStatus, Evidence, RiskTier, WindowedMetrics,
};

/// Metric fields a predicate may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricField {
    Clicks7,
    Clicks30,
    Impressions7,
    Impressions30,
    Cost7,
    Cost30,
    Conversions7,
    Conversions30,
    Ctr30,
    Cpc30,
    Roas7,
    Roas30,
    Cpa7,
    Cpa30,
}

impl MetricField {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricField::Clicks7 => "clicks_7d",
            MetricField::Clicks30 => "clicks_30d",
            MetricField::Impressions7 => "impressions_7d",
            MetricField::Impressions30 => "impressions_30d",
            MetricField::Cost7 => "cost_7d",
            MetricField::Cost30 => "cost_30d",
            MetricField::Conversions7 => "conversions_7d",
            MetricField::Conversions30 => "conversions_30d",
            MetricField::Ctr30 => "ctr_30d",
            MetricField::Cpc30 => "cpc_30d",
            MetricField::Roas7 => "roas_7d",
            MetricField::Roas30 => "roas_30d",
            MetricField::Cpa7 => "cpa_7d",
            MetricField::Cpa30 => "cpa_30d",
        }
    }

    pub fn extract(&self, window: &WindowedMetrics) -> f64 {
        match self {
            MetricField::Clicks7 => window.d7.clicks as f64,
            MetricField::Clicks30 => window.d30.clicks as f64,
            MetricField::Impressions7 => window.d7.impressions as f64,
            MetricField::Impressions30 => window.d30.impressions as f64,
            MetricField::Cost7 => window.d7.cost,
            MetricField::Cost30 => window.d30.cost,
            MetricField::Conversions7 => window.d7.conversions,
            MetricField::Conversions30 => window.d30.conversions,
            MetricField::Ctr30 => window.d30.ctr(),
            MetricField::Cpc30 => window.d30.cpc(),
            MetricField::Roas7 => window.d7.roas(),
            MetricField::Roas30 => window.d30.roas(),
            MetricField::Cpa7 => window.d7.cpa(),
            MetricField::Cpa30 => window.d30.cpa(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cmp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl Cmp {
    fn holds(&self, observed: f64, threshold: f64) -> bool {
        match self {
            Cmp::Lt => observed < threshold,
            Cmp::Le => observed <= threshold,
            Cmp::Gt => observed > threshold,
            Cmp::Ge => observed >= threshold,
        }
    }
}

/// One predicate clause; a rule's clauses are conjunctive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: MetricField,
    pub cmp: Cmp,
    pub value: f64,
}

impl Condition {
    pub fn new(field: MetricField, cmp: Cmp, value: f64) -> Self {
        Self { field, cmp, value }
    }
}

/// Minimum signal before a rule may fire at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MinDataPoints {
    pub clicks_30d: u64,
    pub impressions_30d: u64,
}

impl MinDataPoints {
    pub fn met(&self, window: &WindowedMetrics) -> bool {
        window.d30.clicks >= self.clicks_30d && window.d30.impressions >= self.impressions_30d
    }
}

/// How a firing rule computes its new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeSpec {
    /// Relative bid move; sign is the direction.
    AdjustBidPct { pct: f64 },
    /// Relative daily-budget move.
    AdjustBudgetPct { pct: f64 },
    Pause,
    AddNegativeKeyword,
    ExcludeProduct,
}

/// Outcome of applying a change spec to one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedChange {
    pub action: Action,
    pub old_value: f64,
    pub new_value: f64,
    pub change_pct: f64,
}

impl ChangeSpec {
    /// Compute the concrete change, clamping the relative move to
    /// `max_change_pct`. Returns None when the entity cannot take the change
    /// (no bid to adjust, already paused).
    pub fn apply(
        &self,
        entity: &EntityRef,
        state: &EntityState,
        max_change_pct: f64,
    ) -> Option<ProposedChange> {
        match self {
            ChangeSpec::AdjustBidPct { pct } => {
                let old = state.bid.filter(|b| *b > 0.0)?;
                let clamped = pct.clamp(-max_change_pct, max_change_pct);
                let new = round_money(old * (1.0 + clamped));
                Some(ProposedChange {
                    action: Action::AdjustBid { new_bid: new },
                    old_value: old,
                    new_value: new,
                    change_pct: crate::models::change_pct(old, new),
                })
            }
            ChangeSpec::AdjustBudgetPct { pct } => {
                let old = state.budget.filter(|b| *b > 0.0)?;
                let clamped = pct.clamp(-max_change_pct, max_change_pct);
                let new = round_money(old * (1.0 + clamped));
                Some(ProposedChange {
                    action: Action::AdjustBudget { new_budget: new },
                    old_value: old,
                    new_value: new,
                    change_pct: crate::models::change_pct(old, new),
                })
            }
            ChangeSpec::Pause => {
                if state.status != EntityStatus::Enabled {
                    return None;
                }
                Some(ProposedChange {
                    action: Action::SetStatus {
                        status: EntityStatus::Paused,
                    },
                    old_value: 1.0,
                    new_value: 0.0,
                    change_pct: 0.0,
                })
            }
            ChangeSpec::AddNegativeKeyword => {
                let text = entity.keyword_text.clone()?;
                let match_type = entity.match_type?;
                Some(ProposedChange {
                    action: Action::AddNegative {
                        keyword_text: text,
                        match_type,
                    },
                    old_value: 0.0,
                    new_value: 0.0,
                    change_pct: 0.0,
                })
            }
            ChangeSpec::ExcludeProduct => Some(ProposedChange {
                action: Action::ExcludeProduct {
                    product_id: entity.entity_id,
                },
                old_value: 1.0,
                new_value: 0.0,
                change_pct: 0.0,
            }),
        }
    }
}

fn round_money(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Deterministic evidence-to-confidence mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfidenceFormula {
    Fixed { value: f64 },
    /// Saturating in data volume: `base + (1 - base) * min(1, clicks_30d / target)`.
    DataVolume { base: f64, target_clicks: f64 },
}

impl ConfidenceFormula {
    pub fn evaluate(&self, window: &WindowedMetrics) -> f64 {
        match self {
            ConfidenceFormula::Fixed { value } => value.clamp(0.0, 1.0),
            ConfidenceFormula::DataVolume { base, target_clicks } => {
                let volume = if *target_clicks <= 0.0 {
                    1.0
                } else {
                    (window.d30.clicks as f64 / target_clicks).min(1.0)
                };
                (base + (1.0 - base) * volume).clamp(0.0, 1.0)
            }
        }
    }
}

/// A declarative rule. Loaded once at startup; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub rule_id: String,
    pub entity_kind: EntityKind,
    pub change: ChangeSpec,
    pub conditions: Vec<Condition>,
    pub min_data: MinDataPoints,
    pub risk_tier: RiskTier,
    /// Falls back to `guardrails.default_cooldown_days` when unset.
    pub cooldown_days: Option<u32>,
    pub max_change_pct: f64,
    pub confidence: ConfidenceFormula,
    /// Overrides the default regression predicate during monitoring.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regression_override: Option<RegressionConfig>,
    pub enabled: bool,
    /// Human-readable template; `{field}` placeholders are filled from evidence.
    pub reasoning: String,
}

impl Rule {
    /// Evaluate the conjunctive predicate, returning the observed values that
    /// made it pass.
    pub fn eligible(&self, window: &WindowedMetrics) -> Option<Evidence> {
        let mut evidence = Evidence::new();
        for condition in &self.conditions {
            let observed = condition.field.extract(window);
            if !condition.cmp.holds(observed, condition.value) {
                return None;
            }
            evidence.insert(condition.field.as_str().to_string(), observed);
        }
        Some(evidence)
    }

    pub fn cooldown_days_or(&self, default_days: u32) -> u32 {
        self.cooldown_days.unwrap_or(default_days)
    }
}
