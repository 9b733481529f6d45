//! Core domain types shared across the control plane.
//!
//! Everything the engines exchange is one of these types: managed entities,
//! windowed metrics, typed change actions, recommendations awaiting approval,
//! and append-only change records.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kinds of managed objects on the ads platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Campaign,
    AdGroup,
    Keyword,
    Ad,
    Product,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Campaign => "campaign",
            EntityKind::AdGroup => "ad_group",
            EntityKind::Keyword => "keyword",
            EntityKind::Ad => "ad",
            EntityKind::Product => "product",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "campaign" => Some(EntityKind::Campaign),
            "ad_group" => Some(EntityKind::AdGroup),
            "keyword" => Some(EntityKind::Keyword),
            "ad" => Some(EntityKind::Ad),
            "product" => Some(EntityKind::Product),
            _ => None,
        }
    }

    pub fn all() -> [EntityKind; 5] {
        [
            EntityKind::Campaign,
            EntityKind::AdGroup,
            EntityKind::Keyword,
            EntityKind::Ad,
            EntityKind::Product,
        ]
    }
}

/// Keyword match types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchType {
    Exact,
    Phrase,
    Broad,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Exact => "EXACT",
            MatchType::Phrase => "PHRASE",
            MatchType::Broad => "BROAD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "EXACT" => Some(MatchType::Exact),
            "PHRASE" => Some(MatchType::Phrase),
            "BROAD" => Some(MatchType::Broad),
            _ => None,
        }
    }
}

/// Serving status of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityStatus {
    Enabled,
    Paused,
    Removed,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Enabled => "ENABLED",
            EntityStatus::Paused => "PAUSED",
            EntityStatus::Removed => "REMOVED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ENABLED" => Some(EntityStatus::Enabled),
            "PAUSED" => Some(EntityStatus::Paused),
            "REMOVED" => Some(EntityStatus::Removed),
            _ => None,
        }
    }
}

/// Identity of a managed entity. Keywords carry their ad group and text;
/// other kinds leave those fields empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    pub customer_id: i64,
    pub entity_kind: EntityKind,
    pub entity_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ad_group_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_type: Option<MatchType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword_text: Option<String>,
}

impl EntityRef {
    pub fn new(customer_id: i64, entity_kind: EntityKind, entity_id: i64) -> Self {
        Self {
            customer_id,
            entity_kind,
            entity_id,
            ad_group_id: None,
            match_type: None,
            keyword_text: None,
        }
    }

    pub fn keyword(
        customer_id: i64,
        entity_id: i64,
        ad_group_id: i64,
        keyword_text: String,
        match_type: MatchType,
    ) -> Self {
        Self {
            customer_id,
            entity_kind: EntityKind::Keyword,
            entity_id,
            ad_group_id: Some(ad_group_id),
            match_type: Some(match_type),
            keyword_text: Some(keyword_text),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.customer_id,
            self.entity_kind.as_str(),
            self.entity_id
        )
    }
}

/// Per-entity per-day aggregate. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub snapshot_date: NaiveDate,
    pub impressions: u64,
    pub clicks: u64,
    pub cost: f64,
    pub conversions: f64,
    pub conversions_value: f64,
}

impl MetricRow {
    pub fn ctr(&self) -> f64 {
        if self.impressions == 0 {
            0.0
        } else {
            self.clicks as f64 / self.impressions as f64
        }
    }

    pub fn cpc(&self) -> f64 {
        if self.clicks == 0 {
            0.0
        } else {
            self.cost / self.clicks as f64
        }
    }

    pub fn roas(&self) -> f64 {
        if self.cost <= 0.0 {
            0.0
        } else {
            self.conversions_value / self.cost
        }
    }

    pub fn cpa(&self) -> f64 {
        if self.conversions <= 0.0 {
            0.0
        } else {
            self.cost / self.conversions
        }
    }
}

/// Sums over a trailing window ending at a snapshot date.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowSums {
    pub impressions: u64,
    pub clicks: u64,
    pub cost: f64,
    pub conversions: f64,
    pub conversions_value: f64,
}

impl WindowSums {
    pub fn accumulate(&mut self, row: &MetricRow) {
        self.impressions += row.impressions;
        self.clicks += row.clicks;
        self.cost += row.cost;
        self.conversions += row.conversions;
        self.conversions_value += row.conversions_value;
    }

    pub fn ctr(&self) -> f64 {
        if self.impressions == 0 {
            0.0
        } else {
            self.clicks as f64 / self.impressions as f64
        }
    }

    pub fn cpc(&self) -> f64 {
        if self.clicks == 0 {
            0.0
        } else {
            self.cost / self.clicks as f64
        }
    }

    pub fn roas(&self) -> f64 {
        if self.cost <= 0.0 {
            0.0
        } else {
            self.conversions_value / self.cost
        }
    }

    pub fn cpa(&self) -> f64 {
        if self.conversions <= 0.0 {
            0.0
        } else {
            self.cost / self.conversions
        }
    }
}

/// Precomputed 7-day and 30-day aggregates for an entity as of a snapshot date.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowedMetrics {
    pub snapshot_date: Option<NaiveDate>,
    pub d7: WindowSums,
    pub d30: WindowSums,
}

/// Current mutable attributes of an entity, as of the latest snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub status: EntityStatus,
    /// Current CPC bid, where the kind has one.
    pub bid: Option<f64>,
    /// Current daily budget, where the kind has one.
    pub budget: Option<f64>,
}

/// An entity together with its windowed metrics, as served by the warehouse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityWithMetrics {
    pub entity: EntityRef,
    pub state: EntityState,
    pub window: WindowedMetrics,
}

/// The dimension of change on an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lever {
    Bid,
    Budget,
    Status,
}

impl Lever {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lever::Bid => "bid",
            Lever::Budget => "budget",
            Lever::Status => "status",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bid" => Some(Lever::Bid),
            "budget" => Some(Lever::Budget),
            "status" => Some(Lever::Status),
            _ => None,
        }
    }
}

/// Closed set of change actions the system can propose and execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    AdjustBid { new_bid: f64 },
    AdjustBudget { new_budget: f64 },
    SetStatus { status: EntityStatus },
    AddNegative { keyword_text: String, match_type: MatchType },
    ExcludeProduct { product_id: i64 },
}

impl Action {
    pub fn lever(&self) -> Lever {
        match self {
            Action::AdjustBid { .. } => Lever::Bid,
            Action::AdjustBudget { .. } => Lever::Budget,
            Action::SetStatus { .. }
            | Action::AddNegative { .. }
            | Action::ExcludeProduct { .. } => Lever::Status,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Action::AdjustBid { .. } => "adjust_bid",
            Action::AdjustBudget { .. } => "adjust_budget",
            Action::SetStatus { .. } => "set_status",
            Action::AddNegative { .. } => "add_negative",
            Action::ExcludeProduct { .. } => "exclude_product",
        }
    }

    /// Numeric target of the action, for levers that carry one.
    pub fn numeric_value(&self) -> Option<f64> {
        match self {
            Action::AdjustBid { new_bid } => Some(*new_bid),
            Action::AdjustBudget { new_budget } => Some(*new_budget),
            _ => None,
        }
    }
}

/// LOW < MEDIUM < HIGH. Ordering is used for tie-breaks and risk gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Low => "LOW",
            RiskTier::Medium => "MEDIUM",
            RiskTier::High => "HIGH",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LOW" => Some(RiskTier::Low),
            "MEDIUM" => Some(RiskTier::Medium),
            "HIGH" => Some(RiskTier::High),
            _ => None,
        }
    }
}

/// Named metrics that caused a rule to fire. BTreeMap keeps serialization
/// deterministic so repeated generation runs compare byte-identical.
pub type Evidence = BTreeMap<String, f64>;

/// Recommendation lifecycle. Transitions are monotonic:
/// PENDING -> APPROVED | REJECTED | EXPIRED, APPROVED -> EXECUTED | FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendationStatus {
    Pending,
    Approved,
    Rejected,
    Executed,
    Failed,
    Expired,
}

impl RecommendationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendationStatus::Pending => "PENDING",
            RecommendationStatus::Approved => "APPROVED",
            RecommendationStatus::Rejected => "REJECTED",
            RecommendationStatus::Executed => "EXECUTED",
            RecommendationStatus::Failed => "FAILED",
            RecommendationStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(RecommendationStatus::Pending),
            "APPROVED" => Some(RecommendationStatus::Approved),
            "REJECTED" => Some(RecommendationStatus::Rejected),
            "EXECUTED" => Some(RecommendationStatus::Executed),
            "FAILED" => Some(RecommendationStatus::Failed),
            "EXPIRED" => Some(RecommendationStatus::Expired),
            _ => None,
        }
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition_to(&self, to: RecommendationStatus) -> bool {
        use RecommendationStatus::*;
        matches!(
            (self, to),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Pending, Expired)
                | (Approved, Executed)
                | (Approved, Failed)
        )
    }
}

/// A typed, ranked change proposal awaiting approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub recommendation_id: String,
    pub rule_id: String,
    pub entity: EntityRef,
    pub action: Action,
    pub lever: Lever,
    pub old_value: f64,
    pub new_value: f64,
    pub change_pct: f64,
    pub risk_tier: RiskTier,
    pub confidence: f64,
    pub evidence: Evidence,
    pub reasoning: String,
    pub status: RecommendationStatus,
    pub snapshot_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Rollback state of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Monitoring,
    RolledBack,
    ConfirmedGood,
}

impl RollbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackStatus::Monitoring => "monitoring",
            RollbackStatus::RolledBack => "rolled_back",
            RollbackStatus::ConfirmedGood => "confirmed_good",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "monitoring" => Some(RollbackStatus::Monitoring),
            "rolled_back" => Some(RollbackStatus::RolledBack),
            "confirmed_good" => Some(RollbackStatus::ConfirmedGood),
            _ => None,
        }
    }
}

/// Structured metadata carried on each ledger entry. The single boundary
/// conversion from typed actions into the storage bag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeMetadata {
    pub confidence: f64,
    pub evidence: Evidence,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub old_values: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub new_values: BTreeMap<String, String>,
}

/// One entry in the append-only change ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub change_id: i64,
    pub entity: EntityRef,
    pub action_type: String,
    pub lever: Lever,
    pub old_value: f64,
    pub new_value: f64,
    pub change_pct: f64,
    pub rule_id: String,
    pub risk_tier: RiskTier,
    pub metadata: ChangeMetadata,
    pub change_date: DateTime<Utc>,
    pub executed_at: DateTime<Utc>,
    pub approved_by: Option<String>,
    pub rollback_status: Option<RollbackStatus>,
    /// Set when this record IS a rollback; points at the original.
    pub rollback_id: Option<i64>,
    pub monitoring_started_at: Option<DateTime<Utc>>,
    pub monitoring_completed_at: Option<DateTime<Utc>>,
    pub rollback_reason: Option<String>,
}

/// Signed relative change, undefined (0.0 by convention) when `old` is zero.
pub fn change_pct(old: f64, new: f64) -> f64 {
    if old == 0.0 {
        0.0
    } else {
        (new - old) / old
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_monotonic() {
        use RecommendationStatus::*;
        assert!(Pending.can_transition_to(Approved));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Pending.can_transition_to(Expired));
        assert!(Approved.can_transition_to(Executed));
        assert!(Approved.can_transition_to(Failed));

        assert!(!Approved.can_transition_to(Pending));
        assert!(!Executed.can_transition_to(Failed));
        assert!(!Rejected.can_transition_to(Approved));
        assert!(!Expired.can_transition_to(Approved));
    }

    #[test]
    fn risk_tier_ordering() {
        assert!(RiskTier::Low < RiskTier::Medium);
        assert!(RiskTier::Medium < RiskTier::High);
    }

    #[test]
    fn action_lever_mapping() {
        assert_eq!(Action::AdjustBid { new_bid: 1.0 }.lever(), Lever::Bid);
        assert_eq!(
            Action::AdjustBudget { new_budget: 50.0 }.lever(),
            Lever::Budget
        );
        assert_eq!(
            Action::SetStatus {
                status: EntityStatus::Paused
            }
            .lever(),
            Lever::Status
        );
        assert_eq!(
            Action::AddNegative {
                keyword_text: "free stuff".into(),
                match_type: MatchType::Phrase
            }
            .lever(),
            Lever::Status
        );
    }

    #[test]
    fn change_pct_undefined_for_zero_old() {
        assert_eq!(change_pct(0.0, 5.0), 0.0);
        assert!((change_pct(1.0, 1.15) - 0.15).abs() < 1e-9);
        assert!((change_pct(2.0, 1.0) + 0.5).abs() < 1e-9);
    }

    #[test]
    fn windowed_sums_derive_rates() {
        let mut w = WindowSums::default();
        w.accumulate(&MetricRow {
            snapshot_date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            impressions: 1000,
            clicks: 50,
            cost: 25.0,
            conversions: 5.0,
            conversions_value: 100.0,
        });
        assert!((w.ctr() - 0.05).abs() < 1e-9);
        assert!((w.cpc() - 0.5).abs() < 1e-9);
        assert!((w.roas() - 4.0).abs() < 1e-9);
        assert!((w.cpa() - 5.0).abs() < 1e-9);
    }
}
