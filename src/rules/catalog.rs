//! Built-in rule catalog.
//!
//! Registry order matters: it is the tie-break when two rules emit proposals
//! for the same entity-lever at equal confidence, so new rules go at the end.

use crate::models::{EntityKind, RiskTier};

use super::{ChangeSpec, Cmp, Condition, ConfidenceFormula, MetricField, MinDataPoints, Rule};

pub fn default_rules() -> Vec<Rule> {
    vec![
        Rule {
            rule_id: "KW_BID_UP_LOW_CPA".to_string(),
            entity_kind: EntityKind::Keyword,
            change: ChangeSpec::AdjustBidPct { pct: 0.15 },
            conditions: vec![
                Condition::new(MetricField::Conversions30, Cmp::Ge, 5.0),
                Condition::new(MetricField::Cpa30, Cmp::Le, 20.0),
                Condition::new(MetricField::Roas30, Cmp::Ge, 3.0),
            ],
            min_data: MinDataPoints {
                clicks_30d: 30,
                impressions_30d: 500,
            },
            risk_tier: RiskTier::Low,
            cooldown_days: Some(7),
            max_change_pct: 0.20,
            confidence: ConfidenceFormula::DataVolume {
                base: 0.55,
                target_clicks: 150.0,
            },
            regression_override: None,
            enabled: true,
            reasoning: "Keyword converts cheaply (30d CPA under target with healthy ROAS); \
                        raising the bid buys more volume at acceptable cost"
                .to_string(),
        },
        Rule {
            rule_id: "KW_BID_DOWN_HIGH_CPA".to_string(),
            entity_kind: EntityKind::Keyword,
            change: ChangeSpec::AdjustBidPct { pct: -0.15 },
            conditions: vec![
                Condition::new(MetricField::Cost30, Cmp::Ge, 50.0),
                Condition::new(MetricField::Cpa30, Cmp::Ge, 40.0),
            ],
            min_data: MinDataPoints {
                clicks_30d: 30,
                impressions_30d: 500,
            },
            risk_tier: RiskTier::Medium,
            cooldown_days: Some(7),
            max_change_pct: 0.25,
            confidence: ConfidenceFormula::DataVolume {
                base: 0.50,
                target_clicks: 150.0,
            },
            regression_override: None,
            enabled: true,
            reasoning: "Keyword spends meaningfully but converts expensively (30d CPA above \
                        ceiling); lowering the bid cuts waste while keeping presence"
                .to_string(),
        },
        Rule {
            rule_id: "KW_PAUSE_NO_CONV".to_string(),
            entity_kind: EntityKind::Keyword,
            change: ChangeSpec::Pause,
            conditions: vec![
                Condition::new(MetricField::Cost30, Cmp::Ge, 100.0),
                Condition::new(MetricField::Conversions30, Cmp::Le, 0.0),
            ],
            min_data: MinDataPoints {
                clicks_30d: 50,
                impressions_30d: 1_000,
            },
            risk_tier: RiskTier::High,
            cooldown_days: Some(14),
            max_change_pct: 1.0,
            confidence: ConfidenceFormula::DataVolume {
                base: 0.60,
                target_clicks: 200.0,
            },
            regression_override: None,
            enabled: true,
            reasoning: "Keyword burned significant spend over 30 days without a single \
                        conversion; pausing stops the bleed"
                .to_string(),
        },
        Rule {
            rule_id: "KW_NEGATIVE_WASTED_SPEND".to_string(),
            entity_kind: EntityKind::Keyword,
            change: ChangeSpec::AddNegativeKeyword,
            conditions: vec![
                Condition::new(MetricField::Cost30, Cmp::Ge, 75.0),
                Condition::new(MetricField::Conversions30, Cmp::Le, 0.0),
                Condition::new(MetricField::Ctr30, Cmp::Lt, 0.02),
            ],
            min_data: MinDataPoints {
                clicks_30d: 40,
                impressions_30d: 2_000,
            },
            risk_tier: RiskTier::High,
            cooldown_days: Some(30),
            max_change_pct: 1.0,
            confidence: ConfidenceFormula::DataVolume {
                base: 0.60,
                target_clicks: 200.0,
            },
            regression_override: None,
            enabled: true,
            reasoning: "Query attracts clicks but never converts and engagement is weak; \
                        adding it as a negative blocks further waste"
                .to_string(),
        },
        Rule {
            rule_id: "CAMPAIGN_BUDGET_UP_HIGH_ROAS".to_string(),
            entity_kind: EntityKind::Campaign,
            change: ChangeSpec::AdjustBudgetPct { pct: 0.20 },
            conditions: vec![
                Condition::new(MetricField::Roas30, Cmp::Ge, 4.0),
                Condition::new(MetricField::Conversions30, Cmp::Ge, 10.0),
                Condition::new(MetricField::Cost7, Cmp::Gt, 0.0),
            ],
            min_data: MinDataPoints {
                clicks_30d: 100,
                impressions_30d: 2_000,
            },
            risk_tier: RiskTier::High,
            cooldown_days: Some(7),
            max_change_pct: 0.20,
            confidence: ConfidenceFormula::DataVolume {
                base: 0.60,
                target_clicks: 500.0,
            },
            regression_override: None,
            enabled: true,
            reasoning: "Campaign returns well above target ROAS with steady conversion volume; \
                        more budget captures demand it is currently leaving on the table"
                .to_string(),
        },
        Rule {
            rule_id: "CAMPAIGN_BUDGET_DOWN_LOW_ROAS".to_string(),
            entity_kind: EntityKind::Campaign,
            change: ChangeSpec::AdjustBudgetPct { pct: -0.20 },
            conditions: vec![
                Condition::new(MetricField::Cost30, Cmp::Ge, 200.0),
                Condition::new(MetricField::Roas30, Cmp::Lt, 1.5),
            ],
            min_data: MinDataPoints {
                clicks_30d: 100,
                impressions_30d: 2_000,
            },
            risk_tier: RiskTier::Medium,
            cooldown_days: Some(7),
            max_change_pct: 0.25,
            confidence: ConfidenceFormula::DataVolume {
                base: 0.55,
                target_clicks: 500.0,
            },
            regression_override: None,
            enabled: true,
            reasoning: "Campaign spends heavily while returning under break-even ROAS; \
                        trimming budget limits the downside while rules upstream fix targeting"
                .to_string(),
        },
        Rule {
            rule_id: "AD_PAUSE_LOW_CTR".to_string(),
            entity_kind: EntityKind::Ad,
            change: ChangeSpec::Pause,
            conditions: vec![
                Condition::new(MetricField::Impressions30, Cmp::Ge, 5_000.0),
                Condition::new(MetricField::Ctr30, Cmp::Lt, 0.01),
            ],
            min_data: MinDataPoints {
                clicks_30d: 0,
                impressions_30d: 5_000,
            },
            risk_tier: RiskTier::Medium,
            cooldown_days: Some(14),
            max_change_pct: 1.0,
            confidence: ConfidenceFormula::DataVolume {
                base: 0.60,
                target_clicks: 100.0,
            },
            regression_override: None,
            enabled: true,
            reasoning: "Ad shows broadly but nobody clicks it; pausing shifts serving to \
                        stronger creatives in the group"
                .to_string(),
        },
        Rule {
            rule_id: "PRODUCT_EXCLUDE_POOR_ROAS".to_string(),
            entity_kind: EntityKind::Product,
            change: ChangeSpec::ExcludeProduct,
            conditions: vec![
                Condition::new(MetricField::Cost30, Cmp::Ge, 50.0),
                Condition::new(MetricField::Roas30, Cmp::Lt, 1.0),
            ],
            min_data: MinDataPoints {
                clicks_30d: 25,
                impressions_30d: 500,
            },
            risk_tier: RiskTier::Medium,
            cooldown_days: Some(30),
            max_change_pct: 1.0,
            confidence: ConfidenceFormula::DataVolume {
                base: 0.55,
                target_clicks: 100.0,
            },
            regression_override: None,
            enabled: true,
            reasoning: "Product sells below cost through the feed; excluding it focuses spend \
                        on items that return"
                .to_string(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_ids_are_unique() {
        let rules = default_rules();
        let mut ids: Vec<_> = rules.iter().map(|r| r.rule_id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), rules.len());
    }

    #[test]
    fn catalog_passes_registry_validation() {
        super::super::RuleRegistry::from_rules(default_rules()).expect("valid catalog");
    }
}
