//! Rule registry.
//!
//! Built once at process start and immutable afterwards. Registry order is
//! stable and contractual: the recommendation engine uses it to break ties.
//! Any invalid rule aborts construction; partial loading is forbidden.

use anyhow::{bail, Result};
use std::collections::HashMap;

use crate::models::EntityKind;

use super::{catalog, ChangeSpec, ConfidenceFormula, Rule};

#[derive(Debug)]
pub struct RuleRegistry {
    rules: Vec<Rule>,
    index_by_id: HashMap<String, usize>,
}

impl RuleRegistry {
    /// The built-in catalog.
    pub fn builtin() -> Self {
        // The shipped catalog always validates; a failure here is a bug.
        Self::from_rules(catalog::default_rules()).expect("built-in rule catalog is valid")
    }

    /// Validate and index a rule set. The first invalid rule fails the whole
    /// load with a message naming the rule and field.
    pub fn from_rules(rules: Vec<Rule>) -> Result<Self> {
        let mut index_by_id = HashMap::with_capacity(rules.len());

        for (idx, rule) in rules.iter().enumerate() {
            validate_rule(rule)?;
            if index_by_id.insert(rule.rule_id.clone(), idx).is_some() {
                bail!("rule `{}`: duplicate rule_id", rule.rule_id);
            }
        }

        Ok(Self { rules, index_by_id })
    }

    /// Enabled rules for a kind, in registry order.
    pub fn enabled_rules_for(&self, kind: EntityKind) -> Vec<&Rule> {
        self.rules
            .iter()
            .filter(|r| r.enabled && r.entity_kind == kind)
            .collect()
    }

    pub fn get(&self, rule_id: &str) -> Option<&Rule> {
        self.index_by_id.get(rule_id).map(|&idx| &self.rules[idx])
    }

    /// Position in registry order, the tie-break key (lower wins).
    pub fn index_of(&self, rule_id: &str) -> Option<usize> {
        self.index_by_id.get(rule_id).copied()
    }

    /// Every loaded rule, in registry order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn validate_rule(rule: &Rule) -> Result<()> {
    let id = &rule.rule_id;
    if id.is_empty() {
        bail!("rule at registry load: empty rule_id");
    }
    if !(0.0..=1.0).contains(&rule.max_change_pct) || rule.max_change_pct == 0.0 {
        bail!("rule `{id}`: max_change_pct must be within (0, 1]");
    }
    for condition in &rule.conditions {
        if !condition.value.is_finite() {
            bail!("rule `{id}`: non-numeric condition threshold");
        }
    }
    match &rule.confidence {
        ConfidenceFormula::Fixed { value } => {
            if !(0.0..=1.0).contains(value) {
                bail!("rule `{id}`: confidence value must be within [0, 1]");
            }
        }
        ConfidenceFormula::DataVolume { base, target_clicks } => {
            if !(0.0..=1.0).contains(base) {
                bail!("rule `{id}`: confidence base must be within [0, 1]");
            }
            if !target_clicks.is_finite() || *target_clicks <= 0.0 {
                bail!("rule `{id}`: confidence target_clicks must be positive");
            }
        }
    }

    // Change specs only make sense on specific kinds.
    let kind_ok = match rule.change {
        ChangeSpec::AdjustBidPct { pct } => {
            if pct == 0.0 || !pct.is_finite() {
                bail!("rule `{id}`: bid adjustment pct must be non-zero and finite");
            }
            matches!(rule.entity_kind, EntityKind::Keyword | EntityKind::AdGroup)
        }
        ChangeSpec::AdjustBudgetPct { pct } => {
            if pct == 0.0 || !pct.is_finite() {
                bail!("rule `{id}`: budget adjustment pct must be non-zero and finite");
            }
            rule.entity_kind == EntityKind::Campaign
        }
        ChangeSpec::Pause => true,
        ChangeSpec::AddNegativeKeyword => rule.entity_kind == EntityKind::Keyword,
        ChangeSpec::ExcludeProduct => rule.entity_kind == EntityKind::Product,
    };
    if !kind_ok {
        bail!(
            "rule `{id}`: change spec does not apply to entity kind {}",
            rule.entity_kind.as_str()
        );
    }
    Ok(())
}
