//! Rule Groups
//!
//! Combines a promotion's condition rules. Required rules are ANDed; optional
//! rules sharing a `rule_group` are ORed together as one unit; the groups are
//! then ANDed against each other. A promotion with no rules is always
//! eligible. Evaluation order follows `sort_order`, so short-circuiting is
//! deterministic and never depends on map iteration order.

use std::collections::BTreeMap;

use crate::{
    context::PricingContext,
    promotions::{
        ConfigError, Promotion,
        conditions::{ConditionType, ConditionValue, Operator, evaluate_condition},
    },
};

/// One condition rule of a promotion.
#[derive(Debug, Clone)]
pub struct PromotionRule {
    /// Quantity the rule examines.
    pub condition: ConditionType,

    /// Comparison operator.
    pub operator: Operator,

    /// Operator-specific configured value.
    pub value: ConditionValue,

    /// Required rules are ANDed; optional rules OR within their group.
    pub is_required: bool,

    /// OR-group the rule belongs to when optional.
    pub rule_group: u32,

    /// Evaluation order.
    pub sort_order: i32,
}

impl PromotionRule {
    /// Create a required rule in group `0` with sort order `0`.
    #[must_use]
    pub fn required(condition: ConditionType, operator: Operator, value: ConditionValue) -> Self {
        Self {
            condition,
            operator,
            value,
            is_required: true,
            rule_group: 0,
            sort_order: 0,
        }
    }

    /// Create an optional rule belonging to an OR group.
    #[must_use]
    pub fn any_of(
        rule_group: u32,
        condition: ConditionType,
        operator: Operator,
        value: ConditionValue,
    ) -> Self {
        Self {
            condition,
            operator,
            value,
            is_required: false,
            rule_group,
            sort_order: 0,
        }
    }

    /// Set the evaluation order.
    #[must_use]
    pub fn with_sort_order(mut self, sort_order: i32) -> Self {
        self.sort_order = sort_order;
        self
    }

    fn evaluate(&self, ctx: &PricingContext) -> Result<bool, ConfigError> {
        evaluate_condition(self.condition, self.operator, &self.value, ctx)
    }
}

/// Whether a rule set holds for the context.
///
/// # Errors
///
/// Returns a [`ConfigError`] from the first misconfigured rule encountered.
pub fn rules_satisfied(rules: &[PromotionRule], ctx: &PricingContext) -> Result<bool, ConfigError> {
    if rules.is_empty() {
        return Ok(true);
    }

    let mut ordered: Vec<&PromotionRule> = rules.iter().collect();
    ordered.sort_by_key(|rule| rule.sort_order);

    // Required rules short-circuit on the first failure.
    for rule in ordered.iter().filter(|rule| rule.is_required) {
        if !rule.evaluate(ctx)? {
            return Ok(false);
        }
    }

    // Optional rules: at least one per group must hold. BTreeMap keeps the
    // group evaluation order stable.
    let mut groups: BTreeMap<u32, Vec<&PromotionRule>> = BTreeMap::new();

    for rule in ordered.iter().copied().filter(|rule| !rule.is_required) {
        groups.entry(rule.rule_group).or_default().push(rule);
    }

    for group in groups.values() {
        let mut satisfied = false;

        for rule in group {
            if rule.evaluate(ctx)? {
                satisfied = true;
                break;
            }
        }

        if !satisfied {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Whether a promotion's rule set holds for the context.
///
/// # Errors
///
/// Returns a [`ConfigError`] from the first misconfigured rule encountered.
pub fn is_eligible(promotion: &Promotion, ctx: &PricingContext) -> Result<bool, ConfigError> {
    rules_satisfied(&promotion.rules, ctx)
}
