//! Promotions
//!
//! The data-driven promotion model this engine evaluates: a promotion carries
//! enumerated scope/status, a priority and exclusivity flag, a date window,
//! usage caps, customer-group eligibility, condition rules and discount
//! actions. Promotions are authored elsewhere and read-only here; the engine
//! only ever bumps usage counters through the usage ledger.

use jiff::Timestamp;
use rusty_money::{Money, iso::Currency};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{CategoryId, ProductId, PromotionId};

pub mod candidates;
pub mod conditions;
pub mod rules;

use conditions::{ConditionType, Operator};
use decimal_percentage::Percentage;
use rules::PromotionRule;

/// Misconfigured rule or action data. Fatal for the evaluation and surfaced
/// to administrators rather than silently skipping the promotion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The operator cannot be applied to this condition type.
    #[error("operator {operator} is not supported for condition {condition}")]
    UnsupportedOperator {
        /// Condition the rule evaluates.
        condition: ConditionType,
        /// Operator the rule was configured with.
        operator: Operator,
    },

    /// The configured value has the wrong shape for the condition/operator.
    #[error("value has the wrong shape for condition {condition} with operator {operator}")]
    InvalidValueShape {
        /// Condition the rule evaluates.
        condition: ConditionType,
        /// Operator the rule was configured with.
        operator: Operator,
    },

    /// The action cannot be applied to its configured target.
    #[error("action {action} cannot target {target}")]
    InvalidActionTarget {
        /// Action type name.
        action: &'static str,
        /// Target description.
        target: &'static str,
    },

    /// The action's numeric configuration is unusable.
    #[error("action {action} has an invalid value")]
    InvalidActionValue {
        /// Action type name.
        action: &'static str,
    },
}

/// The entity a promotion targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionScope {
    /// The whole cart.
    Cart,

    /// Specific products.
    Product,

    /// Members of specific categories.
    Category,

    /// All of a merchant's listings.
    Merchant,

    /// The shipping component of the order.
    Shipping,

    /// Everything, across merchants.
    Global,
}

impl PromotionScope {
    /// Every scope, in the order the pipeline queries them.
    pub const ALL: [Self; 6] = [
        Self::Global,
        Self::Merchant,
        Self::Cart,
        Self::Category,
        Self::Product,
        Self::Shipping,
    ];
}

/// Lifecycle status of a promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionStatus {
    /// Being authored; never a candidate.
    Draft,

    /// Live, subject to the date window and caps.
    Active,

    /// Temporarily disabled by an administrator.
    Paused,

    /// Permanently retired.
    Archived,
}

/// What a discount action does.
#[derive(Debug, Clone)]
pub enum ActionKind {
    /// Percentage off the target subtotal.
    PercentageDiscount(Percentage),

    /// Fixed amount off the target subtotal, never below zero.
    FixedAmountDiscount(Money<'static, Currency>),

    /// Replace the target's unit price when lower than the current price.
    FixedPrice(Money<'static, Currency>),

    /// Buy X units, get Y units free; cheapest units are the free ones.
    BuyXGetYFree {
        /// Units that must be bought at full price.
        buy: u32,
        /// Units given free per group.
        get: u32,
    },

    /// Buy X units, get Y units at a percentage discount.
    BuyXGetYDiscount {
        /// Units that must be bought at full price.
        buy: u32,
        /// Units discounted per group.
        get: u32,
        /// Discount applied to the cheaper units.
        percent: Percentage,
    },

    /// Zero the shipping component of the order.
    FreeShipping,

    /// Add a zero-priced instance of a product.
    FreeItem {
        /// Product granted free.
        product: ProductId,
        /// Promotional quantity available.
        quantity: u32,
    },

    /// Grant loyalty points; never monetary.
    AdditionalPoints(u64),
}

impl ActionKind {
    /// Stable name used in config errors and audit output.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PercentageDiscount(_) => "percentage_discount",
            Self::FixedAmountDiscount(_) => "fixed_amount_discount",
            Self::FixedPrice(_) => "fixed_price",
            Self::BuyXGetYFree { .. } => "buy_x_get_y_free",
            Self::BuyXGetYDiscount { .. } => "buy_x_get_y_discount",
            Self::FreeShipping => "free_shipping",
            Self::FreeItem { .. } => "free_item",
            Self::AdditionalPoints(_) => "additional_points",
        }
    }
}

/// Which cart lines an action touches.
#[derive(Debug, Clone)]
pub enum ActionTarget {
    /// The cart as a whole; the discount is a cart-level remainder.
    Cart,

    /// Lines whose product is in the set.
    Products(Vec<ProductId>),

    /// Lines sharing at least one category with the set.
    Categories(Vec<CategoryId>),
}

/// One discount action of a promotion; a promotion's actions apply in
/// `sort_order`.
#[derive(Debug, Clone)]
pub struct PromotionAction {
    /// What the action does.
    pub kind: ActionKind,

    /// Which lines it touches.
    pub target: ActionTarget,

    /// Application order within the promotion.
    pub sort_order: i32,
}

impl PromotionAction {
    /// Create an action with sort order `0`.
    #[must_use]
    pub fn new(kind: ActionKind, target: ActionTarget) -> Self {
        Self {
            kind,
            target,
            sort_order: 0,
        }
    }

    /// Set the application order.
    #[must_use]
    pub fn with_sort_order(mut self, sort_order: i32) -> Self {
        self.sort_order = sort_order;
        self
    }
}

/// Promotion
#[derive(Debug, Clone)]
pub struct Promotion {
    /// Promotion id.
    pub id: PromotionId,

    /// Display name, carried into audit output.
    pub name: String,

    /// What the promotion targets.
    pub scope: PromotionScope,

    /// Lifecycle status.
    pub status: PromotionStatus,

    /// Ranking among candidates; higher wins ties.
    pub priority: i32,

    /// When set, an eligible instance suppresses all other candidates.
    pub is_exclusive: bool,

    /// When set, the promotion never applies on its own; a coupon linked to
    /// it unlocks it.
    pub requires_coupon: bool,

    /// Start of the validity window.
    pub starts_at: Timestamp,

    /// End of the validity window; open-ended when unset. Must be after
    /// `starts_at` when present.
    pub ends_at: Option<Timestamp>,

    /// Global usage cap.
    pub max_usage: Option<u32>,

    /// Usage count as read from the catalog. Advisory during candidate
    /// filtering; the usage ledger is authoritative at reservation time.
    pub usage_count: u32,

    /// Per-customer usage cap.
    pub max_usage_per_customer: Option<u32>,

    /// Minimum cart subtotal for eligibility.
    pub min_order_amount: Option<Money<'static, Currency>>,

    /// Cap on the total discount this promotion may produce per order.
    pub max_discount_amount: Option<Money<'static, Currency>>,

    /// Customer groups the promotion is limited to; empty means everyone.
    pub eligible_groups: Vec<String>,

    /// Customer groups barred from the promotion.
    pub excluded_groups: Vec<String>,

    /// Condition rules; empty means always eligible.
    pub rules: Vec<PromotionRule>,

    /// Discount actions, applied in sort order.
    pub actions: Vec<PromotionAction>,

    /// Creation time; the tie-break after priority (oldest wins).
    pub created_at: Timestamp,
}

impl Promotion {
    /// Create an active, open-ended, uncapped promotion with no rules or
    /// actions.
    #[must_use]
    pub fn new(id: PromotionId, name: impl Into<String>, scope: PromotionScope) -> Self {
        Self {
            id,
            name: name.into(),
            scope,
            status: PromotionStatus::Active,
            priority: 0,
            is_exclusive: false,
            requires_coupon: false,
            starts_at: Timestamp::UNIX_EPOCH,
            ends_at: None,
            max_usage: None,
            usage_count: 0,
            max_usage_per_customer: None,
            min_order_amount: None,
            max_discount_amount: None,
            eligible_groups: Vec::new(),
            excluded_groups: Vec::new(),
            rules: Vec::new(),
            actions: Vec::new(),
            created_at: Timestamp::UNIX_EPOCH,
        }
    }

    /// Set the candidate priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Mark the promotion exclusive.
    #[must_use]
    pub fn exclusive(mut self) -> Self {
        self.is_exclusive = true;
        self
    }

    /// Gate the promotion behind a linked coupon.
    #[must_use]
    pub fn coupon_gated(mut self) -> Self {
        self.requires_coupon = true;
        self
    }

    /// Set the validity window.
    #[must_use]
    pub fn with_window(mut self, starts_at: Timestamp, ends_at: Option<Timestamp>) -> Self {
        self.starts_at = starts_at;
        self.ends_at = ends_at;
        self
    }

    /// Set the global usage cap.
    #[must_use]
    pub fn with_max_usage(mut self, max_usage: u32) -> Self {
        self.max_usage = Some(max_usage);
        self
    }

    /// Set the per-customer usage cap.
    #[must_use]
    pub fn with_max_usage_per_customer(mut self, cap: u32) -> Self {
        self.max_usage_per_customer = Some(cap);
        self
    }

    /// Set the minimum order amount.
    #[must_use]
    pub fn with_min_order_amount(mut self, amount: Money<'static, Currency>) -> Self {
        self.min_order_amount = Some(amount);
        self
    }

    /// Cap the discount the promotion may produce.
    #[must_use]
    pub fn with_max_discount_amount(mut self, amount: Money<'static, Currency>) -> Self {
        self.max_discount_amount = Some(amount);
        self
    }

    /// Limit to customer groups.
    #[must_use]
    pub fn with_eligible_groups(
        mut self,
        groups: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.eligible_groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Bar customer groups.
    #[must_use]
    pub fn with_excluded_groups(
        mut self,
        groups: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.excluded_groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Add a condition rule.
    #[must_use]
    pub fn with_rule(mut self, rule: PromotionRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Add a discount action.
    #[must_use]
    pub fn with_action(mut self, action: PromotionAction) -> Self {
        self.actions.push(action);
        self
    }

    /// Set the creation time used for priority tie-breaks.
    #[must_use]
    pub fn with_created_at(mut self, created_at: Timestamp) -> Self {
        self.created_at = created_at;
        self
    }

    /// Whether either usage cap is configured, and hence whether applying the
    /// promotion requires a ledger reservation.
    #[must_use]
    pub fn is_capped(&self) -> bool {
        self.max_usage.is_some() || self.max_usage_per_customer.is_some()
    }

    /// Actions in application order.
    #[must_use]
    pub fn actions_in_order(&self) -> Vec<&PromotionAction> {
        let mut actions: Vec<&PromotionAction> = self.actions.iter().collect();
        actions.sort_by_key(|action| action.sort_order);
        actions
    }
}
