//! Condition Evaluator
//!
//! Pure evaluation of a single `(condition, operator, value)` triple against a
//! pricing context. Absent context data makes a condition evaluate `false`
//! (with `customer_order_count` defaulting to `0` so "first order" conditions
//! hold for customers with no history). A combination the engine does not
//! support is a [`ConfigError`] surfaced to administrators, never a silent
//! `false`: a misconfigured promotion must be visible, not inert.

use std::fmt;

use jiff::Timestamp;
use rust_decimal::Decimal;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::{context::PricingContext, promotions::ConfigError};

/// Domain quantity a rule examines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    /// Cart subtotal in major units (what administrators type).
    CartSubtotal,

    /// Total unit count across all lines.
    CartQuantity,

    /// Set of product ids in the cart.
    ProductIds,

    /// Set of category ids across cart lines.
    CategoryIds,

    /// Customer-group codes of the customer.
    CustomerGroups,

    /// Completed orders prior to this evaluation; `0` when unknown.
    CustomerOrderCount,

    /// Customer email address; compared case-insensitively.
    CustomerEmail,

    /// ISO country code of the shipping destination.
    ShippingCountry,

    /// The evaluation timestamp.
    OrderDate,
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CartSubtotal => "cart_subtotal",
            Self::CartQuantity => "cart_quantity",
            Self::ProductIds => "product_ids",
            Self::CategoryIds => "category_ids",
            Self::CustomerGroups => "customer_groups",
            Self::CustomerOrderCount => "customer_order_count",
            Self::CustomerEmail => "customer_email",
            Self::ShippingCountry => "shipping_country",
            Self::OrderDate => "order_date",
        };

        f.write_str(name)
    }
}

/// Comparison operator of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// Equal.
    Eq,
    /// Not equal.
    Neq,
    /// Greater than.
    Gt,
    /// Less than.
    Lt,
    /// Greater than or equal.
    Gte,
    /// Less than or equal.
    Lte,
    /// Member of a configured list (for sets: any member present).
    In,
    /// Not a member (for sets: no member present).
    Nin,
    /// String or set containment.
    Contains,
    /// Negated containment.
    NotContains,
    /// String prefix match.
    StartsWith,
    /// String suffix match.
    EndsWith,
    /// Inclusive range membership; expects an ordered two-element value.
    Between,
    /// Negated range membership.
    NotBetween,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Gt => "gt",
            Self::Lt => "lt",
            Self::Gte => "gte",
            Self::Lte => "lte",
            Self::In => "in",
            Self::Nin => "nin",
            Self::Contains => "contains",
            Self::NotContains => "not_contains",
            Self::StartsWith => "starts_with",
            Self::EndsWith => "ends_with",
            Self::Between => "between",
            Self::NotBetween => "not_between",
        };

        f.write_str(name)
    }
}

/// Operator-specific configured value of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionValue {
    /// A single number.
    Number(Decimal),

    /// A single string.
    Text(String),

    /// A list of numbers, for `in`/`nin`.
    Numbers(Vec<Decimal>),

    /// A list of strings, for `in`/`nin` and set comparisons.
    Texts(Vec<String>),

    /// An ordered inclusive numeric range, for `between`/`not_between`.
    NumberRange(Decimal, Decimal),

    /// A single timestamp.
    Date(Timestamp),

    /// An ordered inclusive timestamp range.
    DateRange(Timestamp, Timestamp),
}

/// What the context yields for a condition type.
enum FieldValue {
    Number(Decimal),
    Text(String),
    TextSet(FxHashSet<String>),
    Date(Timestamp),
}

fn field_value(condition: ConditionType, ctx: &PricingContext) -> Option<FieldValue> {
    match condition {
        ConditionType::CartSubtotal => {
            let minor = ctx.cart.subtotal().to_minor_units();

            Some(FieldValue::Number(Decimal::new(
                minor,
                ctx.cart.currency().exponent,
            )))
        }
        ConditionType::CartQuantity => {
            Some(FieldValue::Number(Decimal::from(ctx.cart.total_quantity())))
        }
        ConditionType::CustomerOrderCount => {
            Some(FieldValue::Number(Decimal::from(ctx.order_count())))
        }
        ConditionType::CustomerEmail => ctx
            .customer
            .as_ref()
            .and_then(|customer| customer.email.as_ref())
            .map(|email| FieldValue::Text(email.to_lowercase())),
        ConditionType::ShippingCountry => ctx
            .shipping
            .as_ref()
            .map(|shipping| FieldValue::Text(shipping.destination_country.clone())),
        ConditionType::ProductIds => Some(FieldValue::TextSet(ctx.product_id_set())),
        ConditionType::CategoryIds => Some(FieldValue::TextSet(ctx.category_id_set())),
        ConditionType::CustomerGroups => Some(FieldValue::TextSet(
            ctx.customer_groups().iter().cloned().collect(),
        )),
        ConditionType::OrderDate => Some(FieldValue::Date(ctx.evaluated_at)),
    }
}

/// `customer_email` compares case-insensitively; everything else is
/// case-sensitive.
fn normalize_text(condition: ConditionType, text: &str) -> String {
    if condition == ConditionType::CustomerEmail {
        text.to_lowercase()
    } else {
        text.to_owned()
    }
}

/// Evaluate one condition against the context.
///
/// # Errors
///
/// Returns a [`ConfigError`] when the operator is unsupported for the
/// condition type, or the configured value has the wrong shape (including a
/// misordered range).
pub fn evaluate_condition(
    condition: ConditionType,
    operator: Operator,
    value: &ConditionValue,
    ctx: &PricingContext,
) -> Result<bool, ConfigError> {
    match field_value(condition, ctx) {
        Some(FieldValue::Number(field)) => eval_number(condition, operator, value, Some(field)),
        Some(FieldValue::Date(field)) => eval_date(condition, operator, value, Some(field)),
        Some(FieldValue::Text(field)) => eval_text(condition, operator, value, Some(&field)),
        Some(FieldValue::TextSet(field)) => eval_set(condition, operator, value, &field),
        // Context data absent: still validate the configuration, then fail
        // the condition rather than erroring.
        None => match condition {
            ConditionType::CustomerEmail | ConditionType::ShippingCountry => {
                eval_text(condition, operator, value, None)
            }
            _ => eval_number(condition, operator, value, None),
        },
    }
}

fn eval_number(
    condition: ConditionType,
    operator: Operator,
    value: &ConditionValue,
    field: Option<Decimal>,
) -> Result<bool, ConfigError> {
    let invalid_shape = || ConfigError::InvalidValueShape {
        condition,
        operator,
    };

    match operator {
        Operator::Eq | Operator::Neq | Operator::Gt | Operator::Lt | Operator::Gte
        | Operator::Lte => {
            let ConditionValue::Number(expected) = value else {
                return Err(invalid_shape());
            };

            let Some(field) = field else {
                return Ok(false);
            };

            Ok(match operator {
                Operator::Eq => field == *expected,
                Operator::Neq => field != *expected,
                Operator::Gt => field > *expected,
                Operator::Lt => field < *expected,
                Operator::Gte => field >= *expected,
                _ => field <= *expected,
            })
        }
        Operator::In | Operator::Nin => {
            let ConditionValue::Numbers(expected) = value else {
                return Err(invalid_shape());
            };

            let Some(field) = field else {
                return Ok(false);
            };

            let found = expected.contains(&field);

            Ok(if operator == Operator::In { found } else { !found })
        }
        Operator::Between | Operator::NotBetween => {
            let ConditionValue::NumberRange(lo, hi) = value else {
                return Err(invalid_shape());
            };

            if lo > hi {
                return Err(invalid_shape());
            }

            let Some(field) = field else {
                return Ok(false);
            };

            let inside = *lo <= field && field <= *hi;

            Ok(if operator == Operator::Between {
                inside
            } else {
                !inside
            })
        }
        _ => Err(ConfigError::UnsupportedOperator {
            condition,
            operator,
        }),
    }
}

fn eval_date(
    condition: ConditionType,
    operator: Operator,
    value: &ConditionValue,
    field: Option<Timestamp>,
) -> Result<bool, ConfigError> {
    let invalid_shape = || ConfigError::InvalidValueShape {
        condition,
        operator,
    };

    match operator {
        Operator::Eq | Operator::Neq | Operator::Gt | Operator::Lt | Operator::Gte
        | Operator::Lte => {
            let ConditionValue::Date(expected) = value else {
                return Err(invalid_shape());
            };

            let Some(field) = field else {
                return Ok(false);
            };

            Ok(match operator {
                Operator::Eq => field == *expected,
                Operator::Neq => field != *expected,
                Operator::Gt => field > *expected,
                Operator::Lt => field < *expected,
                Operator::Gte => field >= *expected,
                _ => field <= *expected,
            })
        }
        Operator::Between | Operator::NotBetween => {
            let ConditionValue::DateRange(lo, hi) = value else {
                return Err(invalid_shape());
            };

            if lo > hi {
                return Err(invalid_shape());
            }

            let Some(field) = field else {
                return Ok(false);
            };

            let inside = *lo <= field && field <= *hi;

            Ok(if operator == Operator::Between {
                inside
            } else {
                !inside
            })
        }
        _ => Err(ConfigError::UnsupportedOperator {
            condition,
            operator,
        }),
    }
}

fn eval_text(
    condition: ConditionType,
    operator: Operator,
    value: &ConditionValue,
    field: Option<&str>,
) -> Result<bool, ConfigError> {
    let invalid_shape = || ConfigError::InvalidValueShape {
        condition,
        operator,
    };

    match operator {
        Operator::Eq | Operator::Neq | Operator::Contains | Operator::NotContains
        | Operator::StartsWith | Operator::EndsWith => {
            let ConditionValue::Text(expected) = value else {
                return Err(invalid_shape());
            };

            let Some(field) = field else {
                return Ok(false);
            };

            let expected = normalize_text(condition, expected);

            Ok(match operator {
                Operator::Eq => field == expected,
                Operator::Neq => field != expected,
                Operator::Contains => field.contains(&expected),
                Operator::NotContains => !field.contains(&expected),
                Operator::StartsWith => field.starts_with(&expected),
                _ => field.ends_with(&expected),
            })
        }
        Operator::In | Operator::Nin => {
            let ConditionValue::Texts(expected) = value else {
                return Err(invalid_shape());
            };

            let Some(field) = field else {
                return Ok(false);
            };

            let found = expected
                .iter()
                .any(|candidate| normalize_text(condition, candidate) == field);

            Ok(if operator == Operator::In { found } else { !found })
        }
        _ => Err(ConfigError::UnsupportedOperator {
            condition,
            operator,
        }),
    }
}

fn eval_set(
    condition: ConditionType,
    operator: Operator,
    value: &ConditionValue,
    field: &FxHashSet<String>,
) -> Result<bool, ConfigError> {
    let invalid_shape = || ConfigError::InvalidValueShape {
        condition,
        operator,
    };

    match operator {
        Operator::In | Operator::Nin => {
            let ConditionValue::Texts(expected) = value else {
                return Err(invalid_shape());
            };

            let found = expected.iter().any(|candidate| field.contains(candidate));

            Ok(if operator == Operator::In { found } else { !found })
        }
        Operator::Contains | Operator::NotContains => {
            let ConditionValue::Text(expected) = value else {
                return Err(invalid_shape());
            };

            let found = field.contains(expected);

            Ok(if operator == Operator::Contains {
                found
            } else {
                !found
            })
        }
        _ => Err(ConfigError::UnsupportedOperator {
            condition,
            operator,
        }),
    }
}
