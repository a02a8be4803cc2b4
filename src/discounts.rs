//! Discount Calculator
//!
//! Applies one promotion action to the running totals of a cart. Line-targeted
//! actions reduce per-line running totals; cart-targeted actions accumulate a
//! cart-level remainder so line prices stay attributable. Every outcome
//! records the lines it touched and the amount it removed, and no action ever
//! drives a line (or the cart) below zero.
//!
//! Percentage amounts round to the currency's minor unit with half-even
//! rounding.

use decimal_percentage::Percentage;
use rust_decimal::{
    Decimal, RoundingStrategy,
    prelude::{FromPrimitive, ToPrimitive},
};
use rusty_money::{MoneyError, iso::Currency};
use smallvec::SmallVec;
use thiserror::Error;

use crate::{
    cart::Cart,
    ids::ProductId,
    promotions::{ActionKind, ActionTarget, ConfigError, PromotionAction},
};

/// Errors specific to discount calculations.
#[derive(Debug, Error)]
pub enum DiscountError {
    /// Percentage calculation could not be safely converted.
    #[error("percentage conversion overflowed or was not finite")]
    PercentConversion,

    /// An action's monetary value uses a different currency than the cart.
    #[error("action currency {0} does not match cart currency {1}")]
    CurrencyMismatch(&'static str, &'static str),

    /// The action configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Wrapped money arithmetic error.
    #[error(transparent)]
    Money(#[from] MoneyError),
}

/// Calculate a percentage of a minor-unit amount, rounded half-even to the
/// minor unit.
///
/// # Errors
///
/// Returns [`DiscountError::PercentConversion`] if the calculation overflows
/// or cannot be represented.
pub fn percent_of_minor(percent: &Percentage, minor: i64) -> Result<i64, DiscountError> {
    let minor = Decimal::from_i64(minor).ok_or(DiscountError::PercentConversion)?;

    ((*percent) * Decimal::ONE) // decimal_percentage does not expose the underlying Decimal
        .checked_mul(minor)
        .ok_or(DiscountError::PercentConversion)?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven)
        .to_i64()
        .ok_or(DiscountError::PercentConversion)
}

/// A zero-priced line granted by a `free_item` action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeItem {
    /// Product granted free.
    pub product: ProductId,

    /// Units granted.
    pub quantity: u32,
}

/// Mutable monetary state of one evaluation pass, in minor units.
#[derive(Debug)]
pub struct RunningTotals {
    line_totals: Vec<i64>,
    line_units: Vec<i64>,
    line_quantities: Vec<u32>,
    cart_discount: i64,
    shipping: i64,
    free_shipping: bool,
    points: u64,
    currency: &'static Currency,
}

impl RunningTotals {
    /// Seed totals from per-line (unit price, quantity) pairs, the prices
    /// each line enters the promotion phase with after any tier/customer
    /// override, plus the quoted shipping cost.
    #[must_use]
    pub fn new(lines: &[(i64, u32)], shipping: i64, currency: &'static Currency) -> Self {
        Self {
            line_totals: lines
                .iter()
                .map(|&(unit, quantity)| unit.saturating_mul(i64::from(quantity)))
                .collect(),
            line_units: lines.iter().map(|&(unit, _)| unit).collect(),
            line_quantities: lines.iter().map(|&(_, quantity)| quantity).collect(),
            cart_discount: 0,
            shipping,
            free_shipping: false,
            points: 0,
            currency,
        }
    }

    /// Running total of one line.
    #[must_use]
    pub fn line_total(&self, index: usize) -> Option<i64> {
        self.line_totals.get(index).copied()
    }

    /// Sum of line running totals minus the cart-level discount, floored at
    /// zero.
    #[must_use]
    pub fn cart_running(&self) -> i64 {
        let lines: i64 = self.line_totals.iter().sum();

        0.max(lines.saturating_sub(self.cart_discount))
    }

    /// Cart-level discount remainder accumulated by cart-targeted actions.
    #[must_use]
    pub fn cart_discount(&self) -> i64 {
        self.cart_discount
    }

    /// Shipping payable: zero once free shipping applies.
    #[must_use]
    pub fn shipping_payable(&self) -> i64 {
        if self.free_shipping { 0 } else { self.shipping }
    }

    /// Whether a free-shipping action has applied.
    #[must_use]
    pub fn free_shipping(&self) -> bool {
        self.free_shipping
    }

    /// Loyalty points granted so far.
    #[must_use]
    pub fn points(&self) -> u64 {
        self.points
    }

    /// Currency all totals are in.
    #[must_use]
    pub fn currency(&self) -> &'static Currency {
        self.currency
    }

    fn reduce_line(&mut self, index: usize, amount: i64) -> i64 {
        let Some(total) = self.line_totals.get_mut(index) else {
            return 0;
        };

        let take = amount.min(*total).max(0);
        *total -= take;
        take
    }
}

/// What one action did.
#[derive(Debug, Default)]
pub struct ActionOutcome {
    /// Minor units removed from the order by this action.
    pub amount_minor: i64,

    /// Line indices the action touched.
    pub affected_lines: SmallVec<[usize; 4]>,

    /// Whether this action zeroed the shipping component.
    pub free_shipping: bool,

    /// Zero-priced lines granted.
    pub free_items: SmallVec<[FreeItem; 1]>,

    /// Loyalty points granted.
    pub points: u64,
}

/// Cart line indices an action target selects, in line order.
#[must_use]
pub fn target_lines(target: &ActionTarget, cart: &Cart) -> SmallVec<[usize; 8]> {
    match target {
        ActionTarget::Cart => (0..cart.len()).collect(),
        ActionTarget::Products(products) => cart
            .iter()
            .enumerate()
            .filter(|(_, line)| products.contains(&line.product))
            .map(|(index, _)| index)
            .collect(),
        ActionTarget::Categories(categories) => cart
            .iter()
            .enumerate()
            .filter(|(_, line)| {
                line.categories
                    .iter()
                    .any(|category| categories.contains(category))
            })
            .map(|(index, _)| index)
            .collect(),
    }
}

fn check_currency(
    value: rusty_money::Money<'static, Currency>,
    running: &RunningTotals,
) -> Result<i64, DiscountError> {
    let currency = value.currency();

    if currency != running.currency {
        return Err(DiscountError::CurrencyMismatch(
            currency.iso_alpha_code,
            running.currency.iso_alpha_code,
        ));
    }

    Ok(value.to_minor_units())
}

fn capped(amount: i64, cap_remaining: Option<i64>) -> i64 {
    match cap_remaining {
        Some(cap) => amount.min(cap).max(0),
        None => amount.max(0),
    }
}

/// Apply one action against the running totals.
///
/// `cap_remaining` is what is left of the owning promotion's
/// `max_discount_amount` budget, in minor units; monetary outcomes never
/// exceed it.
///
/// # Errors
///
/// Returns a [`DiscountError`] for misconfigured actions (wrong target,
/// zero-sized buy-x-get-y group, currency mismatch) or failed percentage
/// conversion.
pub fn apply_action(
    action: &PromotionAction,
    cart: &Cart,
    running: &mut RunningTotals,
    cap_remaining: Option<i64>,
) -> Result<ActionOutcome, DiscountError> {
    let mut outcome = ActionOutcome::default();

    match &action.kind {
        ActionKind::PercentageDiscount(percent) => match &action.target {
            ActionTarget::Cart => {
                let base = running.cart_running();
                let amount = capped(percent_of_minor(percent, base)?.min(base), cap_remaining);

                running.cart_discount = running.cart_discount.saturating_add(amount);
                outcome.amount_minor = amount;
                outcome.affected_lines = (0..cart.len()).collect();
            }
            target => {
                let mut remaining = cap_remaining;

                for index in target_lines(target, cart) {
                    let line_total = running.line_total(index).unwrap_or(0);
                    let amount = capped(percent_of_minor(percent, line_total)?, remaining);
                    let taken = running.reduce_line(index, amount);

                    if taken > 0 {
                        outcome.amount_minor += taken;
                        outcome.affected_lines.push(index);
                        remaining = remaining.map(|cap| cap - taken);
                    }
                }
            }
        },
        ActionKind::FixedAmountDiscount(value) => {
            let value = check_currency(*value, running)?;

            match &action.target {
                ActionTarget::Cart => {
                    let base = running.cart_running();
                    let amount = capped(value.min(base), cap_remaining);

                    running.cart_discount = running.cart_discount.saturating_add(amount);
                    outcome.amount_minor = amount;
                    outcome.affected_lines = (0..cart.len()).collect();
                }
                target => {
                    // The configured amount is a budget consumed across the
                    // target lines in line order.
                    let mut remaining = capped(value, cap_remaining);

                    for index in target_lines(target, cart) {
                        if remaining == 0 {
                            break;
                        }

                        let taken = running.reduce_line(index, remaining);

                        if taken > 0 {
                            outcome.amount_minor += taken;
                            outcome.affected_lines.push(index);
                            remaining -= taken;
                        }
                    }
                }
            }
        }
        ActionKind::FixedPrice(value) => {
            if matches!(action.target, ActionTarget::Cart) {
                return Err(ConfigError::InvalidActionTarget {
                    action: action.kind.name(),
                    target: "cart",
                }
                .into());
            }

            let unit = check_currency(*value, running)?.max(0);
            let mut remaining = cap_remaining;

            for index in target_lines(&action.target, cart) {
                let line_total = running.line_total(index).unwrap_or(0);
                let quantity = running.line_quantities.get(index).copied().unwrap_or(0);
                let target_total = unit.saturating_mul(i64::from(quantity));

                // Never increases a price.
                if target_total >= line_total {
                    continue;
                }

                let amount = capped(line_total - target_total, remaining);
                let taken = running.reduce_line(index, amount);

                if taken > 0 {
                    outcome.amount_minor += taken;
                    outcome.affected_lines.push(index);
                    remaining = remaining.map(|cap| cap - taken);
                }
            }
        }
        ActionKind::BuyXGetYFree { buy, get }
        | ActionKind::BuyXGetYDiscount { buy, get, .. } => {
            let group_size = buy.saturating_add(*get);

            if group_size == 0 || *get == 0 {
                return Err(ConfigError::InvalidActionValue {
                    action: action.kind.name(),
                }
                .into());
            }

            let percent = match &action.kind {
                ActionKind::BuyXGetYDiscount { percent, .. } => Some(percent),
                _ => None,
            };

            // Expand target lines into units at the price each line entered
            // the promotion phase with, cheapest first. Cheapest units
            // receive the discount; a remainder smaller than a full group is
            // unaffected.
            let mut units: Vec<(i64, usize)> = Vec::new();

            for index in target_lines(&action.target, cart) {
                let unit = running.line_units.get(index).copied().unwrap_or(0);
                let quantity = running.line_quantities.get(index).copied().unwrap_or(0);

                units.extend((0..quantity).map(|_| (unit, index)));
            }

            units.sort_by_key(|&(unit, index)| (unit, index));

            let groups = units.len() / group_size as usize;
            let discounted = groups * *get as usize;
            let mut remaining = cap_remaining;

            for &(unit, index) in units.iter().take(discounted) {
                let amount = match percent {
                    Some(percent) => percent_of_minor(percent, unit)?,
                    None => unit,
                };

                let taken = running.reduce_line(index, capped(amount, remaining));

                if taken > 0 {
                    outcome.amount_minor += taken;

                    if !outcome.affected_lines.contains(&index) {
                        outcome.affected_lines.push(index);
                    }

                    remaining = remaining.map(|cap| cap - taken);
                }
            }
        }
        ActionKind::FreeShipping => {
            if !running.free_shipping {
                running.free_shipping = true;
                outcome.free_shipping = true;
                outcome.amount_minor = running.shipping;
            }
        }
        ActionKind::FreeItem { product, quantity } => {
            outcome.free_items.push(FreeItem {
                product: *product,
                quantity: *quantity,
            });
        }
        ActionKind::AdditionalPoints(points) => {
            running.points = running.points.saturating_add(*points);
            outcome.points = *points;
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use rusty_money::{Money, iso::GBP};
    use testresult::TestResult;

    use crate::{cart::CartLine, ids::CategoryId};

    use super::*;

    fn cart_of(prices: &[(i64, u32)]) -> TestResult<Cart> {
        let lines: Vec<CartLine> = prices
            .iter()
            .map(|&(unit, quantity)| {
                CartLine::new(
                    ProductId::random(),
                    "item",
                    quantity,
                    Money::from_minor(unit, GBP),
                )
            })
            .collect();

        Ok(Cart::with_lines(lines, GBP)?)
    }

    fn totals_for(cart: &Cart) -> RunningTotals {
        let lines: Vec<(i64, u32)> = cart
            .iter()
            .map(|line| (line.unit_price.to_minor_units(), line.quantity))
            .collect();

        RunningTotals::new(&lines, 0, GBP)
    }

    #[test]
    fn percent_of_minor_rounds_half_even() -> TestResult {
        let percent = Percentage::from(0.125);

        // 12.5% of 100 = 12.5 → rounds to 12 (even), not 13.
        assert_eq!(percent_of_minor(&percent, 100)?, 12);
        // 12.5% of 300 = 37.5 → rounds to 38 (even).
        assert_eq!(percent_of_minor(&percent, 300)?, 38);

        Ok(())
    }

    #[test]
    fn cart_percentage_respects_max_discount_cap() -> TestResult {
        // £40.00 cart, 10% off capped at £3.00 → £3.00, not £4.00.
        let cart = cart_of(&[(4000, 1)])?;
        let mut running = totals_for(&cart);

        let action = PromotionAction::new(
            ActionKind::PercentageDiscount(Percentage::from(0.10)),
            ActionTarget::Cart,
        );

        let outcome = apply_action(&action, &cart, &mut running, Some(300))?;

        assert_eq!(outcome.amount_minor, 300);
        assert_eq!(running.cart_running(), 3700);

        Ok(())
    }

    #[test]
    fn fixed_amount_never_drives_lines_negative() -> TestResult {
        let cart = cart_of(&[(500, 1), (300, 1)])?;
        let mut running = totals_for(&cart);

        let action = PromotionAction::new(
            ActionKind::FixedAmountDiscount(Money::from_minor(600, GBP)),
            ActionTarget::Products(cart.iter().map(|line| line.product).collect()),
        );

        let outcome = apply_action(&action, &cart, &mut running, None)?;

        // 500 consumed from line 0, remaining 100 from line 1.
        assert_eq!(outcome.amount_minor, 600);
        assert_eq!(running.line_total(0), Some(0));
        assert_eq!(running.line_total(1), Some(200));

        Ok(())
    }

    #[test]
    fn fixed_amount_capped_at_target_subtotal() -> TestResult {
        let cart = cart_of(&[(500, 1)])?;
        let mut running = totals_for(&cart);

        let action = PromotionAction::new(
            ActionKind::FixedAmountDiscount(Money::from_minor(900, GBP)),
            ActionTarget::Cart,
        );

        let outcome = apply_action(&action, &cart, &mut running, None)?;

        assert_eq!(outcome.amount_minor, 500);
        assert_eq!(running.cart_running(), 0);

        Ok(())
    }

    #[test]
    fn fixed_price_only_lowers() -> TestResult {
        let cart = cart_of(&[(500, 2), (200, 1)])?;
        let mut running = totals_for(&cart);

        let products: Vec<ProductId> = cart.iter().map(|line| line.product).collect();

        let action = PromotionAction::new(
            ActionKind::FixedPrice(Money::from_minor(300, GBP)),
            ActionTarget::Products(products),
        );

        let outcome = apply_action(&action, &cart, &mut running, None)?;

        // Line 0: 2 × 500 → 2 × 300, saves 400. Line 1 already cheaper.
        assert_eq!(outcome.amount_minor, 400);
        assert_eq!(running.line_total(0), Some(600));
        assert_eq!(running.line_total(1), Some(200));
        assert_eq!(outcome.affected_lines.as_slice(), &[0]);

        Ok(())
    }

    #[test]
    fn fixed_price_on_cart_is_a_config_error() -> TestResult {
        let cart = cart_of(&[(500, 1)])?;
        let mut running = totals_for(&cart);

        let action = PromotionAction::new(
            ActionKind::FixedPrice(Money::from_minor(300, GBP)),
            ActionTarget::Cart,
        );

        let result = apply_action(&action, &cart, &mut running, None);

        assert!(matches!(result, Err(DiscountError::Config(_))));

        Ok(())
    }

    #[test]
    fn buy_one_get_one_free_discounts_the_cheapest_unit() -> TestResult {
        // Three units priced 10, 8, 6: exactly the cheapest is free.
        let cart = cart_of(&[(1000, 1), (800, 1), (600, 1)])?;
        let mut running = totals_for(&cart);

        let action = PromotionAction::new(
            ActionKind::BuyXGetYFree { buy: 1, get: 1 },
            ActionTarget::Cart,
        );

        let outcome = apply_action(&action, &cart, &mut running, None)?;

        assert_eq!(outcome.amount_minor, 600);
        assert_eq!(running.cart_running(), 1800);
        assert_eq!(outcome.affected_lines.as_slice(), &[2]);

        Ok(())
    }

    #[test]
    fn buy_x_get_y_ignores_partial_groups() -> TestResult {
        // 5 units of one product, buy 2 get 1: one full group of 3, so one
        // free unit; the remainder of 2 pays full price.
        let cart = cart_of(&[(400, 5)])?;
        let mut running = totals_for(&cart);

        let action = PromotionAction::new(
            ActionKind::BuyXGetYFree { buy: 2, get: 1 },
            ActionTarget::Cart,
        );

        let outcome = apply_action(&action, &cart, &mut running, None)?;

        assert_eq!(outcome.amount_minor, 400);
        assert_eq!(running.line_total(0), Some(1600));

        Ok(())
    }

    #[test]
    fn buy_x_get_y_discount_applies_percentage_to_cheapest() -> TestResult {
        let cart = cart_of(&[(1000, 1), (600, 1)])?;
        let mut running = totals_for(&cart);

        let action = PromotionAction::new(
            ActionKind::BuyXGetYDiscount {
                buy: 1,
                get: 1,
                percent: Percentage::from(0.5),
            },
            ActionTarget::Cart,
        );

        let outcome = apply_action(&action, &cart, &mut running, None)?;

        assert_eq!(outcome.amount_minor, 300);
        assert_eq!(running.line_total(1), Some(300));

        Ok(())
    }

    #[test]
    fn zero_sized_group_is_a_config_error() -> TestResult {
        let cart = cart_of(&[(1000, 1)])?;
        let mut running = totals_for(&cart);

        let action = PromotionAction::new(
            ActionKind::BuyXGetYFree { buy: 1, get: 0 },
            ActionTarget::Cart,
        );

        assert!(matches!(
            apply_action(&action, &cart, &mut running, None),
            Err(DiscountError::Config(_))
        ));

        Ok(())
    }

    #[test]
    fn free_shipping_zeroes_shipping_once() -> TestResult {
        let cart = cart_of(&[(1000, 1)])?;
        let mut running = RunningTotals::new(&[(1000, 1)], 350, GBP);

        let action = PromotionAction::new(ActionKind::FreeShipping, ActionTarget::Cart);

        let first = apply_action(&action, &cart, &mut running, None)?;
        let second = apply_action(&action, &cart, &mut running, None)?;

        assert!(first.free_shipping);
        assert_eq!(first.amount_minor, 350);
        assert_eq!(running.shipping_payable(), 0);

        assert!(!second.free_shipping);
        assert_eq!(second.amount_minor, 0);

        Ok(())
    }

    #[test]
    fn free_item_and_points_are_recorded() -> TestResult {
        let cart = cart_of(&[(1000, 1)])?;
        let mut running = totals_for(&cart);

        let product = ProductId::random();

        let free = apply_action(
            &PromotionAction::new(
                ActionKind::FreeItem {
                    product,
                    quantity: 2,
                },
                ActionTarget::Cart,
            ),
            &cart,
            &mut running,
            None,
        )?;

        let points = apply_action(
            &PromotionAction::new(ActionKind::AdditionalPoints(50), ActionTarget::Cart),
            &cart,
            &mut running,
            None,
        )?;

        assert_eq!(
            free.free_items.as_slice(),
            &[FreeItem {
                product,
                quantity: 2
            }]
        );
        assert_eq!(points.points, 50);
        assert_eq!(running.points(), 50);

        Ok(())
    }

    #[test]
    fn category_targeting_selects_member_lines() -> TestResult {
        let category = CategoryId::random();

        let lines = [
            CartLine::new(ProductId::random(), "in", 1, Money::from_minor(500, GBP))
                .with_categories([category]),
            CartLine::new(ProductId::random(), "out", 1, Money::from_minor(500, GBP)),
        ];

        let cart = Cart::with_lines(lines, GBP)?;

        let targets = target_lines(&ActionTarget::Categories(vec![category]), &cart);

        assert_eq!(targets.as_slice(), &[0]);

        Ok(())
    }

    #[test]
    fn mismatched_action_currency_errors() -> TestResult {
        use rusty_money::iso::USD;

        let cart = cart_of(&[(1000, 1)])?;
        let mut running = totals_for(&cart);

        let action = PromotionAction::new(
            ActionKind::FixedAmountDiscount(Money::from_minor(100, USD)),
            ActionTarget::Cart,
        );

        assert!(matches!(
            apply_action(&action, &cart, &mut running, None),
            Err(DiscountError::CurrencyMismatch("USD", "GBP"))
        ));

        Ok(())
    }
}
