//! Price Overrides
//!
//! Quantity-tiered prices and customer-specific price-list prices. Both are
//! read from an external price catalog; this module owns the selection rules:
//! which tier breakpoint applies to a quantity, and which of a tier price and
//! a customer price wins for a line.

use rusty_money::{Money, iso::Currency};
use thiserror::Error;

/// Errors in tier table configuration.
#[derive(Debug, Error)]
pub enum TierConfigError {
    /// Breakpoints must be strictly increasing in minimum quantity.
    #[error("tier breakpoints not strictly increasing at position {0}")]
    NonIncreasingBreakpoint(usize),

    /// A tier price used a different currency than the table's first entry.
    #[error("tier at position {0} has currency {1}, but table has currency {2}")]
    CurrencyMismatch(usize, &'static str, &'static str),
}

/// One quantity breakpoint of a tier table.
#[derive(Debug, Clone, Copy)]
pub struct TierPrice {
    /// Minimum quantity for this tier to apply.
    pub quantity_min: u32,

    /// Unit price once the breakpoint is reached.
    pub unit_price: Money<'static, Currency>,
}

/// Validated tier breakpoints for one product/variant.
#[derive(Debug, Clone)]
pub struct TierTable {
    tiers: Vec<TierPrice>,
}

impl TierTable {
    /// Build a table, validating that breakpoints are strictly increasing and
    /// share one currency.
    ///
    /// # Errors
    ///
    /// Returns a [`TierConfigError`] when breakpoints are out of order or mix
    /// currencies.
    pub fn new(tiers: impl Into<Vec<TierPrice>>) -> Result<Self, TierConfigError> {
        let tiers = tiers.into();

        let mut previous: Option<&TierPrice> = None;

        for (i, tier) in tiers.iter().enumerate() {
            if let Some(prev) = previous {
                if tier.quantity_min <= prev.quantity_min {
                    return Err(TierConfigError::NonIncreasingBreakpoint(i));
                }

                let currency = prev.unit_price.currency();
                let tier_currency = tier.unit_price.currency();

                if tier_currency != currency {
                    return Err(TierConfigError::CurrencyMismatch(
                        i,
                        tier_currency.iso_alpha_code,
                        currency.iso_alpha_code,
                    ));
                }
            }

            previous = Some(tier);
        }

        Ok(Self { tiers })
    }

    /// Unit price for a quantity: the greatest breakpoint not exceeding it.
    #[must_use]
    pub fn price_for(&self, quantity: u32) -> Option<Money<'static, Currency>> {
        self.tiers
            .iter()
            .take_while(|tier| tier.quantity_min <= quantity)
            .last()
            .map(|tier| tier.unit_price)
    }
}

/// Where a winning price override came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideSource {
    /// Quantity tier breakpoint.
    Tier,

    /// Customer or customer-group price list.
    Customer,
}

/// A price override applied to a line before any promotion runs.
#[derive(Debug, Clone, Copy)]
pub struct PriceOverride {
    /// Which catalog supplied the winning price.
    pub source: OverrideSource,

    /// The overriding unit price.
    pub unit_price: Money<'static, Currency>,
}

/// Choose the override for a line given the catalog's tier and customer
/// prices. The lower resulting price wins; a tie goes to the customer price
/// (the more specific source). An override that would not lower the price
/// below the catalog base is discarded.
#[must_use]
pub fn select_override(
    base_unit: Money<'static, Currency>,
    tier: Option<Money<'static, Currency>>,
    customer: Option<Money<'static, Currency>>,
) -> Option<PriceOverride> {
    let tier = tier.map(|unit_price| PriceOverride {
        source: OverrideSource::Tier,
        unit_price,
    });

    let customer = customer.map(|unit_price| PriceOverride {
        source: OverrideSource::Customer,
        unit_price,
    });

    let best = match (tier, customer) {
        (None, None) => return None,
        (Some(t), None) => t,
        (None, Some(c)) => c,
        (Some(t), Some(c)) => {
            // Tie goes to the customer price.
            if t.unit_price.to_minor_units() < c.unit_price.to_minor_units() {
                t
            } else {
                c
            }
        }
    };

    (best.unit_price.to_minor_units() < base_unit.to_minor_units()).then_some(best)
}
