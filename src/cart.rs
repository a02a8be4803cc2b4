//! Cart
//!
//! The cart a pricing evaluation runs against: ordered line items with
//! quantities, unit prices and category memberships. All lines share one
//! currency; a mismatch is rejected at construction so the arithmetic further
//! down the pipeline never has to re-check it.

use rusty_money::{Money, MoneyError, iso::Currency};
use smallvec::SmallVec;
use thiserror::Error;

use crate::ids::{CategoryId, ProductId, VariantId};

/// Errors related to cart construction or totals.
#[derive(Debug, Error)]
pub enum CartError {
    /// A line's currency differs from the cart currency (index, line currency, cart currency).
    #[error("line {0} has currency {1}, but cart has currency {2}")]
    CurrencyMismatch(usize, &'static str, &'static str),

    /// A line was created with a zero quantity.
    #[error("line {0} has zero quantity")]
    ZeroQuantity(usize),

    /// A line was not found in the cart.
    #[error("line {0} not found")]
    LineNotFound(usize),

    /// Wrapped money arithmetic error.
    #[error(transparent)]
    Money(#[from] MoneyError),
}

/// A single cart line: one product/variant at a quantity.
#[derive(Debug, Clone)]
pub struct CartLine {
    /// Product on this line.
    pub product: ProductId,

    /// Variant of the product, when the catalog distinguishes one.
    pub variant: Option<VariantId>,

    /// Display name carried through to the priced result for audit output.
    pub name: String,

    /// Number of units.
    pub quantity: u32,

    /// Catalog base price per unit.
    pub unit_price: Money<'static, Currency>,

    /// Categories the product belongs to.
    pub categories: SmallVec<[CategoryId; 4]>,
}

impl CartLine {
    /// Create a line with no variant and no categories.
    #[must_use]
    pub fn new(
        product: ProductId,
        name: impl Into<String>,
        quantity: u32,
        unit_price: Money<'static, Currency>,
    ) -> Self {
        Self {
            product,
            variant: None,
            name: name.into(),
            quantity,
            unit_price,
            categories: SmallVec::new(),
        }
    }

    /// Attach category memberships.
    #[must_use]
    pub fn with_categories(mut self, categories: impl IntoIterator<Item = CategoryId>) -> Self {
        self.categories = categories.into_iter().collect();
        self
    }

    /// Attach a variant id.
    #[must_use]
    pub fn with_variant(mut self, variant: VariantId) -> Self {
        self.variant = Some(variant);
        self
    }

    /// Base line total (unit price × quantity) in minor units.
    #[must_use]
    pub fn base_total_minor(&self) -> i64 {
        self.unit_price
            .to_minor_units()
            .saturating_mul(i64::from(self.quantity))
    }
}

/// Cart
#[derive(Debug, Clone)]
pub struct Cart {
    lines: Vec<CartLine>,
    currency: &'static Currency,
}

impl Cart {
    /// Create an empty cart in the given currency.
    #[must_use]
    pub fn new(currency: &'static Currency) -> Self {
        Cart {
            lines: Vec::new(),
            currency,
        }
    }

    /// Create a cart from lines, validating currency and quantities.
    ///
    /// # Errors
    ///
    /// Returns [`CartError::CurrencyMismatch`] if a line's currency differs
    /// from the cart currency, or [`CartError::ZeroQuantity`] if a line has
    /// no units.
    pub fn with_lines(
        lines: impl Into<Vec<CartLine>>,
        currency: &'static Currency,
    ) -> Result<Self, CartError> {
        let lines = lines.into();

        lines.iter().enumerate().try_for_each(|(i, line)| {
            let line_currency = line.unit_price.currency();

            if line_currency != currency {
                return Err(CartError::CurrencyMismatch(
                    i,
                    line_currency.iso_alpha_code,
                    currency.iso_alpha_code,
                ));
            }

            if line.quantity == 0 {
                return Err(CartError::ZeroQuantity(i));
            }

            Ok(())
        })?;

        Ok(Cart { lines, currency })
    }

    /// Subtotal over catalog base prices, before any override or discount.
    #[must_use]
    pub fn subtotal(&self) -> Money<'static, Currency> {
        let minor = self
            .lines
            .iter()
            .fold(0_i64, |acc, line| acc.saturating_add(line.base_total_minor()));

        Money::from_minor(minor, self.currency)
    }

    /// Total unit count across all lines.
    #[must_use]
    pub fn total_quantity(&self) -> u32 {
        self.lines
            .iter()
            .fold(0_u32, |acc, line| acc.saturating_add(line.quantity))
    }

    /// Get a line by index.
    ///
    /// # Errors
    ///
    /// Returns [`CartError::LineNotFound`] if the index is out of range.
    pub fn line(&self, index: usize) -> Result<&CartLine, CartError> {
        self.lines.get(index).ok_or(CartError::LineNotFound(index))
    }

    /// Iterate over the lines in the cart.
    pub fn iter(&self) -> impl Iterator<Item = &CartLine> {
        self.lines.iter()
    }

    /// Number of lines in the cart.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Check whether the cart has no lines.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Currency shared by every line.
    #[must_use]
    pub fn currency(&self) -> &'static Currency {
        self.currency
    }
}
