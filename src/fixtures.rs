//! Fixtures
//!
//! In-code builders for the carts, promotions, coupons and engines the
//! integration suites lean on. Everything is GBP and evaluated at the Unix
//! epoch unless a test overrides it.

use decimal_percentage::Percentage;
use jiff::Timestamp;
use rusty_money::{
    Money,
    iso::{Currency, GBP},
};

use crate::{
    cart::{Cart, CartError, CartLine},
    catalog::memory::{
        InMemoryCouponCatalog, InMemoryPriceCatalog, InMemoryPromotionCatalog, InMemoryUsageStore,
    },
    context::{PricingContext, Shipping},
    coupons::{Coupon, CouponKind},
    ids::{CouponId, MerchantId, ProductId, PromotionId},
    pipeline::PricingEngine,
    promotions::{ActionKind, ActionTarget, Promotion, PromotionAction, PromotionScope},
};

/// Engine wired to the in-memory collaborator implementations.
pub type InMemoryEngine = PricingEngine<
    InMemoryPromotionCatalog,
    InMemoryCouponCatalog,
    InMemoryPriceCatalog,
    InMemoryUsageStore,
>;

/// Wire an engine over in-memory catalogs with no price overrides.
pub fn engine(
    promotions: impl IntoIterator<Item = Promotion>,
    coupons: impl IntoIterator<Item = Coupon>,
) -> InMemoryEngine {
    engine_with_prices(promotions, coupons, InMemoryPriceCatalog::default())
}

/// Wire an engine over in-memory catalogs with an explicit price catalog.
pub fn engine_with_prices(
    promotions: impl IntoIterator<Item = Promotion>,
    coupons: impl IntoIterator<Item = Coupon>,
    prices: InMemoryPriceCatalog,
) -> InMemoryEngine {
    PricingEngine::new(
        InMemoryPromotionCatalog::with_promotions(promotions),
        InMemoryCouponCatalog::with_coupons(coupons),
        prices,
        InMemoryUsageStore::new(),
    )
}

/// GBP money from minor units.
#[must_use]
pub fn gbp(minor: i64) -> Money<'static, Currency> {
    Money::from_minor(minor, GBP)
}

/// A GBP cart from `(name, unit price minor, quantity)` triples.
///
/// # Errors
///
/// Returns a [`CartError`] if the lines do not form a valid cart.
pub fn cart_of(lines: &[(&str, i64, u32)]) -> Result<Cart, CartError> {
    let lines: Vec<CartLine> = lines
        .iter()
        .map(|&(name, unit, quantity)| {
            CartLine::new(ProductId::random(), name, quantity, gbp(unit))
        })
        .collect();

    Cart::with_lines(lines, GBP)
}

/// A pricing context over [`cart_of`] lines, evaluated at the Unix epoch.
///
/// # Errors
///
/// Returns a [`CartError`] if the lines do not form a valid cart.
pub fn context_for(lines: &[(&str, i64, u32)]) -> Result<PricingContext, CartError> {
    Ok(PricingContext::new(
        MerchantId::random(),
        cart_of(lines)?,
        Timestamp::UNIX_EPOCH,
    ))
}

/// A shipping selection with a GBP cost and a standard method.
#[must_use]
pub fn shipping(minor: i64) -> Shipping {
    Shipping {
        destination_country: "GB".into(),
        method: Some("standard".into()),
        cost: gbp(minor),
    }
}

/// Cart-scope percentage promotion.
#[must_use]
pub fn percent_off_cart(name: &str, fraction: f64) -> Promotion {
    Promotion::new(PromotionId::random(), name, PromotionScope::Cart).with_action(
        PromotionAction::new(
            ActionKind::PercentageDiscount(Percentage::from(fraction)),
            ActionTarget::Cart,
        ),
    )
}

/// Cart-scope fixed-amount promotion.
#[must_use]
pub fn amount_off_cart(name: &str, minor: i64) -> Promotion {
    Promotion::new(PromotionId::random(), name, PromotionScope::Cart).with_action(
        PromotionAction::new(
            ActionKind::FixedAmountDiscount(gbp(minor)),
            ActionTarget::Cart,
        ),
    )
}

/// Shipping-scope free-shipping promotion.
#[must_use]
pub fn free_shipping(name: &str) -> Promotion {
    Promotion::new(PromotionId::random(), name, PromotionScope::Shipping).with_action(
        PromotionAction::new(ActionKind::FreeShipping, ActionTarget::Cart),
    )
}

/// Cart-scope buy-X-get-Y-free promotion.
#[must_use]
pub fn buy_x_get_y_free(name: &str, buy: u32, get: u32) -> Promotion {
    Promotion::new(PromotionId::random(), name, PromotionScope::Cart).with_action(
        PromotionAction::new(ActionKind::BuyXGetYFree { buy, get }, ActionTarget::Cart),
    )
}

/// Standalone percentage coupon.
#[must_use]
pub fn percent_coupon(code: &str, fraction: f64) -> Coupon {
    Coupon::new(
        CouponId::random(),
        code,
        CouponKind::Percentage(Percentage::from(fraction)),
    )
}

/// Standalone fixed-amount coupon.
#[must_use]
pub fn amount_coupon(code: &str, minor: i64) -> Coupon {
    Coupon::new(CouponId::random(), code, CouponKind::Amount(gbp(minor)))
}
