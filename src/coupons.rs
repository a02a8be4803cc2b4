//! Coupons
//!
//! Coupon lookup and validation. Validation is side-effect-free: it reads the
//! coupon catalog and usage store but never increments a counter; that
//! happens only when the pipeline reserves usage at commit time. Every
//! failure is an explicit [`CouponError`] kind suitable for user-facing
//! messaging; nothing here is thrown across the service boundary.

use std::fmt;

use decimal_percentage::Percentage;
use jiff::Timestamp;
use rusty_money::{Money, iso::Currency};
use thiserror::Error;

use crate::{
    cart::Cart,
    catalog::{CatalogError, CouponCatalog, UsageKey, UsageStore},
    context::PricingContext,
    ids::{CategoryId, CouponId, ProductId, PromotionId},
};

/// Which restriction a coupon failed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CouponRestriction {
    /// No cart line is in the allowed-product list.
    ProductNotAllowed,

    /// Every otherwise-eligible line is in the denied-product list.
    ProductDenied,

    /// No cart line is in an allowed category.
    CategoryNotAllowed,

    /// Every otherwise-eligible line is in a denied category.
    CategoryDenied,

    /// Eligible lines carry fewer units than the coupon requires.
    MinQuantity,

    /// The selected payment method is not permitted.
    PaymentMethod,

    /// The selected shipping method is not permitted.
    ShippingMethod,

    /// The coupon is tracked per customer and the cart is anonymous.
    CustomerRequired,
}

impl fmt::Display for CouponRestriction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ProductNotAllowed => "product not allowed",
            Self::ProductDenied => "product denied",
            Self::CategoryNotAllowed => "category not allowed",
            Self::CategoryDenied => "category denied",
            Self::MinQuantity => "minimum quantity not met",
            Self::PaymentMethod => "payment method not permitted",
            Self::ShippingMethod => "shipping method not permitted",
            Self::CustomerRequired => "customer identity required",
        };

        f.write_str(name)
    }
}

/// Why a coupon could not be validated.
#[derive(Debug, Clone, Error)]
pub enum CouponError {
    /// No coupon exists for the code.
    #[error("coupon not found")]
    NotFound,

    /// The coupon (or its linked promotion) is not active.
    #[error("coupon is not active")]
    Inactive,

    /// The evaluation timestamp falls outside the coupon's date window.
    #[error("coupon is outside its validity window")]
    Expired,

    /// The global usage cap is exhausted.
    #[error("coupon usage limit reached")]
    UsageExceeded,

    /// The customer's usage cap is exhausted (or a one-time-use coupon was
    /// already redeemed).
    #[error("coupon already used by this customer")]
    PerCustomerUsageExceeded,

    /// The cart subtotal is below the coupon's minimum.
    #[error("order does not meet the coupon minimum")]
    MinOrderNotMet,

    /// A restriction on the coupon failed.
    #[error("coupon restriction violated: {0}")]
    RestrictionViolated(CouponRestriction),

    /// A collaborator call failed mid-validation; retryable.
    #[error(transparent)]
    Upstream(#[from] CatalogError),
}

/// What drives a coupon's discount: a linked promotion's actions, or a
/// standalone discount of its own.
#[derive(Debug, Clone)]
pub enum CouponKind {
    /// The coupon unlocks a promotion; its actions, priority and exclusivity
    /// apply.
    Promotion(PromotionId),

    /// Standalone percentage discount.
    Percentage(Percentage),

    /// Standalone fixed-amount discount.
    Amount(Money<'static, Currency>),
}

/// Product/category/method restrictions on a coupon.
#[derive(Debug, Clone, Default)]
pub struct CouponRestrictions {
    /// When non-empty, the coupon only applies to these products.
    pub allowed_products: Vec<ProductId>,

    /// Products the coupon never applies to.
    pub denied_products: Vec<ProductId>,

    /// When non-empty, the coupon only applies to these categories.
    pub allowed_categories: Vec<CategoryId>,

    /// Categories the coupon never applies to.
    pub denied_categories: Vec<CategoryId>,

    /// Minimum unit count across eligible lines.
    pub min_quantity: Option<u32>,

    /// When non-empty, permitted payment method codes.
    pub payment_methods: Vec<String>,

    /// When non-empty, permitted shipping method codes.
    pub shipping_methods: Vec<String>,
}

impl CouponRestrictions {
    fn is_unrestricted_targets(&self) -> bool {
        self.allowed_products.is_empty()
            && self.denied_products.is_empty()
            && self.allowed_categories.is_empty()
            && self.denied_categories.is_empty()
    }
}

/// Coupon
#[derive(Debug, Clone)]
pub struct Coupon {
    /// Coupon id.
    pub id: CouponId,

    /// Case-normalized redemption code.
    pub code: String,

    /// What drives the discount.
    pub kind: CouponKind,

    /// Minimum cart subtotal.
    pub min_order_amount: Option<Money<'static, Currency>>,

    /// Cap on the discount a standalone coupon may produce.
    pub max_discount_amount: Option<Money<'static, Currency>>,

    /// Start of the validity window; open when unset.
    pub starts_at: Option<Timestamp>,

    /// End of the validity window; open when unset.
    pub ends_at: Option<Timestamp>,

    /// Whether the coupon is redeemable at all.
    pub is_active: bool,

    /// One committed redemption per customer, ever.
    pub is_one_time_use: bool,

    /// Global usage cap.
    pub max_usage: Option<u32>,

    /// Usage count as read from the catalog; advisory, the ledger is
    /// authoritative at reservation time.
    pub usage_count: u32,

    /// Per-customer usage cap.
    pub max_usage_per_customer: Option<u32>,

    /// Product/category/method restrictions.
    pub restrictions: CouponRestrictions,
}

impl Coupon {
    /// Create an active, unrestricted, open-ended coupon.
    #[must_use]
    pub fn new(id: CouponId, code: &str, kind: CouponKind) -> Self {
        Self {
            id,
            code: normalize_code(code),
            kind,
            min_order_amount: None,
            max_discount_amount: None,
            starts_at: None,
            ends_at: None,
            is_active: true,
            is_one_time_use: false,
            max_usage: None,
            usage_count: 0,
            max_usage_per_customer: None,
            restrictions: CouponRestrictions::default(),
        }
    }

    /// Set the validity window.
    #[must_use]
    pub fn with_window(mut self, starts_at: Option<Timestamp>, ends_at: Option<Timestamp>) -> Self {
        self.starts_at = starts_at;
        self.ends_at = ends_at;
        self
    }

    /// Set the minimum order amount.
    #[must_use]
    pub fn with_min_order_amount(mut self, amount: Money<'static, Currency>) -> Self {
        self.min_order_amount = Some(amount);
        self
    }

    /// Cap the discount the coupon may produce.
    #[must_use]
    pub fn with_max_discount_amount(mut self, amount: Money<'static, Currency>) -> Self {
        self.max_discount_amount = Some(amount);
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

    /// Mark the coupon one-time-use.
    #[must_use]
    pub fn one_time_use(mut self) -> Self {
        self.is_one_time_use = true;
        self
    }

    /// Deactivate the coupon.
    #[must_use]
    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Replace the restriction set.
    #[must_use]
    pub fn with_restrictions(mut self, restrictions: CouponRestrictions) -> Self {
        self.restrictions = restrictions;
        self
    }

    /// Whether applying the coupon requires a ledger reservation.
    #[must_use]
    pub fn is_capped(&self) -> bool {
        self.max_usage.is_some() || self.max_usage_per_customer.is_some() || self.is_one_time_use
    }
}

/// Canonical form of a redemption code: trimmed, uppercased.
#[must_use]
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Cart line indices a coupon's product/category restrictions leave eligible.
/// With no target restrictions, every line is eligible.
#[must_use]
pub fn eligible_lines(restrictions: &CouponRestrictions, cart: &Cart) -> Vec<usize> {
    if restrictions.is_unrestricted_targets() {
        return (0..cart.len()).collect();
    }

    cart.iter()
        .enumerate()
        .filter(|(_, line)| {
            if !restrictions.allowed_products.is_empty()
                && !restrictions.allowed_products.contains(&line.product)
            {
                return false;
            }

            if restrictions.denied_products.contains(&line.product) {
                return false;
            }

            if !restrictions.allowed_categories.is_empty()
                && !line
                    .categories
                    .iter()
                    .any(|category| restrictions.allowed_categories.contains(category))
            {
                return false;
            }

            if line
                .categories
                .iter()
                .any(|category| restrictions.denied_categories.contains(category))
            {
                return false;
            }

            true
        })
        .map(|(index, _)| index)
        .collect()
}

fn check_restrictions(coupon: &Coupon, ctx: &PricingContext) -> Result<(), CouponError> {
    let restrictions = &coupon.restrictions;
    let violated = |kind| Err(CouponError::RestrictionViolated(kind));

    if !restrictions.is_unrestricted_targets() {
        let eligible = eligible_lines(restrictions, &ctx.cart);

        if eligible.is_empty() {
            // Name the narrowest filter that could have emptied the set.
            let kind = if !restrictions.allowed_products.is_empty() {
                CouponRestriction::ProductNotAllowed
            } else if !restrictions.denied_products.is_empty() {
                CouponRestriction::ProductDenied
            } else if !restrictions.allowed_categories.is_empty() {
                CouponRestriction::CategoryNotAllowed
            } else {
                CouponRestriction::CategoryDenied
            };

            return violated(kind);
        }

        if let Some(min_quantity) = restrictions.min_quantity {
            let quantity: u32 = eligible
                .iter()
                .filter_map(|&index| ctx.cart.line(index).ok())
                .map(|line| line.quantity)
                .sum();

            if quantity < min_quantity {
                return violated(CouponRestriction::MinQuantity);
            }
        }
    } else if let Some(min_quantity) = restrictions.min_quantity {
        if ctx.cart.total_quantity() < min_quantity {
            return violated(CouponRestriction::MinQuantity);
        }
    }

    if !restrictions.payment_methods.is_empty() {
        let allowed = ctx
            .payment_method
            .as_ref()
            .is_some_and(|method| restrictions.payment_methods.contains(method));

        if !allowed {
            return violated(CouponRestriction::PaymentMethod);
        }
    }

    if !restrictions.shipping_methods.is_empty() {
        let allowed = ctx
            .shipping
            .as_ref()
            .and_then(|shipping| shipping.method.as_ref())
            .is_some_and(|method| restrictions.shipping_methods.contains(method));

        if !allowed {
            return violated(CouponRestriction::ShippingMethod);
        }
    }

    Ok(())
}

/// Resolve and validate a coupon code against the context.
///
/// Never increments usage; reservation happens in the pipeline once the final
/// candidate set is known.
///
/// # Errors
///
/// Returns the [`CouponError`] kind describing the first failed check, or
/// [`CouponError::Upstream`] when a collaborator call fails.
pub fn validate<C, U>(
    coupons: &C,
    usage: &U,
    code: &str,
    ctx: &PricingContext,
) -> Result<Coupon, CouponError>
where
    C: CouponCatalog + ?Sized,
    U: UsageStore + ?Sized,
{
    let normalized = normalize_code(code);

    let Some(coupon) = coupons.find_coupon_by_code(&normalized)? else {
        return Err(CouponError::NotFound);
    };

    if !coupon.is_active {
        return Err(CouponError::Inactive);
    }

    let now = ctx.evaluated_at;

    if coupon.starts_at.is_some_and(|starts_at| now < starts_at)
        || coupon.ends_at.is_some_and(|ends_at| now > ends_at)
    {
        return Err(CouponError::Expired);
    }

    if coupon
        .max_usage
        .is_some_and(|max_usage| coupon.usage_count >= max_usage)
    {
        return Err(CouponError::UsageExceeded);
    }

    let customer = ctx.customer.as_ref().map(|customer| customer.id);

    if let Some(cap) = coupon.max_usage_per_customer {
        if let Some(customer) = customer {
            let used = usage.usage_for_customer(&UsageKey::Coupon(coupon.id), &customer)?;

            if used >= cap {
                return Err(CouponError::PerCustomerUsageExceeded);
            }
        }
    }

    if coupon.is_one_time_use {
        let Some(customer) = customer else {
            return Err(CouponError::RestrictionViolated(
                CouponRestriction::CustomerRequired,
            ));
        };

        if usage.has_prior_redemption(&coupon.code, &customer)? {
            return Err(CouponError::PerCustomerUsageExceeded);
        }
    }

    if let Some(min_order) = coupon.min_order_amount {
        if ctx.cart.subtotal().to_minor_units() < min_order.to_minor_units() {
            return Err(CouponError::MinOrderNotMet);
        }
    }

    check_restrictions(&coupon, ctx)?;

    Ok(coupon)
}

#[cfg(test)]
mod tests {
    use rusty_money::iso::GBP;
    use testresult::TestResult;

    use crate::{
        cart::CartLine,
        catalog::memory::{InMemoryCouponCatalog, InMemoryUsageStore},
        context::Customer,
        ids::{CustomerId, MerchantId},
    };

    use super::*;

    fn coupon(code: &str) -> Coupon {
        Coupon::new(
            CouponId::random(),
            code,
            CouponKind::Amount(Money::from_minor(200, GBP)),
        )
    }

    fn context_with_subtotal(minor: i64) -> TestResult<PricingContext> {
        let cart = Cart::with_lines(
            [CartLine::new(
                ProductId::random(),
                "tea",
                1,
                Money::from_minor(minor, GBP),
            )],
            GBP,
        )?;

        Ok(PricingContext::new(
            MerchantId::random(),
            cart,
            Timestamp::UNIX_EPOCH,
        ))
    }

    #[test]
    fn unknown_code_is_not_found() -> TestResult {
        let catalog = InMemoryCouponCatalog::default();
        let store = InMemoryUsageStore::default();
        let ctx = context_with_subtotal(1000)?;

        let result = validate(&catalog, &store, "NOPE", &ctx);

        assert!(matches!(result, Err(CouponError::NotFound)));

        Ok(())
    }

    #[test]
    fn codes_are_case_normalized() -> TestResult {
        let catalog = InMemoryCouponCatalog::with_coupons([coupon("WELCOME10")]);
        let store = InMemoryUsageStore::default();
        let ctx = context_with_subtotal(1000)?;

        let found = validate(&catalog, &store, "  welcome10 ", &ctx);

        assert!(found.is_ok());

        Ok(())
    }

    #[test]
    fn inactive_coupon_is_rejected() -> TestResult {
        let catalog = InMemoryCouponCatalog::with_coupons([coupon("OFF").inactive()]);
        let store = InMemoryUsageStore::default();
        let ctx = context_with_subtotal(1000)?;

        assert!(matches!(
            validate(&catalog, &store, "OFF", &ctx),
            Err(CouponError::Inactive)
        ));

        Ok(())
    }

    #[test]
    fn window_is_enforced_both_ends() -> TestResult {
        let early = "1990-01-01T00:00:00Z".parse::<Timestamp>()?;
        let late = "1990-06-01T00:00:00Z".parse::<Timestamp>()?;

        let catalog = InMemoryCouponCatalog::with_coupons([
            coupon("PAST").with_window(Some(early), Some(late)),
            coupon("FUTURE").with_window(Some("2999-01-01T00:00:00Z".parse()?), None),
        ]);
        let store = InMemoryUsageStore::default();

        let ctx = context_with_subtotal(1000)?;
        let ctx = PricingContext {
            evaluated_at: "2000-01-01T00:00:00Z".parse()?,
            ..ctx
        };

        assert!(matches!(
            validate(&catalog, &store, "PAST", &ctx),
            Err(CouponError::Expired)
        ));
        assert!(matches!(
            validate(&catalog, &store, "FUTURE", &ctx),
            Err(CouponError::Expired)
        ));

        Ok(())
    }

    #[test]
    fn exhausted_usage_is_rejected() -> TestResult {
        let mut exhausted = coupon("GONE").with_max_usage(5);
        exhausted.usage_count = 5;

        let catalog = InMemoryCouponCatalog::with_coupons([exhausted]);
        let store = InMemoryUsageStore::default();
        let ctx = context_with_subtotal(1000)?;

        assert!(matches!(
            validate(&catalog, &store, "GONE", &ctx),
            Err(CouponError::UsageExceeded)
        ));

        Ok(())
    }

    #[test]
    fn min_order_is_enforced() -> TestResult {
        let catalog = InMemoryCouponCatalog::with_coupons([
            coupon("BIG").with_min_order_amount(Money::from_minor(5000, GBP)),
        ]);
        let store = InMemoryUsageStore::default();
        let ctx = context_with_subtotal(1000)?;

        assert!(matches!(
            validate(&catalog, &store, "BIG", &ctx),
            Err(CouponError::MinOrderNotMet)
        ));

        Ok(())
    }

    #[test]
    fn one_time_use_requires_a_customer() -> TestResult {
        let catalog = InMemoryCouponCatalog::with_coupons([coupon("ONCE").one_time_use()]);
        let store = InMemoryUsageStore::default();
        let ctx = context_with_subtotal(1000)?;

        assert!(matches!(
            validate(&catalog, &store, "ONCE", &ctx),
            Err(CouponError::RestrictionViolated(
                CouponRestriction::CustomerRequired
            ))
        ));

        Ok(())
    }

    #[test]
    fn one_time_use_rejects_prior_redeemers() -> TestResult {
        let catalog = InMemoryCouponCatalog::with_coupons([coupon("ONCE").one_time_use()]);
        let store = InMemoryUsageStore::default();
        let customer = CustomerId::random();

        store.record_redemption("ONCE", &customer);

        let ctx = context_with_subtotal(1000)?
            .with_customer(Customer::new(customer));

        assert!(matches!(
            validate(&catalog, &store, "ONCE", &ctx),
            Err(CouponError::PerCustomerUsageExceeded)
        ));

        Ok(())
    }

    #[test]
    fn product_allow_list_requires_a_matching_line() -> TestResult {
        let restricted = coupon("TEAONLY").with_restrictions(CouponRestrictions {
            allowed_products: vec![ProductId::random()],
            ..CouponRestrictions::default()
        });

        let catalog = InMemoryCouponCatalog::with_coupons([restricted]);
        let store = InMemoryUsageStore::default();
        let ctx = context_with_subtotal(1000)?;

        assert!(matches!(
            validate(&catalog, &store, "TEAONLY", &ctx),
            Err(CouponError::RestrictionViolated(
                CouponRestriction::ProductNotAllowed
            ))
        ));

        Ok(())
    }

    #[test]
    fn payment_method_restriction_requires_selection() -> TestResult {
        let restricted = coupon("CARDONLY").with_restrictions(CouponRestrictions {
            payment_methods: vec!["card".into()],
            ..CouponRestrictions::default()
        });

        let catalog = InMemoryCouponCatalog::with_coupons([restricted]);
        let store = InMemoryUsageStore::default();

        let ctx = context_with_subtotal(1000)?;

        assert!(matches!(
            validate(&catalog, &store, "CARDONLY", &ctx),
            Err(CouponError::RestrictionViolated(
                CouponRestriction::PaymentMethod
            ))
        ));

        let ctx = ctx.with_payment_method("card");

        assert!(validate(&catalog, &store, "CARDONLY", &ctx).is_ok());

        Ok(())
    }

    #[test]
    fn eligible_lines_honour_deny_lists() -> TestResult {
        let denied = ProductId::random();

        let cart = Cart::with_lines(
            [
                CartLine::new(denied, "tea", 1, Money::from_minor(100, GBP)),
                CartLine::new(ProductId::random(), "scone", 1, Money::from_minor(100, GBP)),
            ],
            GBP,
        )?;

        let restrictions = CouponRestrictions {
            denied_products: vec![denied],
            ..CouponRestrictions::default()
        };

        assert_eq!(eligible_lines(&restrictions, &cart), vec![1]);

        Ok(())
    }
}
