//! Pricing Context
//!
//! Everything one evaluation sees: the cart, who is buying, where the order
//! ships, which coupon codes were submitted, and the timestamp the evaluation
//! runs at. A context is built per request, owned by that request, and never
//! shared; the only shared state in the engine lives behind the usage store.

use jiff::Timestamp;
use rustc_hash::FxHashSet;
use rusty_money::{Money, iso::Currency};

use crate::{
    cart::Cart,
    ids::{CustomerId, MerchantId},
};

/// Customer identity and history as known at evaluation time.
#[derive(Debug, Clone)]
pub struct Customer {
    /// Customer id.
    pub id: CustomerId,

    /// Email address, when the customer has one on file.
    pub email: Option<String>,

    /// Customer-group codes the customer belongs to.
    pub groups: Vec<String>,

    /// Number of completed orders prior to this evaluation.
    pub order_count: u32,
}

impl Customer {
    /// Create a customer with no email, no groups and no order history.
    #[must_use]
    pub fn new(id: CustomerId) -> Self {
        Self {
            id,
            email: None,
            groups: Vec::new(),
            order_count: 0,
        }
    }

    /// Attach group memberships.
    #[must_use]
    pub fn with_groups(mut self, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Attach an email address.
    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Set the completed-order count.
    #[must_use]
    pub fn with_order_count(mut self, order_count: u32) -> Self {
        self.order_count = order_count;
        self
    }
}

/// Shipping selection for the order, when one has been made.
#[derive(Debug, Clone)]
pub struct Shipping {
    /// ISO country code of the destination.
    pub destination_country: String,

    /// Shipping method code, once the customer has chosen one.
    pub method: Option<String>,

    /// Quoted shipping cost before any free-shipping promotion.
    pub cost: Money<'static, Currency>,
}

/// Pricing context for a single evaluation.
#[derive(Debug, Clone)]
pub struct PricingContext {
    /// Merchant whose promotion catalog applies.
    pub merchant: MerchantId,

    /// The cart being priced.
    pub cart: Cart,

    /// The customer, absent for anonymous carts.
    pub customer: Option<Customer>,

    /// Shipping selection, absent until the customer reaches that step.
    pub shipping: Option<Shipping>,

    /// Payment method code, absent until selected.
    pub payment_method: Option<String>,

    /// Coupon codes submitted with the cart, in submission order.
    pub coupon_codes: Vec<String>,

    /// Timestamp the evaluation runs at; date windows compare against this.
    pub evaluated_at: Timestamp,
}

impl PricingContext {
    /// Create a context with no customer, shipping, or coupons.
    #[must_use]
    pub fn new(merchant: MerchantId, cart: Cart, evaluated_at: Timestamp) -> Self {
        Self {
            merchant,
            cart,
            customer: None,
            shipping: None,
            payment_method: None,
            coupon_codes: Vec::new(),
            evaluated_at,
        }
    }

    /// Attach a customer.
    #[must_use]
    pub fn with_customer(mut self, customer: Customer) -> Self {
        self.customer = Some(customer);
        self
    }

    /// Attach a shipping selection.
    #[must_use]
    pub fn with_shipping(mut self, shipping: Shipping) -> Self {
        self.shipping = Some(shipping);
        self
    }

    /// Attach a payment method code.
    #[must_use]
    pub fn with_payment_method(mut self, method: impl Into<String>) -> Self {
        self.payment_method = Some(method.into());
        self
    }

    /// Submit coupon codes.
    #[must_use]
    pub fn with_coupon_codes(
        mut self,
        codes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.coupon_codes = codes.into_iter().map(Into::into).collect();
        self
    }

    /// Completed-order count; `0` for anonymous customers or those with no
    /// history, so "first order" conditions hold before any order exists.
    #[must_use]
    pub fn order_count(&self) -> u32 {
        self.customer
            .as_ref()
            .map_or(0, |customer| customer.order_count)
    }

    /// Group codes of the customer; empty for anonymous carts.
    #[must_use]
    pub fn customer_groups(&self) -> &[String] {
        self.customer
            .as_ref()
            .map_or(&[], |customer| customer.groups.as_slice())
    }

    /// Canonical string forms of every product id in the cart.
    #[must_use]
    pub fn product_id_set(&self) -> FxHashSet<String> {
        self.cart
            .iter()
            .map(|line| line.product.to_string())
            .collect()
    }

    /// Canonical string forms of every category id in the cart.
    #[must_use]
    pub fn category_id_set(&self) -> FxHashSet<String> {
        self.cart
            .iter()
            .flat_map(|line| line.categories.iter().map(ToString::to_string))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use rusty_money::iso::GBP;
    use testresult::TestResult;

    use crate::{
        cart::CartLine,
        ids::{CategoryId, ProductId},
    };

    use super::*;

    fn test_context() -> TestResult<PricingContext> {
        let category = CategoryId::random();

        let cart = Cart::with_lines(
            [
                CartLine::new(ProductId::random(), "tea", 1, Money::from_minor(150, GBP))
                    .with_categories([category]),
            ],
            GBP,
        )?;

        Ok(PricingContext::new(
            MerchantId::random(),
            cart,
            Timestamp::UNIX_EPOCH,
        ))
    }

    #[test]
    fn order_count_defaults_to_zero_for_anonymous() -> TestResult {
        let ctx = test_context()?;

        assert_eq!(ctx.order_count(), 0);
        assert!(ctx.customer_groups().is_empty());

        Ok(())
    }

    #[test]
    fn order_count_reads_customer_history() -> TestResult {
        let ctx = test_context()?
            .with_customer(Customer::new(CustomerId::random()).with_order_count(3));

        assert_eq!(ctx.order_count(), 3);

        Ok(())
    }

    #[test]
    fn id_sets_cover_cart_lines() -> TestResult {
        let ctx = test_context()?;

        assert_eq!(ctx.product_id_set().len(), 1);
        assert_eq!(ctx.category_id_set().len(), 1);

        Ok(())
    }

    #[test]
    fn builders_attach_details() -> TestResult {
        let ctx = test_context()?
            .with_shipping(Shipping {
                destination_country: "GB".into(),
                method: Some("standard".into()),
                cost: Money::from_minor(300, GBP),
            })
            .with_payment_method("card")
            .with_coupon_codes(["WELCOME10"]);

        assert_eq!(ctx.coupon_codes, vec!["WELCOME10".to_string()]);
        assert_eq!(ctx.payment_method.as_deref(), Some("card"));
        assert!(ctx.shipping.is_some());

        Ok(())
    }
}
