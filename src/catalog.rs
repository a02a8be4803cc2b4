//! Collaborator Interfaces
//!
//! Traits for the external systems this engine reads from: the promotion and
//! coupon catalogs, the tier/customer price catalog, and the usage store that
//! backs the usage ledger. Implementations are owned elsewhere; the in-memory
//! implementations in [`memory`] exist for tests and as the reference
//! semantics of the atomic conditional increment.

use std::sync::Arc;

use jiff::Timestamp;
#[cfg(test)]
use mockall::automock;
use rusty_money::{Money, iso::Currency};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    coupons::Coupon,
    ids::{CouponId, CustomerId, MerchantId, ProductId, PromotionId, VariantId},
    promotions::{Promotion, PromotionScope},
};

pub mod memory;

/// A collaborator call failed. The whole pricing call fails with it; the
/// engine never returns a partially discounted result as if it were final.
#[derive(Debug, Clone, Error)]
pub enum CatalogError {
    /// The collaborator is unreachable or returned an unusable response.
    /// Retryable by the caller.
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    /// A conditional update lost a race and may be retried.
    #[error("transient contention on conditional update")]
    Contention,
}

/// Source of active promotions, including their nested rules and actions.
#[cfg_attr(test, automock)]
pub trait PromotionCatalog {
    /// Active promotions for a scope and merchant. "Active" here is a
    /// storage-level filter; the candidate resolver re-checks status, dates,
    /// caps and rules itself.
    ///
    /// # Errors
    ///
    /// Returns a [`CatalogError`] when the catalog cannot be read.
    fn find_active_promotions(
        &self,
        scope: PromotionScope,
        merchant: &MerchantId,
    ) -> Result<Vec<Arc<Promotion>>, CatalogError>;
}

/// Source of coupons by code.
#[cfg_attr(test, automock)]
pub trait CouponCatalog {
    /// Look up a coupon by its case-normalized code.
    ///
    /// # Errors
    ///
    /// Returns a [`CatalogError`] when the catalog cannot be read.
    fn find_coupon_by_code(&self, code: &str) -> Result<Option<Coupon>, CatalogError>;
}

/// Source of tier and customer price overrides.
#[cfg_attr(test, automock)]
pub trait PriceCatalog {
    /// Tier unit price applicable to a quantity of a product/variant.
    ///
    /// # Errors
    ///
    /// Returns a [`CatalogError`] when the catalog cannot be read.
    fn find_tier_price<'a>(
        &self,
        product: &ProductId,
        variant: Option<&'a VariantId>,
        quantity: u32,
    ) -> Result<Option<Money<'static, Currency>>, CatalogError>;

    /// Customer-specific unit price for a product/variant, considering the
    /// customer's id and group memberships.
    ///
    /// # Errors
    ///
    /// Returns a [`CatalogError`] when the catalog cannot be read.
    fn find_customer_price<'a>(
        &self,
        customer: &CustomerId,
        groups: &[String],
        product: &ProductId,
        variant: Option<&'a VariantId>,
    ) -> Result<Option<Money<'static, Currency>>, CatalogError>;
}

/// Entity a usage counter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageKey {
    /// A promotion's usage counter.
    Promotion(PromotionId),

    /// A coupon's usage counter.
    Coupon(CouponId),
}

impl std::fmt::Display for UsageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Promotion(id) => write!(f, "promotion:{id}"),
            Self::Coupon(id) => write!(f, "coupon:{id}"),
        }
    }
}

/// Token identifying one pending reservation inside the usage store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReservationToken(pub Uuid);

/// Outcome of a conditional increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementOutcome {
    /// A usage slot was reserved.
    Acquired(ReservationToken),

    /// The global cap is already reached.
    GlobalCapReached,

    /// The customer's cap is already reached.
    CustomerCapReached,
}

/// Store of usage counters. `conditional_increment` must be atomic: two
/// requests racing for the last slot of a capped entity must observe exactly
/// one success.
#[cfg_attr(test, automock)]
pub trait UsageStore {
    /// Reserve a usage slot if `committed + pending < cap` and, when a
    /// per-customer cap applies, the customer's own count is below it.
    /// `now` is the evaluation timestamp; expired pending reservations do not
    /// count against the caps.
    ///
    /// # Errors
    ///
    /// Returns a [`CatalogError`], with [`CatalogError::Contention`] on a
    /// lost conditional-update race, retryable by the ledger.
    fn conditional_increment<'a>(
        &self,
        entity: &UsageKey,
        customer: Option<&'a CustomerId>,
        cap: Option<u32>,
        per_customer_cap: Option<u32>,
        now: Timestamp,
    ) -> Result<IncrementOutcome, CatalogError>;

    /// Release a pending reservation (cart abandoned, order failed).
    ///
    /// # Errors
    ///
    /// Returns a [`CatalogError`] when the store cannot be reached.
    fn decrement(&self, token: ReservationToken) -> Result<(), CatalogError>;

    /// Commit a pending reservation permanently. For coupons, records the
    /// redemption under `redemption_code` so one-time-use checks can see it.
    ///
    /// # Errors
    ///
    /// Returns a [`CatalogError`] when the store cannot be reached.
    fn commit<'a>(
        &self,
        token: ReservationToken,
        redemption_code: Option<&'a str>,
    ) -> Result<(), CatalogError>;

    /// Committed usage count for one customer against an entity.
    ///
    /// # Errors
    ///
    /// Returns a [`CatalogError`] when the store cannot be reached.
    fn usage_for_customer(
        &self,
        entity: &UsageKey,
        customer: &CustomerId,
    ) -> Result<u32, CatalogError>;

    /// Whether the customer has a committed redemption of this coupon code.
    ///
    /// # Errors
    ///
    /// Returns a [`CatalogError`] when the store cannot be reached.
    fn has_prior_redemption(
        &self,
        code: &str,
        customer: &CustomerId,
    ) -> Result<bool, CatalogError>;
}
