//! In-Memory Collaborators
//!
//! Reference implementations of the collaborator traits, used by tests and
//! examples. The usage store is the normative implementation of the atomic
//! conditional increment: the whole check-and-reserve happens under one lock,
//! so two requests racing for the last slot of a capped entity observe
//! exactly one success. Pending reservations expire after a TTL so abandoned
//! carts cannot starve a cap.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use jiff::{SignedDuration, Timestamp};
use rustc_hash::{FxHashMap, FxHashSet};
use rusty_money::{Money, iso::Currency};
use uuid::Uuid;

use crate::{
    catalog::{
        CatalogError, CouponCatalog, IncrementOutcome, PriceCatalog, PromotionCatalog,
        ReservationToken, UsageKey, UsageStore,
    },
    coupons::{Coupon, normalize_code},
    ids::{CustomerId, MerchantId, ProductId, PromotionId, VariantId},
    prices::TierTable,
    promotions::{Promotion, PromotionScope},
};

/// Promotion catalog over a fixed set of promotions. Single-merchant: the
/// merchant id is accepted and ignored.
#[derive(Debug, Default)]
pub struct InMemoryPromotionCatalog {
    promotions: Vec<Arc<Promotion>>,
}

impl InMemoryPromotionCatalog {
    /// Build a catalog from promotions.
    #[must_use]
    pub fn with_promotions(promotions: impl IntoIterator<Item = Promotion>) -> Self {
        Self {
            promotions: promotions.into_iter().map(Arc::new).collect(),
        }
    }

    /// Look up a promotion by id, regardless of scope.
    #[must_use]
    pub fn find_by_id(&self, id: PromotionId) -> Option<Arc<Promotion>> {
        self.promotions
            .iter()
            .find(|promotion| promotion.id == id)
            .cloned()
    }
}

impl PromotionCatalog for InMemoryPromotionCatalog {
    fn find_active_promotions(
        &self,
        scope: PromotionScope,
        _merchant: &MerchantId,
    ) -> Result<Vec<Arc<Promotion>>, CatalogError> {
        Ok(self
            .promotions
            .iter()
            .filter(|promotion| promotion.scope == scope)
            .cloned()
            .collect())
    }
}

/// Coupon catalog keyed by normalized code.
#[derive(Debug, Default)]
pub struct InMemoryCouponCatalog {
    coupons: FxHashMap<String, Coupon>,
}

impl InMemoryCouponCatalog {
    /// Build a catalog from coupons.
    #[must_use]
    pub fn with_coupons(coupons: impl IntoIterator<Item = Coupon>) -> Self {
        Self {
            coupons: coupons
                .into_iter()
                .map(|coupon| (coupon.code.clone(), coupon))
                .collect(),
        }
    }
}

impl CouponCatalog for InMemoryCouponCatalog {
    fn find_coupon_by_code(&self, code: &str) -> Result<Option<Coupon>, CatalogError> {
        Ok(self.coupons.get(&normalize_code(code)).cloned())
    }
}

type PriceKey = (ProductId, Option<VariantId>);

/// Price catalog over tier tables and customer/group price lists.
#[derive(Debug, Default)]
pub struct InMemoryPriceCatalog {
    tiers: FxHashMap<PriceKey, TierTable>,
    customer_prices: FxHashMap<(CustomerId, ProductId, Option<VariantId>), Money<'static, Currency>>,
    group_prices: FxHashMap<(String, ProductId, Option<VariantId>), Money<'static, Currency>>,
}

impl InMemoryPriceCatalog {
    /// Register a tier table for a product/variant.
    #[must_use]
    pub fn with_tier_table(
        mut self,
        product: ProductId,
        variant: Option<VariantId>,
        table: TierTable,
    ) -> Self {
        self.tiers.insert((product, variant), table);
        self
    }

    /// Register a customer-specific price.
    #[must_use]
    pub fn with_customer_price(
        mut self,
        customer: CustomerId,
        product: ProductId,
        variant: Option<VariantId>,
        price: Money<'static, Currency>,
    ) -> Self {
        self.customer_prices.insert((customer, product, variant), price);
        self
    }

    /// Register a customer-group price.
    #[must_use]
    pub fn with_group_price(
        mut self,
        group: impl Into<String>,
        product: ProductId,
        variant: Option<VariantId>,
        price: Money<'static, Currency>,
    ) -> Self {
        self.group_prices.insert((group.into(), product, variant), price);
        self
    }
}

impl PriceCatalog for InMemoryPriceCatalog {
    fn find_tier_price(
        &self,
        product: &ProductId,
        variant: Option<&VariantId>,
        quantity: u32,
    ) -> Result<Option<Money<'static, Currency>>, CatalogError> {
        Ok(self
            .tiers
            .get(&(*product, variant.copied()))
            .and_then(|table| table.price_for(quantity)))
    }

    fn find_customer_price(
        &self,
        customer: &CustomerId,
        groups: &[String],
        product: &ProductId,
        variant: Option<&VariantId>,
    ) -> Result<Option<Money<'static, Currency>>, CatalogError> {
        if let Some(price) = self
            .customer_prices
            .get(&(*customer, *product, variant.copied()))
        {
            return Ok(Some(*price));
        }

        // No customer-specific entry: the lowest matching group price wins.
        Ok(groups
            .iter()
            .filter_map(|group| {
                self.group_prices
                    .get(&(group.clone(), *product, variant.copied()))
            })
            .min_by_key(|price| price.to_minor_units())
            .copied())
    }
}

#[derive(Debug, Default)]
struct Counter {
    committed: u32,
    per_customer: FxHashMap<CustomerId, u32>,
}

#[derive(Debug)]
struct Pending {
    entity: UsageKey,
    customer: Option<CustomerId>,
    expires_at: Timestamp,
}

#[derive(Debug, Default)]
struct StoreState {
    counters: FxHashMap<UsageKey, Counter>,
    pending: FxHashMap<ReservationToken, Pending>,
    redemptions: FxHashMap<String, FxHashSet<CustomerId>>,
}

/// Usage store with one lock around every conditional update.
#[derive(Debug)]
pub struct InMemoryUsageStore {
    state: Mutex<StoreState>,
    reservation_ttl: SignedDuration,
}

impl Default for InMemoryUsageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryUsageStore {
    /// Default reservation TTL: 15 minutes.
    pub const DEFAULT_TTL: SignedDuration = SignedDuration::from_secs(15 * 60);

    /// Create a store with the default reservation TTL.
    #[must_use]
    pub fn new() -> Self {
        Self::with_reservation_ttl(Self::DEFAULT_TTL)
    }

    /// Create a store with an explicit reservation TTL.
    #[must_use]
    pub fn with_reservation_ttl(reservation_ttl: SignedDuration) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            reservation_ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a committed redemption, as an earlier successful order would.
    pub fn record_redemption(&self, code: &str, customer: &CustomerId) {
        self.lock()
            .redemptions
            .entry(normalize_code(code))
            .or_default()
            .insert(*customer);
    }

    /// Committed usage count of an entity.
    #[must_use]
    pub fn committed_usage(&self, entity: &UsageKey) -> u32 {
        self.lock()
            .counters
            .get(entity)
            .map_or(0, |counter| counter.committed)
    }
}

fn sweep_expired(state: &mut StoreState, now: Timestamp) {
    state.pending.retain(|_, pending| pending.expires_at > now);
}

impl UsageStore for InMemoryUsageStore {
    fn conditional_increment(
        &self,
        entity: &UsageKey,
        customer: Option<&CustomerId>,
        cap: Option<u32>,
        per_customer_cap: Option<u32>,
        now: Timestamp,
    ) -> Result<IncrementOutcome, CatalogError> {
        let mut state = self.lock();

        sweep_expired(&mut state, now);

        let pending_total = state
            .pending
            .values()
            .filter(|pending| pending.entity == *entity)
            .count();

        let counter = state.counters.entry(*entity).or_default();

        if let Some(cap) = cap {
            let effective = u64::from(counter.committed) + pending_total as u64;

            if effective >= u64::from(cap) {
                return Ok(IncrementOutcome::GlobalCapReached);
            }
        }

        if let (Some(per_customer_cap), Some(customer)) = (per_customer_cap, customer) {
            let committed = counter.per_customer.get(customer).copied().unwrap_or(0);

            let pending_for_customer = state
                .pending
                .values()
                .filter(|pending| {
                    pending.entity == *entity && pending.customer.as_ref() == Some(customer)
                })
                .count();

            let effective = u64::from(committed) + pending_for_customer as u64;

            if effective >= u64::from(per_customer_cap) {
                return Ok(IncrementOutcome::CustomerCapReached);
            }
        }

        let token = ReservationToken(Uuid::new_v4());

        let expires_at = now
            .checked_add(self.reservation_ttl)
            .map_err(|err| CatalogError::Unavailable(err.to_string()))?;

        state.pending.insert(
            token,
            Pending {
                entity: *entity,
                customer: customer.copied(),
                expires_at,
            },
        );

        Ok(IncrementOutcome::Acquired(token))
    }

    fn decrement(&self, token: ReservationToken) -> Result<(), CatalogError> {
        self.lock().pending.remove(&token);

        Ok(())
    }

    fn commit(
        &self,
        token: ReservationToken,
        redemption_code: Option<&str>,
    ) -> Result<(), CatalogError> {
        let mut state = self.lock();

        let Some(pending) = state.pending.remove(&token) else {
            return Err(CatalogError::Unavailable(
                "reservation unknown or expired".into(),
            ));
        };

        let counter = state.counters.entry(pending.entity).or_default();
        counter.committed = counter.committed.saturating_add(1);

        if let Some(customer) = pending.customer {
            let used = counter.per_customer.entry(customer).or_default();
            *used = used.saturating_add(1);

            if let Some(code) = redemption_code {
                state
                    .redemptions
                    .entry(normalize_code(code))
                    .or_default()
                    .insert(customer);
            }
        }

        Ok(())
    }

    fn usage_for_customer(
        &self,
        entity: &UsageKey,
        customer: &CustomerId,
    ) -> Result<u32, CatalogError> {
        Ok(self
            .lock()
            .counters
            .get(entity)
            .and_then(|counter| counter.per_customer.get(customer))
            .copied()
            .unwrap_or(0))
    }

    fn has_prior_redemption(
        &self,
        code: &str,
        customer: &CustomerId,
    ) -> Result<bool, CatalogError> {
        Ok(self
            .lock()
            .redemptions
            .get(&normalize_code(code))
            .is_some_and(|customers| customers.contains(customer)))
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;

    fn promo_key() -> UsageKey {
        UsageKey::Promotion(PromotionId::random())
    }

    #[test]
    fn increment_respects_global_cap() -> TestResult {
        let store = InMemoryUsageStore::new();
        let entity = promo_key();
        let now = Timestamp::UNIX_EPOCH;

        let first = store.conditional_increment(&entity, None, Some(1), None, now)?;
        let second = store.conditional_increment(&entity, None, Some(1), None, now)?;

        assert!(matches!(first, IncrementOutcome::Acquired(_)));
        assert_eq!(second, IncrementOutcome::GlobalCapReached);

        Ok(())
    }

    #[test]
    fn released_reservation_frees_the_slot() -> TestResult {
        let store = InMemoryUsageStore::new();
        let entity = promo_key();
        let now = Timestamp::UNIX_EPOCH;

        let IncrementOutcome::Acquired(token) =
            store.conditional_increment(&entity, None, Some(1), None, now)?
        else {
            panic!("expected acquisition");
        };

        store.decrement(token)?;

        let retry = store.conditional_increment(&entity, None, Some(1), None, now)?;

        assert!(matches!(retry, IncrementOutcome::Acquired(_)));

        Ok(())
    }

    #[test]
    fn expired_reservations_do_not_count() -> TestResult {
        let store = InMemoryUsageStore::with_reservation_ttl(SignedDuration::from_secs(60));
        let entity = promo_key();
        let now = Timestamp::UNIX_EPOCH;

        let first = store.conditional_increment(&entity, None, Some(1), None, now)?;
        assert!(matches!(first, IncrementOutcome::Acquired(_)));

        // Within the TTL the slot is held.
        let held = store.conditional_increment(
            &entity,
            None,
            Some(1),
            None,
            now.checked_add(SignedDuration::from_secs(30))?,
        )?;
        assert_eq!(held, IncrementOutcome::GlobalCapReached);

        let later = now.checked_add(SignedDuration::from_secs(120))?;
        let retry = store.conditional_increment(&entity, None, Some(1), None, later)?;

        assert!(matches!(retry, IncrementOutcome::Acquired(_)));

        Ok(())
    }

    #[test]
    fn commit_makes_usage_permanent_and_records_redemption() -> TestResult {
        let store = InMemoryUsageStore::new();
        let customer = CustomerId::random();
        let entity = UsageKey::Coupon(crate::ids::CouponId::random());
        let now = Timestamp::UNIX_EPOCH;

        let IncrementOutcome::Acquired(token) =
            store.conditional_increment(&entity, Some(&customer), Some(1), Some(1), now)?
        else {
            panic!("expected acquisition");
        };

        store.commit(token, Some("ONCE"))?;

        assert_eq!(store.committed_usage(&entity), 1);
        assert_eq!(store.usage_for_customer(&entity, &customer)?, 1);
        assert!(store.has_prior_redemption("once", &customer)?);

        // Committed usage persists past any TTL.
        let later = now.checked_add(SignedDuration::from_secs(86_400))?;
        let retry = store.conditional_increment(&entity, Some(&customer), Some(1), Some(1), later)?;

        assert_eq!(retry, IncrementOutcome::GlobalCapReached);

        Ok(())
    }

    #[test]
    fn per_customer_cap_is_tracked_separately() -> TestResult {
        let store = InMemoryUsageStore::new();
        let entity = promo_key();
        let alice = CustomerId::random();
        let bob = CustomerId::random();
        let now = Timestamp::UNIX_EPOCH;

        let first = store.conditional_increment(&entity, Some(&alice), None, Some(1), now)?;
        let second = store.conditional_increment(&entity, Some(&alice), None, Some(1), now)?;
        let third = store.conditional_increment(&entity, Some(&bob), None, Some(1), now)?;

        assert!(matches!(first, IncrementOutcome::Acquired(_)));
        assert_eq!(second, IncrementOutcome::CustomerCapReached);
        assert!(matches!(third, IncrementOutcome::Acquired(_)));

        Ok(())
    }

    #[test]
    fn committing_an_expired_reservation_fails() -> TestResult {
        let store = InMemoryUsageStore::with_reservation_ttl(SignedDuration::from_secs(60));
        let entity = promo_key();
        let now = Timestamp::UNIX_EPOCH;

        let IncrementOutcome::Acquired(token) =
            store.conditional_increment(&entity, None, Some(1), None, now)?
        else {
            panic!("expected acquisition");
        };

        // A later increment sweeps the expired reservation away.
        let later = now.checked_add(SignedDuration::from_secs(120))?;
        let _ = store.conditional_increment(&entity, None, Some(1), None, later)?;

        assert!(store.commit(token, None).is_err());

        Ok(())
    }
}
