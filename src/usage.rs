//! Usage Ledger
//!
//! The one place the engine touches shared mutable state. A reservation is a
//! provisional, atomically acquired claim on a usage slot: acquired only
//! after the discount computation has settled on the candidates that will
//! actually be used, then committed on order placement or released on
//! abandonment. The backing store expires unresolved reservations so a
//! crashed checkout cannot starve other customers.
//!
//! Transient store contention is retried up to a small fixed bound, never
//! indefinitely.

use jiff::Timestamp;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    catalog::{CatalogError, IncrementOutcome, ReservationToken, UsageKey, UsageStore},
    ids::CustomerId,
};

/// Why a reservation could not be acquired.
#[derive(Debug, Error)]
pub enum ReserveError {
    /// The cap (global or per-customer) is exhausted. The pipeline responds
    /// by recomputing without the contended candidate.
    #[error("usage exhausted for {0}")]
    UsageExceeded(UsageKey),

    /// The store failed, or contention persisted past the retry bound.
    #[error(transparent)]
    Store(CatalogError),
}

/// A held usage slot, to be committed or released by the caller.
#[derive(Debug)]
pub struct Reservation {
    token: ReservationToken,
    entity: UsageKey,
    redemption_code: Option<String>,
}

impl Reservation {
    /// Entity the slot belongs to.
    #[must_use]
    pub fn entity(&self) -> UsageKey {
        self.entity
    }
}

/// Caps to enforce when reserving.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageCaps {
    /// Global cap, when configured.
    pub max_usage: Option<u32>,

    /// Per-customer cap, when configured.
    pub max_usage_per_customer: Option<u32>,
}

/// Ledger over a usage store, adding bounded retry and commit/release
/// bookkeeping.
#[derive(Debug)]
pub struct UsageLedger<S> {
    store: S,
    max_attempts: u32,
}

impl<S: UsageStore> UsageLedger<S> {
    /// Wrap a store with the default retry bound of 3 attempts.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self {
            store,
            max_attempts: 3,
        }
    }

    /// Override the retry bound.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// The wrapped store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Atomically reserve a usage slot for an entity.
    ///
    /// `redemption_code` is recorded on commit for one-time-use coupon
    /// checks.
    ///
    /// # Errors
    ///
    /// Returns [`ReserveError::UsageExceeded`] when a cap is already reached,
    /// or [`ReserveError::Store`] when the store fails or stays contended
    /// past the retry bound.
    #[tracing::instrument(skip_all, fields(%entity))]
    pub fn reserve(
        &self,
        entity: UsageKey,
        customer: Option<&CustomerId>,
        caps: UsageCaps,
        redemption_code: Option<&str>,
        now: Timestamp,
    ) -> Result<Reservation, ReserveError> {
        for attempt in 1..=self.max_attempts {
            let outcome = self.store.conditional_increment(
                &entity,
                customer,
                caps.max_usage,
                caps.max_usage_per_customer,
                now,
            );

            match outcome {
                Ok(IncrementOutcome::Acquired(token)) => {
                    debug!(%entity, "usage slot reserved");

                    return Ok(Reservation {
                        token,
                        entity,
                        redemption_code: redemption_code.map(ToOwned::to_owned),
                    });
                }
                Ok(IncrementOutcome::GlobalCapReached | IncrementOutcome::CustomerCapReached) => {
                    debug!(%entity, "usage cap exhausted");

                    return Err(ReserveError::UsageExceeded(entity));
                }
                Err(CatalogError::Contention) if attempt < self.max_attempts => {
                    warn!(%entity, attempt, "contended usage increment, retrying");
                }
                Err(err) => return Err(ReserveError::Store(err)),
            }
        }

        Err(ReserveError::Store(CatalogError::Contention))
    }

    /// Commit a reservation permanently (order placed).
    ///
    /// # Errors
    ///
    /// Returns a [`CatalogError`] when the store fails or the reservation
    /// already expired.
    pub fn commit(&self, reservation: Reservation) -> Result<(), CatalogError> {
        self.store
            .commit(reservation.token, reservation.redemption_code.as_deref())
    }

    /// Release a reservation (cart abandoned, order failed).
    ///
    /// # Errors
    ///
    /// Returns a [`CatalogError`] when the store fails.
    pub fn release(&self, reservation: Reservation) -> Result<(), CatalogError> {
        self.store.decrement(reservation.token)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use testresult::TestResult;
    use uuid::Uuid;

    use crate::{catalog::memory::InMemoryUsageStore, ids::PromotionId};

    use super::*;

    #[test]
    fn reserve_then_release_frees_the_slot() -> TestResult {
        let ledger = UsageLedger::new(InMemoryUsageStore::new());
        let entity = UsageKey::Promotion(PromotionId::random());
        let now = Timestamp::UNIX_EPOCH;

        let caps = UsageCaps {
            max_usage: Some(1),
            max_usage_per_customer: None,
        };

        let held = ledger.reserve(entity, None, caps, None, now)?;

        assert!(matches!(
            ledger.reserve(entity, None, caps, None, now),
            Err(ReserveError::UsageExceeded(_))
        ));

        ledger.release(held)?;

        assert!(ledger.reserve(entity, None, caps, None, now).is_ok());

        Ok(())
    }

    /// Store that reports contention a fixed number of times before
    /// delegating to a real in-memory store.
    #[derive(Debug)]
    struct FlakyStore {
        inner: InMemoryUsageStore,
        failures_left: AtomicU32,
    }

    impl UsageStore for FlakyStore {
        fn conditional_increment(
            &self,
            entity: &UsageKey,
            customer: Option<&CustomerId>,
            cap: Option<u32>,
            per_customer_cap: Option<u32>,
            now: Timestamp,
        ) -> Result<IncrementOutcome, CatalogError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                    left.checked_sub(1)
                })
                .is_ok()
            {
                return Err(CatalogError::Contention);
            }

            self.inner
                .conditional_increment(entity, customer, cap, per_customer_cap, now)
        }

        fn decrement(&self, token: ReservationToken) -> Result<(), CatalogError> {
            self.inner.decrement(token)
        }

        fn commit(
            &self,
            token: ReservationToken,
            redemption_code: Option<&str>,
        ) -> Result<(), CatalogError> {
            self.inner.commit(token, redemption_code)
        }

        fn usage_for_customer(
            &self,
            entity: &UsageKey,
            customer: &CustomerId,
        ) -> Result<u32, CatalogError> {
            self.inner.usage_for_customer(entity, customer)
        }

        fn has_prior_redemption(
            &self,
            code: &str,
            customer: &CustomerId,
        ) -> Result<bool, CatalogError> {
            self.inner.has_prior_redemption(code, customer)
        }
    }

    #[test]
    fn transient_contention_is_retried_within_the_bound() -> TestResult {
        let ledger = UsageLedger::new(FlakyStore {
            inner: InMemoryUsageStore::new(),
            failures_left: AtomicU32::new(2),
        });

        let entity = UsageKey::Promotion(PromotionId::random());

        let held = ledger.reserve(
            entity,
            None,
            UsageCaps::default(),
            None,
            Timestamp::UNIX_EPOCH,
        );

        assert!(held.is_ok());

        Ok(())
    }

    #[test]
    fn persistent_contention_gives_up_after_the_bound() {
        let ledger = UsageLedger::new(FlakyStore {
            inner: InMemoryUsageStore::new(),
            failures_left: AtomicU32::new(u32::MAX),
        })
        .with_max_attempts(3);

        let entity = UsageKey::Promotion(PromotionId::random());

        let held = ledger.reserve(
            entity,
            None,
            UsageCaps::default(),
            None,
            Timestamp::UNIX_EPOCH,
        );

        assert!(matches!(
            held,
            Err(ReserveError::Store(CatalogError::Contention))
        ));
    }

    #[test]
    fn commit_records_the_redemption_code() -> TestResult {
        let ledger = UsageLedger::new(InMemoryUsageStore::new());
        let entity = UsageKey::Coupon(crate::ids::CouponId::random());
        let customer = CustomerId::from_uuid(Uuid::new_v4());

        let held = ledger.reserve(
            entity,
            Some(&customer),
            UsageCaps {
                max_usage: None,
                max_usage_per_customer: Some(1),
            },
            Some("ONCE"),
            Timestamp::UNIX_EPOCH,
        )?;

        ledger.commit(held)?;

        assert!(ledger.store().has_prior_redemption("ONCE", &customer)?);

        Ok(())
    }

    #[test]
    fn reservation_exposes_its_entity() -> TestResult {
        let ledger = UsageLedger::new(InMemoryUsageStore::new());
        let entity = UsageKey::Promotion(PromotionId::random());

        let held = ledger.reserve(
            entity,
            None,
            UsageCaps::default(),
            None,
            Timestamp::UNIX_EPOCH,
        )?;

        assert_eq!(held.entity(), entity);

        ledger.release(held)?;

        Ok(())
    }
}
