//! Price Resolution Pipeline
//!
//! The orchestrator: base price → tier/customer override → promotion and
//! coupon discounts under exclusivity and stacking rules → usage reservation
//! → final priced cart. The order is a fixed, documented policy (overrides,
//! then promotions, then coupons) so the same context and catalog state
//! always produce the same result.
//!
//! Reservations are acquired only after the discount computation has settled
//! on the candidates that will actually be used. When one cannot be acquired
//! the pipeline does not patch up a stale result; it excludes the contended
//! candidate and recomputes from scratch.

use std::sync::Arc;

use jiff::Timestamp;
use rustc_hash::FxHashSet;
use rusty_money::{Money, iso::Currency};
use smallvec::SmallVec;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::{
    cart::CartError,
    catalog::{CatalogError, CouponCatalog, PriceCatalog, PromotionCatalog, UsageKey, UsageStore},
    context::PricingContext,
    coupons::{self, Coupon, CouponError, CouponKind, eligible_lines},
    discounts::{ActionOutcome, DiscountError, FreeItem, RunningTotals, apply_action},
    ids::{CouponId, ProductId, PromotionId, VariantId},
    prices::{PriceOverride, select_override},
    promotions::{
        ActionKind, ActionTarget, ConfigError, Promotion, PromotionAction, PromotionScope,
        candidates::{
            CandidateRef, RejectedCandidate, RejectionReason, ResolveError, rank,
            resolve_candidates,
        },
    },
    usage::{Reservation, ReserveError, UsageCaps, UsageLedger},
};

/// Errors that abort a pricing call. A failed call never yields a partially
/// discounted result.
#[derive(Debug, Error)]
pub enum PricingError {
    /// A promotion or coupon is misconfigured; surfaced to administrators.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A discount calculation failed.
    #[error(transparent)]
    Discount(#[from] DiscountError),

    /// A collaborator call failed mid-pipeline; retryable by the caller.
    #[error(transparent)]
    Upstream(#[from] CatalogError),

    /// The cart itself is unusable.
    #[error(transparent)]
    Cart(#[from] CartError),
}

impl From<ResolveError> for PricingError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Config(err) => Self::Config(err),
            ResolveError::Catalog(err) => Self::Upstream(err),
        }
    }
}

/// When coupon discounts apply relative to promotions. The source systems
/// leave this ambiguous for non-exclusive cart candidates, so it is policy
/// here rather than a hard-coded assumption.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CouponPhase {
    /// Promotions stack first, coupons act on the discounted total.
    #[default]
    AfterPromotions,

    /// Coupons stack first.
    BeforePromotions,
}

/// Tunable pipeline policy.
#[derive(Debug, Clone, Copy)]
pub struct PipelinePolicy {
    /// Ordering of coupon discounts relative to promotions.
    pub coupon_phase: CouponPhase,

    /// Retry bound for contended ledger reservations.
    pub ledger_attempts: u32,
}

impl Default for PipelinePolicy {
    fn default() -> Self {
        Self {
            coupon_phase: CouponPhase::AfterPromotions,
            ledger_attempts: 3,
        }
    }
}

/// One priced cart line of the result.
#[derive(Debug, Clone)]
pub struct PricedLine {
    /// Product on the line.
    pub product: ProductId,

    /// Variant, when the cart line carried one.
    pub variant: Option<VariantId>,

    /// Display name from the cart line.
    pub name: String,

    /// Units on the line.
    pub quantity: u32,

    /// Catalog base unit price.
    pub base_unit_price: Money<'static, Currency>,

    /// Tier/customer override applied before promotions, when one won.
    pub price_override: Option<PriceOverride>,

    /// Line total at base prices.
    pub base_total: Money<'static, Currency>,

    /// Line total after overrides and line-targeted discounts.
    pub final_total: Money<'static, Currency>,
}

/// A promotion or coupon that contributed to the final price.
#[derive(Debug, Clone)]
pub struct AppliedAdjustment {
    /// Which candidate.
    pub candidate: CandidateRef,

    /// Monetary amount the candidate removed from the order.
    pub amount: Money<'static, Currency>,

    /// Line indices the candidate's actions touched.
    pub affected_lines: SmallVec<[usize; 4]>,

    /// Whether the candidate zeroed the shipping component.
    pub free_shipping: bool,

    /// Zero-priced lines the candidate granted.
    pub free_items: SmallVec<[FreeItem; 1]>,

    /// Loyalty points the candidate granted.
    pub points: u64,
}

/// The auditable outcome of one pricing call.
#[derive(Debug)]
pub struct PricedResult {
    /// Per-line breakdown.
    pub lines: Vec<PricedLine>,

    /// Cart subtotal at catalog base prices.
    pub subtotal: Money<'static, Currency>,

    /// Cart-level discount remainder from cart-targeted actions.
    pub cart_discount: Money<'static, Currency>,

    /// Quoted shipping cost before any free-shipping action.
    pub shipping: Money<'static, Currency>,

    /// Whether a free-shipping action zeroed the shipping component.
    pub free_shipping: bool,

    /// Final payable total: discounted goods plus payable shipping.
    pub total: Money<'static, Currency>,

    /// Candidates that contributed, in application order.
    pub applied: Vec<AppliedAdjustment>,

    /// Candidates that were considered and excluded, with reasons.
    pub rejected: Vec<RejectedCandidate>,

    /// Zero-priced lines granted by `free_item` actions.
    pub free_items: Vec<FreeItem>,

    /// Loyalty points granted.
    pub points: u64,

    /// Usage slots held for the applied candidates. Committed on order
    /// placement or released on abandonment via the engine; unresolved
    /// reservations expire in the store.
    pub reservations: Vec<Reservation>,
}

impl PricedResult {
    /// Amount removed from the goods subtotal by overrides and discounts.
    ///
    /// # Errors
    ///
    /// Returns a [`rusty_money::MoneyError`] if the subtraction fails.
    pub fn savings(&self) -> Result<Money<'static, Currency>, rusty_money::MoneyError> {
        let goods = self
            .total
            .to_minor_units()
            .saturating_sub(if self.free_shipping {
                0
            } else {
                self.shipping.to_minor_units()
            });

        self.subtotal
            .sub(Money::from_minor(goods, self.subtotal.currency()))
    }
}

/// A candidate surviving screening, in the form the stacking phase applies.
#[derive(Debug)]
enum Candidate {
    Promotion(Arc<Promotion>),
    Coupon {
        coupon: Coupon,
        linked: Option<Arc<Promotion>>,
    },
}

impl Candidate {
    fn reference(&self) -> CandidateRef {
        match self {
            Self::Promotion(promotion) => CandidateRef::promotion(promotion),
            Self::Coupon { coupon, .. } => CandidateRef::Coupon {
                id: Some(coupon.id),
                code: coupon.code.clone(),
            },
        }
    }

    fn usage_key(&self) -> UsageKey {
        match self {
            Self::Promotion(promotion) => UsageKey::Promotion(promotion.id),
            Self::Coupon { coupon, .. } => UsageKey::Coupon(coupon.id),
        }
    }

    /// Ranking key of an exclusive candidate: priority descending, then age,
    /// then id. Coupons rank by their linked promotion.
    fn exclusive_rank(&self) -> Option<(i32, Timestamp, PromotionId)> {
        match self {
            Self::Promotion(promotion) if promotion.is_exclusive => {
                Some((promotion.priority, promotion.created_at, promotion.id))
            }
            Self::Coupon {
                linked: Some(promotion),
                ..
            } if promotion.is_exclusive => {
                Some((promotion.priority, promotion.created_at, promotion.id))
            }
            _ => None,
        }
    }
}

/// What one full computation pass produced, before reservations.
#[derive(Debug)]
struct Computation {
    lines: Vec<PricedLine>,
    selected: Vec<Candidate>,
    applied: Vec<AppliedAdjustment>,
    rejected: Vec<RejectedCandidate>,
    cart_discount_minor: i64,
    free_shipping: bool,
    free_items: Vec<FreeItem>,
    points: u64,
    goods_total_minor: i64,
}

/// The pricing engine: collaborator handles plus policy.
#[derive(Debug)]
pub struct PricingEngine<P, C, R, U> {
    promotions: P,
    coupons: C,
    prices: R,
    ledger: UsageLedger<U>,
    policy: PipelinePolicy,
}

impl<P, C, R, U> PricingEngine<P, C, R, U>
where
    P: PromotionCatalog,
    C: CouponCatalog,
    R: PriceCatalog,
    U: UsageStore,
{
    /// Wire an engine to its collaborators with the default policy.
    #[must_use]
    pub fn new(promotions: P, coupons: C, prices: R, usage: U) -> Self {
        let policy = PipelinePolicy::default();

        Self {
            promotions,
            coupons,
            prices,
            ledger: UsageLedger::new(usage).with_max_attempts(policy.ledger_attempts),
            policy,
        }
    }

    /// Override the pipeline policy.
    #[must_use]
    pub fn with_policy(mut self, policy: PipelinePolicy) -> Self {
        self.ledger = self.ledger.with_max_attempts(policy.ledger_attempts);
        self.policy = policy;
        self
    }

    /// The usage ledger, for committing or releasing reservations directly.
    pub fn ledger(&self) -> &UsageLedger<U> {
        &self.ledger
    }

    /// Validate a coupon code without pricing the whole cart, for immediate
    /// feedback before checkout. Side-effect-free.
    ///
    /// # Errors
    ///
    /// Returns the [`CouponError`] kind describing the first failed check.
    pub fn validate_coupon(&self, code: &str, ctx: &PricingContext) -> Result<Coupon, CouponError> {
        coupons::validate(&self.coupons, self.ledger.store(), code, ctx)
    }

    /// Price the cart: overrides, promotions, coupons, reservations.
    ///
    /// Idempotent given unchanged catalog state and usage counters. The
    /// returned reservations must be committed via [`Self::commit`] on order
    /// placement or released via [`Self::release`]; unresolved ones expire in
    /// the store.
    ///
    /// # Errors
    ///
    /// Returns a [`PricingError`] on misconfigured catalog data or a failed
    /// collaborator call; never a partially discounted result.
    #[instrument(
        skip_all,
        fields(lines = ctx.cart.len(), coupon_codes = ctx.coupon_codes.len())
    )]
    pub fn price_cart(&self, ctx: &PricingContext) -> Result<PricedResult, PricingError> {
        let mut excluded: FxHashSet<UsageKey> = FxHashSet::default();
        let mut carried_rejections: Vec<RejectedCandidate> = Vec::new();

        // Each pass either reserves every capped candidate it selected or
        // excludes one contended candidate and recomputes. Candidates are
        // finite, so this terminates.
        loop {
            let computation = self.compute(ctx, &excluded)?;

            match self.reserve_selected(&computation, ctx) {
                Ok(reservations) => {
                    info!(
                        applied = computation.applied.len(),
                        rejected = computation.rejected.len() + carried_rejections.len(),
                        "cart priced"
                    );

                    return Ok(assemble(ctx, computation, carried_rejections, reservations));
                }
                Err(ReservationFailure::Contended { key, rejection }) => {
                    warn!(entity = %key, "reservation contended, recomputing without candidate");

                    excluded.insert(key);
                    carried_rejections.push(rejection);
                }
                Err(ReservationFailure::Fatal(err)) => return Err(PricingError::Upstream(err)),
            }
        }
    }

    /// Commit reservations after successful order placement.
    ///
    /// # Errors
    ///
    /// Returns a [`CatalogError`] when the store fails or a reservation
    /// already expired.
    pub fn commit(&self, reservations: Vec<Reservation>) -> Result<(), CatalogError> {
        reservations
            .into_iter()
            .try_for_each(|reservation| self.ledger.commit(reservation))
    }

    /// Release reservations after cart abandonment or order failure.
    ///
    /// # Errors
    ///
    /// Returns a [`CatalogError`] when the store fails.
    pub fn release(&self, reservations: Vec<Reservation>) -> Result<(), CatalogError> {
        reservations
            .into_iter()
            .try_for_each(|reservation| self.ledger.release(reservation))
    }

    /// One full discount computation, with the given candidates excluded.
    fn compute(
        &self,
        ctx: &PricingContext,
        excluded: &FxHashSet<UsageKey>,
    ) -> Result<Computation, PricingError> {
        let (entered, overrides) = self.resolve_overrides(ctx)?;

        let ResolvedPromotions {
            mut open,
            coupon_gated,
            mut rejected,
        } = self.resolve_promotions(ctx, excluded)?;

        let coupon_candidates =
            self.resolve_coupons(ctx, excluded, &mut open, coupon_gated, &mut rejected)?;

        let selected = select_candidates(
            open,
            coupon_candidates,
            self.policy.coupon_phase,
            &mut rejected,
        );

        apply_selected(ctx, &entered, &overrides, selected, rejected)
    }

    /// Per-line effective unit prices after the tier/customer override step.
    fn resolve_overrides(
        &self,
        ctx: &PricingContext,
    ) -> Result<(Vec<(i64, u32)>, Vec<Option<PriceOverride>>), PricingError> {
        let mut entered = Vec::with_capacity(ctx.cart.len());
        let mut overrides = Vec::with_capacity(ctx.cart.len());

        for line in ctx.cart.iter() {
            let tier =
                self.prices
                    .find_tier_price(&line.product, line.variant.as_ref(), line.quantity)?;

            let customer = match &ctx.customer {
                Some(customer) => self.prices.find_customer_price(
                    &customer.id,
                    &customer.groups,
                    &line.product,
                    line.variant.as_ref(),
                )?,
                None => None,
            };

            let chosen = select_override(line.unit_price, tier, customer);

            let unit = chosen.map_or_else(
                || line.unit_price.to_minor_units(),
                |chosen| chosen.unit_price.to_minor_units(),
            );

            entered.push((unit, line.quantity));
            overrides.push(chosen);
        }

        Ok((entered, overrides))
    }

    /// Eligible promotions across every scope, split into openly applicable
    /// and coupon-gated.
    fn resolve_promotions(
        &self,
        ctx: &PricingContext,
        excluded: &FxHashSet<UsageKey>,
    ) -> Result<ResolvedPromotions, PricingError> {
        let mut open = Vec::new();
        let mut coupon_gated = Vec::new();
        let mut rejected = Vec::new();

        for scope in PromotionScope::ALL {
            let set = resolve_candidates(&self.promotions, scope, ctx)?;

            open.extend(set.eligible);
            coupon_gated.extend(set.coupon_gated);
            rejected.extend(set.rejected);
        }

        // Candidates contended in an earlier pass are already rejected with
        // their reservation failure; drop them silently here.
        open.retain(|promotion| !excluded.contains(&UsageKey::Promotion(promotion.id)));

        rank(&mut open);

        Ok(ResolvedPromotions {
            open,
            coupon_gated,
            rejected,
        })
    }

    /// Validate each submitted code and bind linked promotions.
    fn resolve_coupons(
        &self,
        ctx: &PricingContext,
        excluded: &FxHashSet<UsageKey>,
        open: &mut Vec<Arc<Promotion>>,
        coupon_gated: Vec<Arc<Promotion>>,
        rejected: &mut Vec<RejectedCandidate>,
    ) -> Result<Vec<Candidate>, PricingError> {
        let mut candidates = Vec::with_capacity(ctx.coupon_codes.len());
        let mut seen: FxHashSet<CouponId> = FxHashSet::default();

        for code in &ctx.coupon_codes {
            let coupon = match self.validate_coupon(code, ctx) {
                Ok(coupon) => coupon,
                // A collaborator failure aborts the call; a validation
                // failure is a routine, auditable rejection.
                Err(CouponError::Upstream(err)) => return Err(PricingError::Upstream(err)),
                Err(err) => {
                    debug!(%code, reason = %err, "coupon rejected");

                    rejected.push(RejectedCandidate {
                        candidate: CandidateRef::Coupon {
                            id: None,
                            code: coupons::normalize_code(code),
                        },
                        reason: RejectionReason::Coupon(err),
                    });

                    continue;
                }
            };

            if excluded.contains(&UsageKey::Coupon(coupon.id)) {
                continue;
            }

            // The same coupon submitted twice applies once.
            if !seen.insert(coupon.id) {
                continue;
            }

            let linked = match coupon.kind {
                CouponKind::Promotion(promotion_id) => {
                    match find_linked(promotion_id, &coupon_gated, open) {
                        Some(promotion) => Some(promotion),
                        // The linked promotion failed screening (or does not
                        // exist for this merchant): the coupon cannot apply.
                        None => {
                            rejected.push(RejectedCandidate {
                                candidate: CandidateRef::Coupon {
                                    id: Some(coupon.id),
                                    code: coupon.code.clone(),
                                },
                                reason: RejectionReason::Coupon(CouponError::Inactive),
                            });

                            continue;
                        }
                    }
                }
                CouponKind::Percentage(_) | CouponKind::Amount(_) => None,
            };

            candidates.push(Candidate::Coupon { coupon, linked });
        }

        Ok(candidates)
    }

    /// Reserve a usage slot for every capped selected candidate, releasing
    /// everything already held on the first failure.
    fn reserve_selected(
        &self,
        computation: &Computation,
        ctx: &PricingContext,
    ) -> Result<Vec<Reservation>, ReservationFailure> {
        let customer = ctx.customer.as_ref().map(|customer| customer.id);
        let mut held: Vec<Reservation> = Vec::new();

        for candidate in &computation.selected {
            let (caps, code) = match candidate {
                Candidate::Promotion(promotion) => {
                    if !promotion.is_capped() {
                        continue;
                    }

                    (
                        UsageCaps {
                            max_usage: promotion.max_usage,
                            max_usage_per_customer: promotion.max_usage_per_customer,
                        },
                        None,
                    )
                }
                Candidate::Coupon { coupon, .. } => {
                    if !coupon.is_capped() {
                        continue;
                    }

                    (
                        UsageCaps {
                            max_usage: coupon.max_usage,
                            max_usage_per_customer: coupon
                                .max_usage_per_customer
                                .or_else(|| coupon.is_one_time_use.then_some(1)),
                        },
                        Some(coupon.code.as_str()),
                    )
                }
            };

            match self.ledger.reserve(
                candidate.usage_key(),
                customer.as_ref(),
                caps,
                code,
                ctx.evaluated_at,
            ) {
                Ok(reservation) => held.push(reservation),
                Err(err) => {
                    self.release_held(held);

                    return Err(match err {
                        ReserveError::UsageExceeded(key) => ReservationFailure::Contended {
                            key,
                            rejection: RejectedCandidate {
                                candidate: candidate.reference(),
                                reason: reservation_failure_reason(candidate),
                            },
                        },
                        ReserveError::Store(err) => ReservationFailure::Fatal(err),
                    });
                }
            }
        }

        Ok(held)
    }

    fn release_held(&self, held: Vec<Reservation>) {
        for reservation in held {
            if let Err(err) = self.ledger.release(reservation) {
                warn!(error = %err, "failed to release reservation during recompute");
            }
        }
    }
}

/// Run the stacking phase over the selected candidates.
fn apply_selected(
    ctx: &PricingContext,
    entered: &[(i64, u32)],
    overrides: &[Option<PriceOverride>],
    selected: Vec<Candidate>,
    rejected: Vec<RejectedCandidate>,
) -> Result<Computation, PricingError> {
    let currency = ctx.cart.currency();

    let shipping_minor = ctx
        .shipping
        .as_ref()
        .map_or(0, |shipping| shipping.cost.to_minor_units());

    let mut running = RunningTotals::new(entered, shipping_minor, currency);
    let mut applied = Vec::with_capacity(selected.len());
    let mut free_items = Vec::new();

    for candidate in &selected {
        let adjustment = match candidate {
            Candidate::Promotion(promotion) => {
                apply_promotion(promotion, ctx, &mut running, candidate.reference())?
            }
            Candidate::Coupon { coupon, linked } => match linked {
                // The promotion's own discount cap governs; the adjustment is
                // recorded under the coupon that unlocked it.
                Some(promotion) => {
                    apply_promotion(promotion, ctx, &mut running, candidate.reference())?
                }
                None => apply_standalone_coupon(coupon, ctx, &mut running)?,
            },
        };

        free_items.extend(adjustment.free_items.iter().copied());
        applied.push(adjustment);
    }

    let lines = build_lines(ctx, overrides, &running);
    let goods_total_minor = running.cart_running();

    Ok(Computation {
        lines,
        selected,
        applied,
        rejected,
        cart_discount_minor: running.cart_discount(),
        free_shipping: running.free_shipping(),
        free_items,
        points: running.points(),
        goods_total_minor,
    })
}

fn assemble(
    ctx: &PricingContext,
    computation: Computation,
    carried_rejections: Vec<RejectedCandidate>,
    reservations: Vec<Reservation>,
) -> PricedResult {
    let currency = ctx.cart.currency();

    let shipping_minor = ctx
        .shipping
        .as_ref()
        .map_or(0, |shipping| shipping.cost.to_minor_units());

    let payable_shipping = if computation.free_shipping {
        0
    } else {
        shipping_minor
    };

    let mut rejected = computation.rejected;
    rejected.extend(carried_rejections);

    PricedResult {
        lines: computation.lines,
        subtotal: ctx.cart.subtotal(),
        cart_discount: Money::from_minor(computation.cart_discount_minor, currency),
        shipping: Money::from_minor(shipping_minor, currency),
        free_shipping: computation.free_shipping,
        total: Money::from_minor(
            computation.goods_total_minor.saturating_add(payable_shipping),
            currency,
        ),
        applied: computation.applied,
        rejected,
        free_items: computation.free_items,
        points: computation.points,
        reservations,
    }
}

/// Promotions surviving screening, grouped by how they become applicable.
#[derive(Debug)]
struct ResolvedPromotions {
    open: Vec<Arc<Promotion>>,
    coupon_gated: Vec<Arc<Promotion>>,
    rejected: Vec<RejectedCandidate>,
}

/// Why a reservation pass did not complete.
#[derive(Debug)]
enum ReservationFailure {
    Contended {
        key: UsageKey,
        rejection: RejectedCandidate,
    },
    Fatal(CatalogError),
}

/// A contended coupon surfaces the user-facing usage error; a contended
/// promotion records the internal reservation failure.
fn reservation_failure_reason(candidate: &Candidate) -> RejectionReason {
    match candidate {
        Candidate::Promotion(_) => RejectionReason::UsageReservationFailed,
        Candidate::Coupon { .. } => RejectionReason::Coupon(CouponError::UsageExceeded),
    }
}

fn find_linked(
    promotion_id: PromotionId,
    coupon_gated: &[Arc<Promotion>],
    open: &mut Vec<Arc<Promotion>>,
) -> Option<Arc<Promotion>> {
    if let Some(promotion) = coupon_gated
        .iter()
        .find(|promotion| promotion.id == promotion_id)
    {
        return Some(Arc::clone(promotion));
    }

    // A coupon linked to an openly eligible promotion takes the promotion
    // over: it applies once, through the coupon, in the coupon phase.
    open.iter()
        .position(|promotion| promotion.id == promotion_id)
        .map(|index| open.remove(index))
}

/// Enforce exclusivity and produce the final application order.
fn select_candidates(
    open: Vec<Arc<Promotion>>,
    coupons: Vec<Candidate>,
    coupon_phase: CouponPhase,
    rejected: &mut Vec<RejectedCandidate>,
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = Vec::with_capacity(open.len() + coupons.len());

    match coupon_phase {
        CouponPhase::AfterPromotions => {
            candidates.extend(open.into_iter().map(Candidate::Promotion));
            candidates.extend(coupons);
        }
        CouponPhase::BeforePromotions => {
            candidates.extend(coupons);
            candidates.extend(open.into_iter().map(Candidate::Promotion));
        }
    }

    let winner = candidates
        .iter()
        .enumerate()
        .filter_map(|(index, candidate)| {
            candidate
                .exclusive_rank()
                .map(|(priority, created_at, id)| (index, priority, created_at, id))
        })
        // Highest priority wins; ties go to the oldest, then the smaller id.
        .max_by(|a, b| {
            a.1.cmp(&b.1)
                .then_with(|| b.2.cmp(&a.2))
                .then_with(|| b.3.cmp(&a.3))
        })
        .map(|(index, ..)| index);

    let Some(winner) = winner else {
        return candidates;
    };

    let mut selected = Vec::with_capacity(1);

    for (index, candidate) in candidates.into_iter().enumerate() {
        if index == winner {
            selected.push(candidate);
        } else {
            rejected.push(RejectedCandidate {
                candidate: candidate.reference(),
                reason: RejectionReason::ExclusivityConflict,
            });
        }
    }

    selected
}

/// Apply one promotion's actions in sort order under its discount cap.
fn apply_promotion(
    promotion: &Promotion,
    ctx: &PricingContext,
    running: &mut RunningTotals,
    reference: CandidateRef,
) -> Result<AppliedAdjustment, PricingError> {
    let mut cap_remaining = promotion
        .max_discount_amount
        .map(|cap| cap.to_minor_units());

    let mut adjustment = empty_adjustment(reference, running.currency());

    for action in promotion.actions_in_order() {
        let outcome = apply_action(action, &ctx.cart, running, cap_remaining)?;

        cap_remaining = cap_remaining.map(|cap| cap.saturating_sub(outcome.amount_minor));

        merge_outcome(&mut adjustment, outcome, running.currency());
    }

    Ok(adjustment)
}

/// Apply a standalone coupon's discount with the same machinery as a
/// promotion action, targeted at the lines its restrictions leave eligible.
fn apply_standalone_coupon(
    coupon: &Coupon,
    ctx: &PricingContext,
    running: &mut RunningTotals,
) -> Result<AppliedAdjustment, PricingError> {
    let target = coupon_target(coupon, ctx);

    let kind = match &coupon.kind {
        CouponKind::Percentage(percent) => ActionKind::PercentageDiscount(*percent),
        CouponKind::Amount(amount) => ActionKind::FixedAmountDiscount(*amount),
        // Linked coupons are handled by the caller.
        CouponKind::Promotion(_) => {
            return Ok(empty_adjustment(
                CandidateRef::Coupon {
                    id: Some(coupon.id),
                    code: coupon.code.clone(),
                },
                running.currency(),
            ));
        }
    };

    let action = PromotionAction::new(kind, target);

    let cap_remaining = coupon.max_discount_amount.map(|cap| cap.to_minor_units());

    let outcome = apply_action(&action, &ctx.cart, running, cap_remaining)?;

    let mut adjustment = empty_adjustment(
        CandidateRef::Coupon {
            id: Some(coupon.id),
            code: coupon.code.clone(),
        },
        running.currency(),
    );

    merge_outcome(&mut adjustment, outcome, running.currency());

    Ok(adjustment)
}

/// An unrestricted coupon discounts the cart; a restricted one discounts the
/// products of its eligible lines.
fn coupon_target(coupon: &Coupon, ctx: &PricingContext) -> ActionTarget {
    let eligible = eligible_lines(&coupon.restrictions, &ctx.cart);

    if eligible.len() == ctx.cart.len() {
        return ActionTarget::Cart;
    }

    let products: Vec<ProductId> = eligible
        .iter()
        .filter_map(|&index| ctx.cart.line(index).ok())
        .map(|line| line.product)
        .collect();

    ActionTarget::Products(products)
}

fn empty_adjustment(
    candidate: CandidateRef,
    currency: &'static Currency,
) -> AppliedAdjustment {
    AppliedAdjustment {
        candidate,
        amount: Money::from_minor(0, currency),
        affected_lines: SmallVec::new(),
        free_shipping: false,
        free_items: SmallVec::new(),
        points: 0,
    }
}

fn merge_outcome(
    adjustment: &mut AppliedAdjustment,
    outcome: ActionOutcome,
    currency: &'static Currency,
) {
    let amount = adjustment
        .amount
        .to_minor_units()
        .saturating_add(outcome.amount_minor);

    adjustment.amount = Money::from_minor(amount, currency);

    for index in outcome.affected_lines {
        if !adjustment.affected_lines.contains(&index) {
            adjustment.affected_lines.push(index);
        }
    }

    adjustment.free_shipping |= outcome.free_shipping;
    adjustment.free_items.extend(outcome.free_items);
    adjustment.points = adjustment.points.saturating_add(outcome.points);
}

fn build_lines(
    ctx: &PricingContext,
    overrides: &[Option<PriceOverride>],
    running: &RunningTotals,
) -> Vec<PricedLine> {
    let currency = ctx.cart.currency();

    ctx.cart
        .iter()
        .enumerate()
        .map(|(index, line)| PricedLine {
            product: line.product,
            variant: line.variant,
            name: line.name.clone(),
            quantity: line.quantity,
            base_unit_price: line.unit_price,
            price_override: overrides.get(index).copied().flatten(),
            base_total: Money::from_minor(line.base_total_minor(), currency),
            final_total: Money::from_minor(running.line_total(index).unwrap_or(0), currency),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use decimal_percentage::Percentage;
    use rusty_money::iso::GBP;
    use testresult::TestResult;

    use crate::{
        cart::{Cart, CartLine},
        catalog::memory::{
            InMemoryCouponCatalog, InMemoryPriceCatalog, InMemoryPromotionCatalog,
            InMemoryUsageStore,
        },
        context::{Customer, Shipping},
        ids::{CouponId, CustomerId, MerchantId},
        promotions::{PromotionStatus, conditions::ConditionType},
    };

    use super::*;

    type TestEngine = PricingEngine<
        InMemoryPromotionCatalog,
        InMemoryCouponCatalog,
        InMemoryPriceCatalog,
        InMemoryUsageStore,
    >;

    fn engine(
        promotions: impl IntoIterator<Item = Promotion>,
        coupons: impl IntoIterator<Item = Coupon>,
    ) -> TestEngine {
        PricingEngine::new(
            InMemoryPromotionCatalog::with_promotions(promotions),
            InMemoryCouponCatalog::with_coupons(coupons),
            InMemoryPriceCatalog::default(),
            InMemoryUsageStore::new(),
        )
    }

    fn context(lines: &[(i64, u32)]) -> TestResult<PricingContext> {
        let lines: Vec<CartLine> = lines
            .iter()
            .map(|&(unit, quantity)| {
                CartLine::new(
                    crate::ids::ProductId::random(),
                    "item",
                    quantity,
                    Money::from_minor(unit, GBP),
                )
            })
            .collect();

        Ok(PricingContext::new(
            MerchantId::random(),
            Cart::with_lines(lines, GBP)?,
            "2024-06-01T12:00:00Z".parse()?,
        ))
    }

    fn percent_off_cart(name: &str, fraction: f64) -> Promotion {
        Promotion::new(PromotionId::random(), name, PromotionScope::Cart).with_action(
            PromotionAction::new(
                ActionKind::PercentageDiscount(Percentage::from(fraction)),
                ActionTarget::Cart,
            ),
        )
    }

    #[test]
    fn undiscounted_cart_prices_at_subtotal() -> TestResult {
        let engine = engine([], []);
        let ctx = context(&[(1000, 2), (500, 1)])?;

        let result = engine.price_cart(&ctx)?;

        assert_eq!(result.total, Money::from_minor(2500, GBP));
        assert_eq!(result.subtotal, Money::from_minor(2500, GBP));
        assert!(result.applied.is_empty());
        assert!(result.reservations.is_empty());

        Ok(())
    }

    #[test]
    fn promotions_stack_sequentially_on_the_running_total() -> TestResult {
        // 10% then £2 off a £100 cart: 100 → 90 → 88, not 100 - 10 - 2 = 88
        // coincidentally; use 50% then 50% to tell the orders apart: 100 →
        // 50 → 25, not 0.
        let engine = engine(
            [
                percent_off_cart("half", 0.5).with_priority(2),
                percent_off_cart("half-again", 0.5).with_priority(1),
            ],
            [],
        );

        let ctx = context(&[(10_000, 1)])?;
        let result = engine.price_cart(&ctx)?;

        assert_eq!(result.total, Money::from_minor(2500, GBP));
        assert_eq!(result.applied.len(), 2);

        Ok(())
    }

    #[test]
    fn exclusive_candidate_suppresses_all_others() -> TestResult {
        let engine = engine(
            [
                percent_off_cart("exclusive", 0.10)
                    .with_priority(5)
                    .exclusive(),
                percent_off_cart("stackable", 0.50).with_priority(9),
            ],
            [],
        );

        let ctx = context(&[(10_000, 1)])?;
        let result = engine.price_cart(&ctx)?;

        // Only the exclusive 10% applies, even though 50% ranks higher.
        assert_eq!(result.total, Money::from_minor(9000, GBP));
        assert_eq!(result.applied.len(), 1);

        assert!(result.rejected.iter().any(|rejection| matches!(
            rejection.reason,
            RejectionReason::ExclusivityConflict
        )));

        Ok(())
    }

    #[test]
    fn tier_override_applies_before_promotions() -> TestResult {
        let ctx = context(&[(1000, 10)])?;
        let product = ctx.cart.line(0)?.product;

        let prices = InMemoryPriceCatalog::default().with_tier_table(
            product,
            None,
            crate::prices::TierTable::new([crate::prices::TierPrice {
                quantity_min: 10,
                unit_price: Money::from_minor(900, GBP),
            }])?,
        );

        let engine = PricingEngine::new(
            InMemoryPromotionCatalog::with_promotions([percent_off_cart("ten", 0.10)]),
            InMemoryCouponCatalog::default(),
            prices,
            InMemoryUsageStore::new(),
        );

        let result = engine.price_cart(&ctx)?;

        // 10 × £9.00 = £90.00, then 10% off → £81.00.
        assert_eq!(result.total, Money::from_minor(8100, GBP));

        let line = result.lines.first().ok_or("missing line")?;
        assert!(line.price_override.is_some());
        assert_eq!(line.final_total, Money::from_minor(8100, GBP));

        Ok(())
    }

    #[test]
    fn standalone_coupon_applies_after_promotions() -> TestResult {
        let engine = engine(
            [percent_off_cart("half", 0.5)],
            [Coupon::new(
                CouponId::random(),
                "TENOFF",
                CouponKind::Percentage(Percentage::from(0.10)),
            )],
        );

        let ctx = context(&[(10_000, 1)])?.with_coupon_codes(["TENOFF"]);
        let result = engine.price_cart(&ctx)?;

        // 100 → 50 (promotion) → 45 (coupon on the discounted total).
        assert_eq!(result.total, Money::from_minor(4500, GBP));
        assert_eq!(result.applied.len(), 2);

        Ok(())
    }

    #[test]
    fn coupon_phase_policy_reorders_stacking() -> TestResult {
        let engine = engine(
            [Promotion::new(
                PromotionId::random(),
                "two-off",
                PromotionScope::Cart,
            )
            .with_action(PromotionAction::new(
                ActionKind::FixedAmountDiscount(Money::from_minor(200, GBP)),
                ActionTarget::Cart,
            ))],
            [Coupon::new(
                CouponId::random(),
                "HALF",
                CouponKind::Percentage(Percentage::from(0.5)),
            )],
        )
        .with_policy(PipelinePolicy {
            coupon_phase: CouponPhase::BeforePromotions,
            ..PipelinePolicy::default()
        });

        let ctx = context(&[(1000, 1)])?.with_coupon_codes(["HALF"]);
        let result = engine.price_cart(&ctx)?;

        // Coupon first: 10.00 → 5.00, then £2 off → 3.00. The default order
        // would give 10.00 → 8.00 → 4.00.
        assert_eq!(result.total, Money::from_minor(300, GBP));

        Ok(())
    }

    #[test]
    fn invalid_coupon_is_rejected_with_reason_not_dropped() -> TestResult {
        let engine = engine([], []);
        let ctx = context(&[(1000, 1)])?.with_coupon_codes(["NOPE"]);

        let result = engine.price_cart(&ctx)?;

        assert_eq!(result.total, Money::from_minor(1000, GBP));

        assert!(result.rejected.iter().any(|rejection| matches!(
            &rejection.reason,
            RejectionReason::Coupon(CouponError::NotFound)
        )));

        Ok(())
    }

    #[test]
    fn coupon_gated_promotion_applies_only_with_its_coupon() -> TestResult {
        let gated = percent_off_cart("members-deal", 0.20).coupon_gated();
        let coupon = Coupon::new(
            CouponId::random(),
            "MEMBER",
            CouponKind::Promotion(gated.id),
        );

        let engine = engine([gated], [coupon]);

        let without = engine.price_cart(&context(&[(1000, 1)])?)?;
        assert_eq!(without.total, Money::from_minor(1000, GBP));

        let with = engine.price_cart(&context(&[(1000, 1)])?.with_coupon_codes(["MEMBER"]))?;
        assert_eq!(with.total, Money::from_minor(800, GBP));

        Ok(())
    }

    #[test]
    fn coupon_linked_to_screened_out_promotion_is_rejected() -> TestResult {
        let mut gated = percent_off_cart("paused-deal", 0.20).coupon_gated();
        gated.status = PromotionStatus::Paused;

        let coupon = Coupon::new(
            CouponId::random(),
            "PAUSED",
            CouponKind::Promotion(gated.id),
        );

        let engine = engine([gated], [coupon]);

        let result = engine.price_cart(&context(&[(1000, 1)])?.with_coupon_codes(["PAUSED"]))?;

        assert_eq!(result.total, Money::from_minor(1000, GBP));
        assert!(result.rejected.iter().any(|rejection| matches!(
            &rejection.reason,
            RejectionReason::Coupon(CouponError::Inactive)
        )));

        Ok(())
    }

    #[test]
    fn capped_promotion_reserves_usage() -> TestResult {
        let engine = engine([percent_off_cart("limited", 0.10).with_max_usage(5)], []);

        let ctx = context(&[(1000, 1)])?;
        let result = engine.price_cart(&ctx)?;

        assert_eq!(result.total, Money::from_minor(900, GBP));
        assert_eq!(result.reservations.len(), 1);

        engine.commit(result.reservations)?;

        Ok(())
    }

    #[test]
    fn exhausted_cap_recomputes_without_the_candidate() -> TestResult {
        let engine = engine([percent_off_cart("last-one", 0.10).with_max_usage(1)], []);

        let first = engine.price_cart(&context(&[(1000, 1)])?)?;
        assert_eq!(first.total, Money::from_minor(900, GBP));

        // The first pricing still holds the pending slot: the second request
        // must fall back to the undiscounted total with an audit trail.
        let second = engine.price_cart(&context(&[(1000, 1)])?)?;

        assert_eq!(second.total, Money::from_minor(1000, GBP));
        assert!(second.reservations.is_empty());
        assert!(second.rejected.iter().any(|rejection| matches!(
            rejection.reason,
            RejectionReason::UsageReservationFailed
        )));

        Ok(())
    }

    #[test]
    fn free_shipping_zeroes_only_the_shipping_component() -> TestResult {
        let engine = engine(
            [Promotion::new(
                PromotionId::random(),
                "ship-free",
                PromotionScope::Shipping,
            )
            .with_action(PromotionAction::new(
                ActionKind::FreeShipping,
                ActionTarget::Cart,
            ))],
            [],
        );

        let ctx = context(&[(1000, 1)])?.with_shipping(Shipping {
            destination_country: "GB".into(),
            method: Some("standard".into()),
            cost: Money::from_minor(350, GBP),
        });

        let result = engine.price_cart(&ctx)?;

        assert!(result.free_shipping);
        assert_eq!(result.total, Money::from_minor(1000, GBP));
        assert_eq!(result.shipping, Money::from_minor(350, GBP));

        Ok(())
    }

    #[test]
    fn first_order_promotion_tracks_order_history() -> TestResult {
        let first_order = percent_off_cart("first-order", 0.10).with_rule(
            crate::promotions::rules::PromotionRule::required(
                ConditionType::CustomerOrderCount,
                crate::promotions::conditions::Operator::Eq,
                crate::promotions::conditions::ConditionValue::Number(0.into()),
            ),
        );

        let engine = engine([first_order], []);

        let fresh = context(&[(1000, 1)])?
            .with_customer(Customer::new(CustomerId::random()).with_order_count(0));

        assert_eq!(
            engine.price_cart(&fresh)?.total,
            Money::from_minor(900, GBP)
        );

        let returning = context(&[(1000, 1)])?
            .with_customer(Customer::new(CustomerId::random()).with_order_count(1));

        assert_eq!(
            engine.price_cart(&returning)?.total,
            Money::from_minor(1000, GBP)
        );

        Ok(())
    }

    #[test]
    fn promotion_catalog_failure_fails_the_whole_call() -> TestResult {
        let mut promotions = crate::catalog::MockPromotionCatalog::new();

        promotions
            .expect_find_active_promotions()
            .returning(|_, _| Err(CatalogError::Unavailable("promotions store down".into())));

        let engine = PricingEngine::new(
            promotions,
            InMemoryCouponCatalog::default(),
            InMemoryPriceCatalog::default(),
            InMemoryUsageStore::new(),
        );

        let ctx = context(&[(1000, 1)])?;

        // No partially discounted result: the call fails outright.
        assert!(matches!(
            engine.price_cart(&ctx),
            Err(PricingError::Upstream(_))
        ));

        Ok(())
    }

    #[test]
    fn price_catalog_failure_fails_the_whole_call() -> TestResult {
        let mut prices = crate::catalog::MockPriceCatalog::new();

        prices
            .expect_find_tier_price()
            .returning(|_, _, _| Err(CatalogError::Unavailable("price store down".into())));

        let engine = PricingEngine::new(
            InMemoryPromotionCatalog::with_promotions([percent_off_cart("ten", 0.10)]),
            InMemoryCouponCatalog::default(),
            prices,
            InMemoryUsageStore::new(),
        );

        let ctx = context(&[(1000, 1)])?;

        assert!(matches!(
            engine.price_cart(&ctx),
            Err(PricingError::Upstream(_))
        ));

        Ok(())
    }

    #[test]
    fn savings_reports_goods_discount() -> TestResult {
        let engine = engine([percent_off_cart("quarter", 0.25)], []);

        let ctx = context(&[(1000, 2)])?.with_shipping(Shipping {
            destination_country: "GB".into(),
            method: None,
            cost: Money::from_minor(300, GBP),
        });

        let result = engine.price_cart(&ctx)?;

        // Goods 20.00 → 15.00 plus shipping 3.00.
        assert_eq!(result.total, Money::from_minor(1800, GBP));
        assert_eq!(result.savings()?, Money::from_minor(500, GBP));

        Ok(())
    }
}
