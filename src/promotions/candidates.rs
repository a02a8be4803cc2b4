//! Promotion Candidates
//!
//! Read-only resolution of which promotions are in play for a context:
//! status, date window, advisory usage caps, customer-group eligibility,
//! minimum order amount, then the rule groups. Survivors are ranked by
//! priority (descending) with creation time as the tie-break: oldest wins,
//! a documented policy rather than an accident of ordering. Nothing here
//! mutates usage counters.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::{
    catalog::{CatalogError, PromotionCatalog},
    context::PricingContext,
    coupons::CouponError,
    ids::{CouponId, PromotionId},
    promotions::{ConfigError, Promotion, PromotionScope, PromotionStatus, rules},
};

/// Errors while resolving candidates.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// A promotion's rules or actions are misconfigured.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The promotion catalog could not be read.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Which candidate a rejection refers to.
#[derive(Debug, Clone)]
pub enum CandidateRef {
    /// A promotion.
    Promotion {
        /// Promotion id.
        id: PromotionId,
        /// Promotion name.
        name: String,
    },

    /// A coupon.
    Coupon {
        /// Coupon id, when the code resolved to one.
        id: Option<CouponId>,
        /// The submitted code.
        code: String,
    },
}

impl CandidateRef {
    /// Reference a promotion.
    #[must_use]
    pub fn promotion(promotion: &Promotion) -> Self {
        Self::Promotion {
            id: promotion.id,
            name: promotion.name.clone(),
        }
    }

    /// Display label for audit output.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Promotion { name, .. } => name,
            Self::Coupon { code, .. } => code,
        }
    }
}

/// Why a candidate did not contribute to the final price. Routine and
/// expected; recorded in the priced result for auditability.
#[derive(Debug, Clone, Error)]
pub enum RejectionReason {
    /// The promotion is not in active status.
    #[error("not active")]
    Inactive,

    /// The evaluation timestamp is outside the date window.
    #[error("outside date window")]
    OutsideDateWindow,

    /// The advisory usage count already meets the cap.
    #[error("usage cap reached")]
    UsageCapReached,

    /// The customer is not in an eligible group, or is in an excluded one.
    #[error("customer group not eligible")]
    CustomerGroupIneligible,

    /// The cart subtotal is below the promotion's minimum.
    #[error("minimum order amount not met")]
    MinOrderNotMet,

    /// The rule groups did not hold.
    #[error("rules not satisfied")]
    RulesNotSatisfied,

    /// The promotion only applies through a linked coupon.
    #[error("requires a coupon")]
    CouponRequired,

    /// An exclusive candidate suppressed this one.
    #[error("suppressed by an exclusive promotion")]
    ExclusivityConflict,

    /// The ledger could not reserve a usage slot at commit time.
    #[error("usage reservation failed")]
    UsageReservationFailed,

    /// The coupon failed validation.
    #[error(transparent)]
    Coupon(#[from] CouponError),
}

/// A candidate that was considered and excluded, with the reason.
#[derive(Debug, Clone)]
pub struct RejectedCandidate {
    /// Which candidate.
    pub candidate: CandidateRef,

    /// Why it was excluded.
    pub reason: RejectionReason,
}

/// Outcome of resolving one scope.
#[derive(Debug, Default)]
pub struct CandidateSet {
    /// Eligible promotions, ranked.
    pub eligible: Vec<Arc<Promotion>>,

    /// Promotions that pass every check but only apply through a linked
    /// coupon. Screened-out coupon-gated promotions are dropped silently;
    /// they were never visible as candidates.
    pub coupon_gated: Vec<Arc<Promotion>>,

    /// Considered-but-excluded promotions with reasons.
    pub rejected: Vec<RejectedCandidate>,
}

/// Pre-rule eligibility screen shared with the coupon path: status, window,
/// advisory caps, groups, minimum order.
///
/// # Errors
///
/// Returns a [`ConfigError`] when the promotion's rules are misconfigured.
pub fn screen_promotion(
    promotion: &Promotion,
    ctx: &PricingContext,
) -> Result<Option<RejectionReason>, ConfigError> {
    if promotion.status != PromotionStatus::Active {
        return Ok(Some(RejectionReason::Inactive));
    }

    let now = ctx.evaluated_at;

    if now < promotion.starts_at || promotion.ends_at.is_some_and(|ends_at| now > ends_at) {
        return Ok(Some(RejectionReason::OutsideDateWindow));
    }

    if promotion
        .max_usage
        .is_some_and(|max_usage| promotion.usage_count >= max_usage)
    {
        return Ok(Some(RejectionReason::UsageCapReached));
    }

    let groups = ctx.customer_groups();

    if !promotion.eligible_groups.is_empty()
        && !groups
            .iter()
            .any(|group| promotion.eligible_groups.contains(group))
    {
        return Ok(Some(RejectionReason::CustomerGroupIneligible));
    }

    if groups
        .iter()
        .any(|group| promotion.excluded_groups.contains(group))
    {
        return Ok(Some(RejectionReason::CustomerGroupIneligible));
    }

    if let Some(min_order) = promotion.min_order_amount {
        if ctx.cart.subtotal().to_minor_units() < min_order.to_minor_units() {
            return Ok(Some(RejectionReason::MinOrderNotMet));
        }
    }

    if !rules::is_eligible(promotion, ctx)? {
        return Ok(Some(RejectionReason::RulesNotSatisfied));
    }

    Ok(None)
}

/// Rank candidates: priority descending, then creation time ascending, then
/// id for a total order.
pub fn rank(candidates: &mut [Arc<Promotion>]) {
    candidates.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Resolve the eligible, ranked promotions for one scope.
///
/// # Errors
///
/// Returns a [`ResolveError`] when the catalog cannot be read or a promotion
/// is misconfigured.
pub fn resolve_candidates<P>(
    catalog: &P,
    scope: PromotionScope,
    ctx: &PricingContext,
) -> Result<CandidateSet, ResolveError>
where
    P: PromotionCatalog + ?Sized,
{
    let mut set = CandidateSet::default();

    for promotion in catalog.find_active_promotions(scope, &ctx.merchant)? {
        match screen_promotion(&promotion, ctx)? {
            None if promotion.requires_coupon => set.coupon_gated.push(promotion),
            None => set.eligible.push(promotion),
            Some(reason) => {
                if promotion.requires_coupon {
                    continue;
                }

                debug!(promotion = %promotion.id, %reason, "promotion rejected");

                set.rejected.push(RejectedCandidate {
                    candidate: CandidateRef::promotion(&promotion),
                    reason,
                });
            }
        }
    }

    rank(&mut set.eligible);

    Ok(set)
}
