//! Haggle prelude.
//!
//! Convenience exports for common library consumers.

pub use crate::{
    cart::{Cart, CartError, CartLine},
    catalog::{
        CatalogError, CouponCatalog, PriceCatalog, PromotionCatalog, UsageKey, UsageStore,
        memory::{
            InMemoryCouponCatalog, InMemoryPriceCatalog, InMemoryPromotionCatalog,
            InMemoryUsageStore,
        },
    },
    context::{Customer, PricingContext, Shipping},
    coupons::{Coupon, CouponError, CouponKind, CouponRestriction, CouponRestrictions},
    discounts::{DiscountError, FreeItem},
    ids::{
        CategoryId, CouponId, CustomerId, MerchantId, ProductId, PromotionId, VariantId,
    },
    pipeline::{
        AppliedAdjustment, CouponPhase, PipelinePolicy, PricedLine, PricedResult, PricingEngine,
        PricingError,
    },
    prices::{OverrideSource, PriceOverride, TierPrice, TierTable},
    promotions::{
        ActionKind, ActionTarget, ConfigError, Promotion, PromotionAction, PromotionScope,
        PromotionStatus,
        candidates::{CandidateRef, RejectedCandidate, RejectionReason},
        conditions::{ConditionType, ConditionValue, Operator},
        rules::PromotionRule,
    },
    receipt::{Receipt, ReceiptError},
    usage::{Reservation, ReserveError, UsageCaps, UsageLedger},
};
