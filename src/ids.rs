//! Identifiers
//!
//! Uuid-backed newtypes for the entities this engine consumes from external
//! catalogs. The wrappers keep promotion/coupon/product ids from being mixed
//! up at call sites while staying cheap to copy and hash.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random id.
            #[must_use]
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing uuid.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Unwrap to the raw uuid.
            #[must_use]
            pub const fn into_uuid(self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

entity_id! {
    /// Promotion id
    PromotionId
}

entity_id! {
    /// Coupon id
    CouponId
}

entity_id! {
    /// Product id
    ProductId
}

entity_id! {
    /// Product variant id
    VariantId
}

entity_id! {
    /// Category id
    CategoryId
}

entity_id! {
    /// Customer id
    CustomerId
}

entity_id! {
    /// Merchant id
    MerchantId
}
