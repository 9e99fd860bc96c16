pub mod edit;
pub mod open_offer;
pub mod payload;
pub mod registry;

pub use edit::{EditType, EditedOffer, ProposedChanges, apply_edit, resolve_edit_type};
pub use open_offer::{
    DeactivationReason, FeeValidationStatus, OpenOffer, OpenOfferState, StateChange,
};
pub use payload::{BSQ_SWAP_PAYMENT_METHOD, Direction, OfferId, OfferPayload};
pub use registry::{ExpiryHook, OfferHandle, OfferRegistry};
