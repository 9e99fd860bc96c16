//! Edit-type resolution for open offers.
//!
//! An edit request proposes any subset of {fixed price, market price margin,
//! trigger price, activation state}. [`resolve_edit_type`] validates the
//! combination against the offer and names it; [`apply_edit`] builds the
//! replacement payload. Both are pure.

use serde::{Deserialize, Serialize};

use crate::amount::Price;
use crate::error::{Error, Result};

use super::open_offer::OpenOffer;
use super::payload::OfferPayload;

/// Sparse set of proposed changes. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProposedChanges {
    pub fixed_price: Option<Price>,
    pub market_price_margin_bps: Option<i64>,
    pub trigger_price: Option<Price>,
    /// `Some(true)` activates, `Some(false)` deactivates.
    pub activate: Option<bool>,
    /// Explicit pricing-mode switch; `None` keeps the offer's current mode.
    /// Not an edit field on its own.
    pub use_market_based_price: Option<bool>,
}

impl ProposedChanges {
    pub fn fixed_price(price: Price) -> Self {
        Self {
            fixed_price: Some(price),
            ..Default::default()
        }
    }

    pub fn margin(bps: i64) -> Self {
        Self {
            market_price_margin_bps: Some(bps),
            ..Default::default()
        }
    }

    pub fn trigger(price: Price) -> Self {
        Self {
            trigger_price: Some(price),
            ..Default::default()
        }
    }

    pub fn activation(activate: bool) -> Self {
        Self {
            activate: Some(activate),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EditType {
    ActivationStateOnly,
    FixedPriceOnly,
    FixedPriceAndActivationState,
    MktPriceMarginOnly,
    MktPriceMarginAndActivationState,
    TriggerPriceOnly,
    TriggerPriceAndActivationState,
    MktPriceMarginAndTriggerPrice,
    MktPriceMarginAndTriggerPriceAndActivationState,
}

impl EditType {
    pub const ALL: [EditType; 9] = [
        EditType::ActivationStateOnly,
        EditType::FixedPriceOnly,
        EditType::FixedPriceAndActivationState,
        EditType::MktPriceMarginOnly,
        EditType::MktPriceMarginAndActivationState,
        EditType::TriggerPriceOnly,
        EditType::TriggerPriceAndActivationState,
        EditType::MktPriceMarginAndTriggerPrice,
        EditType::MktPriceMarginAndTriggerPriceAndActivationState,
    ];

    pub fn edits_fixed_price(self) -> bool {
        matches!(
            self,
            EditType::FixedPriceOnly | EditType::FixedPriceAndActivationState
        )
    }

    pub fn edits_margin(self) -> bool {
        matches!(
            self,
            EditType::MktPriceMarginOnly
                | EditType::MktPriceMarginAndActivationState
                | EditType::MktPriceMarginAndTriggerPrice
                | EditType::MktPriceMarginAndTriggerPriceAndActivationState
        )
    }

    pub fn edits_trigger_price(self) -> bool {
        matches!(
            self,
            EditType::TriggerPriceOnly
                | EditType::TriggerPriceAndActivationState
                | EditType::MktPriceMarginAndTriggerPrice
                | EditType::MktPriceMarginAndTriggerPriceAndActivationState
        )
    }

    pub fn edits_activation_state(self) -> bool {
        matches!(
            self,
            EditType::ActivationStateOnly
                | EditType::FixedPriceAndActivationState
                | EditType::MktPriceMarginAndActivationState
                | EditType::TriggerPriceAndActivationState
                | EditType::MktPriceMarginAndTriggerPriceAndActivationState
        )
    }

    /// Whether the edit produces a new payload (as opposed to only touching
    /// local state such as the trigger price or activation).
    pub fn changes_payload(self) -> bool {
        self.edits_fixed_price() || self.edits_margin()
    }
}

/// Name the edit described by `changes`, or reject the combination.
///
/// Checks run in a fixed precedence so the same bad request always reports
/// the same error.
pub fn resolve_edit_type(open: &OpenOffer, changes: &ProposedChanges) -> Result<EditType> {
    let offer = open.offer();
    let f = changes.fixed_price.is_some();
    let m = changes.market_price_margin_bps.is_some();
    let t = changes.trigger_price.is_some();
    let a = changes.activate.is_some();

    if !(f || m || t || a) {
        return Err(Error::NoEditFields);
    }
    if a && !(f || m || t) {
        return Ok(EditType::ActivationStateOnly);
    }
    if f && m {
        return Err(Error::ConflictingPriceMode);
    }
    if f && t {
        return Err(Error::TriggerPriceOnFixedOffer);
    }

    let market_mode = changes
        .use_market_based_price
        .unwrap_or(offer.use_market_based_price);
    if let Some(price) = &changes.fixed_price {
        if !price.is_zero() && market_mode {
            return Err(Error::PriceModeMismatch);
        }
        if price.is_zero() && !market_mode {
            return Err(Error::InvalidPrice);
        }
        if price.currency() != offer.currency() {
            return Err(Error::CurrencyMismatch {
                left: offer.currency().clone(),
                right: price.currency().clone(),
            });
        }
    }
    if changes.market_price_margin_bps.is_some_and(|m| m != 0) && !market_mode {
        return Err(Error::PriceModeMismatch);
    }
    // Leaving market pricing needs a fixed price to land on.
    if offer.use_market_based_price && !market_mode && !f {
        return Err(Error::PriceModeMismatch);
    }
    if changes.trigger_price.as_ref().is_some_and(|p| !p.is_zero()) && !market_mode {
        return Err(Error::TriggerPriceOnFixedOffer);
    }
    if let Some(trigger) = &changes.trigger_price {
        if trigger.value() < 0 {
            return Err(Error::InvalidTriggerPrice);
        }
        if trigger.currency() != offer.currency() {
            return Err(Error::CurrencyMismatch {
                left: offer.currency().clone(),
                right: trigger.currency().clone(),
            });
        }
    }
    if offer.is_swap_offer() {
        return Err(Error::UnsupportedOnSwapOffer);
    }

    Ok(match (f, m, t, a) {
        (true, false, false, false) => EditType::FixedPriceOnly,
        (true, false, false, true) => EditType::FixedPriceAndActivationState,
        (false, true, false, false) => EditType::MktPriceMarginOnly,
        (false, true, false, true) => EditType::MktPriceMarginAndActivationState,
        (false, false, true, false) => EditType::TriggerPriceOnly,
        (false, false, true, true) => EditType::TriggerPriceAndActivationState,
        (false, true, true, false) => EditType::MktPriceMarginAndTriggerPrice,
        (false, true, true, true) => EditType::MktPriceMarginAndTriggerPriceAndActivationState,
        combo => unreachable!("edit combination {combo:?} passed validation without a type"),
    })
}

/// Result of applying a resolved edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditedOffer {
    pub payload: OfferPayload,
    pub trigger_price: Price,
    pub activate: Option<bool>,
}

/// Build the replacement for `open` under a resolved `edit`.
///
/// Every field except price, margin and pricing mode is copied from the
/// original, the id included.
pub fn apply_edit(open: &OpenOffer, edit: EditType, changes: &ProposedChanges) -> EditedOffer {
    let original = open.offer();
    let activate = if edit.edits_activation_state() {
        changes.activate
    } else {
        None
    };
    if !edit.changes_payload() && !edit.edits_trigger_price() {
        return EditedOffer {
            payload: original.clone(),
            trigger_price: open.trigger_price().clone(),
            activate,
        };
    }

    let market_mode = changes
        .use_market_based_price
        .unwrap_or(original.use_market_based_price);
    let zero = Price::zero(original.currency().clone());

    let price = if market_mode {
        zero.clone()
    } else if edit.edits_fixed_price() {
        changes.fixed_price.clone().unwrap_or_else(|| original.price.clone())
    } else {
        original.price.clone()
    };
    let market_price_margin_bps = if !market_mode {
        0
    } else if edit.edits_margin() {
        changes
            .market_price_margin_bps
            .unwrap_or(original.market_price_margin_bps)
    } else {
        original.market_price_margin_bps
    };
    let trigger_price = if !market_mode {
        zero
    } else if edit.edits_trigger_price() {
        changes
            .trigger_price
            .clone()
            .unwrap_or_else(|| open.trigger_price().clone())
    } else {
        open.trigger_price().clone()
    };

    let payload = OfferPayload {
        price,
        market_price_margin_bps,
        use_market_based_price: market_mode,
        ..original.clone()
    };
    EditedOffer {
        payload,
        trigger_price,
        activate,
    }
}
