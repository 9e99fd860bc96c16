use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::amount::Price;
use crate::error::{Error, Result};

use super::payload::{OfferId, OfferPayload};

/// Five-state model of a locally owned offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenOfferState {
    /// Listed and takeable.
    Available,
    /// A take request was accepted; settlement is in progress.
    Reserved,
    /// Settlement completed. Terminal.
    Closed,
    /// Withdrawn by the maker. Terminal.
    Canceled,
    /// Not listed; at least one [`DeactivationReason`] is active.
    Deactivated,
}

impl OpenOfferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Canceled)
    }
}

/// Why an offer is deactivated. Each writer owns exactly one reason and may
/// only clear its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeactivationReason {
    /// The maker toggled the offer off.
    User,
    /// The market price crossed the maker's trigger price.
    TriggerPrice,
    /// The maker fee transaction failed mempool validation.
    FeeValidationFailed,
    /// The wallet cannot fund the swap.
    MissingFunds,
}

impl DeactivationReason {
    pub fn describe(self) -> &'static str {
        match self {
            Self::User => "deactivated by the maker",
            Self::TriggerPrice => "the market price crossed the trigger price",
            Self::FeeValidationFailed => "the maker fee transaction failed validation",
            Self::MissingFunds => "the wallet has insufficient funds for the swap",
        }
    }

    /// Reasons that reflect an outside condition rather than a choice.
    pub fn is_objective(self) -> bool {
        matches!(self, Self::FeeValidationFailed | Self::MissingFunds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeValidationStatus {
    NotChecked,
    Pending,
    Passed,
    Failed,
}

/// An observed state edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: OpenOfferState,
    pub to: OpenOfferState,
}

impl StateChange {
    pub fn became_deactivated(&self) -> bool {
        self.to == OpenOfferState::Deactivated && self.from != OpenOfferState::Deactivated
    }

    pub fn became_available(&self) -> bool {
        self.to == OpenOfferState::Available && self.from != OpenOfferState::Available
    }
}

/// A locally owned offer plus its lifecycle state.
///
/// Cloned out of the registry as a snapshot; every mutation goes through
/// the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOffer {
    offer: OfferPayload,
    state: OpenOfferState,
    trigger_price: Price,
    fee_validation_status: FeeValidationStatus,
    reasons: BTreeSet<DeactivationReason>,
}

impl OpenOffer {
    pub fn new(offer: OfferPayload, trigger_price: Price) -> Self {
        Self {
            offer,
            state: OpenOfferState::Available,
            trigger_price,
            fee_validation_status: FeeValidationStatus::NotChecked,
            reasons: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> &OfferId {
        &self.offer.id
    }

    pub fn offer(&self) -> &OfferPayload {
        &self.offer
    }

    pub fn state(&self) -> OpenOfferState {
        self.state
    }

    /// Zero means no trigger price.
    pub fn trigger_price(&self) -> &Price {
        &self.trigger_price
    }

    pub fn fee_validation_status(&self) -> FeeValidationStatus {
        self.fee_validation_status
    }

    pub fn reasons(&self) -> impl Iterator<Item = DeactivationReason> + '_ {
        self.reasons.iter().copied()
    }

    pub fn has_reason(&self, reason: DeactivationReason) -> bool {
        self.reasons.contains(&reason)
    }

    pub fn has_missing_funds(&self) -> bool {
        self.has_reason(DeactivationReason::MissingFunds)
    }

    pub fn is_deactivated(&self) -> bool {
        self.state == OpenOfferState::Deactivated
    }

    pub fn is_available(&self) -> bool {
        self.state == OpenOfferState::Available
    }

    pub(crate) fn replace_offer(&mut self, offer: OfferPayload) {
        self.offer = offer;
    }

    pub(crate) fn set_trigger_price(&mut self, trigger_price: Price) {
        self.trigger_price = trigger_price;
    }

    pub(crate) fn set_fee_validation_status(&mut self, status: FeeValidationStatus) {
        self.fee_validation_status = status;
    }

    fn not_available(&self) -> Error {
        Error::NotAvailable { state: self.state }
    }

    fn change(&mut self, to: OpenOfferState) -> Option<StateChange> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        Some(StateChange { from, to })
    }

    /// State an offer settles into when it is neither reserved nor terminal.
    fn resting_state(&self) -> OpenOfferState {
        if self.reasons.is_empty() {
            OpenOfferState::Available
        } else {
            OpenOfferState::Deactivated
        }
    }

    /// Record `reason`. While reserved the reason is kept and applied once
    /// the reservation resolves.
    pub(crate) fn deactivate(&mut self, reason: DeactivationReason) -> Result<Option<StateChange>> {
        if self.state.is_terminal() {
            return Err(self.not_available());
        }
        self.reasons.insert(reason);
        if self.state == OpenOfferState::Reserved {
            return Ok(None);
        }
        let to = self.resting_state();
        Ok(self.change(to))
    }

    /// Clear `reason`. Other reasons keep the offer deactivated.
    pub(crate) fn clear_reason(&mut self, reason: DeactivationReason) -> Result<Option<StateChange>> {
        if self.state.is_terminal() {
            return Err(self.not_available());
        }
        self.reasons.remove(&reason);
        if self.state == OpenOfferState::Reserved {
            return Ok(None);
        }
        let to = self.resting_state();
        Ok(self.change(to))
    }

    pub(crate) fn reserve(&mut self) -> Result<StateChange> {
        if self.state != OpenOfferState::Available {
            return Err(self.not_available());
        }
        Ok(self
            .change(OpenOfferState::Reserved)
            .unwrap_or_else(|| unreachable!("available offer must change state on reserve")))
    }

    /// Leave RESERVED without settling.
    pub(crate) fn release(&mut self) -> Result<StateChange> {
        if self.state != OpenOfferState::Reserved {
            return Err(self.not_available());
        }
        let to = self.resting_state();
        Ok(self
            .change(to)
            .unwrap_or_else(|| unreachable!("reserved offer must change state on release")))
    }

    pub(crate) fn close(&mut self) -> Result<StateChange> {
        if self.state != OpenOfferState::Reserved {
            return Err(self.not_available());
        }
        Ok(self
            .change(OpenOfferState::Closed)
            .unwrap_or_else(|| unreachable!("reserved offer must change state on close")))
    }

    pub(crate) fn cancel(&mut self) -> Result<StateChange> {
        match self.state {
            OpenOfferState::Available | OpenOfferState::Deactivated => Ok(self
                .change(OpenOfferState::Canceled)
                .unwrap_or_else(|| unreachable!("resting offer must change state on cancel"))),
            _ => Err(self.not_available()),
        }
    }
}
