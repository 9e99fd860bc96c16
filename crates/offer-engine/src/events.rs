use crate::amount::{Amount, CurrencyCode};
use crate::offer::open_offer::{DeactivationReason, FeeValidationStatus, OpenOfferState};
use crate::offer::payload::OfferId;

/// Capacity of the outbound [`OfferEvent`] channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notifications emitted by the engine for the host to surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferEvent {
    /// An open offer moved between lifecycle states.
    StateChanged {
        id: OfferId,
        from: OpenOfferState,
        to: OpenOfferState,
    },
    /// An offer was taken off the book; `message` is suitable for display.
    Deactivated {
        id: OfferId,
        reason: DeactivationReason,
        message: String,
    },
    /// An offer became available again.
    Activated { id: OfferId },
    /// The offer book accepted a payload.
    Published { id: OfferId },
    /// A payload was withdrawn from the offer book.
    Withdrawn { id: OfferId },
    /// The offer was re-minted under a new id; `old` is retired.
    IdMutated { old: OfferId, new: OfferId, difficulty: u8 },
    /// A swap offer's funding requirement was re-evaluated.
    FundingChanged {
        id: OfferId,
        required: Amount,
        missing: Amount,
    },
    FeeValidated {
        id: OfferId,
        status: FeeValidationStatus,
    },
}

impl OfferEvent {
    /// Id of the offer the event is about. For [`OfferEvent::IdMutated`]
    /// this is the new id.
    pub fn offer_id(&self) -> &OfferId {
        match self {
            OfferEvent::StateChanged { id, .. }
            | OfferEvent::Deactivated { id, .. }
            | OfferEvent::Activated { id }
            | OfferEvent::Published { id }
            | OfferEvent::Withdrawn { id }
            | OfferEvent::FundingChanged { id, .. }
            | OfferEvent::FeeValidated { id, .. } => id,
            OfferEvent::IdMutated { new, .. } => new,
        }
    }
}

/// Inbound notifications from the host, consumed by
/// [`OfferNode::spawn_event_loop`](crate::node::OfferNode::spawn_event_loop).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Wallet balance changed for the given asset.
    BalanceChanged(CurrencyCode),
    /// Network fee rate changed.
    FeeRateChanged,
    /// A new market price is available from the feed.
    PriceUpdated(CurrencyCode),
    /// Required proof-of-work difficulty changed.
    DifficultyChanged(u8),
    /// The set of offers on the book changed; re-run fee validation.
    OfferListChanged,
    Shutdown,
}
