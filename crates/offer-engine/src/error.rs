use thiserror::Error;

use crate::amount::CurrencyCode;
use crate::offer::open_offer::{DeactivationReason, OpenOfferState};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("no editable field was proposed")]
    NoEditFields,

    #[error("fixed price and market price margin cannot be edited together")]
    ConflictingPriceMode,

    #[error("a trigger price cannot be set on a fixed price offer")]
    TriggerPriceOnFixedOffer,

    #[error("proposed price does not match the offer's pricing mode")]
    PriceModeMismatch,

    #[error("trigger price must not be negative")]
    InvalidTriggerPrice,

    #[error("atomic swap offers cannot be edited; cancel and republish instead")]
    UnsupportedOnSwapOffer,

    #[error("offer is not available (found {state:?})")]
    NotAvailable { state: OpenOfferState },

    #[error("offer not found: {0}")]
    OfferNotFound(String),

    #[error("an offer with id {0} is already registered")]
    DuplicateOffer(String),

    #[error("currency mismatch: {left} vs {right}")]
    CurrencyMismatch {
        left: CurrencyCode,
        right: CurrencyCode,
    },

    #[error("invalid amount range: min must be > 0 and <= max")]
    InvalidAmountRange,

    #[error("amount exceeds the trade limit of {limit} sats")]
    AmountAboveTradeLimit { limit: i64 },

    #[error("price must be positive")]
    InvalidPrice,

    #[error("market price margin outside of allowed range")]
    InvalidMargin,

    #[error("security deposit outside of allowed range")]
    InvalidSecurityDeposit,

    #[error("invalid decimal amount: {0}")]
    InvalidDecimal(String),

    #[error("arithmetic overflow in amount calculation")]
    ArithmeticOverflow,

    #[error("offer stays deactivated: {reasons:?}")]
    ActivationBlocked { reasons: Vec<DeactivationReason> },

    #[error("market price already crossed the trigger price")]
    TriggerPriceReached,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("offer registry lock poisoned")]
    LockPoisoned,

    #[error("reservation timer requires a tokio runtime")]
    NoRuntime,

    #[error("offer book error: {0}")]
    OfferBook(String),

    #[error("proof of work minting failed: {0}")]
    Minting(String),

    #[error("maker fee payment failed: {0}")]
    MakerFee(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by [`OfferNode`](crate::node::OfferNode) entry points.
#[derive(Debug)]
pub enum NodeError {
    /// An internal mutex was poisoned by a prior panic.
    MutexPoisoned,
    /// A spawned task failed to join.
    Task(String),
    /// An engine operation failed.
    Engine(Error),
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeError::MutexPoisoned => write!(f, "internal mutex poisoned by a prior panic"),
            NodeError::Task(e) => write!(f, "task join error: {e}"),
            NodeError::Engine(e) => write!(f, "engine error: {e}"),
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NodeError::Engine(e) => Some(e),
            _ => None,
        }
    }
}

impl From<Error> for NodeError {
    fn from(e: Error) -> Self {
        match e {
            Error::LockPoisoned => NodeError::MutexPoisoned,
            e => NodeError::Engine(e),
        }
    }
}

impl NodeError {
    /// The engine error, if this is one.
    pub fn engine(&self) -> Option<&Error> {
        match self {
            NodeError::Engine(e) => Some(e),
            _ => None,
        }
    }
}
