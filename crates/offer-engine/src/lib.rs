pub mod amount;
pub mod config;
pub mod error;
pub mod events;
pub mod funding;
pub mod node;
pub mod offer;
pub mod ports;
pub mod pow;
pub mod publisher;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod trigger;

// Core types
pub use amount::{Amount, AssetClass, CurrencyCode, Price};
pub use config::{EngineConfig, FeeConfig, FundingConfig, OfferLimits};
pub use error::{Error, NodeError, Result};
pub use events::{EVENT_CHANNEL_CAPACITY, EngineEvent, OfferEvent};
pub use node::{CreateOfferRequest, OfferNode, Pricing};

// Offer lifecycle
pub use offer::{
    DeactivationReason, Direction, EditType, EditedOffer, FeeValidationStatus, OfferHandle,
    OfferId, OfferPayload, OfferRegistry, OpenOffer, OpenOfferState, ProposedChanges,
    StateChange, apply_edit, resolve_edit_type,
};

// Swap funding
pub use funding::{
    FundingEdge, FundingEstimate, FundingWatchers, SwapFundingState, SwapFundingWatcher,
    estimate_required, estimate_vsize,
};

// Collaborator ports
pub use ports::{
    BalanceQuery, FeeRateQuery, MakerFeeWallet, MempoolFeeValidator, OfferBook, Ports,
    PriceFeed, PriceQuote, ProofOfWorkMinter, SelectedInput, Selection, SelectionError,
    UtxoSelector, ValidationStatus,
};

// Proof of work and publishing
pub use pow::{HashCashMinter, ProofOfWork};
pub use publisher::SwapOfferPublisher;
pub use trigger::{TriggerPriceMonitor, is_triggered};
