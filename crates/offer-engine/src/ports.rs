//! Collaborator-facing ports.
//!
//! Wallets, the offer book, price feeds and validators live outside this
//! crate. The engine only talks to them through these traits; errors from
//! collaborators are flattened to strings at this boundary.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

use crate::amount::{Amount, CurrencyCode, Price};
use crate::offer::payload::{OfferId, OfferPayload};
use crate::pow::ProofOfWork;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Current spendable wallet balance.
pub trait BalanceQuery: Send + Sync {
    fn get_balance(&self, asset: &CurrencyCode) -> Amount;
}

/// Current network fee rate in sats per vbyte.
pub trait FeeRateQuery: Send + Sync {
    fn get_rate_per_vbyte(&self) -> i64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedInput {
    pub is_segwit: bool,
}

/// Inputs a wallet would spend for a target amount, plus the change left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub inputs: Vec<SelectedInput>,
    pub change: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Amount, available: Amount },
}

/// Best-effort input selection. The asset is the currency of `required`.
pub trait UtxoSelector: Send + Sync {
    fn select(&self, required: &Amount) -> Result<Selection, SelectionError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceQuote {
    pub price: Price,
    pub timestamp_ms: u64,
    /// False when the quote is stale or was not sourced externally.
    pub is_recent_external: bool,
}

pub trait PriceFeed: Send + Sync {
    fn get_price(&self, currency: &CurrencyCode) -> Option<PriceQuote>;
}

/// The shared, eventually consistent offer store.
///
/// Both calls are idempotent: publishing an offer already listed or
/// withdrawing one that is gone reports success.
pub trait OfferBook: Send + Sync {
    fn publish(&self, payload: OfferPayload) -> BoxFuture<'static, Result<(), String>>;
    fn withdraw(&self, payload: OfferPayload) -> BoxFuture<'static, Result<(), String>>;
}

pub trait ProofOfWorkMinter: Send + Sync {
    fn mint(
        &self,
        offer_id: OfferId,
        maker_address: String,
        difficulty: u8,
    ) -> BoxFuture<'static, Result<ProofOfWork, String>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationStatus {
    Passed,
    Failed(String),
    /// The validator could not reach a verdict; ask again later.
    Undetermined,
}

/// External mempool check of a maker's fee payment transaction.
pub trait MempoolFeeValidator: Send + Sync {
    /// Whether a request for this payload may be made now.
    fn can_request(&self, payload: &OfferPayload) -> bool;
    fn validate(&self, payload: OfferPayload) -> BoxFuture<'static, ValidationStatus>;
}

/// Pays the maker fee of a non-swap offer and returns the fee tx id.
pub trait MakerFeeWallet: Send + Sync {
    fn pay_maker_fee(&self, offer_id: OfferId, fee: Amount) -> BoxFuture<'static, Result<String, String>>;
}

/// Bundle of collaborators the engine is wired with.
#[derive(Clone)]
pub struct Ports {
    pub balances: Arc<dyn BalanceQuery>,
    /// Selector over BTC outputs.
    pub btc_selector: Arc<dyn UtxoSelector>,
    /// Selector over BSQ outputs.
    pub bsq_selector: Arc<dyn UtxoSelector>,
    pub fee_rate: Arc<dyn FeeRateQuery>,
    pub price_feed: Arc<dyn PriceFeed>,
    pub offer_book: Arc<dyn OfferBook>,
    pub minter: Arc<dyn ProofOfWorkMinter>,
    pub fee_validator: Arc<dyn MempoolFeeValidator>,
    pub maker_fee_wallet: Arc<dyn MakerFeeWallet>,
}
