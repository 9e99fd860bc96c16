//! In-memory collaborators and sample offers for tests.
//!
//! Every fake records what it was asked to do so tests can assert on the
//! exact sequence of offer book traffic without a network.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Semaphore, broadcast};

use crate::amount::{Amount, CurrencyCode, Price};
use crate::events::OfferEvent;
use crate::offer::payload::{BSQ_SWAP_PAYMENT_METHOD, Direction, OfferId, OfferPayload};
use crate::ports::{
    BalanceQuery, BoxFuture, FeeRateQuery, MakerFeeWallet, MempoolFeeValidator, OfferBook,
    Ports, PriceFeed, PriceQuote, ProofOfWorkMinter, SelectedInput, Selection, SelectionError,
    UtxoSelector, ValidationStatus,
};
use crate::pow::{self, ProofOfWork};

// ---------------------------------------------------------------------------
// Sample offers
// ---------------------------------------------------------------------------

/// Market-based BTC/USD sell offer, 1.5% above market.
pub fn sample_offer() -> OfferPayload {
    OfferPayload {
        id: "sample-offer".parse().expect("valid id"),
        date: 1_700_000_000_000,
        direction: Direction::Sell,
        base_currency: CurrencyCode::btc(),
        counter_currency: CurrencyCode::new("USD"),
        price: Price::zero(CurrencyCode::new("USD")),
        market_price_margin_bps: 150,
        use_market_based_price: true,
        amount: 10_000_000,
        min_amount: 5_000_000,
        payment_method_id: "SEPA".into(),
        maker_address: "maker.onion:9999".into(),
        buyer_security_deposit: 1_500_000,
        seller_security_deposit: 1_500_000,
        maker_fee: Amount::sats(15_000),
        tx_fee: 26_000,
        protocol_version: 1,
        app_version: "1.0.0".into(),
        extra_data: BTreeMap::new(),
        proof_of_work: None,
        maker_fee_tx_id: None,
    }
}

/// Fixed-price BTC/USD sell offer at 100 USD.
pub fn sample_fixed_offer() -> OfferPayload {
    OfferPayload {
        id: "fixed-offer".parse().expect("valid id"),
        price: Price::parse("100", CurrencyCode::new("USD")).expect("valid price"),
        market_price_margin_bps: 0,
        use_market_based_price: false,
        ..sample_offer()
    }
}

/// BSQ swap sell offer: 0.01 BTC at 0.00005 BTC per BSQ (200 BSQ).
pub fn sample_swap_offer() -> OfferPayload {
    OfferPayload {
        id: "swap-offer".parse().expect("valid id"),
        counter_currency: CurrencyCode::bsq(),
        price: Price::parse("0.00005", CurrencyCode::bsq()).expect("valid price"),
        market_price_margin_bps: 0,
        use_market_based_price: false,
        amount: 1_000_000,
        min_amount: 500_000,
        payment_method_id: BSQ_SWAP_PAYMENT_METHOD.into(),
        buyer_security_deposit: 0,
        seller_security_deposit: 0,
        maker_fee: Amount::bsq(100),
        tx_fee: 0,
        ..sample_offer()
    }
}

/// Everything currently buffered in `rx`.
pub fn drain_events(rx: &mut broadcast::Receiver<OfferEvent>) -> Vec<OfferEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}

// ---------------------------------------------------------------------------
// Wallet
// ---------------------------------------------------------------------------

/// UTXO set per asset, with a largest-first selector.
#[derive(Default)]
pub struct TestWallet {
    utxos: Mutex<HashMap<CurrencyCode, Vec<(i64, bool)>>>,
}

impl TestWallet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replace the UTXOs of `asset` with `(value, is_segwit)` pairs.
    pub fn set_utxos(&self, asset: CurrencyCode, utxos: &[(i64, bool)]) {
        self.utxos
            .lock()
            .expect("wallet lock")
            .insert(asset, utxos.to_vec());
    }

    /// Shorthand for a single segwit UTXO of `value`, or none for zero.
    pub fn set_balance(&self, asset: CurrencyCode, value: i64) {
        if value > 0 {
            self.set_utxos(asset, &[(value, true)]);
        } else {
            self.set_utxos(asset, &[]);
        }
    }

    pub fn selector(self: &Arc<Self>, asset: CurrencyCode) -> Arc<dyn UtxoSelector> {
        Arc::new(WalletSelector {
            wallet: Arc::clone(self),
            asset,
        })
    }

    fn utxos(&self, asset: &CurrencyCode) -> Vec<(i64, bool)> {
        self.utxos
            .lock()
            .expect("wallet lock")
            .get(asset)
            .cloned()
            .unwrap_or_default()
    }
}

impl BalanceQuery for TestWallet {
    fn get_balance(&self, asset: &CurrencyCode) -> Amount {
        Amount::new(self.utxos(asset).iter().map(|(v, _)| v).sum(), asset.clone())
    }
}

struct WalletSelector {
    wallet: Arc<TestWallet>,
    asset: CurrencyCode,
}

impl UtxoSelector for WalletSelector {
    fn select(&self, required: &Amount) -> Result<Selection, SelectionError> {
        let mut utxos = self.wallet.utxos(&self.asset);
        utxos.sort_by(|a, b| b.0.cmp(&a.0));
        let mut total = 0i64;
        let mut inputs = Vec::new();
        for (value, is_segwit) in utxos {
            if total >= required.value() && !inputs.is_empty() {
                break;
            }
            total += value;
            inputs.push(SelectedInput { is_segwit });
        }
        if inputs.is_empty() || total < required.value() {
            return Err(SelectionError::InsufficientFunds {
                required: required.clone(),
                available: Amount::new(total, self.asset.clone()),
            });
        }
        Ok(Selection {
            inputs,
            change: Amount::new(total - required.value(), self.asset.clone()),
        })
    }
}

// ---------------------------------------------------------------------------
// Fee rate and prices
// ---------------------------------------------------------------------------

pub struct TestFeeRate(AtomicI64);

impl TestFeeRate {
    pub fn new(rate: i64) -> Arc<Self> {
        Arc::new(Self(AtomicI64::new(rate)))
    }

    pub fn set(&self, rate: i64) {
        self.0.store(rate, Ordering::SeqCst);
    }
}

impl FeeRateQuery for TestFeeRate {
    fn get_rate_per_vbyte(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct TestPriceFeed {
    quotes: Mutex<HashMap<CurrencyCode, PriceQuote>>,
}

impl TestPriceFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_price(&self, price: Price) {
        self.insert(price, true);
    }

    /// A quote the feed itself marks as stale.
    pub fn set_stale_price(&self, price: Price) {
        self.insert(price, false);
    }

    fn insert(&self, price: Price, is_recent_external: bool) {
        let mut quotes = self.quotes.lock().expect("price lock");
        let timestamp_ms = quotes.get(price.currency()).map_or(1, |q| q.timestamp_ms + 1);
        quotes.insert(
            price.currency().clone(),
            PriceQuote {
                price,
                timestamp_ms,
                is_recent_external,
            },
        );
    }
}

impl PriceFeed for TestPriceFeed {
    fn get_price(&self, currency: &CurrencyCode) -> Option<PriceQuote> {
        self.quotes.lock().expect("price lock").get(currency).cloned()
    }
}

// ---------------------------------------------------------------------------
// Offer book
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookCall {
    Publish(OfferId),
    Withdraw(OfferId),
}

impl BookCall {
    pub fn is_publish_of(&self, id: &OfferId) -> bool {
        matches!(self, BookCall::Publish(p) if p == id)
    }

    pub fn is_withdraw_of(&self, id: &OfferId) -> bool {
        matches!(self, BookCall::Withdraw(w) if w == id)
    }
}

/// Offer book that records every call in order.
#[derive(Default)]
pub struct RecordingOfferBook {
    calls: Mutex<Vec<BookCall>>,
    listed: Mutex<HashSet<OfferId>>,
    fail_next: Mutex<Option<String>>,
}

impl RecordingOfferBook {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<BookCall> {
        self.calls.lock().expect("book lock").clone()
    }

    pub fn publishes_of(&self, id: &OfferId) -> usize {
        self.calls().iter().filter(|c| c.is_publish_of(id)).count()
    }

    pub fn withdrawals_of(&self, id: &OfferId) -> usize {
        self.calls().iter().filter(|c| c.is_withdraw_of(id)).count()
    }

    pub fn is_listed(&self, id: &OfferId) -> bool {
        self.listed.lock().expect("book lock").contains(id)
    }

    /// Make the next publish or withdraw fail with `message`.
    pub fn fail_next(&self, message: &str) {
        *self.fail_next.lock().expect("book lock") = Some(message.to_string());
    }

    fn record(&self, call: BookCall) -> Result<(), String> {
        if let Some(message) = self.fail_next.lock().expect("book lock").take() {
            return Err(message);
        }
        let mut listed = self.listed.lock().expect("book lock");
        match &call {
            BookCall::Publish(id) => {
                listed.insert(id.clone());
            }
            BookCall::Withdraw(id) => {
                listed.remove(id);
            }
        }
        self.calls.lock().expect("book lock").push(call);
        Ok(())
    }
}

impl OfferBook for RecordingOfferBook {
    fn publish(&self, payload: OfferPayload) -> BoxFuture<'static, Result<(), String>> {
        let result = self.record(BookCall::Publish(payload.id));
        Box::pin(async move { result })
    }

    fn withdraw(&self, payload: OfferPayload) -> BoxFuture<'static, Result<(), String>> {
        let result = self.record(BookCall::Withdraw(payload.id));
        Box::pin(async move { result })
    }
}

// ---------------------------------------------------------------------------
// Proof of work
// ---------------------------------------------------------------------------

/// Mints real proofs inline. Once gated, each mint waits for a permit from
/// [`release`](Self::release).
pub struct InstantMinter {
    calls: AtomicUsize,
    gated: AtomicBool,
    permits: Arc<Semaphore>,
}

impl Default for InstantMinter {
    fn default() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            gated: AtomicBool::new(false),
            permits: Arc::new(Semaphore::new(0)),
        }
    }
}

impl InstantMinter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn gate(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    pub fn release(&self, mints: usize) {
        self.permits.add_permits(mints);
    }

    /// Yield until at least `n` mints have been requested.
    pub async fn wait_for_calls(&self, n: usize) {
        while self.calls() < n {
            tokio::task::yield_now().await;
        }
    }
}

impl ProofOfWorkMinter for InstantMinter {
    fn mint(
        &self,
        offer_id: OfferId,
        maker_address: String,
        difficulty: u8,
    ) -> BoxFuture<'static, Result<ProofOfWork, String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self
            .gated
            .load(Ordering::SeqCst)
            .then(|| Arc::clone(&self.permits));
        Box::pin(async move {
            if let Some(gate) = gate {
                gate.acquire().await.map_err(|e| e.to_string())?.forget();
            }
            pow::mint(&offer_id, &maker_address, difficulty)
        })
    }
}

// ---------------------------------------------------------------------------
// Fee validation and payment
// ---------------------------------------------------------------------------

pub struct TestMempoolValidator {
    status: Mutex<ValidationStatus>,
    can_request: AtomicBool,
    calls: AtomicUsize,
}

impl Default for TestMempoolValidator {
    fn default() -> Self {
        Self {
            status: Mutex::new(ValidationStatus::Passed),
            can_request: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        }
    }
}

impl TestMempoolValidator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_status(&self, status: ValidationStatus) {
        *self.status.lock().expect("validator lock") = status;
    }

    pub fn set_can_request(&self, allowed: bool) {
        self.can_request.store(allowed, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MempoolFeeValidator for TestMempoolValidator {
    fn can_request(&self, _payload: &OfferPayload) -> bool {
        self.can_request.load(Ordering::SeqCst)
    }

    fn validate(&self, _payload: OfferPayload) -> BoxFuture<'static, ValidationStatus> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let status = self.status.lock().expect("validator lock").clone();
        Box::pin(async move { status })
    }
}

/// Pays maker fees with a made-up tx id derived from the offer id.
#[derive(Default)]
pub struct TestMakerFeeWallet {
    paid: Mutex<Vec<(OfferId, Amount)>>,
}

impl TestMakerFeeWallet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn paid(&self) -> Vec<(OfferId, Amount)> {
        self.paid.lock().expect("fee wallet lock").clone()
    }
}

impl MakerFeeWallet for TestMakerFeeWallet {
    fn pay_maker_fee(&self, offer_id: OfferId, fee: Amount) -> BoxFuture<'static, Result<String, String>> {
        let txid = format!("feetx-{offer_id}");
        self.paid.lock().expect("fee wallet lock").push((offer_id, fee));
        Box::pin(async move { Ok(txid) })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// One of every fake, wired into a [`Ports`] bundle.
#[derive(Clone)]
pub struct TestHarness {
    pub wallet: Arc<TestWallet>,
    pub fee_rate: Arc<TestFeeRate>,
    pub prices: Arc<TestPriceFeed>,
    pub book: Arc<RecordingOfferBook>,
    pub minter: Arc<InstantMinter>,
    pub validator: Arc<TestMempoolValidator>,
    pub fee_wallet: Arc<TestMakerFeeWallet>,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        Self {
            wallet: TestWallet::new(),
            fee_rate: TestFeeRate::new(10),
            prices: TestPriceFeed::new(),
            book: RecordingOfferBook::new(),
            minter: InstantMinter::new(),
            validator: TestMempoolValidator::new(),
            fee_wallet: TestMakerFeeWallet::new(),
        }
    }

    pub fn ports(&self) -> Ports {
        Ports {
            balances: self.wallet.clone(),
            btc_selector: self.wallet.selector(CurrencyCode::btc()),
            bsq_selector: self.wallet.selector(CurrencyCode::bsq()),
            fee_rate: self.fee_rate.clone(),
            price_feed: self.prices.clone(),
            offer_book: self.book.clone(),
            minter: self.minter.clone(),
            fee_validator: self.validator.clone(),
            maker_fee_wallet: self.fee_wallet.clone(),
        }
    }
}
