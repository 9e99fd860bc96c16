//! `OfferNode`: entry points for the maker's offers.
//!
//! Owns the registry, the publisher, the trigger monitor and the funding
//! watchers behind a single `&self` API. Every mutating call takes the
//! offer's lock first, so book traffic for one offer is strictly ordered
//! while different offers proceed in parallel.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::amount::{CurrencyCode, Price};
use crate::config::EngineConfig;
use crate::error::{Error, NodeError, Result};
use crate::events::{EngineEvent, OfferEvent};
use crate::funding::{FundingWatchers, SwapFundingState, SwapFundingWatcher};
use crate::offer::{
    BSQ_SWAP_PAYMENT_METHOD, DeactivationReason, Direction, ExpiryHook, OfferHandle,
    OfferId, OfferPayload, OfferRegistry, OpenOffer, OpenOfferState, ProposedChanges, StateChange,
    apply_edit, resolve_edit_type,
};
use crate::ports::Ports;
use crate::publisher::SwapOfferPublisher;
use crate::trigger::{TriggerPriceMonitor, offer_triggers_at};

// ── Requests ────────────────────────────────────────────────────────────────

/// How a non-swap offer is priced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pricing {
    Fixed(Price),
    /// Follow the market price, offset by a signed margin.
    MarketMargin { margin_bps: i64 },
}

/// Parameters of a new fiat or altcoin offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOfferRequest {
    pub direction: Direction,
    pub currency: CurrencyCode,
    pub min_amount: i64,
    pub amount: i64,
    pub pricing: Pricing,
    pub buyer_security_deposit_bps: i64,
    /// BTC or BSQ.
    pub fee_currency: CurrencyCode,
    pub payment_method_id: String,
    pub trigger_price: Option<Price>,
    pub extra_data: BTreeMap<String, String>,
}

// ── Struct ──────────────────────────────────────────────────────────────────

pub struct OfferNode {
    config: EngineConfig,
    ports: Ports,
    registry: Arc<OfferRegistry>,
    publisher: Arc<SwapOfferPublisher>,
    trigger: TriggerPriceMonitor,
    watchers: FundingWatchers,
}

impl OfferNode {
    pub fn new(config: EngineConfig, ports: Ports) -> Result<(Self, broadcast::Receiver<OfferEvent>)> {
        config.validate()?;
        let (registry, rx) = OfferRegistry::new(config.reservation_timeout());
        let publisher = Arc::new(SwapOfferPublisher::new(
            ports.clone(),
            registry.clone(),
            config.maker_address.clone(),
            config.initial_pow_difficulty,
        ));
        let trigger = TriggerPriceMonitor::new(
            publisher.clone(),
            ports.price_feed.clone(),
            ports.fee_validator.clone(),
        );
        Ok((
            Self {
                config,
                ports,
                registry,
                publisher,
                trigger,
                watchers: FundingWatchers::new(),
            },
            rx,
        ))
    }

    // ── Creation ────────────────────────────────────────────────────────

    /// Validate, pay the maker fee and publish a new offer.
    pub async fn create_offer(&self, request: CreateOfferRequest) -> Result<OfferPayload, NodeError> {
        self.validate_amounts(request.min_amount, request.amount)?;
        let (price, margin_bps, market_based) = self.validate_pricing(&request)?;
        let trigger_price = self.validate_trigger(&request, market_based)?;
        let limits = &self.config.limits;
        if !(limits.min_security_deposit_bps..=limits.max_security_deposit_bps)
            .contains(&request.buyer_security_deposit_bps)
        {
            return Err(Error::InvalidSecurityDeposit.into());
        }
        let pay_in_bsq = match request.fee_currency.as_str() {
            crate::amount::BSQ => true,
            crate::amount::BTC => false,
            _ => {
                return Err(Error::CurrencyMismatch {
                    left: request.fee_currency.clone(),
                    right: CurrencyCode::btc(),
                }
                .into());
            }
        };

        let maker_fee = self.config.fees.maker_fee(request.amount, pay_in_bsq)?;
        let buyer_security_deposit =
            limits.security_deposit(request.amount, request.buyer_security_deposit_bps)?;
        let seller_security_deposit =
            limits.security_deposit(request.amount, limits.seller_security_deposit_bps)?;
        let tx_fee = self
            .ports
            .fee_rate
            .get_rate_per_vbyte()
            .checked_mul(self.config.fees.maker_fee_tx_vsize)
            .ok_or(Error::ArithmeticOverflow)?;

        let id = OfferId::random();
        let fee_tx_id = self
            .ports
            .maker_fee_wallet
            .pay_maker_fee(id.clone(), maker_fee.clone())
            .await
            .map_err(Error::MakerFee)?;
        log::info!("node: paid maker fee {maker_fee} for {id} in {fee_tx_id}");

        let payload = OfferPayload {
            id,
            date: now_ms(),
            direction: request.direction,
            base_currency: CurrencyCode::btc(),
            counter_currency: request.currency,
            price,
            market_price_margin_bps: margin_bps,
            use_market_based_price: market_based,
            amount: request.amount,
            min_amount: request.min_amount,
            payment_method_id: request.payment_method_id,
            maker_address: self.config.maker_address.clone(),
            buyer_security_deposit,
            seller_security_deposit,
            maker_fee,
            tx_fee,
            protocol_version: self.config.protocol_version,
            app_version: self.config.app_version.clone(),
            extra_data: request.extra_data,
            proof_of_work: None,
            maker_fee_tx_id: Some(fee_tx_id),
        };
        let handle = self.registry.insert(OpenOffer::new(payload, trigger_price))?;
        self.publisher.place(handle).await?;
        Ok(self.registry.get(handle)?.offer().clone())
    }

    /// Mint, evaluate funding for, and publish a new BSQ swap offer. An
    /// offer the wallet cannot fund is registered deactivated and stays off
    /// the book until its watcher sees enough funds. If the difficulty rose
    /// while minting, the returned payload is never listed; it is re-minted
    /// under its next id first.
    pub async fn create_swap_offer(
        &self,
        direction: Direction,
        min_amount: i64,
        amount: i64,
        price: Price,
    ) -> Result<OfferPayload, NodeError> {
        self.validate_amounts(min_amount, amount)?;
        if *price.currency() != CurrencyCode::bsq() {
            return Err(Error::CurrencyMismatch {
                left: price.currency().clone(),
                right: CurrencyCode::bsq(),
            }
            .into());
        }
        if price.value() <= 0 {
            return Err(Error::InvalidPrice.into());
        }
        let maker_fee = self.config.fees.maker_fee(amount, true)?;
        let maker_address = self.config.maker_address.clone();
        let protocol_version = self.config.protocol_version;
        let app_version = self.config.app_version.clone();

        let payload = self
            .publisher
            .request_new_offer(move |id, pow| OfferPayload {
                id,
                date: now_ms(),
                direction,
                base_currency: CurrencyCode::btc(),
                counter_currency: CurrencyCode::bsq(),
                price,
                market_price_margin_bps: 0,
                use_market_based_price: false,
                amount,
                min_amount,
                payment_method_id: BSQ_SWAP_PAYMENT_METHOD.to_string(),
                maker_address,
                buyer_security_deposit: 0,
                seller_security_deposit: 0,
                maker_fee,
                tx_fee: 0,
                protocol_version,
                app_version,
                extra_data: BTreeMap::new(),
                proof_of_work: Some(pow),
                maker_fee_tx_id: None,
            })
            .await?;

        let mut open = OpenOffer::new(payload, Price::zero(CurrencyCode::bsq()));
        let fee_rate = self.ports.fee_rate.get_rate_per_vbyte();
        let state = {
            let open = open.clone();
            let ports = self.ports.clone();
            let cfg = self.config.funding.clone();
            tokio::task::spawn_blocking(move || SwapFundingWatcher::evaluate(&open, &ports, &cfg))
                .await
                .map_err(|e| NodeError::Task(e.to_string()))??
        };
        if state.has_missing_funds() {
            log::info!(
                "node: swap offer {} is missing {}, registering deactivated",
                open.id(),
                state.missing_funds
            );
            open.deactivate(DeactivationReason::MissingFunds)?;
        }

        let handle = self.registry.insert(open)?;
        self.registry.emit(OfferEvent::FundingChanged {
            id: self.registry.get(handle)?.id().clone(),
            required: state.required().clone(),
            missing: state.missing_funds.clone(),
        });
        self.watchers.insert(SwapFundingWatcher::new(handle, state, fee_rate))?;
        self.publisher.place(handle).await?;
        Ok(self.registry.get(handle)?.offer().clone())
    }

    fn validate_amounts(&self, min_amount: i64, amount: i64) -> Result<()> {
        if min_amount <= 0 || min_amount > amount {
            return Err(Error::InvalidAmountRange);
        }
        let limit = self.config.limits.max_trade_amount_sats;
        if amount > limit {
            return Err(Error::AmountAboveTradeLimit { limit });
        }
        Ok(())
    }

    /// Returns `(price, margin_bps, use_market_based_price)`.
    fn validate_pricing(&self, request: &CreateOfferRequest) -> Result<(Price, i64, bool)> {
        match &request.pricing {
            Pricing::Fixed(price) => {
                if *price.currency() != request.currency {
                    return Err(Error::CurrencyMismatch {
                        left: price.currency().clone(),
                        right: request.currency.clone(),
                    });
                }
                if price.value() <= 0 {
                    return Err(Error::InvalidPrice);
                }
                Ok((price.clone(), 0, false))
            }
            Pricing::MarketMargin { margin_bps } => {
                if margin_bps.abs() > self.config.limits.max_market_price_margin_bps {
                    return Err(Error::InvalidMargin);
                }
                Ok((Price::zero(request.currency.clone()), *margin_bps, true))
            }
        }
    }

    fn validate_trigger(&self, request: &CreateOfferRequest, market_based: bool) -> Result<Price> {
        let Some(trigger) = request.trigger_price.clone() else {
            return Ok(Price::zero(request.currency.clone()));
        };
        if trigger.is_zero() {
            return Ok(trigger);
        }
        if !market_based {
            return Err(Error::TriggerPriceOnFixedOffer);
        }
        if trigger.value() < 0 {
            return Err(Error::InvalidTriggerPrice);
        }
        if *trigger.currency() != request.currency {
            return Err(Error::CurrencyMismatch {
                left: trigger.currency().clone(),
                right: request.currency.clone(),
            });
        }
        if let Some(market) = self.trigger.market_price(&request.currency)
            && crate::trigger::is_triggered(request.direction, &trigger, &market)
        {
            return Err(Error::TriggerPriceReached);
        }
        Ok(trigger)
    }

    // ── Edit, cancel, activation ────────────────────────────────────────

    /// Apply `changes` to a resting offer. The id is kept; the book ends up
    /// listing the edited payload if the offer is available afterwards.
    ///
    /// Deactivated offers are editable too, so an edit can carry the
    /// activation that brings them back. Reserved and finished offers fail
    /// with `NotAvailable`.
    pub async fn edit_offer(&self, id: &OfferId, changes: ProposedChanges) -> Result<OfferPayload, NodeError> {
        let handle = self.registry.handle(id)?;
        let _guard = self.registry.lock_offer(handle).await?;
        let open = self.registry.get(handle)?;
        if !matches!(open.state(), OpenOfferState::Available | OpenOfferState::Deactivated) {
            return Err(Error::NotAvailable { state: open.state() }.into());
        }
        let edit = resolve_edit_type(&open, &changes)?;
        let edited = apply_edit(&open, edit, &changes);

        if edited.activate == Some(true) {
            let mut preview = open.clone();
            preview.replace_offer(edited.payload.clone());
            preview.set_trigger_price(edited.trigger_price.clone());
            self.check_activation(&preview)?;
        }

        if edit.changes_payload() {
            self.registry
                .replace_offer(handle, edited.payload.clone(), edited.trigger_price.clone())?;
        } else if edit.edits_trigger_price() {
            self.registry.set_trigger_price(handle, edited.trigger_price.clone())?;
        }
        log::info!("node: edited {id} ({edit:?})");

        match edited.activate {
            Some(true) => {
                self.registry.clear_reason(handle, DeactivationReason::User)?;
                self.registry.clear_reason(handle, DeactivationReason::TriggerPrice)?;
            }
            Some(false) => {
                self.registry.deactivate(handle, DeactivationReason::User)?;
            }
            None => {}
        }

        let current = self.registry.get(handle)?;
        if current.is_available()
            && let Some(market) = self.trigger.market_price(current.offer().currency())
            && offer_triggers_at(&current, &market)
        {
            log::info!("node: edited trigger of {id} is already crossed at {market}");
            self.registry.deactivate(handle, DeactivationReason::TriggerPrice)?;
        }

        self.sync_book(handle).await?;
        Ok(self.registry.get(handle)?.offer().clone())
    }

    /// Withdraw and retire an offer. Reserved offers cannot be canceled.
    /// The offer is only canceled once the book accepted the withdraw, so a
    /// failed call can be retried.
    pub async fn cancel_offer(&self, id: &OfferId) -> Result<(), NodeError> {
        let handle = self.registry.handle(id)?;
        let _guard = self.registry.lock_offer(handle).await?;
        let state = self.registry.get(handle)?.state();
        if !matches!(state, OpenOfferState::Available | OpenOfferState::Deactivated) {
            return Err(Error::NotAvailable { state }.into());
        }
        self.publisher.withdraw_current(handle).await?;
        self.registry.cancel(handle)?;
        self.watchers.remove(handle)?;
        Ok(())
    }

    /// Clear the maker's own deactivation. Fails while an outside condition
    /// still holds the offer back, or if the trigger price has already been
    /// crossed.
    pub async fn activate_offer(&self, id: &OfferId) -> Result<(), NodeError> {
        let handle = self.registry.handle(id)?;
        let _guard = self.registry.lock_offer(handle).await?;
        let open = self.registry.get(handle)?;
        match open.state() {
            OpenOfferState::Available => return Ok(()),
            OpenOfferState::Deactivated => {}
            state => return Err(Error::NotAvailable { state }.into()),
        }
        self.check_activation(&open)?;
        self.registry.clear_reason(handle, DeactivationReason::User)?;
        let change = self.registry.clear_reason(handle, DeactivationReason::TriggerPrice)?;
        if self.registry.get(handle)?.is_available() {
            self.publisher.publish_current(handle).await?;
        } else {
            log::debug!("node: {id} still deactivated after activation ({change:?})");
        }
        Ok(())
    }

    pub async fn deactivate_offer(&self, id: &OfferId) -> Result<(), NodeError> {
        let handle = self.registry.handle(id)?;
        let _guard = self.registry.lock_offer(handle).await?;
        let change = self.registry.deactivate(handle, DeactivationReason::User)?;
        if change.is_some_and(|c| c.became_deactivated()) {
            self.publisher.withdraw_current(handle).await?;
        }
        Ok(())
    }

    fn check_activation(&self, open: &OpenOffer) -> Result<()> {
        let blocking: Vec<DeactivationReason> = open.reasons().filter(|r| r.is_objective()).collect();
        if !blocking.is_empty() {
            return Err(Error::ActivationBlocked { reasons: blocking });
        }
        if let Some(market) = self.trigger.market_price(open.offer().currency())
            && offer_triggers_at(open, &market)
        {
            return Err(Error::TriggerPriceReached);
        }
        Ok(())
    }

    /// Make the book match the offer's state: list it if available,
    /// withdraw it otherwise.
    async fn sync_book(&self, handle: OfferHandle) -> Result<()> {
        if self.registry.get(handle)?.is_available() {
            self.publisher.publish_current(handle).await?;
        } else {
            self.publisher.withdraw_current(handle).await?;
        }
        Ok(())
    }

    // ── Reservation ─────────────────────────────────────────────────────

    /// A take request was accepted. The offer stays listed while reserved;
    /// if the reservation times out into a deactivated state it is
    /// withdrawn.
    pub async fn reserve_offer(&self, id: &OfferId) -> Result<StateChange, NodeError> {
        let handle = self.registry.handle(id)?;
        let _guard = self.registry.lock_offer(handle).await?;
        let change = self.registry.reserve(handle, Some(self.expiry_hook()))?;
        Ok(change)
    }

    /// Settlement finished: close the offer and take it off the book. The
    /// offer closes even if the withdraw fails; calling again on a closed
    /// offer that is still listed retries the withdraw.
    pub async fn complete_trade(&self, id: &OfferId) -> Result<(), NodeError> {
        let handle = self.registry.handle(id)?;
        let _guard = self.registry.lock_offer(handle).await?;
        match self.registry.get(handle)?.state() {
            OpenOfferState::Closed => {
                if self.publisher.listed_id(handle)?.is_none() {
                    return Err(Error::NotAvailable {
                        state: OpenOfferState::Closed,
                    }
                    .into());
                }
                log::info!("node: retrying withdraw of closed offer {id}");
            }
            _ => {
                self.registry.close(handle)?;
                self.watchers.remove(handle)?;
            }
        }
        self.publisher.withdraw_current(handle).await?;
        Ok(())
    }

    /// The taker backed out before settlement.
    pub async fn release_reservation(&self, id: &OfferId) -> Result<StateChange, NodeError> {
        let handle = self.registry.handle(id)?;
        let change = {
            let _guard = self.registry.lock_offer(handle).await?;
            let change = self.registry.release(handle)?;
            self.sync_book(handle).await?;
            change
        };
        // A difficulty rise while reserved left the proof behind.
        self.publisher.start_redos()?;
        Ok(change)
    }

    fn expiry_hook(&self) -> ExpiryHook {
        let publisher = Arc::clone(&self.publisher);
        Box::new(move |handle, change| {
            tokio::spawn(async move {
                let synced = async {
                    let _guard = publisher.registry().lock_offer(handle).await?;
                    if change.to == OpenOfferState::Deactivated {
                        publisher.withdraw_current(handle).await?;
                    }
                    Ok::<_, Error>(())
                };
                if let Err(e) = synced.await {
                    log::warn!("node: syncing book after reservation expiry failed: {e}");
                }
                if let Err(e) = publisher.start_redos() {
                    log::warn!("node: resuming proof-of-work redo failed: {e}");
                }
            });
        })
    }

    // ── Event handlers ──────────────────────────────────────────────────

    /// Re-evaluate swap funding. Returns the number of offers whose funding
    /// flipped.
    pub async fn on_balance_changed(&self, asset: &CurrencyCode) -> Result<usize, NodeError> {
        log::debug!("node: balance of {asset} changed");
        Ok(self
            .watchers
            .refresh_all(&self.publisher, &self.ports, &self.config.funding)
            .await?)
    }

    pub async fn on_fee_rate_changed(&self) -> Result<usize, NodeError> {
        log::debug!("node: fee rate changed");
        Ok(self
            .watchers
            .refresh_all(&self.publisher, &self.ports, &self.config.funding)
            .await?)
    }

    /// Returns the ids deactivated by the update.
    pub async fn on_price_updated(&self, currency: &CurrencyCode) -> Result<Vec<OfferId>, NodeError> {
        Ok(self.trigger.on_price_updated(currency).await?)
    }

    /// Returns the redo tasks started by this change.
    pub fn on_difficulty_changed(&self, difficulty: u8) -> Result<Vec<JoinHandle<()>>, NodeError> {
        Ok(self.publisher.on_difficulty_changed(difficulty)?)
    }

    /// Returns the number of maker fee transactions checked. Swap offers
    /// left off the book by a failed proof-of-work round are retried too.
    pub async fn on_offer_list_changed(&self) -> Result<usize, NodeError> {
        self.publisher.start_redos()?;
        Ok(self.trigger.validate_fees().await?)
    }

    /// Consume host events until [`EngineEvent::Shutdown`] or the sender is
    /// dropped. Handler failures are logged and do not stop the loop.
    pub fn spawn_event_loop(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<EngineEvent>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                log::debug!("node: handling {event:?}");
                let result = match &event {
                    EngineEvent::BalanceChanged(asset) => node.on_balance_changed(asset).await.map(drop),
                    EngineEvent::FeeRateChanged => node.on_fee_rate_changed().await.map(drop),
                    EngineEvent::PriceUpdated(currency) => node.on_price_updated(currency).await.map(drop),
                    EngineEvent::DifficultyChanged(difficulty) => {
                        node.on_difficulty_changed(*difficulty).map(drop)
                    }
                    EngineEvent::OfferListChanged => node.on_offer_list_changed().await.map(drop),
                    EngineEvent::Shutdown => {
                        log::info!("node: event loop shutting down");
                        break;
                    }
                };
                if let Err(e) = result {
                    log::warn!("node: handling {event:?} failed: {e}");
                }
            }
        })
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn subscribe(&self) -> broadcast::Receiver<OfferEvent> {
        self.registry.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<OfferRegistry> {
        &self.registry
    }

    pub fn required_difficulty(&self) -> u8 {
        self.publisher.required_difficulty()
    }

    /// Snapshot of the offer currently registered under `id`.
    pub fn offer(&self, id: &OfferId) -> Result<OpenOffer, NodeError> {
        Ok(self.registry.get_by_id(id)?)
    }

    /// Offers that are neither closed nor canceled.
    pub fn open_offers(&self) -> Result<Vec<OpenOffer>, NodeError> {
        Ok(self.registry.live()?.into_iter().map(|(_, open)| open).collect())
    }

    /// Latest funding evaluation of a swap offer.
    pub fn funding_state(&self, id: &OfferId) -> Result<Option<SwapFundingState>, NodeError> {
        let handle = self.registry.handle(id)?;
        Ok(self.watchers.state(handle)?)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
