//! Per-offer funding watchers for swap offers.
//!
//! Each watcher caches the last funding evaluation of one swap offer. A
//! refresh that flips `has_missing_funds` produces a [`FundingEdge`]; only an
//! edge touches the offer book, so repeated balance or fee-rate events that
//! leave the boolean unchanged cost nothing on the network.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::amount::Amount;
use crate::config::FundingConfig;
use crate::error::{Error, Result};
use crate::events::OfferEvent;
use crate::offer::open_offer::{DeactivationReason, OpenOffer};
use crate::offer::registry::OfferHandle;
use crate::ports::Ports;
use crate::publisher::SwapOfferPublisher;

use super::calculator::SwapFundingState;

/// A flip of `has_missing_funds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingEdge {
    BecameUnderfunded,
    BecameFunded,
}

#[derive(Debug, Clone)]
pub struct SwapFundingWatcher {
    handle: OfferHandle,
    last_balance: Amount,
    last_fee_rate: i64,
    state: SwapFundingState,
}

impl SwapFundingWatcher {
    /// Evaluate a swap offer that is about to be registered. Returns the
    /// initial state; when it reports missing funds the caller registers
    /// the offer already deactivated.
    pub fn evaluate(open: &OpenOffer, ports: &Ports, cfg: &FundingConfig) -> Result<SwapFundingState> {
        let fee_rate = ports.fee_rate.get_rate_per_vbyte();
        SwapFundingState::compute(
            open.offer(),
            ports.balances.as_ref(),
            ports.btc_selector.as_ref(),
            ports.bsq_selector.as_ref(),
            fee_rate,
            cfg,
        )
    }

    pub fn new(handle: OfferHandle, state: SwapFundingState, fee_rate: i64) -> Self {
        Self {
            handle,
            last_balance: state.balance.clone(),
            last_fee_rate: fee_rate,
            state,
        }
    }

    pub fn handle(&self) -> OfferHandle {
        self.handle
    }

    pub fn state(&self) -> &SwapFundingState {
        &self.state
    }

    /// Re-evaluate against the current wallet and fee rate. Skips the
    /// computation when neither changed since the last look.
    pub fn refresh(
        &mut self,
        open: &OpenOffer,
        ports: &Ports,
        cfg: &FundingConfig,
    ) -> Result<Option<FundingEdge>> {
        let fee_rate = ports.fee_rate.get_rate_per_vbyte();
        let balance = ports.balances.get_balance(self.last_balance.currency());
        if balance == self.last_balance && fee_rate == self.last_fee_rate {
            return Ok(None);
        }
        let state = SwapFundingState::compute(
            open.offer(),
            ports.balances.as_ref(),
            ports.btc_selector.as_ref(),
            ports.bsq_selector.as_ref(),
            fee_rate,
            cfg,
        )?;
        let was_missing = self.state.has_missing_funds();
        let is_missing = state.has_missing_funds();
        self.last_balance = state.balance.clone();
        self.last_fee_rate = fee_rate;
        self.state = state;
        Ok(match (was_missing, is_missing) {
            (false, true) => Some(FundingEdge::BecameUnderfunded),
            (true, false) => Some(FundingEdge::BecameFunded),
            _ => None,
        })
    }
}

/// The set of live funding watchers, keyed by offer handle.
#[derive(Default)]
pub struct FundingWatchers {
    watchers: Mutex<HashMap<OfferHandle, SwapFundingWatcher>>,
}

impl FundingWatchers {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<OfferHandle, SwapFundingWatcher>>> {
        self.watchers.lock().map_err(|_| Error::LockPoisoned)
    }

    pub fn insert(&self, watcher: SwapFundingWatcher) -> Result<()> {
        self.lock()?.insert(watcher.handle(), watcher);
        Ok(())
    }

    pub fn remove(&self, handle: OfferHandle) -> Result<bool> {
        Ok(self.lock()?.remove(&handle).is_some())
    }

    pub fn state(&self, handle: OfferHandle) -> Result<Option<SwapFundingState>> {
        Ok(self.lock()?.get(&handle).map(|w| w.state().clone()))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.is_empty())
    }

    /// Refresh every watcher. Failures are logged per offer and do not stop
    /// the others. Returns the number of edges applied.
    pub async fn refresh_all(
        &self,
        publisher: &SwapOfferPublisher,
        ports: &Ports,
        cfg: &FundingConfig,
    ) -> Result<usize> {
        let handles: Vec<OfferHandle> = self.lock()?.keys().copied().collect();
        let mut edges = 0;
        for handle in handles {
            match self.refresh_one(handle, publisher, ports, cfg).await {
                Ok(Some(_)) => edges += 1,
                Ok(None) => {}
                Err(e) => log::warn!("funding_watcher: refresh failed: {e}"),
            }
        }
        Ok(edges)
    }

    /// Refresh one watcher and apply its edge, if any, under the offer lock.
    pub async fn refresh_one(
        &self,
        handle: OfferHandle,
        publisher: &SwapOfferPublisher,
        ports: &Ports,
        cfg: &FundingConfig,
    ) -> Result<Option<FundingEdge>> {
        let registry = publisher.registry();
        let _guard = registry.lock_offer(handle).await?;
        let open = registry.get(handle)?;
        if open.state().is_terminal() {
            self.remove(handle)?;
            return Ok(None);
        }

        let (edge, state) = {
            let mut watchers = self.lock()?;
            let Some(watcher) = watchers.get_mut(&handle) else {
                return Ok(None);
            };
            let before = watcher.state().required().clone();
            let edge = watcher.refresh(&open, ports, cfg)?;
            let changed = edge.is_some() || *watcher.state().required() != before;
            (edge, changed.then(|| watcher.state().clone()))
        };
        if let Some(state) = state {
            registry.emit(OfferEvent::FundingChanged {
                id: open.id().clone(),
                required: state.required().clone(),
                missing: state.missing_funds.clone(),
            });
        }

        match edge {
            Some(FundingEdge::BecameUnderfunded) => {
                log::info!("funding_watcher: {} is missing funds", open.id());
                let change = registry.deactivate(handle, DeactivationReason::MissingFunds)?;
                if change.is_some_and(|c| c.became_deactivated()) {
                    publisher.withdraw_current(handle).await?;
                }
            }
            Some(FundingEdge::BecameFunded) => {
                log::info!("funding_watcher: {} is funded again", open.id());
                let change = registry.clear_reason(handle, DeactivationReason::MissingFunds)?;
                if change.is_some_and(|c| c.became_available()) {
                    publisher.publish_current(handle).await?;
                }
            }
            None => log::debug!("funding_watcher: {} unchanged", open.id()),
        }
        Ok(edge)
    }
}
