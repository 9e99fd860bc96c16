//! `TriggerPriceMonitor`: deactivates market-based offers whose trigger
//! price the market crossed, and runs mempool validation of maker fee
//! transactions.

use std::sync::Arc;

use crate::amount::{AssetClass, CurrencyCode, Price};
use crate::error::Result;
use crate::offer::open_offer::{DeactivationReason, FeeValidationStatus, OpenOffer, OpenOfferState};
use crate::offer::payload::{Direction, OfferId};
use crate::offer::registry::OfferHandle;
use crate::ports::{MempoolFeeValidator, PriceFeed, ValidationStatus};
use crate::publisher::SwapOfferPublisher;

/// Whether `market` has moved past `trigger` against the maker.
///
/// A fiat-quoted sell offer (or a crypto-quoted buy offer) triggers when the
/// price falls below the trigger; the other two cases trigger when it rises
/// above it. A zero trigger means none is set.
pub fn is_triggered(direction: Direction, trigger: &Price, market: &Price) -> bool {
    if trigger.is_zero() || market.is_zero() || trigger.currency() != market.currency() {
        return false;
    }
    let falls = match trigger.currency().asset_class() {
        AssetClass::Fiat => direction.is_sell(),
        AssetClass::Crypto => !direction.is_sell(),
    };
    if falls {
        market.value() < trigger.value()
    } else {
        market.value() > trigger.value()
    }
}

/// Whether `open` would trigger at `market` if it were active.
pub fn offer_triggers_at(open: &OpenOffer, market: &Price) -> bool {
    open.offer().use_market_based_price
        && is_triggered(open.offer().direction, open.trigger_price(), market)
}

pub struct TriggerPriceMonitor {
    publisher: Arc<SwapOfferPublisher>,
    price_feed: Arc<dyn PriceFeed>,
    fee_validator: Arc<dyn MempoolFeeValidator>,
}

impl TriggerPriceMonitor {
    pub fn new(
        publisher: Arc<SwapOfferPublisher>,
        price_feed: Arc<dyn PriceFeed>,
        fee_validator: Arc<dyn MempoolFeeValidator>,
    ) -> Self {
        Self {
            publisher,
            price_feed,
            fee_validator,
        }
    }

    /// Latest recent market price for `currency`. Stale quotes count as no
    /// price at all.
    pub fn market_price(&self, currency: &CurrencyCode) -> Option<Price> {
        let quote = self.price_feed.get_price(currency)?;
        if !quote.is_recent_external {
            log::debug!("trigger: ignoring stale {currency} quote from {}", quote.timestamp_ms);
            return None;
        }
        Some(quote.price)
    }

    /// Evaluate every active offer in `currency` against the latest price.
    /// Returns the ids deactivated by this update.
    pub async fn on_price_updated(&self, currency: &CurrencyCode) -> Result<Vec<OfferId>> {
        let Some(market) = self.market_price(currency) else {
            return Ok(Vec::new());
        };
        let registry = self.publisher.registry();
        let mut deactivated = Vec::new();
        for (handle, open) in registry.live()? {
            if open.offer().currency() != currency || !offer_triggers_at(&open, &market) {
                continue;
            }
            if open.state() != OpenOfferState::Available {
                continue;
            }
            match self.deactivate_triggered(handle, &market).await {
                Ok(Some(id)) => deactivated.push(id),
                Ok(None) => {}
                Err(e) => log::warn!("trigger: failed to deactivate {}: {e}", open.id()),
            }
        }
        Ok(deactivated)
    }

    async fn deactivate_triggered(&self, handle: OfferHandle, market: &Price) -> Result<Option<OfferId>> {
        let registry = self.publisher.registry();
        let _guard = registry.lock_offer(handle).await?;
        // Re-check under the lock; the snapshot may be stale.
        let open = registry.get(handle)?;
        if open.state() != OpenOfferState::Available || !offer_triggers_at(&open, market) {
            return Ok(None);
        }
        log::info!(
            "trigger: market {market} crossed trigger {} of {}",
            open.trigger_price(),
            open.id()
        );
        let change = registry.deactivate(handle, DeactivationReason::TriggerPrice)?;
        if change.is_some_and(|c| c.became_deactivated()) {
            self.publisher.withdraw_current(handle).await?;
        }
        Ok(Some(open.id().clone()))
    }

    // ── Maker fee validation ────────────────────────────────────────────

    fn awaits_fee_validation(&self, open: &OpenOffer) -> bool {
        open.state() == OpenOfferState::Available
            && !open.offer().is_swap_offer()
            && open.fee_validation_status() == FeeValidationStatus::NotChecked
            && open.offer().maker_fee_tx_id.is_some()
            && self.fee_validator.can_request(open.offer())
    }

    /// Submit every eligible offer's maker fee transaction for validation
    /// and apply the verdicts. Returns the number of offers checked.
    pub async fn validate_fees(&self) -> Result<usize> {
        let registry = self.publisher.registry();
        let mut checked = 0;
        for (handle, open) in registry.live()? {
            if !self.awaits_fee_validation(&open) {
                continue;
            }
            let open = {
                let _guard = registry.lock_offer(handle).await?;
                let open = registry.get(handle)?;
                if !self.awaits_fee_validation(&open) {
                    continue;
                }
                registry.set_fee_validation_status(handle, FeeValidationStatus::Pending)?;
                open
            };
            let status = self.fee_validator.validate(open.offer().clone()).await;
            checked += 1;
            if let Err(e) = self.apply_fee_verdict(handle, &open, status).await {
                log::warn!("trigger: applying fee verdict for {} failed: {e}", open.id());
            }
        }
        Ok(checked)
    }

    async fn apply_fee_verdict(&self, handle: OfferHandle, open: &OpenOffer, status: ValidationStatus) -> Result<()> {
        let registry = self.publisher.registry();
        let _guard = registry.lock_offer(handle).await?;
        if registry.get(handle)?.state().is_terminal() {
            return Ok(());
        }
        match status {
            ValidationStatus::Passed => {
                log::debug!("trigger: maker fee of {} validated", open.id());
                registry.set_fee_validation_status(handle, FeeValidationStatus::Passed)?;
            }
            ValidationStatus::Failed(reason) => {
                log::warn!("trigger: maker fee of {} failed validation: {reason}", open.id());
                registry.set_fee_validation_status(handle, FeeValidationStatus::Failed)?;
                let change = registry.deactivate(handle, DeactivationReason::FeeValidationFailed)?;
                if change.is_some_and(|c| c.became_deactivated()) {
                    self.publisher.withdraw_current(handle).await?;
                }
            }
            ValidationStatus::Undetermined => {
                log::debug!("trigger: no verdict for {} yet", open.id());
                registry.set_fee_validation_status(handle, FeeValidationStatus::NotChecked)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usd(s: &str) -> Price {
        Price::parse(s, CurrencyCode::new("USD")).unwrap()
    }

    fn xmr(s: &str) -> Price {
        Price::parse(s, CurrencyCode::new("XMR")).unwrap()
    }

    #[test]
    fn fiat_sell_triggers_below() {
        let trigger = usd("100.00");
        assert!(!is_triggered(Direction::Sell, &trigger, &usd("101.00")));
        assert!(!is_triggered(Direction::Sell, &trigger, &usd("100.00")));
        assert!(is_triggered(Direction::Sell, &trigger, &usd("99.50")));
    }

    #[test]
    fn fiat_buy_triggers_above() {
        let trigger = usd("100.00");
        assert!(is_triggered(Direction::Buy, &trigger, &usd("100.01")));
        assert!(!is_triggered(Direction::Buy, &trigger, &usd("99.00")));
    }

    #[test]
    fn crypto_inverts_fiat() {
        let trigger = xmr("0.005");
        assert!(is_triggered(Direction::Sell, &trigger, &xmr("0.0051")));
        assert!(!is_triggered(Direction::Sell, &trigger, &xmr("0.0049")));
        assert!(is_triggered(Direction::Buy, &trigger, &xmr("0.0049")));
        assert!(!is_triggered(Direction::Buy, &trigger, &xmr("0.0051")));
    }

    #[test]
    fn zero_trigger_never_fires() {
        let zero = Price::zero(CurrencyCode::new("USD"));
        assert!(!is_triggered(Direction::Sell, &zero, &usd("1")));
        assert!(!is_triggered(Direction::Buy, &zero, &usd("1000000")));
    }

    #[test]
    fn mismatched_currency_never_fires() {
        assert!(!is_triggered(
            Direction::Sell,
            &usd("100"),
            &Price::parse("50", CurrencyCode::new("EUR")).unwrap()
        ));
    }
}
