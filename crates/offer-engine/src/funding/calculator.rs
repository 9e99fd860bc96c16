//! Funding arithmetic for BSQ atomic swaps.
//!
//! Fees are asymmetric so neither side needs an extra dust-sized input: the
//! BTC buyer folds the trade fee into their BSQ input and pays their miner
//! fee share out of the BTC they receive; the BTC seller folds their miner
//! fee share into their BTC input and pays the trade fee out of the BSQ they
//! receive.
//!
//! The seller's required input depends on the transaction size, which
//! depends on the inputs selected for that requirement. [`estimate_required`]
//! resolves the cycle by bounded fixed-point iteration.

use serde::{Deserialize, Serialize};

use crate::amount::{Amount, CurrencyCode};
use crate::config::FundingConfig;
use crate::error::{Error, Result};
use crate::offer::payload::{Direction, OfferPayload};
use crate::ports::{BalanceQuery, SelectedInput, SelectionError, UtxoSelector};

pub const TX_OVERHEAD_VSIZE: i64 = 5;
pub const SEGWIT_INPUT_VSIZE: i64 = 68;
pub const LEGACY_INPUT_VSIZE: i64 = 149;
/// Outputs when the transaction carries change.
pub const OUTPUTS_WITH_CHANGE_VSIZE: i64 = 62;
pub const OUTPUTS_WITHOUT_CHANGE_VSIZE: i64 = 31;

/// BSQ input of the BTC buyer: trade amount plus trade fee.
pub fn buyers_input(bsq_trade_amount: &Amount, trade_fee: &Amount) -> Result<Amount> {
    bsq_trade_amount.checked_add(trade_fee)
}

/// BTC input of the BTC seller: trade amount plus miner fee share.
pub fn sellers_input(btc_trade_amount: &Amount, tx_fee_share: &Amount) -> Result<Amount> {
    btc_trade_amount.checked_add(tx_fee_share)
}

/// BTC the buyer receives after paying their miner fee share.
pub fn buyers_payout(btc_trade_amount: &Amount, tx_fee_share: &Amount) -> Result<Amount> {
    btc_trade_amount.checked_sub(tx_fee_share)
}

/// BSQ the seller receives after paying the trade fee.
pub fn sellers_payout(bsq_trade_amount: &Amount, trade_fee: &Amount) -> Result<Amount> {
    bsq_trade_amount.checked_sub(trade_fee)
}

/// Virtual size of one side's share of the swap transaction. Change below
/// `dust_threshold` is left to the miner and gets no output.
pub fn estimate_vsize(inputs: &[SelectedInput], change: &Amount, dust_threshold: i64) -> i64 {
    let inputs: i64 = inputs
        .iter()
        .map(|input| {
            if input.is_segwit {
                SEGWIT_INPUT_VSIZE
            } else {
                LEGACY_INPUT_VSIZE
            }
        })
        .sum();
    let outputs = if change.value() > 0 && change.value() >= dust_threshold {
        OUTPUTS_WITH_CHANGE_VSIZE
    } else {
        OUTPUTS_WITHOUT_CHANGE_VSIZE
    };
    TX_OVERHEAD_VSIZE + inputs + outputs
}

/// One BSQ base unit is backed by one on-chain satoshi, so a BSQ fee offsets
/// the same number of sats of miner fee.
pub fn bsq_as_sats(amount: &Amount) -> Result<Amount> {
    if *amount.currency() == CurrencyCode::bsq() || *amount.currency() == CurrencyCode::btc() {
        Ok(Amount::sats(amount.value()))
    } else {
        Err(Error::CurrencyMismatch {
            left: CurrencyCode::bsq(),
            right: amount.currency().clone(),
        })
    }
}

/// Miner fee share of one side: `rate * vsize - trade_fee`. May be negative
/// when the trade fee already covers more than this side's share.
pub fn adjusted_tx_fee(fee_rate_per_vbyte: i64, vsize: i64, trade_fee: &Amount) -> Result<Amount> {
    let gross = fee_rate_per_vbyte
        .checked_mul(vsize)
        .ok_or(Error::ArithmeticOverflow)?;
    Amount::sats(gross).checked_sub(&bsq_as_sats(trade_fee)?)
}

/// Outcome of [`estimate_required`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingEstimate {
    pub required: Amount,
    pub vsize: i64,
    pub tx_fee: Amount,
    /// Selector calls made.
    pub iterations: u32,
    /// Two consecutive rounds agreed.
    pub converged: bool,
    /// Selection failed and `fallback_vsize` was used.
    pub used_fallback: bool,
}

/// Fixed-point estimate of a required input.
///
/// `required_for` maps a miner fee share to the input value it implies.
/// Starting from `seed_vsize`, each round selects inputs for the current
/// requirement, recomputes vsize from what was actually selected and derives
/// the next requirement. Stops when two rounds agree or after
/// `max_iterations`, keeping the last round either way. When the selector
/// reports insufficient funds the estimate uses `fallback_vsize` instead.
pub fn estimate_required<F>(
    selector: &dyn UtxoSelector,
    fee_rate_per_vbyte: i64,
    trade_fee: &Amount,
    cfg: &FundingConfig,
    required_for: F,
) -> Result<FundingEstimate>
where
    F: Fn(&Amount) -> Result<Amount>,
{
    let mut vsize = cfg.seed_vsize;
    let mut tx_fee = adjusted_tx_fee(fee_rate_per_vbyte, vsize, trade_fee)?;
    let mut required = required_for(&tx_fee)?;
    let mut iterations = 0;

    while iterations < cfg.max_iterations {
        iterations += 1;
        let selection = match selector.select(&required) {
            Ok(selection) => selection,
            Err(SelectionError::InsufficientFunds { available, .. }) => {
                let tx_fee = adjusted_tx_fee(fee_rate_per_vbyte, cfg.fallback_vsize, trade_fee)?;
                let required = required_for(&tx_fee)?;
                log::debug!(
                    "funding: selection failed ({available} available), fallback estimate {required}"
                );
                return Ok(FundingEstimate {
                    required,
                    vsize: cfg.fallback_vsize,
                    tx_fee,
                    iterations,
                    converged: false,
                    used_fallback: true,
                });
            }
        };
        let next_vsize = estimate_vsize(&selection.inputs, &selection.change, cfg.dust_threshold_sats);
        let next_fee = adjusted_tx_fee(fee_rate_per_vbyte, next_vsize, trade_fee)?;
        let next_required = required_for(&next_fee)?;
        let converged = next_required == required;
        vsize = next_vsize;
        tx_fee = next_fee;
        required = next_required;
        if converged {
            return Ok(FundingEstimate {
                required,
                vsize,
                tx_fee,
                iterations,
                converged: true,
                used_fallback: false,
            });
        }
    }

    log::debug!("funding: no fixed point after {iterations} rounds, keeping {required}");
    Ok(FundingEstimate {
        required,
        vsize,
        tx_fee,
        iterations,
        converged: false,
        used_fallback: false,
    })
}

/// Funding picture of one swap offer from the maker's side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapFundingState {
    /// Maker's direction on BTC.
    pub direction: Direction,
    pub btc_amount: Amount,
    pub bsq_amount: Amount,
    /// Maker's trade fee, in BSQ.
    pub trade_fee: Amount,
    pub estimate: FundingEstimate,
    /// Balance of the asset the maker must fund.
    pub balance: Amount,
    pub missing_funds: Amount,
}

impl SwapFundingState {
    /// Evaluate `offer` (at its maximum amount) against the maker's wallet.
    pub fn compute(
        offer: &OfferPayload,
        balances: &dyn BalanceQuery,
        btc_selector: &dyn UtxoSelector,
        bsq_selector: &dyn UtxoSelector,
        fee_rate_per_vbyte: i64,
        cfg: &FundingConfig,
    ) -> Result<Self> {
        let btc_amount = Amount::sats(offer.amount);
        let bsq_amount = offer.price.volume_for(offer.amount)?;
        let trade_fee = offer.maker_fee.clone();

        let (estimate, asset) = match offer.direction {
            Direction::Sell => {
                let estimate = estimate_required(btc_selector, fee_rate_per_vbyte, &trade_fee, cfg, |fee| {
                    sellers_input(&btc_amount, fee)
                })?;
                (estimate, CurrencyCode::btc())
            }
            Direction::Buy => {
                // The BSQ requirement does not depend on size; selection only
                // sizes the payout deduction.
                let estimate = estimate_required(bsq_selector, fee_rate_per_vbyte, &trade_fee, cfg, |_| {
                    buyers_input(&bsq_amount, &trade_fee)
                })?;
                (estimate, CurrencyCode::bsq())
            }
        };
        let balance = balances.get_balance(&asset);
        let missing_funds = estimate.required.shortfall_against(&balance)?;
        Ok(Self {
            direction: offer.direction,
            btc_amount,
            bsq_amount,
            trade_fee,
            estimate,
            balance,
            missing_funds,
        })
    }

    pub fn required(&self) -> &Amount {
        &self.estimate.required
    }

    pub fn has_missing_funds(&self) -> bool {
        self.missing_funds.is_positive()
    }

    /// What the maker receives: BSQ when selling BTC, BTC when buying it.
    pub fn maker_payout(&self) -> Result<Amount> {
        match self.direction {
            Direction::Sell => sellers_payout(&self.bsq_amount, &self.trade_fee),
            Direction::Buy => buyers_payout(&self.btc_amount, &self.estimate.tx_fee),
        }
    }
}
