use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::amount::{Amount, BPS_DENOM, COIN};
use crate::error::{Error, Result};

/// Engine-wide configuration. Every field has a default, so a JSON document
/// only needs to name what it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a RESERVED offer waits for settlement before it is reset.
    pub reservation_timeout_secs: u64,
    pub protocol_version: u32,
    pub app_version: String,
    /// Network address the maker is reachable at; bound into proofs of work.
    pub maker_address: String,
    /// Difficulty assumed until the host reports one.
    pub initial_pow_difficulty: u8,
    pub funding: FundingConfig,
    pub fees: FeeConfig,
    pub limits: OfferLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reservation_timeout_secs: 60,
            protocol_version: 1,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            maker_address: "localhost:9999".to_string(),
            initial_pow_difficulty: 8,
            funding: FundingConfig::default(),
            fees: FeeConfig::default(),
            limits: OfferLimits::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    pub fn reservation_timeout(&self) -> Duration {
        Duration::from_secs(self.reservation_timeout_secs)
    }

    /// Reject settings no offer could be created under.
    pub fn validate(&self) -> Result<()> {
        if self.reservation_timeout_secs == 0 {
            return Err(Error::InvalidConfig("reservation timeout must be positive".into()));
        }
        if self.funding.max_iterations == 0 {
            return Err(Error::InvalidConfig("funding.max_iterations must be positive".into()));
        }
        if self.funding.seed_vsize <= 0 || self.funding.fallback_vsize <= 0 {
            return Err(Error::InvalidConfig("funding vsizes must be positive".into()));
        }
        let limits = &self.limits;
        if limits.min_security_deposit_bps > limits.max_security_deposit_bps {
            return Err(Error::InvalidConfig(
                "limits.min_security_deposit_bps exceeds the maximum".into(),
            ));
        }
        if limits.max_trade_amount_sats <= 0 {
            return Err(Error::InvalidConfig("limits.max_trade_amount_sats must be positive".into()));
        }
        if self.maker_address.is_empty() {
            return Err(Error::InvalidConfig("maker_address is empty".into()));
        }
        Ok(())
    }
}

/// Parameters of the swap funding estimate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FundingConfig {
    /// Upper bound on fixed-point rounds.
    pub max_iterations: u32,
    /// Change below this is dropped and goes to the miner.
    pub dust_threshold_sats: i64,
    /// Starting size: one segwit input, no change (5 + 68 + 31).
    pub seed_vsize: i64,
    /// Used when the wallet cannot select inputs: three legacy inputs plus
    /// change (5 + 3 * 149 + 62).
    pub fallback_vsize: i64,
}

impl Default for FundingConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            dust_threshold_sats: 546,
            seed_vsize: 104,
            fallback_vsize: 514,
        }
    }
}

/// Trade fee schedule. Rates are per whole BTC of trade amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    pub maker_fee_btc_per_btc: i64,
    pub min_fee_btc: i64,
    /// BSQ base units (1/100 BSQ) per BTC.
    pub maker_fee_bsq_per_btc: i64,
    pub min_fee_bsq: i64,
    /// Size of the maker fee transaction of a non-swap offer.
    pub maker_fee_tx_vsize: i64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            maker_fee_btc_per_btc: 100_000,
            min_fee_btc: 5_000,
            maker_fee_bsq_per_btc: 2_500,
            min_fee_bsq: 100,
            maker_fee_tx_vsize: 175,
        }
    }
}

impl FeeConfig {
    /// Maker fee for a trade of `amount_sats`, charged in BSQ or BTC.
    pub fn maker_fee(&self, amount_sats: i64, in_bsq: bool) -> Result<Amount> {
        if in_bsq {
            scaled_fee(amount_sats, self.maker_fee_bsq_per_btc, self.min_fee_bsq).map(Amount::bsq)
        } else {
            scaled_fee(amount_sats, self.maker_fee_btc_per_btc, self.min_fee_btc).map(Amount::sats)
        }
    }
}

fn scaled_fee(amount_sats: i64, per_btc: i64, min: i64) -> Result<i64> {
    let fee = i128::from(amount_sats) * i128::from(per_btc) / i128::from(COIN);
    let fee = i64::try_from(fee).map_err(|_| Error::ArithmeticOverflow)?;
    Ok(fee.max(min))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfferLimits {
    pub max_trade_amount_sats: i64,
    pub min_security_deposit_bps: i64,
    pub max_security_deposit_bps: i64,
    pub min_security_deposit_sats: i64,
    pub seller_security_deposit_bps: i64,
    /// Largest accepted |margin| for market-based offers.
    pub max_market_price_margin_bps: i64,
}

impl Default for OfferLimits {
    fn default() -> Self {
        Self {
            max_trade_amount_sats: 200_000_000,
            min_security_deposit_bps: 1_500,
            max_security_deposit_bps: 5_000,
            min_security_deposit_sats: 600_000,
            seller_security_deposit_bps: 1_500,
            max_market_price_margin_bps: 5_000,
        }
    }
}

impl OfferLimits {
    /// Deposit for `amount_sats` at `bps`, floored at the minimum deposit.
    pub fn security_deposit(&self, amount_sats: i64, bps: i64) -> Result<i64> {
        let deposit = i128::from(amount_sats) * i128::from(bps) / i128::from(BPS_DENOM);
        let deposit = i64::try_from(deposit).map_err(|_| Error::ArithmeticOverflow)?;
        Ok(deposit.max(self.min_security_deposit_sats))
    }
}
