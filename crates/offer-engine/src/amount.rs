//! Fixed-point monetary primitives.
//!
//! Every amount is an integer count of the currency's smallest unit plus a
//! currency tag. Arithmetic between different currencies fails with
//! [`Error::CurrencyMismatch`]; nothing in this module touches floating point.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Satoshis per BTC.
pub const COIN: i64 = 100_000_000;

/// Basis point denominator.
pub const BPS_DENOM: i64 = 10_000;

pub const BTC: &str = "BTC";
pub const BSQ: &str = "BSQ";

/// Crypto currency codes known to the engine. Anything else is treated as fiat.
const CRYPTO_CODES: &[&str] = &[
    BTC, BSQ, "XMR", "ETH", "LTC", "L-BTC", "DASH", "ZEC", "DOGE", "DCR", "GRIN", "BCH",
];

/// Whether a currency is fiat-like or crypto-like.
///
/// Prices for fiat markets are quoted as counter units per BTC; prices for
/// crypto markets are quoted as BTC per counter unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    Fiat,
    Crypto,
}

impl AssetClass {
    /// Decimal places of a price quoted in this asset class.
    pub fn price_precision(self) -> u32 {
        match self {
            AssetClass::Fiat => 4,
            AssetClass::Crypto => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CurrencyCode(String);

impl CurrencyCode {
    pub fn new(code: &str) -> Self {
        Self(code.trim().to_ascii_uppercase())
    }

    pub fn btc() -> Self {
        Self(BTC.to_string())
    }

    pub fn bsq() -> Self {
        Self(BSQ.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn asset_class(&self) -> AssetClass {
        if CRYPTO_CODES.contains(&self.0.as_str()) {
            AssetClass::Crypto
        } else {
            AssetClass::Fiat
        }
    }

    pub fn is_fiat(&self) -> bool {
        self.asset_class() == AssetClass::Fiat
    }

    /// Decimal places of one smallest unit of this currency.
    pub fn decimals(&self) -> u32 {
        match self.0.as_str() {
            BSQ => 2,
            _ => match self.asset_class() {
                AssetClass::Fiat => 4,
                AssetClass::Crypto => 8,
            },
        }
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CurrencyCode {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

/// An integer amount of a currency's smallest unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Amount {
    value: i64,
    currency: CurrencyCode,
}

impl Amount {
    pub fn new(value: i64, currency: CurrencyCode) -> Self {
        Self { value, currency }
    }

    pub fn zero(currency: CurrencyCode) -> Self {
        Self::new(0, currency)
    }

    /// An amount of BTC satoshis.
    pub fn sats(value: i64) -> Self {
        Self::new(value, CurrencyCode::btc())
    }

    /// An amount of BSQ base units (1/100 BSQ).
    pub fn bsq(value: i64) -> Self {
        Self::new(value, CurrencyCode::bsq())
    }

    /// Parse a decimal string using the currency's own precision.
    pub fn parse(s: &str, currency: CurrencyCode) -> Result<Self> {
        let value = parse_decimal(s, currency.decimals())?;
        Ok(Self::new(value, currency))
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    pub fn currency(&self) -> &CurrencyCode {
        &self.currency
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0
    }

    pub fn is_positive(&self) -> bool {
        self.value > 0
    }

    pub fn is_negative(&self) -> bool {
        self.value < 0
    }

    fn ensure_same_currency(&self, other: &Amount) -> Result<()> {
        if self.currency != other.currency {
            return Err(Error::CurrencyMismatch {
                left: self.currency.clone(),
                right: other.currency.clone(),
            });
        }
        Ok(())
    }

    pub fn checked_add(&self, other: &Amount) -> Result<Amount> {
        self.ensure_same_currency(other)?;
        let value = self
            .value
            .checked_add(other.value)
            .ok_or(Error::ArithmeticOverflow)?;
        Ok(Amount::new(value, self.currency.clone()))
    }

    pub fn checked_sub(&self, other: &Amount) -> Result<Amount> {
        self.ensure_same_currency(other)?;
        let value = self
            .value
            .checked_sub(other.value)
            .ok_or(Error::ArithmeticOverflow)?;
        Ok(Amount::new(value, self.currency.clone()))
    }

    /// `self - other`, floored at zero. Used for shortfall figures.
    pub fn shortfall_against(&self, available: &Amount) -> Result<Amount> {
        let diff = self.checked_sub(available)?;
        Ok(Amount::new(diff.value.max(0), self.currency.clone()))
    }

    pub fn max(&self, other: &Amount) -> Result<Amount> {
        self.ensure_same_currency(other)?;
        Ok(Amount::new(self.value.max(other.value), self.currency.clone()))
    }

    /// `self * bps / 10_000`, rounded toward zero.
    pub fn scale_bps(&self, bps: i64) -> Result<Amount> {
        let scaled = i128::from(self.value) * i128::from(bps) / i128::from(BPS_DENOM);
        let value = i64::try_from(scaled).map_err(|_| Error::ArithmeticOverflow)?;
        Ok(Amount::new(value, self.currency.clone()))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            format_decimal(self.value, self.currency.decimals()),
            self.currency
        )
    }
}

/// A price in fixed-point units of the market's price precision.
///
/// For fiat markets the value is counter units per BTC with 4 decimals. For
/// crypto markets it is BTC per counter unit with 8 decimals.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Price {
    value: i64,
    currency: CurrencyCode,
}

impl Price {
    pub fn new(value: i64, currency: CurrencyCode) -> Self {
        Self { value, currency }
    }

    pub fn zero(currency: CurrencyCode) -> Self {
        Self::new(0, currency)
    }

    pub fn parse(s: &str, currency: CurrencyCode) -> Result<Self> {
        let value = parse_decimal(s, currency.asset_class().price_precision())?;
        Ok(Self::new(value, currency))
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    pub fn currency(&self) -> &CurrencyCode {
        &self.currency
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0
    }

    /// Counter-currency volume for `amount_sats` of BTC at this price.
    pub fn volume_for(&self, amount_sats: i64) -> Result<Amount> {
        if self.value <= 0 {
            return Err(Error::InvalidPrice);
        }
        let amount = i128::from(amount_sats);
        let price = i128::from(self.value);
        let raw = match self.currency.asset_class() {
            // counter units (4 decimals) = sats * price / COIN
            AssetClass::Fiat => rescale(amount * price / i128::from(COIN), 4, self.currency.decimals()),
            // counter units (8 decimals) = sats * COIN / price
            AssetClass::Crypto => rescale(amount * i128::from(COIN) / price, 8, self.currency.decimals()),
        };
        let value = i64::try_from(raw).map_err(|_| Error::ArithmeticOverflow)?;
        Ok(Amount::new(value, self.currency.clone()))
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            format_decimal(self.value, self.currency.asset_class().price_precision()),
            self.currency
        )
    }
}

/// Move a fixed-point value between decimal precisions, rounding half up
/// when precision is lost.
fn rescale(value: i128, from: u32, to: u32) -> i128 {
    if to >= from {
        value * 10i128.pow(to - from)
    } else {
        let div = 10i128.pow(from - to);
        let half = div / 2;
        if value >= 0 {
            (value + half) / div
        } else {
            (value - half) / div
        }
    }
}

/// Parse a decimal string (`"-12.34"`) into a fixed-point integer with
/// `decimals` places. More fractional digits than `decimals` is an error.
pub fn parse_decimal(s: &str, decimals: u32) -> Result<i64> {
    let invalid = || Error::InvalidDecimal(s.to_string());
    let trimmed = s.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(invalid());
    }
    if !int_part.chars().all(|c| c.is_ascii_digit())
        || !frac_part.chars().all(|c| c.is_ascii_digit())
        || frac_part.len() > decimals as usize
    {
        return Err(invalid());
    }

    let scale = 10i64.pow(decimals);
    let int_value: i64 = if int_part.is_empty() {
        0
    } else {
        int_part.parse().map_err(|_| invalid())?
    };
    let mut frac_value: i64 = 0;
    if !frac_part.is_empty() {
        frac_value = frac_part.parse().map_err(|_| invalid())?;
        frac_value *= 10i64.pow(decimals - frac_part.len() as u32);
    }
    let value = int_value
        .checked_mul(scale)
        .and_then(|v| v.checked_add(frac_value))
        .ok_or(Error::ArithmeticOverflow)?;
    Ok(if negative { -value } else { value })
}

/// Render a fixed-point integer with exactly `decimals` places.
pub fn format_decimal(value: i64, decimals: u32) -> String {
    if decimals == 0 {
        return value.to_string();
    }
    let scale = 10u64.pow(decimals);
    let sign = if value < 0 { "-" } else { "" };
    let abs = value.unsigned_abs();
    format!(
        "{sign}{}.{:0width$}",
        abs / scale,
        abs % scale,
        width = decimals as usize
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_decimal_pads_fraction() {
        assert_eq!(parse_decimal("100.00", 4).unwrap(), 1_000_000);
        assert_eq!(parse_decimal("99.5", 4).unwrap(), 995_000);
        assert_eq!(parse_decimal("-0.01", 2).unwrap(), -1);
        assert_eq!(parse_decimal(".5", 2).unwrap(), 50);
        assert_eq!(parse_decimal("7", 8).unwrap(), 700_000_000);
    }

    #[test]
    fn parse_decimal_rejects_garbage() {
        assert!(parse_decimal("", 4).is_err());
        assert!(parse_decimal("1.23456", 4).is_err());
        assert!(parse_decimal("1e5", 4).is_err());
        assert!(parse_decimal("--1", 4).is_err());
        assert!(parse_decimal(".", 4).is_err());
    }

    #[test]
    fn format_decimal_renders_sign_and_padding() {
        assert_eq!(format_decimal(995_000, 4), "99.5000");
        assert_eq!(format_decimal(-1, 2), "-0.01");
        assert_eq!(format_decimal(42, 0), "42");
    }

    #[test]
    fn currency_classes() {
        assert!(CurrencyCode::new("usd").is_fiat());
        assert_eq!(CurrencyCode::new("usd").as_str(), "USD");
        assert_eq!(CurrencyCode::bsq().asset_class(), AssetClass::Crypto);
        assert_eq!(CurrencyCode::bsq().decimals(), 2);
        assert_eq!(CurrencyCode::new("XMR").decimals(), 8);
        assert_eq!(CurrencyCode::new("EUR").decimals(), 4);
    }

    #[test]
    fn mismatched_currencies_fail_fast() {
        let err = Amount::sats(1).checked_add(&Amount::bsq(1)).unwrap_err();
        assert_eq!(
            err,
            Error::CurrencyMismatch {
                left: CurrencyCode::btc(),
                right: CurrencyCode::bsq(),
            }
        );
        assert!(Amount::sats(1).checked_sub(&Amount::bsq(1)).is_err());
    }

    #[test]
    fn shortfall_is_floored_at_zero() {
        let need = Amount::sats(1_000);
        assert_eq!(need.shortfall_against(&Amount::sats(400)).unwrap().value(), 600);
        assert_eq!(need.shortfall_against(&Amount::sats(5_000)).unwrap().value(), 0);
    }

    #[test]
    fn fiat_volume() {
        // 0.5 BTC at 20_000.00 USD
        let price = Price::parse("20000", CurrencyCode::new("USD")).unwrap();
        let volume = price.volume_for(COIN / 2).unwrap();
        assert_eq!(volume.value(), 10_000 * 10_000);
        assert_eq!(volume.to_string(), "10000.0000 USD");
    }

    #[test]
    fn bsq_volume_rounds_to_two_decimals() {
        // 1 BSQ = 0.00004 BTC, so 0.01 BTC buys 250 BSQ
        let price = Price::parse("0.00004", CurrencyCode::bsq()).unwrap();
        let volume = price.volume_for(1_000_000).unwrap();
        assert_eq!(volume, Amount::bsq(25_000));
    }

    #[test]
    fn zero_price_has_no_volume() {
        let price = Price::zero(CurrencyCode::new("USD"));
        assert_eq!(price.volume_for(COIN), Err(Error::InvalidPrice));
    }

    #[test]
    fn scale_bps_rounds_toward_zero() {
        assert_eq!(Amount::sats(1_000_001).scale_bps(1_500).unwrap().value(), 150_000);
    }
}
