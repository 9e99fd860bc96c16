use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::amount::{Amount, CurrencyCode, Price};
use crate::pow::ProofOfWork;

/// Payment method id carried by atomic swap offers.
pub const BSQ_SWAP_PAYMENT_METHOD: &str = "BSQ_SWAP";

/// Whether the maker buys or sells the base asset (BTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
        }
    }

    pub fn is_sell(self) -> bool {
        self == Direction::Sell
    }
}

/// Offer identifier: a random base plus a mutation counter.
///
/// The counter is bumped whenever the offer must be republished under a new
/// id (proof-of-work redo). `base_1`, `base_2`, ... are never reused within a
/// lineage, so two in-flight versions of one logical offer never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct OfferId {
    base: String,
    mutation: u32,
}

impl OfferId {
    /// Fresh random id: `<8 alphanumerics>-<32 hex chars>`.
    pub fn random() -> Self {
        let prefix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let body: [u8; 16] = rand::random();
        Self {
            base: format!("{prefix}-{}", hex::encode(body)),
            mutation: 0,
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn mutation(&self) -> u32 {
        self.mutation
    }

    /// The id this offer is republished under after its next mutation.
    pub fn next_mutation(&self) -> Self {
        Self {
            base: self.base.clone(),
            mutation: self.mutation + 1,
        }
    }
}

impl fmt::Display for OfferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.mutation == 0 {
            f.write_str(&self.base)
        } else {
            write!(f, "{}_{}", self.base, self.mutation)
        }
    }
}

impl FromStr for OfferId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("empty offer id".into());
        }
        if let Some((base, counter)) = s.rsplit_once('_')
            && let Ok(mutation) = counter.parse::<u32>()
        {
            if base.is_empty() {
                return Err(format!("invalid offer id: {s}"));
            }
            return Ok(Self {
                base: base.to_string(),
                mutation,
            });
        }
        Ok(Self {
            base: s.to_string(),
            mutation: 0,
        })
    }
}

impl From<OfferId> for String {
    fn from(id: OfferId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for OfferId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// The broadcast form of an offer. Never mutated after its hash is taken;
/// edits and id mutations build a new payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub id: OfferId,
    /// Creation time, milliseconds since the unix epoch.
    pub date: u64,
    pub direction: Direction,
    pub base_currency: CurrencyCode,
    pub counter_currency: CurrencyCode,
    /// Fixed price, or zero when `use_market_based_price` is set.
    pub price: Price,
    /// Signed margin over the market price, in basis points.
    pub market_price_margin_bps: i64,
    pub use_market_based_price: bool,
    /// Maximum trade amount in sats.
    pub amount: i64,
    /// Minimum trade amount in sats.
    pub min_amount: i64,
    pub payment_method_id: String,
    pub maker_address: String,
    pub buyer_security_deposit: i64,
    pub seller_security_deposit: i64,
    pub maker_fee: Amount,
    pub tx_fee: i64,
    pub protocol_version: u32,
    pub app_version: String,
    pub extra_data: BTreeMap<String, String>,
    pub proof_of_work: Option<ProofOfWork>,
    pub maker_fee_tx_id: Option<String>,
}

impl OfferPayload {
    pub fn is_swap_offer(&self) -> bool {
        self.payment_method_id == BSQ_SWAP_PAYMENT_METHOD
    }

    /// Currency the offer's price and volume are denominated in.
    pub fn currency(&self) -> &CurrencyCode {
        &self.counter_currency
    }

    /// Copy of this payload republished under `id` with a fresh proof.
    pub fn with_new_id(&self, id: OfferId, proof_of_work: Option<ProofOfWork>) -> Self {
        Self {
            id,
            proof_of_work,
            ..self.clone()
        }
    }

    /// SHA-256 over the payload's hashed fields.
    ///
    /// The field order below is a wire contract shared with peers holding
    /// older copies of the same offer. Never reorder or interleave; new fields
    /// are appended at the end.
    ///
    /// ```text
    /// hash = SHA256(
    ///     "offer/payload"        ||
    ///     id                     ||  str
    ///     date                   ||  u64
    ///     direction              ||  str
    ///     base_currency          ||  str
    ///     counter_currency       ||  str
    ///     price                  ||  i64
    ///     market_price_margin    ||  i64
    ///     use_market_based_price ||  u8
    ///     amount                 ||  i64
    ///     min_amount             ||  i64
    ///     payment_method_id      ||  str
    ///     maker_address          ||  str
    ///     buyer_security_deposit ||  i64
    ///     seller_security_deposit||  i64
    ///     maker_fee              ||  i64, str
    ///     tx_fee                 ||  i64
    ///     protocol_version       ||  u32
    ///     app_version            ||  str
    ///     extra_data             ||  u32 count, (str, str)*
    ///     proof_of_work          ||  u8 tag [, nonce u64, difficulty u8]
    ///     maker_fee_tx_id        ||  u8 tag [, str]
    /// )
    /// ```
    /// Integers are big-endian; `str` is a u32 big-endian length then UTF-8.
    pub fn content_hash(&self) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(b"offer/payload");
        put_str(&mut h, &self.id.to_string());
        h.update(self.date.to_be_bytes());
        put_str(&mut h, self.direction.as_str());
        put_str(&mut h, self.base_currency.as_str());
        put_str(&mut h, self.counter_currency.as_str());
        h.update(self.price.value().to_be_bytes());
        h.update(self.market_price_margin_bps.to_be_bytes());
        h.update([u8::from(self.use_market_based_price)]);
        h.update(self.amount.to_be_bytes());
        h.update(self.min_amount.to_be_bytes());
        put_str(&mut h, &self.payment_method_id);
        put_str(&mut h, &self.maker_address);
        h.update(self.buyer_security_deposit.to_be_bytes());
        h.update(self.seller_security_deposit.to_be_bytes());
        h.update(self.maker_fee.value().to_be_bytes());
        put_str(&mut h, self.maker_fee.currency().as_str());
        h.update(self.tx_fee.to_be_bytes());
        h.update(self.protocol_version.to_be_bytes());
        put_str(&mut h, &self.app_version);
        h.update((self.extra_data.len() as u32).to_be_bytes());
        for (k, v) in &self.extra_data {
            put_str(&mut h, k);
            put_str(&mut h, v);
        }
        // Appended fields.
        match &self.proof_of_work {
            Some(pow) => {
                h.update([1u8]);
                h.update(pow.nonce.to_be_bytes());
                h.update([pow.difficulty]);
            }
            None => h.update([0u8]),
        }
        match &self.maker_fee_tx_id {
            Some(txid) => {
                h.update([1u8]);
                put_str(&mut h, txid);
            }
            None => h.update([0u8]),
        }
        h.finalize().into()
    }

    pub fn content_hash_hex(&self) -> String {
        hex::encode(self.content_hash())
    }
}

fn put_str(h: &mut Sha256, s: &str) {
    h.update((s.len() as u32).to_be_bytes());
    h.update(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> OfferPayload {
        OfferPayload {
            id: "abc".parse().unwrap(),
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

    #[test]
    fn offer_id_mutation_suffix() {
        let id: OfferId = "Xy12abCD-00ff".parse().unwrap();
        assert_eq!(id.mutation(), 0);
        assert_eq!(id.to_string(), "Xy12abCD-00ff");
        let next = id.next_mutation();
        assert_eq!(next.to_string(), "Xy12abCD-00ff_1");
        let parsed: OfferId = "Xy12abCD-00ff_1".parse().unwrap();
        assert_eq!(parsed, next);
        assert_eq!(parsed.next_mutation().to_string(), "Xy12abCD-00ff_2");
    }

    #[test]
    fn offer_id_non_numeric_suffix_is_part_of_base() {
        let id: OfferId = "a_b".parse().unwrap();
        assert_eq!(id.base(), "a_b");
        assert_eq!(id.mutation(), 0);
        assert!("".parse::<OfferId>().is_err());
        assert!("_3".parse::<OfferId>().is_err());
    }

    #[test]
    fn random_ids_are_distinct() {
        let a = OfferId::random();
        let b = OfferId::random();
        assert_ne!(a, b);
        assert_eq!(a.base().len(), 8 + 1 + 32);
    }

    #[test]
    fn offer_id_serializes_as_string() {
        let id: OfferId = "abc_4".parse().unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc_4\"");
        let back: OfferId = serde_json::from_str("\"abc_4\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn content_hash_golden_vector() {
        // Frozen: a change here breaks hash compatibility with existing peers.
        assert_eq!(sample().content_hash_hex(), GOLDEN_HASH);
    }

    #[test]
    fn content_hash_covers_fields() {
        let base = sample().content_hash();
        let mut p = sample();
        p.market_price_margin_bps = 151;
        assert_ne!(p.content_hash(), base);

        let mut p = sample();
        p.extra_data.insert("k".into(), "v".into());
        assert_ne!(p.content_hash(), base);

        let mut p = sample();
        p.maker_fee_tx_id = Some("txid".into());
        assert_ne!(p.content_hash(), base);
    }

    #[test]
    fn with_new_id_keeps_everything_else() {
        let p = sample();
        let next = p.with_new_id(p.id.next_mutation(), None);
        assert_eq!(next.id.to_string(), "abc_1");
        assert_eq!(next.date, p.date);
        assert_eq!(next.extra_data, p.extra_data);
        assert_ne!(next.content_hash(), p.content_hash());
    }

    const GOLDEN_HASH: &str = "3d39afbeb0f5966cbb759df7ada39f9b0aff4e63b7b74e77e1c88dd863d4653f";
}
