use std::collections::BTreeMap;
use std::sync::Arc;

use offer_engine::testing::{TestHarness, drain_events};
use offer_engine::{
    CreateOfferRequest, CurrencyCode, DeactivationReason, Direction, EngineConfig, Error,
    FeeValidationStatus, OfferEvent, OfferId, OfferNode, OpenOfferState, Price, Pricing,
    ValidationStatus,
};
use tokio::sync::broadcast;

fn usd() -> CurrencyCode {
    CurrencyCode::new("USD")
}

fn price(s: &str) -> Price {
    Price::parse(s, usd()).unwrap()
}

fn node(harness: &TestHarness) -> (Arc<OfferNode>, broadcast::Receiver<OfferEvent>) {
    let config = EngineConfig {
        initial_pow_difficulty: 4,
        ..EngineConfig::default()
    };
    let (node, rx) = OfferNode::new(config, harness.ports()).expect("node should start");
    (Arc::new(node), rx)
}

async fn market_offer(node: &OfferNode, direction: Direction, trigger: &str) -> OfferId {
    let request = CreateOfferRequest {
        direction,
        currency: usd(),
        min_amount: 5_000_000,
        amount: 10_000_000,
        pricing: Pricing::MarketMargin { margin_bps: 100 },
        buyer_security_deposit_bps: 1_500,
        fee_currency: CurrencyCode::btc(),
        payment_method_id: "ZELLE".into(),
        trigger_price: Some(price(trigger)),
        extra_data: BTreeMap::new(),
    };
    node.create_offer(request).await.unwrap().id
}

#[tokio::test]
async fn sell_offer_deactivates_only_once_price_falls_through() {
    let harness = TestHarness::new();
    let (node, mut rx) = node(&harness);
    let id = market_offer(&node, Direction::Sell, "100.00").await;
    drain_events(&mut rx);

    harness.prices.set_price(price("101.00"));
    assert!(node.on_price_updated(&usd()).await.unwrap().is_empty());
    assert!(node.offer(&id).unwrap().is_available());

    harness.prices.set_price(price("99.50"));
    assert_eq!(node.on_price_updated(&usd()).await.unwrap(), vec![id.clone()]);
    let open = node.offer(&id).unwrap();
    assert_eq!(open.state(), OpenOfferState::Deactivated);
    assert!(open.has_reason(DeactivationReason::TriggerPrice));
    assert!(!harness.book.is_listed(&id));

    let events = drain_events(&mut rx);
    assert!(events.contains(&OfferEvent::Deactivated {
        id: id.clone(),
        reason: DeactivationReason::TriggerPrice,
        message: DeactivationReason::TriggerPrice.describe().to_string(),
    }));

    // Recovery does not reactivate on its own.
    harness.prices.set_price(price("120.00"));
    assert!(node.on_price_updated(&usd()).await.unwrap().is_empty());
    assert_eq!(node.offer(&id).unwrap().state(), OpenOfferState::Deactivated);
    assert_eq!(harness.book.withdrawals_of(&id), 1);
}

#[tokio::test]
async fn buy_offer_triggers_on_a_rise() {
    let harness = TestHarness::new();
    let (node, _rx) = node(&harness);
    let id = market_offer(&node, Direction::Buy, "100.00").await;

    harness.prices.set_price(price("99.00"));
    assert!(node.on_price_updated(&usd()).await.unwrap().is_empty());
    harness.prices.set_price(price("100.01"));
    assert_eq!(node.on_price_updated(&usd()).await.unwrap(), vec![id]);
}

#[tokio::test]
async fn stale_and_foreign_quotes_are_ignored() {
    let harness = TestHarness::new();
    let (node, _rx) = node(&harness);
    let id = market_offer(&node, Direction::Sell, "100.00").await;

    harness.prices.set_stale_price(price("50.00"));
    assert!(node.on_price_updated(&usd()).await.unwrap().is_empty());

    let eur = CurrencyCode::new("EUR");
    harness.prices.set_price(Price::parse("50.00", eur.clone()).unwrap());
    assert!(node.on_price_updated(&eur).await.unwrap().is_empty());
    assert!(node.offer(&id).unwrap().is_available());
}

#[tokio::test]
async fn user_can_reactivate_after_the_market_recovers() {
    let harness = TestHarness::new();
    let (node, _rx) = node(&harness);
    let id = market_offer(&node, Direction::Sell, "100.00").await;

    harness.prices.set_price(price("99.00"));
    node.on_price_updated(&usd()).await.unwrap();
    let err = node.activate_offer(&id).await.unwrap_err();
    assert_eq!(err.engine(), Some(&Error::TriggerPriceReached));

    harness.prices.set_price(price("105.00"));
    node.activate_offer(&id).await.unwrap();
    assert!(node.offer(&id).unwrap().is_available());
    assert_eq!(harness.book.publishes_of(&id), 2);
}

// ── Maker fee validation ────────────────────────────────────────────────

#[tokio::test]
async fn failed_fee_validation_deactivates() {
    let harness = TestHarness::new();
    let (node, mut rx) = node(&harness);
    let id = market_offer(&node, Direction::Sell, "0").await;
    drain_events(&mut rx);

    harness
        .validator
        .set_status(ValidationStatus::Failed("fee tx not in mempool".into()));
    assert_eq!(node.on_offer_list_changed().await.unwrap(), 1);

    let open = node.offer(&id).unwrap();
    assert_eq!(open.fee_validation_status(), FeeValidationStatus::Failed);
    assert!(open.has_reason(DeactivationReason::FeeValidationFailed));
    assert!(!harness.book.is_listed(&id));

    let err = node.activate_offer(&id).await.unwrap_err();
    assert_eq!(
        err.engine(),
        Some(&Error::ActivationBlocked {
            reasons: vec![DeactivationReason::FeeValidationFailed]
        })
    );

    let events = drain_events(&mut rx);
    assert!(events.contains(&OfferEvent::FeeValidated {
        id,
        status: FeeValidationStatus::Failed,
    }));
}

#[tokio::test]
async fn passed_offers_are_checked_once() {
    let harness = TestHarness::new();
    let (node, _rx) = node(&harness);
    let id = market_offer(&node, Direction::Sell, "0").await;

    assert_eq!(node.on_offer_list_changed().await.unwrap(), 1);
    assert_eq!(node.on_offer_list_changed().await.unwrap(), 0);
    assert_eq!(harness.validator.calls(), 1);
    let open = node.offer(&id).unwrap();
    assert_eq!(open.fee_validation_status(), FeeValidationStatus::Passed);
    assert!(open.is_available());
}

#[tokio::test]
async fn undetermined_verdicts_are_retried() {
    let harness = TestHarness::new();
    let (node, _rx) = node(&harness);
    let id = market_offer(&node, Direction::Sell, "0").await;

    harness.validator.set_status(ValidationStatus::Undetermined);
    node.on_offer_list_changed().await.unwrap();
    assert_eq!(
        node.offer(&id).unwrap().fee_validation_status(),
        FeeValidationStatus::NotChecked
    );

    harness.validator.set_status(ValidationStatus::Passed);
    node.on_offer_list_changed().await.unwrap();
    assert_eq!(harness.validator.calls(), 2);
    assert_eq!(
        node.offer(&id).unwrap().fee_validation_status(),
        FeeValidationStatus::Passed
    );
}

#[tokio::test]
async fn validation_waits_until_requests_are_allowed() {
    let harness = TestHarness::new();
    let (node, _rx) = node(&harness);
    market_offer(&node, Direction::Sell, "0").await;

    harness.validator.set_can_request(false);
    assert_eq!(node.on_offer_list_changed().await.unwrap(), 0);
    assert_eq!(harness.validator.calls(), 0);
}

#[tokio::test]
async fn fee_validation_waits_for_the_offer_lock() {
    let harness = TestHarness::new();
    let (node, _rx) = node(&harness);
    let id = market_offer(&node, Direction::Sell, "0").await;

    let handle = node.registry().handle(&id).unwrap();
    let guard = node.registry().lock_offer(handle).await.unwrap();
    let validating = {
        let node = Arc::clone(&node);
        tokio::spawn(async move { node.on_offer_list_changed().await })
    };
    tokio::task::yield_now().await;
    assert_eq!(
        node.offer(&id).unwrap().fee_validation_status(),
        FeeValidationStatus::NotChecked
    );
    assert_eq!(harness.validator.calls(), 0);

    drop(guard);
    assert_eq!(validating.await.unwrap().unwrap(), 1);
    assert_eq!(
        node.offer(&id).unwrap().fee_validation_status(),
        FeeValidationStatus::Passed
    );
}
