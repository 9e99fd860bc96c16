use std::collections::BTreeMap;
use std::sync::Arc;

use offer_engine::testing::{BookCall, TestHarness};
use offer_engine::{
    CreateOfferRequest, CurrencyCode, DeactivationReason, Direction, EngineConfig, EngineEvent,
    Error, OfferNode, OpenOfferState, Price, Pricing, ProposedChanges,
};

fn usd(s: &str) -> Price {
    Price::parse(s, CurrencyCode::new("USD")).unwrap()
}

fn node(harness: &TestHarness) -> Arc<OfferNode> {
    let config = EngineConfig {
        initial_pow_difficulty: 4,
        ..EngineConfig::default()
    };
    let (node, _rx) = OfferNode::new(config, harness.ports()).expect("node should start");
    Arc::new(node)
}

fn request(pricing: Pricing, trigger_price: Option<Price>) -> CreateOfferRequest {
    CreateOfferRequest {
        direction: Direction::Sell,
        currency: CurrencyCode::new("USD"),
        min_amount: 5_000_000,
        amount: 10_000_000,
        pricing,
        buyer_security_deposit_bps: 1_500,
        fee_currency: CurrencyCode::btc(),
        payment_method_id: "SEPA".into(),
        trigger_price,
        extra_data: BTreeMap::new(),
    }
}

fn market(margin_bps: i64) -> Pricing {
    Pricing::MarketMargin { margin_bps }
}

#[tokio::test]
async fn create_offer_pays_fee_and_publishes() {
    let harness = TestHarness::new();
    let node = node(&harness);
    let payload = node
        .create_offer(request(Pricing::Fixed(usd("50000")), None))
        .await
        .unwrap();

    assert_eq!(payload.maker_fee_tx_id, Some(format!("feetx-{}", payload.id)));
    // 0.1% of 0.1 BTC is above the 5000 sat minimum.
    assert_eq!(payload.maker_fee.value(), 10_000);
    assert_eq!(payload.buyer_security_deposit, 1_500_000);
    assert_eq!(payload.seller_security_deposit, 1_500_000);
    // 10 sat/vB times the fee transaction size.
    assert_eq!(payload.tx_fee, 1_750);
    assert_eq!(harness.fee_wallet.paid().len(), 1);
    assert_eq!(harness.book.calls(), vec![BookCall::Publish(payload.id.clone())]);
    assert!(node.offer(&payload.id).unwrap().is_available());
}

#[tokio::test]
async fn create_offer_rejects_bad_requests() {
    let harness = TestHarness::new();
    let node = node(&harness);

    let mut bad_range = request(Pricing::Fixed(usd("50000")), None);
    bad_range.min_amount = bad_range.amount + 1;
    let err = node.create_offer(bad_range).await.unwrap_err();
    assert_eq!(err.engine(), Some(&Error::InvalidAmountRange));

    let mut too_big = request(Pricing::Fixed(usd("50000")), None);
    too_big.amount = 300_000_000;
    let err = node.create_offer(too_big).await.unwrap_err();
    assert!(matches!(err.engine(), Some(Error::AmountAboveTradeLimit { .. })));

    let err = node
        .create_offer(request(Pricing::Fixed(usd("50000")), Some(usd("40000"))))
        .await
        .unwrap_err();
    assert_eq!(err.engine(), Some(&Error::TriggerPriceOnFixedOffer));

    let err = node.create_offer(request(market(6_000), None)).await.unwrap_err();
    assert_eq!(err.engine(), Some(&Error::InvalidMargin));

    let mut low_deposit = request(market(100), None);
    low_deposit.buyer_security_deposit_bps = 100;
    let err = node.create_offer(low_deposit).await.unwrap_err();
    assert_eq!(err.engine(), Some(&Error::InvalidSecurityDeposit));

    let err = node
        .create_offer(request(
            Pricing::Fixed(Price::parse("50000", CurrencyCode::new("EUR")).unwrap()),
            None,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err.engine(), Some(Error::CurrencyMismatch { .. })));

    assert!(harness.book.calls().is_empty());
    assert!(harness.fee_wallet.paid().is_empty());
}

#[tokio::test]
async fn edit_keeps_the_id_and_replaces_the_listing() {
    let harness = TestHarness::new();
    let node = node(&harness);
    let original = node.create_offer(request(market(100), None)).await.unwrap();

    let edited = node
        .edit_offer(&original.id, ProposedChanges::margin(200))
        .await
        .unwrap();
    assert_eq!(edited.id, original.id);
    assert_eq!(edited.market_price_margin_bps, 200);
    assert_eq!(edited.amount, original.amount);
    assert_eq!(edited.maker_fee_tx_id, original.maker_fee_tx_id);

    let id = original.id;
    assert_eq!(
        harness.book.calls(),
        vec![
            BookCall::Publish(id.clone()),
            BookCall::Withdraw(id.clone()),
            BookCall::Publish(id.clone()),
        ]
    );
    assert_eq!(node.offer(&id).unwrap().offer().market_price_margin_bps, 200);
}

#[tokio::test]
async fn edit_with_deactivation_withdraws() {
    let harness = TestHarness::new();
    let node = node(&harness);
    let payload = node.create_offer(request(market(100), None)).await.unwrap();

    let changes = ProposedChanges {
        trigger_price: Some(usd("90")),
        activate: Some(false),
        ..ProposedChanges::default()
    };
    node.edit_offer(&payload.id, changes).await.unwrap();

    let open = node.offer(&payload.id).unwrap();
    assert_eq!(open.state(), OpenOfferState::Deactivated);
    assert_eq!(*open.trigger_price(), usd("90"));
    assert!(!harness.book.is_listed(&payload.id));
}

#[tokio::test]
async fn invalid_edits_leave_the_offer_untouched() {
    let harness = TestHarness::new();
    let node = node(&harness);
    let payload = node.create_offer(request(market(100), None)).await.unwrap();

    let err = node
        .edit_offer(&payload.id, ProposedChanges::default())
        .await
        .unwrap_err();
    assert_eq!(err.engine(), Some(&Error::NoEditFields));

    let err = node
        .edit_offer(&payload.id, ProposedChanges::trigger(usd("-1")))
        .await
        .unwrap_err();
    assert_eq!(err.engine(), Some(&Error::InvalidTriggerPrice));

    assert_eq!(node.offer(&payload.id).unwrap().offer(), &payload);
    assert_eq!(harness.book.publishes_of(&payload.id), 1);
}

#[tokio::test]
async fn swap_offers_cannot_be_edited() {
    let harness = TestHarness::new();
    harness.wallet.set_balance(CurrencyCode::btc(), 5_000_000);
    let node = node(&harness);
    let payload = node
        .create_swap_offer(
            Direction::Sell,
            500_000,
            1_000_000,
            Price::parse("0.00005", CurrencyCode::bsq()).unwrap(),
        )
        .await
        .unwrap();

    let err = node
        .edit_offer(
            &payload.id,
            ProposedChanges::fixed_price(Price::parse("0.00006", CurrencyCode::bsq()).unwrap()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.engine(), Some(&Error::UnsupportedOnSwapOffer));
}

#[tokio::test]
async fn cancel_is_terminal() {
    let harness = TestHarness::new();
    let node = node(&harness);
    let payload = node.create_offer(request(market(100), None)).await.unwrap();

    node.cancel_offer(&payload.id).await.unwrap();
    assert_eq!(node.offer(&payload.id).unwrap().state(), OpenOfferState::Canceled);
    assert!(!harness.book.is_listed(&payload.id));

    let err = node.cancel_offer(&payload.id).await.unwrap_err();
    assert!(matches!(
        err.engine(),
        Some(Error::NotAvailable {
            state: OpenOfferState::Canceled
        })
    ));
    let err = node.activate_offer(&payload.id).await.unwrap_err();
    assert!(matches!(err.engine(), Some(Error::NotAvailable { .. })));
    let err = node
        .edit_offer(&payload.id, ProposedChanges::margin(50))
        .await
        .unwrap_err();
    assert!(matches!(err.engine(), Some(Error::NotAvailable { .. })));
    assert!(node.open_offers().unwrap().is_empty());
}

#[tokio::test]
async fn failed_withdraw_keeps_the_offer_cancelable() {
    let harness = TestHarness::new();
    let node = node(&harness);
    let payload = node.create_offer(request(market(100), None)).await.unwrap();

    harness.book.fail_next("relay down");
    let err = node.cancel_offer(&payload.id).await.unwrap_err();
    assert!(matches!(err.engine(), Some(Error::OfferBook(_))));
    assert!(node.offer(&payload.id).unwrap().is_available());
    assert!(harness.book.is_listed(&payload.id));

    node.cancel_offer(&payload.id).await.unwrap();
    assert_eq!(node.offer(&payload.id).unwrap().state(), OpenOfferState::Canceled);
    assert!(!harness.book.is_listed(&payload.id));
}

#[tokio::test]
async fn deactivate_then_activate_round_trips_the_listing() {
    let harness = TestHarness::new();
    let node = node(&harness);
    let payload = node.create_offer(request(market(100), None)).await.unwrap();

    node.deactivate_offer(&payload.id).await.unwrap();
    // A second toggle is a no-op on the book.
    node.deactivate_offer(&payload.id).await.unwrap();
    assert_eq!(harness.book.withdrawals_of(&payload.id), 1);

    node.activate_offer(&payload.id).await.unwrap();
    assert!(node.offer(&payload.id).unwrap().is_available());
    assert_eq!(harness.book.publishes_of(&payload.id), 2);
}

#[tokio::test]
async fn activation_is_blocked_by_missing_funds() {
    let harness = TestHarness::new();
    let node = node(&harness);
    let payload = node
        .create_swap_offer(
            Direction::Sell,
            500_000,
            1_000_000,
            Price::parse("0.00005", CurrencyCode::bsq()).unwrap(),
        )
        .await
        .unwrap();

    let open = node.offer(&payload.id).unwrap();
    assert_eq!(open.state(), OpenOfferState::Deactivated);
    assert!(open.has_reason(DeactivationReason::MissingFunds));
    assert!(harness.book.calls().is_empty());

    let err = node.activate_offer(&payload.id).await.unwrap_err();
    assert_eq!(
        err.engine(),
        Some(&Error::ActivationBlocked {
            reasons: vec![DeactivationReason::MissingFunds]
        })
    );
}

#[tokio::test]
async fn activation_is_refused_past_the_trigger() {
    let harness = TestHarness::new();
    let node = node(&harness);
    let payload = node
        .create_offer(request(market(100), Some(usd("100.00"))))
        .await
        .unwrap();
    node.deactivate_offer(&payload.id).await.unwrap();

    harness.prices.set_price(usd("99.50"));
    let err = node.activate_offer(&payload.id).await.unwrap_err();
    assert_eq!(err.engine(), Some(&Error::TriggerPriceReached));

    harness.prices.set_price(usd("100.50"));
    node.activate_offer(&payload.id).await.unwrap();
    assert!(node.offer(&payload.id).unwrap().is_available());
}

#[tokio::test]
async fn creating_past_the_trigger_is_refused() {
    let harness = TestHarness::new();
    let node = node(&harness);
    harness.prices.set_price(usd("99.00"));
    let err = node
        .create_offer(request(market(100), Some(usd("100.00"))))
        .await
        .unwrap_err();
    assert_eq!(err.engine(), Some(&Error::TriggerPriceReached));
    assert!(harness.fee_wallet.paid().is_empty());
}

#[test]
fn invalid_config_is_rejected() {
    let harness = TestHarness::new();
    let mut config = EngineConfig::default();
    config.maker_address.clear();
    assert!(matches!(
        OfferNode::new(config, harness.ports()),
        Err(Error::InvalidConfig(_))
    ));
}

#[tokio::test]
async fn event_loop_dispatches_until_shutdown() {
    let harness = TestHarness::new();
    let node = node(&harness);
    let payload = node
        .create_offer(request(market(100), Some(usd("100.00"))))
        .await
        .unwrap();

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let event_loop = node.spawn_event_loop(rx);
    harness.prices.set_price(usd("98.00"));
    tx.send(EngineEvent::PriceUpdated(CurrencyCode::new("USD"))).unwrap();
    tx.send(EngineEvent::OfferListChanged).unwrap();
    tx.send(EngineEvent::Shutdown).unwrap();
    event_loop.await.unwrap();

    let open = node.offer(&payload.id).unwrap();
    assert!(open.has_reason(DeactivationReason::TriggerPrice));
    // Deactivated offers are not submitted for fee validation.
    assert_eq!(harness.validator.calls(), 0);
}
