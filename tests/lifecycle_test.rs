//! End-to-end lifecycle tests against the subscription engine
//!
//! Run with: cargo test --test lifecycle_test

mod common;

use chrono::Duration;
use pretty_assertions::assert_eq;
use serde_json::json;

use common::{at, signed, Harness};
use subgate::storage::{PaymentStatus, SubscriptionPatch};
use subgate::subscription::{CancelOutcome, CheckoutOutcome, InboundOutcome, WebhookError};

async fn pending_order(harness: &Harness, user_id: i64) -> String {
    match harness.service.purchase(user_id, None).await.unwrap() {
        CheckoutOutcome::AwaitingPayment { order_ref, .. } => order_ref,
        other => panic!("expected a payment link, got {:?}", other),
    }
}

#[tokio::test]
async fn test_subscribe_with_captured_method_activates_auto_renewal() {
    let harness = Harness::new(at(2024, 1, 10, 12, 0, 0));

    let outcome = harness.service.subscribe(42, Some("standard")).await.unwrap();
    assert!(matches!(outcome, CheckoutOutcome::Activated(_)));

    let record = harness.record(42);
    assert!(record.subscription_active);
    assert!(record.auto_renewal);
    assert!(record.payment_method_ref.is_some());
    assert_eq!(record.subscription_end_date, Some(harness.now() + Duration::days(30)));
    assert_eq!(record.tariff.as_deref(), Some("standard"));
    assert_eq!(record.payment_history.len(), 1);

    let status = harness.service.status(42).unwrap();
    assert_eq!(status.days_left, 30);
    assert_eq!(harness.notifier.kinds_for(42), vec!["payment_successful"]);
}

#[tokio::test]
async fn test_subscription_without_saved_method_has_no_auto_renewal() {
    let harness = Harness::new(at(2024, 1, 10, 12, 0, 0));
    harness.provider.capture_subscriptions(false);

    let CheckoutOutcome::AwaitingPayment { order_ref, .. } = harness.service.subscribe(42, None).await.unwrap() else {
        panic!("expected a payment link");
    };
    assert!(!harness.record(42).subscription_active);

    let (body, signature) = signed(&json!({
        "order_id": order_ref,
        "payment_id": "pay_a",
        "status": "succeeded",
        "payment_method": {"id": "pm_1", "saved": false}
    }));
    harness.service.handle_webhook(&body, Some(&signature)).await.unwrap();

    let record = harness.record(42);
    assert!(record.subscription_active);
    assert!(!record.auto_renewal);
    assert_eq!(record.payment_method_ref, None);
}

#[tokio::test]
async fn test_duplicate_deliveries_do_not_extend_twice() {
    let harness = Harness::new(at(2024, 1, 10, 12, 0, 0));
    let first = pending_order(&harness, 42).await;

    let (body, signature) = signed(&json!({
        "order_id": first,
        "payment_id": "pay_a",
        "status": "succeeded",
        "amount": 40000,
        "currency": "RUB"
    }));
    let outcome = harness.service.handle_webhook(&body, Some(&signature)).await.unwrap();
    assert!(matches!(outcome, InboundOutcome::Applied(_)));
    let end_after_first = harness.record(42).subscription_end_date;

    let outcome = harness.service.handle_webhook(&body, Some(&signature)).await.unwrap();
    assert!(matches!(outcome, InboundOutcome::Duplicate(_)));
    assert_eq!(harness.record(42).subscription_end_date, end_after_first);

    // A second, distinct charge is a new payment
    let second = pending_order(&harness, 42).await;
    let (body, signature) = signed(&json!({
        "order_id": second,
        "payment_id": "pay_b",
        "status": "succeeded",
        "amount": 40000,
        "currency": "RUB"
    }));
    harness.service.handle_webhook(&body, Some(&signature)).await.unwrap();

    let record = harness.record(42);
    let charges: Vec<_> = record
        .payment_history
        .iter()
        .map(|event| event.charge_id.clone().unwrap())
        .collect();
    assert_eq!(charges, vec!["pay_a".to_string(), "pay_b".to_string()]);
    assert_eq!(harness.notifier.kinds_for(42), vec!["payment_successful", "payment_successful"]);
}

#[tokio::test]
async fn test_unverified_webhook_never_touches_the_store() {
    let harness = Harness::new(at(2024, 1, 10, 12, 0, 0));
    let (body, _) = signed(&json!({
        "order_id": "ord_1",
        "status": "succeeded",
        "metadata": {"user_id": "42"}
    }));

    let err = harness.service.handle_webhook(&body, Some("deadbeef")).await.unwrap_err();
    assert!(matches!(err, WebhookError::Authenticity));
    let err = harness.service.handle_webhook(&body, None).await.unwrap_err();
    assert!(matches!(err, WebhookError::Authenticity));
    assert!(harness.service.users().get(42).unwrap().is_none());
}

#[tokio::test]
async fn test_metadata_user_must_agree_with_intent() {
    let harness = Harness::new(at(2024, 1, 10, 12, 0, 0));
    let order_ref = pending_order(&harness, 42).await;

    let (body, signature) = signed(&json!({
        "order_id": order_ref,
        "payment_id": "pay_a",
        "status": "succeeded",
        "metadata": {"user_id": "7"}
    }));
    let err = harness.service.handle_webhook(&body, Some(&signature)).await.unwrap_err();
    assert_eq!(err.status_code(), 422);
    assert!(!harness.record(42).subscription_active);
    assert!(harness.service.users().get(7).unwrap().is_none());
}

#[tokio::test]
async fn test_failed_first_payment_is_recorded_without_activation() {
    let harness = Harness::new(at(2024, 1, 10, 12, 0, 0));
    let order_ref = pending_order(&harness, 42).await;

    let (body, signature) = signed(&json!({
        "order_id": order_ref,
        "payment_id": "pay_a",
        "status": "failed",
        "reason": "insufficient funds"
    }));
    harness.service.handle_webhook(&body, Some(&signature)).await.unwrap();

    let record = harness.record(42);
    assert!(!record.subscription_active);
    assert_eq!(record.payment_history.len(), 1);
    assert_eq!(record.payment_history[0].status, PaymentStatus::Failed);
    assert_eq!(record.payment_history[0].reason.as_deref(), Some("insufficient funds"));
    assert_eq!(harness.notifier.kinds_for(42), vec!["payment_failed"]);
}

#[tokio::test]
async fn test_payment_after_removal_restores_group_access() {
    let harness = Harness::new(at(2024, 1, 10, 12, 0, 0));
    harness.seed(
        42,
        SubscriptionPatch {
            subscription_end_date: Some(Some(at(2024, 1, 1, 0, 0, 0))),
            left_group: Some(true),
            ..Default::default()
        },
    );

    harness.service.subscribe(42, None).await.unwrap();

    let record = harness.record(42);
    assert!(record.subscription_active);
    assert!(!record.left_group);
    assert_eq!(harness.membership.restored(), vec![42]);
}

#[tokio::test]
async fn test_cancel_without_auto_renewal_is_informational() {
    let harness = Harness::new(at(2024, 1, 10, 12, 0, 0));

    let outcome = harness.service.cancel_auto_renewal(42).await.unwrap();
    assert_eq!(outcome, CancelOutcome::NotActive);
    assert!(harness.notifier.sent().is_empty());
    assert_eq!(harness.provider.cancel_calls(), 0);
}

#[tokio::test]
async fn test_cancel_keeps_access_until_end_date() {
    let harness = Harness::new(at(2024, 1, 10, 12, 0, 0));
    harness.service.subscribe(42, None).await.unwrap();
    let end = harness.record(42).subscription_end_date;

    let outcome = harness.service.cancel_auto_renewal(42).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Cancelled { active_until: end });
    assert_eq!(harness.provider.cancel_calls(), 1);

    let record = harness.record(42);
    assert!(record.subscription_active);
    assert!(!record.auto_renewal);
    assert_eq!(record.payment_method_ref, None);
    assert_eq!(record.subscription_end_date, end);
    assert_eq!(
        harness.notifier.kinds_for(42),
        vec!["payment_successful", "auto_renewal_disabled"]
    );

    // A second cancel has nothing left to do
    assert_eq!(harness.service.cancel_auto_renewal(42).await.unwrap(), CancelOutcome::NotActive);
}

#[tokio::test]
async fn test_history_is_newest_first() {
    let harness = Harness::new(at(2024, 1, 10, 12, 0, 0));
    harness.service.subscribe(42, None).await.unwrap();
    harness.clock.advance(Duration::days(1));
    let order_ref = pending_order(&harness, 42).await;
    let (body, signature) = signed(&json!({
        "order_id": order_ref,
        "payment_id": "pay_late",
        "status": "succeeded"
    }));
    harness.service.handle_webhook(&body, Some(&signature)).await.unwrap();

    let history = harness.service.history(42, 10).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].charge_id.as_deref(), Some("pay_late"));
    assert!(history[0].timestamp > history[1].timestamp);
}
