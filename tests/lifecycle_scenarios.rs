use chrono::Duration;
use paylifecycle::application::{
    AnalyzeTransactionRequest, CreateSubscriptionRequest, LifecycleEngine, ProcessPaymentRequest,
    Stores,
};
use paylifecycle::config::EngineConfig;
use paylifecycle::domain::invoice::InvoiceStatus;
use paylifecycle::domain::money::{Amount, Currency};
use paylifecycle::domain::payment::{FailureReason, PaymentMethod, PaymentStatus};
use paylifecycle::domain::plan::{Plan, PlanInterval};
use paylifecycle::domain::ports::NoiseSource;
use paylifecycle::domain::risk::{RiskContext, RiskDecision, RiskFactor};
use paylifecycle::domain::subscription::SubscriptionStatus;
use paylifecycle::error::EngineError;
use paylifecycle::infrastructure::clock::ManualClock;
use rust_decimal_macros::dec;

mod common;

#[tokio::test]
async fn test_create_premium_subscription() {
    let (engine, _clock) = common::engine().await;

    let sub = engine
        .create_subscription(CreateSubscriptionRequest::new("cus_1", "plan_premium"))
        .await
        .unwrap();

    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.current_period_start, common::april_first());
    assert_eq!(
        sub.current_period_end,
        common::april_first() + Duration::days(30)
    );

    let invoices = engine.subscription_invoices(&sub.id).await.unwrap();
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0].amount, dec!(49.99));
    assert_eq!(invoices[0].status, InvoiceStatus::Open);
    assert_eq!(invoices[0].items.len(), 1);
    assert_eq!(invoices[0].items[0].quantity, 1);
}

#[tokio::test]
async fn test_upgrade_prorates_next_invoice() {
    let (engine, clock) = common::engine().await;
    let sub = engine
        .create_subscription(CreateSubscriptionRequest::new("cus_1", "plan_basic"))
        .await
        .unwrap();

    clock.advance(Duration::days(20));
    let upgraded = engine
        .upgrade_subscription(&sub.id, "plan_premium")
        .await
        .unwrap();
    assert_eq!(upgraded.plan_id, "plan_premium");
    assert_eq!(upgraded.current_period_start, sub.current_period_start);
    assert_eq!(upgraded.current_period_end, sub.current_period_end);

    clock.set(sub.current_period_end);
    let report = engine.run_billing_cycle().await.unwrap();
    assert_eq!(report.renewed, vec![sub.id.clone()]);

    let invoices = engine.subscription_invoices(&sub.id).await.unwrap();
    assert_eq!(invoices.len(), 2);
    let renewal = &invoices[1];
    assert_eq!(renewal.items.len(), 2);
    assert_eq!(renewal.items[0].unit_amount, dec!(-6.66));
    assert_eq!(renewal.items[1].unit_amount, dec!(49.99));
    assert_eq!(renewal.amount, dec!(43.33));
    assert_eq!(renewal.status, InvoiceStatus::Paid);

    let renewed = engine.get_subscription(&sub.id).await.unwrap();
    assert_eq!(renewed.current_period_start, sub.current_period_end);
    assert!(renewed.current_period_end > renewed.current_period_start);
    assert!(renewed.pending_proration.is_none());
}

#[tokio::test]
async fn test_high_risk_transaction_is_denied() {
    let (engine, _clock) = common::engine().await;

    let assessment = engine
        .handle_risk_analysis(AnalyzeTransactionRequest {
            transaction_id: "txn_risky".to_string(),
            user_id: "user_new".to_string(),
            amount: dec!(1500),
            currency: "USD".to_string(),
            ip_address: Some("203.0.113.5".to_string()),
            device_id: None,
            country: None,
        })
        .await
        .unwrap();
    assert!(assessment.score >= 70);
    assert_eq!(assessment.decision, RiskDecision::Deny);

    let mut request =
        ProcessPaymentRequest::new(dec!(1500), "USD", PaymentMethod::Card, "user_new");
    request.transaction_id = Some("txn_risky".to_string());
    let payment = engine.handle_payment(request).await.unwrap();

    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(payment.failure_reason, Some(FailureReason::RiskDenied));
    assert_eq!(payment.risk_assessment_id, assessment.id);
    assert_eq!(engine.user_risk_history("user_new").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_refund_unknown_payment() {
    let (engine, _clock) = common::engine().await;
    assert!(matches!(
        engine.refund_payment("pmt_does_not_exist").await,
        Err(EngineError::NotFoundError { .. })
    ));
}

#[tokio::test]
async fn test_payment_succeeds_and_refunds_once() {
    let (engine, _clock) = common::engine().await;
    let payment = engine
        .handle_payment(ProcessPaymentRequest::new(
            dec!(125.50),
            "USD",
            PaymentMethod::Card,
            "cus_1",
        ))
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Succeeded);
    assert_eq!(payment.amount.value(), dec!(125.50));

    let refund = engine.refund_payment(&payment.id).await.unwrap();
    assert_eq!(refund.amount, payment.amount);
    assert_eq!(
        engine.get_payment(&payment.id).await.unwrap().status,
        PaymentStatus::Refunded
    );

    assert!(matches!(
        engine.refund_payment(&payment.id).await,
        Err(EngineError::InvalidStateError { .. })
    ));
}

/// Pushes refunds over the deny threshold and leaves payments alone.
struct RefundsLookRisky;

impl NoiseSource for RefundsLookRisky {
    fn offset(&self, context: &RiskContext) -> i32 {
        if context.transaction_id.starts_with("ref_") {
            100
        } else {
            0
        }
    }
}

#[tokio::test]
async fn test_refund_blocked_by_risk() {
    let engine = LifecycleEngine::new(Stores::in_memory(), EngineConfig::default())
        .with_clock(ManualClock::new(common::april_first()))
        .with_noise(RefundsLookRisky);
    engine.seed_catalog().await.unwrap();

    let payment = engine
        .handle_payment(ProcessPaymentRequest::new(
            dec!(125.50),
            "USD",
            PaymentMethod::Card,
            "cus_1",
        ))
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Succeeded);

    assert!(matches!(
        engine.refund_payment(&payment.id).await,
        Err(EngineError::RiskDeniedError { score: 100, .. })
    ));
    assert_eq!(
        engine.get_payment(&payment.id).await.unwrap().status,
        PaymentStatus::Succeeded
    );
}

#[tokio::test]
async fn test_transaction_id_is_rescored_for_a_different_payment() {
    let (engine, _clock) = common::engine().await;
    let cleared = engine
        .handle_risk_analysis(AnalyzeTransactionRequest {
            transaction_id: "txn_small".to_string(),
            user_id: "cus_1".to_string(),
            amount: dec!(10),
            currency: "USD".to_string(),
            ip_address: None,
            device_id: None,
            country: None,
        })
        .await
        .unwrap();
    assert_eq!(cleared.decision, RiskDecision::Allow);

    let mut larger = ProcessPaymentRequest::new(dec!(6000), "USD", PaymentMethod::Card, "cus_1");
    larger.transaction_id = Some("txn_small".to_string());
    let denied = engine.handle_payment(larger).await.unwrap();
    assert_eq!(denied.status, PaymentStatus::Failed);
    assert_eq!(denied.failure_reason, Some(FailureReason::RiskDenied));
    assert_ne!(denied.risk_assessment_id, cleared.id);

    let rescored = engine.get_risk_assessment("txn_small").await.unwrap();
    assert_eq!(rescored.score, 75);
    assert_eq!(rescored.amount, Amount::new(dec!(6000)).unwrap());
}

#[tokio::test]
async fn test_transaction_id_backs_one_live_payment() {
    let (engine, _clock) = common::engine().await;
    engine
        .handle_risk_analysis(AnalyzeTransactionRequest {
            transaction_id: "txn_once".to_string(),
            user_id: "cus_1".to_string(),
            amount: dec!(10),
            currency: "USD".to_string(),
            ip_address: None,
            device_id: None,
            country: None,
        })
        .await
        .unwrap();

    let mut request = ProcessPaymentRequest::new(dec!(10), "USD", PaymentMethod::Card, "cus_1");
    request.transaction_id = Some("txn_once".to_string());
    let first = engine.handle_payment(request.clone()).await.unwrap();
    assert_eq!(first.status, PaymentStatus::Succeeded);
    assert_eq!(first.transaction_id.as_deref(), Some("txn_once"));

    assert!(matches!(
        engine.handle_payment(request).await,
        Err(EngineError::ValidationError(_))
    ));
    assert_eq!(engine.list_customer_payments("cus_1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_upgrade_blocked_by_risk() {
    let (engine, _clock) = common::engine().await;
    engine
        .add_plan(Plan {
            id: "plan_whale".to_string(),
            name: "Whale Plan".to_string(),
            description: String::new(),
            amount: Amount::new(dec!(6000)).unwrap(),
            currency: Currency::usd(),
            interval: PlanInterval::Monthly,
            features: vec![],
            is_active: true,
            trial_days: None,
        })
        .await
        .unwrap();
    let sub = engine
        .create_subscription(CreateSubscriptionRequest::new("cus_1", "plan_basic"))
        .await
        .unwrap();

    assert!(matches!(
        engine.upgrade_subscription(&sub.id, "plan_whale").await,
        Err(EngineError::RiskDeniedError { .. })
    ));
    let unchanged = engine.get_subscription(&sub.id).await.unwrap();
    assert_eq!(unchanged, sub);
}

#[tokio::test]
async fn test_upgrade_validation() {
    let (engine, _clock) = common::engine().await;
    let sub = engine
        .create_subscription(CreateSubscriptionRequest::new("cus_1", "plan_basic"))
        .await
        .unwrap();

    assert!(matches!(
        engine.upgrade_subscription(&sub.id, "plan_basic").await,
        Err(EngineError::ValidationError(_))
    ));
    assert!(matches!(
        engine.upgrade_subscription(&sub.id, "plan_gold").await,
        Err(EngineError::NotFoundError { entity: "plan", .. })
    ));
}

#[tokio::test]
async fn test_analysis_is_deterministic() {
    let (engine, _clock) = common::engine().await;
    common::register(&engine, "cus_1", true).await;
    let request = AnalyzeTransactionRequest {
        transaction_id: "txn_1".to_string(),
        user_id: "cus_1".to_string(),
        amount: dec!(2500),
        currency: "EUR".to_string(),
        ip_address: Some("198.51.100.1".to_string()),
        device_id: Some("dev_1".to_string()),
        country: None,
    };

    let first = engine.handle_risk_analysis(request.clone()).await.unwrap();
    let second = engine.handle_risk_analysis(request).await.unwrap();
    assert_eq!(first.score, second.score);
    assert_eq!(first.factors, second.factors);
    assert_eq!(first.decision, second.decision);
}

#[tokio::test]
async fn test_known_network_lowers_score() {
    let (engine, clock) = common::engine().await;
    common::register(&engine, "cus_1", true).await;
    clock.advance(Duration::days(10));

    let mut request = ProcessPaymentRequest::new(dec!(20), "USD", PaymentMethod::Card, "cus_1");
    request.ip_address = Some("198.51.100.1".to_string());
    let payment = engine.handle_payment(request).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Succeeded);

    let first = engine
        .get_risk_assessment(payment.transaction_id.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(
        first.factors,
        vec![
            RiskFactor::EstablishedUser,
            RiskFactor::VerifiedUser,
            RiskFactor::LimitedHistory,
            RiskFactor::UnusualIpAddress,
        ]
    );
    assert_eq!(first.score, 25);

    let customer = engine.get_customer("cus_1").await.unwrap();
    assert!(customer.known_ips.contains("198.51.100.1"));

    let again = engine
        .handle_risk_analysis(AnalyzeTransactionRequest {
            transaction_id: "txn_2".to_string(),
            user_id: "cus_1".to_string(),
            amount: dec!(20),
            currency: "USD".to_string(),
            ip_address: Some("198.51.100.1".to_string()),
            device_id: Some("dev_1".to_string()),
            country: None,
        })
        .await
        .unwrap();
    assert_eq!(again.score, 10);
    assert!(again.factors.contains(&RiskFactor::CommonIpAddress));
    assert!(again.factors.contains(&RiskFactor::UnknownDevice));
}
