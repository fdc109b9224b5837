use chrono::Utc;
use paylifecycle::domain::money::{Amount, Currency};
use paylifecycle::domain::plan::Plan;
use paylifecycle::domain::ports::{RecordStoreBox, RiskLedgerBox};
use paylifecycle::domain::risk::{RiskAssessment, RiskDecision, RiskFactor};
use paylifecycle::infrastructure::in_memory::{InMemoryRecordStore, InMemoryRiskLedger};
use rust_decimal_macros::dec;

#[tokio::test]
async fn test_stores_as_trait_objects() {
    let plan_store: RecordStoreBox<Plan> = Box::new(InMemoryRecordStore::new());
    let ledger: RiskLedgerBox = Box::new(InMemoryRiskLedger::new());

    let plan = Plan::default_catalog().remove(0);
    let plan_id = plan.id.clone();
    let assessment = RiskAssessment {
        id: "risk_1".to_string(),
        transaction_id: "txn_1".to_string(),
        user_id: "cus_1".to_string(),
        amount: Amount::new(dec!(10)).unwrap(),
        currency: Currency::usd(),
        score: 25,
        factors: vec![RiskFactor::NewUser, RiskFactor::UnverifiedUser],
        decision: RiskDecision::Allow,
        created_at: Utc::now(),
    };

    // Verify Send + Sync by spawning tasks
    let plan_handle = tokio::spawn(async move {
        assert!(plan_store.compare_and_swap(0, plan).await.unwrap());
        plan_store.get(&plan_id).await.unwrap().unwrap()
    });

    let ledger_handle = tokio::spawn(async move {
        ledger.append(assessment).await.unwrap();
        ledger.latest_for_transaction("txn_1").await.unwrap().unwrap()
    });

    let retrieved_plan = plan_handle.await.unwrap();
    assert_eq!(retrieved_plan.version, 1);
    assert_eq!(retrieved_plan.record.id, "plan_basic");

    let retrieved_assessment = ledger_handle.await.unwrap();
    assert_eq!(retrieved_assessment.id, "risk_1");
    assert_eq!(retrieved_assessment.decision, RiskDecision::Allow);
}
