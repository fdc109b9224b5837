use super::engine::{LifecycleEngine, commit, fetch, plan_lock, subscription_lock};
use super::payments::new_transaction_id;
use crate::domain::customer::{Customer, NewCustomer};
use crate::domain::invoice;
use crate::domain::money::Amount;
use crate::domain::plan::Plan;
use crate::domain::risk::RiskDecision;
use crate::domain::subscription::{Subscription, SubscriptionStatus};
use crate::error::{EngineError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub customer_id: String,
    pub plan_id: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

fn default_quantity() -> u32 {
    1
}

impl CreateSubscriptionRequest {
    pub fn new(customer_id: &str, plan_id: &str) -> Self {
        Self {
            customer_id: customer_id.to_string(),
            plan_id: plan_id.to_string(),
            quantity: 1,
            metadata: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SubscriptionOp {
    Create(CreateSubscriptionRequest),
    Cancel {
        subscription_id: String,
        #[serde(default)]
        at_period_end: bool,
    },
    Upgrade {
        subscription_id: String,
        plan_id: String,
    },
}

impl LifecycleEngine {
    pub async fn handle_subscription_op(&self, op: SubscriptionOp) -> Result<Subscription> {
        match op {
            SubscriptionOp::Create(request) => self.create_subscription(request).await,
            SubscriptionOp::Cancel {
                subscription_id,
                at_period_end,
            } => self.cancel_subscription(&subscription_id, at_period_end).await,
            SubscriptionOp::Upgrade {
                subscription_id,
                plan_id,
            } => self.upgrade_subscription(&subscription_id, &plan_id).await,
        }
    }

    /// Starts a subscription. Unless it starts in trial, the first period's
    /// invoice is issued right away.
    #[instrument(skip(self, request), fields(customer_id = %request.customer_id, plan_id = %request.plan_id))]
    pub async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> Result<Subscription> {
        let plan = fetch(&self.stores.plans, "plan", &request.plan_id).await?.record;
        let now = self.now();
        let subscription = Subscription::create(
            &plan,
            &request.customer_id,
            request.quantity,
            request.metadata,
            now,
        )?;

        if subscription.status == SubscriptionStatus::Active {
            let mut first = invoice::generate(&subscription, subscription.period(), now)?;
            first.finalize(self.config.billing.invoice_grace_days, now)?;
            commit(&self.stores.invoices, "invoice", 0, first).await?;
        }
        commit(&self.stores.subscriptions, "subscription", 0, subscription.clone()).await?;
        info!(
            subscription_id = %subscription.id,
            status = %subscription.status,
            "subscription created"
        );
        Ok(subscription)
    }

    /// Cancels now, or at the end of the current period when `at_period_end` is set.
    #[instrument(skip(self))]
    pub async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
    ) -> Result<Subscription> {
        let _guard = self.locks.lock(subscription_lock(subscription_id)).await;
        let stored = fetch(&self.stores.subscriptions, "subscription", subscription_id).await?;
        let mut subscription = stored.record;
        let now = self.now();
        subscription.cancel(at_period_end, now)?;

        if subscription.status == SubscriptionStatus::Canceled {
            self.void_pending_invoice(&mut subscription, now).await?;
        }
        commit(
            &self.stores.subscriptions,
            "subscription",
            stored.version,
            subscription.clone(),
        )
        .await?;
        info!(at_period_end, "subscription cancellation recorded");
        Ok(subscription)
    }

    /// Moves a subscription to another plan, gated on the new plan's price for
    /// every seat.
    #[instrument(skip(self))]
    pub async fn upgrade_subscription(
        &self,
        subscription_id: &str,
        plan_id: &str,
    ) -> Result<Subscription> {
        let _guard = self.locks.lock(subscription_lock(subscription_id)).await;
        let stored = fetch(&self.stores.subscriptions, "subscription", subscription_id).await?;
        let plan = fetch(&self.stores.plans, "plan", plan_id).await?.record;
        let mut subscription = stored.record;
        let previous_plan = subscription.plan_id.clone();
        subscription.change_plan(&plan, self.now())?;

        let seats = Decimal::from(subscription.quantity);
        let charge = Amount::in_currency(
            plan.currency.round(Decimal::from(plan.amount) * seats),
            &plan.currency,
        )?;
        let assessment = self
            .require_not_denied(
                new_transaction_id(),
                subscription.customer_id.clone(),
                charge,
                plan.currency.clone(),
            )
            .await?;
        if assessment.decision == RiskDecision::Review {
            warn!(score = assessment.score, "upgrade proceeding despite review decision");
        }

        commit(
            &self.stores.subscriptions,
            "subscription",
            stored.version,
            subscription.clone(),
        )
        .await?;
        info!(from = %previous_plan, to = %plan.id, "subscription plan changed");
        Ok(subscription)
    }

    pub async fn get_subscription(&self, subscription_id: &str) -> Result<Subscription> {
        Ok(fetch(&self.stores.subscriptions, "subscription", subscription_id)
            .await?
            .record)
    }

    /// A customer's subscriptions, oldest first.
    pub async fn customer_subscriptions(&self, customer_id: &str) -> Result<Vec<Subscription>> {
        let mut subscriptions: Vec<Subscription> = self
            .stores
            .subscriptions
            .all()
            .await?
            .into_iter()
            .filter(|s| s.customer_id == customer_id)
            .collect();
        subscriptions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(subscriptions)
    }

    /// The catalog by ascending price, ties broken by id.
    pub async fn list_plans(&self) -> Result<Vec<Plan>> {
        let mut plans = self.stores.plans.all().await?;
        plans.sort_by(|a, b| {
            Decimal::from(a.amount)
                .cmp(&Decimal::from(b.amount))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(plans)
    }

    #[instrument(skip(self, plan), fields(plan_id = %plan.id))]
    pub async fn add_plan(&self, plan: Plan) -> Result<Plan> {
        plan.validate()?;
        if !self.stores.plans.compare_and_swap(0, plan.clone()).await? {
            return Err(EngineError::validation(format!(
                "Plan {} already exists",
                plan.id
            )));
        }
        info!("plan added");
        Ok(plan)
    }

    /// Stops new subscriptions on a plan. Existing subscriptions keep their terms.
    #[instrument(skip(self))]
    pub async fn deactivate_plan(&self, plan_id: &str) -> Result<Plan> {
        let _guard = self.locks.lock(plan_lock(plan_id)).await;
        let stored = fetch(&self.stores.plans, "plan", plan_id).await?;
        let mut plan = stored.record;
        if !plan.is_active {
            return Err(EngineError::invalid_state("plan", plan_id, "inactive", "deactivate"));
        }
        plan.is_active = false;
        commit(&self.stores.plans, "plan", stored.version, plan.clone()).await?;
        info!("plan deactivated");
        Ok(plan)
    }

    #[instrument(skip(self, input), fields(email = %input.email))]
    pub async fn register_customer(&self, input: NewCustomer) -> Result<Customer> {
        let customer = Customer::register(input, self.now())?;
        if !self
            .stores
            .customers
            .compare_and_swap(0, customer.clone())
            .await?
        {
            return Err(EngineError::validation(format!(
                "Customer {} already exists",
                customer.id
            )));
        }
        info!(customer_id = %customer.id, "customer registered");
        Ok(customer)
    }

    pub async fn get_customer(&self, customer_id: &str) -> Result<Customer> {
        Ok(fetch(&self.stores.customers, "customer", customer_id).await?.record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::engine::Stores;
    use crate::config::EngineConfig;
    use crate::domain::money::{Amount, Currency};
    use crate::domain::plan::PlanInterval;
    use crate::infrastructure::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    async fn engine() -> LifecycleEngine {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap());
        let engine =
            LifecycleEngine::new(Stores::in_memory(), EngineConfig::default()).with_clock(clock);
        engine.seed_catalog().await.unwrap();
        engine
    }

    #[tokio::test]
    async fn test_list_plans_ordered_by_price() {
        let engine = engine().await;
        engine
            .add_plan(Plan {
                id: "plan_aaa".to_string(),
                name: "Same Price".to_string(),
                description: String::new(),
                amount: Amount::new(dec!(49.99)).unwrap(),
                currency: Currency::usd(),
                interval: PlanInterval::Quarterly,
                features: vec![],
                is_active: true,
                trial_days: None,
            })
            .await
            .unwrap();

        let ids: Vec<String> = engine
            .list_plans()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(
            ids,
            vec!["plan_basic", "plan_aaa", "plan_premium", "plan_enterprise"]
        );
    }

    #[tokio::test]
    async fn test_unknown_plan_and_subscription() {
        let engine = engine().await;
        assert!(matches!(
            engine
                .create_subscription(CreateSubscriptionRequest::new("cus_1", "plan_gold"))
                .await,
            Err(EngineError::NotFoundError { entity: "plan", .. })
        ));
        assert!(matches!(
            engine.cancel_subscription("sub_missing", false).await,
            Err(EngineError::NotFoundError { .. })
        ));
        assert!(matches!(
            engine.upgrade_subscription("sub_missing", "plan_premium").await,
            Err(EngineError::NotFoundError { .. })
        ));
    }

    #[tokio::test]
    async fn test_deactivated_plan_rejects_new_subscriptions() {
        let engine = engine().await;
        let existing = engine
            .create_subscription(CreateSubscriptionRequest::new("cus_1", "plan_basic"))
            .await
            .unwrap();
        engine.deactivate_plan("plan_basic").await.unwrap();

        assert!(matches!(
            engine
                .create_subscription(CreateSubscriptionRequest::new("cus_2", "plan_basic"))
                .await,
            Err(EngineError::ValidationError(_))
        ));
        assert!(matches!(
            engine.deactivate_plan("plan_basic").await,
            Err(EngineError::InvalidStateError { .. })
        ));

        let unchanged = engine.get_subscription(&existing.id).await.unwrap();
        assert_eq!(unchanged.plan_id, "plan_basic");
        assert_eq!(unchanged.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_trial_subscription_has_no_invoice() {
        let engine = engine().await;
        let sub = engine
            .create_subscription(CreateSubscriptionRequest::new("cus_1", "plan_enterprise"))
            .await
            .unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Trial);
        assert!(engine.subscription_invoices(&sub.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_twice_is_invalid() {
        let engine = engine().await;
        let sub = engine
            .handle_subscription_op(SubscriptionOp::Create(CreateSubscriptionRequest::new(
                "cus_1",
                "plan_basic",
            )))
            .await
            .unwrap();
        let canceled = engine
            .handle_subscription_op(SubscriptionOp::Cancel {
                subscription_id: sub.id.clone(),
                at_period_end: false,
            })
            .await
            .unwrap();
        assert_eq!(canceled.status, SubscriptionStatus::Canceled);
        assert!(canceled.canceled_at.is_some());

        assert!(matches!(
            engine.cancel_subscription(&sub.id, false).await,
            Err(EngineError::InvalidStateError { .. })
        ));
        assert!(matches!(
            engine.upgrade_subscription(&sub.id, "plan_premium").await,
            Err(EngineError::InvalidStateError { .. })
        ));
    }

    #[tokio::test]
    async fn test_upgrade_is_scored_for_every_seat() {
        let engine = engine().await;
        let mut request = CreateSubscriptionRequest::new("cus_1", "plan_basic");
        request.quantity = 200;
        let sub = engine.create_subscription(request).await.unwrap();

        assert!(matches!(
            engine.upgrade_subscription(&sub.id, "plan_premium").await,
            Err(EngineError::RiskDeniedError { score: 75, .. })
        ));
        let history = engine.user_risk_history("cus_1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].amount, Amount::new(dec!(9998.00)).unwrap());
        assert_eq!(
            engine.get_subscription(&sub.id).await.unwrap().plan_id,
            "plan_basic"
        );

        let single = engine
            .create_subscription(CreateSubscriptionRequest::new("cus_2", "plan_basic"))
            .await
            .unwrap();
        let upgraded = engine
            .upgrade_subscription(&single.id, "plan_premium")
            .await
            .unwrap();
        assert_eq!(upgraded.plan_id, "plan_premium");
    }

    #[tokio::test]
    async fn test_customer_registration() {
        let engine = engine().await;
        let customer = engine
            .register_customer(NewCustomer {
                id: Some("cus_1".into()),
                name: "Grace Hopper".into(),
                email: "grace@example.com".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(engine.get_customer("cus_1").await.unwrap(), customer);

        let duplicate = NewCustomer {
            id: Some("cus_1".into()),
            name: "Someone Else".into(),
            email: "else@example.com".into(),
            ..Default::default()
        };
        assert!(matches!(
            engine.register_customer(duplicate).await,
            Err(EngineError::ValidationError(_))
        ));
        assert!(matches!(
            engine.get_customer("cus_2").await,
            Err(EngineError::NotFoundError { .. })
        ));
    }
}
