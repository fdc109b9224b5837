use super::engine::{
    LifecycleEngine, commit, customer_lock, fetch, payment_lock, subscription_lock, transaction_lock,
};
use super::risk::Network;
use crate::domain::money::{Amount, Currency};
use crate::domain::payment::{
    FailureReason, IdempotencyRecord, NewPayment, Payment, PaymentMethod, PaymentStatus, Refund,
};
use crate::domain::ports::{ChargeOutcome, ChargeRequest};
use crate::domain::risk::{RiskAssessment, RiskDecision};
use crate::error::{EngineError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessPaymentRequest {
    pub amount: Decimal,
    pub currency: String,
    pub payment_method: PaymentMethod,
    pub customer_id: String,
    /// Reuses the decision recorded for this transaction when it scored the
    /// same customer, amount and currency.
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

impl ProcessPaymentRequest {
    pub fn new(
        amount: Decimal,
        currency: &str,
        payment_method: PaymentMethod,
        customer_id: &str,
    ) -> Self {
        Self {
            amount,
            currency: currency.to_string(),
            payment_method,
            customer_id: customer_id.to_string(),
            transaction_id: None,
            idempotency_key: None,
            ip_address: None,
            device_id: None,
            country: None,
        }
    }
}

pub(super) fn new_transaction_id() -> String {
    format!("txn_{}", Uuid::new_v4().simple())
}

impl LifecycleEngine {
    /// Validates, scores and processes a payment.
    ///
    /// `deny` stores a failed payment, `review` stores a pending one and
    /// `allow` captures through the charge gateway.
    #[instrument(skip(self, request), fields(customer_id = %request.customer_id, amount = %request.amount))]
    pub async fn handle_payment(&self, request: ProcessPaymentRequest) -> Result<Payment> {
        if request.customer_id.trim().is_empty() {
            return Err(EngineError::validation("customer_id is required"));
        }
        let currency = Currency::new(&request.currency)?;
        let amount = Amount::in_currency(request.amount, &currency)?;
        let idempotency_key = request
            .idempotency_key
            .filter(|key| !key.trim().is_empty());
        let draft = NewPayment {
            amount,
            currency,
            method: request.payment_method,
            customer_id: request.customer_id,
            invoice_id: None,
            idempotency_key: idempotency_key.clone(),
        };
        let network = Network {
            ip_address: request.ip_address,
            device_id: request.device_id,
            country: request.country,
        };

        let Some(key) = idempotency_key else {
            return self.charge(draft, request.transaction_id, network).await;
        };

        let _guard = self.locks.lock(format!("idempotency:{key}")).await;
        if let Some(existing) = self.stores.idempotency.get(&key).await? {
            let payment = fetch(&self.stores.payments, "payment", &existing.record.payment_id)
                .await?
                .record;
            if !payment.matches(&draft) {
                return Err(EngineError::validation(format!(
                    "Idempotency key '{key}' was already used with different parameters"
                )));
            }
            info!(payment_id = %payment.id, "returning payment for repeated idempotency key");
            return Ok(payment);
        }

        let payment = self.charge(draft, request.transaction_id, network).await?;
        let record = IdempotencyRecord {
            key,
            payment_id: payment.id.clone(),
            created_at: payment.created_at,
        };
        commit(&self.stores.idempotency, "idempotency key", 0, record).await?;
        Ok(payment)
    }

    /// Approves or declines a payment held for manual review.
    ///
    /// A payment for an invoice is resolved under the subscription lock and is
    /// only captured while that invoice is still payable; otherwise it fails
    /// with `invoice_closed` and no money moves.
    #[instrument(skip(self))]
    pub async fn resolve_payment_review(&self, payment_id: &str, approve: bool) -> Result<Payment> {
        let subscription_id = match self.get_payment(payment_id).await?.invoice_id {
            Some(invoice_id) => Some(self.get_invoice(&invoice_id).await?.subscription_id),
            None => None,
        };
        let _subscription_guard = match subscription_id.as_deref() {
            Some(id) => Some(self.locks.lock(subscription_lock(id)).await),
            None => None,
        };
        let _guard = self.locks.lock(payment_lock(payment_id)).await;

        let stored = fetch(&self.stores.payments, "payment", payment_id).await?;
        let mut payment = stored.record;
        payment.require(PaymentStatus::Pending, "resolve review of")?;
        let invoice = match payment.invoice_id.as_deref() {
            Some(invoice_id) => Some(fetch(&self.stores.invoices, "invoice", invoice_id).await?),
            None => None,
        };

        match &invoice {
            _ if !approve => payment.fail(FailureReason::ReviewDeclined, None, self.now())?,
            Some(closed) if !closed.record.is_payable() => {
                warn!(invoice_id = %closed.record.id, status = %closed.record.status, "reviewed payment targets a closed invoice");
                payment.fail(
                    FailureReason::InvoiceClosed,
                    Some(format!("Invoice {} is {}", closed.record.id, closed.record.status)),
                    self.now(),
                )?;
            }
            _ => self.capture(&mut payment).await?,
        }
        commit(&self.stores.payments, "payment", stored.version, payment.clone()).await?;
        info!(status = %payment.status, "payment review resolved");

        if payment.status == PaymentStatus::Succeeded
            && let Some(invoice) = invoice
        {
            self.settle_invoice(invoice, &payment).await?;
        }
        Ok(payment)
    }

    /// Refunds the full amount of a succeeded payment.
    #[instrument(skip(self))]
    pub async fn refund_payment(&self, payment_id: &str) -> Result<Refund> {
        let _guard = self.locks.lock(payment_lock(payment_id)).await;
        let stored = fetch(&self.stores.payments, "payment", payment_id).await?;
        let mut payment = stored.record;
        let refund = payment.refund(self.now())?;

        self.require_not_denied(
            refund.id.clone(),
            payment.customer_id.clone(),
            payment.amount,
            payment.currency.clone(),
        )
        .await?;

        commit(&self.stores.payments, "payment", stored.version, payment).await?;
        commit(&self.stores.refunds, "refund", 0, refund.clone()).await?;
        info!(refund_id = %refund.id, amount = %refund.amount, "payment refunded");
        Ok(refund)
    }

    pub async fn get_payment(&self, payment_id: &str) -> Result<Payment> {
        Ok(fetch(&self.stores.payments, "payment", payment_id).await?.record)
    }

    /// A customer's payments, oldest first.
    pub async fn list_customer_payments(&self, customer_id: &str) -> Result<Vec<Payment>> {
        let mut payments: Vec<Payment> = self
            .stores
            .payments
            .all()
            .await?
            .into_iter()
            .filter(|p| p.customer_id == customer_id)
            .collect();
        payments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(payments)
    }

    /// Risk gate, payment state machine and gateway capture for one new payment.
    /// The stored payment is returned whatever its final status.
    ///
    /// A caller-supplied `transaction_id` may back at most one live (pending or
    /// succeeded) payment. Its recorded assessment is reused only when it scored
    /// this customer, amount and currency; anything else is scored afresh.
    pub(super) async fn charge(
        &self,
        draft: NewPayment,
        transaction_id: Option<String>,
        network: Network,
    ) -> Result<Payment> {
        let Some(transaction_id) = transaction_id.filter(|id| !id.trim().is_empty()) else {
            let assessment = self
                .assess_and_record(
                    new_transaction_id(),
                    draft.customer_id.clone(),
                    draft.amount,
                    draft.currency.clone(),
                    network.clone(),
                )
                .await?;
            return self.open_payment(draft, assessment, network).await;
        };

        let _guard = self.locks.lock(transaction_lock(&transaction_id)).await;
        if let Some(live) = self.live_payment_for_transaction(&transaction_id).await? {
            return Err(EngineError::validation(format!(
                "Transaction {transaction_id} already backs payment {} ({})",
                live.id, live.status
            )));
        }

        let recorded = self
            .stores
            .risk_ledger
            .latest_for_transaction(&transaction_id)
            .await?;
        let assessment = match recorded {
            Some(assessment)
                if assessment.covers(&draft.customer_id, draft.amount, &draft.currency) =>
            {
                assessment
            }
            recorded => {
                if recorded.is_some() {
                    warn!(%transaction_id, "recorded assessment does not match payment, rescoring");
                }
                self.assess_and_record(
                    transaction_id,
                    draft.customer_id.clone(),
                    draft.amount,
                    draft.currency.clone(),
                    network.clone(),
                )
                .await?
            }
        };
        self.open_payment(draft, assessment, network).await
    }

    async fn open_payment(
        &self,
        draft: NewPayment,
        assessment: RiskAssessment,
        network: Network,
    ) -> Result<Payment> {
        let mut payment = Payment::open(draft, assessment.decision, assessment.id.clone(), self.now());
        match assessment.decision {
            RiskDecision::Allow => {
                payment.transaction_id = Some(assessment.transaction_id.clone());
                self.capture(&mut payment).await?;
            }
            RiskDecision::Review => {
                payment.transaction_id = Some(assessment.transaction_id.clone());
                warn!(payment_id = %payment.id, score = assessment.score, "payment held for review");
            }
            RiskDecision::Deny => {
                warn!(payment_id = %payment.id, score = assessment.score, "payment denied by risk");
            }
        }
        commit(&self.stores.payments, "payment", 0, payment.clone()).await?;
        info!(payment_id = %payment.id, status = %payment.status, "payment processed");

        if payment.status == PaymentStatus::Succeeded {
            self.remember_network(&payment.customer_id, &network).await?;
        }
        Ok(payment)
    }

    async fn live_payment_for_transaction(&self, transaction_id: &str) -> Result<Option<Payment>> {
        Ok(self.stores.payments.all().await?.into_iter().find(|p| {
            p.transaction_id.as_deref() == Some(transaction_id)
                && matches!(p.status, PaymentStatus::Pending | PaymentStatus::Succeeded)
        }))
    }

    /// Asks the gateway to move the money for a pending payment.
    async fn capture(&self, payment: &mut Payment) -> Result<()> {
        let request = ChargeRequest {
            payment_id: payment.id.clone(),
            customer_id: payment.customer_id.clone(),
            amount: payment.amount,
            currency: payment.currency.clone(),
            method: payment.payment_method,
        };
        match self.gateway.capture(&request).await? {
            ChargeOutcome::Approved => {
                let transaction_id = payment
                    .transaction_id
                    .clone()
                    .unwrap_or_else(new_transaction_id);
                payment.succeed(transaction_id, self.now())
            }
            ChargeOutcome::Declined(message) => {
                warn!(payment_id = %payment.id, %message, "gateway declined capture");
                payment.fail(FailureReason::GatewayDeclined, Some(message), self.now())
            }
        }
    }

    async fn remember_network(&self, customer_id: &str, network: &Network) -> Result<()> {
        if network.ip_address.is_none() && network.device_id.is_none() {
            return Ok(());
        }
        let _guard = self.locks.lock(customer_lock(customer_id)).await;
        let Some(stored) = self.stores.customers.get(customer_id).await? else {
            return Ok(());
        };
        let mut customer = stored.record;
        if customer.remember(network.ip_address.as_deref(), network.device_id.as_deref()) {
            commit(&self.stores.customers, "customer", stored.version, customer).await?;
        }
        Ok(())
    }
}
