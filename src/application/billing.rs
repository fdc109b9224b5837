use super::engine::{LifecycleEngine, commit, fetch, subscription_lock};
use super::risk::Network;
use crate::domain::invoice::{self, Invoice, InvoiceStatus};
use crate::domain::money::Amount;
use crate::domain::payment::{NewPayment, Payment, PaymentMethod, PaymentStatus};
use crate::domain::ports::Versioned;
use crate::domain::subscription::{Subscription, SubscriptionStatus};
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

/// What one billing run changed, by subscription or invoice id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BillingCycleReport {
    pub trials_activated: Vec<String>,
    pub renewed: Vec<String>,
    pub renewal_failures: Vec<String>,
    pub suspended: Vec<String>,
    pub expired: Vec<String>,
    pub canceled_at_period_end: Vec<String>,
    pub invoices_overdue: Vec<String>,
}

/// An invoice after a payment attempt, with the payment if one was made.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceSettlement {
    pub invoice: Invoice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<Payment>,
}

impl LifecycleEngine {
    pub async fn get_invoice(&self, invoice_id: &str) -> Result<Invoice> {
        Ok(fetch(&self.stores.invoices, "invoice", invoice_id).await?.record)
    }

    /// Invoices of a subscription in billing order.
    pub async fn subscription_invoices(&self, subscription_id: &str) -> Result<Vec<Invoice>> {
        let mut invoices: Vec<Invoice> = self
            .stores
            .invoices
            .all()
            .await?
            .into_iter()
            .filter(|i| i.subscription_id == subscription_id)
            .collect();
        invoices.sort_by(|a, b| {
            a.period_start
                .cmp(&b.period_start)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(invoices)
    }

    /// Charges an open or overdue invoice.
    ///
    /// Paying the renewal invoice a subscription is waiting on also renews it,
    /// which reactivates a suspended subscription.
    #[instrument(skip(self))]
    pub async fn pay_invoice(
        &self,
        invoice_id: &str,
        method: PaymentMethod,
    ) -> Result<InvoiceSettlement> {
        let subscription_id = self.get_invoice(invoice_id).await?.subscription_id;
        let _guard = self.locks.lock(subscription_lock(&subscription_id)).await;

        let stored = fetch(&self.stores.invoices, "invoice", invoice_id).await?;
        if !stored.record.is_payable() {
            return Err(EngineError::invalid_state(
                "invoice",
                invoice_id,
                stored.record.status,
                "pay",
            ));
        }
        let subscription =
            fetch(&self.stores.subscriptions, "subscription", &subscription_id).await?.record;
        if subscription.pending_invoice_id.as_deref() == Some(invoice_id)
            && !subscription.can_renew()
        {
            return Err(EngineError::invalid_state(
                "subscription",
                &subscription.id,
                subscription.status,
                "renew",
            ));
        }
        let (invoice, payment) = self.collect(stored, method).await?;
        if invoice.status == InvoiceStatus::Paid {
            self.renew_if_waiting(&invoice).await?;
        }
        Ok(InvoiceSettlement { invoice, payment })
    }

    #[instrument(skip(self))]
    pub async fn void_invoice(&self, invoice_id: &str) -> Result<Invoice> {
        self.close_invoice(invoice_id, |invoice, now| invoice.void(now))
            .await
    }

    #[instrument(skip(self))]
    pub async fn cancel_invoice(&self, invoice_id: &str) -> Result<Invoice> {
        self.close_invoice(invoice_id, |invoice, now| invoice.cancel(now))
            .await
    }

    /// Advances every subscription and invoice whose deadline has passed.
    ///
    /// Per subscription: ended trials activate (or cancel when requested),
    /// period-end cancellations close out, due renewals are invoiced and
    /// charged, and suspended subscriptions past their grace period expire.
    /// Each subscription renews at most once per run. Finally, open invoices
    /// past their due date become overdue.
    #[instrument(skip(self))]
    pub async fn run_billing_cycle(&self) -> Result<BillingCycleReport> {
        let mut report = BillingCycleReport::default();

        let mut ids: Vec<String> = self
            .stores
            .subscriptions
            .all()
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();
        ids.sort();
        for id in ids {
            if let Err(error) = self.advance_subscription(&id, &mut report).await {
                warn!(subscription_id = %id, %error, "billing run skipped subscription");
            }
        }

        let mut overdue: Vec<Invoice> = self
            .stores
            .invoices
            .all()
            .await?
            .into_iter()
            .filter(|i| i.is_past_due(self.now()))
            .collect();
        overdue.sort_by(|a, b| a.id.cmp(&b.id));
        for candidate in overdue {
            let _guard = self
                .locks
                .lock(subscription_lock(&candidate.subscription_id))
                .await;
            let stored = fetch(&self.stores.invoices, "invoice", &candidate.id).await?;
            let mut invoice = stored.record;
            if invoice.is_past_due(self.now()) {
                invoice.mark_overdue(self.now())?;
                commit(&self.stores.invoices, "invoice", stored.version, invoice).await?;
                report.invoices_overdue.push(candidate.id);
            }
        }

        info!(
            renewed = report.renewed.len(),
            failures = report.renewal_failures.len(),
            suspended = report.suspended.len(),
            expired = report.expired.len(),
            overdue = report.invoices_overdue.len(),
            "billing cycle complete"
        );
        Ok(report)
    }

    async fn advance_subscription(&self, id: &str, report: &mut BillingCycleReport) -> Result<()> {
        let _guard = self.locks.lock(subscription_lock(id)).await;
        let stored = fetch(&self.stores.subscriptions, "subscription", id).await?;
        let mut version = stored.version;
        let mut subscription = stored.record;
        let mut saved = subscription.clone();
        let now = self.now();
        let billing = &self.config.billing;

        if subscription.is_trial_over(now) {
            let status = subscription.end_trial(now)?;
            if status == SubscriptionStatus::Active {
                let mut first = invoice::generate(&subscription, subscription.period(), now)?;
                first.finalize(billing.invoice_grace_days, now)?;
                commit(&self.stores.invoices, "invoice", 0, first).await?;
                report.trials_activated.push(id.to_string());
            } else {
                report.canceled_at_period_end.push(id.to_string());
            }
        }

        if subscription.cancel_at_period_end && subscription.is_renewal_due(now) {
            subscription.cancel_at_end_of_period(now)?;
            self.void_pending_invoice(&mut subscription, now).await?;
            report.canceled_at_period_end.push(id.to_string());
        } else if subscription.is_renewal_due(now) {
            // The attachment must be stored before the charge so a failed
            // capture leaves the invoice reachable from the subscription.
            if self.issue_renewal_invoice(&mut subscription, now).await? {
                version = commit(
                    &self.stores.subscriptions,
                    "subscription",
                    version,
                    subscription.clone(),
                )
                .await?;
                saved = subscription.clone();
            }
            self.renew(&mut subscription, report).await?;
        }

        if subscription.is_expiry_due(billing.suspension_grace_days, now) {
            subscription.expire(billing.suspension_grace_days, now)?;
            self.void_pending_invoice(&mut subscription, now).await?;
            report.expired.push(id.to_string());
        }

        if subscription != saved {
            commit(&self.stores.subscriptions, "subscription", version, subscription).await?;
        }
        Ok(())
    }

    /// Attaches a new invoice for the next period unless a payable one is
    /// already pending. Returns whether an invoice was issued.
    async fn issue_renewal_invoice(
        &self,
        subscription: &mut Subscription,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if let Some(invoice_id) = subscription.pending_invoice_id.as_deref()
            && self
                .stores
                .invoices
                .get(invoice_id)
                .await?
                .is_some_and(|stored| stored.record.is_payable())
        {
            return Ok(false);
        }
        let period = subscription.next_period()?;
        let mut next = invoice::generate(subscription, period, now)?;
        next.finalize(self.config.billing.invoice_grace_days, now)?;
        commit(&self.stores.invoices, "invoice", 0, next.clone()).await?;
        subscription.attach_renewal_invoice(&next.id, now);
        info!(subscription_id = %subscription.id, invoice_id = %next.id, "renewal invoice issued");
        Ok(true)
    }

    /// One renewal attempt: charge the pending invoice.
    async fn renew(
        &self,
        subscription: &mut Subscription,
        report: &mut BillingCycleReport,
    ) -> Result<()> {
        let now = self.now();
        let Some(invoice_id) = subscription.pending_invoice_id.clone() else {
            return Ok(());
        };
        if let Some(held) = self.payment_under_review(&invoice_id).await? {
            info!(
                subscription_id = %subscription.id,
                payment_id = %held.id,
                "renewal waits on payment review"
            );
            return Ok(());
        }
        let stored = fetch(&self.stores.invoices, "invoice", &invoice_id).await?;

        let (invoice, _payment) = self.collect(stored, PaymentMethod::Card).await?;
        if invoice.status == InvoiceStatus::Paid {
            subscription.renew(now)?;
            report.renewed.push(subscription.id.clone());
            return Ok(());
        }

        report.renewal_failures.push(subscription.id.clone());
        let suspended =
            subscription.record_failed_renewal(self.config.billing.max_failed_renewals, now)?;
        if suspended {
            warn!(
                subscription_id = %subscription.id,
                failures = subscription.failed_renewals,
                "subscription suspended after failed renewals"
            );
            report.suspended.push(subscription.id.clone());
        }
        Ok(())
    }

    /// Voids the pending renewal invoice of a subscription that can no
    /// longer renew, and detaches it.
    pub(super) async fn void_pending_invoice(
        &self,
        subscription: &mut Subscription,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(invoice_id) = subscription.pending_invoice_id.take() else {
            return Ok(());
        };
        let pending = fetch(&self.stores.invoices, "invoice", &invoice_id).await?;
        let mut outstanding = pending.record;
        if outstanding.is_payable() {
            outstanding.void(now)?;
            commit(&self.stores.invoices, "invoice", pending.version, outstanding).await?;
            info!(subscription_id = %subscription.id, invoice_id, "pending invoice voided");
        }
        Ok(())
    }

    async fn payment_under_review(&self, invoice_id: &str) -> Result<Option<Payment>> {
        Ok(self.stores.payments.all().await?.into_iter().find(|p| {
            p.status == PaymentStatus::Pending && p.invoice_id.as_deref() == Some(invoice_id)
        }))
    }

    /// Pays `stored` when its total is not positive, otherwise charges it.
    /// The invoice is committed as paid only if the payment succeeded.
    async fn collect(
        &self,
        stored: Versioned<Invoice>,
        method: PaymentMethod,
    ) -> Result<(Invoice, Option<Payment>)> {
        let mut invoice = stored.record;
        let now = self.now();

        if let Some(held) = self.payment_under_review(&invoice.id).await? {
            warn!(invoice_id = %invoice.id, payment_id = %held.id, "invoice already awaiting review");
            return Err(EngineError::invalid_state(
                "invoice",
                &invoice.id,
                "awaiting payment review",
                "pay",
            ));
        }

        if invoice.amount <= Decimal::ZERO {
            invoice.mark_paid(None, now)?;
            commit(&self.stores.invoices, "invoice", stored.version, invoice.clone()).await?;
            info!(invoice_id = %invoice.id, "invoice settled by credit");
            return Ok((invoice, None));
        }

        let draft = NewPayment {
            amount: Amount::new(invoice.amount)?,
            currency: invoice.currency.clone(),
            method,
            customer_id: invoice.customer_id.clone(),
            invoice_id: Some(invoice.id.clone()),
            idempotency_key: None,
        };
        let payment = self.charge(draft, None, Network::default()).await?;
        if payment.status == PaymentStatus::Succeeded {
            invoice.mark_paid(Some(payment.id.clone()), now)?;
            commit(&self.stores.invoices, "invoice", stored.version, invoice.clone()).await?;
            info!(invoice_id = %invoice.id, payment_id = %payment.id, "invoice paid");
        } else {
            warn!(
                invoice_id = %invoice.id,
                payment_id = %payment.id,
                status = %payment.status,
                "invoice payment did not succeed"
            );
        }
        Ok((invoice, Some(payment)))
    }

    /// Marks an invoice paid by a payment approved after review, renewing the
    /// subscription if it was waiting on it.
    ///
    /// Caller holds the subscription lock and has checked the invoice is payable.
    pub(super) async fn settle_invoice(
        &self,
        stored: Versioned<Invoice>,
        payment: &Payment,
    ) -> Result<()> {
        let mut invoice = stored.record;
        invoice.mark_paid(Some(payment.id.clone()), self.now())?;
        commit(&self.stores.invoices, "invoice", stored.version, invoice.clone()).await?;
        self.renew_if_waiting(&invoice).await
    }

    /// Caller holds the subscription lock.
    async fn renew_if_waiting(&self, invoice: &Invoice) -> Result<()> {
        let stored = fetch(
            &self.stores.subscriptions,
            "subscription",
            &invoice.subscription_id,
        )
        .await?;
        let mut subscription = stored.record;
        if subscription.pending_invoice_id.as_deref() != Some(invoice.id.as_str()) {
            return Ok(());
        }
        subscription.renew(self.now())?;
        commit(
            &self.stores.subscriptions,
            "subscription",
            stored.version,
            subscription,
        )
        .await?;
        info!(subscription_id = %invoice.subscription_id, "subscription renewed by invoice payment");
        Ok(())
    }

    async fn close_invoice<F>(&self, invoice_id: &str, close: F) -> Result<Invoice>
    where
        F: FnOnce(&mut Invoice, DateTime<Utc>) -> Result<()>,
    {
        let subscription_id = self.get_invoice(invoice_id).await?.subscription_id;
        let _guard = self.locks.lock(subscription_lock(&subscription_id)).await;

        let stored = fetch(&self.stores.invoices, "invoice", invoice_id).await?;
        let mut invoice = stored.record;
        let now = self.now();
        close(&mut invoice, now)?;
        commit(&self.stores.invoices, "invoice", stored.version, invoice.clone()).await?;

        let stored = fetch(&self.stores.subscriptions, "subscription", &subscription_id).await?;
        let mut subscription = stored.record;
        if subscription.pending_invoice_id.as_deref() == Some(invoice_id) {
            subscription.detach_renewal_invoice(now);
            commit(
                &self.stores.subscriptions,
                "subscription",
                stored.version,
                subscription,
            )
            .await?;
        }
        info!(status = %invoice.status, "invoice closed");
        Ok(invoice)
    }
}
