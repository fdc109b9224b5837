use super::money::{Currency, allocate};
use super::ports::Record;
use super::subscription::{BillingPeriod, Proration, Subscription};
use crate::error::{EngineError, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Overdue,
    Void,
    Canceled,
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Open => "open",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Void => "void",
            InvoiceStatus::Canceled => "canceled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub description: String,
    /// Negative for credits.
    pub unit_amount: Decimal,
    pub quantity: u32,
}

impl InvoiceItem {
    pub fn total(&self) -> Decimal {
        self.unit_amount * Decimal::from(self.quantity)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub subscription_id: String,
    pub customer_id: String,
    /// Always equal to the sum of the item totals.
    pub amount: Decimal,
    pub currency: Currency,
    pub status: InvoiceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub description: String,
    pub items: Vec<InvoiceItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Builds the invoice billing `subscription` for `period`.
///
/// One item for the plan charge, preceded by a credit item when the
/// subscription carries a pending proration. Items are rounded to the minor
/// unit and the last one absorbs the rounding residual.
pub fn generate(
    subscription: &Subscription,
    period: BillingPeriod,
    now: DateTime<Utc>,
) -> Result<Invoice> {
    let currency = subscription.currency.clone();
    let quantity = subscription.quantity;
    let unit = subscription.amount.value();

    let mut lines: Vec<(String, Decimal)> = Vec::with_capacity(2);
    if let Some(proration) = &subscription.pending_proration
        && let Some(credit) = unused_credit(proration)
    {
        lines.push((
            format!(
                "Unused time on {} after {}",
                proration.replaced.plan_name,
                proration.changed_at.date_naive()
            ),
            credit,
        ));
    }
    let charge_description = format!(
        "{} ({} to {})",
        subscription.plan_name,
        period.start.date_naive(),
        period.end.date_naive()
    );
    lines.push((charge_description, unit * Decimal::from(quantity)));

    let exact: Vec<Decimal> = lines.iter().map(|(_, amount)| *amount).collect();
    let rounded = allocate(&exact, &currency);
    let last = rounded.len() - 1;

    let items: Vec<InvoiceItem> = lines
        .into_iter()
        .zip(rounded)
        .enumerate()
        .map(|(index, ((description, _), amount))| {
            if index == last && amount == unit * Decimal::from(quantity) {
                InvoiceItem {
                    description,
                    unit_amount: unit,
                    quantity,
                }
            } else {
                InvoiceItem {
                    description,
                    unit_amount: amount,
                    quantity: 1,
                }
            }
        })
        .collect();
    let amount = items.iter().map(InvoiceItem::total).sum();

    Ok(Invoice {
        id: format!("inv_{}", Uuid::new_v4().simple()),
        subscription_id: subscription.id.clone(),
        customer_id: subscription.customer_id.clone(),
        amount,
        currency,
        status: InvoiceStatus::Draft,
        due_date: None,
        paid_at: None,
        payment_id: None,
        period_start: period.start,
        period_end: period.end,
        description: format!("Subscription {} - {}", subscription.id, subscription.plan_name),
        items,
        created_at: now,
        updated_at: now,
    })
}

/// Negative, unrounded credit for the unused part of the replaced plan.
fn unused_credit(proration: &Proration) -> Option<Decimal> {
    let period_days = proration.period.days();
    let remaining = proration.period.remaining_days(proration.changed_at);
    if period_days <= 0 || remaining <= 0 {
        return None;
    }
    let billed = proration.replaced.amount.value() * Decimal::from(proration.quantity);
    Some(-(billed * Decimal::from(remaining) / Decimal::from(period_days)))
}

impl Invoice {
    fn invalid(&self, action: &'static str) -> EngineError {
        EngineError::invalid_state("invoice", &self.id, self.status, action)
    }

    /// Draft → open; the invoice becomes due `grace_days` after its period ends.
    pub fn finalize(&mut self, grace_days: u32, now: DateTime<Utc>) -> Result<()> {
        if self.status != InvoiceStatus::Draft {
            return Err(self.invalid("finalize"));
        }
        self.status = InvoiceStatus::Open;
        self.due_date = Some(self.period_end + Duration::days(i64::from(grace_days)));
        self.updated_at = now;
        Ok(())
    }

    pub fn is_payable(&self) -> bool {
        matches!(self.status, InvoiceStatus::Open | InvoiceStatus::Overdue)
    }

    pub fn mark_paid(&mut self, payment_id: Option<String>, now: DateTime<Utc>) -> Result<()> {
        if !self.is_payable() {
            return Err(self.invalid("pay"));
        }
        self.status = InvoiceStatus::Paid;
        self.paid_at = Some(now);
        self.payment_id = payment_id;
        self.updated_at = now;
        Ok(())
    }

    pub fn is_past_due(&self, now: DateTime<Utc>) -> bool {
        self.status == InvoiceStatus::Open && self.due_date.is_some_and(|due| now > due)
    }

    pub fn mark_overdue(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.is_past_due(now) {
            return Err(self.invalid("mark overdue"));
        }
        self.status = InvoiceStatus::Overdue;
        self.updated_at = now;
        Ok(())
    }

    pub fn void(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.is_payable() {
            return Err(self.invalid("void"));
        }
        self.status = InvoiceStatus::Void;
        self.updated_at = now;
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !matches!(self.status, InvoiceStatus::Draft | InvoiceStatus::Open) {
            return Err(self.invalid("cancel"));
        }
        self.status = InvoiceStatus::Canceled;
        self.updated_at = now;
        Ok(())
    }

    pub fn items_total(&self) -> Decimal {
        self.items.iter().map(InvoiceItem::total).sum()
    }
}

impl Record for Invoice {
    const KIND: &'static str = "invoices";

    fn key(&self) -> &str {
        &self.id
    }
}
