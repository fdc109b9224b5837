//! Subscription lifecycle.
//!
//! | From      | To        | Trigger                                         |
//! |-----------|-----------|-------------------------------------------------|
//! | Trial     | Active    | trial end reached                               |
//! | Trial     | Canceled  | cancel, or trial end with cancel-at-period-end  |
//! | Active    | Active    | plan change, successful renewal                 |
//! | Active    | Canceled  | cancel, or period end with cancel-at-period-end |
//! | Active    | Suspended | too many consecutive failed renewals            |
//! | Suspended | Active    | pending invoice paid                            |
//! | Suspended | Canceled  | cancel                                          |
//! | Suspended | Expired   | suspension grace period elapsed                 |
//!
//! Canceled and Expired are terminal.

use super::money::{Amount, Currency};
use super::plan::{Plan, PlanInterval, PlanTerms};
use super::ports::Record;
use crate::error::{EngineError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    Suspended,
    Canceled,
    Expired,
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Expired => "expired",
        };
        f.write_str(label)
    }
}

/// Half-open interval `[start, end)` with `end > start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BillingPeriod {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end <= start {
            return Err(EngineError::validation(format!(
                "Billing period end {end} must be after start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn starting_at(start: DateTime<Utc>, interval: PlanInterval) -> Result<Self> {
        Self::new(start, interval.advance(start)?)
    }

    /// The period that follows this one.
    pub fn following(&self, interval: PlanInterval) -> Result<Self> {
        Self::starting_at(self.end, interval)
    }

    /// Length in calendar days.
    pub fn days(&self) -> i64 {
        (self.end.date_naive() - self.start.date_naive()).num_days()
    }

    /// Whole calendar days from `at` until the period ends, within `[0, days()]`.
    pub fn remaining_days(&self, at: DateTime<Utc>) -> i64 {
        (self.end.date_naive() - at.date_naive())
            .num_days()
            .clamp(0, self.days())
    }
}

/// A plan change whose credit is still owed on the next invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proration {
    /// Terms that were billed for `period` and are being replaced.
    pub replaced: PlanTerms,
    pub period: BillingPeriod,
    pub changed_at: DateTime<Utc>,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub customer_id: String,
    pub plan_id: String,
    pub plan_name: String,
    pub amount: Amount,
    pub currency: Currency,
    pub interval: PlanInterval,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canceled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    pub quantity: u32,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub failed_renewals: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_invoice_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_proration: Option<Proration>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Starts a subscription on `plan`: in trial if the plan has one, otherwise active.
    pub fn create(
        plan: &Plan,
        customer_id: &str,
        quantity: u32,
        metadata: BTreeMap<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if customer_id.trim().is_empty() {
            return Err(EngineError::validation("customer_id is required"));
        }
        if quantity == 0 {
            return Err(EngineError::validation("Quantity must be at least 1"));
        }
        if !plan.is_active {
            return Err(EngineError::validation(format!(
                "Plan {} is not accepting new subscriptions",
                plan.id
            )));
        }

        let period = BillingPeriod::starting_at(now, plan.interval)?;
        let (status, trial_start, trial_end) = match plan.trial_days {
            Some(days) => (
                SubscriptionStatus::Trial,
                Some(now),
                Some(now + Duration::days(i64::from(days))),
            ),
            None => (SubscriptionStatus::Active, None, None),
        };

        let mut subscription = Self {
            id: format!("sub_{}", Uuid::new_v4().simple()),
            customer_id: customer_id.to_string(),
            plan_id: String::new(),
            plan_name: String::new(),
            amount: plan.amount,
            currency: plan.currency.clone(),
            interval: plan.interval,
            status,
            current_period_start: period.start,
            current_period_end: period.end,
            trial_start,
            trial_end,
            canceled_at: None,
            cancel_at_period_end: false,
            quantity,
            metadata,
            failed_renewals: 0,
            suspended_at: None,
            pending_invoice_id: None,
            pending_proration: None,
            created_at: now,
            updated_at: now,
        };
        subscription.apply_terms(plan.terms());
        Ok(subscription)
    }

    pub fn terms(&self) -> PlanTerms {
        PlanTerms {
            plan_id: self.plan_id.clone(),
            plan_name: self.plan_name.clone(),
            amount: self.amount,
            currency: self.currency.clone(),
            interval: self.interval,
        }
    }

    fn apply_terms(&mut self, terms: PlanTerms) {
        self.plan_id = terms.plan_id;
        self.plan_name = terms.plan_name;
        self.amount = terms.amount;
        self.currency = terms.currency;
        self.interval = terms.interval;
    }

    pub fn period(&self) -> BillingPeriod {
        BillingPeriod {
            start: self.current_period_start,
            end: self.current_period_end,
        }
    }

    pub fn next_period(&self) -> Result<BillingPeriod> {
        self.period().following(self.interval)
    }

    fn set_period(&mut self, period: BillingPeriod) {
        self.current_period_start = period.start;
        self.current_period_end = period.end;
    }

    fn invalid(&self, action: &'static str) -> EngineError {
        EngineError::invalid_state("subscription", &self.id, self.status, action)
    }

    pub fn is_trial_over(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Trial && self.trial_end.is_some_and(|end| now >= end)
    }

    pub fn is_renewal_due(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active && now >= self.current_period_end
    }

    pub fn is_expiry_due(&self, grace_days: u32, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Suspended
            && self
                .suspended_at
                .is_some_and(|at| now >= at + Duration::days(i64::from(grace_days)))
    }

    /// Leaves the trial: active, or canceled when cancellation was requested.
    pub fn end_trial(&mut self, now: DateTime<Utc>) -> Result<SubscriptionStatus> {
        if !self.is_trial_over(now) {
            return Err(self.invalid("end trial of"));
        }
        if self.cancel_at_period_end {
            self.status = SubscriptionStatus::Canceled;
            self.canceled_at = Some(now);
        } else {
            self.status = SubscriptionStatus::Active;
        }
        self.updated_at = now;
        Ok(self.status)
    }

    /// Cancels immediately, or flags the subscription to end with its current period.
    pub fn cancel(&mut self, at_period_end: bool, now: DateTime<Utc>) -> Result<()> {
        match self.status {
            SubscriptionStatus::Trial | SubscriptionStatus::Active if at_period_end => {
                self.cancel_at_period_end = true;
            }
            SubscriptionStatus::Trial
            | SubscriptionStatus::Active
            | SubscriptionStatus::Suspended => {
                self.status = SubscriptionStatus::Canceled;
                self.canceled_at = Some(now);
                self.pending_proration = None;
            }
            SubscriptionStatus::Canceled | SubscriptionStatus::Expired => {
                return Err(self.invalid("cancel"));
            }
        }
        self.updated_at = now;
        Ok(())
    }

    /// Period end reached with a cancellation request outstanding.
    pub fn cancel_at_end_of_period(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !(self.cancel_at_period_end && self.is_renewal_due(now)) {
            return Err(self.invalid("close out"));
        }
        self.status = SubscriptionStatus::Canceled;
        self.canceled_at = Some(now);
        self.pending_proration = None;
        self.updated_at = now;
        Ok(())
    }

    /// Switches to `plan` without touching the current period.
    ///
    /// When the current period was billed (active), the replaced terms are kept
    /// as a pending proration so the next invoice credits the unused time. Only
    /// the first change in a period records a proration; later ones just
    /// replace the target plan.
    pub fn change_plan(&mut self, plan: &Plan, now: DateTime<Utc>) -> Result<()> {
        if !matches!(
            self.status,
            SubscriptionStatus::Active | SubscriptionStatus::Trial
        ) {
            return Err(self.invalid("upgrade"));
        }
        if self.pending_invoice_id.is_some() {
            return Err(self.invalid("upgrade past-due"));
        }
        if plan.id == self.plan_id {
            return Err(EngineError::validation(format!(
                "Subscription {} is already on plan {}",
                self.id, plan.id
            )));
        }
        if !plan.is_active {
            return Err(EngineError::validation(format!(
                "Plan {} is not accepting new subscriptions",
                plan.id
            )));
        }
        if plan.currency != self.currency {
            return Err(EngineError::validation(format!(
                "Cannot move subscription {} from {} to {}",
                self.id, self.currency, plan.currency
            )));
        }

        if self.status == SubscriptionStatus::Active && self.pending_proration.is_none() {
            self.pending_proration = Some(Proration {
                replaced: self.terms(),
                period: self.period(),
                changed_at: now,
                quantity: self.quantity,
            });
        }
        self.apply_terms(plan.terms());
        self.updated_at = now;
        Ok(())
    }

    /// Remembers the invoice a renewal is trying to collect, and drops the
    /// proration it already carries.
    pub fn attach_renewal_invoice(&mut self, invoice_id: &str, now: DateTime<Utc>) {
        self.pending_invoice_id = Some(invoice_id.to_string());
        self.pending_proration = None;
        self.updated_at = now;
    }

    /// The pending invoice was voided or canceled; the next cycle issues a new one.
    pub fn detach_renewal_invoice(&mut self, now: DateTime<Utc>) {
        self.pending_invoice_id = None;
        self.updated_at = now;
    }

    /// Whether paying the pending invoice may still move the subscription on.
    pub fn can_renew(&self) -> bool {
        matches!(
            self.status,
            SubscriptionStatus::Active | SubscriptionStatus::Suspended
        )
    }

    /// The pending invoice was paid: move into the next period.
    pub fn renew(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.can_renew() {
            return Err(self.invalid("renew"));
        }
        let next = self.next_period()?;
        self.set_period(next);
        self.status = SubscriptionStatus::Active;
        self.failed_renewals = 0;
        self.suspended_at = None;
        self.pending_invoice_id = None;
        self.updated_at = now;
        Ok(())
    }

    /// Counts a failed renewal. Returns `true` when this failure suspended the subscription.
    pub fn record_failed_renewal(&mut self, max_failed: u32, now: DateTime<Utc>) -> Result<bool> {
        if self.status != SubscriptionStatus::Active {
            return Err(self.invalid("record failed renewal for"));
        }
        self.failed_renewals += 1;
        self.updated_at = now;
        if self.failed_renewals >= max_failed.max(1) {
            self.status = SubscriptionStatus::Suspended;
            self.suspended_at = Some(now);
            return Ok(true);
        }
        Ok(false)
    }

    pub fn expire(&mut self, grace_days: u32, now: DateTime<Utc>) -> Result<()> {
        if !self.is_expiry_due(grace_days, now) {
            return Err(self.invalid("expire"));
        }
        self.status = SubscriptionStatus::Expired;
        self.updated_at = now;
        Ok(())
    }
}

impl Record for Subscription {
    const KIND: &'static str = "subscriptions";

    fn key(&self) -> &str {
        &self.id
    }
}
