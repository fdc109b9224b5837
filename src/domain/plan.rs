use super::money::{Amount, Currency};
use super::ports::Record;
use crate::error::{EngineError, Result};
use chrono::{DateTime, Months, Utc};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanInterval {
    Monthly,
    Quarterly,
    #[serde(alias = "yearly")]
    Annual,
}

impl PlanInterval {
    pub fn months(&self) -> u32 {
        match self {
            PlanInterval::Monthly => 1,
            PlanInterval::Quarterly => 3,
            PlanInterval::Annual => 12,
        }
    }

    /// Returns the end of a period starting at `start`.
    ///
    /// Month arithmetic clamps to the last day of shorter months
    /// (Jan 31 + 1 month = Feb 28/29).
    pub fn advance(&self, start: DateTime<Utc>) -> Result<DateTime<Utc>> {
        start
            .checked_add_months(Months::new(self.months()))
            .ok_or_else(|| EngineError::validation(format!("Billing period overflows from {start}")))
    }
}

impl fmt::Display for PlanInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PlanInterval::Monthly => "monthly",
            PlanInterval::Quarterly => "quarterly",
            PlanInterval::Annual => "annual",
        };
        f.write_str(label)
    }
}

/// Catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub amount: Amount,
    pub currency: Currency,
    pub interval: PlanInterval,
    #[serde(default)]
    pub features: Vec<String>,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_days: Option<u32>,
}

impl Plan {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(EngineError::validation("Plan id is required"));
        }
        if self.name.trim().is_empty() {
            return Err(EngineError::validation("Plan name is required"));
        }
        self.currency.check_scale(self.amount.value())?;
        if self.trial_days == Some(0) {
            return Err(EngineError::validation(
                "Trial length must be at least one day",
            ));
        }
        Ok(())
    }

    /// The billing terms a subscription keeps even if the plan is later deactivated.
    pub fn terms(&self) -> PlanTerms {
        PlanTerms {
            plan_id: self.id.clone(),
            plan_name: self.name.clone(),
            amount: self.amount,
            currency: self.currency.clone(),
            interval: self.interval,
        }
    }

    /// The catalog the platform ships with.
    pub fn default_catalog() -> Vec<Plan> {
        let usd = Currency::usd();
        vec![
            Plan {
                id: "plan_basic".to_string(),
                name: "Basic Plan".to_string(),
                description: "For small businesses just getting started".to_string(),
                amount: Amount::from_trusted(dec!(19.99)),
                currency: usd.clone(),
                interval: PlanInterval::Monthly,
                features: vec![
                    "Standard Payment Processing".to_string(),
                    "Basic Reporting".to_string(),
                    "Email Support".to_string(),
                ],
                is_active: true,
                trial_days: None,
            },
            Plan {
                id: "plan_premium".to_string(),
                name: "Premium Plan".to_string(),
                description: "For growing businesses with higher volume".to_string(),
                amount: Amount::from_trusted(dec!(49.99)),
                currency: usd.clone(),
                interval: PlanInterval::Monthly,
                features: vec![
                    "Advanced Payment Processing".to_string(),
                    "Detailed Analytics".to_string(),
                    "Priority Support".to_string(),
                    "Fraud Protection".to_string(),
                ],
                is_active: true,
                trial_days: None,
            },
            Plan {
                id: "plan_enterprise".to_string(),
                name: "Enterprise Plan".to_string(),
                description: "For large businesses with specialized needs".to_string(),
                amount: Amount::from_trusted(dec!(299.99)),
                currency: usd,
                interval: PlanInterval::Annual,
                features: vec![
                    "Custom Payment Solutions".to_string(),
                    "Advanced Analytics".to_string(),
                    "Dedicated Account Manager".to_string(),
                    "Premium Fraud Protection".to_string(),
                    "Custom Integrations".to_string(),
                ],
                is_active: true,
                trial_days: Some(14),
            },
        ]
    }
}

impl Record for Plan {
    const KIND: &'static str = "plans";

    fn key(&self) -> &str {
        &self.id
    }
}

/// Snapshot of a plan's billing terms held by a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanTerms {
    pub plan_id: String,
    pub plan_name: String,
    pub amount: Amount,
    pub currency: Currency,
    pub interval: PlanInterval,
}
