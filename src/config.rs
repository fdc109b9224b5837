use crate::domain::plan::Plan;
use crate::domain::risk::RiskConfig;
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    /// Days after period end before an open invoice becomes overdue.
    pub invoice_grace_days: u32,
    /// Consecutive failed renewals that suspend a subscription.
    pub max_failed_renewals: u32,
    /// Days a suspended subscription waits for payment before it expires.
    pub suspension_grace_days: u32,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            invoice_grace_days: 0,
            max_failed_renewals: 2,
            suspension_grace_days: 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub risk: RiskConfig,
    pub billing: BillingConfig,
    /// Plans seeded into an empty catalog.
    pub catalog: Vec<Plan>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            risk: RiskConfig::default(),
            billing: BillingConfig::default(),
            catalog: Plan::default_catalog(),
        }
    }
}

impl EngineConfig {
    /// Reads a JSON config file. Missing fields take their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Applies `RISK_REVIEW_THRESHOLD`, `RISK_DENY_THRESHOLD`,
    /// `RISK_ALLOWED_COUNTRIES` (comma separated), `INVOICE_GRACE_DAYS`,
    /// `MAX_FAILED_RENEWALS` and `SUSPENSION_GRACE_DAYS` from `lookup`, then
    /// validates the result.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_with(&lookup, "RISK_REVIEW_THRESHOLD", &mut self.risk.review_threshold)?;
        override_with(&lookup, "RISK_DENY_THRESHOLD", &mut self.risk.deny_threshold)?;
        if let Some(raw) = lookup("RISK_ALLOWED_COUNTRIES") {
            self.risk.allowed_countries = raw
                .split(',')
                .map(|code| code.trim().to_ascii_uppercase())
                .filter(|code| !code.is_empty())
                .collect();
        }
        override_with(&lookup, "INVOICE_GRACE_DAYS", &mut self.billing.invoice_grace_days)?;
        override_with(&lookup, "MAX_FAILED_RENEWALS", &mut self.billing.max_failed_renewals)?;
        override_with(
            &lookup,
            "SUSPENSION_GRACE_DAYS",
            &mut self.billing.suspension_grace_days,
        )?;
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        self.risk.validate()?;
        if self.billing.max_failed_renewals == 0 {
            return Err(EngineError::validation(
                "MAX_FAILED_RENEWALS must be at least 1",
            ));
        }
        for plan in &self.catalog {
            plan.validate()?;
        }
        Ok(())
    }
}

fn override_with<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else {
        return Ok(());
    };
    match raw.trim().parse() {
        Ok(value) => {
            *target = value;
            Ok(())
        }
        Err(_) => {
            warn!(key, value = %raw, "rejecting unparsable configuration override");
            Err(EngineError::validation(format!("Invalid value '{raw}' for {key}")))
        }
    }
}
