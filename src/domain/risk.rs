//! Deterministic, rule-weighted risk scoring.
//!
//! A [`RiskContext`] is turned into a score in `[0, 100]` by summing the weights
//! of the factors it triggers. The score is mapped to a [`RiskDecision`] using
//! the configured thresholds. The same context and configuration always yield
//! the same assessment unless a non-zero [`NoiseSource`] is installed.

use super::money::{Amount, Currency};
use super::ports::NoiseSource;
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskDecision {
    Allow,
    Review,
    Deny,
}

impl RiskDecision {
    pub fn from_score(score: u8, config: &RiskConfig) -> Self {
        if score >= config.deny_threshold {
            RiskDecision::Deny
        } else if score >= config.review_threshold {
            RiskDecision::Review
        } else {
            RiskDecision::Allow
        }
    }
}

impl fmt::Display for RiskDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RiskDecision::Allow => "allow",
            RiskDecision::Review => "review",
            RiskDecision::Deny => "deny",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactor {
    HighAmount,
    VeryHighAmount,
    NewUser,
    EstablishedUser,
    UnverifiedUser,
    VerifiedUser,
    LimitedHistory,
    SuspiciousIpAddress,
    UnusualIpAddress,
    CommonIpAddress,
    UnknownDevice,
    KnownDevice,
    UnusualLocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskWeights {
    pub high_amount: u32,
    pub very_high_amount: u32,
    pub new_user: u32,
    pub unverified_user: u32,
    pub limited_history: u32,
    pub suspicious_ip: u32,
    pub unusual_ip: u32,
    pub unknown_device: u32,
    pub unusual_location: u32,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            high_amount: 30,
            very_high_amount: 20,
            new_user: 15,
            unverified_user: 10,
            limited_history: 5,
            suspicious_ip: 35,
            unusual_ip: 20,
            unknown_device: 5,
            unusual_location: 70,
        }
    }
}

/// Operator-tunable scoring rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Scores at or above this value go to manual review.
    pub review_threshold: u8,
    /// Scores at or above this value are denied.
    pub deny_threshold: u8,
    pub high_amount_threshold: Decimal,
    pub very_high_amount_threshold: Decimal,
    pub new_account_days: i64,
    pub min_history: u32,
    pub flagged_ip_prefixes: Vec<String>,
    /// Country codes that do not trigger `unusual_location`. Empty disables the rule.
    pub allowed_countries: Vec<String>,
    pub weights: RiskWeights,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            review_threshold: 30,
            deny_threshold: 70,
            high_amount_threshold: dec!(1000),
            very_high_amount_threshold: dec!(5000),
            new_account_days: 7,
            min_history: 3,
            flagged_ip_prefixes: Vec::new(),
            allowed_countries: ["US", "CA", "UK", "EU"].map(String::from).to_vec(),
            weights: RiskWeights::default(),
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<()> {
        if self.review_threshold > self.deny_threshold {
            return Err(EngineError::validation(format!(
                "Review threshold {} exceeds deny threshold {}",
                self.review_threshold, self.deny_threshold
            )));
        }
        if self.deny_threshold > 100 {
            return Err(EngineError::validation("Deny threshold must be at most 100"));
        }
        if self.high_amount_threshold > self.very_high_amount_threshold {
            return Err(EngineError::validation(
                "High amount threshold exceeds very high amount threshold",
            ));
        }
        Ok(())
    }

    fn is_flagged_ip(&self, ip: &str) -> bool {
        self.flagged_ip_prefixes
            .iter()
            .any(|prefix| !prefix.is_empty() && ip.starts_with(prefix.as_str()))
    }

    fn is_unusual_country(&self, country: &str) -> bool {
        !self.allowed_countries.is_empty()
            && !self
                .allowed_countries
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(country))
    }
}

/// What is known about the customer behind a transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CustomerSignals {
    /// `None` when the customer is not registered.
    pub account_age_days: Option<i64>,
    pub verified: bool,
    /// Succeeded payments before this one; `None` when unknown.
    pub prior_payments: Option<u32>,
}

/// Everything the scorer looks at.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskContext {
    pub transaction_id: String,
    pub user_id: String,
    pub amount: Amount,
    pub currency: Currency,
    pub customer: CustomerSignals,
    pub ip_address: Option<String>,
    pub ip_seen_before: bool,
    pub device_id: Option<String>,
    pub device_seen_before: bool,
    /// Country code reported for the transaction, if any.
    pub country: Option<String>,
}

impl RiskContext {
    pub fn validate(&self) -> Result<()> {
        if self.transaction_id.trim().is_empty() {
            return Err(EngineError::validation("transaction_id is required"));
        }
        if self.user_id.trim().is_empty() {
            return Err(EngineError::validation("user_id is required"));
        }
        Ok(())
    }
}

/// Immutable record of one scoring run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub id: String,
    pub transaction_id: String,
    pub user_id: String,
    pub amount: Amount,
    pub currency: Currency,
    pub score: u8,
    pub factors: Vec<RiskFactor>,
    pub decision: RiskDecision,
    pub created_at: DateTime<Utc>,
}

impl RiskAssessment {
    /// Whether this assessment scored exactly this user, amount and currency.
    pub fn covers(&self, user_id: &str, amount: Amount, currency: &Currency) -> bool {
        self.user_id == user_id && self.amount == amount && &self.currency == currency
    }
}

/// Sums the weights of every factor the context triggers.
///
/// Returns the unclamped weight total and the triggered factors in evaluation
/// order. Neutral factors (e.g. `verified_user`) carry no weight but are still
/// reported.
pub fn evaluate(context: &RiskContext, config: &RiskConfig) -> (i64, Vec<RiskFactor>) {
    let weights = &config.weights;
    let mut total: i64 = 0;
    let mut factors = Vec::new();
    let mut hit = |factor: RiskFactor, weight: u32| {
        total += i64::from(weight);
        factors.push(factor);
    };

    let amount = context.amount.value();
    if amount > config.high_amount_threshold {
        hit(RiskFactor::HighAmount, weights.high_amount);
    }
    if amount > config.very_high_amount_threshold {
        hit(RiskFactor::VeryHighAmount, weights.very_high_amount);
    }

    match context.customer.account_age_days {
        Some(days) if days >= config.new_account_days => hit(RiskFactor::EstablishedUser, 0),
        _ => hit(RiskFactor::NewUser, weights.new_user),
    }

    if context.customer.verified {
        hit(RiskFactor::VerifiedUser, 0);
    } else {
        hit(RiskFactor::UnverifiedUser, weights.unverified_user);
    }

    if let Some(prior) = context.customer.prior_payments
        && prior < config.min_history
    {
        hit(RiskFactor::LimitedHistory, weights.limited_history);
    }

    if let Some(ip) = context.ip_address.as_deref() {
        if config.is_flagged_ip(ip) {
            hit(RiskFactor::SuspiciousIpAddress, weights.suspicious_ip);
        } else if context.ip_seen_before {
            hit(RiskFactor::CommonIpAddress, 0);
        } else {
            hit(RiskFactor::UnusualIpAddress, weights.unusual_ip);
        }
    }

    if context.device_id.is_some() {
        if context.device_seen_before {
            hit(RiskFactor::KnownDevice, 0);
        } else {
            hit(RiskFactor::UnknownDevice, weights.unknown_device);
        }
    }

    if let Some(country) = context.country.as_deref()
        && config.is_unusual_country(country)
    {
        hit(RiskFactor::UnusualLocation, weights.unusual_location);
    }

    (total, factors)
}

/// Scores a context and builds the assessment to be appended to the ledger.
pub fn assess(
    context: &RiskContext,
    config: &RiskConfig,
    noise: &dyn NoiseSource,
    now: DateTime<Utc>,
) -> Result<RiskAssessment> {
    context.validate()?;
    let (raw, factors) = evaluate(context, config);
    let score = (raw + i64::from(noise.offset(context))).clamp(0, 100) as u8;
    let decision = RiskDecision::from_score(score, config);

    Ok(RiskAssessment {
        id: format!("risk_{}", Uuid::new_v4().simple()),
        transaction_id: context.transaction_id.clone(),
        user_id: context.user_id.clone(),
        amount: context.amount,
        currency: context.currency.clone(),
        score,
        factors,
        decision,
        created_at: now,
    })
}

/// The production noise source: always zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZeroNoise;

impl NoiseSource for ZeroNoise {
    fn offset(&self, _context: &RiskContext) -> i32 {
        0
    }
}

/// Seeded jitter for simulation runs. Reproducible for a given seed and call order.
pub struct SeededNoise {
    rng: Mutex<StdRng>,
    spread: i32,
}

impl SeededNoise {
    pub fn new(seed: u64, spread: i32) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            spread: spread.abs(),
        }
    }
}

impl NoiseSource for SeededNoise {
    fn offset(&self, _context: &RiskContext) -> i32 {
        if self.spread == 0 {
            return 0;
        }
        match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(-self.spread..=self.spread),
            Err(_) => 0,
        }
    }
}
