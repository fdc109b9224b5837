use crate::error::{EngineError, Result};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// ISO-4217 style currency code (three uppercase ASCII letters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    pub fn new(code: &str) -> Result<Self> {
        let code = code.trim().to_ascii_uppercase();
        if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
            Ok(Self(code))
        } else {
            Err(EngineError::validation(format!(
                "Invalid currency code '{code}'"
            )))
        }
    }

    pub fn usd() -> Self {
        Self("USD".to_string())
    }

    pub fn code(&self) -> &str {
        &self.0
    }

    /// Number of decimal places of the smallest currency unit.
    pub fn minor_units(&self) -> u32 {
        match self.0.as_str() {
            "JPY" | "KRW" | "VND" | "CLP" | "ISK" => 0,
            "BHD" | "KWD" | "OMR" | "JOD" | "TND" => 3,
            _ => 2,
        }
    }

    /// Rounds to the smallest currency unit, half away from zero.
    pub fn round(&self, value: Decimal) -> Decimal {
        value.round_dp_with_strategy(self.minor_units(), RoundingStrategy::MidpointAwayFromZero)
    }

    /// Rejects values carrying more precision than the currency allows.
    pub fn check_scale(&self, value: Decimal) -> Result<()> {
        if value.normalize().scale() > self.minor_units() {
            return Err(EngineError::validation(format!(
                "Amount {value} has more than {} decimal places for {}",
                self.minor_units(),
                self.0
            )));
        }
        Ok(())
    }
}

impl TryFrom<String> for Currency {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<Currency> for String {
    fn from(currency: Currency) -> Self {
        currency.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A strictly positive monetary amount.
///
/// Payments and plan prices are always positive; signed values (credits on an
/// invoice) are plain `Decimal`s.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(EngineError::validation("Amount must be positive"))
        }
    }

    /// For literals known to be positive at compile time.
    pub(crate) fn from_trusted(value: Decimal) -> Self {
        debug_assert!(value > Decimal::ZERO);
        Self(value)
    }

    /// Builds an amount that is valid for `currency` (positive, no sub-minor digits).
    pub fn in_currency(value: Decimal, currency: &Currency) -> Result<Self> {
        let amount = Self::new(value)?;
        currency.check_scale(value)?;
        Ok(amount)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = EngineError;

    fn try_from(value: Decimal) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Splits `exact` line amounts into rounded amounts whose sum equals the
/// rounded sum of the exact values. The last entry absorbs the residual.
pub fn allocate(exact: &[Decimal], currency: &Currency) -> Vec<Decimal> {
    let Some((_, rest)) = exact.split_last() else {
        return Vec::new();
    };
    let total = currency.round(exact.iter().copied().sum());
    let mut rounded: Vec<Decimal> = rest.iter().map(|v| currency.round(*v)).collect();
    let allocated: Decimal = rounded.iter().copied().sum();
    rounded.push(total - allocated);
    rounded
}
