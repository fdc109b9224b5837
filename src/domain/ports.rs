use super::money::{Amount, Currency};
use super::payment::PaymentMethod;
use super::risk::{RiskAssessment, RiskContext};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// An entity persisted under a string key.
pub trait Record: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Name of the collection (column family, table) holding this entity.
    const KIND: &'static str;

    fn key(&self) -> &str;
}

/// A record together with the version it was read at.
///
/// Versions start at 1 on first insert and grow by one on every write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: u64,
    pub record: T,
}

#[async_trait]
pub trait RecordStore<T: Record>: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Versioned<T>>>;

    /// Unconditional write. Returns the new version.
    async fn put(&self, record: T) -> Result<u64>;

    /// Writes `record` only if the stored version equals `expected_version`
    /// (`0` means the key must be absent). Returns `false` on mismatch.
    async fn compare_and_swap(&self, expected_version: u64, record: T) -> Result<bool>;

    async fn all(&self) -> Result<Vec<T>>;
}

pub type RecordStoreBox<T> = Box<dyn RecordStore<T>>;
pub type RecordStoreFactory<T> = Box<dyn Fn() -> RecordStoreBox<T> + Send + Sync>;

/// Append-only log of risk assessments.
#[async_trait]
pub trait RiskLedger: Send + Sync {
    async fn append(&self, assessment: RiskAssessment) -> Result<()>;

    /// Most recently appended assessment for a transaction.
    async fn latest_for_transaction(&self, transaction_id: &str) -> Result<Option<RiskAssessment>>;

    /// Every assessment for a user, in append order.
    async fn history_for_user(&self, user_id: &str) -> Result<Vec<RiskAssessment>>;
}

pub type RiskLedgerBox = Box<dyn RiskLedger>;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// A capture request sent to the payment processor once risk allows it.
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub payment_id: String,
    pub customer_id: String,
    pub amount: Amount,
    pub currency: Currency,
    pub method: PaymentMethod,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChargeOutcome {
    Approved,
    Declined(String),
}

/// The external processor that actually moves money.
#[async_trait]
pub trait ChargeGateway: Send + Sync {
    async fn capture(&self, request: &ChargeRequest) -> Result<ChargeOutcome>;
}

pub type ChargeGatewayBox = Box<dyn ChargeGateway>;

/// Offset added to a computed risk score. Only simulations use a non-zero source.
pub trait NoiseSource: Send + Sync {
    fn offset(&self, context: &RiskContext) -> i32;
}
