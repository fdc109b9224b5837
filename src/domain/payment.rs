use super::money::{Amount, Currency};
use super::ports::Record;
use super::risk::RiskDecision;
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    BankTransfer,
    Wallet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Failed | PaymentStatus::Refunded)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    RiskDenied,
    ReviewDeclined,
    GatewayDeclined,
    /// Approved after review, but the invoice it was paying had already been
    /// paid, voided or canceled.
    InvoiceClosed,
}

/// Validated input for a new payment.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPayment {
    pub amount: Amount,
    pub currency: Currency,
    pub method: PaymentMethod,
    pub customer_id: String,
    pub invoice_id: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub amount: Amount,
    pub currency: Currency,
    pub status: PaymentStatus,
    pub payment_method: PaymentMethod,
    pub customer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    pub risk_assessment_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// Creates a payment in the state the risk decision dictates.
    ///
    /// `deny` yields a `failed` payment; `allow` and `review` yield a `pending`
    /// one. An allowed payment still needs [`Payment::succeed`] or
    /// [`Payment::fail`] once the gateway answers; a reviewed one waits for
    /// manual resolution.
    pub fn open(
        draft: NewPayment,
        decision: RiskDecision,
        risk_assessment_id: String,
        now: DateTime<Utc>,
    ) -> Self {
        let (status, failure_reason) = match decision {
            RiskDecision::Deny => (PaymentStatus::Failed, Some(FailureReason::RiskDenied)),
            RiskDecision::Review | RiskDecision::Allow => (PaymentStatus::Pending, None),
        };
        Self {
            id: format!("pmt_{}", Uuid::new_v4().simple()),
            amount: draft.amount,
            currency: draft.currency,
            status,
            payment_method: draft.method,
            customer_id: draft.customer_id,
            transaction_id: None,
            risk_assessment_id,
            failure_reason,
            gateway_message: None,
            invoice_id: draft.invoice_id,
            idempotency_key: draft.idempotency_key,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn succeed(&mut self, transaction_id: String, now: DateTime<Utc>) -> Result<()> {
        self.require(PaymentStatus::Pending, "capture")?;
        self.status = PaymentStatus::Succeeded;
        self.transaction_id = Some(transaction_id);
        self.updated_at = now;
        Ok(())
    }

    pub fn fail(
        &mut self,
        reason: FailureReason,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.require(PaymentStatus::Pending, "fail")?;
        self.status = PaymentStatus::Failed;
        self.failure_reason = Some(reason);
        self.gateway_message = message;
        self.updated_at = now;
        Ok(())
    }

    /// Full-amount refund. Legal only from `succeeded`.
    pub fn refund(&mut self, now: DateTime<Utc>) -> Result<Refund> {
        self.require(PaymentStatus::Succeeded, "refund")?;
        self.status = PaymentStatus::Refunded;
        self.updated_at = now;
        Ok(Refund {
            id: format!("ref_{}", Uuid::new_v4().simple()),
            payment_id: self.id.clone(),
            amount: self.amount,
            currency: self.currency.clone(),
            status: RefundStatus::Succeeded,
            created_at: now,
        })
    }

    /// Ensures the payment is in `expected` before an `action`.
    pub fn require(&self, expected: PaymentStatus, action: &'static str) -> Result<()> {
        if self.status == expected {
            Ok(())
        } else {
            Err(EngineError::invalid_state(
                "payment",
                &self.id,
                self.status,
                action,
            ))
        }
    }

    /// Whether a retried request with the same idempotency key asks for the same charge.
    pub fn matches(&self, draft: &NewPayment) -> bool {
        self.amount == draft.amount
            && self.currency == draft.currency
            && self.customer_id == draft.customer_id
            && self.payment_method == draft.method
            && self.invoice_id == draft.invoice_id
    }
}

impl Record for Payment {
    const KIND: &'static str = "payments";

    fn key(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefundStatus {
    Succeeded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Refund {
    pub id: String,
    pub payment_id: String,
    pub amount: Amount,
    pub currency: Currency,
    pub status: RefundStatus,
    pub created_at: DateTime<Utc>,
}

impl Record for Refund {
    const KIND: &'static str = "refunds";

    fn key(&self) -> &str {
        &self.id
    }
}

/// Maps a caller-supplied idempotency key to the payment it created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub payment_id: String,
    pub created_at: DateTime<Utc>,
}

impl Record for IdempotencyRecord {
    const KIND: &'static str = "idempotency_keys";

    fn key(&self) -> &str {
        &self.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn draft() -> NewPayment {
        NewPayment {
            amount: Amount::new(dec!(125.50)).unwrap(),
            currency: Currency::usd(),
            method: PaymentMethod::Card,
            customer_id: "cus_1".to_string(),
            invoice_id: None,
            idempotency_key: None,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 4, 1, 10, 30, 0).unwrap()
    }

    #[test]
    fn test_deny_creates_failed_payment() {
        let payment = Payment::open(draft(), RiskDecision::Deny, "risk_1".into(), now());
        assert_eq!(payment.status, PaymentStatus::Failed);
        assert_eq!(payment.failure_reason, Some(FailureReason::RiskDenied));
        assert!(payment.transaction_id.is_none());
    }

    #[test]
    fn test_review_stays_pending() {
        let payment = Payment::open(draft(), RiskDecision::Review, "risk_1".into(), now());
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert!(payment.failure_reason.is_none());
    }

    #[test]
    fn test_capture_then_refund_once() {
        let mut payment = Payment::open(draft(), RiskDecision::Allow, "risk_1".into(), now());
        payment.succeed("txn_1".into(), now()).unwrap();
        assert_eq!(payment.status, PaymentStatus::Succeeded);
        assert_eq!(payment.amount.value(), dec!(125.50));

        let refund = payment.refund(now()).unwrap();
        assert_eq!(refund.amount, payment.amount);
        assert_eq!(refund.payment_id, payment.id);
        assert_eq!(payment.status, PaymentStatus::Refunded);

        assert!(matches!(
            payment.refund(now()),
            Err(EngineError::InvalidStateError { .. })
        ));
    }

    #[test]
    fn test_refund_requires_succeeded() {
        let mut pending = Payment::open(draft(), RiskDecision::Review, "risk_1".into(), now());
        assert!(matches!(
            pending.refund(now()),
            Err(EngineError::InvalidStateError { .. })
        ));
        assert_eq!(pending.status, PaymentStatus::Pending);

        let mut failed = Payment::open(draft(), RiskDecision::Deny, "risk_1".into(), now());
        assert!(failed.refund(now()).is_err());
        assert!(failed.succeed("txn_1".into(), now()).is_err());
        assert_eq!(failed.status, PaymentStatus::Failed);
    }

    #[test]
    fn test_fail_records_reason() {
        let mut payment = Payment::open(draft(), RiskDecision::Allow, "risk_1".into(), now());
        payment
            .fail(
                FailureReason::GatewayDeclined,
                Some("Payment declined by issuer".into()),
                now(),
            )
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Failed);
        assert!(payment.status.is_terminal());
        assert_eq!(payment.failure_reason, Some(FailureReason::GatewayDeclined));
    }

    #[test]
    fn test_status_serialization() {
        let payment = Payment::open(draft(), RiskDecision::Deny, "risk_1".into(), now());
        let json = serde_json::to_value(&payment).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["failure_reason"], "risk_denied");
        assert_eq!(json["payment_method"], "card");
        assert!(json.get("transaction_id").is_none());
    }
}
