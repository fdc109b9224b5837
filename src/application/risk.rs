use super::engine::LifecycleEngine;
use crate::domain::money::{Amount, Currency};
use crate::domain::payment::PaymentStatus;
use crate::domain::risk::{self, CustomerSignals, RiskAssessment, RiskContext, RiskDecision};
use crate::error::{EngineError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

/// Input of a standalone risk analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeTransactionRequest {
    pub transaction_id: String,
    pub user_id: String,
    pub amount: Decimal,
    pub currency: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    /// ISO country code the transaction originates from.
    #[serde(default)]
    pub country: Option<String>,
}

/// Network signals attached to a request, if any.
#[derive(Debug, Clone, Default, PartialEq)]
pub(super) struct Network {
    pub ip_address: Option<String>,
    pub device_id: Option<String>,
    pub country: Option<String>,
}

impl LifecycleEngine {
    /// Scores a transaction and appends the assessment to the risk ledger.
    #[instrument(skip(self, request), fields(transaction_id = %request.transaction_id, user_id = %request.user_id))]
    pub async fn handle_risk_analysis(
        &self,
        request: AnalyzeTransactionRequest,
    ) -> Result<RiskAssessment> {
        let currency = Currency::new(&request.currency)?;
        let amount = Amount::in_currency(request.amount, &currency)?;
        let network = Network {
            ip_address: request.ip_address,
            device_id: request.device_id,
            country: request.country,
        };
        self.assess_and_record(request.transaction_id, request.user_id, amount, currency, network)
            .await
    }

    pub async fn get_risk_assessment(&self, transaction_id: &str) -> Result<RiskAssessment> {
        self.stores
            .risk_ledger
            .latest_for_transaction(transaction_id)
            .await?
            .ok_or_else(|| EngineError::not_found("risk assessment", transaction_id))
    }

    pub async fn user_risk_history(&self, user_id: &str) -> Result<Vec<RiskAssessment>> {
        self.stores.risk_ledger.history_for_user(user_id).await
    }

    pub(super) async fn assess_and_record(
        &self,
        transaction_id: String,
        user_id: String,
        amount: Amount,
        currency: Currency,
        network: Network,
    ) -> Result<RiskAssessment> {
        let context = self
            .risk_context(transaction_id, user_id, amount, currency, network)
            .await?;
        let assessment = risk::assess(&context, &self.config.risk, self.noise.as_ref(), self.now())?;
        self.stores.risk_ledger.append(assessment.clone()).await?;

        match assessment.decision {
            RiskDecision::Allow => info!(
                score = assessment.score,
                factors = ?assessment.factors,
                "risk assessment recorded"
            ),
            decision => warn!(
                score = assessment.score,
                %decision,
                factors = ?assessment.factors,
                "risk assessment flagged transaction"
            ),
        }
        Ok(assessment)
    }

    /// Runs the risk gate in front of a state change: `deny` becomes a
    /// `RiskDeniedError`, anything else lets the change through.
    pub(super) async fn require_not_denied(
        &self,
        transaction_id: String,
        user_id: String,
        amount: Amount,
        currency: Currency,
    ) -> Result<RiskAssessment> {
        let assessment = self
            .assess_and_record(transaction_id, user_id, amount, currency, Network::default())
            .await?;
        if assessment.decision == RiskDecision::Deny {
            return Err(EngineError::RiskDeniedError {
                transaction_id: assessment.transaction_id,
                score: assessment.score,
            });
        }
        Ok(assessment)
    }

    async fn risk_context(
        &self,
        transaction_id: String,
        user_id: String,
        amount: Amount,
        currency: Currency,
        network: Network,
    ) -> Result<RiskContext> {
        let customer = self.stores.customers.get(&user_id).await?;
        let (signals, ip_seen_before, device_seen_before) = match customer {
            Some(stored) => {
                let customer = stored.record;
                let prior = self.succeeded_payment_count(&customer.id).await?;
                let ip_seen = network
                    .ip_address
                    .as_deref()
                    .is_some_and(|ip| customer.knows_ip(ip));
                let device_seen = network
                    .device_id
                    .as_deref()
                    .is_some_and(|device| customer.knows_device(device));
                (customer.signals(prior, self.now()), ip_seen, device_seen)
            }
            None => (CustomerSignals::default(), false, false),
        };

        Ok(RiskContext {
            transaction_id,
            user_id,
            amount,
            currency,
            customer: signals,
            ip_address: network.ip_address.filter(|ip| !ip.is_empty()),
            ip_seen_before,
            device_id: network.device_id.filter(|device| !device.is_empty()),
            device_seen_before,
            country: network
                .country
                .map(|country| country.trim().to_ascii_uppercase())
                .filter(|country| !country.is_empty()),
        })
    }

    async fn succeeded_payment_count(&self, customer_id: &str) -> Result<u32> {
        let payments = self.stores.payments.all().await?;
        let count = payments
            .iter()
            .filter(|p| p.customer_id == customer_id && p.status == PaymentStatus::Succeeded)
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}
