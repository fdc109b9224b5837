use crate::domain::ports::{ChargeGateway, ChargeOutcome, ChargeRequest};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use tracing::debug;

/// Approves every capture. The default processor.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproveAllGateway;

#[async_trait]
impl ChargeGateway for ApproveAllGateway {
    async fn capture(&self, request: &ChargeRequest) -> Result<ChargeOutcome> {
        debug!(payment_id = %request.payment_id, amount = %request.amount, "capture approved");
        Ok(ChargeOutcome::Approved)
    }
}

/// Declines captures for a fixed set of customers and approves the rest.
///
/// Used by simulations to exercise renewal failures.
#[derive(Debug, Clone, Default)]
pub struct DeclineListGateway {
    declined: HashSet<String>,
}

impl DeclineListGateway {
    pub fn new<I, S>(customers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            declined: customers.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl ChargeGateway for DeclineListGateway {
    async fn capture(&self, request: &ChargeRequest) -> Result<ChargeOutcome> {
        if self.declined.contains(&request.customer_id) {
            debug!(payment_id = %request.payment_id, "capture declined");
            return Ok(ChargeOutcome::Declined("Payment declined by issuer".to_string()));
        }
        Ok(ChargeOutcome::Approved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::{Amount, Currency};
    use crate::domain::payment::PaymentMethod;
    use rust_decimal_macros::dec;

    fn request(customer: &str) -> ChargeRequest {
        ChargeRequest {
            payment_id: "pmt_1".to_string(),
            customer_id: customer.to_string(),
            amount: Amount::new(dec!(10)).unwrap(),
            currency: Currency::usd(),
            method: PaymentMethod::Card,
        }
    }

    #[tokio::test]
    async fn test_decline_list() {
        let gateway = DeclineListGateway::new(["cus_bad"]);
        assert_eq!(
            gateway.capture(&request("cus_ok")).await.unwrap(),
            ChargeOutcome::Approved
        );
        assert!(matches!(
            gateway.capture(&request("cus_bad")).await.unwrap(),
            ChargeOutcome::Declined(_)
        ));
        assert_eq!(
            ApproveAllGateway.capture(&request("cus_bad")).await.unwrap(),
            ChargeOutcome::Approved
        );
    }
}
