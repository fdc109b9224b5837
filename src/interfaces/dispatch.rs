use super::csv::command_reader::{Command, CommandKind};
use crate::application::{
    AnalyzeTransactionRequest, CreateSubscriptionRequest, LifecycleEngine, ProcessPaymentRequest,
    SubscriptionOp,
};
use crate::domain::customer::NewCustomer;
use crate::domain::payment::PaymentMethod;
use crate::error::{EngineError, Result};
use crate::infrastructure::clock::ManualClock;
use serde::Serialize;
use serde_json::Value;

/// Runs one command against the engine and returns its result as JSON.
///
/// Only marshalling happens here; every rule lives in the engine.
pub async fn execute(engine: &LifecycleEngine, clock: &ManualClock, command: Command) -> Result<Value> {
    if let Some(at) = command.at {
        clock.set(at);
    }

    match command.op {
        CommandKind::RegisterCustomer => {
            let input = NewCustomer {
                id: command.customer.clone(),
                name: command.required("name", &command.name)?.to_string(),
                email: command.required("email", &command.email)?.to_string(),
                verified: command.flag.unwrap_or(false),
                ..Default::default()
            };
            json(engine.register_customer(input).await?)
        }
        CommandKind::ProcessPayment => {
            let mut request = ProcessPaymentRequest::new(
                amount(&command)?,
                command.currency.as_deref().unwrap_or("USD"),
                command.method.unwrap_or(PaymentMethod::Card),
                command.required("customer", &command.customer)?,
            );
            request.transaction_id = command.id.clone();
            request.idempotency_key = command.key.clone();
            request.ip_address = command.ip.clone();
            request.device_id = command.device.clone();
            request.country = command.country.clone();
            json(engine.handle_payment(request).await?)
        }
        CommandKind::Refund => json(engine.refund_payment(command.required("id", &command.id)?).await?),
        CommandKind::ResolveReview => {
            let payment_id = command.required("id", &command.id)?;
            json(
                engine
                    .resolve_payment_review(payment_id, command.flag.unwrap_or(false))
                    .await?,
            )
        }
        CommandKind::Analyze => {
            let request = AnalyzeTransactionRequest {
                transaction_id: command.required("id", &command.id)?.to_string(),
                user_id: command.required("customer", &command.customer)?.to_string(),
                amount: amount(&command)?,
                currency: command.currency.clone().unwrap_or_else(|| "USD".to_string()),
                ip_address: command.ip.clone(),
                device_id: command.device.clone(),
                country: command.country.clone(),
            };
            json(engine.handle_risk_analysis(request).await?)
        }
        CommandKind::RiskHistory => {
            let user = command.required("customer", &command.customer)?;
            json(engine.user_risk_history(user).await?)
        }
        CommandKind::Subscribe => {
            let mut request = CreateSubscriptionRequest::new(
                command.required("customer", &command.customer)?,
                command.required("plan", &command.plan)?,
            );
            request.quantity = command.quantity.unwrap_or(1);
            json(engine.handle_subscription_op(SubscriptionOp::Create(request)).await?)
        }
        CommandKind::Cancel => {
            let op = SubscriptionOp::Cancel {
                subscription_id: command.required("id", &command.id)?.to_string(),
                at_period_end: command.flag.unwrap_or(false),
            };
            json(engine.handle_subscription_op(op).await?)
        }
        CommandKind::Upgrade => {
            let op = SubscriptionOp::Upgrade {
                subscription_id: command.required("id", &command.id)?.to_string(),
                plan_id: command.required("plan", &command.plan)?.to_string(),
            };
            json(engine.handle_subscription_op(op).await?)
        }
        CommandKind::PayInvoice => {
            let invoice_id = command.required("id", &command.id)?;
            let method = command.method.unwrap_or(PaymentMethod::Card);
            json(engine.pay_invoice(invoice_id, method).await?)
        }
        CommandKind::VoidInvoice => json(engine.void_invoice(command.required("id", &command.id)?).await?),
        CommandKind::CancelInvoice => {
            json(engine.cancel_invoice(command.required("id", &command.id)?).await?)
        }
        CommandKind::Invoices => {
            let subscription_id = command.required("id", &command.id)?;
            json(engine.subscription_invoices(subscription_id).await?)
        }
        CommandKind::DeactivatePlan => {
            json(engine.deactivate_plan(command.required("plan", &command.plan)?).await?)
        }
        CommandKind::Bill => json(engine.run_billing_cycle().await?),
        CommandKind::Plans => json(engine.list_plans().await?),
    }
}

fn amount(command: &Command) -> Result<rust_decimal::Decimal> {
    command
        .amount
        .ok_or_else(|| EngineError::validation(format!("{} requires column 'amount'", command.op)))
}

fn json<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}
