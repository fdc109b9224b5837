//! Application layer containing the lifecycle orchestration.
//!
//! [`engine::LifecycleEngine`] is the only entry point callers use. Its
//! operations are spread over one module per concern; every write goes
//! through the keyed locks in [`locks`] and a versioned compare-and-swap.

mod billing;
pub mod engine;
pub mod locks;
mod payments;
mod risk;
mod subscriptions;

pub use billing::{BillingCycleReport, InvoiceSettlement};
pub use engine::{LifecycleEngine, Stores};
pub use payments::ProcessPaymentRequest;
pub use risk::AnalyzeTransactionRequest;
pub use subscriptions::{CreateSubscriptionRequest, SubscriptionOp};
