use crate::domain::payment::PaymentMethod;
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fmt;
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    RegisterCustomer,
    ProcessPayment,
    Refund,
    ResolveReview,
    Analyze,
    RiskHistory,
    Subscribe,
    Cancel,
    Upgrade,
    PayInvoice,
    VoidInvoice,
    CancelInvoice,
    Invoices,
    DeactivatePlan,
    Bill,
    Plans,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CommandKind::RegisterCustomer => "register_customer",
            CommandKind::ProcessPayment => "process_payment",
            CommandKind::Refund => "refund",
            CommandKind::ResolveReview => "resolve_review",
            CommandKind::Analyze => "analyze",
            CommandKind::RiskHistory => "risk_history",
            CommandKind::Subscribe => "subscribe",
            CommandKind::Cancel => "cancel",
            CommandKind::Upgrade => "upgrade",
            CommandKind::PayInvoice => "pay_invoice",
            CommandKind::VoidInvoice => "void_invoice",
            CommandKind::CancelInvoice => "cancel_invoice",
            CommandKind::Invoices => "invoices",
            CommandKind::DeactivatePlan => "deactivate_plan",
            CommandKind::Bill => "bill",
            CommandKind::Plans => "plans",
        };
        f.write_str(label)
    }
}

/// One row of the command file. Columns a command does not use stay empty.
///
/// `id` names the entity the command acts on (payment, subscription,
/// invoice or transaction); `at` moves the engine clock before the command
/// runs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Command {
    pub op: CommandKind,
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub method: Option<PaymentMethod>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub quantity: Option<u32>,
    #[serde(default)]
    pub flag: Option<bool>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl Command {
    /// The value of a column the command cannot run without.
    pub fn required<'a>(&self, column: &'static str, value: &'a Option<String>) -> Result<&'a str> {
        value
            .as_deref()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| EngineError::validation(format!("{} requires column '{column}'", self.op)))
    }
}

/// Reads commands from a CSV source.
///
/// This reader wraps `csv::Reader` and provides an iterator over `Result<Command>`.
/// It handles whitespace trimming and flexible record lengths automatically.
pub struct CommandReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> CommandReader<R> {
    /// Creates a new `CommandReader` from any `Read` source (e.g., File, Stdin).
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Returns an iterator that lazily reads and deserializes commands.
    pub fn commands(self) -> impl Iterator<Item = Result<Command>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(EngineError::from))
    }
}
