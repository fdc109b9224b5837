use miette::Diagnostic;
use thiserror::Error;

/// Errors produced by the lifecycle engine and its adapters.
///
/// The first four variants form the caller-visible taxonomy; the rest are
/// infrastructure failures scoped to the single operation that hit them.
#[derive(Error, Debug, Diagnostic)]
pub enum EngineError {
    /// Malformed or missing input. Never mutates state.
    #[error("Validation error: {0}")]
    #[diagnostic(code(paylifecycle::validation))]
    ValidationError(String),

    #[error("{entity} not found: {id}")]
    #[diagnostic(code(paylifecycle::not_found))]
    NotFoundError { entity: &'static str, id: String },

    #[error("Cannot {action} {entity} {id} while {state}")]
    #[diagnostic(code(paylifecycle::invalid_state))]
    InvalidStateError {
        entity: &'static str,
        id: String,
        state: String,
        action: &'static str,
    },

    /// Blocked by a `deny` risk decision. Kept apart from validation so callers
    /// can show a different message.
    #[error("Transaction {transaction_id} denied by risk assessment (score {score})")]
    #[diagnostic(code(paylifecycle::risk_denied))]
    RiskDeniedError { transaction_id: String, score: u8 },

    #[error("Concurrent modification of {entity} {id}")]
    #[diagnostic(code(paylifecycle::conflict))]
    ConcurrencyConflict { entity: &'static str, id: String },

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[cfg(feature = "storage-rocksdb")]
    #[error("Storage error: {0}")]
    StorageError(#[from] rocksdb::Error),

    #[error("Internal error: {0}")]
    InternalError(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationError(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFoundError {
            entity,
            id: id.into(),
        }
    }

    pub fn invalid_state(
        entity: &'static str,
        id: impl Into<String>,
        state: impl ToString,
        action: &'static str,
    ) -> Self {
        Self::InvalidStateError {
            entity,
            id: id.into(),
            state: state.to_string(),
            action,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
