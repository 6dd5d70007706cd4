use crate::domain::event::Provider;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Malformed notification: {0}")]
    MalformedNotification(String),
    #[error("Unknown {provider} status: {status}")]
    UnknownStatus { provider: Provider, status: String },
    #[error("Invalid {0} notification signature")]
    InvalidSignature(Provider),
    #[error("No adapter registered for provider {0}")]
    UnsupportedProvider(Provider),
    #[error("No purchase matches {provider} transaction {external_id}")]
    OrphanEvent {
        provider: Provider,
        external_id: String,
    },
    #[error("Payment for purchase {purchase} does not match: {detail}")]
    AmountMismatch { purchase: String, detail: String },
    #[error("Store transaction timed out after {0:?}")]
    TransactionTimeout(std::time::Duration),
    #[error("Store transaction conflict: {0}")]
    TransactionConflict(String),
    #[error("Delivery of {key} failed: {reason}")]
    DeliveryFailure { key: String, reason: String },
    #[error("Cache error: {0}")]
    CacheError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

impl ReconcileError {
    /// Whether re-running the whole event can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReconcileError::TransactionTimeout(_) | ReconcileError::TransactionConflict(_)
        )
    }
}

impl From<std::io::Error> for ReconcileError {
    fn from(err: std::io::Error) -> Self {
        ReconcileError::InternalError(Box::new(err))
    }
}

impl From<serde_json::Error> for ReconcileError {
    fn from(err: serde_json::Error) -> Self {
        ReconcileError::InternalError(Box::new(err))
    }
}

impl From<csv::Error> for ReconcileError {
    fn from(err: csv::Error) -> Self {
        ReconcileError::InternalError(Box::new(err))
    }
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for ReconcileError {
    fn from(err: rocksdb::Error) -> Self {
        ReconcileError::InternalError(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
