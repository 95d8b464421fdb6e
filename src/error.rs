use crate::domain::pending_payment::{PaymentState, Transition};
use crate::domain::reconciliation::ReconciliationResult;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Reference not found: {0}")]
    ReferenceNotFound(String),
    #[error("Reference expired: {0}")]
    ReferenceExpired(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Illegal transition {transition:?} from state {from}")]
    IllegalTransition {
        transition: Transition,
        from: PaymentState,
    },
    #[error("Bank transaction {0} already settled another payment")]
    TransactionAlreadyApplied(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Transient store error: {0}")]
    TransientStore(String),
    /// The state transition committed but its audit record could not be written.
    #[error("Audit write failed for committed outcome on {}: {source}", outcome.reference)]
    AuditWriteFailed {
        outcome: Box<ReconciliationResult>,
        source: Box<PaymentError>,
    },
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

impl PaymentError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, PaymentError::TransientStore(_))
    }
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for PaymentError {
    fn from(e: rocksdb::Error) -> Self {
        PaymentError::TransientStore(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PaymentError>;
