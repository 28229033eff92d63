use thiserror::Error;
use uuid::Uuid;

/// Error unificado del dominio de pagos.
///
/// Nota: un rechazo del emisor (declined) NO es un error; la operación
/// retorna la transacción persistida con status DECLINED.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaymentError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid transaction state: {0}")]
    InvalidState(String),

    #[error("Amount {requested} exceeds available {available}")]
    AmountExceedsAvailable { requested: i64, available: i64 },

    #[error("Gateway rejected the request: {0}")]
    GatewayRejected(String),

    #[error("Gateway call failed (transient): {0}")]
    Transient(String),

    #[error("Circuit breaker is open")]
    CircuitOpen,

    #[error("Upstream capacity exhausted")]
    Overloaded,

    #[error("Operation canceled")]
    Canceled,

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Secret store error: {0}")]
    SecretStore(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PaymentError {
    /// Clasificación de reintento: solo los errores transitorios se reintentan.
    pub fn is_transient(&self) -> bool {
        matches!(self, PaymentError::Transient(_))
    }
}
