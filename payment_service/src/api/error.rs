use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::domain::error::PaymentError;

// Error unificado de la API del servicio de pagos
#[derive(Debug)]
pub struct ApiError(pub PaymentError);

impl From<PaymentError> for ApiError {
    fn from(err: PaymentError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self.0 {
            PaymentError::Validation(_) => (StatusCode::BAD_REQUEST, self.0.to_string()),
            PaymentError::Unauthorized(_) => (StatusCode::FORBIDDEN, self.0.to_string()),
            PaymentError::NotFound(_) => (StatusCode::NOT_FOUND, self.0.to_string()),
            PaymentError::InvalidState(_) => (StatusCode::CONFLICT, self.0.to_string()),
            PaymentError::AmountExceedsAvailable { .. } => {
                (StatusCode::CONFLICT, self.0.to_string())
            }
            PaymentError::GatewayRejected(_) => (StatusCode::BAD_GATEWAY, self.0.to_string()),
            PaymentError::CircuitOpen | PaymentError::Overloaded => {
                (StatusCode::SERVICE_UNAVAILABLE, self.0.to_string())
            }
            PaymentError::Canceled => (StatusCode::GATEWAY_TIMEOUT, self.0.to_string()),
            PaymentError::Transient(e) => {
                tracing::error!("unretried transient error reached the API: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            PaymentError::Repository(e) => {
                tracing::error!("Database Repository Error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            PaymentError::SecretStore(e) => {
                tracing::error!("Secret Store Error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            PaymentError::Internal(e) => {
                tracing::error!("Internal invariant break: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "status": "error",
            "message": error_message,
        }));

        (status, body).into_response()
    }
}
