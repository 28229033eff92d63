pub mod browser_post;
pub mod capture_payment;
pub mod get_transaction;
pub mod payment_methods;
pub mod process_payment;
pub mod refund_payment;
pub mod subscriptions;
pub mod void_payment;
pub mod webhook_subscriptions;

use crate::domain::entities::{Transaction, TransactionStatus, WebhookEvent};
use crate::domain::error::PaymentError;
use crate::domain::gateways::{
    CardGateway, GatewayCredentials, GatewayResponse, ServerPostRequest,
};
use crate::domain::repository::{GroupOperation, TransactionOutcome};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

/// Mapea la respuesta normalizada del gateway al resultado persistible.
/// Un decline es un resultado de negocio: fila con status DECLINED.
pub(crate) fn outcome_from_response(
    transaction_id: Uuid,
    response: &GatewayResponse,
) -> TransactionOutcome {
    TransactionOutcome {
        transaction_id,
        status: if response.approved {
            TransactionStatus::APPROVED
        } else {
            TransactionStatus::DECLINED
        },
        gateway_response_code: Some(response.response_code.clone()),
        authorization_code: response.authorization_code.clone(),
        reuse_token: response.gateway_ref.clone(),
    }
}

/// Resultado persistible de un rechazo de protocolo (fila con status ERROR).
pub(crate) fn error_outcome(transaction_id: Uuid) -> TransactionOutcome {
    TransactionOutcome {
        transaction_id,
        status: TransactionStatus::ERROR,
        gateway_response_code: None,
        authorization_code: None,
        reuse_token: None,
    }
}

/// Tramo final compartido por todas las operaciones que cambian estado:
/// llama al gateway con la fila PENDING ya insertada y el lock tomado,
/// registra el resultado y el evento de outbox, y confirma.
///
/// - Respuesta del gateway (aprobada o declinada): fila confirmada.
/// - GatewayRejected: fila confirmada con status ERROR y el error se propaga.
/// - CircuitOpen / Overloaded / Canceled: rollback, ninguna fila queda.
pub(crate) async fn finalize_with_gateway(
    mut op: Box<dyn GroupOperation>,
    gateway: &dyn CardGateway,
    credentials: &GatewayCredentials,
    request: &ServerPostRequest,
    cancel: &CancellationToken,
) -> Result<Transaction, PaymentError> {
    match gateway.server_post(credentials, request, cancel).await {
        Ok(response) => {
            let committed = op
                .record_outcome(outcome_from_response(request.transaction_id, &response))
                .await?;
            op.enqueue_event(&WebhookEvent::for_transaction(&committed)).await?;
            op.commit().await?;
            Ok(committed)
        }
        Err(err @ PaymentError::GatewayRejected(_)) => {
            let committed = op.record_outcome(error_outcome(request.transaction_id)).await?;
            op.enqueue_event(&WebhookEvent::for_transaction(&committed)).await?;
            op.commit().await?;
            warn!(transaction_id = %request.transaction_id, "gateway rejected the request");
            Err(err)
        }
        Err(err) => {
            drop(op);
            Err(err)
        }
    }
}
