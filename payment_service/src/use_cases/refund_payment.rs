//! Reembolso (total o parcial) sobre un SALE aprobado o una autorización
//! con capturas.
//!
//! El tope acumulado (reembolsado + nuevo ≤ capturado) se re-deriva del
//! grupo completo bajo el lock de la raíz.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::domain::entities::{Transaction, TransactionType};
use crate::domain::error::PaymentError;
use crate::domain::gateways::{CardGateway, GatewayTranGroup, ServerPostRequest};
use crate::domain::group::GroupState;
use crate::domain::repository::TransactionRepository;
use crate::infrastructure::credentials::CredentialResolver;
use crate::use_cases::finalize_with_gateway;

#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub transaction_id: Uuid,
    pub parent_transaction_id: Uuid,
    pub merchant_id: Uuid,
    pub amount_cents: i64,
}

pub struct RefundPaymentUseCase {
    transactions: Arc<dyn TransactionRepository>,
    credentials: Arc<CredentialResolver>,
    gateway: Arc<dyn CardGateway>,
}

impl RefundPaymentUseCase {
    pub fn new(
        transactions: Arc<dyn TransactionRepository>,
        credentials: Arc<CredentialResolver>,
        gateway: Arc<dyn CardGateway>,
    ) -> Self {
        Self {
            transactions,
            credentials,
            gateway,
        }
    }

    pub async fn execute(
        &self,
        request: RefundRequest,
        cancel: &CancellationToken,
    ) -> Result<Transaction, PaymentError> {
        let parent = self
            .transactions
            .find_by_id(request.parent_transaction_id)
            .await?
            .ok_or(PaymentError::NotFound(request.parent_transaction_id))?;
        if parent.merchant_id != request.merchant_id {
            return Err(PaymentError::Unauthorized(
                "transaction belongs to another merchant".to_string(),
            ));
        }

        let resolved = self.credentials.get(request.merchant_id).await?;

        let mut op = self
            .transactions
            .begin_group_operation(parent.root_transaction_id)
            .await?;

        if let Some(existing) = op.find_existing(request.transaction_id).await? {
            op.commit().await?;
            return Ok(existing);
        }

        let group = op.load_group().await?;
        let state = GroupState::derive(&group)?;
        state.check_refund(request.amount_cents)?;

        let parent = group
            .into_iter()
            .find(|t| t.id == request.parent_transaction_id)
            .ok_or(PaymentError::NotFound(request.parent_transaction_id))?;
        let parent_ref = parent.reuse_token.clone().ok_or_else(|| {
            PaymentError::InvalidState(format!(
                "transaction {} has no gateway reference",
                parent.id
            ))
        })?;

        let child = Transaction::new_child(
            request.transaction_id,
            &parent,
            TransactionType::REFUND,
            request.amount_cents,
        )?;
        op.insert_pending(&child).await?;

        let gateway_request = ServerPostRequest {
            transaction_id: request.transaction_id,
            tran_group: GatewayTranGroup::Refund,
            amount_cents: request.amount_cents,
            currency: child.currency.clone(),
            reuse_token: None,
            parent_gateway_ref: Some(parent_ref),
        };

        let committed = finalize_with_gateway(
            op,
            self.gateway.as_ref(),
            &resolved.credentials,
            &gateway_request,
            cancel,
        )
        .await?;

        info!(
            transaction_id = %committed.id,
            parent = %request.parent_transaction_id,
            status = ?committed.status,
            "refund processed"
        );
        Ok(committed)
    }
}
