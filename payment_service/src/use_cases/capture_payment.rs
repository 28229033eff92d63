//! Captura (total o parcial) de una autorización aprobada.
//!
//! El tope acumulado (capturado + nuevo ≤ autorizado) se re-deriva del grupo
//! bajo el lock de la raíz; capturas parciales múltiples están permitidas y
//! este chequeo es la única guarda.

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
pub struct CaptureRequest {
    /// Clave de idempotencia de ESTA captura, elegida por el iniciador.
    pub transaction_id: Uuid,
    pub parent_transaction_id: Uuid,
    pub merchant_id: Uuid,
    pub amount_cents: i64,
}

pub struct CapturePaymentUseCase {
    transactions: Arc<dyn TransactionRepository>,
    credentials: Arc<CredentialResolver>,
    gateway: Arc<dyn CardGateway>,
}

impl CapturePaymentUseCase {
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
        request: CaptureRequest,
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

        // Estado del grupo re-derivado bajo el lock
        let group = op.load_group().await?;
        let state = GroupState::derive(&group)?;
        state.check_capture(request.amount_cents)?;

        // El padre confirmado, releído dentro del lock
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
            TransactionType::CAPTURE,
            request.amount_cents,
        )?;
        op.insert_pending(&child).await?;

        let gateway_request = ServerPostRequest {
            transaction_id: request.transaction_id,
            tran_group: GatewayTranGroup::Capture,
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
            "capture processed"
        );
        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{TransactionStatus, TransactionType};
    use crate::domain::gateways::{
        GatewayCredentials, GatewayResponse, KeyExchangeRequest, PrenoteOutcome, TacGrant,
    };
    use crate::use_cases::testing::{resolver_for, sample_merchant, MemoryTransactionStore};
    use async_trait::async_trait;
    use mockall::mock;

    mock! {
        pub CardGatewayImpl {}

        #[async_trait]
        impl CardGateway for CardGatewayImpl {
            async fn key_exchange(
                &self,
                credentials: &GatewayCredentials,
                request: &KeyExchangeRequest,
                cancel: &CancellationToken,
            ) -> Result<TacGrant, PaymentError>;
            async fn server_post(
                &self,
                credentials: &GatewayCredentials,
                request: &ServerPostRequest,
                cancel: &CancellationToken,
            ) -> Result<GatewayResponse, PaymentError>;
            async fn prenote_status(
                &self,
                credentials: &GatewayCredentials,
                reuse_token: &str,
                cancel: &CancellationToken,
            ) -> Result<PrenoteOutcome, PaymentError>;
        }
    }

    fn approved() -> GatewayResponse {
        GatewayResponse {
            approved: true,
            response_code: "00".into(),
            response_text: None,
            authorization_code: Some("654321".into()),
            gateway_ref: Some("GUID-CAP".into()),
            card_brand: None,
            masked_account: None,
        }
    }

    fn approved_authorize(merchant_id: Uuid, amount: i64) -> Transaction {
        let mut tx = Transaction::new_root(
            Uuid::new_v4(),
            merchant_id,
            TransactionType::AUTHORIZE,
            amount,
            "USD",
        )
        .unwrap();
        tx.status = TransactionStatus::APPROVED;
        tx.reuse_token = Some("GUID-AUTH".into());
        tx
    }

    #[tokio::test]
    async fn partial_capture_within_the_authorized_amount_is_approved() {
        let merchant = sample_merchant();
        let auth = approved_authorize(merchant.id, 10_000);
        let store = MemoryTransactionStore::with_rows(vec![auth.clone()]);

        let mut gateway = MockCardGatewayImpl::new();
        gateway.expect_server_post().times(1).returning(move |_, req, _| {
            assert_eq!(req.parent_gateway_ref.as_deref(), Some("GUID-AUTH"));
            Ok(approved())
        });

        let use_case = CapturePaymentUseCase::new(
            Arc::new(store.clone()),
            resolver_for(merchant.clone()),
            Arc::new(gateway),
        );
        let cancel = CancellationToken::new();
        let capture = use_case
            .execute(
                CaptureRequest {
                    transaction_id: Uuid::new_v4(),
                    parent_transaction_id: auth.id,
                    merchant_id: merchant.id,
                    amount_cents: 7_500,
                },
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(capture.status, TransactionStatus::APPROVED);
        assert_eq!(capture.root_transaction_id, auth.id);
        assert_eq!(store.row_count(), 2);
    }

    #[tokio::test]
    async fn capture_over_the_remaining_amount_is_rejected_locally() {
        let merchant = sample_merchant();
        let auth = approved_authorize(merchant.id, 10_000);
        let mut prior = Transaction::new_child(
            Uuid::new_v4(),
            &auth,
            TransactionType::CAPTURE,
            6_000,
        )
        .unwrap();
        prior.status = TransactionStatus::APPROVED;
        let store = MemoryTransactionStore::with_rows(vec![auth.clone(), prior]);

        let mut gateway = MockCardGatewayImpl::new();
        gateway.expect_server_post().never();

        let use_case = CapturePaymentUseCase::new(
            Arc::new(store.clone()),
            resolver_for(merchant.clone()),
            Arc::new(gateway),
        );
        let cancel = CancellationToken::new();
        let err = use_case
            .execute(
                CaptureRequest {
                    transaction_id: Uuid::new_v4(),
                    parent_transaction_id: auth.id,
                    merchant_id: merchant.id,
                    amount_cents: 4_001,
                },
                &cancel,
            )
            .await
            .unwrap_err();

        assert_eq!(
            err,
            PaymentError::AmountExceedsAvailable {
                requested: 4_001,
                available: 4_000
            }
        );
        assert_eq!(store.row_count(), 2);
    }

    #[tokio::test]
    async fn unknown_parent_is_not_found() {
        let merchant = sample_merchant();
        let store = MemoryTransactionStore::new();
        let mut gateway = MockCardGatewayImpl::new();
        gateway.expect_server_post().never();

        let use_case = CapturePaymentUseCase::new(
            Arc::new(store),
            resolver_for(merchant.clone()),
            Arc::new(gateway),
        );
        let cancel = CancellationToken::new();
        let missing = Uuid::new_v4();
        let err = use_case
            .execute(
                CaptureRequest {
                    transaction_id: Uuid::new_v4(),
                    parent_transaction_id: missing,
                    merchant_id: merchant.id,
                    amount_cents: 100,
                },
                &cancel,
            )
            .await
            .unwrap_err();

        assert_eq!(err, PaymentError::NotFound(missing));
    }

    #[tokio::test]
    async fn replayed_capture_id_returns_the_committed_row() {
        let merchant = sample_merchant();
        let auth = approved_authorize(merchant.id, 10_000);
        let store = MemoryTransactionStore::with_rows(vec![auth.clone()]);

        let mut gateway = MockCardGatewayImpl::new();
        gateway
            .expect_server_post()
            .times(1)
            .returning(|_, _, _| Ok(approved()));

        let use_case = CapturePaymentUseCase::new(
            Arc::new(store.clone()),
            resolver_for(merchant.clone()),
            Arc::new(gateway),
        );
        let cancel = CancellationToken::new();
        let request = CaptureRequest {
            transaction_id: Uuid::new_v4(),
            parent_transaction_id: auth.id,
            merchant_id: merchant.id,
            amount_cents: 5_000,
        };

        let first = use_case.execute(request.clone(), &cancel).await.unwrap();
        let second = use_case.execute(request, &cancel).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.authorization_code, second.authorization_code);
        assert_eq!(store.row_count(), 2);
    }
}
