//! Anulación de una autorización aprobada sin capturas.

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
pub struct VoidRequest {
    pub transaction_id: Uuid,
    pub parent_transaction_id: Uuid,
    pub merchant_id: Uuid,
}

pub struct VoidPaymentUseCase {
    transactions: Arc<dyn TransactionRepository>,
    credentials: Arc<CredentialResolver>,
    gateway: Arc<dyn CardGateway>,
}

impl VoidPaymentUseCase {
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
        request: VoidRequest,
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
        state.check_void()?;

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

        let child =
            Transaction::new_child(request.transaction_id, &parent, TransactionType::VOID, 0)?;
        op.insert_pending(&child).await?;

        let gateway_request = ServerPostRequest {
            transaction_id: request.transaction_id,
            tran_group: GatewayTranGroup::Void,
            amount_cents: 0,
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
            "void processed"
        );
        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::TransactionStatus;
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
    async fn void_of_an_uncaptured_authorize_is_approved() {
        let merchant = sample_merchant();
        let auth = approved_authorize(merchant.id, 10_000);
        let store = MemoryTransactionStore::with_rows(vec![auth.clone()]);

        let mut gateway = MockCardGatewayImpl::new();
        gateway.expect_server_post().times(1).returning(|_, _, _| {
            Ok(GatewayResponse {
                approved: true,
                response_code: "00".into(),
                response_text: None,
                authorization_code: None,
                gateway_ref: Some("GUID-VOID".into()),
                card_brand: None,
                masked_account: None,
            })
        });

        let use_case = VoidPaymentUseCase::new(
            Arc::new(store.clone()),
            resolver_for(merchant.clone()),
            Arc::new(gateway),
        );
        let cancel = CancellationToken::new();
        let void = use_case
            .execute(
                VoidRequest {
                    transaction_id: Uuid::new_v4(),
                    parent_transaction_id: auth.id,
                    merchant_id: merchant.id,
                },
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(void.status, TransactionStatus::APPROVED);
        assert_eq!(void.tran_type, TransactionType::VOID);
    }

    #[tokio::test]
    async fn void_after_a_capture_is_invalid() {
        let merchant = sample_merchant();
        let auth = approved_authorize(merchant.id, 10_000);
        let mut capture =
            Transaction::new_child(Uuid::new_v4(), &auth, TransactionType::CAPTURE, 5_000)
                .unwrap();
        capture.status = TransactionStatus::APPROVED;
        let store = MemoryTransactionStore::with_rows(vec![auth.clone(), capture]);

        let mut gateway = MockCardGatewayImpl::new();
        gateway.expect_server_post().never();

        let use_case = VoidPaymentUseCase::new(
            Arc::new(store),
            resolver_for(merchant.clone()),
            Arc::new(gateway),
        );
        let cancel = CancellationToken::new();
        let err = use_case
            .execute(
                VoidRequest {
                    transaction_id: Uuid::new_v4(),
                    parent_transaction_id: auth.id,
                    merchant_id: merchant.id,
                },
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, PaymentError::InvalidState(_)));
    }
}
