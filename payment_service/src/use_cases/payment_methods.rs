//! Consulta y baja de métodos de pago guardados.
//! El alta ocurre por el flujo Browser Post con TRAN_GROUP=STORAGE.

use std::sync::Arc;
use uuid::Uuid;

use crate::domain::entities::PaymentMethod;
use crate::domain::error::PaymentError;
use crate::domain::repository::PaymentMethodRepository;

pub struct PaymentMethodsUseCase {
    payment_methods: Arc<dyn PaymentMethodRepository>,
}

impl PaymentMethodsUseCase {
    pub fn new(payment_methods: Arc<dyn PaymentMethodRepository>) -> Self {
        Self { payment_methods }
    }

    pub async fn get(
        &self,
        id: Uuid,
        merchant_id: Uuid,
    ) -> Result<PaymentMethod, PaymentError> {
        let method = self
            .payment_methods
            .find_by_id(id)
            .await?
            .filter(|m| m.merchant_id == merchant_id)
            .ok_or(PaymentError::NotFound(id))?;
        Ok(method)
    }

    pub async fn list(&self, merchant_id: Uuid) -> Result<Vec<PaymentMethod>, PaymentError> {
        self.payment_methods.find_by_merchant(merchant_id).await
    }

    /// Baja lógica: el método deja de ser utilizable pero las transacciones
    /// históricas lo siguen referenciando.
    pub async fn deactivate(&self, id: Uuid, merchant_id: Uuid) -> Result<(), PaymentError> {
        self.payment_methods.deactivate(id, merchant_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::VerificationStatus;
    use crate::use_cases::testing::card_method;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use mockall::mock;

    mock! {
        pub PaymentMethodRepositoryImpl {}

        #[async_trait]
        impl PaymentMethodRepository for PaymentMethodRepositoryImpl {
            async fn save(&self, method: PaymentMethod) -> Result<PaymentMethod, PaymentError>;
            async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentMethod>, PaymentError>;
            async fn find_by_merchant(&self, merchant_id: Uuid) -> Result<Vec<PaymentMethod>, PaymentError>;
            async fn deactivate(&self, id: Uuid, merchant_id: Uuid) -> Result<(), PaymentError>;
            async fn find_pending_ach_older_than(
                &self,
                cutoff: DateTime<Utc>,
                limit: i64,
            ) -> Result<Vec<PaymentMethod>, PaymentError>;
            async fn set_verification(
                &self,
                id: Uuid,
                status: VerificationStatus,
                failure_code: Option<String>,
            ) -> Result<PaymentMethod, PaymentError>;
        }
    }

    #[tokio::test]
    async fn get_hides_methods_of_other_merchants() {
        let foreign = card_method(Uuid::new_v4());
        let foreign_id = foreign.id;
        let mut repo = MockPaymentMethodRepositoryImpl::new();
        repo.expect_find_by_id()
            .returning(move |_| Ok(Some(foreign.clone())));

        let use_case = PaymentMethodsUseCase::new(Arc::new(repo));
        let err = use_case.get(foreign_id, Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err, PaymentError::NotFound(foreign_id));
    }
}
