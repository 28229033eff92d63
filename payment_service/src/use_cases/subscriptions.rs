//! Administración de suscripciones de cobro recurrente.
//! El cobro en sí lo ejecuta el sweep de facturación (`jobs::subscription_billing`).

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::domain::entities::{BillingUnit, Subscription, SubscriptionStatus};
use crate::domain::error::PaymentError;
use crate::domain::repository::{PaymentMethodRepository, SubscriptionRepository};

#[derive(Debug, Clone)]
pub struct CreateSubscriptionRequest {
    pub merchant_id: Uuid,
    pub customer_id: Uuid,
    pub payment_method_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub cadence_count: i32,
    pub cadence_unit: BillingUnit,
    pub first_billing_at: DateTime<Utc>,
}

pub struct ManageSubscriptionsUseCase {
    subscriptions: Arc<dyn SubscriptionRepository>,
    payment_methods: Arc<dyn PaymentMethodRepository>,
}

impl ManageSubscriptionsUseCase {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionRepository>,
        payment_methods: Arc<dyn PaymentMethodRepository>,
    ) -> Self {
        Self {
            subscriptions,
            payment_methods,
        }
    }

    pub async fn create(
        &self,
        request: CreateSubscriptionRequest,
    ) -> Result<Subscription, PaymentError> {
        // El método debe ser utilizable YA: un ACH pendiente de pre-note no
        // puede respaldar una suscripción
        let method = self
            .payment_methods
            .find_by_id(request.payment_method_id)
            .await?
            .ok_or(PaymentError::NotFound(request.payment_method_id))?;
        if method.merchant_id != request.merchant_id {
            return Err(PaymentError::Unauthorized(
                "payment method belongs to another merchant".to_string(),
            ));
        }
        method.ensure_usable()?;

        let subscription = Subscription::new(
            request.merchant_id,
            request.customer_id,
            request.payment_method_id,
            request.amount_cents,
            &request.currency,
            request.cadence_count,
            request.cadence_unit,
            request.first_billing_at,
        )?;

        let saved = self.subscriptions.save(subscription).await?;
        info!(subscription_id = %saved.id, "subscription created");
        Ok(saved)
    }

    pub async fn get(&self, id: Uuid, merchant_id: Uuid) -> Result<Subscription, PaymentError> {
        self.subscriptions
            .find_by_id(id)
            .await?
            .filter(|s| s.merchant_id == merchant_id)
            .ok_or(PaymentError::NotFound(id))
    }

    pub async fn list(&self, merchant_id: Uuid) -> Result<Vec<Subscription>, PaymentError> {
        self.subscriptions.list_by_merchant(merchant_id).await
    }

    pub async fn cancel(&self, id: Uuid, merchant_id: Uuid) -> Result<Subscription, PaymentError> {
        let mut subscription = self.get(id, merchant_id).await?;
        if subscription.status == SubscriptionStatus::CANCELED {
            return Ok(subscription);
        }
        subscription.status = SubscriptionStatus::CANCELED;
        let updated = self.subscriptions.update(subscription).await?;
        info!(subscription_id = %id, "subscription canceled");
        Ok(updated)
    }

    /// Reactivación manual de una suscripción en mora.
    pub async fn reactivate(
        &self,
        id: Uuid,
        merchant_id: Uuid,
    ) -> Result<Subscription, PaymentError> {
        let mut subscription = self.get(id, merchant_id).await?;
        if subscription.status != SubscriptionStatus::PAST_DUE {
            return Err(PaymentError::InvalidState(format!(
                "subscription {} is {:?}, only PAST_DUE can be reactivated",
                id, subscription.status
            )));
        }
        subscription.status = SubscriptionStatus::ACTIVE;
        subscription.consecutive_failures = 0;
        self.subscriptions.update(subscription).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{PaymentMethod, VerificationStatus};
    use crate::use_cases::testing::{ach_method, card_method};
    use async_trait::async_trait;
    use mockall::mock;

    mock! {
        pub SubscriptionRepositoryImpl {}

        #[async_trait]
        impl SubscriptionRepository for SubscriptionRepositoryImpl {
            async fn save(&self, subscription: Subscription) -> Result<Subscription, PaymentError>;
            async fn find_by_id(&self, id: Uuid) -> Result<Option<Subscription>, PaymentError>;
            async fn list_by_merchant(&self, merchant_id: Uuid) -> Result<Vec<Subscription>, PaymentError>;
            async fn update(&self, subscription: Subscription) -> Result<Subscription, PaymentError>;
            async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Subscription>, PaymentError>;
        }
    }

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

    fn request(merchant_id: Uuid, method_id: Uuid) -> CreateSubscriptionRequest {
        CreateSubscriptionRequest {
            merchant_id,
            customer_id: Uuid::new_v4(),
            payment_method_id: method_id,
            amount_cents: 1500,
            currency: "USD".to_string(),
            cadence_count: 1,
            cadence_unit: BillingUnit::MONTH,
            first_billing_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn create_with_usable_method_succeeds() {
        let merchant_id = Uuid::new_v4();
        let method = card_method(merchant_id);
        let method_id = method.id;

        let mut methods = MockPaymentMethodRepositoryImpl::new();
        methods
            .expect_find_by_id()
            .returning(move |_| Ok(Some(method.clone())));
        let mut subs = MockSubscriptionRepositoryImpl::new();
        subs.expect_save().times(1).returning(|s| Ok(s));

        let use_case = ManageSubscriptionsUseCase::new(Arc::new(subs), Arc::new(methods));
        let created = use_case.create(request(merchant_id, method_id)).await.unwrap();
        assert_eq!(created.status, SubscriptionStatus::ACTIVE);
        assert_eq!(created.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn create_with_pending_ach_method_is_invalid() {
        let merchant_id = Uuid::new_v4();
        let method = ach_method(merchant_id, VerificationStatus::PENDING);
        let method_id = method.id;

        let mut methods = MockPaymentMethodRepositoryImpl::new();
        methods
            .expect_find_by_id()
            .returning(move |_| Ok(Some(method.clone())));
        let mut subs = MockSubscriptionRepositoryImpl::new();
        subs.expect_save().never();

        let use_case = ManageSubscriptionsUseCase::new(Arc::new(subs), Arc::new(methods));
        let err = use_case
            .create(request(merchant_id, method_id))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::InvalidState(_)));
    }
}
