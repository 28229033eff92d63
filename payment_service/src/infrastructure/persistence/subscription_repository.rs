use crate::domain::entities::Subscription;
use crate::domain::error::PaymentError;
use crate::domain::repository::SubscriptionRepository;
use crate::infrastructure::persistence::models::SubscriptionModel;
use crate::infrastructure::persistence::{with_deadline, QueryTier};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

pub struct PostgresSubscriptionRepository {
    pool: PgPool,
}

impl PostgresSubscriptionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionRepository for PostgresSubscriptionRepository {
    async fn save(&self, subscription: Subscription) -> Result<Subscription, PaymentError> {
        let model = with_deadline(
            QueryTier::Simple,
            sqlx::query_as::<_, SubscriptionModel>(
                r#"
                INSERT INTO subscriptions (
                    id, merchant_id, customer_id, payment_method_id, amount_cents, currency,
                    cadence_count, cadence_unit, next_billing_at, status, last_attempt_at,
                    consecutive_failures, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                RETURNING *
                "#,
            )
            .bind(subscription.id)
            .bind(subscription.merchant_id)
            .bind(subscription.customer_id)
            .bind(subscription.payment_method_id)
            .bind(subscription.amount_cents)
            .bind(&subscription.currency)
            .bind(subscription.cadence_count)
            .bind(subscription.cadence_unit)
            .bind(subscription.next_billing_at)
            .bind(subscription.status)
            .bind(subscription.last_attempt_at)
            .bind(subscription.consecutive_failures)
            .bind(subscription.created_at)
            .bind(subscription.updated_at)
            .fetch_one(&self.pool),
        )
        .await?;

        Ok(model.into())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Subscription>, PaymentError> {
        let model = with_deadline(
            QueryTier::Simple,
            sqlx::query_as::<_, SubscriptionModel>(r#"SELECT * FROM subscriptions WHERE id = $1"#)
                .bind(id)
                .fetch_optional(&self.pool),
        )
        .await?;

        Ok(model.map(Into::into))
    }

    async fn list_by_merchant(
        &self,
        merchant_id: Uuid,
    ) -> Result<Vec<Subscription>, PaymentError> {
        let models = with_deadline(
            QueryTier::Complex,
            sqlx::query_as::<_, SubscriptionModel>(
                r#"
                SELECT * FROM subscriptions
                WHERE merchant_id = $1
                ORDER BY created_at DESC
                "#,
            )
            .bind(merchant_id)
            .fetch_all(&self.pool),
        )
        .await?;

        Ok(models.into_iter().map(Into::into).collect())
    }

    async fn update(&self, subscription: Subscription) -> Result<Subscription, PaymentError> {
        let model = with_deadline(
            QueryTier::Simple,
            sqlx::query_as::<_, SubscriptionModel>(
                r#"
                UPDATE subscriptions
                SET payment_method_id = $2,
                    amount_cents = $3,
                    next_billing_at = $4,
                    status = $5,
                    last_attempt_at = $6,
                    consecutive_failures = $7,
                    updated_at = $8
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(subscription.id)
            .bind(subscription.payment_method_id)
            .bind(subscription.amount_cents)
            .bind(subscription.next_billing_at)
            .bind(subscription.status)
            .bind(subscription.last_attempt_at)
            .bind(subscription.consecutive_failures)
            .bind(Utc::now())
            .fetch_optional(&self.pool),
        )
        .await?;

        match model {
            Some(m) => Ok(m.into()),
            None => Err(PaymentError::NotFound(subscription.id)),
        }
    }

    /// Reclama suscripciones vencidas con FOR UPDATE SKIP LOCKED y estampa
    /// `last_attempt_at` en la misma sentencia, de modo que dos réplicas del
    /// sweep nunca procesen la misma fila.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Subscription>, PaymentError> {
        let models = with_deadline(
            QueryTier::Complex,
            sqlx::query_as::<_, SubscriptionModel>(
                r#"
                UPDATE subscriptions
                SET last_attempt_at = $1, updated_at = $1
                WHERE id IN (
                    SELECT id FROM subscriptions
                    WHERE status = 'ACTIVE' AND next_billing_at <= $1
                    ORDER BY next_billing_at ASC
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING *
                "#,
            )
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool),
        )
        .await?;

        Ok(models.into_iter().map(Into::into).collect())
    }
}
