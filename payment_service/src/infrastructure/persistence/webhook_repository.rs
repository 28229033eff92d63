//! Persistencia de webhooks: suscripciones, outbox de eventos y entregas.

use crate::domain::entities::{WebhookDelivery, WebhookEvent, WebhookSubscription};
use crate::domain::error::PaymentError;
use crate::domain::repository::WebhookRepository;
use crate::infrastructure::persistence::models::{WebhookDeliveryModel, WebhookSubscriptionModel};
use crate::infrastructure::persistence::{with_deadline, QueryTier};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// Lease sobre una entrega reclamada: otras réplicas del sweep la saltean
/// hasta que el intento en curso registre su resultado.
const CLAIM_LEASE_MINUTES: i64 = 5;

pub struct PostgresWebhookRepository {
    pool: PgPool,
}

impl PostgresWebhookRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookRepository for PostgresWebhookRepository {
    async fn save_subscription(
        &self,
        subscription: WebhookSubscription,
    ) -> Result<WebhookSubscription, PaymentError> {
        let model = with_deadline(
            QueryTier::Simple,
            sqlx::query_as::<_, WebhookSubscriptionModel>(
                r#"
                INSERT INTO webhook_subscriptions (
                    id, merchant_id, url, signing_key, event_types, active, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING *
                "#,
            )
            .bind(subscription.id)
            .bind(subscription.merchant_id)
            .bind(&subscription.url)
            .bind(&subscription.signing_key)
            .bind(&subscription.event_types)
            .bind(subscription.active)
            .bind(subscription.created_at)
            .bind(subscription.updated_at)
            .fetch_one(&self.pool),
        )
        .await?;

        Ok(model.into())
    }

    async fn find_subscription(
        &self,
        id: Uuid,
    ) -> Result<Option<WebhookSubscription>, PaymentError> {
        let model = with_deadline(
            QueryTier::Simple,
            sqlx::query_as::<_, WebhookSubscriptionModel>(
                r#"SELECT * FROM webhook_subscriptions WHERE id = $1"#,
            )
            .bind(id)
            .fetch_optional(&self.pool),
        )
        .await?;

        Ok(model.map(Into::into))
    }

    async fn list_subscriptions(
        &self,
        merchant_id: Uuid,
    ) -> Result<Vec<WebhookSubscription>, PaymentError> {
        let models = with_deadline(
            QueryTier::Complex,
            sqlx::query_as::<_, WebhookSubscriptionModel>(
                r#"
                SELECT * FROM webhook_subscriptions
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

    async fn update_subscription(
        &self,
        subscription: WebhookSubscription,
    ) -> Result<WebhookSubscription, PaymentError> {
        let model = with_deadline(
            QueryTier::Simple,
            sqlx::query_as::<_, WebhookSubscriptionModel>(
                r#"
                UPDATE webhook_subscriptions
                SET url = $2, signing_key = $3, event_types = $4, active = $5, updated_at = $6
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(subscription.id)
            .bind(&subscription.url)
            .bind(&subscription.signing_key)
            .bind(&subscription.event_types)
            .bind(subscription.active)
            .bind(Utc::now())
            .fetch_optional(&self.pool),
        )
        .await?;

        match model {
            Some(m) => Ok(m.into()),
            None => Err(PaymentError::NotFound(subscription.id)),
        }
    }

    async fn delete_subscription(&self, id: Uuid, merchant_id: Uuid) -> Result<(), PaymentError> {
        let result = with_deadline(
            QueryTier::Simple,
            sqlx::query(
                r#"DELETE FROM webhook_subscriptions WHERE id = $1 AND merchant_id = $2"#,
            )
            .bind(id)
            .bind(merchant_id)
            .execute(&self.pool),
        )
        .await?;

        if result.rows_affected() == 0 {
            return Err(PaymentError::NotFound(id));
        }
        Ok(())
    }

    async fn insert_event(&self, event: &WebhookEvent) -> Result<(), PaymentError> {
        with_deadline(
            QueryTier::Simple,
            sqlx::query(
                r#"
                INSERT INTO webhook_events (id, event_type, merchant_id, payload, created_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(event.id)
            .bind(&event.event_type)
            .bind(event.merchant_id)
            .bind(&event.data)
            .bind(event.created_at)
            .execute(&self.pool),
        )
        .await?;

        Ok(())
    }

    /// Abanico outbox → entregas: una fila de entrega por suscripción activa
    /// cuyo filtro acepta el tipo de evento; el evento queda marcado como
    /// despachado en la misma sentencia.
    async fn dispatch_pending_events(&self, limit: i64) -> Result<u64, PaymentError> {
        let result = with_deadline(
            QueryTier::Complex,
            sqlx::query(
                r#"
                WITH pending AS (
                    SELECT id, event_type, merchant_id, payload, created_at
                    FROM webhook_events
                    WHERE dispatched_at IS NULL
                    ORDER BY created_at ASC
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED
                ),
                fanned_out AS (
                    INSERT INTO webhook_deliveries (
                        id, subscription_id, event_id, event_type, payload,
                        status, attempts, next_attempt_at, created_at, updated_at
                    )
                    SELECT gen_random_uuid(), s.id, p.id, p.event_type, p.payload,
                           'PENDING', 0, now(), now(), now()
                    FROM pending p
                    JOIN webhook_subscriptions s
                      ON s.merchant_id = p.merchant_id
                     AND s.active
                    WHERE cardinality(s.event_types) = 0
                       OR p.event_type = ANY(s.event_types)
                )
                UPDATE webhook_events
                SET dispatched_at = now()
                WHERE id IN (SELECT id FROM pending)
                "#,
            )
            .bind(limit)
            .execute(&self.pool),
        )
        .await?;

        Ok(result.rows_affected())
    }

    async fn claim_due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WebhookDelivery>, PaymentError> {
        let lease_until = now + Duration::minutes(CLAIM_LEASE_MINUTES);
        let models = with_deadline(
            QueryTier::Complex,
            sqlx::query_as::<_, WebhookDeliveryModel>(
                r#"
                UPDATE webhook_deliveries
                SET next_attempt_at = $2, updated_at = $1
                WHERE id IN (
                    SELECT id FROM webhook_deliveries
                    WHERE status IN ('PENDING', 'FAILED') AND next_attempt_at <= $1
                    ORDER BY next_attempt_at ASC
                    LIMIT $3
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING *
                "#,
            )
            .bind(now)
            .bind(lease_until)
            .bind(limit)
            .fetch_all(&self.pool),
        )
        .await?;

        Ok(models.into_iter().map(Into::into).collect())
    }

    async fn record_delivery_attempt(
        &self,
        delivery: &WebhookDelivery,
    ) -> Result<(), PaymentError> {
        with_deadline(
            QueryTier::Simple,
            sqlx::query(
                r#"
                UPDATE webhook_deliveries
                SET status = $2,
                    attempts = $3,
                    next_attempt_at = $4,
                    last_response_status = $5,
                    last_error = $6,
                    updated_at = $7
                WHERE id = $1
                "#,
            )
            .bind(delivery.id)
            .bind(delivery.status)
            .bind(delivery.attempts)
            .bind(delivery.next_attempt_at)
            .bind(delivery.last_response_status)
            .bind(&delivery.last_error)
            .bind(Utc::now())
            .execute(&self.pool),
        )
        .await?;

        Ok(())
    }

    async fn count_pending_deliveries(&self) -> Result<i64, PaymentError> {
        let count: (i64,) = with_deadline(
            QueryTier::Simple,
            sqlx::query_as(
                r#"SELECT COUNT(*) FROM webhook_deliveries WHERE status IN ('PENDING', 'FAILED')"#,
            )
            .fetch_one(&self.pool),
        )
        .await?;

        Ok(count.0)
    }
}
